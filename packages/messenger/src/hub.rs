//! The hub: which contexts are alive and how to reach them.
//!
//! The hub stands in for the browser's runtime messaging layer. Each live
//! context owns an inbound channel registered here under its
//! [`ContextAddress`]; the hub also remembers which tab opened which
//! (for [`ContextSelector::Opener`]) and which frame registered which nonce
//! (for [`ContextSelector::FrameNonce`]).
//!
//! The hub only routes. Correlating replies, timeouts and liveness handling
//! belong to each context's [`Endpoint`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::config::MessengerConfig;
use crate::context::{ContextAddress, TabId};
use crate::envelope::{ContextSelector, Packet};
use crate::error::{MessengerError, Result};
use crate::registry::MethodRegistry;
use crate::transport::Endpoint;

/// Sending half of a context's inbound channel.
pub(crate) type Inbox = mpsc::UnboundedSender<Packet>;

#[derive(Default)]
struct HubState {
    contexts: BTreeMap<ContextAddress, Inbox>,
    openers: BTreeMap<TabId, TabId>,
    nonces: BTreeMap<String, ContextAddress>,
}

/// Registry of live contexts shared by every endpoint.
///
/// # Example
///
/// ```ignore
/// let hub = Hub::new();
///
/// let mut methods = MethodRegistry::new();
/// methods.register_fn("ADD", |(a, b): (i64, i64), _| async move { Ok(a + b) })?;
/// let background = hub.connect(ContextAddress::Background, methods)?;
///
/// let tab = hub.connect(ContextAddress::tab(1), MethodRegistry::new())?;
/// let sum = tab.call_background("ADD", vec![json!(1), json!(2)]).await?;
/// ```
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring a context online with the default configuration.
    ///
    /// Must be called from within a tokio runtime: the endpoint's receive
    /// loop is spawned immediately.
    pub fn connect(&self, address: ContextAddress, registry: MethodRegistry) -> Result<Endpoint> {
        self.connect_with_config(address, registry, MessengerConfig::default())
    }

    /// Bring a context online.
    ///
    /// The registry is frozen from here on; register every method before
    /// connecting.
    pub fn connect_with_config(
        &self,
        address: ContextAddress,
        mut registry: MethodRegistry,
        config: MessengerConfig,
    ) -> Result<Endpoint> {
        registry.ensure_builtins();

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            if state.contexts.contains_key(&address) {
                return Err(MessengerError::AddressInUse(address));
            }
            state.contexts.insert(address.clone(), tx);
        }

        tracing::debug!(context = %address, methods = registry.len(), "context connected");
        Ok(Endpoint::start(
            self.clone(),
            address,
            Arc::new(registry),
            config,
            rx,
        ))
    }

    /// Tear a context down.
    ///
    /// Every other endpoint is told, so calls still waiting on this context
    /// fail with a connection error. Returns `false` if nothing was
    /// connected at `address`.
    pub fn disconnect(&self, address: &ContextAddress) -> bool {
        let (inbox, others) = {
            let mut state = self.state();
            let Some(inbox) = state.contexts.remove(address) else {
                return false;
            };
            state.nonces.retain(|_, owner| owner != address);
            let others: Vec<Inbox> = state.contexts.values().cloned().collect();
            (inbox, others)
        };

        let _ = inbox.send(Packet::Close);
        for other in others {
            let _ = other.send(Packet::Disconnected(address.clone()));
        }

        tracing::debug!(context = %address, "context disconnected");
        true
    }

    /// Record that `opener` opened `tab_id`.
    pub fn set_opener(&self, tab_id: TabId, opener: TabId) {
        self.state().openers.insert(tab_id, opener);
    }

    /// Let calls reach `address` through a frame nonce.
    pub fn register_frame_nonce(&self, nonce: impl Into<String>, address: ContextAddress) {
        self.state().nonces.insert(nonce.into(), address);
    }

    pub fn is_connected(&self, address: &ContextAddress) -> bool {
        self.state().contexts.contains_key(address)
    }

    /// Addresses of all live contexts.
    pub fn contexts(&self) -> Vec<ContextAddress> {
        self.state().contexts.keys().cloned().collect()
    }

    pub(crate) fn inbox(&self, address: &ContextAddress) -> Option<Inbox> {
        self.state().contexts.get(address).cloned()
    }

    /// Turn a selector into the live addresses it names, as seen from
    /// `sender`.
    ///
    /// Broadcast may legitimately resolve to nothing; every other selector
    /// must name exactly one live context.
    pub(crate) fn resolve(
        &self,
        sender: &ContextAddress,
        method: &str,
        selector: &ContextSelector,
    ) -> Result<Vec<ContextAddress>> {
        let state = self.state();
        let no_receiver = || MessengerError::NoReceiver {
            method: method.to_string(),
            target: selector.to_string(),
        };

        let address = match selector {
            ContextSelector::Broadcast => {
                return Ok(state
                    .contexts
                    .keys()
                    .filter(|address| address.is_top_frame() && *address != sender)
                    .cloned()
                    .collect());
            }
            ContextSelector::Background => ContextAddress::Background,
            ContextSelector::Tab { tab_id, frame_id } => ContextAddress::frame(*tab_id, *frame_id),
            ContextSelector::Opener => {
                let tab_id = sender.tab_id().ok_or_else(no_receiver)?;
                let opener = state.openers.get(&tab_id).ok_or_else(no_receiver)?;
                ContextAddress::tab(*opener)
            }
            ContextSelector::FrameNonce { nonce } => {
                state.nonces.get(nonce).cloned().ok_or_else(no_receiver)?
            }
        };

        if state.contexts.contains_key(&address) {
            Ok(vec![address])
        } else {
            Err(no_receiver())
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("contexts", &self.contexts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> ContextAddress {
        ContextAddress::tab(1)
    }

    #[tokio::test]
    async fn connect_and_disconnect() {
        let hub = Hub::new();
        let _endpoint = hub.connect(ContextAddress::Background, MethodRegistry::new()).unwrap();
        assert!(hub.is_connected(&ContextAddress::Background));

        assert!(hub.disconnect(&ContextAddress::Background));
        assert!(!hub.is_connected(&ContextAddress::Background));
        assert!(!hub.disconnect(&ContextAddress::Background));
    }

    #[tokio::test]
    async fn address_in_use() {
        let hub = Hub::new();
        let _first = hub.connect(ContextAddress::tab(1), MethodRegistry::new()).unwrap();
        let err = hub
            .connect(ContextAddress::tab(1), MethodRegistry::new())
            .unwrap_err();
        assert!(matches!(err, MessengerError::AddressInUse(_)));
    }

    #[tokio::test]
    async fn resolve_background_requires_live_context() {
        let hub = Hub::new();
        let err = hub
            .resolve(&sender(), "X", &ContextSelector::Background)
            .unwrap_err();
        assert!(matches!(err, MessengerError::NoReceiver { .. }));

        let _bg = hub.connect(ContextAddress::Background, MethodRegistry::new()).unwrap();
        assert_eq!(
            hub.resolve(&sender(), "X", &ContextSelector::Background).unwrap(),
            vec![ContextAddress::Background]
        );
    }

    #[tokio::test]
    async fn resolve_broadcast_skips_sender_and_subframes() {
        let hub = Hub::new();
        let _a = hub.connect(ContextAddress::tab(1), MethodRegistry::new()).unwrap();
        let _b = hub.connect(ContextAddress::tab(2), MethodRegistry::new()).unwrap();
        let _c = hub.connect(ContextAddress::frame(2, 5), MethodRegistry::new()).unwrap();
        let _bg = hub.connect(ContextAddress::Background, MethodRegistry::new()).unwrap();

        let targets = hub
            .resolve(&sender(), "X", &ContextSelector::Broadcast)
            .unwrap();
        assert_eq!(targets, vec![ContextAddress::tab(2)]);
    }

    #[tokio::test]
    async fn resolve_opener() {
        let hub = Hub::new();
        let _opener = hub.connect(ContextAddress::tab(7), MethodRegistry::new()).unwrap();

        let err = hub
            .resolve(&sender(), "X", &ContextSelector::Opener)
            .unwrap_err();
        assert!(matches!(err, MessengerError::NoReceiver { .. }));

        hub.set_opener(1, 7);
        assert_eq!(
            hub.resolve(&sender(), "X", &ContextSelector::Opener).unwrap(),
            vec![ContextAddress::tab(7)]
        );
    }

    #[tokio::test]
    async fn resolve_frame_nonce_forgets_disconnected_frames() {
        let hub = Hub::new();
        let frame = ContextAddress::frame(3, 9);
        let _frame = hub.connect(frame.clone(), MethodRegistry::new()).unwrap();
        hub.register_frame_nonce("abc", frame.clone());

        assert_eq!(
            hub.resolve(&sender(), "X", &ContextSelector::frame_nonce("abc")).unwrap(),
            vec![frame.clone()]
        );

        hub.disconnect(&frame);
        assert!(hub
            .resolve(&sender(), "X", &ContextSelector::frame_nonce("abc"))
            .is_err());
    }
}
