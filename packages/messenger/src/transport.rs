//! Per-context endpoint: sends calls, correlates replies, serves requests.
//!
//! Each connected context owns one [`Endpoint`]. A background task drains
//! the context's inbox:
//!
//! - requests are dispatched to the local [`MethodRegistry`] on their own
//!   task, and the reply goes straight back to the sender;
//! - responses settle the matching pending call, or are dropped if the call
//!   already timed out;
//! - a disconnect notice rejects every call still waiting on that context.
//!
//! Calls wait until the target replies, the target disconnects, or the
//! optional deadline passes, whichever comes first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::MessengerConfig;
use crate::context::{forbid_context, ContextAddress, ContextKind};
use crate::envelope::{CallEnvelope, ContextSelector, CorrelationId, Message, Packet, Reply};
use crate::error::{MessengerError, Result, SerializedError};
use crate::hub::{Hub, Inbox};
use crate::registry::{CallerInfo, MethodRegistry, ECHO_SENDER};

/// How one target of a broadcast settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Settled {
    Fulfilled { value: Value },
    Rejected { reason: SerializedError },
}

/// The outcome of a broadcast call for a single tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub target: ContextAddress,
    #[serde(flatten)]
    pub outcome: Settled,
}

impl BroadcastResult {
    fn new(target: ContextAddress, outcome: Result<Value>) -> Self {
        let outcome = match outcome {
            Ok(value) => Settled::Fulfilled { value },
            Err(error) => Settled::Rejected {
                reason: SerializedError::from(error),
            },
        };
        Self { target, outcome }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.outcome, Settled::Fulfilled { .. })
    }
}

struct PendingCall {
    method: String,
    target: ContextAddress,
    started: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

/// Removes a call's pending entry when the call returns or is dropped.
struct PendingGuard<'a> {
    inner: &'a EndpointInner,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.correlation_id);
    }
}

struct EndpointInner {
    address: ContextAddress,
    hub: Hub,
    registry: Arc<MethodRegistry>,
    config: MessengerConfig,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    /// Channels to other contexts, opened on first use.
    channels: Mutex<HashMap<ContextAddress, Inbox>>,
}

/// A live context's handle on the messenger.
///
/// Cheap to clone; all clones share the same pending-call table.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn start(
        hub: Hub,
        address: ContextAddress,
        registry: Arc<MethodRegistry>,
        config: MessengerConfig,
        inbox: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        let inner = Arc::new(EndpointInner {
            address,
            hub,
            registry,
            config,
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        });

        tokio::spawn(receive_loop(Arc::clone(&inner), inbox));
        Self { inner }
    }

    pub fn address(&self) -> &ContextAddress {
        &self.inner.address
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.address.kind()
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending().len()
    }

    /// Send a call using the configured call timeout.
    pub async fn send(&self, envelope: CallEnvelope) -> Result<Value> {
        self.send_with_timeout(envelope, self.inner.config.call_timeout())
            .await
    }

    /// Send a call and wait for its reply.
    ///
    /// Broadcast calls resolve to a JSON array of [`BroadcastResult`]s; use
    /// [`Endpoint::broadcast`] to get them typed.
    pub async fn send_with_timeout(
        &self,
        envelope: CallEnvelope,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if envelope.target == ContextSelector::Broadcast {
            let results = self.broadcast_with_timeout(envelope, timeout).await?;
            return Ok(serde_json::to_value(results)?);
        }

        let target = self
            .inner
            .hub
            .resolve(&self.inner.address, &envelope.name, &envelope.target)?
            .into_iter()
            .next()
            .ok_or_else(|| MessengerError::NoReceiver {
                method: envelope.name.clone(),
                target: envelope.target.to_string(),
            })?;

        self.inner.call(target, &envelope, timeout).await
    }

    /// Send a call to the top frame of every open tab except this one.
    ///
    /// Never fails because one tab failed: each tab's outcome is reported
    /// separately.
    pub async fn broadcast(&self, envelope: CallEnvelope) -> Result<Vec<BroadcastResult>> {
        self.broadcast_with_timeout(envelope, self.inner.config.call_timeout())
            .await
    }

    async fn broadcast_with_timeout(
        &self,
        envelope: CallEnvelope,
        timeout: Option<Duration>,
    ) -> Result<Vec<BroadcastResult>> {
        let targets =
            self.inner
                .hub
                .resolve(&self.inner.address, &envelope.name, &ContextSelector::Broadcast)?;

        tracing::debug!(method = %envelope.name, targets = targets.len(), "broadcasting");

        let envelope = &envelope;
        let calls = targets.into_iter().map(|target| async move {
            let outcome = self.inner.call(target.clone(), envelope, timeout).await;
            BroadcastResult::new(target, outcome)
        });

        Ok(join_all(calls).await)
    }

    /// Call a method on the background context.
    pub async fn call_background(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.send(CallEnvelope::new(method, ContextSelector::Background, args))
            .await
    }

    /// Probe the background with [`ECHO_SENDER`].
    ///
    /// Fails with a timeout if the background does not answer within the
    /// configured connect timeout. Returns this context's address as the
    /// background sees it.
    pub async fn connect_background(&self) -> Result<ContextAddress> {
        forbid_context(self.kind(), ContextKind::Background)?;

        let envelope = CallEnvelope::new(ECHO_SENDER, ContextSelector::Background, Vec::new());
        let value = self
            .send_with_timeout(envelope, Some(self.inner.config.connect_timeout()))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Disconnect this context from the hub.
    pub fn shutdown(&self) -> bool {
        self.inner.hub.disconnect(&self.inner.address)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.inner.address)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl EndpointInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ContextAddress, Inbox>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The channel to `target`, or `None` if it is not connected.
    fn channel_to(&self, target: &ContextAddress) -> Option<Inbox> {
        if !self.hub.is_connected(target) {
            self.channels().remove(target);
            return None;
        }

        let mut channels = self.channels();
        if let Some(inbox) = channels.get(target) {
            return Some(inbox.clone());
        }
        let inbox = self.hub.inbox(target)?;
        channels.insert(target.clone(), inbox.clone());
        Some(inbox)
    }

    async fn call(
        &self,
        target: ContextAddress,
        envelope: &CallEnvelope,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let method = envelope.name.clone();
        let body = envelope.to_message().encode()?;
        let correlation_id = CorrelationId::new();

        // Register before looking the target up, so a disconnect racing with
        // this call always finds the pending entry to reject.
        let (tx, rx) = oneshot::channel();
        self.pending().insert(
            correlation_id,
            PendingCall {
                method: method.clone(),
                target: target.clone(),
                started: Instant::now(),
                reply: tx,
            },
        );
        // Dropping the call future abandons the pending entry.
        let _pending = PendingGuard {
            inner: self,
            correlation_id,
        };

        let Some(inbox) = self.channel_to(&target) else {
            return Err(MessengerError::NoReceiver {
                method,
                target: target.to_string(),
            });
        };

        let request = Packet::Request {
            correlation_id,
            sender: self.address.clone(),
            body,
        };
        if inbox.send(request).is_err() {
            self.channels().remove(&target);
            return Err(MessengerError::Connection { method, target });
        }

        tracing::trace!(method = %method, target = %target, %correlation_id, "sent");

        let settled = match timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    tracing::debug!(method = %method, target = %target, "call timed out");
                    return Err(MessengerError::Timeout { method, after });
                }
            },
            None => rx.await,
        };

        settled.unwrap_or(Err(MessengerError::Connection { method, target }))
    }

    async fn serve(&self, correlation_id: CorrelationId, sender: ContextAddress, body: String) {
        let result = match Message::decode(&body) {
            Ok(message) => {
                let args = message.args();
                let caller = CallerInfo {
                    sender: sender.clone(),
                    meta: message.meta,
                };
                self.registry.dispatch(&message.kind, args, caller).await
            }
            Err(error) => Err(SerializedError::from(error)),
        };

        let body = match Reply::from(result).encode() {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(%correlation_id, error = %error, "failed to encode reply");
                return;
            }
        };

        match self.channel_to(&sender) {
            Some(inbox) => {
                if inbox.send(Packet::Response { correlation_id, body }).is_err() {
                    tracing::trace!(sender = %sender, "caller went away before the reply");
                }
            }
            None => tracing::trace!(sender = %sender, "caller went away before the reply"),
        }
    }

    fn settle(&self, correlation_id: CorrelationId, body: String) {
        let Some(pending) = self.pending().remove(&correlation_id) else {
            tracing::trace!(context = %self.address, %correlation_id, "discarding late reply");
            return;
        };

        let result = match Reply::decode(&body) {
            Ok(Reply::Value(value)) => Ok(value),
            Ok(Reply::Error(error)) => Err(MessengerError::from_remote(&pending.method, error)),
            Err(error) => Err(error),
        };

        tracing::trace!(
            method = %pending.method,
            target = %pending.target,
            elapsed_ms = pending.started.elapsed().as_millis() as u64,
            "settled"
        );
        let _ = pending.reply.send(result);
    }

    /// Reject every call waiting on `address`.
    fn on_disconnect(&self, address: &ContextAddress) {
        self.channels().remove(address);

        let lost: Vec<PendingCall> = {
            let mut pending = self.pending();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, call)| &call.target == address)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        if !lost.is_empty() {
            tracing::warn!(
                context = %self.address,
                target = %address,
                calls = lost.len(),
                "target disconnected with calls in flight"
            );
        }
        for call in lost {
            let _ = call.reply.send(Err(MessengerError::Connection {
                method: call.method,
                target: call.target,
            }));
        }
    }

    /// Reject everything this context is still waiting for.
    fn close(&self) {
        let lost: Vec<PendingCall> = self.pending().drain().map(|(_, call)| call).collect();
        for call in lost {
            let _ = call.reply.send(Err(MessengerError::Connection {
                method: call.method,
                target: call.target,
            }));
        }
        self.channels().clear();
    }
}

async fn receive_loop(inner: Arc<EndpointInner>, mut inbox: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = inbox.recv().await {
        match packet {
            Packet::Request {
                correlation_id,
                sender,
                body,
            } => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.serve(correlation_id, sender, body).await });
            }
            Packet::Response {
                correlation_id,
                body,
            } => inner.settle(correlation_id, body),
            Packet::Disconnected(address) => inner.on_disconnect(&address),
            Packet::Close => break,
        }
    }

    inner.close();
    tracing::debug!(context = %inner.address, "receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_result_wire_shape() {
        let ok = BroadcastResult::new(ContextAddress::tab(2), Ok(json!("hi")));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({
                "target": {"kind": "tab", "tabId": 2, "frameId": 0},
                "status": "fulfilled",
                "value": "hi"
            })
        );

        let failed = BroadcastResult::new(
            ContextAddress::tab(3),
            Err(MessengerError::UnknownMethod("X".to_string())),
        );
        assert!(!failed.is_fulfilled());
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"]["name"], "UnknownMethodError");
    }

    #[tokio::test]
    async fn request_and_reply() {
        let hub = Hub::new();
        let mut methods = MethodRegistry::new();
        methods
            .register_fn("GREET", |(name,): (String,), _| async move {
                Ok::<_, SerializedError>(format!("hello {}", name))
            })
            .unwrap();
        let _bg = hub.connect(ContextAddress::Background, methods).unwrap();
        let tab = hub.connect(ContextAddress::tab(1), MethodRegistry::new()).unwrap();

        let reply = tab.call_background("GREET", vec![json!("ada")]).await.unwrap();
        assert_eq!(reply, json!("hello ada"));
        assert_eq!(tab.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropped_call_leaves_nothing_pending() {
        let hub = Hub::new();
        let mut methods = MethodRegistry::new();
        methods
            .register_fn("STALL", |(): (), _| async move {
                futures::future::pending::<()>().await;
                Ok::<_, SerializedError>(())
            })
            .unwrap();
        let _bg = hub.connect(ContextAddress::Background, methods).unwrap();
        let tab = hub.connect(ContextAddress::tab(1), MethodRegistry::new()).unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            tab.call_background("STALL", vec![]),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(tab.pending_calls(), 0);
    }

    #[tokio::test]
    async fn connect_background_is_forbidden_in_background() {
        let hub = Hub::new();
        let bg = hub.connect(ContextAddress::Background, MethodRegistry::new()).unwrap();
        let err = bg.connect_background().await.unwrap_err();
        assert!(matches!(err, MessengerError::Context(_)));
    }
}
