//! Typed client stubs for remote methods.
//!
//! A [`RemoteMethod`] is declared once next to the method's handler and
//! shared by every context that calls it. It fixes the call name, the
//! argument and result types, which contexts may send it, and an optional
//! per-method timeout.
//!
//! ```ignore
//! pub static CLOSE_TAB: LazyLock<RemoteMethod<(), ()>> =
//!     LazyLock::new(|| RemoteMethod::background("CLOSE_TAB").unwrap());
//!
//! CLOSE_TAB.call_background(&endpoint, ()).await?;
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::ContextKind;
use crate::envelope::{CallEnvelope, ContextSelector};
use crate::error::{ContextError, MessengerError, Result};
use crate::registry::is_valid_method_name;
use crate::transport::Endpoint;

const ALL_CONTEXTS: [ContextKind; 5] = [
    ContextKind::Background,
    ContextKind::ContentScript,
    ContextKind::DevTools,
    ContextKind::ActionPopup,
    ContextKind::Options,
];

/// Client-side declaration of a remote method taking `A` and returning `R`.
///
/// `A` is serialized to positional arguments: a tuple or array spreads into
/// one argument per element, `()` sends none, anything else is sent as a
/// single argument.
pub struct RemoteMethod<A, R> {
    name: String,
    allowed_senders: Vec<ContextKind>,
    timeout: Option<Duration>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteMethod<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    /// A method that any context may call.
    pub fn new(name: &str) -> Result<Self> {
        if !is_valid_method_name(name) {
            return Err(MessengerError::InvalidMethodName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            allowed_senders: ALL_CONTEXTS.to_vec(),
            timeout: None,
            _marker: PhantomData,
        })
    }

    /// A background method: callable from every context except the
    /// background itself.
    pub fn background(name: &str) -> Result<Self> {
        Ok(Self::new(name)?.forbidden_from(ContextKind::Background))
    }

    /// Restrict the contexts allowed to send this call.
    pub fn allowed_from(mut self, senders: &[ContextKind]) -> Self {
        self.allowed_senders = senders.to_vec();
        self
    }

    pub fn forbidden_from(mut self, sender: ContextKind) -> Self {
        self.allowed_senders.retain(|kind| *kind != sender);
        self
    }

    /// Give up waiting after `timeout`, overriding the endpoint's default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allowed_senders(&self) -> &[ContextKind] {
        &self.allowed_senders
    }

    /// Build the envelope for a call to `target`.
    pub fn envelope(&self, target: ContextSelector, args: &A) -> Result<CallEnvelope> {
        let args = match serde_json::to_value(args)? {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        Ok(CallEnvelope::new(self.name.clone(), target, args))
    }

    /// Call the method on `target` from `endpoint`'s context.
    pub async fn call(&self, endpoint: &Endpoint, target: ContextSelector, args: A) -> Result<R> {
        let actual = endpoint.kind();
        if !self.allowed_senders.contains(&actual) {
            return Err(ContextError::NotAllowed {
                method: self.name.clone(),
                actual,
            }
            .into());
        }

        let envelope = self.envelope(target, &args)?;
        let timeout = self.timeout.or(endpoint.config().call_timeout());
        let value = endpoint.send_with_timeout(envelope, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_background(&self, endpoint: &Endpoint, args: A) -> Result<R> {
        self.call(endpoint, ContextSelector::Background, args).await
    }
}

impl<A, R> Clone for RemoteMethod<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            allowed_senders: self.allowed_senders.clone(),
            timeout: self.timeout,
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for RemoteMethod<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMethod")
            .field("name", &self.name)
            .field("allowed_senders", &self.allowed_senders)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_bad_names() {
        assert!(RemoteMethod::<(), ()>::new("closeTab").is_err());
    }

    #[test]
    fn background_methods_exclude_background() {
        let method = RemoteMethod::<(), ()>::background("CLOSE_TAB").unwrap();
        assert!(!method.allowed_senders().contains(&ContextKind::Background));
        assert!(method.allowed_senders().contains(&ContextKind::ContentScript));
    }

    #[test]
    fn envelope_spreads_tuples() {
        let method = RemoteMethod::<(String, u32), ()>::new("OPEN_TAB").unwrap();
        let envelope = method
            .envelope(ContextSelector::Background, &("https://example.com".to_string(), 3))
            .unwrap();
        assert_eq!(envelope.args, vec![json!("https://example.com"), json!(3)]);

        let unit = RemoteMethod::<(), ()>::new("CLOSE_TAB").unwrap();
        let envelope = unit.envelope(ContextSelector::Background, &()).unwrap();
        assert!(envelope.args.is_empty());
    }

    #[test]
    fn envelope_wraps_single_values() {
        let method = RemoteMethod::<Value, ()>::new("SET_DATA").unwrap();
        let envelope = method
            .envelope(ContextSelector::tab(1), &json!({"a": 1}))
            .unwrap();
        assert_eq!(envelope.args, vec![json!({"a": 1})]);
        assert_eq!(envelope.target, ContextSelector::tab(1));
    }
}
