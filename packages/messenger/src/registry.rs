//! Method registry: call name to local handler.
//!
//! Each context builds one registry while it starts up, registers every
//! method it serves, and hands the registry to [`Hub::connect`]. From then on
//! the registry sits behind an `Arc` and is only read, so concurrent
//! dispatches need no locking.
//!
//! [`Hub::connect`]: crate::hub::Hub::connect

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::ContextAddress;
use crate::envelope::Meta;
use crate::error::{MessengerError, Result, SerializedError};

/// Name of the built-in method every context answers with the caller's
/// address.
pub const ECHO_SENDER: &str = "ECHO_SENDER";

/// Information about the context that sent a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerInfo {
    pub sender: ContextAddress,
    /// The message's `meta`, exactly as sent.
    pub meta: Option<Meta>,
}

impl CallerInfo {
    pub fn new(sender: ContextAddress) -> Self {
        Self { sender, meta: None }
    }

    /// The frame nonce the call was addressed to, if any.
    pub fn nonce(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.nonce.as_deref())
    }
}

/// A locally implemented method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(
        &self,
        args: Vec<Value>,
        caller: CallerInfo,
    ) -> std::result::Result<Value, SerializedError>;
}

/// Adapts a typed async function into a [`MethodHandler`].
///
/// The positional JSON arguments are deserialized into `A`, which is
/// normally a tuple (`(String, u32)`, `(Config,)`, or `()` for no arguments).
pub struct FnHandler<F, A, R> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

/// Wrap a typed async function as a handler.
pub fn handler_fn<F, Fut, A, R>(f: F) -> FnHandler<F, A, R>
where
    F: Fn(A, CallerInfo) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<R, SerializedError>> + Send,
    A: DeserializeOwned + Send,
    R: Serialize + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, A, R> MethodHandler for FnHandler<F, A, R>
where
    F: Fn(A, CallerInfo) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<R, SerializedError>> + Send,
    A: DeserializeOwned + Send,
    R: Serialize + Send,
{
    async fn handle(
        &self,
        args: Vec<Value>,
        caller: CallerInfo,
    ) -> std::result::Result<Value, SerializedError> {
        let args = decode_args::<A>(args)
            .map_err(|e| SerializedError::new("TypeError", format!("invalid arguments: {}", e)))?;
        let output = (self.f)(args, caller).await?;
        serde_json::to_value(output)
            .map_err(|e| SerializedError::new("TypeError", format!("invalid result: {}", e)))
    }
}

/// Deserialize positional arguments into a tuple. No arguments decode as
/// `null` so that `()` handlers accept an empty payload.
pub(crate) fn decode_args<A: DeserializeOwned>(
    args: Vec<Value>,
) -> std::result::Result<A, serde_json::Error> {
    if args.is_empty() {
        serde_json::from_value(Value::Null)
    } else {
        serde_json::from_value(Value::Array(args))
    }
}

/// Whether `name` is a flat UPPER_SNAKE_CASE call name.
pub fn is_valid_method_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Process-scoped mapping from call name to handler.
#[derive(Default)]
pub struct MethodRegistry {
    methods: BTreeMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `name`.
    ///
    /// Registering the same name twice is a startup misconfiguration and
    /// fails with [`MessengerError::DuplicateMethod`].
    pub fn register<H>(&mut self, name: &str, handler: H) -> Result<()>
    where
        H: MethodHandler + 'static,
    {
        if !is_valid_method_name(name) {
            return Err(MessengerError::InvalidMethodName(name.to_string()));
        }
        if self.methods.contains_key(name) {
            return Err(MessengerError::DuplicateMethod(name.to_string()));
        }

        self.methods.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Bind a typed async function to `name`.
    pub fn register_fn<F, Fut, A, R>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(A, CallerInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, SerializedError>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register(name, handler_fn(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// All registered call names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Run the handler bound to `name`.
    ///
    /// Never fails with anything but a [`SerializedError`]: handler errors
    /// and handler panics are both caught here so nothing unserializable
    /// crosses the context boundary.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Vec<Value>,
        caller: CallerInfo,
    ) -> std::result::Result<Value, SerializedError> {
        let handler = self
            .methods
            .get(name)
            .ok_or_else(|| SerializedError::from(MessengerError::UnknownMethod(name.to_string())))?;

        tracing::debug!(method = name, sender = %caller.sender, "dispatching");

        match AssertUnwindSafe(handler.handle(args, caller)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let error = SerializedError::from_panic(name, panic);
                tracing::error!(method = name, error = %error, "handler panicked");
                Err(error)
            }
        }
    }

    /// Register the built-in [`ECHO_SENDER`] handler unless the context
    /// provides its own.
    pub(crate) fn ensure_builtins(&mut self) {
        if !self.contains(ECHO_SENDER) {
            let echo = handler_fn(|(): (), caller: CallerInfo| async move {
                Ok::<_, SerializedError>(caller.sender)
            });
            self.methods.insert(ECHO_SENDER.to_string(), Arc::new(echo));
        }
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}
