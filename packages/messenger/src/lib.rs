//! # Brickyard Messenger
//!
//! Typed remote-procedure calls between the isolated contexts of a browser
//! extension: the background worker, content scripts in each tab and frame,
//! devtools panels, the action popup and the options page.
//!
//! Contexts share no memory. Everything that crosses a boundary is plain
//! JSON, carried as `{type, payload, meta}` messages and answered with
//! `{value}` or `{error}` replies.
//!
//! ## Pieces
//!
//! - [`MethodRegistry`]: what a context serves. Call names map to async
//!   handlers; registering a name twice is an error.
//! - [`Hub`]: which contexts are alive, who opened whom, which frame owns
//!   which nonce.
//! - [`Endpoint`]: one context's connection. Correlates replies, enforces
//!   timeouts, and fails calls whose target disconnects.
//! - [`RemoteMethod`]: a typed stub for calling a method from another
//!   context, with a sender-context check.
//!
//! ## Example
//!
//! ```ignore
//! use brickyard_messenger::{ContextAddress, Hub, MethodRegistry, RemoteMethod};
//!
//! let hub = Hub::new();
//!
//! let mut methods = MethodRegistry::new();
//! methods.register_fn("GET_TAB_TITLE", |(tab,): (u32,), _| async move {
//!     Ok(format!("tab {}", tab))
//! })?;
//! let _background = hub.connect(ContextAddress::Background, methods)?;
//!
//! let content = hub.connect(ContextAddress::tab(4), MethodRegistry::new())?;
//! let get_title = RemoteMethod::<(u32,), String>::background("GET_TAB_TITLE")?;
//! let title = get_title.call_background(&content, (4,)).await?;
//! ```
//!
//! ## Failure modes
//!
//! | Situation                           | Error                        |
//! |-------------------------------------|------------------------------|
//! | target did not answer in time       | [`MessengerError::Timeout`]  |
//! | target disconnected mid-call        | [`MessengerError::Connection`] |
//! | no live context matches the target  | [`MessengerError::NoReceiver`] |
//! | target has no handler for the name  | [`MessengerError::UnknownMethod`] |
//! | handler failed                      | [`MessengerError::Remote`]   |
//! | caller is in the wrong context      | [`MessengerError::Context`]  |
//!
//! Replies that arrive after their call timed out are dropped.

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod registry;
pub mod stub;
pub mod transport;

pub use config::MessengerConfig;
pub use context::{expect_context, forbid_context, ContextAddress, ContextKind, FrameId, TabId};
pub use envelope::{CallEnvelope, ContextSelector, CorrelationId, Message, Meta, Reply};
pub use error::{ContextError, MessengerError, Result, SerializedError};
pub use hub::Hub;
pub use registry::{
    handler_fn, is_valid_method_name, CallerInfo, FnHandler, MethodHandler, MethodRegistry,
    ECHO_SENDER,
};
pub use stub::RemoteMethod;
pub use transport::{BroadcastResult, Endpoint, Settled};
