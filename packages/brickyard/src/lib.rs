//! Brickyard: cross-context messaging and block pipelines for browser extensions.
//!
//! Users compose bricks (readers, effects, transforms, renderers) into
//! pipelines bound to extension points. The pieces live in their own crates
//! and are re-exported here:
//!
//! - [`messenger`]: typed calls between the background, content scripts,
//!   devtools and the popup.
//! - [`pipeline`]: the block pipeline reducer, service binding and traces.
//! - [`extension`]: extension points and the methods each context serves.

pub use brickyard_extension as extension;
pub use brickyard_messenger as messenger;
pub use brickyard_pipeline as pipeline;

pub use brickyard_extension::{ExtensionError, ExtensionPoint, ExtensionRuntime};
pub use brickyard_messenger::{Endpoint, Hub, MessengerError, MethodRegistry, RemoteMethod};
pub use brickyard_pipeline::{
    BlockConfig, InitialValues, PipelineError, PipelineOutcome, ReduceOptions, Reducer,
};
