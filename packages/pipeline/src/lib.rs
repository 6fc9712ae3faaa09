//! # Brickyard Pipeline
//!
//! Runs pipelines of blocks ("bricks") against a per-run context.
//!
//! A pipeline is an ordered list of [`BlockConfig`]s. Each step names a
//! block, carries `{{ template }}` arguments rendered against the context,
//! and may be guarded by a condition. Outputs flow forward: step `i + 1`
//! sees what step `i` produced, never anything later.
//!
//! ```ignore
//! use brickyard_pipeline::{BlockConfig, InitialValues, Reducer, ReduceOptions};
//!
//! let reducer = Reducer::new(Arc::new(registry)).with_tracer(Arc::new(traces.clone()));
//! let outcome = reducer
//!     .reduce_pipeline(
//!         vec![
//!             BlockConfig::new("@acme/read-title", json!({})),
//!             BlockConfig::new("@acme/notify", json!({"message": "Saw {{ title }}"})),
//!         ],
//!         InitialValues::new(json!({})),
//!         ReduceOptions::default().with_extension(extension_id),
//!     )
//!     .await;
//! ```
//!
//! A run ends in one of three ways ([`PipelineOutcome`]): it completes with
//! the last output, it fails with an error annotated with the failing
//! step, or, when run headless, it stops at the first renderer and returns
//! that renderer's arguments and context ([`HeadlessSignal`]).
//!
//! Services an extension depends on are bound into the context up front
//! ([`make_service_context`]) and cannot be replaced by any block output.

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod expression;
pub mod logger;
pub mod reducer;
pub mod services;
pub mod trace;
pub mod validation;

pub use block::{
    Block, BlockKind, BlockOptions, BlockRegistry, CompositeReader, InMemoryBlockRegistry,
    Reader, ReaderBlock, ReaderRoot,
};
pub use config::{
    pipeline_block_ids, ApiVersion, BlockConfig, ForEachConfig, IfElseConfig, Pipeline,
    PipelineInput, FOR_EACH_BLOCK_ID, IF_ELSE_BLOCK_ID,
};
pub use context::{ExecutionContext, InitialValues};
pub use error::{PipelineError, Result, SchemaViolation};
pub use logger::{Logger, MessageContext};
pub use reducer::{
    HeadlessSignal, Interruption, PipelineOutcome, ReduceOptions, Reducer, RunHandle, RunState,
};
pub use services::{
    make_service_context, CachedLocator, SanitizedServiceConfiguration, ServiceContext,
    ServiceDependency, ServiceLocator, StaticLocator,
};
pub use trace::{
    pipeline_field_errors, NullTraceSink, TraceEntryData, TraceExitData, TraceRecord, TraceSink,
    TraceStore,
};
pub use validation::validate_input;
