//! The pipeline reducer.
//!
//! Runs the steps of a pipeline one after another against a shared
//! [`ExecutionContext`]. For each step:
//!
//! 1. evaluate the step's condition; a false condition skips the step
//!    entirely (no execution, no trace, no context change);
//! 2. look up the block;
//! 3. render the arguments against the context;
//! 4. record a trace entry;
//! 5. validate the arguments against the block's input schema;
//! 6. in a headless run, stop at the first renderer and hand its arguments
//!    and the context back to the caller;
//! 7. run the block and merge its output into the context;
//! 8. record a trace exit.
//!
//! A failing step aborts the run. The error is annotated with the step's
//! instance id so callers can point at the offending block.
//!
//! Control-flow steps (`if-else`, `for-each`) run nested pipelines against
//! a copy of the context. A headless stop inside a nested pipeline unwinds
//! through every enclosing step unchanged.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use brickyard_messenger::SerializedError;

use crate::block::{BlockKind, BlockOptions, BlockRegistry, ReaderRoot};
use crate::config::{
    parse_config, ApiVersion, BlockConfig, ForEachConfig, IfElseConfig, PipelineInput,
    FOR_EACH_BLOCK_ID, IF_ELSE_BLOCK_ID,
};
use crate::context::{ExecutionContext, InitialValues};
use crate::error::PipelineError;
use crate::expression::{evaluate_condition, render};
use crate::logger::{Logger, MessageContext};
use crate::trace::{NullTraceSink, TraceEntryData, TraceExitData, TraceSink};
use crate::validation::validate_input;

/// How to run a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReduceOptions {
    #[serde(skip)]
    pub logger: Logger,
    /// Check rendered arguments against each block's input schema.
    pub validate: bool,
    /// Stop at the first renderer instead of running it.
    pub headless: bool,
    /// Resolve to the whole context instead of the last output.
    pub return_context: bool,
    /// Traces are only recorded for runs that belong to an extension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub api_version: ApiVersion,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            logger: Logger::default(),
            validate: true,
            headless: false,
            return_context: false,
            extension_id: None,
            run_id: None,
            api_version: ApiVersion::default(),
        }
    }
}

impl ReduceOptions {
    pub fn headless() -> Self {
        Self {
            headless: true,
            ..Default::default()
        }
    }

    pub fn with_extension(mut self, extension_id: Uuid) -> Self {
        self.extension_id = Some(extension_id);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }
}

/// A headless run reached a renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadlessSignal {
    /// The renderer's rendered arguments.
    pub args: Value,
    /// The context as the renderer would have seen it.
    pub ctxt: Value,
}

/// Why a run stopped before completing.
#[derive(Debug, Error)]
pub enum Interruption {
    #[error("headless run reached a renderer")]
    Headless(HeadlessSignal),

    #[error(transparent)]
    Failed(#[from] PipelineError),
}

impl From<serde_json::Error> for Interruption {
    fn from(error: serde_json::Error) -> Self {
        Interruption::Failed(error.into())
    }
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Ready,
    Running,
    Completed,
    Failed,
    HeadlessAborted,
}

/// How a run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed(Value),
    HeadlessAborted(HeadlessSignal),
    Failed(PipelineError),
}

impl PipelineOutcome {
    pub fn state(&self) -> RunState {
        match self {
            PipelineOutcome::Completed(_) => RunState::Completed,
            PipelineOutcome::HeadlessAborted(_) => RunState::HeadlessAborted,
            PipelineOutcome::Failed(_) => RunState::Failed,
        }
    }

    pub fn into_result(self) -> Result<Value, Interruption> {
        match self {
            PipelineOutcome::Completed(value) => Ok(value),
            PipelineOutcome::HeadlessAborted(signal) => Err(Interruption::Headless(signal)),
            PipelineOutcome::Failed(error) => Err(Interruption::Failed(error)),
        }
    }
}

impl From<Result<Value, Interruption>> for PipelineOutcome {
    fn from(result: Result<Value, Interruption>) -> Self {
        match result {
            Ok(value) => PipelineOutcome::Completed(value),
            Err(Interruption::Headless(signal)) => PipelineOutcome::HeadlessAborted(signal),
            Err(Interruption::Failed(error)) => PipelineOutcome::Failed(error),
        }
    }
}

/// Handle to a run, observable while the run is in progress.
///
/// A handle can drive exactly one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    state: Arc<Mutex<RunState>>,
}

impl RunHandle {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: Arc::new(Mutex::new(RunState::Ready)),
        }
    }

    pub async fn state(&self) -> RunState {
        *self.state.lock().await
    }

    /// Move from `Ready` to `Running`. Fails if the run already started.
    async fn start(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        if *state != RunState::Ready {
            return Err(PipelineError::RunAlreadyStarted(self.run_id));
        }
        *state = RunState::Running;
        Ok(())
    }

    async fn finish(&self, state: RunState) {
        *self.state.lock().await = state;
    }
}

/// Everything fixed for the duration of one run.
struct RunScope<'a> {
    options: &'a ReduceOptions,
    run_id: Uuid,
    root: &'a ReaderRoot,
    logger: Logger,
}

/// Runs pipelines.
#[derive(Clone)]
pub struct Reducer {
    registry: Arc<dyn BlockRegistry>,
    tracer: Arc<dyn TraceSink>,
}

impl Reducer {
    pub fn new(registry: Arc<dyn BlockRegistry>) -> Self {
        Self {
            registry,
            tracer: Arc::new(NullTraceSink),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn TraceSink>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Run `pipeline` from `initial`.
    pub async fn reduce_pipeline(
        &self,
        pipeline: impl Into<PipelineInput>,
        initial: InitialValues,
        options: ReduceOptions,
    ) -> PipelineOutcome {
        let handle = RunHandle::new(options.run_id.unwrap_or_else(Uuid::new_v4));
        self.run(&handle, pipeline, initial, options).await
    }

    /// Run `pipeline` under an existing handle.
    pub async fn run(
        &self,
        handle: &RunHandle,
        pipeline: impl Into<PipelineInput>,
        initial: InitialValues,
        options: ReduceOptions,
    ) -> PipelineOutcome {
        if let Err(error) = handle.start().await {
            return PipelineOutcome::Failed(error);
        }

        let mut pipeline = pipeline.into().normalize();
        for config in &mut pipeline {
            config.assign_nested_instance_ids();
        }
        let mut logger = options.logger.clone();
        if let Some(extension_id) = options.extension_id {
            logger = logger.child_logger(&MessageContext::for_extension(extension_id));
        }
        let scope = RunScope {
            options: &options,
            run_id: handle.run_id,
            root: &initial.root,
            logger,
        };

        let outcome = PipelineOutcome::from(self.reduce(&scope, &pipeline, &initial).await);
        handle.finish(outcome.state()).await;

        match &outcome {
            PipelineOutcome::Completed(_) => scope.logger.debug("pipeline completed"),
            PipelineOutcome::HeadlessAborted(_) => scope.logger.debug("pipeline reached a renderer"),
            PipelineOutcome::Failed(error) => {
                scope.logger.warn(&format!("pipeline failed: {}", error))
            }
        }
        outcome
    }

    async fn reduce(
        &self,
        scope: &RunScope<'_>,
        pipeline: &[BlockConfig],
        initial: &InitialValues,
    ) -> Result<Value, Interruption> {
        let mut ctxt = ExecutionContext::new(initial, scope.options.api_version)?;
        ctxt.check_output_keys(pipeline)?;

        let last = self.reduce_steps(scope, pipeline, &mut ctxt).await?;
        if scope.options.return_context {
            Ok(ctxt.snapshot())
        } else {
            Ok(last)
        }
    }

    /// Run steps in order. Resolves to the last executed step's output, or
    /// `null` if no step ran.
    fn reduce_steps<'a>(
        &'a self,
        scope: &'a RunScope<'a>,
        pipeline: &'a [BlockConfig],
        ctxt: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, Interruption>> {
        async move {
            let mut last = Value::Null;
            for config in pipeline {
                if let Some(output) = self.run_step(scope, config, ctxt).await? {
                    last = output;
                }
            }
            Ok(last)
        }
        .boxed()
    }

    async fn run_step(
        &self,
        scope: &RunScope<'_>,
        config: &BlockConfig,
        ctxt: &mut ExecutionContext,
    ) -> Result<Option<Value>, Interruption> {
        if let Some(condition) = &config.condition {
            let passed = evaluate_condition(condition, ctxt.values())
                .map_err(|error| self.annotate(scope, config, error))?;
            if !passed {
                scope
                    .logger
                    .debug(&format!("skipping {}: condition not met", config.id));
                return Ok(None);
            }
        }

        let mut trace = StepTrace::new(self.tracer.as_ref(), scope, config);
        let result = match config.id.as_str() {
            IF_ELSE_BLOCK_ID | FOR_EACH_BLOCK_ID => {
                self.run_control_flow(scope, config, ctxt, &mut trace).await
            }
            _ => self.run_block(scope, config, ctxt, &mut trace).await,
        };
        let result = result.and_then(|output| {
            ctxt.merge_output(config, &output)?;
            Ok(output)
        });

        trace.exit(&result).await;

        match result {
            Ok(output) => Ok(Some(output)),
            Err(Interruption::Failed(error)) => {
                Err(Interruption::Failed(self.annotate(scope, config, error)))
            }
            Err(headless) => Err(headless),
        }
    }

    async fn run_block(
        &self,
        scope: &RunScope<'_>,
        config: &BlockConfig,
        ctxt: &ExecutionContext,
        trace: &mut StepTrace<'_>,
    ) -> Result<Value, Interruption> {
        let block = self
            .registry
            .lookup(&config.id)
            .await
            .ok_or_else(|| PipelineError::BlockNotFound {
                id: config.id.clone(),
            })?;

        let args = render(&config.config, ctxt.values())?;
        trace.enter(ctxt.snapshot(), args.clone()).await;

        if scope.options.validate {
            if let Some(schema) = block.input_schema() {
                validate_input(block.id(), schema, &args)?;
            }
        }

        if block.kind() == BlockKind::Renderer && scope.options.headless {
            return Err(Interruption::Headless(HeadlessSignal {
                args,
                ctxt: ctxt.snapshot(),
            }));
        }

        let logger = scope
            .logger
            .child_logger(&MessageContext::for_block(config.id.clone()));
        logger.trace("running block");

        let options = BlockOptions {
            ctxt: ctxt.values().clone(),
            logger,
            root: scope.root.clone(),
            headless: scope.options.headless,
        };
        Ok(block.run(args, options).await?)
    }

    async fn run_control_flow(
        &self,
        scope: &RunScope<'_>,
        config: &BlockConfig,
        ctxt: &ExecutionContext,
        trace: &mut StepTrace<'_>,
    ) -> Result<Value, Interruption> {
        if config.id == IF_ELSE_BLOCK_ID {
            let if_else: IfElseConfig = parse_config(config)?;
            let branch = evaluate_condition(&if_else.condition, ctxt.values())?;
            trace
                .enter(ctxt.snapshot(), serde_json::json!({ "condition": branch }))
                .await;

            let pipeline = if branch {
                &if_else.if_true
            } else {
                &if_else.if_false
            };
            let mut branch_ctxt = ctxt.clone();
            self.reduce_steps(scope, pipeline, &mut branch_ctxt).await
        } else {
            let for_each: ForEachConfig = parse_config(config)?;
            let elements = match render(&for_each.elements, ctxt.values())? {
                Value::Array(elements) => elements,
                Value::Null => Vec::new(),
                other => {
                    return Err(PipelineError::business(format!(
                        "Expected an array of elements, got {}",
                        other
                    ))
                    .into())
                }
            };
            trace
                .enter(
                    ctxt.snapshot(),
                    serde_json::json!({ "elements": elements.clone() }),
                )
                .await;

            let element_key = format!("@{}", for_each.element_key);
            let mut last = Value::Null;
            for element in elements {
                let mut body_ctxt = ctxt.clone();
                body_ctxt.bind(&element_key, element)?;
                last = self
                    .reduce_steps(scope, &for_each.body, &mut body_ctxt)
                    .await?;
            }
            Ok(last)
        }
    }

    /// Attach the failing step to `error`. Errors already annotated by a
    /// nested step keep the innermost annotation.
    fn annotate(
        &self,
        scope: &RunScope<'_>,
        config: &BlockConfig,
        error: PipelineError,
    ) -> PipelineError {
        match error {
            PipelineError::Step { .. } => error,
            other => PipelineError::Step {
                block_instance_id: config.instance_id,
                block_id: config.id.clone(),
                extension_id: scope.options.extension_id,
                source: Box::new(other),
            },
        }
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer").finish_non_exhaustive()
    }
}

/// Trace bookkeeping for one step: an exit is only reported if an entry was.
struct StepTrace<'a> {
    sink: &'a dyn TraceSink,
    logger: &'a Logger,
    extension_id: Option<Uuid>,
    run_id: Uuid,
    config: &'a BlockConfig,
    entered: bool,
}

impl<'a> StepTrace<'a> {
    fn new(sink: &'a dyn TraceSink, scope: &'a RunScope<'a>, config: &'a BlockConfig) -> Self {
        Self {
            sink,
            logger: &scope.logger,
            extension_id: scope.options.extension_id,
            run_id: scope.run_id,
            config,
            entered: false,
        }
    }

    async fn enter(&mut self, template_context: Value, rendered_args: Value) {
        let Some(extension_id) = self.extension_id else {
            return;
        };
        self.entered = true;

        let entry = TraceEntryData {
            extension_id,
            run_id: self.run_id,
            block_instance_id: self.config.instance_id,
            block_id: self.config.id.clone(),
            timestamp: Utc::now(),
            template_context,
            rendered_args,
        };
        if let Err(error) = self.sink.add_entry(entry).await {
            self.logger
                .warn(&format!("failed to record trace entry: {}", error));
        }
    }

    async fn exit(&mut self, result: &Result<Value, Interruption>) {
        let Some(extension_id) = self.extension_id.filter(|_| self.entered) else {
            return;
        };

        let (output, error, skipped_run) = match result {
            Ok(output) => (Some(output.clone()), None, false),
            Err(Interruption::Failed(error)) => (None, Some(SerializedError::from(error)), false),
            Err(Interruption::Headless(_)) => (None, None, true),
        };

        let exit = TraceExitData {
            extension_id,
            run_id: self.run_id,
            block_instance_id: self.config.instance_id,
            block_id: self.config.id.clone(),
            timestamp: Utc::now(),
            output,
            error,
            skipped_run,
        };
        if let Err(error) = self.sink.add_exit(exit).await {
            self.logger
                .warn(&format!("failed to record trace exit: {}", error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reduce_options_from_json() {
        let options: ReduceOptions =
            serde_json::from_value(json!({"headless": true, "apiVersion": "v3"})).unwrap();
        assert!(options.validate);
        assert!(options.headless);
        assert_eq!(options.api_version, ApiVersion::V3);
        assert_eq!(options.extension_id, None);
    }

    #[test]
    fn headless_signal_wire_shape() {
        let signal = HeadlessSignal {
            args: json!({"body": "hi"}),
            ctxt: json!({"@input": {}}),
        };
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({"args": {"body": "hi"}, "ctxt": {"@input": {}}})
        );
    }

    #[test]
    fn outcome_states() {
        let completed = PipelineOutcome::Completed(json!(1));
        assert_eq!(completed.state(), RunState::Completed);
        assert_eq!(completed.into_result().unwrap(), json!(1));

        let aborted = PipelineOutcome::HeadlessAborted(HeadlessSignal {
            args: json!({}),
            ctxt: json!({}),
        });
        assert_eq!(aborted.state(), RunState::HeadlessAborted);
        assert!(matches!(aborted.into_result(), Err(Interruption::Headless(_))));

        let failed = PipelineOutcome::Failed(PipelineError::business("nope"));
        assert_eq!(failed.state(), RunState::Failed);
        assert!(matches!(failed.into_result(), Err(Interruption::Failed(_))));
    }

    #[tokio::test]
    async fn run_handle_transitions() {
        let handle = RunHandle::new(Uuid::new_v4());
        assert_eq!(handle.state().await, RunState::Ready);
        handle.start().await.unwrap();
        assert_eq!(handle.state().await, RunState::Running);
        assert!(handle.start().await.is_err());
        handle.finish(RunState::Completed).await;
        assert_eq!(handle.state().await, RunState::Completed);
    }
}
