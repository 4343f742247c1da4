//! Per-execution mutable state and the pluggable policy seams.
//!
//! A [`PipelineContext`] is owned by exactly one execution. Within an
//! execution the executor mutates it sequentially; across executions the
//! only transfer is a value snapshot taken when a parent completes. The
//! managers hanging off the context are `Arc`-shared and read-only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use metalus_model::{Parameter, Pipeline};
use metalus_types::{Audit, PipelineStepResponse, Result, Value};

/// Name of the global flag enabling declared-kind checks on step arguments.
pub const VALIDATE_PARAMETER_TYPES: &str = "validateStepParameterTypes";

// ---------------------------------------------------------------------------
// Policy seams
// ---------------------------------------------------------------------------

/// Lookup of managed pipelines, used by the `&` sigil and by step-groups
/// referencing a pipeline by id.
pub trait PipelineManager: Send + Sync {
    fn get_pipeline(&self, id: &str) -> Option<Pipeline>;
}

/// Pipeline manager backed by a map built at plan construction.
#[derive(Default)]
pub struct InMemoryPipelineManager {
    pipelines: HashMap<String, Pipeline>,
}

impl InMemoryPipelineManager {
    pub fn new<I>(pipelines: I) -> Self
    where
        I: IntoIterator<Item = Pipeline>,
    {
        Self {
            pipelines: pipelines.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

impl PipelineManager for InMemoryPipelineManager {
    fn get_pipeline(&self, id: &str) -> Option<Pipeline> {
        self.pipelines.get(id).cloned()
    }
}

/// Hook applied to every resolved step argument. Implementations may redact
/// or transform values and must tolerate concurrent calls from distinct
/// executions.
pub trait SecurityManager: Send + Sync {
    fn secure_parameter(&self, value: Value) -> Value;
}

pub struct PassthroughSecurity;

impl SecurityManager for PassthroughSecurity {
    fn secure_parameter(&self, value: Value) -> Value {
        value
    }
}

/// Lifecycle callbacks emitted by the executor. Callbacks may arrive
/// concurrently from different executions.
pub trait PipelineListener: Send + Sync {
    fn pipeline_started(&self, _pipeline_id: &str) {}
    fn step_started(&self, _pipeline_id: &str, _step_id: &str) {}
    fn step_finished(&self, _pipeline_id: &str, _step_id: &str, _response: &PipelineStepResponse) {}
    fn pipeline_finished(&self, _pipeline_id: &str) {}
    fn pipeline_paused(&self, _pipeline_id: &str, _step_id: &str, _message: &str) {}
    fn pipeline_errored(&self, _pipeline_id: &str, _step_id: &str, _message: &str) {}
}

/// Default listener: structured log lines for each lifecycle event.
pub struct LoggingListener;

impl PipelineListener for LoggingListener {
    fn pipeline_started(&self, pipeline_id: &str) {
        tracing::info!(pipeline = %pipeline_id, "Pipeline started");
    }

    fn step_started(&self, pipeline_id: &str, step_id: &str) {
        tracing::debug!(pipeline = %pipeline_id, step = %step_id, "Step started");
    }

    fn step_finished(&self, pipeline_id: &str, step_id: &str, _response: &PipelineStepResponse) {
        tracing::debug!(pipeline = %pipeline_id, step = %step_id, "Step finished");
    }

    fn pipeline_finished(&self, pipeline_id: &str) {
        tracing::info!(pipeline = %pipeline_id, "Pipeline finished");
    }

    fn pipeline_paused(&self, pipeline_id: &str, step_id: &str, message: &str) {
        tracing::warn!(pipeline = %pipeline_id, step = %step_id, %message, "Pipeline paused");
    }

    fn pipeline_errored(&self, pipeline_id: &str, step_id: &str, message: &str) {
        tracing::error!(pipeline = %pipeline_id, step = %step_id, %message, "Pipeline errored");
    }
}

/// Maps a declared [`Parameter`] to the value handed to a step argument.
/// The default implementation is the sigil resolver; the application's
/// `stepMapper` descriptor can swap in another.
pub trait ParameterMapper: Send + Sync {
    fn map_parameter(&self, parameter: &Parameter, context: &PipelineContext) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// PipelineContext
// ---------------------------------------------------------------------------

/// Mutable state of one execution: globals, accumulated step responses per
/// pipeline, and the policy managers.
#[derive(Clone)]
pub struct PipelineContext {
    pub globals: HashMap<String, Value>,
    /// pipelineId -> stepId -> stored response.
    pub parameters: HashMap<String, HashMap<String, PipelineStepResponse>>,
    /// Pipeline currently being executed; set by the executor on entry.
    pub current_pipeline_id: Option<String>,
    /// Namespace prefixes searched when resolving `Object.function`.
    pub step_packages: Vec<String>,
    pub pipeline_manager: Arc<dyn PipelineManager>,
    pub security_manager: Arc<dyn SecurityManager>,
    pub listener: Arc<dyn PipelineListener>,
    pub parameter_mapper: Arc<dyn ParameterMapper>,
    pub audits: Vec<Audit>,
}

impl PipelineContext {
    /// A context with the given globals and default managers. The default
    /// parameter mapper resolves against an empty registry; plan building
    /// replaces it with one backed by the real registry.
    pub fn new(globals: HashMap<String, Value>) -> Self {
        Self {
            globals,
            parameters: HashMap::new(),
            current_pipeline_id: None,
            step_packages: vec!["metalus".to_string()],
            pipeline_manager: Arc::new(InMemoryPipelineManager::default()),
            security_manager: Arc::new(PassthroughSecurity),
            listener: Arc::new(LoggingListener),
            parameter_mapper: Arc::new(crate::resolver::DefaultParameterMapper::default()),
            audits: Vec::new(),
        }
    }

    pub fn global(&self, name: &str) -> &Value {
        self.globals.get(name).unwrap_or(&Value::NONE)
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Whether the declared-kind validation flag is set.
    pub fn validate_parameter_types(&self) -> bool {
        self.global(VALIDATE_PARAMETER_TYPES).as_bool().unwrap_or(false)
    }

    pub fn response(&self, pipeline_id: &str, step_id: &str) -> Option<&PipelineStepResponse> {
        self.parameters.get(pipeline_id).and_then(|m| m.get(step_id))
    }

    /// Whether any results exist for `pipeline_id` — the cross-pipeline
    /// addressing test for `$`/`@`/`#` expressions.
    pub fn has_pipeline_results(&self, pipeline_id: &str) -> bool {
        self.parameters.contains_key(pipeline_id)
    }

    pub fn store_response(
        &mut self,
        pipeline_id: &str,
        step_id: &str,
        response: PipelineStepResponse,
    ) {
        self.parameters
            .entry(pipeline_id.to_string())
            .or_default()
            .insert(step_id.to_string(), response);
    }

    pub fn add_audit(&mut self, audit: Audit) {
        self.audits.push(audit);
    }

    /// Project the accumulated responses into the value universe:
    /// pipelineId -> stepId -> response. This is the shape inherited by
    /// child executions under `pipelineParameters`.
    pub fn parameters_as_value(&self) -> Value {
        Value::Map(
            self.parameters
                .iter()
                .map(|(pipeline_id, steps)| {
                    (
                        pipeline_id.clone(),
                        Value::Map(
                            steps
                                .iter()
                                .map(|(step_id, resp)| (step_id.clone(), resp.as_value()))
                                .collect(),
                        ),
                    )
                })
                .collect(),
        )
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("globals", &self.globals)
            .field("parameters", &self.parameters)
            .field("current_pipeline_id", &self.current_pipeline_id)
            .field("step_packages", &self.step_packages)
            .field("audits", &self.audits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metalus_model::PipelineStep;

    fn pipeline(id: &str) -> Pipeline {
        Pipeline {
            id: id.into(),
            name: None,
            category: None,
            steps: vec![PipelineStep {
                id: "s".into(),
                display_name: None,
                description: None,
                step_type: None,
                params: Vec::new(),
                engine_meta: None,
                next_step_id: None,
                execute_if_empty: None,
            }],
            step_group_result: None,
        }
    }

    #[test]
    fn global_lookup_defaults_to_absence() {
        let ctx = PipelineContext::new(HashMap::new());
        assert_eq!(ctx.global("missing"), &Value::None);
    }

    #[test]
    fn validate_flag_reads_boolean_global() {
        let mut ctx = PipelineContext::new(HashMap::new());
        assert!(!ctx.validate_parameter_types());
        ctx.set_global(VALIDATE_PARAMETER_TYPES, Value::Boolean(true));
        assert!(ctx.validate_parameter_types());
        // A non-boolean value does not enable validation.
        ctx.set_global(VALIDATE_PARAMETER_TYPES, Value::String("true".into()));
        assert!(!ctx.validate_parameter_types());
    }

    #[test]
    fn store_and_read_response() {
        let mut ctx = PipelineContext::new(HashMap::new());
        ctx.store_response("p1", "s1", PipelineStepResponse::new(Value::Integer(1)));
        assert!(ctx.has_pipeline_results("p1"));
        assert!(!ctx.has_pipeline_results("p2"));
        assert_eq!(
            ctx.response("p1", "s1").unwrap().primary(),
            &Value::Integer(1)
        );
        assert!(ctx.response("p1", "other").is_none());
    }

    #[test]
    fn in_memory_manager_round_trips_pipelines() {
        let manager = InMemoryPipelineManager::new(vec![pipeline("sub")]);
        assert!(manager.get_pipeline("sub").is_some());
        assert!(manager.get_pipeline("nope").is_none());
    }

    #[test]
    fn parameters_project_to_value() {
        let mut ctx = PipelineContext::new(HashMap::new());
        ctx.store_response("p1", "s1", PipelineStepResponse::new(Value::String("df".into())));
        let projected = ctx.parameters_as_value();
        assert_eq!(
            projected.get_path(["p1", "s1", "primaryReturn"]),
            &Value::String("df".into())
        );
    }

    #[test]
    fn snapshot_clone_is_independent() {
        let mut parent = PipelineContext::new(HashMap::new());
        parent.set_global("x", Value::Integer(42));
        let snapshot = parent.clone();
        parent.set_global("x", Value::Integer(0));
        assert_eq!(snapshot.global("x"), &Value::Integer(42));
    }
}
