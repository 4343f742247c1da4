//! Shared types, errors, values, and step responses for the Metalus engine.
//!
//! This crate provides the foundational types used across all other Metalus
//! crates:
//! - `MetalusError` — unified error taxonomy
//! - `Value` — tagged variant spanning all configuration-carried data
//! - `PipelineStepResponse` — the canonical step return shape
//! - `StepOutcome` — three-way step body result (value, pause, fail)
//! - `ExecutionStatus` / `Audit` — terminal states and timing records

pub mod value;

pub use value::{Value, ValueKind};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unified error type for all Metalus subsystems.
#[derive(Debug, thiserror::Error)]
pub enum MetalusError {
    // === Configuration errors — surface at plan construction ===
    #[error("invalid application: {0}")]
    Config(String),

    #[error("no registered class '{class_name}'")]
    UnresolvedClass { class_name: String },

    #[error("cycle detected in execution plan involving '{execution_id}'")]
    CycleDetected { execution_id: String },

    #[error("pipeline '{pipeline_id}' references unknown step '{step_id}'")]
    UnknownStep {
        pipeline_id: String,
        step_id: String,
    },

    #[error("unknown pipeline '{pipeline_id}'")]
    UnknownPipeline { pipeline_id: String },

    #[error("no step registered for '{reference}' in packages {packages:?}")]
    UnknownStepFunction {
        reference: String,
        packages: Vec<String>,
    },

    // === Resolution errors — reported as step failure ===
    #[error("could not map '{target}': {message}")]
    Mapping { target: String, message: String },

    // === Step errors ===
    /// Recoverable structured stop raised by a step body. The pipeline
    /// enters its errored state; siblings keep running.
    #[error("step '{step_id}' stopped: {message}")]
    Step { step_id: String, message: String },

    /// Any other failure from a step body. Aborts the owning execution and
    /// skips its descendants.
    #[error("step '{step_id}' failed: {message}")]
    Fatal { step_id: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetalusError {
    /// Whether this error belongs to the configuration class and must stop
    /// the plan before any execution starts.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            MetalusError::Config(_)
                | MetalusError::UnresolvedClass { .. }
                | MetalusError::CycleDetected { .. }
                | MetalusError::UnknownStep { .. }
                | MetalusError::UnknownPipeline { .. }
                | MetalusError::UnknownStepFunction { .. }
        )
    }

    /// Whether a pipeline may absorb this error as a step-level failure
    /// (errored pipeline) rather than aborting the whole execution.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MetalusError::Step { .. } | MetalusError::Mapping { .. }
        )
    }
}

/// A convenience alias for `Result<T, MetalusError>`.
pub type Result<T> = std::result::Result<T, MetalusError>;

// ---------------------------------------------------------------------------
// PipelineStepResponse — the canonical step return shape
// ---------------------------------------------------------------------------

/// Result of a completed step: a primary return plus optional named
/// secondary returns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStepResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_return: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub named_returns: Option<HashMap<String, Value>>,
}

impl PipelineStepResponse {
    pub fn new(primary: Value) -> Self {
        Self {
            primary_return: Some(primary),
            named_returns: None,
        }
    }

    pub fn with_named(primary: Value, named: HashMap<String, Value>) -> Self {
        Self {
            primary_return: Some(primary),
            named_returns: Some(named),
        }
    }

    pub fn primary(&self) -> &Value {
        self.primary_return.as_ref().unwrap_or(&Value::NONE)
    }

    /// Project the response into the value universe so `$` expressions can
    /// traverse it: `{ "primaryReturn": …, "namedReturns": … }`.
    pub fn as_value(&self) -> Value {
        let mut entries = HashMap::new();
        entries.insert(
            "primaryReturn".to_string(),
            self.primary_return.clone().unwrap_or(Value::None),
        );
        entries.insert(
            "namedReturns".to_string(),
            match &self.named_returns {
                Some(named) => Value::Map(named.clone()),
                None => Value::None,
            },
        );
        Value::Map(entries)
    }
}

// ---------------------------------------------------------------------------
// StepOutcome — three-way step body result
// ---------------------------------------------------------------------------

/// What a step body hands back to the executor. Pause and fail are
/// first-class results, not thrown signals.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A plain value; wrapped as `PipelineStepResponse { primary_return:
    /// Some(value), named_returns: None }`. A body with nothing to return
    /// uses `Value(Value::None)`.
    Value(Value),
    /// A fully-formed response, passed through unchanged.
    Response(PipelineStepResponse),
    /// Structured stop: the pipeline pauses at this step.
    Pause(String),
    /// Structured stop: the pipeline errors at this step.
    Fail(String),
}

impl StepOutcome {
    /// Wrap the outcome into the stored response shape. Pause/fail carry no
    /// response and return `None`.
    pub fn into_response(self) -> Option<PipelineStepResponse> {
        match self {
            StepOutcome::Value(v) => Some(PipelineStepResponse::new(v)),
            StepOutcome::Response(r) => Some(r),
            StepOutcome::Pause(_) | StepOutcome::Fail(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus — terminal state of an execution (and of the plan)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Complete,
    Paused,
    Errored,
    Skipped,
}

impl ExecutionStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, ExecutionStatus::Complete)
    }
}

// ---------------------------------------------------------------------------
// Audits — timing records accumulated during a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditScope {
    Execution,
    Pipeline,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Complete,
    Skipped,
    Paused,
    Errored,
}

/// One timed lifecycle record. The executor stamps pipeline and step
/// audits; the scheduler stamps execution audits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub scope: AuditScope,
    pub id: String,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl Audit {
    /// Close out an audit that started at `started_at`, stamping now as the
    /// finish time.
    pub fn record(
        scope: AuditScope,
        id: impl Into<String>,
        status: AuditStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        Audit {
            scope,
            id: id.into(),
            status,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        }
    }
}
