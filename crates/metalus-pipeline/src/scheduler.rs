//! Execution plan scheduler: DAG-parallel dispatch of pipeline executions.
//!
//! Roots start immediately; a child starts only after every parent reached
//! a terminal state, and only when all of them completed. Each completed
//! parent's final globals and step responses are merged into the child's
//! globals under the parent's id before the child is spawned. A paused or
//! errored parent marks its transitive descendants skipped; running
//! siblings are never cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metalus_model::Pipeline;
use metalus_types::{
    Audit, AuditScope, AuditStatus, ExecutionStatus, MetalusError, Result, Value,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::PipelineContext;
use crate::executor::{PipelineExecutor, PipelineFlow};
use crate::registry::StepRegistry;

/// One node of the execution DAG: a chain of pipelines over one context.
#[derive(Debug, Clone)]
pub struct PipelineExecution {
    pub id: String,
    pub pipelines: Vec<Pipeline>,
    pub parents: Vec<String>,
    pub context: PipelineContext,
}

/// Terminal record of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// The final (immutable) context; absent for skipped executions.
    pub context: Option<PipelineContext>,
    /// Last observed step id for paused/errored executions.
    pub last_step: Option<String>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    fn skipped() -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            context: None,
            last_step: None,
            message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Outcome of a full plan run.
#[derive(Debug)]
pub struct PlanResult {
    /// `Complete` iff every execution completed; otherwise the first
    /// non-complete terminal status in topological order.
    pub status: ExecutionStatus,
    pub executions: HashMap<String, ExecutionResult>,
}

impl PlanResult {
    pub fn execution(&self, id: &str) -> Option<&ExecutionResult> {
        self.executions.get(id)
    }
}

/// A validated, runnable execution DAG.
pub struct ExecutionPlan {
    executions: Vec<PipelineExecution>,
    registry: Arc<StepRegistry>,
    max_workers: usize,
    topo_order: Vec<String>,
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("executions", &self.executions)
            .field("max_workers", &self.max_workers)
            .field("topo_order", &self.topo_order)
            .finish()
    }
}

impl ExecutionPlan {
    /// Validate the DAG (unique ids, known parents, acyclicity) and compute
    /// the topological order used for outcome reporting.
    pub fn new(
        executions: Vec<PipelineExecution>,
        registry: Arc<StepRegistry>,
        max_workers: usize,
    ) -> Result<Self> {
        let mut ids = HashMap::new();
        for (index, execution) in executions.iter().enumerate() {
            if ids.insert(execution.id.clone(), index).is_some() {
                return Err(MetalusError::Config(format!(
                    "duplicate execution id '{}'",
                    execution.id
                )));
            }
        }
        for execution in &executions {
            for parent in &execution.parents {
                if !ids.contains_key(parent) {
                    return Err(MetalusError::Config(format!(
                        "execution '{}' references unknown parent '{}'",
                        execution.id, parent
                    )));
                }
            }
        }

        let topo_order = topological_order(&executions)?;

        Ok(Self {
            executions,
            registry,
            max_workers: max_workers.max(1),
            topo_order,
        })
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn executions(&self) -> &[PipelineExecution] {
        &self.executions
    }

    pub fn topological_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Run the plan to its terminal state.
    pub async fn run(&self) -> Result<PlanResult> {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut remaining: HashMap<String, usize> = HashMap::new();
        let mut contexts: HashMap<String, PipelineContext> = HashMap::new();
        let by_id: HashMap<String, &PipelineExecution> = self
            .executions
            .iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        for execution in &self.executions {
            remaining.insert(execution.id.clone(), execution.parents.len());
            contexts.insert(execution.id.clone(), execution.context.clone());
            for parent in &execution.parents {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(execution.id.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut results: HashMap<String, ExecutionResult> = HashMap::new();

        for execution in self.executions.iter().filter(|e| e.parents.is_empty()) {
            self.spawn_execution(execution, &mut contexts, &semaphore, &mut join_set);
        }

        while let Some(joined) = join_set.join_next().await {
            let task = joined.map_err(|join_err| MetalusError::Fatal {
                step_id: "execution".into(),
                message: format!("execution task panicked: {join_err}"),
            })?;

            let id = task.id.clone();
            let result = record_result(task);
            let completed = result.status.is_complete();
            tracing::info!(execution = %id, status = ?result.status, "Execution finished");

            if completed {
                let (final_globals, final_parameters) = match &result.context {
                    Some(ctx) => (ctx.globals.clone(), ctx.parameters_as_value()),
                    None => (HashMap::new(), Value::None),
                };
                results.insert(id.clone(), result);

                for child_id in children.get(&id).cloned().unwrap_or_default() {
                    if results.contains_key(&child_id) {
                        // Already skipped through another parent.
                        continue;
                    }
                    if let Some(child_ctx) = contexts.get_mut(&child_id) {
                        child_ctx.set_global(
                            id.clone(),
                            Value::map([
                                (
                                    "globals".to_string(),
                                    Value::Map(final_globals.clone()),
                                ),
                                (
                                    "pipelineParameters".to_string(),
                                    final_parameters.clone(),
                                ),
                            ]),
                        );
                    }
                    let counter = remaining.entry(child_id.clone()).or_insert(0);
                    *counter = counter.saturating_sub(1);
                    if *counter == 0 {
                        if let Some(child) = by_id.get(&child_id) {
                            self.spawn_execution(child, &mut contexts, &semaphore, &mut join_set);
                        }
                    }
                }
            } else {
                results.insert(id.clone(), result);
                // Mark every transitive descendant skipped; none has started.
                let mut stack = children.get(&id).cloned().unwrap_or_default();
                while let Some(descendant) = stack.pop() {
                    if results.contains_key(&descendant) {
                        continue;
                    }
                    tracing::warn!(execution = %descendant, "Skipping execution: parent did not complete");
                    results.insert(descendant.clone(), ExecutionResult::skipped());
                    stack.extend(children.get(&descendant).cloned().unwrap_or_default());
                }
            }
        }

        let status = self
            .topo_order
            .iter()
            .filter_map(|id| results.get(id))
            .map(|r| r.status)
            .find(|s| !s.is_complete())
            .unwrap_or(ExecutionStatus::Complete);

        Ok(PlanResult {
            status,
            executions: results,
        })
    }

    fn spawn_execution(
        &self,
        execution: &PipelineExecution,
        contexts: &mut HashMap<String, PipelineContext>,
        semaphore: &Arc<Semaphore>,
        join_set: &mut JoinSet<TaskResult>,
    ) {
        let id = execution.id.clone();
        let pipelines = execution.pipelines.clone();
        let context = contexts
            .remove(&id)
            .unwrap_or_else(|| execution.context.clone());
        let registry = self.registry.clone();
        let semaphore = semaphore.clone();

        join_set.spawn(async move {
            // Bounded worker pool: hold a permit for the whole execution.
            let _permit = semaphore.acquire_owned().await;
            let started = Utc::now();
            tracing::info!(execution = %id, "Execution started");

            let executor = PipelineExecutor::new(registry);
            let mut context = context;
            let flow = executor.execute_chain(&pipelines, &mut context).await;
            let completed = Utc::now();

            TaskResult {
                id,
                flow,
                context,
                started,
                completed,
            }
        });
    }
}

struct TaskResult {
    id: String,
    flow: Result<PipelineFlow>,
    context: PipelineContext,
    started: DateTime<Utc>,
    completed: DateTime<Utc>,
}

fn record_result(task: TaskResult) -> ExecutionResult {
    let TaskResult {
        id,
        flow,
        mut context,
        started,
        completed,
    } = task;

    let (status, last_step, message) = match flow {
        Ok(PipelineFlow::Complete) => (ExecutionStatus::Complete, None, None),
        Ok(PipelineFlow::Paused { step_id, message }) => {
            (ExecutionStatus::Paused, Some(step_id), Some(message))
        }
        Ok(PipelineFlow::Errored { step_id, message }) => {
            (ExecutionStatus::Errored, Some(step_id), Some(message))
        }
        Err(MetalusError::Fatal { step_id, message }) => {
            (ExecutionStatus::Errored, Some(step_id), Some(message))
        }
        Err(err) => (ExecutionStatus::Errored, None, Some(err.to_string())),
    };

    let audit_status = match status {
        ExecutionStatus::Complete => AuditStatus::Complete,
        ExecutionStatus::Paused => AuditStatus::Paused,
        _ => AuditStatus::Errored,
    };
    context.add_audit(Audit::record(AuditScope::Execution, &id, audit_status, started));

    ExecutionResult {
        status,
        context: Some(context),
        last_step,
        message,
        started_at: Some(started),
        completed_at: Some(completed),
    }
}

/// Kahn's algorithm over the parent edges; leftovers mean a cycle.
fn topological_order(executions: &[PipelineExecution]) -> Result<Vec<String>> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

    for execution in executions {
        indegree.entry(&execution.id).or_insert(0);
        for parent in &execution.parents {
            *indegree.entry(&execution.id).or_insert(0) += 1;
            children
                .entry(parent.as_str())
                .or_default()
                .push(&execution.id);
        }
    }

    // Deterministic order among ready nodes.
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(executions.len());
    while let Some(id) = ready.pop() {
        order.push(id.to_string());
        for child in children.get(id).cloned().unwrap_or_default() {
            let degree = indegree.entry(child).or_insert(0);
            *degree -= 1;
            if *degree == 0 {
                ready.push(child);
                ready.sort_unstable();
            }
        }
    }

    if order.len() != executions.len() {
        let stuck = executions
            .iter()
            .find(|e| !order.contains(&e.id))
            .map(|e| e.id.clone())
            .unwrap_or_default();
        return Err(MetalusError::CycleDetected { execution_id: stuck });
    }

    Ok(order)
}
