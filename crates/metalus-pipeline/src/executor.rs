//! Pipeline executor — the step-graph traversal loop.
//!
//! A pipeline run produces a three-way [`PipelineFlow`]: complete, paused,
//! or errored. Pause and error are structured results flowing out of step
//! bodies; only fatal failures propagate as `Err` and abort the owning
//! execution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use metalus_model::{Parameter, Pipeline, PipelineStep, StepType};
use metalus_types::{
    Audit, AuditScope, AuditStatus, MetalusError, PipelineStepResponse, Result, StepOutcome, Value,
};

use crate::context::PipelineContext;
use crate::registry::StepRegistry;
use crate::step_group;

/// Terminal state of a single pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineFlow {
    Complete,
    Paused { step_id: String, message: String },
    Errored { step_id: String, message: String },
}

/// Result of running one step body to completion.
enum SingleOutcome {
    Done(PipelineStepResponse),
    Stop(PipelineFlow),
}

/// What the traversal loop does after a step.
enum StepRun {
    Advance(Option<String>),
    Stop(PipelineFlow),
}

pub struct PipelineExecutor {
    registry: Arc<StepRegistry>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Run an execution's pipelines sequentially over one context. A
    /// paused or errored pipeline stops the chain at that point.
    pub async fn execute_chain(
        &self,
        pipelines: &[Pipeline],
        context: &mut PipelineContext,
    ) -> Result<PipelineFlow> {
        for pipeline in pipelines {
            match self.execute_pipeline(pipeline, context).await? {
                PipelineFlow::Complete => {}
                stop => return Ok(stop),
            }
        }
        Ok(PipelineFlow::Complete)
    }

    /// Run a single pipeline's step graph.
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) to break
    /// the Send-inference cycle created by the indirect recursion through
    /// `step_group::run_step_group`, which itself boxes a call back into
    /// this method.
    pub fn execute_pipeline<'a>(
        &'a self,
        pipeline: &'a Pipeline,
        context: &'a mut PipelineContext,
    ) -> Pin<Box<dyn Future<Output = Result<PipelineFlow>> + Send + 'a>> {
        Box::pin(async move {
        pipeline.validate()?;
        context.current_pipeline_id = Some(pipeline.id.clone());

        let listener = context.listener.clone();
        let started = Utc::now();
        listener.pipeline_started(&pipeline.id);

        let mut current = pipeline.first_step();
        let flow = loop {
            let Some(step) = current else {
                break PipelineFlow::Complete;
            };
            match self.run_step(pipeline, step, context).await? {
                StepRun::Advance(None) => break PipelineFlow::Complete,
                StepRun::Advance(Some(next_id)) => {
                    current = pipeline.step(&next_id);
                    if current.is_none() {
                        return Err(MetalusError::UnknownStep {
                            pipeline_id: pipeline.id.clone(),
                            step_id: next_id,
                        });
                    }
                }
                StepRun::Stop(flow) => break flow,
            }
        };

        let status = match &flow {
            PipelineFlow::Complete => AuditStatus::Complete,
            PipelineFlow::Paused { .. } => AuditStatus::Paused,
            PipelineFlow::Errored { .. } => AuditStatus::Errored,
        };
        context.add_audit(Audit::record(
            AuditScope::Pipeline,
            &pipeline.id,
            status,
            started,
        ));

        match &flow {
            PipelineFlow::Complete => listener.pipeline_finished(&pipeline.id),
            PipelineFlow::Paused { step_id, message } => {
                listener.pipeline_paused(&pipeline.id, step_id, message)
            }
            PipelineFlow::Errored { step_id, message } => {
                listener.pipeline_errored(&pipeline.id, step_id, message)
            }
        }

        Ok(flow)
        })
    }

    async fn run_step(
        &self,
        pipeline: &Pipeline,
        step: &PipelineStep,
        context: &mut PipelineContext,
    ) -> Result<StepRun> {
        match step.step_type() {
            StepType::Fork => self.run_fork(pipeline, step, context).await,
            // A join outside a fork region is a pass-through.
            StepType::Join => Ok(StepRun::Advance(step.next_step_id.clone())),
            _ => match self.run_single_step(pipeline, step, context).await? {
                SingleOutcome::Stop(flow) => Ok(StepRun::Stop(flow)),
                SingleOutcome::Done(response) => {
                    Ok(StepRun::Advance(next_step_id(step, &response)))
                }
            },
        }
    }

    /// Execute one step body: executeIfEmpty short-circuit, frozen argument
    /// vector, invocation, response storage, audits, listener callbacks.
    async fn run_single_step(
        &self,
        pipeline: &Pipeline,
        step: &PipelineStep,
        context: &mut PipelineContext,
    ) -> Result<SingleOutcome> {
        let listener = context.listener.clone();
        let started = Utc::now();

        if let Some(condition) = &step.execute_if_empty {
            let mapper = context.parameter_mapper.clone();
            let value = match mapper.map_parameter(condition, context) {
                Ok(v) => v,
                Err(err) if err.is_recoverable() => {
                    context.add_audit(Audit::record(
                        AuditScope::Step,
                        &step.id,
                        AuditStatus::Errored,
                        started,
                    ));
                    return Ok(SingleOutcome::Stop(PipelineFlow::Errored {
                        step_id: step.id.clone(),
                        message: err.to_string(),
                    }));
                }
                Err(err) => return Err(wrap_fatal(step, err)),
            };
            if !value.is_empty() {
                tracing::debug!(
                    pipeline = %pipeline.id,
                    step = %step.id,
                    "skipping step: executeIfEmpty produced a value"
                );
                let response = PipelineStepResponse::new(value);
                context.store_response(&pipeline.id, &step.id, response.clone());
                context.add_audit(Audit::record(
                    AuditScope::Step,
                    &step.id,
                    AuditStatus::Skipped,
                    started,
                ));
                listener.step_finished(&pipeline.id, &step.id, &response);
                return Ok(SingleOutcome::Done(response));
            }
        }

        listener.step_started(&pipeline.id, &step.id);

        match self.invoke_step(step, context).await {
            Ok(StepOutcome::Pause(message)) => {
                context.add_audit(Audit::record(
                    AuditScope::Step,
                    &step.id,
                    AuditStatus::Paused,
                    started,
                ));
                Ok(SingleOutcome::Stop(PipelineFlow::Paused {
                    step_id: step.id.clone(),
                    message,
                }))
            }
            Ok(StepOutcome::Fail(message)) => {
                context.add_audit(Audit::record(
                    AuditScope::Step,
                    &step.id,
                    AuditStatus::Errored,
                    started,
                ));
                Ok(SingleOutcome::Stop(PipelineFlow::Errored {
                    step_id: step.id.clone(),
                    message,
                }))
            }
            Ok(StepOutcome::Value(value)) => {
                let response = PipelineStepResponse::new(value);
                self.finish_step(pipeline, step, response, started, context)
            }
            Ok(StepOutcome::Response(response)) => {
                self.finish_step(pipeline, step, response, started, context)
            }
            Err(err) if err.is_recoverable() => {
                context.add_audit(Audit::record(
                    AuditScope::Step,
                    &step.id,
                    AuditStatus::Errored,
                    started,
                ));
                Ok(SingleOutcome::Stop(PipelineFlow::Errored {
                    step_id: step.id.clone(),
                    message: stop_message(&err),
                }))
            }
            Err(err) => Err(wrap_fatal(step, err)),
        }
    }

    fn finish_step(
        &self,
        pipeline: &Pipeline,
        step: &PipelineStep,
        response: PipelineStepResponse,
        started: chrono::DateTime<Utc>,
        context: &mut PipelineContext,
    ) -> Result<SingleOutcome> {
        context.store_response(&pipeline.id, &step.id, response.clone());
        context.add_audit(Audit::record(
            AuditScope::Step,
            &step.id,
            AuditStatus::Complete,
            started,
        ));
        context
            .listener
            .clone()
            .step_finished(&pipeline.id, &step.id, &response);
        Ok(SingleOutcome::Done(response))
    }

    /// Resolve the argument vector and invoke the step body (or the
    /// embedded pipeline for step-groups).
    async fn invoke_step(
        &self,
        step: &PipelineStep,
        context: &mut PipelineContext,
    ) -> Result<StepOutcome> {
        if step.step_type() == StepType::StepGroup {
            return step_group::run_step_group(self, step, context).await;
        }

        let command = step.command().ok_or_else(|| MetalusError::Config(format!(
            "step '{}' has no engine command",
            step.id
        )))?;

        let args = self.resolve_arguments(&step.params, context)?;
        let function = self.registry.resolve(&context.step_packages, command, &args)?;
        let args = self.registry.finalize_args(
            &function.signature(),
            args,
            context.validate_parameter_types(),
        )?;
        function.invoke(args, context).await
    }

    /// Resolve all non-routing parameters into the frozen argument vector
    /// the body observes.
    fn resolve_arguments(
        &self,
        params: &[Parameter],
        context: &PipelineContext,
    ) -> Result<HashMap<String, Value>> {
        let mapper = context.parameter_mapper.clone();
        let mut args = HashMap::new();
        for param in params.iter().filter(|p| !p.is_result()) {
            args.insert(param.name.clone(), mapper.map_parameter(param, context)?);
        }
        Ok(args)
    }

    /// Run a fork region: the steps between the fork and the matching join
    /// execute once per element of `forkByValues`, sequentially. Afterwards
    /// every region step's stored response is the list of its per-iteration
    /// primary returns.
    async fn run_fork(
        &self,
        pipeline: &Pipeline,
        fork_step: &PipelineStep,
        context: &mut PipelineContext,
    ) -> Result<StepRun> {
        let started = Utc::now();
        let mapper = context.parameter_mapper.clone();
        let param = fork_step.param("forkByValues").ok_or_else(|| {
            MetalusError::Config(format!(
                "fork step '{}' has no forkByValues parameter",
                fork_step.id
            ))
        })?;
        let elements = match mapper.map_parameter(param, context) {
            Ok(Value::List(items)) => items,
            Ok(other) => {
                return Ok(StepRun::Stop(PipelineFlow::Errored {
                    step_id: fork_step.id.clone(),
                    message: format!("forkByValues resolved to {}, expected a list", other.kind()),
                }))
            }
            Err(err) if err.is_recoverable() => {
                return Ok(StepRun::Stop(PipelineFlow::Errored {
                    step_id: fork_step.id.clone(),
                    message: stop_message(&err),
                }))
            }
            Err(err) => return Err(wrap_fatal(fork_step, err)),
        };

        // Grouped primaries per region step, in first-visit order.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
        let record = |order: &mut Vec<String>,
                      groups: &mut HashMap<String, Vec<Value>>,
                      step_id: &str,
                      value: Value| {
            if !groups.contains_key(step_id) {
                order.push(step_id.to_string());
            }
            groups.entry(step_id.to_string()).or_default().push(value);
        };

        let mut join_id: Option<String> = None;
        let mut iteration_tails: Vec<Value> = Vec::new();

        for element in &elements {
            context.store_response(
                &pipeline.id,
                &fork_step.id,
                PipelineStepResponse::new(element.clone()),
            );
            record(&mut order, &mut groups, &fork_step.id, element.clone());
            let mut tail = element.clone();

            let mut current_id = fork_step.next_step_id.clone();
            while let Some(id) = current_id {
                let step = pipeline.step(&id).ok_or_else(|| MetalusError::UnknownStep {
                    pipeline_id: pipeline.id.clone(),
                    step_id: id.clone(),
                })?;
                if step.step_type() == StepType::Join {
                    join_id = Some(id);
                    break;
                }
                if step.step_type() == StepType::Fork {
                    return Err(MetalusError::Config(format!(
                        "fork step '{}' is nested inside fork '{}'",
                        step.id, fork_step.id
                    )));
                }

                match self.run_single_step(pipeline, step, context).await? {
                    SingleOutcome::Stop(flow) => return Ok(StepRun::Stop(flow)),
                    SingleOutcome::Done(response) => {
                        tail = response.primary().clone();
                        record(&mut order, &mut groups, &step.id, tail.clone());
                        current_id = next_step_id(step, &response);
                    }
                }
            }
            iteration_tails.push(tail);
        }

        // Replace region responses with their grouped form.
        for step_id in &order {
            if let Some(values) = groups.remove(step_id) {
                context.store_response(
                    &pipeline.id,
                    step_id,
                    PipelineStepResponse::new(Value::List(values)),
                );
            }
        }
        context.add_audit(Audit::record(
            AuditScope::Step,
            &fork_step.id,
            AuditStatus::Complete,
            started,
        ));

        // Locate the join statically when no iteration ran.
        if join_id.is_none() && elements.is_empty() {
            let mut current_id = fork_step.next_step_id.clone();
            while let Some(id) = current_id {
                match pipeline.step(&id) {
                    Some(step) if step.step_type() == StepType::Join => {
                        join_id = Some(id);
                        break;
                    }
                    Some(step) => current_id = step.next_step_id.clone(),
                    None => break,
                }
            }
            context.store_response(
                &pipeline.id,
                &fork_step.id,
                PipelineStepResponse::new(Value::List(Vec::new())),
            );
        }

        match join_id {
            Some(id) => {
                let join_step = pipeline.step(&id).ok_or_else(|| MetalusError::UnknownStep {
                    pipeline_id: pipeline.id.clone(),
                    step_id: id.clone(),
                })?;
                context.store_response(
                    &pipeline.id,
                    &id,
                    PipelineStepResponse::new(Value::List(iteration_tails)),
                );
                Ok(StepRun::Advance(join_step.next_step_id.clone()))
            }
            None => Ok(StepRun::Advance(None)),
        }
    }
}

/// Compute the step following `step` once its response is known.
fn next_step_id(step: &PipelineStep, response: &PipelineStepResponse) -> Option<String> {
    match step.step_type() {
        StepType::Branch => {
            let Some(decision) = response.primary().as_str() else {
                tracing::warn!(step = %step.id, "branch primary return is not a string");
                return None;
            };
            match step.param(decision) {
                Some(param) => param.value.as_ref().and_then(Value::as_str).map(String::from),
                None => {
                    tracing::warn!(
                        step = %step.id,
                        %decision,
                        "no branch parameter matches the decision"
                    );
                    None
                }
            }
        }
        _ => step.next_step_id.clone(),
    }
}

/// Keep an already-fatal error intact; wrap anything else, re-raising the
/// underlying cause as the message.
fn wrap_fatal(step: &PipelineStep, err: MetalusError) -> MetalusError {
    match err {
        fatal @ MetalusError::Fatal { .. } => fatal,
        other => MetalusError::Fatal {
            step_id: step.id.clone(),
            message: other.to_string(),
        },
    }
}

fn stop_message(err: &MetalusError) -> String {
    match err {
        MetalusError::Step { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
