//! Step-group execution: a step whose body is an embedded pipeline run in
//! an isolated child context.
//!
//! The child's entire globals are the resolved `pipelineMappings` map (no
//! merge with the parent); its parameters start empty; managers and the
//! step package list are inherited. On completion the child context is
//! projected into the outer step's response. A pause or error in the child
//! becomes a pause or error of the outer step.

use std::collections::HashMap;

use metalus_model::{Pipeline, PipelineStep};
use metalus_types::{MetalusError, PipelineStepResponse, Result, StepOutcome, Value};

use crate::context::PipelineContext;
use crate::executor::{PipelineExecutor, PipelineFlow};

pub(crate) async fn run_step_group(
    executor: &PipelineExecutor,
    step: &PipelineStep,
    context: &mut PipelineContext,
) -> Result<StepOutcome> {
    let pipeline = locate_pipeline(step, context)?;
    let mappings = resolve_mappings(step, context)?;

    let mut child = PipelineContext {
        globals: mappings,
        parameters: HashMap::new(),
        current_pipeline_id: None,
        step_packages: context.step_packages.clone(),
        pipeline_manager: context.pipeline_manager.clone(),
        security_manager: context.security_manager.clone(),
        listener: context.listener.clone(),
        parameter_mapper: context.parameter_mapper.clone(),
        audits: Vec::new(),
    };

    // `execute_pipeline` already returns a boxed future, breaking the
    // async recursion back into the executor.
    let result = executor.execute_pipeline(&pipeline, &mut child).await;
    context.audits.append(&mut child.audits);

    match result? {
        PipelineFlow::Complete => Ok(StepOutcome::Response(project_result(&pipeline, &child))),
        PipelineFlow::Paused { message, .. } => Ok(StepOutcome::Pause(message)),
        PipelineFlow::Errored { message, .. } => Ok(StepOutcome::Fail(message)),
    }
}

/// Find the embedded pipeline: an inline `pipeline` parameter (map or
/// expression), a `pipelineId` parameter resolved through the manager, or
/// an inline pipeline on `engineMeta`.
fn locate_pipeline(step: &PipelineStep, context: &PipelineContext) -> Result<Pipeline> {
    if let Some(param) = step.param("pipeline") {
        let value = match &param.value {
            // Inline maps are pipeline data, not expressions; deserialize
            // them untouched so child-side mappings stay unresolved.
            Some(map @ Value::Map(_)) => map.clone(),
            _ => context.parameter_mapper.map_parameter(param, context)?,
        };
        return pipeline_from_value(&step.id, value);
    }

    if let Some(param) = step.param("pipelineId") {
        let value = context.parameter_mapper.map_parameter(param, context)?;
        let Some(pipeline_id) = value.as_str() else {
            return Err(MetalusError::Mapping {
                target: format!("{}.pipelineId", step.id),
                message: format!("resolved to {}, expected a string", value.kind()),
            });
        };
        return context
            .pipeline_manager
            .get_pipeline(pipeline_id)
            .ok_or_else(|| MetalusError::UnknownPipeline {
                pipeline_id: pipeline_id.to_string(),
            });
    }

    if let Some(inline) = step.engine_meta.as_ref().and_then(|m| m.pipeline.clone()) {
        return Ok(inline);
    }

    Err(MetalusError::Config(format!(
        "step-group '{}' references no pipeline",
        step.id
    )))
}

fn pipeline_from_value(step_id: &str, value: Value) -> Result<Pipeline> {
    let json = match value {
        Value::Object { fields, .. } => Value::Map(fields).to_json(),
        map @ Value::Map(_) => map.to_json(),
        other => {
            return Err(MetalusError::Mapping {
                target: format!("{step_id}.pipeline"),
                message: format!("resolved to {}, expected a pipeline", other.kind()),
            })
        }
    };
    serde_json::from_value(json).map_err(|err| MetalusError::Mapping {
        target: format!("{step_id}.pipeline"),
        message: format!("not a valid pipeline: {err}"),
    })
}

/// The child's `pipelineMappings` parameter is its entire globals map.
fn resolve_mappings(
    step: &PipelineStep,
    context: &PipelineContext,
) -> Result<HashMap<String, Value>> {
    match step.param("pipelineMappings") {
        Some(param) => {
            let value = context.parameter_mapper.map_parameter(param, context)?;
            match value {
                Value::Map(entries) => Ok(entries),
                Value::None => Ok(HashMap::new()),
                other => Err(MetalusError::Mapping {
                    target: format!("{}.pipelineMappings", step.id),
                    message: format!("resolved to {}, expected a map", other.kind()),
                }),
            }
        }
        None => Ok(HashMap::new()),
    }
}

/// Project the completed child context into the outer step's response:
/// primary = the designated `stepGroupResult` step's primary (or the whole
/// child parameters map), named = child step id -> primary return.
fn project_result(pipeline: &Pipeline, child: &PipelineContext) -> PipelineStepResponse {
    let empty = HashMap::new();
    let steps = child.parameters.get(&pipeline.id).unwrap_or(&empty);

    let named: HashMap<String, Value> = steps
        .iter()
        .map(|(step_id, response)| (step_id.clone(), response.primary().clone()))
        .collect();

    let primary = match &pipeline.step_group_result {
        Some(result_step) => steps
            .get(result_step)
            .map(|response| response.primary().clone())
            .unwrap_or(Value::None),
        None => child.parameters_as_value(),
    };

    PipelineStepResponse::with_named(primary, named)
}
