//! The default parameter mapper: evaluates sigil expressions and
//! descriptors against a pipeline context.
//!
//! Resolution is pure — the same parameter against an unchanged context
//! yields the same value — and every final argument passes through the
//! context's security manager.

use std::collections::HashMap;
use std::sync::Arc;

use metalus_model::{Parameter, Pipeline};
use metalus_types::{MetalusError, Result, Value};

use crate::context::{ParameterMapper, PipelineContext};
use crate::expression::{contains_template, parse_mapping, parse_template, MappingExpr, Sigil, TemplatePart};
use crate::registry::StepRegistry;

/// Sigil-expression resolver backed by the step registry (for typed-object
/// projection).
#[derive(Default)]
pub struct DefaultParameterMapper {
    registry: Arc<StepRegistry>,
}

impl DefaultParameterMapper {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve any configuration value: strings are evaluated as
    /// expressions or templates, maps may be typed-object or list
    /// descriptors, and containers resolve leaf-by-leaf.
    pub fn resolve_value(&self, value: &Value, context: &PipelineContext) -> Result<Value> {
        match value {
            Value::String(s) => self.resolve_string(s, context),
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, context))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Map(entries) => self.resolve_map(entries, context),
            other => Ok(other.clone()),
        }
    }

    fn resolve_map(
        &self,
        entries: &HashMap<String, Value>,
        context: &PipelineContext,
    ) -> Result<Value> {
        // Typed-object descriptor: { className, object }.
        if let (Some(Value::String(class_name)), Some(object)) =
            (entries.get("className"), entries.get("object"))
        {
            let resolved = self.resolve_value(object, context)?;
            return match resolved {
                Value::Map(fields) => self.registry.construct(class_name, &fields),
                other => Err(MetalusError::Mapping {
                    target: class_name.clone(),
                    message: format!("object payload resolved to {}, expected a map", other.kind()),
                }),
            };
        }

        // List descriptor: { value: [...] } with optional element className.
        if let Some(Value::List(items)) = entries.get("value") {
            let class_name = match entries.get("className") {
                Some(Value::String(c)) => Some(c.as_str()),
                _ => None,
            };
            let resolved = items
                .iter()
                .map(|item| {
                    let value = self.resolve_value(item, context)?;
                    match (class_name, value) {
                        (Some(class), Value::Map(fields)) => {
                            self.registry.construct(class, &fields)
                        }
                        (_, value) => Ok(value),
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Value::List(resolved));
        }

        // Plain map: resolve every leaf.
        Ok(Value::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, context)?)))
                .collect::<Result<HashMap<_, _>>>()?,
        ))
    }

    fn resolve_string(&self, text: &str, context: &PipelineContext) -> Result<Value> {
        // Whole-value form: a sigil as the first character.
        if let Some(expr) = parse_mapping(text) {
            return self.evaluate(&expr, context);
        }

        if contains_template(text) {
            let mut rendered = String::new();
            for part in parse_template(text) {
                match part {
                    TemplatePart::Literal(literal) => rendered.push_str(&literal),
                    TemplatePart::Expr(expr) => {
                        let value = self.evaluate(&expr, context)?;
                        if value.is_scalar() || value.is_none() {
                            rendered.push_str(&value.to_display_string());
                        } else {
                            // Concatenation cannot produce objects; keep the
                            // literal text.
                            tracing::warn!(
                                expression = %expr.to_source(),
                                kind = %value.kind(),
                                "embedded expression resolved to a non-scalar; leaving literal"
                            );
                            rendered.push_str("${");
                            rendered.push_str(&expr.to_source());
                            rendered.push('}');
                        }
                    }
                }
            }
            return Ok(Value::String(rendered));
        }

        Ok(Value::String(text.to_string()))
    }

    fn evaluate(&self, expr: &MappingExpr, context: &PipelineContext) -> Result<Value> {
        match expr.sigil {
            Sigil::Global => {
                let base = context.global(&expr.segments[0]);
                Ok(base
                    .get_path(expr.segments[1..].iter().map(String::as_str))
                    .clone())
            }
            Sigil::Response | Sigil::Primary | Sigil::Named => {
                self.evaluate_response(expr, context)
            }
            Sigil::ManagedPipeline => {
                let value = match context.pipeline_manager.get_pipeline(&expr.segments[0]) {
                    Some(pipeline) => pipeline_to_value(&pipeline),
                    None => Value::None,
                };
                Ok(value
                    .get_path(expr.segments[1..].iter().map(String::as_str))
                    .clone())
            }
        }
    }

    /// `$`/`@`/`#` addressing: `stepId[.path]` within the current pipeline,
    /// or `pipelineId.stepId[.path]` when the first segment names a pipeline
    /// with recorded results.
    fn evaluate_response(&self, expr: &MappingExpr, context: &PipelineContext) -> Result<Value> {
        let (pipeline_id, step_id, path_start) =
            if expr.segments.len() >= 2 && context.has_pipeline_results(&expr.segments[0]) {
                (expr.segments[0].clone(), expr.segments[1].clone(), 2)
            } else {
                let current = context.current_pipeline_id.clone().unwrap_or_default();
                (current, expr.segments[0].clone(), 1)
            };

        let Some(response) = context.response(&pipeline_id, &step_id) else {
            return Ok(Value::None);
        };

        let base = match expr.sigil {
            Sigil::Response => response.as_value(),
            Sigil::Primary => response.primary().clone(),
            Sigil::Named => match &response.named_returns {
                Some(named) => Value::Map(named.clone()),
                None => Value::None,
            },
            _ => unreachable!(),
        };

        Ok(base
            .get_path(expr.segments[path_start..].iter().map(String::as_str))
            .clone())
    }
}

/// Serialize a managed pipeline into the value universe as a typed object.
fn pipeline_to_value(pipeline: &Pipeline) -> Value {
    match serde_json::to_value(pipeline).map(Value::from_json) {
        Ok(Value::Map(fields)) => Value::Object {
            class_name: "Pipeline".to_string(),
            fields,
        },
        _ => Value::None,
    }
}

impl ParameterMapper for DefaultParameterMapper {
    fn map_parameter(&self, parameter: &Parameter, context: &PipelineContext) -> Result<Value> {
        let mut value = match &parameter.value {
            Some(v) => self.resolve_value(v, context)?,
            None => Value::None,
        };

        if value.is_none() {
            if let Some(default) = &parameter.default_value {
                value = self.resolve_value(default, context)?;
            }
        }

        // Parameter-level projection into a declared class.
        if let Some(class_name) = &parameter.class_name {
            if let Value::Map(fields) = &value {
                value = self.registry.construct(class_name, fields)?;
            }
        }

        if parameter.required.unwrap_or(false) && value.is_none() {
            return Err(MetalusError::Mapping {
                target: parameter.name.clone(),
                message: "no value produced for required parameter".into(),
            });
        }

        Ok(context.security_manager.secure_parameter(value))
    }
}
