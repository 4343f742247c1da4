//! Pipeline, step, and parameter definitions.

use std::collections::HashSet;

use metalus_types::{MetalusError, Result, Value};
use serde::{Deserialize, Serialize};

/// How the executor interprets a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    /// Plain step: invoke the body, follow `nextStepId`.
    Pipeline,
    /// Routing step: the primary return selects the next step by parameter
    /// name.
    Branch,
    /// A step whose body is an embedded pipeline run in isolation.
    StepGroup,
    /// Runs the region up to the matching join once per element of its
    /// `forkByValues` list.
    Fork,
    /// Merge point of a fork region.
    Join,
}

/// Declared kind of a step parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Text,
    Script,
    Object,
    List,
    Result,
}

/// One declared step input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub parameter_type: Option<ParameterType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Parameter {
            name: name.into(),
            parameter_type: None,
            value: Some(value),
            class_name: None,
            default_value: None,
            required: None,
        }
    }

    /// Routing parameters carry branch targets, never step arguments.
    pub fn is_result(&self) -> bool {
        self.parameter_type == Some(ParameterType::Result)
    }
}

/// The `Object.function` reference (or inline pipeline) a step executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Parameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_meta: Option<EngineMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_if_empty: Option<Parameter>,
}

impl PipelineStep {
    pub fn step_type(&self) -> StepType {
        self.step_type.unwrap_or(StepType::Pipeline)
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    /// The `Object.function` reference this step executes, if any.
    pub fn command(&self) -> Option<&str> {
        self.engine_meta.as_ref().and_then(|m| m.command.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineCategory {
    Pipeline,
    StepGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<PipelineCategory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<PipelineStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_group_result: Option<String>,
}

impl Pipeline {
    pub fn category(&self) -> PipelineCategory {
        self.category.unwrap_or(PipelineCategory::Pipeline)
    }

    pub fn step(&self, id: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn first_step(&self) -> Option<&PipelineStep> {
        self.steps.first()
    }

    /// Structural validation: at least one step, unique step ids, and every
    /// referenced next-step (including branch targets) present.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(MetalusError::Config(format!(
                "pipeline '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(MetalusError::Config(format!(
                    "pipeline '{}' has duplicate step id '{}'",
                    self.id, step.id
                )));
            }
        }

        for step in &self.steps {
            if let Some(next) = &step.next_step_id {
                if self.step(next).is_none() {
                    return Err(MetalusError::UnknownStep {
                        pipeline_id: self.id.clone(),
                        step_id: next.clone(),
                    });
                }
            }
            if step.step_type() == StepType::Branch {
                for param in step.params.iter().filter(|p| p.is_result()) {
                    if let Some(Value::String(target)) = &param.value {
                        if self.step(target).is_none() {
                            return Err(MetalusError::UnknownStep {
                                pipeline_id: self.id.clone(),
                                step_id: target.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, next: Option<&str>) -> PipelineStep {
        PipelineStep {
            id: id.into(),
            display_name: None,
            description: None,
            step_type: None,
            params: Vec::new(),
            engine_meta: None,
            next_step_id: next.map(String::from),
            execute_if_empty: None,
        }
    }

    fn pipeline(steps: Vec<PipelineStep>) -> Pipeline {
        Pipeline {
            id: "p1".into(),
            name: Some("Test".into()),
            category: None,
            steps,
            step_group_result: None,
        }
    }

    #[test]
    fn parses_camel_case_step_json() {
        let json = r#"{
            "id": "load",
            "displayName": "Load Data",
            "type": "branch",
            "params": [
                { "name": "path", "type": "text", "value": "!inputPath" },
                { "name": "done", "type": "result", "value": "finish" }
            ],
            "engineMeta": { "command": "InputSteps.load" },
            "nextStepId": "transform"
        }"#;
        let step: PipelineStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.step_type(), StepType::Branch);
        assert_eq!(step.command(), Some("InputSteps.load"));
        assert_eq!(step.next_step_id.as_deref(), Some("transform"));
        assert!(step.param("done").unwrap().is_result());
        assert!(!step.param("path").unwrap().is_result());
    }

    #[test]
    fn step_type_defaults_to_pipeline() {
        assert_eq!(step("s", None).step_type(), StepType::Pipeline);
    }

    #[test]
    fn step_group_type_uses_kebab_case() {
        let parsed: StepType = serde_json::from_str("\"step-group\"").unwrap();
        assert_eq!(parsed, StepType::StepGroup);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"step-group\"");
    }

    #[test]
    fn validate_accepts_linear_pipeline() {
        let p = pipeline(vec![step("a", Some("b")), step("b", None)]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_pipeline() {
        let p = pipeline(Vec::new());
        assert!(matches!(p.validate(), Err(MetalusError::Config(_))));
    }

    #[test]
    fn validate_rejects_duplicate_step_ids() {
        let p = pipeline(vec![step("a", None), step("a", None)]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'a'"));
    }

    #[test]
    fn validate_rejects_unknown_next_step() {
        let p = pipeline(vec![step("a", Some("ghost"))]);
        assert!(matches!(
            p.validate(),
            Err(MetalusError::UnknownStep { step_id, .. }) if step_id == "ghost"
        ));
    }

    #[test]
    fn validate_rejects_unknown_branch_target() {
        let mut branch = step("decide", None);
        branch.step_type = Some(StepType::Branch);
        branch.params.push(Parameter {
            name: "left".into(),
            parameter_type: Some(ParameterType::Result),
            value: Some(Value::String("ghost".into())),
            class_name: None,
            default_value: None,
            required: None,
        });
        let p = pipeline(vec![branch, step("finish", None)]);
        assert!(matches!(p.validate(), Err(MetalusError::UnknownStep { .. })));
    }

    #[test]
    fn pipeline_round_trips_without_noise() {
        let json = serde_json::json!({
            "id": "p1",
            "name": "Round Trip",
            "steps": [
                { "id": "only", "params": [{ "name": "x", "value": 1 }] }
            ]
        });
        let p: Pipeline = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&p).unwrap(), json);
    }
}
