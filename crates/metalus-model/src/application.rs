//! The application envelope: globals, the pipeline library, the execution
//! DAG, and plan-level component descriptors.

use std::collections::{HashMap, HashSet};

use metalus_types::{MetalusError, Result, Value};
use serde::{Deserialize, Serialize};

use crate::pipeline::Pipeline;

/// A `{ className, parameters }` descriptor naming a pluggable component
/// (listener, security manager, or step mapper).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRef {
    pub class_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<HashMap<String, Value>>,
}

/// One node of the execution DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDef {
    pub id: String,
    /// References into the application's pipeline library.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_ids: Option<Vec<String>>,
    /// Inline pipelines, executed in order ("chaining").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipelines: Option<Vec<Pipeline>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub globals: Option<HashMap<String, Value>>,
    /// Pre-seeded step results: pipelineId -> stepId -> value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_parameters: Option<HashMap<String, HashMap<String, Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_listener: Option<ComponentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_manager: Option<ComponentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_mapper: Option<ComponentRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub globals: Option<HashMap<String, Value>>,
    pub executions: Vec<ExecutionDef>,
    /// Shared pipeline library referenced by `pipelineIds`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipelines: Option<Vec<Pipeline>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_listener: Option<ComponentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_manager: Option<ComponentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_mapper: Option<ComponentRef>,
    /// Opaque runtime configuration, carried through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spark_conf: Option<Value>,
}

impl Application {
    /// Look up a library pipeline by id.
    pub fn library_pipeline(&self, id: &str) -> Option<&Pipeline> {
        self.pipelines
            .as_ref()
            .and_then(|ps| ps.iter().find(|p| p.id == id))
    }

    /// Structural validation: at least one execution, unique execution ids,
    /// known parents, resolvable pipeline references, and valid pipelines.
    pub fn validate(&self) -> Result<()> {
        if self.executions.is_empty() {
            return Err(MetalusError::Config(
                "application declares no executions".into(),
            ));
        }

        let mut ids = HashSet::new();
        for exec in &self.executions {
            if !ids.insert(exec.id.as_str()) {
                return Err(MetalusError::Config(format!(
                    "duplicate execution id '{}'",
                    exec.id
                )));
            }
        }

        for exec in &self.executions {
            for parent in &exec.parents {
                if !ids.contains(parent.as_str()) {
                    return Err(MetalusError::Config(format!(
                        "execution '{}' references unknown parent '{}'",
                        exec.id, parent
                    )));
                }
            }

            let has_refs = exec
                .pipeline_ids
                .as_ref()
                .is_some_and(|ids| !ids.is_empty());
            let has_inline = exec.pipelines.as_ref().is_some_and(|ps| !ps.is_empty());
            if !has_refs && !has_inline {
                return Err(MetalusError::Config(format!(
                    "execution '{}' has no pipelines",
                    exec.id
                )));
            }

            if let Some(refs) = &exec.pipeline_ids {
                for pipeline_id in refs {
                    if self.library_pipeline(pipeline_id).is_none() {
                        return Err(MetalusError::UnknownPipeline {
                            pipeline_id: pipeline_id.clone(),
                        });
                    }
                }
            }
            if let Some(inline) = &exec.pipelines {
                for pipeline in inline {
                    pipeline.validate()?;
                }
            }
        }

        if let Some(library) = &self.pipelines {
            for pipeline in library {
                pipeline.validate()?;
            }
        }

        Ok(())
    }
}

/// Parse and structurally validate an application document.
pub fn parse_application(json: &str) -> Result<Application> {
    let application: Application = serde_json::from_str(json)?;
    application.validate()?;
    Ok(application)
}
