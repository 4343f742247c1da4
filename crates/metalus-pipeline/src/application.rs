//! Plan materialization: turn a parsed application document plus driver
//! parameters into a runnable [`ExecutionPlan`].
//!
//! Reflective `className` instantiation is replaced by a registry of named
//! component factories: the application names a listener, security manager,
//! or step mapper by class name and the [`ProviderRegistry`] supplies the
//! implementation.

use std::collections::HashMap;
use std::sync::Arc;

use metalus_model::{Application, ComponentRef, Pipeline};
use metalus_types::{MetalusError, PipelineStepResponse, Result, Value};

use crate::context::{
    InMemoryPipelineManager, LoggingListener, ParameterMapper, PassthroughSecurity,
    PipelineContext, PipelineListener, PipelineManager, SecurityManager,
};
use crate::registry::StepRegistry;
use crate::resolver::DefaultParameterMapper;
use crate::scheduler::{ExecutionPlan, PipelineExecution};

/// Driver-only keys, stripped from the final globals after parse.
pub const RESERVED_GLOBALS: [&str; 3] = [
    "applicationJson",
    "applicationConfigPath",
    "applicationConfigurationLoader",
];

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

type ListenerFactory =
    Box<dyn Fn(&HashMap<String, Value>) -> Arc<dyn PipelineListener> + Send + Sync>;
type SecurityFactory =
    Box<dyn Fn(&HashMap<String, Value>) -> Arc<dyn SecurityManager> + Send + Sync>;
type MapperFactory =
    Box<dyn Fn(&HashMap<String, Value>, &Arc<StepRegistry>) -> Arc<dyn ParameterMapper> + Send + Sync>;

/// Named factories for the pluggable components an application can select
/// by `className`.
pub struct ProviderRegistry {
    listeners: HashMap<String, ListenerFactory>,
    security: HashMap<String, SecurityFactory>,
    mappers: HashMap<String, MapperFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            listeners: HashMap::new(),
            security: HashMap::new(),
            mappers: HashMap::new(),
        };
        registry.register_listener("LoggingListener", |_| Arc::new(LoggingListener));
        registry.register_security("PassthroughSecurity", |_| Arc::new(PassthroughSecurity));
        registry.register_mapper("DefaultParameterMapper", |_, steps| {
            Arc::new(DefaultParameterMapper::new(steps.clone()))
        });
        registry
    }

    pub fn register_listener<F>(&mut self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(&HashMap<String, Value>) -> Arc<dyn PipelineListener> + Send + Sync + 'static,
    {
        self.listeners.insert(class_name.into(), Box::new(factory));
    }

    pub fn register_security<F>(&mut self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(&HashMap<String, Value>) -> Arc<dyn SecurityManager> + Send + Sync + 'static,
    {
        self.security.insert(class_name.into(), Box::new(factory));
    }

    pub fn register_mapper<F>(&mut self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(&HashMap<String, Value>, &Arc<StepRegistry>) -> Arc<dyn ParameterMapper>
            + Send
            + Sync
            + 'static,
    {
        self.mappers.insert(class_name.into(), Box::new(factory));
    }

    pub fn resolve_listener(
        &self,
        descriptor: Option<&ComponentRef>,
    ) -> Result<Arc<dyn PipelineListener>> {
        match descriptor {
            None => Ok(Arc::new(LoggingListener)),
            Some(reference) => {
                let factory = self.listeners.get(&reference.class_name).ok_or_else(|| {
                    MetalusError::UnresolvedClass {
                        class_name: reference.class_name.clone(),
                    }
                })?;
                Ok(factory(reference.parameters.as_ref().unwrap_or(&HashMap::new())))
            }
        }
    }

    pub fn resolve_security(
        &self,
        descriptor: Option<&ComponentRef>,
    ) -> Result<Arc<dyn SecurityManager>> {
        match descriptor {
            None => Ok(Arc::new(PassthroughSecurity)),
            Some(reference) => {
                let factory = self.security.get(&reference.class_name).ok_or_else(|| {
                    MetalusError::UnresolvedClass {
                        class_name: reference.class_name.clone(),
                    }
                })?;
                Ok(factory(reference.parameters.as_ref().unwrap_or(&HashMap::new())))
            }
        }
    }

    pub fn resolve_mapper(
        &self,
        descriptor: Option<&ComponentRef>,
        steps: &Arc<StepRegistry>,
    ) -> Result<Arc<dyn ParameterMapper>> {
        match descriptor {
            None => Ok(Arc::new(DefaultParameterMapper::new(steps.clone()))),
            Some(reference) => {
                let factory = self.mappers.get(&reference.class_name).ok_or_else(|| {
                    MetalusError::UnresolvedClass {
                        class_name: reference.class_name.clone(),
                    }
                })?;
                Ok(factory(
                    reference.parameters.as_ref().unwrap_or(&HashMap::new()),
                    steps,
                ))
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Plan building
// ---------------------------------------------------------------------------

/// Knobs for plan materialization.
pub struct PlanOptions {
    pub max_workers: usize,
    pub step_packages: Vec<String>,
    /// Driver-supplied parameters, overlaid on the application globals.
    /// Reserved keys are stripped after the overlay.
    pub driver_params: HashMap<String, Value>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            step_packages: vec!["metalus".to_string()],
            driver_params: HashMap::new(),
        }
    }
}

/// Materialize an application into a runnable plan: seed per-execution
/// contexts, resolve component overrides, and validate the DAG.
pub fn build_plan(
    application: &Application,
    registry: Arc<StepRegistry>,
    providers: &ProviderRegistry,
    options: &PlanOptions,
) -> Result<ExecutionPlan> {
    application.validate()?;

    // Every pipeline (library + inline) is visible to the pipeline manager.
    let mut managed: Vec<Pipeline> = application.pipelines.clone().unwrap_or_default();
    for def in &application.executions {
        if let Some(inline) = &def.pipelines {
            managed.extend(inline.iter().cloned());
        }
    }
    let manager: Arc<dyn PipelineManager> = Arc::new(InMemoryPipelineManager::new(managed));

    let mut base_globals = application.globals.clone().unwrap_or_default();
    for (key, value) in &options.driver_params {
        base_globals.insert(key.clone(), value.clone());
    }
    for key in RESERVED_GLOBALS {
        base_globals.remove(key);
    }

    let default_listener = providers.resolve_listener(application.pipeline_listener.as_ref())?;
    let default_security = providers.resolve_security(application.security_manager.as_ref())?;
    let default_mapper =
        providers.resolve_mapper(application.step_mapper.as_ref(), &registry)?;

    let mut executions = Vec::with_capacity(application.executions.len());
    for def in &application.executions {
        let mut globals = base_globals.clone();
        if let Some(overrides) = &def.globals {
            for (key, value) in overrides {
                globals.insert(key.clone(), value.clone());
            }
        }

        let mut context = PipelineContext::new(globals);
        context.step_packages = options.step_packages.clone();
        context.pipeline_manager = manager.clone();
        context.listener = match &def.pipeline_listener {
            Some(reference) => providers.resolve_listener(Some(reference))?,
            None => default_listener.clone(),
        };
        context.security_manager = match &def.security_manager {
            Some(reference) => providers.resolve_security(Some(reference))?,
            None => default_security.clone(),
        };
        context.parameter_mapper = match &def.step_mapper {
            Some(reference) => providers.resolve_mapper(Some(reference), &registry)?,
            None => default_mapper.clone(),
        };

        if let Some(preseed) = &def.pipeline_parameters {
            for (pipeline_id, steps) in preseed {
                for (step_id, value) in steps {
                    context.store_response(
                        pipeline_id,
                        step_id,
                        PipelineStepResponse::new(value.clone()),
                    );
                }
            }
        }

        let pipelines: Vec<Pipeline> = match &def.pipeline_ids {
            Some(refs) if !refs.is_empty() => refs
                .iter()
                .map(|id| {
                    application
                        .library_pipeline(id)
                        .cloned()
                        .ok_or_else(|| MetalusError::UnknownPipeline {
                            pipeline_id: id.clone(),
                        })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => def.pipelines.clone().unwrap_or_default(),
        };

        executions.push(PipelineExecution {
            id: def.id.clone(),
            pipelines,
            parents: def.parents.clone(),
            context,
        });
    }

    ExecutionPlan::new(executions, registry, options.max_workers)
}

impl ExecutionPlan {
    /// Rebuild a fresh plan from a (possibly re-parsed) application using
    /// this plan's step registry. No in-flight state is reused; the caller
    /// must ensure no executions are running.
    pub fn refresh(
        &self,
        application: &Application,
        providers: &ProviderRegistry,
        options: &PlanOptions,
    ) -> Result<ExecutionPlan> {
        build_plan(application, self.registry().clone(), providers, options)
    }
}

// ---------------------------------------------------------------------------
// Driver configuration surface
// ---------------------------------------------------------------------------

/// Obtain the application JSON from driver parameters: inline
/// `applicationJson` wins, otherwise `applicationConfigPath` is read via the
/// named `applicationConfigurationLoader` (`LocalFileLoader` by default).
pub fn load_application_source(params: &HashMap<String, Value>) -> Result<String> {
    if let Some(json) = params.get("applicationJson").and_then(Value::as_str) {
        return Ok(json.to_string());
    }

    if let Some(path) = params.get("applicationConfigPath").and_then(Value::as_str) {
        let loader = params
            .get("applicationConfigurationLoader")
            .and_then(Value::as_str)
            .unwrap_or("LocalFileLoader");
        return match loader {
            "LocalFileLoader" => Ok(std::fs::read_to_string(path)?),
            other => Err(MetalusError::UnresolvedClass {
                class_name: other.to_string(),
            }),
        };
    }

    Err(MetalusError::Config(
        "no application source: provide applicationJson or applicationConfigPath".into(),
    ))
}
