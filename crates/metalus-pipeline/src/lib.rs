//! Pipeline execution engine: context, step registry, parameter resolver,
//! pipeline executor, step-group executor, and the execution plan scheduler.
//!
//! This crate implements the Metalus core: a single pipeline's step graph is
//! interpreted by [`PipelineExecutor`]; a DAG of pipeline executions is
//! dispatched in parallel by [`ExecutionPlan`]; step inputs are produced by
//! the sigil expression language in [`resolver`].

pub mod application;
pub mod context;
pub mod executor;
pub mod expression;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod step_group;
pub mod steps;

pub use application::{build_plan, load_application_source, PlanOptions, ProviderRegistry};
pub use context::{
    InMemoryPipelineManager, LoggingListener, ParameterMapper, PassthroughSecurity,
    PipelineContext, PipelineListener, PipelineManager, SecurityManager,
};
pub use executor::{PipelineExecutor, PipelineFlow};
pub use expression::{parse_mapping, parse_template, MappingExpr, Sigil, TemplatePart};
pub use registry::{ArgSpec, FieldSpec, ObjectSpec, StepFunction, StepRegistry, StepSignature};
pub use resolver::DefaultParameterMapper;
pub use scheduler::{ExecutionPlan, ExecutionResult, PipelineExecution, PlanResult};
pub use steps::register_builtin_steps;
