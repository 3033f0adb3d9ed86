//! Flow execution: template resolution, the step contract and its built-in
//! catalog, graph analysis, and the DAG executor.

pub mod condition;
pub mod context;
pub mod executor;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod result;
pub mod step;
pub mod steps;

pub use context::{ExecutionContext, NodeOutputs};
pub use executor::{ExecutionOutcome, FlowExecutor, RunOptions};
pub use graph::{effective_edges, topological_order, validate_flow};
pub use registry::{StepDeps, StepRegistry};
pub use resolver::VariableResolver;
pub use result::{NodeExecutionResult, StepError};
pub use step::{StepExecutor, StepInput};
