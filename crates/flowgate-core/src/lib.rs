pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod record;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowgateError, Result};
pub use event::EventBus;
pub use flow::{Edge, ExecutionStrategy, Flow, FlowTrigger, Node, StepKind, TriggerAuth};
pub use record::{ExecutionRecord, NodeErrorRecord, RunStatus};
pub use types::*;
