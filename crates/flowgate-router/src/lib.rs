pub mod chain;
pub mod classifier;
pub mod failover;
pub mod providers;
pub mod router;

pub use chain::{default_chain, get_chain};
pub use classifier::{ClassifyContext, TaskClassifier};
pub use failover::FailoverExecutor;
pub use providers::{build_clients, OpenAiCompatClient};
pub use router::TaskRouter;
