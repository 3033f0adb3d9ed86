pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

use flowgate_core::config::AppConfig;
use flowgate_core::error::Result;
use flowgate_core::traits::ExecutionStore;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store selected by `[store]`: SQLite when a path is set, memory otherwise.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn ExecutionStore>> {
    match config.store_path() {
        Some(path) => {
            info!(path = %path.display(), "Using SQLite execution store");
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
