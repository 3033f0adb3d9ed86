use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use futures::future::BoxFuture;
use serde_json::Value;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::record::ExecutionRecord;
use flowgate_core::traits::ExecutionStore;

/// Process-local store for runs that need no durability (CLI, tests).
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ExecutionRecord>>,
    outputs: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

fn poisoned<T>(_: T) -> FlowgateError {
    FlowgateError::Database("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExecutionStore for MemoryStore {
    fn save_execution_record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.records
                .write()
                .map_err(poisoned)?
                .insert(record.execution_id.clone(), record);
            Ok(())
        })
    }

    fn append_node_output(
        &self,
        execution_id: &str,
        node_id: &str,
        output: &Value,
    ) -> BoxFuture<'_, Result<()>> {
        let (execution_id, node_id, output) =
            (execution_id.to_string(), node_id.to_string(), output.clone());
        Box::pin(async move {
            self.outputs
                .write()
                .map_err(poisoned)?
                .entry(execution_id)
                .or_default()
                .entry(node_id)
                .or_insert(output);
            Ok(())
        })
    }

    fn load_node_outputs(&self, execution_id: &str) -> BoxFuture<'_, Result<BTreeMap<String, Value>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            Ok(self
                .outputs
                .read()
                .map_err(poisoned)?
                .get(&execution_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn load_execution_record(
        &self,
        execution_id: &str,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move { Ok(self.records.read().map_err(poisoned)?.get(&execution_id).cloned()) })
    }
}
