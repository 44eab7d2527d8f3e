use super::{DeliverySink, IngestRecord};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-process sink with insert-if-absent semantics.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<HashMap<String, IngestRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<IngestRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl DeliverySink for MemorySink {
    async fn write(&self, record: &IngestRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(record.idempotency_key.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }
}
