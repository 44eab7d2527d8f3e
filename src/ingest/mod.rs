use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod file;
mod memory;
mod synthetic;

pub use file::FileSink;
pub use memory::MemorySink;
pub use synthetic::SyntheticSource;

/// One block's worth of chain data. `idempotency_key` is stable across
/// retries of the same logical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub idempotency_key: String,
    pub chain_id: String,
    pub block_number: u64,
    pub payload: serde_json::Value,
}

/// Produces at most one candidate record per call. Called once per tick by a
/// single worker.
#[async_trait]
pub trait RecordSource: Send {
    async fn fetch_next(&mut self) -> Result<Option<IngestRecord>>;
}

/// Durable, insert-if-absent storage keyed on `idempotency_key`.
///
/// Writing a key that is already stored must return `Ok(())` and change
/// nothing. Any other failure is returned so the caller can retry.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn write(&self, record: &IngestRecord) -> Result<()>;
}
