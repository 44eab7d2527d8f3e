//! Fake block source for demos and tests; makes no external calls.
use super::{IngestRecord, RecordSource};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    chain_id: String,
    next_block: u64,
}

impl SyntheticSource {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self::starting_at(chain_id, 0)
    }

    pub fn starting_at(chain_id: impl Into<String>, block: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            next_block: block,
        }
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }
}

#[async_trait]
impl RecordSource for SyntheticSource {
    async fn fetch_next(&mut self) -> Result<Option<IngestRecord>> {
        let block_number = self.next_block;
        self.next_block += 1;
        Ok(Some(IngestRecord {
            idempotency_key: format!("{}-{}", self.chain_id, block_number),
            chain_id: self.chain_id.clone(),
            block_number,
            payload: json!({
                "block": block_number,
                "chain": self.chain_id,
                "ts": Utc::now().timestamp(),
            }),
        }))
    }
}
