//! Batch registry.
//!
//! The registry is an external collaborator — this module only reads
//! it. `KvBatchRegistry` is the embedded implementation the daemon
//! serves; `put` exists for enrollment/seeding, not for the care flow.

use std::sync::Arc;

use openfarm_core::ServiceError;
use openfarm_kv::KVStore;

use crate::model::{Batch, BatchStatus};

const KEY_PREFIX: &str = "batch:";

pub trait BatchRegistry: Send + Sync {
    /// Look up a batch by id. Missing batch is a caller error.
    fn get(&self, batch_id: &str) -> Result<Batch, ServiceError>;

    /// All batches still in rearing.
    fn list_active(&self) -> Result<Vec<Batch>, ServiceError>;
}

/// Batch registry over the shared KV store, `batch:{id}` → JSON.
pub struct KvBatchRegistry {
    kv: Arc<dyn KVStore>,
}

impl KvBatchRegistry {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }

    /// Store or replace a batch record.
    pub fn put(&self, batch: &Batch) -> Result<(), ServiceError> {
        if batch.id.is_empty() {
            return Err(ServiceError::Validation("batch id must not be empty".into()));
        }
        let data = serde_json::to_vec(batch)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.kv
            .set(&format!("{KEY_PREFIX}{}", batch.id), &data)
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }
}

impl BatchRegistry for KvBatchRegistry {
    fn get(&self, batch_id: &str) -> Result<Batch, ServiceError> {
        if batch_id.is_empty() {
            return Err(ServiceError::Validation("batch id must not be empty".into()));
        }
        let data = self
            .kv
            .get(&format!("{KEY_PREFIX}{batch_id}"))
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(format!("batch {batch_id}")))?;

        serde_json::from_slice(&data)
            .map_err(|e| ServiceError::Storage(format!("bad batch json: {e}")))
    }

    fn list_active(&self) -> Result<Vec<Batch>, ServiceError> {
        let entries = self
            .kv
            .scan(KEY_PREFIX)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        for (_, data) in entries {
            let batch: Batch = serde_json::from_slice(&data)
                .map_err(|e| ServiceError::Storage(format!("bad batch json: {e}")))?;
            if batch.status == BatchStatus::Active {
                out.push(batch);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use openfarm_kv::MemoryStore;

    fn registry() -> KvBatchRegistry {
        KvBatchRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn batch(id: &str, status: BatchStatus) -> Batch {
        Batch {
            id: id.into(),
            batch_number: format!("2024-{id}"),
            entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            status,
        }
    }

    #[test]
    fn put_and_get() {
        let reg = registry();
        reg.put(&batch("b1", BatchStatus::Active)).unwrap();

        let got = reg.get("b1").unwrap();
        assert_eq!(got.batch_number, "2024-b1");
        assert_eq!(got.status, BatchStatus::Active);
    }

    #[test]
    fn missing_batch_is_not_found() {
        let reg = registry();
        assert!(matches!(reg.get("nope"), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn empty_id_is_validation_error() {
        let reg = registry();
        assert!(matches!(reg.get(""), Err(ServiceError::Validation(_))));
    }

    #[test]
    fn list_active_filters_closed() {
        let reg = registry();
        reg.put(&batch("b1", BatchStatus::Active)).unwrap();
        reg.put(&batch("b2", BatchStatus::Closed)).unwrap();
        reg.put(&batch("b3", BatchStatus::Active)).unwrap();

        let active = reg.list_active().unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|b| b.status == BatchStatus::Active));
    }
}
