//! Local overlay cache.
//!
//! Holds the device's optimistic, not-yet-confirmed completion state.
//! Entries are written to the durable KV store *before* the in-memory
//! index, so a "just completed" marker survives a process kill that
//! lands between the user's tap and the ledger call resolving.
//!
//! Reconciliation rule: an overlay entry is dropped only once a remote
//! snapshot agrees with it. A remote read that still shows a task
//! incomplete may simply predate the write's propagation, so the
//! overlay stays and keeps the task rendered as completed — this is
//! what prevents the flicker-back-to-incomplete defect on re-fetch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use openfarm_core::ServiceError;
use openfarm_kv::KVStore;

use crate::model::{OverlayEntry, TaskInstance};

const KEY_PREFIX: &str = "overlay:";

fn entry_key(instance_id: &str) -> String {
    format!("{KEY_PREFIX}{instance_id}")
}

pub struct OverlayCache {
    kv: Arc<dyn KVStore>,
    index: RwLock<HashMap<String, OverlayEntry>>,
}

impl OverlayCache {
    /// Open the cache, restoring any entries a previous process left
    /// behind.
    pub fn new(kv: Arc<dyn KVStore>) -> Result<Self, ServiceError> {
        let mut index = HashMap::new();
        let persisted = kv
            .scan(KEY_PREFIX)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        for (_, data) in persisted {
            let entry: OverlayEntry = serde_json::from_slice(&data)
                .map_err(|e| ServiceError::Storage(format!("bad overlay json: {e}")))?;
            index.insert(entry.instance_id.clone(), entry);
        }
        if !index.is_empty() {
            debug!("overlay cache restored {} pending entries", index.len());
        }
        Ok(Self {
            kv,
            index: RwLock::new(index),
        })
    }

    /// Record a pending local state change. Durable write first, then
    /// the in-memory index.
    pub fn mark_pending(
        &self,
        instance_id: &str,
        completed: bool,
        marked_at: &str,
        completed_by: Option<&str>,
    ) -> Result<OverlayEntry, ServiceError> {
        let entry = OverlayEntry {
            instance_id: instance_id.to_string(),
            completed,
            marked_at: marked_at.to_string(),
            completed_by: completed_by.map(str::to_string),
        };
        let data = serde_json::to_vec(&entry)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.kv
            .set(&entry_key(instance_id), &data)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        self.index
            .write()
            .unwrap()
            .insert(instance_id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Pending entry for an instance, if any.
    pub fn get(&self, instance_id: &str) -> Option<OverlayEntry> {
        self.index.read().unwrap().get(instance_id).cloned()
    }

    /// Drop an entry (confirmed, rolled back, or expired).
    pub fn clear(&self, instance_id: &str) -> Result<(), ServiceError> {
        self.kv
            .delete(&entry_key(instance_id))
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        self.index.write().unwrap().remove(instance_id);
        Ok(())
    }

    /// Instance ids with an unconfirmed entry, for the reconciler.
    pub fn pending_ids(&self) -> Vec<String> {
        self.index.read().unwrap().keys().cloned().collect()
    }

    /// Merge pending entries onto a fetched snapshot, in place. The
    /// overlay represents the operator's latest local intent and wins
    /// over the snapshot for rendering.
    pub fn apply(&self, instances: &mut [TaskInstance]) {
        let index = self.index.read().unwrap();
        for inst in instances.iter_mut() {
            if let Some(entry) = index.get(&inst.instance_id) {
                inst.completed = entry.completed;
                if entry.completed {
                    if inst.completed_at.is_none() {
                        inst.completed_at = Some(entry.marked_at.clone());
                    }
                    if inst.completed_by.is_none() {
                        inst.completed_by = entry.completed_by.clone();
                    }
                } else {
                    inst.completed_at = None;
                    inst.completed_by = None;
                }
            }
        }
    }

    /// Reconcile against an authoritative snapshot. Entries the remote
    /// now agrees with are confirmed and dropped; entries it contradicts
    /// are kept — the remote read may predate the write. Discarding a
    /// contradicted entry is the reconciler's job, after the grace
    /// window (see worker.rs).
    pub fn reconcile(&self, remote: &[TaskInstance]) -> Result<(), ServiceError> {
        for inst in remote {
            let Some(entry) = self.get(&inst.instance_id) else {
                continue;
            };
            if inst.completed == entry.completed {
                debug!("overlay confirmed for {}", inst.instance_id);
                self.clear(&inst.instance_id)?;
            }
        }
        Ok(())
    }
}
