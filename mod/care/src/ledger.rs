//! Completion ledger — the authoritative store of completion facts.
//!
//! `CompletionStore` persists one `CompletionRecord` per
//! (batch, instance) under `completion:{batchId}:{instanceId}`.
//! `complete` is idempotent: a second call for the same key succeeds
//! and reports `already_completed` instead of erroring, which is what
//! makes client-side retry safe. No `Ledger` implementation retries
//! internally — a domain payload layered on top of a completion (stock
//! deduction, dosage entry) may not be idempotent itself.

use std::sync::Arc;

use tracing::debug;

use openfarm_core::ServiceError;
use openfarm_kv::KVStore;

use crate::materialize::Materializer;
use crate::model::{Batch, CompleteResponse, CompletionRecord, DayGroup, TaskInstance};
use crate::registry::BatchRegistry;

const KEY_PREFIX: &str = "completion:";

fn record_key(batch_id: &str, instance_id: &str) -> String {
    format!("{KEY_PREFIX}{batch_id}:{instance_id}")
}

// ---------------------------------------------------------------------------
// CompletionStore — durable records
// ---------------------------------------------------------------------------

pub struct CompletionStore {
    kv: Arc<dyn KVStore>,
}

impl CompletionStore {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }

    /// Record a completion. Returns `true` if a record already existed
    /// (the call is then a no-op on storage).
    pub fn complete(
        &self,
        batch_id: &str,
        instance_id: &str,
        completed_by: &str,
        completed_at: &str,
    ) -> Result<bool, ServiceError> {
        let key = record_key(batch_id, instance_id);
        let existing = self
            .kv
            .get(&key)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if existing.is_some() {
            debug!("completion already recorded for {key}");
            return Ok(true);
        }

        let record = CompletionRecord {
            batch_id: batch_id.to_string(),
            instance_id: instance_id.to_string(),
            completed_at: completed_at.to_string(),
            completed_by: completed_by.to_string(),
        };
        let data = serde_json::to_vec(&record)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.kv
            .set(&key, &data)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(false)
    }

    /// Clear a completion record. Clearing an absent record is a no-op;
    /// the end state is the same either way.
    pub fn uncomplete(&self, batch_id: &str, instance_id: &str) -> Result<(), ServiceError> {
        self.kv
            .delete(&record_key(batch_id, instance_id))
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }

    /// Look up a single record.
    pub fn get(
        &self,
        batch_id: &str,
        instance_id: &str,
    ) -> Result<Option<CompletionRecord>, ServiceError> {
        let data = self
            .kv
            .get(&record_key(batch_id, instance_id))
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        data.map(|d| {
            serde_json::from_slice(&d)
                .map_err(|e| ServiceError::Storage(format!("bad completion json: {e}")))
        })
        .transpose()
    }

    /// All records for a batch, in key order.
    pub fn records_for_batch(&self, batch_id: &str) -> Result<Vec<CompletionRecord>, ServiceError> {
        let entries = self
            .kv
            .scan(&format!("{KEY_PREFIX}{batch_id}:"))
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        entries
            .into_iter()
            .map(|(_, d)| {
                serde_json::from_slice(&d)
                    .map_err(|e| ServiceError::Storage(format!("bad completion json: {e}")))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Ledger — the remote-service seam
// ---------------------------------------------------------------------------

/// The task-service contract as consumed by views and the engine.
///
/// `LocalLedger` is the in-process authoritative implementation; tests
/// substitute scripted implementations to exercise failure paths.
pub trait Ledger: Send + Sync {
    /// Instances due on `day_of_age` with completion state populated.
    /// Never errors for "no tasks" — returns an empty list.
    fn get_todos(&self, batch_id: &str, day_of_age: i64) -> Result<Vec<TaskInstance>, ServiceError>;

    /// Instances for `[from_day, to_day]`, grouped by day; empty days
    /// omitted.
    fn get_upcoming(
        &self,
        batch_id: &str,
        from_day: u32,
        to_day: u32,
    ) -> Result<Vec<DayGroup>, ServiceError>;

    /// Completed instances, most recent first.
    fn get_history(
        &self,
        batch_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TaskInstance>, ServiceError>;

    /// Idempotent completion. Duplicate calls succeed with
    /// `already_completed = true`.
    fn complete(
        &self,
        batch_id: &str,
        instance_id: &str,
        completed_by: &str,
        completed_at: &str,
    ) -> Result<CompleteResponse, ServiceError>;

    /// Manual correction: clear the completion record.
    fn uncomplete(&self, batch_id: &str, instance_id: &str) -> Result<(), ServiceError>;
}

/// Authoritative in-process ledger: materializer + batch registry +
/// completion store.
pub struct LocalLedger {
    materializer: Materializer,
    registry: Arc<dyn BatchRegistry>,
    store: CompletionStore,
}

impl LocalLedger {
    pub fn new(
        materializer: Materializer,
        registry: Arc<dyn BatchRegistry>,
        store: CompletionStore,
    ) -> Self {
        Self {
            materializer,
            registry,
            store,
        }
    }

    fn batch(&self, batch_id: &str) -> Result<Batch, ServiceError> {
        self.registry.get(batch_id)
    }

    /// Join durable completion state onto freshly materialized
    /// instances.
    fn overlay_completions(
        &self,
        batch_id: &str,
        instances: &mut [TaskInstance],
    ) -> Result<(), ServiceError> {
        for inst in instances.iter_mut() {
            if let Some(record) = self.store.get(batch_id, &inst.instance_id)? {
                inst.completed = true;
                inst.completed_at = Some(record.completed_at);
                inst.completed_by = Some(record.completed_by);
            }
        }
        Ok(())
    }
}

impl Ledger for LocalLedger {
    fn get_todos(&self, batch_id: &str, day_of_age: i64) -> Result<Vec<TaskInstance>, ServiceError> {
        let batch = self.batch(batch_id)?;
        let mut instances = self.materializer.materialize(&batch, day_of_age);
        self.overlay_completions(batch_id, &mut instances)?;
        Ok(instances)
    }

    fn get_upcoming(
        &self,
        batch_id: &str,
        from_day: u32,
        to_day: u32,
    ) -> Result<Vec<DayGroup>, ServiceError> {
        let batch = self.batch(batch_id)?;
        let grouped = self.materializer.materialize_range(&batch, from_day, to_day);

        let mut out = Vec::with_capacity(grouped.len());
        for (day, mut instances) in grouped {
            self.overlay_completions(batch_id, &mut instances)?;
            out.push(DayGroup {
                day_of_age: day,
                tasks: instances,
            });
        }
        Ok(out)
    }

    fn get_history(
        &self,
        batch_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TaskInstance>, ServiceError> {
        let batch = self.batch(batch_id)?;
        let records = self.store.records_for_batch(batch_id)?;

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            // A record whose instance no longer derives from the current
            // template (template revision drift) cannot be rendered as a
            // full instance; skip it rather than fail the whole read.
            let Some(mut inst) = self.materializer.resolves(&batch, &record.instance_id) else {
                debug!(
                    "history: completion {} does not resolve against current template",
                    record.instance_id
                );
                continue;
            };
            inst.completed = true;
            inst.completed_at = Some(record.completed_at);
            inst.completed_by = Some(record.completed_by);
            out.push(inst);
        }

        // Most recent first; RFC 3339 strings sort chronologically.
        out.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn complete(
        &self,
        batch_id: &str,
        instance_id: &str,
        completed_by: &str,
        completed_at: &str,
    ) -> Result<CompleteResponse, ServiceError> {
        if instance_id.is_empty() {
            return Err(ServiceError::Validation("instance id must not be empty".into()));
        }
        let batch = self.batch(batch_id)?;

        // Reject ids the current template cannot produce — surfaced to
        // the operator as "task unavailable, please refresh" rather
        // than silently dropped.
        if self.materializer.resolves(&batch, instance_id).is_none() {
            return Err(ServiceError::Unavailable(format!(
                "task {instance_id} is not part of the current schedule, refresh and retry"
            )));
        }

        let already = self
            .store
            .complete(batch_id, instance_id, completed_by, completed_at)?;
        Ok(CompleteResponse {
            success: true,
            already_completed: already,
        })
    }

    fn uncomplete(&self, batch_id: &str, instance_id: &str) -> Result<(), ServiceError> {
        // Fail fast on an unknown batch; clearing the record itself is
        // idempotent.
        self.batch(batch_id)?;
        self.store.uncomplete(batch_id, instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use openfarm_kv::MemoryStore;

    use crate::model::BatchStatus;
    use crate::registry::KvBatchRegistry;
    use crate::schedule::ScheduleTemplate;

    const TEMPLATE: &str = "
days:
  - day: 6
    tasks:
      - id: vac-nd-1
        category: VACCINE
        title: ND vaccine
      - id: insp-weight
        category: INSPECTION
        title: Weigh sample
  - day: 10
    tasks:
      - id: med-cocci
        category: MEDICATION
        title: Coccidiostat course
        duration: 4
";

    fn ledger() -> LocalLedger {
        let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
        let template = Arc::new(ScheduleTemplate::from_yaml(TEMPLATE).unwrap());
        let registry = KvBatchRegistry::new(Arc::clone(&kv));
        registry
            .put(&crate::model::Batch {
                id: "b1".into(),
                batch_number: "2024-B07".into(),
                entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                status: BatchStatus::Active,
            })
            .unwrap();

        LocalLedger::new(
            Materializer::new(template),
            Arc::new(registry),
            CompletionStore::new(kv),
        )
    }

    #[test]
    fn todos_join_completion_state() {
        let l = ledger();

        let todos = l.get_todos("b1", 6).unwrap();
        assert_eq!(todos.len(), 2);
        assert!(todos.iter().all(|t| !t.completed));

        l.complete("b1", "vac-nd-1:b1:6", "op1", "2024-03-06T08:00:00Z")
            .unwrap();

        let todos = l.get_todos("b1", 6).unwrap();
        let vac = todos.iter().find(|t| t.instance_id == "vac-nd-1:b1:6").unwrap();
        assert!(vac.completed);
        assert_eq!(vac.completed_by.as_deref(), Some("op1"));
        let insp = todos.iter().find(|t| t.instance_id == "insp-weight:b1:6").unwrap();
        assert!(!insp.completed);
    }

    #[test]
    fn complete_is_idempotent() {
        let l = ledger();

        let first = l
            .complete("b1", "vac-nd-1:b1:6", "op1", "2024-03-06T08:00:00Z")
            .unwrap();
        assert!(first.success);
        assert!(!first.already_completed);

        let second = l
            .complete("b1", "vac-nd-1:b1:6", "op2", "2024-03-06T08:00:05Z")
            .unwrap();
        assert!(second.success);
        assert!(second.already_completed);

        // The original record wins — no double-counting, no overwrite.
        let history = l.get_history("b1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].completed_by.as_deref(), Some("op1"));
    }

    #[test]
    fn unknown_batch_fails_fast() {
        let l = ledger();
        assert!(matches!(
            l.get_todos("ghost", 6),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            l.complete("ghost", "vac-nd-1:ghost:6", "op", "2024-03-06T08:00:00Z"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn stale_instance_id_is_unavailable() {
        let l = ledger();
        let err = l
            .complete("b1", "removed-task:b1:6", "op", "2024-03-06T08:00:00Z")
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }

    #[test]
    fn multi_day_instances_complete_independently() {
        let l = ledger();

        // Complete only day 2 of the 4-day course (day-of-age 11).
        l.complete("b1", "med-cocci+1:b1:11", "op1", "2024-03-11T08:00:00Z")
            .unwrap();

        assert!(!l.get_todos("b1", 10).unwrap()[0].completed);
        assert!(l.get_todos("b1", 11).unwrap()[0].completed);
        assert!(!l.get_todos("b1", 12).unwrap()[0].completed);
        assert!(!l.get_todos("b1", 13).unwrap()[0].completed);
    }

    #[test]
    fn history_newest_first_with_limit() {
        let l = ledger();
        l.complete("b1", "vac-nd-1:b1:6", "op", "2024-03-06T08:00:00Z")
            .unwrap();
        l.complete("b1", "insp-weight:b1:6", "op", "2024-03-06T09:30:00Z")
            .unwrap();
        l.complete("b1", "med-cocci+0:b1:10", "op", "2024-03-10T07:00:00Z")
            .unwrap();

        let history = l.get_history("b1", None).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].instance_id, "med-cocci+0:b1:10");
        assert_eq!(history[2].instance_id, "vac-nd-1:b1:6");

        let limited = l.get_history("b1", Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].instance_id, "med-cocci+0:b1:10");
    }

    #[test]
    fn uncomplete_clears_and_is_idempotent() {
        let l = ledger();
        l.complete("b1", "vac-nd-1:b1:6", "op", "2024-03-06T08:00:00Z")
            .unwrap();
        l.uncomplete("b1", "vac-nd-1:b1:6").unwrap();

        let todos = l.get_todos("b1", 6).unwrap();
        assert!(todos.iter().all(|t| !t.completed));

        // Clearing again is fine.
        l.uncomplete("b1", "vac-nd-1:b1:6").unwrap();

        // And the task can be completed fresh afterwards.
        let resp = l
            .complete("b1", "vac-nd-1:b1:6", "op", "2024-03-06T10:00:00Z")
            .unwrap();
        assert!(!resp.already_completed);
    }

    #[test]
    fn upcoming_groups_by_day() {
        let l = ledger();
        let groups = l.get_upcoming("b1", 5, 11).unwrap();
        let days: Vec<u32> = groups.iter().map(|g| g.day_of_age).collect();
        assert_eq!(days, vec![6, 10, 11]);
    }
}
