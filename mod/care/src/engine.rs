//! CareEngine — client-side orchestration.
//!
//! Owns the optimistic completion flow for a device: durable overlay
//! write first, then the ledger call, then cross-surface notification.
//! Per-instance states as observed by a view:
//!
//! ```text
//! DUE → COMPLETING (overlay written, ledger call in flight)
//!         → COMPLETED   (ledger confirmed; overlay cleared)
//!         → DUE         (caller error; overlay rolled back)
//!         → COMPLETING  (transient failure; overlay kept, "saved
//!                        locally", reconciler resolves it later)
//! COMPLETED → DUE only via explicit uncomplete.
//! ```

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use openfarm_core::ServiceError;

use crate::age::day_of_age;
use crate::ledger::Ledger;
use crate::materialize::upcoming_window;
use crate::model::{Batch, DayGroup, TaskInstance};
use crate::notify::{CompletionEvent, SurfaceNotifier};
use crate::overlay::OverlayCache;
use crate::registry::BatchRegistry;

/// Injectable wall clock; tests pin it to a fixed date.
pub type ClockFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of a completion attempt, as rendered to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Ledger recorded the completion.
    Completed,
    /// A record already existed — still success, softer confirmation.
    AlreadyCompleted,
    /// Ledger unreachable; the overlay holds the state and the
    /// reconciler will sync it.
    SavedLocally,
}

impl CompleteOutcome {
    /// Toast text for the operator.
    pub fn operator_message(&self) -> &'static str {
        match self {
            Self::Completed => "Task completed",
            Self::AlreadyCompleted => "Task was already completed",
            Self::SavedLocally => "Saved locally, syncing...",
        }
    }
}

/// Result of one reconciler pass (see worker.rs).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Overlays the remote now agrees with.
    pub confirmed: u32,
    /// Ledger calls re-issued (safe: idempotent).
    pub retried: u32,
    /// Overlays discarded because the remote contradicted them past
    /// the grace window, or the instance no longer exists.
    pub reverted: u32,
}

pub struct CareEngine {
    ledger: Arc<dyn Ledger>,
    overlay: OverlayCache,
    notifier: Arc<SurfaceNotifier>,
    registry: Arc<dyn BatchRegistry>,
    clock: ClockFn,
}

impl CareEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        overlay: OverlayCache,
        notifier: Arc<SurfaceNotifier>,
        registry: Arc<dyn BatchRegistry>,
    ) -> Self {
        Self::with_clock(ledger, overlay, notifier, registry, Arc::new(Utc::now))
    }

    pub fn with_clock(
        ledger: Arc<dyn Ledger>,
        overlay: OverlayCache,
        notifier: Arc<SurfaceNotifier>,
        registry: Arc<dyn BatchRegistry>,
        clock: ClockFn,
    ) -> Self {
        Self {
            ledger,
            overlay,
            notifier,
            registry,
            clock,
        }
    }

    pub fn notifier(&self) -> &Arc<SurfaceNotifier> {
        &self.notifier
    }

    pub fn overlay(&self) -> &OverlayCache {
        &self.overlay
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    // =======================================================================
    // Reads
    // =======================================================================

    /// Current day-of-age for a batch. May be ≤ 0 when the enrollment
    /// date is still ahead; callers render that as "not yet started".
    pub fn current_day_of_age(&self, batch_id: &str) -> Result<i64, ServiceError> {
        let batch = self.registry.get(batch_id)?;
        Ok(day_of_age(batch.entry_date, self.today()))
    }

    /// Today's tasks for a batch, with overlay state merged in.
    pub fn todos(&self, batch_id: &str) -> Result<Vec<TaskInstance>, ServiceError> {
        let day = self.current_day_of_age(batch_id)?;
        self.todos_for_day(batch_id, day)
    }

    /// Tasks for an explicit day-of-age, with overlay state merged in.
    ///
    /// An authoritative snapshot arriving here doubles as a
    /// reconciliation point for the overlay.
    pub fn todos_for_day(
        &self,
        batch_id: &str,
        day_of_age: i64,
    ) -> Result<Vec<TaskInstance>, ServiceError> {
        if day_of_age < 1 {
            return Ok(Vec::new());
        }
        let mut snapshot = self.ledger.get_todos(batch_id, day_of_age)?;
        self.overlay.reconcile(&snapshot)?;
        self.overlay.apply(&mut snapshot);
        Ok(snapshot)
    }

    /// The rolling 7-day look-ahead, grouped by day.
    pub fn upcoming(&self, batch_id: &str) -> Result<Vec<DayGroup>, ServiceError> {
        let day = self.current_day_of_age(batch_id)?;
        let Some((from, to)) = upcoming_window(day) else {
            return Ok(Vec::new());
        };
        self.upcoming_range(batch_id, from, to)
    }

    /// Look-ahead over an explicit day range, with overlay state
    /// merged in.
    pub fn upcoming_range(
        &self,
        batch_id: &str,
        from: u32,
        to: u32,
    ) -> Result<Vec<DayGroup>, ServiceError> {
        let mut groups = self.ledger.get_upcoming(batch_id, from, to)?;
        for group in groups.iter_mut() {
            self.overlay.reconcile(&group.tasks)?;
            self.overlay.apply(&mut group.tasks);
        }
        Ok(groups)
    }

    /// Completed tasks, most recent first.
    pub fn history(
        &self,
        batch_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TaskInstance>, ServiceError> {
        self.ledger.get_history(batch_id, limit)
    }

    // =======================================================================
    // Completion flow
    // =======================================================================

    /// Complete a task instance optimistically.
    ///
    /// Overlay first (durable — survives a process kill mid-flight),
    /// then the ledger. A transient ledger failure keeps the overlay
    /// and reports `SavedLocally`; a caller error rolls the overlay
    /// back and propagates.
    pub fn complete(
        &self,
        batch_id: &str,
        instance_id: &str,
        completed_by: &str,
        completed_at: Option<&str>,
    ) -> Result<CompleteOutcome, ServiceError> {
        if instance_id.is_empty() {
            return Err(ServiceError::Validation("instance id must not be empty".into()));
        }

        // Normalize a client-supplied time to the server's UTC RFC 3339
        // form: stored timestamps must share one offset format, since
        // history orders them lexicographically.
        let now = match completed_at {
            Some(at) => DateTime::parse_from_rfc3339(at)
                .map_err(|e| {
                    ServiceError::Validation(format!("completedAt is not RFC 3339: {e}"))
                })?
                .with_timezone(&Utc)
                .to_rfc3339(),
            None => self.now().to_rfc3339(),
        };
        self.overlay
            .mark_pending(instance_id, true, &now, Some(completed_by))?;

        match self
            .ledger
            .complete(batch_id, instance_id, completed_by, &now)
        {
            Ok(resp) => {
                self.overlay.clear(instance_id)?;
                self.notifier.publish(CompletionEvent {
                    instance_id: instance_id.to_string(),
                    completed: true,
                    at: now,
                });
                if resp.already_completed {
                    debug!("complete {instance_id}: already recorded");
                    Ok(CompleteOutcome::AlreadyCompleted)
                } else {
                    Ok(CompleteOutcome::Completed)
                }
            }
            Err(e) if e.is_transient() => {
                // Operator sees their action took effect; the durable
                // overlay carries it until the reconciler confirms.
                warn!("complete {instance_id}: ledger unreachable, kept local: {e}");
                self.notifier.publish(CompletionEvent {
                    instance_id: instance_id.to_string(),
                    completed: true,
                    at: now,
                });
                Ok(CompleteOutcome::SavedLocally)
            }
            Err(e) => {
                // Caller error — the optimistic state was wrong, undo it.
                self.overlay.clear(instance_id)?;
                Err(e)
            }
        }
    }

    /// Manual correction: clear a completion.
    pub fn uncomplete(&self, batch_id: &str, instance_id: &str) -> Result<(), ServiceError> {
        self.ledger.uncomplete(batch_id, instance_id)?;
        self.overlay.clear(instance_id)?;
        self.notifier.publish(CompletionEvent {
            instance_id: instance_id.to_string(),
            completed: false,
            at: self.now().to_rfc3339(),
        });
        Ok(())
    }

    // =======================================================================
    // Background reconciliation
    // =======================================================================

    /// One verification pass over all pending overlays.
    ///
    /// For each pending entry, a fresh ledger read decides:
    /// - remote agrees → confirmed, overlay dropped;
    /// - remote disagrees within the grace window → re-issue the
    ///   ledger call (idempotent, so safe);
    /// - remote disagrees past the grace window, or the instance no
    ///   longer resolves → overlay discarded and the true state
    ///   published so views revert and the operator is told.
    pub fn reconcile_pending(&self, grace_secs: i64) -> Result<ReconcileStats, ServiceError> {
        let mut stats = ReconcileStats::default();

        for instance_id in self.overlay.pending_ids() {
            let Some(entry) = self.overlay.get(&instance_id) else {
                continue;
            };
            let Some((batch_id, day)) = parse_instance_id(&instance_id) else {
                warn!("reconciler: malformed overlay id {instance_id}, dropping");
                self.overlay.clear(&instance_id)?;
                stats.reverted += 1;
                continue;
            };

            let snapshot = match self.ledger.get_todos(&batch_id, day) {
                Ok(s) => s,
                Err(e) if e.is_transient() => {
                    debug!("reconciler: ledger unreachable for {instance_id}, next round: {e}");
                    continue;
                }
                Err(e) => {
                    // Batch gone or invalid — the overlay can never confirm.
                    warn!("reconciler: dropping overlay for {instance_id}: {e}");
                    self.revert(&instance_id, false)?;
                    stats.reverted += 1;
                    continue;
                }
            };

            match snapshot.iter().find(|i| i.instance_id == instance_id) {
                Some(inst) if inst.completed == entry.completed => {
                    self.overlay.clear(&instance_id)?;
                    stats.confirmed += 1;
                }
                Some(inst) => {
                    if self.grace_expired(&entry.marked_at, grace_secs) {
                        info!(
                            "reconciler: overlay for {instance_id} contradicted past grace window, reverting"
                        );
                        self.revert(&instance_id, inst.completed)?;
                        stats.reverted += 1;
                    } else if entry.completed {
                        match self.ledger.complete(
                            &batch_id,
                            &instance_id,
                            entry.completed_by.as_deref().unwrap_or("local-sync"),
                            &entry.marked_at,
                        ) {
                            Ok(_) => {
                                self.overlay.clear(&instance_id)?;
                                self.notifier.publish(CompletionEvent {
                                    instance_id: instance_id.clone(),
                                    completed: true,
                                    at: entry.marked_at.clone(),
                                });
                                stats.retried += 1;
                            }
                            Err(e) if e.is_transient() => {
                                debug!("reconciler: retry for {instance_id} failed, next round: {e}");
                            }
                            Err(e) => {
                                warn!("reconciler: retry for {instance_id} rejected: {e}");
                                self.revert(&instance_id, inst.completed)?;
                                stats.reverted += 1;
                            }
                        }
                    } else {
                        match self.ledger.uncomplete(&batch_id, &instance_id) {
                            Ok(()) => {
                                self.overlay.clear(&instance_id)?;
                                self.notifier.publish(CompletionEvent {
                                    instance_id: instance_id.clone(),
                                    completed: false,
                                    at: entry.marked_at.clone(),
                                });
                                stats.retried += 1;
                            }
                            Err(e) if e.is_transient() => {
                                debug!("reconciler: retry for {instance_id} failed, next round: {e}");
                            }
                            Err(e) => {
                                warn!("reconciler: retry for {instance_id} rejected: {e}");
                                self.revert(&instance_id, inst.completed)?;
                                stats.reverted += 1;
                            }
                        }
                    }
                }
                None => {
                    // Instance not materializable any more (template
                    // drift). Surfaced as a revert, never silently kept.
                    warn!("reconciler: {instance_id} no longer materializes, reverting");
                    self.revert(&instance_id, false)?;
                    stats.reverted += 1;
                }
            }
        }

        Ok(stats)
    }

    fn revert(&self, instance_id: &str, remote_completed: bool) -> Result<(), ServiceError> {
        self.overlay.clear(instance_id)?;
        self.notifier.publish(CompletionEvent {
            instance_id: instance_id.to_string(),
            completed: remote_completed,
            at: self.now().to_rfc3339(),
        });
        Ok(())
    }

    fn grace_expired(&self, marked_at: &str, grace_secs: i64) -> bool {
        match DateTime::parse_from_rfc3339(marked_at) {
            Ok(marked) => {
                let age = self.now().signed_duration_since(marked.with_timezone(&Utc));
                age.num_seconds() > grace_secs
            }
            // Unparseable timestamp cannot be aged; treat as expired.
            Err(_) => true,
        }
    }

    /// Batch lookup passthrough for the API layer.
    pub fn batch(&self, batch_id: &str) -> Result<Batch, ServiceError> {
        self.registry.get(batch_id)
    }

    /// Active batches passthrough for the API layer.
    pub fn active_batches(&self) -> Result<Vec<Batch>, ServiceError> {
        self.registry.list_active()
    }
}

/// Extract (batch id, day-of-age) from a derived instance id,
/// `{definition}[+offset]:{batchId}:{day}`.
fn parse_instance_id(instance_id: &str) -> Option<(String, i64)> {
    let mut parts = instance_id.rsplitn(3, ':');
    let day: i64 = parts.next()?.parse().ok()?;
    let batch_id = parts.next()?;
    parts.next()?; // definition part must exist
    Some((batch_id.to_string(), day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use openfarm_kv::{KVStore, MemoryStore};

    use crate::ledger::{CompletionStore, LocalLedger};
    use crate::materialize::Materializer;
    use crate::model::{BatchStatus, CompleteResponse};
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

    fn fixed_clock(y: i32, m: u32, d: u32) -> ClockFn {
        Arc::new(move || Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap())
    }

    fn seeded_registry(kv: &Arc<dyn KVStore>) -> Arc<KvBatchRegistry> {
        let registry = KvBatchRegistry::new(Arc::clone(kv));
        registry
            .put(&Batch {
                id: "b1".into(),
                batch_number: "2024-B07".into(),
                entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                status: BatchStatus::Active,
            })
            .unwrap();
        Arc::new(registry)
    }

    fn local_ledger(kv: &Arc<dyn KVStore>) -> Arc<LocalLedger> {
        let template = Arc::new(ScheduleTemplate::from_yaml(TEMPLATE).unwrap());
        Arc::new(LocalLedger::new(
            Materializer::new(template),
            seeded_registry(kv),
            CompletionStore::new(Arc::clone(kv)),
        ))
    }

    /// Engine over a healthy in-process ledger, clock pinned to the
    /// given date.
    fn engine_at(y: i32, m: u32, d: u32) -> CareEngine {
        let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
        let ledger = local_ledger(&kv);
        CareEngine::with_clock(
            ledger,
            OverlayCache::new(Arc::new(MemoryStore::new())).unwrap(),
            Arc::new(SurfaceNotifier::new()),
            seeded_registry(&kv),
            fixed_clock(y, m, d),
        )
    }

    /// Ledger wrapper whose `complete` fails with a Storage error a
    /// scripted number of times before delegating.
    struct FlakyLedger {
        inner: Arc<LocalLedger>,
        failures_left: Mutex<u32>,
    }

    impl Ledger for FlakyLedger {
        fn get_todos(
            &self,
            batch_id: &str,
            day: i64,
        ) -> Result<Vec<TaskInstance>, ServiceError> {
            self.inner.get_todos(batch_id, day)
        }

        fn get_upcoming(
            &self,
            batch_id: &str,
            from: u32,
            to: u32,
        ) -> Result<Vec<DayGroup>, ServiceError> {
            self.inner.get_upcoming(batch_id, from, to)
        }

        fn get_history(
            &self,
            batch_id: &str,
            limit: Option<usize>,
        ) -> Result<Vec<TaskInstance>, ServiceError> {
            self.inner.get_history(batch_id, limit)
        }

        fn complete(
            &self,
            batch_id: &str,
            instance_id: &str,
            completed_by: &str,
            completed_at: &str,
        ) -> Result<CompleteResponse, ServiceError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ServiceError::Storage("connection reset".into()));
            }
            self.inner
                .complete(batch_id, instance_id, completed_by, completed_at)
        }

        fn uncomplete(&self, batch_id: &str, instance_id: &str) -> Result<(), ServiceError> {
            self.inner.uncomplete(batch_id, instance_id)
        }
    }

    fn flaky_engine(failures: u32) -> CareEngine {
        let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FlakyLedger {
            inner: local_ledger(&kv),
            failures_left: Mutex::new(failures),
        });
        CareEngine::with_clock(
            ledger,
            OverlayCache::new(Arc::new(MemoryStore::new())).unwrap(),
            Arc::new(SurfaceNotifier::new()),
            seeded_registry(&kv),
            fixed_clock(2024, 3, 6),
        )
    }

    // -- scenario A: day-age and todos ------------------------------------

    #[test]
    fn scenario_a_day_of_age_and_todos() {
        let engine = engine_at(2024, 3, 6);

        assert_eq!(engine.current_day_of_age("b1").unwrap(), 6);

        let todos = engine.todos("b1").unwrap();
        assert_eq!(todos.len(), 2);
        assert!(todos.iter().all(|t| !t.completed));
        assert!(todos.iter().any(|t| t.instance_id == "vac-nd-1:b1:6"));
    }

    #[test]
    fn not_yet_started_batch_has_no_todos() {
        // Clock before the enrollment date.
        let engine = engine_at(2024, 2, 20);
        assert!(engine.current_day_of_age("b1").unwrap() <= 0);
        assert!(engine.todos("b1").unwrap().is_empty());
    }

    // -- scenario B: multi-day independence -------------------------------

    #[test]
    fn scenario_b_multi_day_series_completes_independently() {
        let engine = engine_at(2024, 3, 11); // day-of-age 11 = series day 2

        let todos = engine.todos("b1").unwrap();
        assert_eq!(todos[0].instance_id, "med-cocci+1:b1:11");
        assert_eq!(todos[0].position_in_series, Some(2));

        engine.complete("b1", "med-cocci+1:b1:11", "op1", None).unwrap();

        assert!(engine.todos_for_day("b1", 11).unwrap()[0].completed);
        assert!(!engine.todos_for_day("b1", 10).unwrap()[0].completed);
        assert!(!engine.todos_for_day("b1", 12).unwrap()[0].completed);
        assert!(!engine.todos_for_day("b1", 13).unwrap()[0].completed);
    }

    // -- scenario C: double tap -------------------------------------------

    #[test]
    fn scenario_c_double_tap_is_one_record_no_revert() {
        let engine = engine_at(2024, 3, 6);

        let first = engine.complete("b1", "vac-nd-1:b1:6", "op1", None).unwrap();
        assert_eq!(first, CompleteOutcome::Completed);

        let second = engine.complete("b1", "vac-nd-1:b1:6", "op1", None).unwrap();
        assert_eq!(second, CompleteOutcome::AlreadyCompleted);

        // Exactly one record, and the view never reverts.
        let history = engine.history("b1", None).unwrap();
        assert_eq!(history.len(), 1);
        let todos = engine.todos("b1").unwrap();
        let vac = todos.iter().find(|t| t.instance_id == "vac-nd-1:b1:6").unwrap();
        assert!(vac.completed);
    }

    // -- scenario D: sibling views ----------------------------------------

    #[tokio::test]
    async fn scenario_d_sibling_view_sees_completion_without_refetch() {
        let engine = engine_at(2024, 3, 6);

        // List view is mounted and subscribed.
        let mut list_rx = engine.notifier().subscribe();

        // Detail view completes the task.
        engine.complete("b1", "vac-nd-1:b1:6", "op1", None).unwrap();

        // The list view hears about it without any ledger fetch.
        let event = list_rx.recv().await.unwrap();
        assert_eq!(event.instance_id, "vac-nd-1:b1:6");
        assert!(event.completed);

        // A view mounted only later still catches up.
        let late = engine.notifier().take_pending("history-view");
        assert_eq!(late.len(), 1);
    }

    // -- failure handling --------------------------------------------------

    #[test]
    fn transient_failure_saves_locally_and_keeps_showing_completed() {
        let engine = flaky_engine(1);

        let outcome = engine.complete("b1", "vac-nd-1:b1:6", "op1", None).unwrap();
        assert_eq!(outcome, CompleteOutcome::SavedLocally);
        assert_eq!(outcome.operator_message(), "Saved locally, syncing...");

        // A re-fetch hits the (behind) ledger, but the overlay keeps
        // the task rendered as completed — no flicker back.
        let todos = engine.todos("b1").unwrap();
        let vac = todos.iter().find(|t| t.instance_id == "vac-nd-1:b1:6").unwrap();
        assert!(vac.completed);
        assert_eq!(vac.completed_by.as_deref(), Some("op1"));
    }

    #[test]
    fn reconciler_retries_and_confirms_saved_locally() {
        let engine = flaky_engine(1);
        engine.complete("b1", "vac-nd-1:b1:6", "op1", None).unwrap();
        assert_eq!(engine.overlay().pending_ids().len(), 1);

        // The flaky call budget is spent; the retry goes through.
        let stats = engine.reconcile_pending(300).unwrap();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.reverted, 0);
        assert!(engine.overlay().pending_ids().is_empty());

        // Durably recorded now.
        let history = engine.history("b1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].completed_by.as_deref(), Some("op1"));
    }

    #[test]
    fn reconciler_confirms_already_synced_overlay() {
        let engine = engine_at(2024, 3, 6);

        // Overlay left behind by a crash after the ledger write landed.
        engine
            .overlay()
            .mark_pending("vac-nd-1:b1:6", true, "2024-03-06T08:00:00Z", Some("op1"))
            .unwrap();
        engine
            .ledger
            .complete("b1", "vac-nd-1:b1:6", "op1", "2024-03-06T08:00:00Z")
            .unwrap();

        let stats = engine.reconcile_pending(300).unwrap();
        assert_eq!(stats.confirmed, 1);
        assert!(engine.overlay().pending_ids().is_empty());
    }

    #[test]
    fn reconciler_reverts_after_grace_window() {
        let engine = flaky_engine(u32::MAX); // ledger never accepts the write

        engine
            .overlay()
            // Marked hours before the pinned clock — grace long expired.
            .mark_pending("vac-nd-1:b1:6", true, "2024-03-06T01:00:00Z", Some("op1"))
            .unwrap();

        let mut rx = engine.notifier().subscribe();
        let stats = engine.reconcile_pending(300).unwrap();
        assert_eq!(stats.reverted, 1);
        assert!(engine.overlay().pending_ids().is_empty());

        // Views are told the true state so they revert.
        let event = rx.try_recv().unwrap();
        assert_eq!(event.instance_id, "vac-nd-1:b1:6");
        assert!(!event.completed);
    }

    #[test]
    fn reconciler_reverts_unmaterializable_instance() {
        let engine = engine_at(2024, 3, 6);
        engine
            .overlay()
            .mark_pending("ghost-task:b1:6", true, "2024-03-06T08:59:00Z", None)
            .unwrap();

        let stats = engine.reconcile_pending(300).unwrap();
        assert_eq!(stats.reverted, 1);
        assert!(engine.overlay().get("ghost-task:b1:6").is_none());
    }

    #[test]
    fn caller_error_rolls_back_overlay() {
        let engine = engine_at(2024, 3, 6);

        let err = engine.complete("b1", "ghost-task:b1:6", "op1", None).unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        // No optimistic residue.
        assert!(engine.overlay().get("ghost-task:b1:6").is_none());
    }

    #[test]
    fn uncomplete_reverts_and_notifies() {
        let engine = engine_at(2024, 3, 6);
        engine.complete("b1", "vac-nd-1:b1:6", "op1", None).unwrap();

        let mut rx = engine.notifier().subscribe();
        engine.uncomplete("b1", "vac-nd-1:b1:6").unwrap();

        let todos = engine.todos("b1").unwrap();
        assert!(todos.iter().all(|t| !t.completed));
        let event = rx.try_recv().unwrap();
        assert!(!event.completed);
    }

    #[test]
    fn client_timestamp_is_validated_and_normalized() {
        let engine = engine_at(2024, 3, 11);

        // A Z-suffixed and an offset timestamp both land in the one
        // stored form, so history ordering stays chronological.
        engine
            .complete("b1", "med-cocci+0:b1:10", "op1", Some("2024-03-10T10:00:00Z"))
            .unwrap();
        engine
            .complete("b1", "med-cocci+1:b1:11", "op1", Some("2024-03-11T08:30:00+02:00"))
            .unwrap();

        let history = engine.history("b1", None).unwrap();
        assert_eq!(
            history[0].completed_at.as_deref(),
            Some("2024-03-11T06:30:00+00:00")
        );
        assert_eq!(
            history[1].completed_at.as_deref(),
            Some("2024-03-10T10:00:00+00:00")
        );

        // Garbage is rejected before anything is written.
        let err = engine
            .complete("b1", "insp-weight:b1:6", "op1", Some("yesterday-ish"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(engine.overlay().get("insp-weight:b1:6").is_none());
    }

    #[test]
    fn upcoming_window_from_current_day() {
        let engine = engine_at(2024, 3, 4); // day-of-age 4, window [5, 11]
        let groups = engine.upcoming("b1").unwrap();
        let days: Vec<u32> = groups.iter().map(|g| g.day_of_age).collect();
        assert_eq!(days, vec![6, 10, 11]);
    }

    #[test]
    fn parse_instance_id_variants() {
        assert_eq!(
            parse_instance_id("vac-nd-1:b1:6"),
            Some(("b1".into(), 6))
        );
        assert_eq!(
            parse_instance_id("med-cocci+2:b1:12"),
            Some(("b1".into(), 12))
        );
        assert_eq!(parse_instance_id("no-day:b1:x"), None);
        assert_eq!(parse_instance_id("garbage"), None);
    }
}
