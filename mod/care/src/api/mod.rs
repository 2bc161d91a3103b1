mod batches;
mod schedule;

use std::sync::Arc;
use axum::Router;

use crate::engine::CareEngine;
use crate::registry::KvBatchRegistry;
use crate::schedule::ScheduleTemplate;

/// Build the complete care module router.
///
/// Routes:
/// - `POST /batches`                                    — enroll a batch
/// - `GET  /batches`                                    — list active batches
/// - `GET  /batches/{id}`                               — get batch
/// - `GET  /batches/{id}/todos`                         — today's tasks (or ?dayOfAge=N)
/// - `GET  /batches/{id}/upcoming`                      — 7-day look-ahead, grouped by day
/// - `GET  /batches/{id}/history`                       — completed tasks, newest first
/// - `POST /batches/{id}/tasks/{instanceId}/@complete`  — complete a task
/// - `POST /batches/{id}/tasks/{instanceId}/@uncomplete` — clear a completion
/// - `GET  /schedule/days`                              — scheduled days of the template
/// - `GET  /schedule/days/{day}`                        — task definitions for one day
pub fn router(
    engine: Arc<CareEngine>,
    registry: Arc<KvBatchRegistry>,
    template: Arc<ScheduleTemplate>,
) -> Router {
    Router::new()
        .merge(batches::router(engine, registry))
        .merge(schedule::router(template))
}
