use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use openfarm_core::{ListResult, ServiceError, new_id};

use crate::engine::{CareEngine, CompleteOutcome};
use crate::model::{
    Batch, BatchStatus, CompleteRequest, EnrollBatchRequest, HistoryQuery, TaskInstance,
    TodosQuery, UpcomingQuery,
};
use crate::registry::KvBatchRegistry;

type EngineState = Arc<CareEngine>;

pub fn router(engine: Arc<CareEngine>, registry: Arc<KvBatchRegistry>) -> Router {
    let enroll = Router::new()
        .route("/batches", post(enroll_batch))
        .with_state(registry);

    Router::new()
        .route("/batches", get(list_batches))
        .route("/batches/{id}", get(get_batch))
        .route("/batches/{id}/todos", get(get_todos))
        .route("/batches/{id}/upcoming", get(get_upcoming))
        .route("/batches/{id}/history", get(get_history))
        .route(
            "/batches/{id}/tasks/{instance_id}/@complete",
            post(complete_task),
        )
        .route(
            "/batches/{id}/tasks/{instance_id}/@uncomplete",
            post(uncomplete_task),
        )
        .with_state(engine)
        .merge(enroll)
}

// ---------------------------------------------------------------------------
// POST /batches
// ---------------------------------------------------------------------------

async fn enroll_batch(
    State(registry): State<Arc<KvBatchRegistry>>,
    Json(req): Json<EnrollBatchRequest>,
) -> Result<Json<Batch>, ServiceError> {
    if req.batch_number.is_empty() {
        return Err(ServiceError::Validation("batchNumber must not be empty".into()));
    }
    let batch = Batch {
        id: req.id.filter(|id| !id.is_empty()).unwrap_or_else(new_id),
        batch_number: req.batch_number,
        entry_date: req.entry_date,
        status: BatchStatus::Active,
    };
    registry.put(&batch)?;
    Ok(Json(batch))
}

// ---------------------------------------------------------------------------
// GET /batches
// ---------------------------------------------------------------------------

async fn list_batches(
    State(engine): State<EngineState>,
) -> Result<Json<ListResult<Batch>>, ServiceError> {
    let items = engine.active_batches()?;
    let total = items.len();
    Ok(Json(ListResult { items, total }))
}

// ---------------------------------------------------------------------------
// GET /batches/:id
// ---------------------------------------------------------------------------

async fn get_batch(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ServiceError> {
    Ok(Json(engine.batch(&id)?))
}

// ---------------------------------------------------------------------------
// GET /batches/:id/todos
// ---------------------------------------------------------------------------

async fn get_todos(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Query(query): Query<TodosQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let day = match query.day_of_age {
        Some(day) => day,
        None => engine.current_day_of_age(&id)?,
    };
    let tasks = engine.todos_for_day(&id, day)?;
    Ok(Json(serde_json::json!({
        "dayOfAge": day,
        "tasks": tasks,
    })))
}

// ---------------------------------------------------------------------------
// GET /batches/:id/upcoming
// ---------------------------------------------------------------------------

async fn get_upcoming(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Query(query): Query<UpcomingQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let groups = match (query.from_day, query.to_day) {
        (Some(from), Some(to)) => {
            if from > to {
                return Err(ServiceError::Validation(
                    "fromDay must not exceed toDay".into(),
                ));
            }
            engine.upcoming_range(&id, from, to)?
        }
        (None, None) => engine.upcoming(&id)?,
        _ => {
            return Err(ServiceError::Validation(
                "fromDay and toDay must be given together".into(),
            ));
        }
    };
    Ok(Json(serde_json::json!({ "days": groups })))
}

// ---------------------------------------------------------------------------
// GET /batches/:id/history
// ---------------------------------------------------------------------------

async fn get_history(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ListResult<TaskInstance>>, ServiceError> {
    let items = engine.history(&id, query.limit)?;
    let total = items.len();
    Ok(Json(ListResult { items, total }))
}

// ---------------------------------------------------------------------------
// POST /batches/:id/tasks/:instance_id/@complete
// ---------------------------------------------------------------------------

async fn complete_task(
    State(engine): State<EngineState>,
    Path((id, instance_id)): Path<(String, String)>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    if req.completed_by.is_empty() {
        return Err(ServiceError::Validation("completedBy must not be empty".into()));
    }
    let outcome = engine.complete(
        &id,
        &instance_id,
        &req.completed_by,
        req.completed_at.as_deref(),
    )?;
    Ok(Json(serde_json::json!({
        "success": true,
        "alreadyCompleted": outcome == CompleteOutcome::AlreadyCompleted,
        "savedLocally": outcome == CompleteOutcome::SavedLocally,
        "message": outcome.operator_message(),
    })))
}

// ---------------------------------------------------------------------------
// POST /batches/:id/tasks/:instance_id/@uncomplete
// ---------------------------------------------------------------------------

async fn uncomplete_task(
    State(engine): State<EngineState>,
    Path((id, instance_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    engine.uncomplete(&id, &instance_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}
