use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use openfarm_core::ServiceError;

use crate::schedule::ScheduleTemplate;

type TemplateState = Arc<ScheduleTemplate>;

pub fn router(template: Arc<ScheduleTemplate>) -> Router {
    Router::new()
        .route("/schedule/days", get(list_days))
        .route("/schedule/days/{day}", get(get_day))
        .with_state(template)
}

// ---------------------------------------------------------------------------
// GET /schedule/days
// ---------------------------------------------------------------------------

async fn list_days(
    State(template): State<TemplateState>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    Ok(Json(serde_json::json!({
        "days": template.scheduled_days(),
        "lastDay": template.last_day(),
    })))
}

// ---------------------------------------------------------------------------
// GET /schedule/days/:day
// ---------------------------------------------------------------------------

async fn get_day(
    State(template): State<TemplateState>,
    Path(day): Path<i64>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    Ok(Json(serde_json::json!({
        "dayOfAge": day,
        "tasks": template.tasks_for_day(day),
    })))
}
