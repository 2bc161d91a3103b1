use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskCategory
// ---------------------------------------------------------------------------

/// Category of a scheduled care action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCategory {
    Inspection,
    Vaccine,
    Medication,
    Feeding,
    Care,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inspection => "INSPECTION",
            Self::Vaccine => "VACCINE",
            Self::Medication => "MEDICATION",
            Self::Feeding => "FEEDING",
            Self::Care => "CARE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INSPECTION" => Some(Self::Inspection),
            "VACCINE" => Some(Self::Vaccine),
            "MEDICATION" => Some(Self::Medication),
            "FEEDING" => Some(Self::Feeding),
            "CARE" => Some(Self::Care),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition — one schedule template entry
// ---------------------------------------------------------------------------

/// A template entry describing a recurring care action scheduled for a
/// given day-of-age. Immutable after load.
///
/// External template sources are inconsistent about the identifier
/// field name (`id` / `_id` / `taskId`); the serde aliases normalize
/// all of them into the single `id` field at the boundary. Internal
/// code only ever sees `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(alias = "_id", alias = "taskId")]
    pub id: String,

    pub category: TaskCategory,

    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Dosage instruction, for vaccine/medication entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,

    /// Run length in calendar days. A value > 1 materializes into one
    /// independently-completable instance per day of the run.
    #[serde(default = "default_duration")]
    pub duration: u32,
}

fn default_duration() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Batch — one cohort of animals enrolled together
// ---------------------------------------------------------------------------

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Active,
    Closed,
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// A cohort of animals enrolled together. Supplied by the batch
/// registry; this module only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,

    /// Human-facing batch number (e.g. "2024-B07").
    pub batch_number: String,

    /// Enrollment date. Day-of-age 1 is this calendar day.
    pub entry_date: NaiveDate,

    #[serde(default)]
    pub status: BatchStatus,
}

// ---------------------------------------------------------------------------
// TaskInstance — a definition realized for one batch and day-of-age
// ---------------------------------------------------------------------------

/// A TaskDefinition realized for a specific batch and day-of-age.
///
/// Never persisted as its own row — recomputed on demand from the
/// template, with completion sub-state joined in from the ledger.
/// `instance_id` is derived purely from (definition id, batch id,
/// day-of-age), so re-materializing always resolves to the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub instance_id: String,
    pub batch_id: String,
    pub day_of_age: u32,

    pub definition_id: String,
    pub category: TaskCategory,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,

    /// 1-based position within a multi-day run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_in_series: Option<u32>,
    /// Total run length, present when position_in_series is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_len: Option<u32>,

    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
}

// ---------------------------------------------------------------------------
// CompletionRecord — the ledger's durable fact
// ---------------------------------------------------------------------------

/// Durable fact that (batch, instance) was completed. At most one
/// record exists per key; `uncomplete` clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub batch_id: String,
    pub instance_id: String,
    /// RFC 3339.
    pub completed_at: String,
    pub completed_by: String,
}

// ---------------------------------------------------------------------------
// OverlayEntry — client-local, possibly-unconfirmed completion state
// ---------------------------------------------------------------------------

/// A not-yet-confirmed local mirror of a CompletionRecord. Written the
/// instant the operator acts, before the ledger call resolves; survives
/// process restarts until reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayEntry {
    pub instance_id: String,
    pub completed: bool,
    /// Local clock, RFC 3339.
    pub marked_at: String,
    /// Operator who acted; carried so a deferred retry of the ledger
    /// call can attribute the completion correctly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body for `POST /batches` — enroll a batch. An id is generated when
/// the caller does not supply one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollBatchRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub batch_number: String,
    pub entry_date: NaiveDate,
}

/// Body for `POST /batches/{id}/tasks/{instanceId}/@complete`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub completed_by: String,

    /// Client-side completion time; server clock is used when absent.
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Response for the complete operation.
///
/// A repeated call reports `alreadyCompleted = true` and still
/// succeeds — duplicate taps and retried network calls are expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub already_completed: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Query parameters for `GET /batches/{id}/todos`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodosQuery {
    /// Explicit day-of-age; defaults to the batch's current day.
    #[serde(default)]
    pub day_of_age: Option<i64>,
}

/// Query parameters for `GET /batches/{id}/upcoming`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingQuery {
    #[serde(default)]
    pub from_day: Option<u32>,
    #[serde(default)]
    pub to_day: Option<u32>,
}

/// Query parameters for `GET /batches/{id}/history`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One day's worth of upcoming task instances.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayGroup {
    pub day_of_age: u32,
    pub tasks: Vec<TaskInstance>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
