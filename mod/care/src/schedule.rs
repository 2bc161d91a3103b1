//! Schedule template store.
//!
//! An immutable day-of-age → task-definition mapping, loaded once at
//! process start and shared via `Arc`. Days outside the template are
//! valid queries that return no tasks — an empty schedule day is
//! never an error.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use openfarm_core::ServiceError;

use crate::model::TaskDefinition;

/// YAML shape of one template day.
#[derive(Debug, Deserialize)]
struct DayEntry {
    day: u32,
    tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    days: Vec<DayEntry>,
}

/// The rearing-cycle care schedule. Read-only; thread-safe by virtue
/// of immutability.
pub struct ScheduleTemplate {
    days: BTreeMap<u32, Vec<TaskDefinition>>,
}

/// Built-in schedule used when no template file is configured,
/// covering a standard 42-day broiler rearing cycle.
const BUILTIN_TEMPLATE: &str = include_str!("schedule_default.yaml");

impl ScheduleTemplate {
    /// Parse a template from YAML text.
    ///
    /// A definition listed twice for the same day is rejected — task
    /// instance ids are derived from (definition id, day), so a
    /// duplicate would collapse two instances into one. Ids containing
    /// `:` or `+` are rejected for the same reason: both characters
    /// are separators in the derived instance id, so a literal id like
    /// `med-x+1` would alias day 2 of a multi-day `med-x` run.
    pub fn from_yaml(yaml: &str) -> Result<Self, ServiceError> {
        let file: TemplateFile = serde_yml::from_str(yaml)
            .map_err(|e| ServiceError::Validation(format!("bad schedule template: {e}")))?;

        let mut days: BTreeMap<u32, Vec<TaskDefinition>> = BTreeMap::new();
        for entry in file.days {
            if entry.day == 0 {
                return Err(ServiceError::Validation(
                    "schedule template: day-of-age starts at 1".into(),
                ));
            }
            let slot = days.entry(entry.day).or_default();
            for def in entry.tasks {
                if def.id.is_empty() {
                    return Err(ServiceError::Validation(format!(
                        "schedule template: task on day {} has an empty id",
                        entry.day
                    )));
                }
                if def.id.contains([':', '+']) {
                    return Err(ServiceError::Validation(format!(
                        "schedule template: task id '{}' contains a reserved character (':' or '+')",
                        def.id
                    )));
                }
                if slot.iter().any(|d| d.id == def.id) {
                    return Err(ServiceError::Validation(format!(
                        "schedule template: duplicate task id '{}' on day {}",
                        def.id, entry.day
                    )));
                }
                slot.push(def);
            }
        }

        debug!("schedule template parsed: {} scheduled days", days.len());
        Ok(Self { days })
    }

    /// Load the template from a YAML file, falling back to the
    /// built-in schedule when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        if !path.is_file() {
            info!("no schedule template at {:?}, using built-in", path);
            return Self::builtin();
        }
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Storage(format!("read schedule template: {e}")))?;
        info!("schedule template loaded from {:?}", path);
        Self::from_yaml(&yaml)
    }

    /// The built-in default schedule.
    pub fn builtin() -> Result<Self, ServiceError> {
        Self::from_yaml(BUILTIN_TEMPLATE)
    }

    /// Task definitions scheduled for a day-of-age. Empty slice for
    /// days with no entries, days past the template, and day-of-age
    /// values ≤ 0 (batch not yet started).
    pub fn tasks_for_day(&self, day_of_age: i64) -> &[TaskDefinition] {
        if day_of_age < 1 {
            return &[];
        }
        u32::try_from(day_of_age)
            .ok()
            .and_then(|d| self.days.get(&d))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Iterate (day, definitions) pairs in ascending day order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &[TaskDefinition])> {
        self.days.iter().map(|(d, v)| (*d, v.as_slice()))
    }

    /// All days that have at least one entry, sorted ascending.
    pub fn scheduled_days(&self) -> Vec<u32> {
        self.days.keys().copied().collect()
    }

    /// Last scheduled day of the cycle, 0 for an empty template.
    pub fn last_day(&self) -> u32 {
        self.days.keys().next_back().copied().unwrap_or(0)
    }
}
