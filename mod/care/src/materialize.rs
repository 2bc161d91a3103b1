//! Task materialization.
//!
//! Turns template entries into concrete task instances for a batch and
//! day-of-age. Instance ids are derived purely from
//! (definition id, batch id, day-of-age), so re-querying the same day
//! always resolves to the same id — the ledger depends on that to find
//! existing completion records.
//!
//! Id scheme:
//! - single-day definition:  `{definitionId}:{batchId}:{day}`
//! - day k of a multi-day run (k 0-based): `{definitionId}+{k}:{batchId}:{day}`

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{Batch, TaskDefinition, TaskInstance};
use crate::schedule::ScheduleTemplate;

/// Rolling look-ahead used by "upcoming tasks" views, in days.
pub const UPCOMING_WINDOW_DAYS: u32 = 7;

pub struct Materializer {
    template: Arc<ScheduleTemplate>,
}

impl Materializer {
    pub fn new(template: Arc<ScheduleTemplate>) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &Arc<ScheduleTemplate> {
        &self.template
    }

    /// All task instances due for `batch` on `day_of_age`.
    ///
    /// Includes day k of any multi-day run whose scheduled day plus
    /// duration spans `day_of_age`. A day-of-age ≤ 0 (batch not yet
    /// started) or past the template yields an empty list.
    pub fn materialize(&self, batch: &Batch, day_of_age: i64) -> Vec<TaskInstance> {
        let Ok(day) = u32::try_from(day_of_age) else {
            return Vec::new();
        };
        if day == 0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (scheduled_day, defs) in self.template.entries() {
            if scheduled_day > day {
                break;
            }
            for def in defs {
                let offset = day - scheduled_day;
                if offset < def.duration {
                    out.push(instance(batch, def, scheduled_day, offset));
                }
            }
        }
        out
    }

    /// Instances for each day in `[from_day, to_day]`, keyed by day.
    /// Days with nothing due are omitted, not represented as empty
    /// groups.
    pub fn materialize_range(
        &self,
        batch: &Batch,
        from_day: u32,
        to_day: u32,
    ) -> BTreeMap<u32, Vec<TaskInstance>> {
        let mut out = BTreeMap::new();
        if from_day > to_day {
            return out;
        }
        for day in from_day..=to_day {
            let instances = self.materialize(batch, i64::from(day));
            if !instances.is_empty() {
                out.insert(day, instances);
            }
        }
        out
    }

    /// Whether `instance_id` is derivable from the current template for
    /// `batch`. Used to reject completion calls carrying ids minted
    /// against a template this process no longer has.
    pub fn resolves(&self, batch: &Batch, instance_id: &str) -> Option<TaskInstance> {
        let (_, rest) = instance_id.split_once(':')?;
        let (batch_id, day) = rest.split_once(':')?;
        if batch_id != batch.id {
            return None;
        }
        let day: i64 = day.parse().ok()?;
        self.materialize(batch, day)
            .into_iter()
            .find(|i| i.instance_id == instance_id)
    }
}

/// The `[current+1, current+7]` upcoming window, clamped so the range
/// never reaches below day 1. Returns None when the window is empty.
pub fn upcoming_window(current_day: i64) -> Option<(u32, u32)> {
    let to = current_day + i64::from(UPCOMING_WINDOW_DAYS);
    if to < 1 {
        return None;
    }
    let from = (current_day + 1).max(1);
    Some((from as u32, to as u32))
}

fn instance(batch: &Batch, def: &TaskDefinition, scheduled_day: u32, offset: u32) -> TaskInstance {
    let day = scheduled_day + offset;
    let (def_part, position, series) = if def.duration > 1 {
        (
            format!("{}+{}", def.id, offset),
            Some(offset + 1),
            Some(def.duration),
        )
    } else {
        (def.id.clone(), None, None)
    };

    TaskInstance {
        instance_id: format!("{}:{}:{}", def_part, batch.id, day),
        batch_id: batch.id.clone(),
        day_of_age: day,
        definition_id: def.id.clone(),
        category: def.category,
        title: def.title.clone(),
        description: def.description.clone(),
        dosage: def.dosage.clone(),
        position_in_series: position,
        series_len: series,
        completed: false,
        completed_at: None,
        completed_by: None,
    }
}
