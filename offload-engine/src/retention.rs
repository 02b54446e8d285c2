//! Retention pruning policy.
//!
//! Pure function over a remote listing: no I/O, no clock other than the `now`
//! passed in.

use crate::transfer::RemoteObject;
use serde::{Deserialize, Serialize};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Newest objects kept unconditionally
    pub retain_by_number: usize,
    /// Objects at most this many days old are kept as well
    pub retain_by_age_days: u32,
}

impl RetentionPolicy {
    pub fn new(retain_by_number: usize, retain_by_age_days: u32) -> Self {
        Self {
            retain_by_number,
            retain_by_age_days,
        }
    }
}

/// Outcome of applying a policy to a listing.
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    pub keep: Vec<RemoteObject>,
    pub delete: Vec<RemoteObject>,
}

/// Split `objects` into kept and deleted sets.
///
/// Objects are ranked newest first (ties keep listing order); the first
/// `retain_by_number` are kept, and of the rest only those no older than
/// `retain_by_age_days` survive.
pub fn plan(objects: &[RemoteObject], policy: RetentionPolicy, now: i64) -> RetentionPlan {
    let mut ranked: Vec<&RemoteObject> = objects.iter().collect();
    // sort_by is stable, so equal timestamps keep their listing order
    ranked.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));

    let max_age = i64::from(policy.retain_by_age_days) * SECS_PER_DAY;
    let mut result = RetentionPlan::default();

    for (index, object) in ranked.into_iter().enumerate() {
        let within_count = index < policy.retain_by_number;
        let age = now - object.modified_at;
        let within_age = policy.retain_by_age_days > 0 && age <= max_age;

        if within_count || within_age {
            result.keep.push(object.clone());
        } else {
            result.delete.push(object.clone());
        }
    }

    result
}
