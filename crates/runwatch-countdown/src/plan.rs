//! Pure planning for a countdown timer: given the absolute end time and the
//! current time, what happens next and when.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Emit the warning for `lead_secs` at `at`.
    Warn { lead_secs: u64, at: DateTime<Utc> },
    /// Run the stop action at `at`.
    Fire { at: DateTime<Utc> },
}

impl Step {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Step::Warn { at, .. } | Step::Fire { at } => *at,
        }
    }
}

/// The next step for a countdown ending at `end`.
///
/// Only leads whose warning instant is at or after `now` are eligible, so a
/// warning missed while the process was suspended is dropped rather than
/// replayed late. `emitted` holds leads already delivered by this timer.
pub fn next_step(end: DateTime<Utc>, now: DateTime<Utc>, leads: &[u64], emitted: &BTreeSet<u64>) -> Step {
    if now >= end {
        return Step::Fire { at: end };
    }
    leads
        .iter()
        .filter(|lead| !emitted.contains(*lead))
        .filter_map(|&lead| {
            let at = end - Duration::seconds(i64::try_from(lead).ok()?);
            (at >= now).then_some(Step::Warn { lead_secs: lead, at })
        })
        .min_by_key(Step::at)
        .unwrap_or(Step::Fire { at: end })
}
