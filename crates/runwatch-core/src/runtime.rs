//! Runtime arithmetic shared by every path that reports "running for ...".
//!
//! There is exactly one rounding rule: whole minutes, floored. Clock skew that
//! would put `now` before `launch` clamps to zero.

use chrono::{DateTime, Utc};

/// Whole minutes the resource has been running, `floor((now - launch) / 60s)`.
pub fn runtime_minutes(launch: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (now - launch).num_seconds();
    if secs <= 0 {
        0
    } else {
        secs.div_euclid(60)
    }
}

/// `"2h 5m"` style rendering used in notification bodies.
pub fn format_runtime(minutes: i64) -> String {
    let minutes = minutes.max(0);
    format!("{}h {}m", minutes / 60, minutes % 60)
}

/// Human lead-time label for countdown warnings: `"1 hour"`, `"15 minutes"`.
pub fn format_lead(secs: u64) -> String {
    fn plural(n: u64, unit: &str) -> String {
        format!("{n} {unit}{}", if n == 1 { "" } else { "s" })
    }

    if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{} and {}", plural(hours, "hour"), plural(mins, "minute"))
        } else {
            plural(hours, "hour")
        }
    } else if secs >= 60 {
        let mins = secs / 60;
        let rem = secs % 60;
        if rem > 0 {
            format!("{} and {}", plural(mins, "minute"), plural(rem, "second"))
        } else {
            plural(mins, "minute")
        }
    } else {
        plural(secs, "second")
    }
}
