use chrono::{DateTime, Utc};
use runwatch_core::runtime::format_lead;
use serde::{Deserialize, Serialize};

/// A persisted auto-stop countdown. Only the absolute `end_time` is stored;
/// remaining time is always `end_time - now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCountdown {
    pub resource_id: String,
    pub resource_name: String,
    pub region: String,
    pub end_time: DateTime<Utc>,
    pub enabled: bool,
}

impl LocalCountdown {
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.end_time - now).max(chrono::Duration::zero())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownPhase {
    Idle,
    Armed,
    Fired,
    /// Reported until the next arm; behaves like `Idle`.
    Cancelled,
}

/// A local notification raised by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalNotice {
    Warning {
        resource_id: String,
        resource_name: String,
        lead_secs: u64,
    },
    Stopped {
        resource_id: String,
        resource_name: String,
    },
    StopFailed {
        resource_id: String,
        resource_name: String,
        error: String,
    },
}

impl LocalNotice {
    /// Stable identifier; a notifier that already shows a notice with the
    /// same key should replace it.
    pub fn key(&self) -> String {
        match self {
            LocalNotice::Warning {
                resource_id,
                lead_secs,
                ..
            } => format!("{resource_id}-warning-{lead_secs}"),
            LocalNotice::Stopped { resource_id, .. } => format!("{resource_id}-stopped"),
            LocalNotice::StopFailed { resource_id, .. } => format!("{resource_id}-stop-failed"),
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            LocalNotice::Warning { resource_id, .. }
            | LocalNotice::Stopped { resource_id, .. }
            | LocalNotice::StopFailed { resource_id, .. } => resource_id,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            LocalNotice::Warning { .. } => "Auto-Stop Warning",
            LocalNotice::Stopped { .. } => "Auto-Stop Complete",
            LocalNotice::StopFailed { .. } => "Auto-Stop Failed",
        }
    }

    pub fn body(&self) -> String {
        match self {
            LocalNotice::Warning {
                resource_name,
                lead_secs,
                ..
            } => format!("{resource_name} will stop in {}", format_lead(*lead_secs)),
            LocalNotice::Stopped { resource_name, .. } => {
                format!("{resource_name} has been automatically stopped")
            }
            LocalNotice::StopFailed {
                resource_name,
                error,
                ..
            } => format!("Failed to stop {resource_name}: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_key_is_per_lead() {
        let n = LocalNotice::Warning {
            resource_id: "i-1".into(),
            resource_name: "web".into(),
            lead_secs: 300,
        };
        assert_eq!(n.key(), "i-1-warning-300");
        assert_eq!(n.body(), "web will stop in 5 minutes");
    }
}
