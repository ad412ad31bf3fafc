use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Last known lifecycle state of a watched compute resource.
///
/// Mirrors the cloud provider's instance states. Anything the provider
/// reports that we don't model lands in `Other` so a new state never breaks
/// deserialisation of stored records. Deserialising goes through
/// [`FromStr`](std::str::FromStr), so wire values are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    #[serde(untagged)]
    Other(String),
}

impl ResourceState {
    /// States that end a run: every alert armed against it becomes moot.
    pub fn is_halting(&self) -> bool {
        matches!(
            self,
            ResourceState::Stopping
                | ResourceState::Stopped
                | ResourceState::ShuttingDown
                | ResourceState::Terminated
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ResourceState::Running)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResourceState::Pending => "pending",
            ResourceState::Running => "running",
            ResourceState::Stopping => "stopping",
            ResourceState::Stopped => "stopped",
            ResourceState::ShuttingDown => "shutting-down",
            ResourceState::Terminated => "terminated",
            ResourceState::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for ResourceState {
    type Err = String;

    /// Case-insensitive; clients historically sent `"Running"` as often as `"running"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Ok(match lower.as_str() {
            "pending" => ResourceState::Pending,
            "running" => ResourceState::Running,
            "stopping" => ResourceState::Stopping,
            "stopped" => ResourceState::Stopped,
            "shutting-down" | "shutting_down" => ResourceState::ShuttingDown,
            "terminated" => ResourceState::Terminated,
            "" => return Err("empty resource state".to_string()),
            _ => ResourceState::Other(lower),
        })
    }
}

/// Delivery status of a persisted alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Notification delivered.
    Sent,
    /// Delivery failed permanently (bad target or retries exhausted).
    Error,
    /// Withdrawn by the user or by a resource state change.
    Cancelled,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
            AlertStatus::Error => "error",
            AlertStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "sent" => Ok(AlertStatus::Sent),
            "error" => Ok(AlertStatus::Error),
            "cancelled" => Ok(AlertStatus::Cancelled),
            other => Err(format!("unknown alert status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halting_states() {
        for s in ["stopped", "stopping", "terminated", "shutting-down"] {
            let state: ResourceState = s.parse().unwrap();
            assert!(state.is_halting(), "{s} should halt");
        }
        assert!(!ResourceState::Running.is_halting());
        assert!(!ResourceState::Pending.is_halting());
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Running".parse::<ResourceState>().unwrap(), ResourceState::Running);
        assert_eq!(
            "SHUTTING_DOWN".parse::<ResourceState>().unwrap(),
            ResourceState::ShuttingDown
        );
    }

    #[test]
    fn unknown_state_is_preserved() {
        let state: ResourceState = "rebooting".parse().unwrap();
        assert_eq!(state, ResourceState::Other("rebooting".to_string()));
        assert_eq!(state.to_string(), "rebooting");
        assert!(!state.is_halting());
    }

    #[test]
    fn state_serde_uses_wire_names() {
        let json = serde_json::to_string(&ResourceState::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting-down\"");
        let back: ResourceState = serde_json::from_str("\"rebooting\"").unwrap();
        assert_eq!(back, ResourceState::Other("rebooting".to_string()));
    }

    #[test]
    fn state_deserialises_case_insensitively() {
        let stopped: ResourceState = serde_json::from_str("\"Stopped\"").unwrap();
        assert_eq!(stopped, ResourceState::Stopped);
        assert!(stopped.is_halting());
        let running: ResourceState = serde_json::from_str("\"RUNNING\"").unwrap();
        assert!(running.is_running());
        let shutting: ResourceState = serde_json::from_str("\"shutting_down\"").unwrap();
        assert_eq!(shutting, ResourceState::ShuttingDown);
        assert!(serde_json::from_str::<ResourceState>("\"  \"").is_err());
    }

    #[test]
    fn alert_status_round_trips_through_str() {
        for status in [
            AlertStatus::Pending,
            AlertStatus::Sent,
            AlertStatus::Error,
            AlertStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<AlertStatus>().unwrap(), status);
        }
        assert!("completed".parse::<AlertStatus>().is_err());
    }
}
