//! Push delivery with bounded exponential backoff.
//!
//! [`Delivery`] wraps a [`PushTransport`] and classifies its failures: a bad
//! or unregistered target is fatal and returned immediately, everything else
//! is retried until `max_attempts` is used up. Both outcomes are appended to
//! the [`HistoryLog`] so the user sees a failed alert, not silence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runwatch_core::config::DeliveryConfig;
use runwatch_core::Clock;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::history::{HistoryEntry, HistoryKind, HistoryLog};
use crate::types::AlertRecord;

/// A single push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub target: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

/// What a push transport reports on failure.
#[derive(Debug, Clone, Error)]
pub enum PushError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("unregistered target: {0}")]
    UnregisteredTarget(String),

    /// Network, server or quota trouble. Worth retrying.
    #[error("transport error: {0}")]
    Transport(String),
}

/// The external `send(target, title, body, data) -> messageId` primitive.
#[async_trait]
pub trait PushTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, msg: &PushMessage) -> std::result::Result<String, PushError>;
}

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Target can never receive pushes. Not retried.
    #[error("fatal delivery error ({code}): {reason}")]
    Fatal { code: &'static str, reason: String },

    /// Every attempt failed transiently.
    #[error("delivery failed after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: String },
}

impl DeliveryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeliveryError::Fatal { .. })
    }
}

/// Retry schedule: attempt `n` (1-based) waits `min(base * 2^(n-1), cap)`
/// before attempt `n + 1`.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl DeliveryPolicy {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_cap: Duration::from_millis(cfg.backoff_cap_ms),
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

/// Build the runtime alert push for `rec` after `runtime_minutes` of runtime.
pub fn runtime_alert_message(rec: &AlertRecord, runtime_minutes: i64) -> PushMessage {
    let body = format!(
        "{} has been running for {}",
        rec.resource_name,
        runwatch_core::runtime::format_runtime(runtime_minutes)
    );
    let data = BTreeMap::from([
        ("type".to_string(), "runtime_alert".to_string()),
        ("alertId".to_string(), rec.id.clone()),
        ("resourceId".to_string(), rec.resource_id.clone()),
        ("resourceName".to_string(), rec.resource_name.clone()),
        ("region".to_string(), rec.region.clone()),
        ("runtime".to_string(), runtime_minutes.to_string()),
        ("threshold".to_string(), rec.threshold_minutes.to_string()),
        ("launchTime".to_string(), rec.launch_time.to_rfc3339()),
    ]);
    PushMessage {
        target: rec.delivery_target.clone(),
        title: "Runtime Alert".to_string(),
        body,
        data,
    }
}

/// Retrying, history-logging front of a push transport.
pub struct Delivery {
    transport: Arc<dyn PushTransport>,
    history: HistoryLog,
    clock: Arc<dyn Clock>,
    policy: DeliveryPolicy,
}

impl Delivery {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        history: HistoryLog,
        clock: Arc<dyn Clock>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            transport,
            history,
            clock,
            policy,
        }
    }

    /// Send `msg` on behalf of alert `rec`, retrying transient failures.
    ///
    /// Exactly one history entry is appended per call, on success or on the
    /// terminal failure. A history write failure is logged, never returned:
    /// it must not turn a delivered push into a retry.
    pub async fn send(
        &self,
        rec: &AlertRecord,
        msg: &PushMessage,
        runtime_minutes: i64,
    ) -> Result<String, DeliveryError> {
        let transport = self.transport.name();
        let mut last = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.transport.send(msg).await {
                Ok(message_id) => {
                    if attempt > 1 {
                        info!(alert_id = %rec.id, %transport, attempt, "push succeeded after retry");
                    }
                    self.record(rec, msg, runtime_minutes, Ok(&message_id));
                    return Ok(message_id);
                }
                Err(e @ (PushError::InvalidTarget(_) | PushError::UnregisteredTarget(_))) => {
                    error!(alert_id = %rec.id, %transport, err = %e, "fatal push error, not retrying");
                    let code = match e {
                        PushError::InvalidTarget(_) => "invalid-target",
                        _ => "unregistered-target",
                    };
                    let err = DeliveryError::Fatal {
                        code,
                        reason: e.to_string(),
                    };
                    self.record(rec, msg, runtime_minutes, Err(&err));
                    return Err(err);
                }
                Err(e) => {
                    warn!(alert_id = %rec.id, %transport, attempt, err = %e, "push attempt failed");
                    last = e.to_string();
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        let err = DeliveryError::TransientExhausted {
            attempts: self.policy.max_attempts,
            last,
        };
        self.record(rec, msg, runtime_minutes, Err(&err));
        Err(err)
    }

    fn record(
        &self,
        rec: &AlertRecord,
        msg: &PushMessage,
        runtime_minutes: i64,
        outcome: Result<&String, &DeliveryError>,
    ) {
        let kind = match outcome {
            Ok(_) => HistoryKind::Delivered,
            Err(_) => HistoryKind::DeliveryFailed,
        };
        let mut entry = HistoryEntry::new(
            kind,
            &rec.resource_id,
            &rec.resource_name,
            &rec.region,
            &msg.title,
            &msg.body,
            self.clock.now(),
        );
        entry.alert_id = Some(rec.id.clone());
        entry.threshold_minutes = Some(rec.threshold_minutes);
        entry.runtime_minutes = Some(runtime_minutes);
        entry.data = msg.data.clone();
        match outcome {
            Ok(id) => entry.message_id = Some(id.clone()),
            Err(e) => entry.error = Some(e.to_string()),
        }
        if let Err(e) = self.history.append(&entry) {
            error!(alert_id = %rec.id, "history append failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AlertStore;
    use chrono::{TimeZone, Utc};
    use runwatch_core::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays a scripted sequence of results, then succeeds.
    struct Scripted {
        calls: AtomicU32,
        script: Mutex<Vec<std::result::Result<String, PushError>>>,
    }

    impl Scripted {
        fn new(mut script: Vec<std::result::Result<String, PushError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl PushTransport for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn send(&self, _msg: &PushMessage) -> std::result::Result<String, PushError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("msg-default".to_string()))
        }
    }

    fn fixture(
        transport: Arc<Scripted>,
    ) -> (Delivery, HistoryLog, AlertRecord, PushMessage) {
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let store = AlertStore::open_in_memory().unwrap();
        let history = HistoryLog::new(store.connection());
        let clock = Arc::new(ManualClock::new(t0));
        let delivery = Delivery::new(transport, history.clone(), clock, DeliveryPolicy::default());
        let rec = AlertRecord::new("i-1", "web", "r1", t0, 30, "tok-123456", t0);
        let msg = runtime_alert_message(&rec, 31);
        (delivery, history, rec, msg)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = DeliveryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(9), Duration::from_secs(4));
    }

    #[test]
    fn message_carries_runtime_and_threshold() {
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let rec = AlertRecord::new("i-1", "web", "r1", t0, 120, "tok", t0);
        let msg = runtime_alert_message(&rec, 125);
        assert_eq!(msg.body, "web has been running for 2h 5m");
        assert_eq!(msg.data["threshold"], "120");
        assert_eq!(msg.data["runtime"], "125");
        assert_eq!(msg.data["type"], "runtime_alert");
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_target_is_not_retried() {
        let transport = Scripted::new(vec![Err(PushError::UnregisteredTarget("gone".into()))]);
        let (delivery, history, rec, msg) = fixture(transport.clone());

        let err = delivery.send(&rec, &msg, 31).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let feed = history.recent(10).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, HistoryKind::DeliveryFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_with_growing_delay() {
        let transport = Scripted::new(vec![
            Err(PushError::Transport("503".into())),
            Err(PushError::Transport("503".into())),
            Err(PushError::Transport("503".into())),
        ]);
        let (delivery, history, rec, msg) = fixture(transport.clone());

        let started = tokio::time::Instant::now();
        let err = delivery.send(&rec, &msg, 31).await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, DeliveryError::TransientExhausted { attempts: 3, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second, none after the last.
        assert!(waited >= Duration::from_secs(3), "waited {waited:?}");
        assert!(waited < Duration::from_secs(7), "waited {waited:?}");
        assert_eq!(history.recent(10).unwrap()[0].kind, HistoryKind::DeliveryFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_logs_delivered_once() {
        let transport = Scripted::new(vec![
            Err(PushError::Transport("reset".into())),
            Ok("msg-42".into()),
        ]);
        let (delivery, history, rec, msg) = fixture(transport.clone());

        assert_eq!(delivery.send(&rec, &msg, 31).await.unwrap(), "msg-42");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        let feed = history.recent(10).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, HistoryKind::Delivered);
        assert_eq!(feed[0].message_id.as_deref(), Some("msg-42"));
    }
}
