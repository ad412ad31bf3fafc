use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use runwatch_core::{Clock, CountdownCanceller, ResourceControl, RunwatchError};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::error::{CountdownError, Result};
use crate::notifier::LocalNotifier;
use crate::plan::{next_step, Step};
use crate::storage::CountdownStorage;
use crate::types::{CountdownPhase, LocalCountdown, LocalNotice};

/// Longest single sleep. The timer re-derives its plan from the wall clock
/// at least this often, so a suspended process catches up on wake.
const MAX_SLEEP: Duration = Duration::from_secs(15);

/// A warning that wakes up later than this past its instant is dropped.
const LATE_WARNING_GRACE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing persisted for the resource.
    Idle,
    /// End time had passed; the stop action ran.
    Fired,
    /// Timer restarted for the remaining time.
    Resumed { remaining: chrono::Duration },
}

struct Inner {
    storage: Arc<dyn CountdownStorage>,
    control: Arc<dyn ResourceControl>,
    notifier: Arc<dyn LocalNotifier>,
    clock: Arc<dyn Clock>,
    leads: Vec<u64>,
    timers: DashMap<String, JoinHandle<()>>,
    phases: DashMap<String, CountdownPhase>,
}

/// Client-side auto-stop countdowns that survive suspension and restarts.
///
/// Only the absolute end time is persisted. Every resume re-reads it and
/// either fires at once (end already passed) or starts a fresh timer for
/// what is left. Timers must be started from inside a Tokio runtime.
#[derive(Clone)]
pub struct CountdownReconciler {
    inner: Arc<Inner>,
}

impl CountdownReconciler {
    pub fn new(
        storage: Arc<dyn CountdownStorage>,
        control: Arc<dyn ResourceControl>,
        notifier: Arc<dyn LocalNotifier>,
        clock: Arc<dyn Clock>,
        warning_leads_secs: &[u64],
    ) -> Self {
        let mut leads = warning_leads_secs.to_vec();
        leads.sort_unstable_by(|a, b| b.cmp(a));
        leads.dedup();
        Self {
            inner: Arc::new(Inner {
                storage,
                control,
                notifier,
                clock,
                leads,
                timers: DashMap::new(),
                phases: DashMap::new(),
            }),
        }
    }

    /// Persist `now + duration` as the stop instant, then start the timer.
    #[instrument(skip(self, resource_name))]
    pub fn arm(
        &self,
        resource_id: &str,
        resource_name: &str,
        region: &str,
        duration: Duration,
    ) -> Result<LocalCountdown> {
        if duration.is_zero() {
            return Err(CountdownError::InvalidDuration("duration must be positive".into()));
        }
        let span = chrono::Duration::from_std(duration)
            .map_err(|e| CountdownError::InvalidDuration(e.to_string()))?;

        let end_time = self
            .inner
            .clock
            .now()
            .checked_add_signed(span)
            .ok_or_else(|| CountdownError::InvalidDuration(format!("{duration:?} is out of range")))?;

        let countdown = LocalCountdown {
            resource_id: resource_id.to_string(),
            resource_name: resource_name.to_string(),
            region: region.to_string(),
            end_time,
            enabled: true,
        };
        // Storage first: a crash before the timer starts is recovered by resume.
        self.inner.storage.save(&countdown)?;
        self.inner
            .phases
            .insert(resource_id.to_string(), CountdownPhase::Armed);
        self.start_timer(countdown.clone());

        info!(end_time = %countdown.end_time, "auto-stop countdown armed");
        Ok(countdown)
    }

    /// Reconcile one resource after an app start or resume from background.
    #[instrument(skip(self))]
    pub async fn resume(&self, resource_id: &str) -> Result<ResumeOutcome> {
        let Some(countdown) = self.inner.storage.load(resource_id)? else {
            return Ok(ResumeOutcome::Idle);
        };
        if !countdown.enabled {
            self.inner.storage.delete(resource_id)?;
            return Ok(ResumeOutcome::Idle);
        }

        let now = self.inner.clock.now();
        if countdown.is_due(now) {
            info!(overdue_secs = (now - countdown.end_time).num_seconds(), "countdown expired while away");
            self.fire(&countdown, true).await;
            return Ok(ResumeOutcome::Fired);
        }

        let remaining = countdown.remaining(now);
        self.inner
            .phases
            .insert(resource_id.to_string(), CountdownPhase::Armed);
        self.start_timer(countdown);
        Ok(ResumeOutcome::Resumed { remaining })
    }

    /// [`CountdownReconciler::resume`] for every persisted countdown.
    pub async fn resume_all(&self) -> Result<Vec<(String, ResumeOutcome)>> {
        let mut out = Vec::new();
        for countdown in self.inner.storage.list()? {
            let outcome = self.resume(&countdown.resource_id).await?;
            out.push((countdown.resource_id, outcome));
        }
        Ok(out)
    }

    /// Drop the persisted countdown and stop its timer. Returns whether a
    /// countdown existed.
    #[instrument(skip(self))]
    pub fn cancel(&self, resource_id: &str) -> Result<bool> {
        let persisted = self.inner.storage.delete(resource_id)?;
        let running = match self.inner.timers.remove(resource_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        };
        if persisted || running {
            self.inner
                .phases
                .insert(resource_id.to_string(), CountdownPhase::Cancelled);
            info!("auto-stop countdown cancelled");
        }
        Ok(persisted || running)
    }

    pub fn phase(&self, resource_id: &str) -> CountdownPhase {
        self.inner
            .phases
            .get(resource_id)
            .map(|p| *p)
            .unwrap_or(CountdownPhase::Idle)
    }

    pub fn countdowns(&self) -> Result<Vec<LocalCountdown>> {
        self.inner.storage.list()
    }

    /// Time left, always derived from the persisted end time.
    pub fn remaining(&self, resource_id: &str) -> Result<Option<chrono::Duration>> {
        let now = self.inner.clock.now();
        Ok(self
            .inner
            .storage
            .load(resource_id)?
            .map(|c| c.remaining(now)))
    }

    fn start_timer(&self, countdown: LocalCountdown) {
        let this = self.clone();
        let resource_id = countdown.resource_id.clone();
        let handle = tokio::spawn(async move { this.run_timer(countdown).await });
        if let Some(previous) = self.inner.timers.insert(resource_id, handle) {
            previous.abort();
        }
    }

    async fn run_timer(&self, countdown: LocalCountdown) {
        let inner = &self.inner;
        let mut emitted = BTreeSet::new();
        loop {
            let now = inner.clock.now();
            let step = next_step(countdown.end_time, now, &inner.leads, &emitted);
            let wait = (step.at() - now).to_std().unwrap_or(Duration::ZERO);
            if wait > MAX_SLEEP {
                tokio::time::sleep(MAX_SLEEP).await;
                continue;
            }
            tokio::time::sleep(wait).await;

            match step {
                Step::Warn { lead_secs, at } => {
                    emitted.insert(lead_secs);
                    if inner.clock.now() - at > chrono::Duration::seconds(LATE_WARNING_GRACE_SECS) {
                        continue;
                    }
                    inner
                        .notifier
                        .notify(LocalNotice::Warning {
                            resource_id: countdown.resource_id.clone(),
                            resource_name: countdown.resource_name.clone(),
                            lead_secs,
                        })
                        .await;
                }
                Step::Fire { .. } => {
                    self.fire(&countdown, false).await;
                    return;
                }
            }
        }
    }

    /// Stop timer, clear storage, stop the resource, then tell the user.
    ///
    /// Runs at most once per armed countdown even if the timer and a resume
    /// race. The stop is not retried here.
    async fn fire(&self, countdown: &LocalCountdown, abort_timer: bool) {
        let inner = &self.inner;
        let id = &countdown.resource_id;
        if inner.phases.insert(id.clone(), CountdownPhase::Fired) == Some(CountdownPhase::Fired) {
            // Already fired; a leftover row means an earlier clear failed.
            if let Err(e) = inner.storage.delete(id) {
                error!(resource_id = %id, "failed to clear countdown: {e}");
            }
            return;
        }

        if let Some((_, handle)) = inner.timers.remove(id) {
            if abort_timer {
                handle.abort();
            }
        }
        if let Err(e) = inner.storage.delete(id) {
            error!(resource_id = %id, "failed to clear countdown: {e}");
        }

        let notice = match inner.control.stop(id, &countdown.region).await {
            Ok(()) => {
                info!(resource_id = %id, "auto-stop issued");
                LocalNotice::Stopped {
                    resource_id: id.clone(),
                    resource_name: countdown.resource_name.clone(),
                }
            }
            Err(e) => {
                warn!(resource_id = %id, "auto-stop failed: {e}");
                LocalNotice::StopFailed {
                    resource_id: id.clone(),
                    resource_name: countdown.resource_name.clone(),
                    error: e.to_string(),
                }
            }
        };
        inner.notifier.notify(notice).await;
    }
}

impl CountdownCanceller for CountdownReconciler {
    fn cancel_countdown(&self, resource_id: &str) -> runwatch_core::Result<()> {
        self.cancel(resource_id)
            .map(|_| ())
            .map_err(|e| RunwatchError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteCountdownStorage;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use runwatch_core::{ControlError, ManualClock, ResourceDescription, ResourceState};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingControl {
        stops: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ResourceControl for RecordingControl {
        async fn describe(
            &self,
            _resource_id: &str,
            _region: &str,
        ) -> std::result::Result<ResourceDescription, ControlError> {
            Ok(ResourceDescription {
                state: ResourceState::Running,
                launch_time: None,
            })
        }

        async fn stop(&self, resource_id: &str, _region: &str) -> std::result::Result<(), ControlError> {
            self.stops.lock().unwrap().push(resource_id.to_string());
            if self.fail {
                return Err(ControlError::Unavailable("throttled".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Inbox {
        notices: Mutex<Vec<LocalNotice>>,
    }

    #[async_trait]
    impl LocalNotifier for Inbox {
        async fn notify(&self, notice: LocalNotice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    /// Wall clock that moves with Tokio's (possibly paused) timer.
    struct TokioClock {
        base: DateTime<Utc>,
        start: tokio::time::Instant,
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
    }

    struct Fixture {
        reconciler: CountdownReconciler,
        storage: Arc<SqliteCountdownStorage>,
        control: Arc<RecordingControl>,
        inbox: Arc<Inbox>,
    }

    fn fixture(clock: Arc<dyn Clock>, control: RecordingControl, leads: &[u64]) -> Fixture {
        let storage = Arc::new(SqliteCountdownStorage::open_in_memory().unwrap());
        let control = Arc::new(control);
        let inbox = Arc::new(Inbox::default());
        let reconciler =
            CountdownReconciler::new(storage.clone(), control.clone(), inbox.clone(), clock, leads);
        Fixture {
            reconciler,
            storage,
            control,
            inbox,
        }
    }

    #[tokio::test]
    async fn resume_after_suspension_fires_immediately() {
        let clock = ManualClock::new(t0());
        let f = fixture(Arc::new(clock.clone()), RecordingControl::default(), &[]);

        let armed = f.reconciler.arm("i-1", "web", "r1", Duration::from_secs(60)).unwrap();
        assert_eq!(armed.end_time, t0() + chrono::Duration::seconds(60));
        assert_eq!(f.storage.load("i-1").unwrap(), Some(armed));

        // Suspended: wall time moves, no timer runs.
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(f.reconciler.resume("i-1").await.unwrap(), ResumeOutcome::Fired);

        assert_eq!(*f.control.stops.lock().unwrap(), vec!["i-1".to_string()]);
        assert!(f.storage.load("i-1").unwrap().is_none());
        assert_eq!(f.reconciler.phase("i-1"), CountdownPhase::Fired);
        assert!(matches!(
            f.inbox.notices.lock().unwrap().as_slice(),
            [LocalNotice::Stopped { .. }]
        ));

        // Nothing left to reconcile.
        assert_eq!(f.reconciler.resume("i-1").await.unwrap(), ResumeOutcome::Idle);
        assert_eq!(f.control.stops.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resume_before_end_restarts_timer_for_the_rest() {
        let clock = ManualClock::new(t0());
        let f = fixture(Arc::new(clock.clone()), RecordingControl::default(), &[]);
        f.reconciler.arm("i-1", "web", "r1", Duration::from_secs(600)).unwrap();

        clock.advance(chrono::Duration::seconds(240));
        assert_eq!(
            f.reconciler.resume("i-1").await.unwrap(),
            ResumeOutcome::Resumed {
                remaining: chrono::Duration::seconds(360)
            }
        );
        assert_eq!(f.reconciler.remaining("i-1").unwrap(), Some(chrono::Duration::seconds(360)));
        assert!(f.control.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_stop_still_clears_state() {
        let clock = ManualClock::new(t0());
        let control = RecordingControl {
            fail: true,
            ..Default::default()
        };
        let f = fixture(Arc::new(clock.clone()), control, &[]);
        f.reconciler.arm("i-1", "web", "r1", Duration::from_secs(60)).unwrap();

        clock.advance(chrono::Duration::seconds(61));
        f.reconciler.resume("i-1").await.unwrap();

        assert!(f.storage.load("i-1").unwrap().is_none());
        let notices = f.inbox.notices.lock().unwrap();
        assert!(matches!(notices.as_slice(), [LocalNotice::StopFailed { .. }]));
        assert!(notices[0].body().contains("throttled"));
    }

    #[tokio::test]
    async fn cancel_clears_storage_and_timer() {
        let clock = ManualClock::new(t0());
        let f = fixture(Arc::new(clock.clone()), RecordingControl::default(), &[]);
        f.reconciler.arm("i-1", "web", "r1", Duration::from_secs(60)).unwrap();

        assert!(f.reconciler.cancel("i-1").unwrap());
        assert_eq!(f.reconciler.phase("i-1"), CountdownPhase::Cancelled);
        assert!(!f.reconciler.cancel("i-1").unwrap());

        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(f.reconciler.resume("i-1").await.unwrap(), ResumeOutcome::Idle);
        assert!(f.control.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_duration_is_rejected() {
        let f = fixture(Arc::new(ManualClock::new(t0())), RecordingControl::default(), &[]);
        assert!(matches!(
            f.reconciler.arm("i-1", "web", "r1", Duration::ZERO),
            Err(CountdownError::InvalidDuration(_))
        ));
        assert!(f.storage.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_duration_is_rejected() {
        let f = fixture(Arc::new(ManualClock::new(t0())), RecordingControl::default(), &[]);
        let huge = Duration::from_secs(1_000_000_000_000_000);
        assert!(matches!(
            f.reconciler.arm("i-1", "web", "r1", huge),
            Err(CountdownError::InvalidDuration(_))
        ));
        assert!(f.storage.list().unwrap().is_empty());
        assert_eq!(f.reconciler.phase("i-1"), CountdownPhase::Idle);
    }

    #[tokio::test]
    async fn stale_row_after_fire_is_cleared_on_resume() {
        let clock = ManualClock::new(t0());
        let f = fixture(Arc::new(clock.clone()), RecordingControl::default(), &[]);
        let armed = f.reconciler.arm("i-1", "web", "r1", Duration::from_secs(60)).unwrap();
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(f.reconciler.resume("i-1").await.unwrap(), ResumeOutcome::Fired);

        // The row comes back as if the earlier delete had not stuck.
        f.storage.save(&armed).unwrap();
        assert_eq!(f.reconciler.resume("i-1").await.unwrap(), ResumeOutcome::Fired);
        assert!(f.storage.load("i-1").unwrap().is_none());
        assert_eq!(f.reconciler.resume("i-1").await.unwrap(), ResumeOutcome::Idle);
        assert_eq!(f.control.stops.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_warns_then_stops() {
        let clock = Arc::new(TokioClock {
            base: t0(),
            start: tokio::time::Instant::now(),
        });
        let f = fixture(clock, RecordingControl::default(), &[300, 60]);
        f.reconciler.arm("i-1", "web", "r1", Duration::from_secs(120)).unwrap();

        tokio::time::sleep(Duration::from_secs(180)).await;

        let notices = f.inbox.notices.lock().unwrap().clone();
        assert_eq!(notices.len(), 2, "{notices:?}");
        // The 5 minute lead was already past at arm time.
        assert_eq!(notices[0].key(), "i-1-warning-60");
        assert!(matches!(notices[1], LocalNotice::Stopped { .. }));
        assert_eq!(f.control.stops.lock().unwrap().len(), 1);
        assert_eq!(f.reconciler.phase("i-1"), CountdownPhase::Fired);
    }
}
