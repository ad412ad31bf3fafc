//! The periodic dispatch engine.
//!
//! Each tick lists the regions that hold pending alerts and processes them
//! concurrently, one task per region. Inside a region, due records are grouped
//! by resource and at most one alert per resource is sent per tick: the
//! earliest due one. A region still being processed when the next tick starts
//! is skipped by that tick rather than processed twice.
//!
//! The retention sweep runs on its own interval and holds the write side of
//! a gate whose read side every region task holds, so purging never overlaps
//! in-flight sends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use runwatch_core::config::{DispatchConfig, RunwatchConfig};
use runwatch_core::runtime::runtime_minutes;
use runwatch_core::{AlertStatus, Clock, ControlError, ResourceControl};
use serde::Serialize;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::delivery::{runtime_alert_message, Delivery};
use crate::error::{AlertError, Result};
use crate::store::{AlertQuery, AlertStore};
use crate::tracker::StateTracker;
use crate::types::{AlertEvent, AlertRecord};

/// Loop intervals for [`Dispatcher::run`].
#[derive(Debug, Clone, Copy)]
pub struct EngineTimings {
    pub tick_every: Duration,
    pub sweep_every: Duration,
    /// Age after which finished records are purged.
    pub retention: chrono::Duration,
}

impl EngineTimings {
    pub fn from_config(cfg: &RunwatchConfig) -> Self {
        Self {
            tick_every: Duration::from_secs(cfg.dispatch.interval_secs.max(1)),
            sweep_every: Duration::from_secs(cfg.retention.sweep_interval_secs.max(1)),
            retention: chrono::Duration::hours(cfg.retention.max_age_hours as i64),
        }
    }
}

/// Counters for one tick, summed over its regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub regions: usize,
    pub skipped_regions: usize,
    pub sent: usize,
    pub failed: usize,
    pub retrying: usize,
    pub stale: usize,
    pub errors: usize,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.regions += other.regions;
        self.skipped_regions += other.skipped_regions;
        self.sent += other.sent;
        self.failed += other.failed;
        self.retrying += other.retrying;
        self.stale += other.stale;
        self.errors += other.errors;
    }

    pub fn is_quiet(&self) -> bool {
        self.sent + self.failed + self.retrying + self.stale + self.errors == 0
    }
}

/// How one resource group ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupOutcome {
    NothingDue,
    Sent,
    Failed,
    Retrying,
}

struct Inner {
    store: AlertStore,
    tracker: StateTracker,
    delivery: Delivery,
    clock: Arc<dyn Clock>,
    control: Option<Arc<dyn ResourceControl>>,
    max_tick_retries: u32,
    events: broadcast::Sender<AlertEvent>,
    /// Regions with a tick currently in progress.
    in_flight: DashSet<String>,
    /// Read: region ticks. Write: retention sweep.
    gate: RwLock<()>,
}

/// Removes the region from `in_flight` when the region task ends, however
/// it ends.
struct RegionClaim<'a> {
    in_flight: &'a DashSet<String>,
    region: String,
}

impl Drop for RegionClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.region);
    }
}

impl Inner {
    fn claim(&self, region: &str) -> Option<RegionClaim<'_>> {
        self.in_flight.insert(region.to_string()).then(|| RegionClaim {
            in_flight: &self.in_flight,
            region: region.to_string(),
        })
    }
}

/// Cheap to clone; clones drive the same engine.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// `control`, when given, is asked for the live resource state before
    /// every send.
    pub fn new(
        store: AlertStore,
        tracker: StateTracker,
        delivery: Delivery,
        clock: Arc<dyn Clock>,
        cfg: &DispatchConfig,
        control: Option<Arc<dyn ResourceControl>>,
        events: broadcast::Sender<AlertEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tracker,
                delivery,
                clock,
                control,
                max_tick_retries: cfg.max_tick_retries.max(1),
                events,
                in_flight: DashSet::new(),
                gate: RwLock::new(()),
            }),
        }
    }

    /// Run one tick over every region with pending alerts.
    ///
    /// A failing region is logged and counted; it never aborts the others.
    pub async fn tick(&self) -> Result<TickReport> {
        let regions = self.inner.store.pending_regions()?;
        let mut tasks = JoinSet::new();
        for region in regions {
            let this = self.clone();
            tasks.spawn(async move { this.tick_region(&region).await });
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(r)) => report.merge(r),
                Ok(Err(e)) => {
                    error!("region tick failed: {e}");
                    report.errors += 1;
                }
                Err(e) => {
                    error!("region tick task panicked: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Process one region, unless a previous tick is still working on it.
    #[instrument(skip(self))]
    pub async fn tick_region(&self, region: &str) -> Result<TickReport> {
        let mut report = TickReport::default();
        let Some(_claim) = self.inner.claim(region) else {
            debug!("region busy, skipping this tick");
            report.skipped_regions = 1;
            return Ok(report);
        };
        let _gate = self.inner.gate.read().await;
        report.regions = 1;

        let now = self.inner.clock.now();
        let due = self.inner.store.query(&AlertQuery {
            scheduled_at_or_before: Some(now),
            ..AlertQuery::dispatch_scan(region)
        })?;

        // Scan order is preserved within each group: earliest first.
        let mut groups: BTreeMap<String, Vec<AlertRecord>> = BTreeMap::new();
        for rec in due {
            groups.entry(rec.resource_id.clone()).or_default().push(rec);
        }

        for (resource_id, group) in groups {
            match self.dispatch_group(&group, now).await {
                Ok(GroupOutcome::NothingDue) => {}
                Ok(GroupOutcome::Sent) => report.sent += 1,
                Ok(GroupOutcome::Failed) => report.failed += 1,
                Ok(GroupOutcome::Retrying) => report.retrying += 1,
                Err(AlertError::StaleState { .. }) => report.stale += 1,
                Err(e) => {
                    error!(%resource_id, region, "alert group failed: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn dispatch_group(&self, group: &[AlertRecord], now: DateTime<Utc>) -> Result<GroupOutcome> {
        let Some(rec) = group.iter().find(|r| r.is_dispatchable(now)) else {
            return Ok(GroupOutcome::NothingDue);
        };
        self.verify_live(rec, now).await?;

        let inner = &self.inner;
        let runtime = runtime_minutes(rec.launch_time, now);
        let msg = runtime_alert_message(rec, runtime);

        match inner.delivery.send(rec, &msg, runtime).await {
            Ok(message_id) => {
                let pruned = inner.store.mark_sent_and_prune(rec, inner.clock.now())?;
                info!(
                    alert_id = %rec.id,
                    resource_id = %rec.resource_id,
                    threshold = rec.threshold_minutes,
                    runtime,
                    pruned,
                    "runtime alert sent"
                );
                let _ = inner.events.send(AlertEvent::Fired {
                    alert_id: rec.id.clone(),
                    resource_id: rec.resource_id.clone(),
                    region: rec.region.clone(),
                    threshold_minutes: rec.threshold_minutes,
                    message_id,
                });
                Ok(GroupOutcome::Sent)
            }
            Err(e) if e.is_fatal() => {
                inner.store.mark_error(&rec.id, &e.to_string(), inner.clock.now())?;
                self.emit_failed(rec, true, &e.to_string());
                Ok(GroupOutcome::Failed)
            }
            Err(e) => {
                let status = inner.store.record_transient_failure(
                    &rec.id,
                    &e.to_string(),
                    inner.clock.now(),
                    inner.max_tick_retries,
                )?;
                if status == AlertStatus::Error {
                    warn!(alert_id = %rec.id, "transient failures exhausted, alert marked error");
                    self.emit_failed(rec, false, &e.to_string());
                    Ok(GroupOutcome::Failed)
                } else {
                    Ok(GroupOutcome::Retrying)
                }
            }
        }
    }

    /// Re-check the resource right before sending. A record that changed
    /// since the scan, a resource the control API reports as not running, or
    /// a resource relaunched since arming cancels the whole group.
    async fn verify_live(&self, rec: &AlertRecord, now: DateTime<Utc>) -> Result<()> {
        let inner = &self.inner;
        let current = inner.store.get(&rec.id)?;
        let mut stale_reason = match current {
            Some(ref cur) if cur.is_dispatchable(now) => None,
            Some(ref cur) => Some(format!("state changed to {} before send", cur.resource_state)),
            None => Some("record vanished before send".to_string()),
        };

        if stale_reason.is_none() {
            if let Some(control) = &inner.control {
                stale_reason = match control.describe(&rec.resource_id, &rec.region).await {
                    Ok(desc) if !desc.state.is_running() => {
                        Some(format!("resource {} at send time", desc.state))
                    }
                    Ok(desc)
                        if desc
                            .launch_time
                            .is_some_and(|t| t.timestamp() != rec.launch_time.timestamp()) =>
                    {
                        Some("resource relaunched since alerts were armed".to_string())
                    }
                    Ok(_) => None,
                    Err(ControlError::NotFound { .. }) => Some("resource no longer exists".to_string()),
                    Err(e) => {
                        warn!(resource_id = %rec.resource_id, "state probe failed, using stored state: {e}");
                        None
                    }
                };
            }
        }

        match stale_reason {
            None => Ok(()),
            Some(reason) => {
                info!(alert_id = %rec.id, %reason, "stale alert group, not sending");
                inner.tracker.cancel(&rec.resource_id, &rec.region, &reason)?;
                Err(AlertError::StaleState {
                    resource_id: rec.resource_id.clone(),
                    region: rec.region.clone(),
                })
            }
        }
    }

    fn emit_failed(&self, rec: &AlertRecord, fatal: bool, error: &str) {
        let _ = self.inner.events.send(AlertEvent::Failed {
            alert_id: rec.id.clone(),
            resource_id: rec.resource_id.clone(),
            region: rec.region.clone(),
            fatal,
            error: error.to_string(),
        });
    }

    /// Purge records older than `max_age`. Waits for in-flight region ticks.
    pub async fn sweep(&self, max_age: chrono::Duration) -> Result<usize> {
        let _gate = self.inner.gate.write().await;
        let cutoff = self.inner.clock.now() - max_age;
        let purged = self.inner.store.purge(cutoff)?;
        if purged > 0 {
            info!(purged, %cutoff, "retention sweep purged alerts");
        }
        Ok(purged)
    }

    /// Drive ticks and sweeps until `shutdown` flips to `true`.
    ///
    /// Ticks are spawned so a slow region cannot delay the schedule; the
    /// region claim keeps overlapping ticks from touching the same region.
    pub async fn run(self, timings: EngineTimings, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = timings.tick_every.as_secs(),
            sweep_secs = timings.sweep_every.as_secs(),
            "dispatch engine started"
        );
        let mut ticks = tokio::time::interval(timings.tick_every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps = tokio::time::interval(timings.sweep_every);
        sweeps.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        match this.tick().await {
                            Ok(report) if !report.is_quiet() => info!(?report, "dispatch tick"),
                            Ok(_) => {}
                            Err(e) => error!("dispatch tick error: {e}"),
                        }
                    });
                }
                _ = sweeps.tick() => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.sweep(timings.retention).await {
                            error!("retention sweep error: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatch engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}
