use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use runwatch_core::config::RegistrarConfig;
use runwatch_core::{Clock, CountdownCanceller};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::error::{AlertError, Result};
use crate::store::AlertStore;
use crate::types::{AlertEvent, AlertRecord, ArmRequest};

/// Turns "alert me at these runtimes" into persisted [`AlertRecord`]s.
pub struct Registrar {
    store: AlertStore,
    clock: Arc<dyn Clock>,
    cooldown: chrono::Duration,
    /// Last accepted arm per region.
    last_armed: DashMap<String, DateTime<Utc>>,
    countdowns: Option<Arc<dyn CountdownCanceller>>,
    events: broadcast::Sender<AlertEvent>,
}

impl Registrar {
    pub fn new(
        store: AlertStore,
        clock: Arc<dyn Clock>,
        cfg: &RegistrarConfig,
        events: broadcast::Sender<AlertEvent>,
    ) -> Self {
        Self {
            store,
            clock,
            cooldown: chrono::Duration::seconds(cfg.region_cooldown_secs as i64),
            last_armed: DashMap::new(),
            countdowns: None,
            events,
        }
    }

    /// Also clear the local auto-stop countdown on [`Registrar::disarm`].
    pub fn with_countdowns(mut self, countdowns: Arc<dyn CountdownCanceller>) -> Self {
        self.countdowns = Some(countdowns);
        self
    }

    /// Upsert one record per future threshold and return how many were written.
    ///
    /// Thresholds already in the past are skipped. A second call for the same
    /// region inside the cooldown window writes nothing and returns `Ok(0)`.
    #[instrument(skip(self, req), fields(resource_id = %req.resource_id, region = %req.region))]
    pub fn arm(&self, req: &ArmRequest) -> Result<usize> {
        let thresholds = validate(req)?;
        let now = self.clock.now();

        if !self.reserve_region(&req.region, now) {
            debug!("region armed within cooldown, ignoring");
            return Ok(0);
        }

        let name = req
            .resource_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&req.resource_id);

        let records: Vec<AlertRecord> = thresholds
            .into_iter()
            .map(|minutes| {
                AlertRecord::new(
                    &req.resource_id,
                    name,
                    &req.region,
                    req.launch_time,
                    minutes,
                    &req.delivery_target,
                    now,
                )
            })
            .filter(|rec| rec.scheduled_time > now)
            .collect();

        if records.is_empty() {
            debug!("every threshold already passed");
            return Ok(0);
        }
        if let Err(e) = self.store.upsert_batch(&records) {
            // Nothing was written, so a retry must not be swallowed by the cooldown.
            self.last_armed.remove_if(&req.region, |_, stamp| *stamp == now);
            return Err(e);
        }

        info!(count = records.len(), "runtime alerts armed");
        let _ = self.events.send(AlertEvent::Armed {
            resource_id: req.resource_id.clone(),
            region: req.region.clone(),
            count: records.len(),
        });
        Ok(records.len())
    }

    /// Stamp `region` as armed at `now` unless it was armed inside the
    /// cooldown window. Check and stamp happen under one shard lock.
    fn reserve_region(&self, region: &str, now: DateTime<Utc>) -> bool {
        match self.last_armed.entry(region.to_string()) {
            Entry::Occupied(mut last) => {
                if now - *last.get() < self.cooldown {
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Cancel every live alert of the resource and clear its local countdown.
    #[instrument(skip(self))]
    pub fn disarm(&self, resource_id: &str, region: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .store
            .live_for_resource(resource_id, region)?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let cancelled = self
            .store
            .batch_delete(&ids, "disarmed", self.clock.now())?;

        if let Some(countdowns) = &self.countdowns {
            if let Err(e) = countdowns.cancel_countdown(resource_id) {
                warn!(resource_id, "failed to clear local countdown: {e}");
            }
        }

        info!(cancelled, "runtime alerts disarmed");
        let _ = self.events.send(AlertEvent::Disarmed {
            resource_id: resource_id.to_string(),
            region: region.to_string(),
            count: cancelled,
        });
        Ok(cancelled)
    }

    pub fn alerts_for_resource(&self, resource_id: &str, region: &str) -> Result<Vec<AlertRecord>> {
        self.store.live_for_resource(resource_id, region)
    }
}

/// Reject malformed requests before anything is written. Returns the
/// thresholds as whole minutes, deduplicated and ascending.
fn validate(req: &ArmRequest) -> Result<Vec<u32>> {
    if req.resource_id.trim().is_empty() {
        return Err(AlertError::Validation("resource id is required".into()));
    }
    if req.region.trim().is_empty() {
        return Err(AlertError::Validation("region is required".into()));
    }
    if req.delivery_target.trim().is_empty() {
        return Err(AlertError::Validation("delivery target is required".into()));
    }
    if !req.resource_state.is_running() {
        return Err(AlertError::Validation(format!(
            "resource must be running to arm alerts (is {})",
            req.resource_state
        )));
    }
    if req.thresholds.is_empty() {
        return Err(AlertError::Validation("at least one threshold is required".into()));
    }

    let mut minutes = Vec::with_capacity(req.thresholds.len());
    for t in &req.thresholds {
        let secs = t.as_secs();
        if secs == 0 || secs % 60 != 0 || t.subsec_nanos() != 0 {
            return Err(AlertError::Validation(format!(
                "threshold {t:?} is not a positive whole number of minutes"
            )));
        }
        let m = u32::try_from(secs / 60)
            .map_err(|_| AlertError::Validation(format!("threshold {t:?} is too large")))?;
        minutes.push(m);
    }
    minutes.sort_unstable();
    minutes.dedup();
    Ok(minutes)
}
