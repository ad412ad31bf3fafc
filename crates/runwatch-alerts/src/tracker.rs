use std::sync::Arc;

use runwatch_core::{Clock, ResourceState};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::history::{HistoryEntry, HistoryKind, HistoryLog};
use crate::store::AlertStore;
use crate::types::AlertEvent;

/// What a lifecycle transition did to the alerts of one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateChangeOutcome {
    /// Records soft-deleted because the resource is halting.
    pub cancelled: usize,
    /// Records whose mirrored `resource_state` was rewritten.
    pub updated: usize,
}

/// Keeps alert records consistent with the resource lifecycle.
///
/// A halting state (stopping, stopped, shutting-down, terminated) cancels
/// every live alert of the resource. `running` is a no-op; alerts are only
/// ever created through the registrar. Anything else is mirrored onto the
/// records so the dispatch scan skips them.
#[derive(Clone)]
pub struct StateTracker {
    store: AlertStore,
    history: HistoryLog,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<AlertEvent>,
}

impl StateTracker {
    pub fn new(
        store: AlertStore,
        history: HistoryLog,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<AlertEvent>,
    ) -> Self {
        Self {
            store,
            history,
            clock,
            events,
        }
    }

    #[instrument(skip(self, state), fields(state = %state))]
    pub fn on_state_change(
        &self,
        resource_id: &str,
        region: &str,
        state: &ResourceState,
    ) -> Result<StateChangeOutcome> {
        if state.is_halting() {
            let cancelled = self.cancel(resource_id, region, &format!("resource {state}"))?;
            return Ok(StateChangeOutcome {
                cancelled,
                updated: 0,
            });
        }
        if state.is_running() {
            return Ok(StateChangeOutcome::default());
        }

        let updated = self
            .store
            .update_resource_state(resource_id, region, state, self.clock.now())?;
        if updated > 0 {
            info!(resource_id, region, updated, "mirrored resource state onto alerts");
        }
        Ok(StateChangeOutcome {
            cancelled: 0,
            updated,
        })
    }

    /// Soft-delete every live alert of a resource and record why.
    ///
    /// Idempotent: a second call finds nothing live and writes no history.
    pub fn cancel(&self, resource_id: &str, region: &str, reason: &str) -> Result<usize> {
        let live = self.store.live_for_resource(resource_id, region)?;
        let now = self.clock.now();
        let cancelled = self.store.cancel_resource(resource_id, region, reason, now)?;
        if cancelled == 0 {
            return Ok(0);
        }

        let name = live
            .first()
            .map(|r| r.resource_name.clone())
            .unwrap_or_else(|| resource_id.to_string());
        let mut entry = HistoryEntry::new(
            HistoryKind::AlertsCancelled,
            resource_id,
            &name,
            region,
            "Alerts cancelled",
            &format!("{cancelled} runtime alert(s) for {name} cancelled: {reason}"),
            now,
        );
        entry.error = Some(reason.to_string());
        if let Err(e) = self.history.append(&entry) {
            warn!(resource_id, "history append failed: {e}");
        }

        info!(resource_id, region, cancelled, reason, "alerts cancelled");
        let _ = self.events.send(AlertEvent::Cancelled {
            resource_id: resource_id.to_string(),
            region: region.to_string(),
            count: cancelled,
            reason: reason.to_string(),
        });
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertRecord;
    use chrono::{TimeZone, Utc};
    use runwatch_core::ManualClock;

    fn setup() -> (StateTracker, AlertStore, HistoryLog, broadcast::Receiver<AlertEvent>) {
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let store = AlertStore::open_in_memory().unwrap();
        let history = HistoryLog::new(store.connection());
        let (tx, rx) = broadcast::channel(16);
        let tracker = StateTracker::new(
            store.clone(),
            history.clone(),
            Arc::new(ManualClock::new(t0)),
            tx,
        );
        store
            .upsert_batch(&[
                AlertRecord::new("i-1", "web", "r1", t0, 30, "tok", t0),
                AlertRecord::new("i-1", "web", "r1", t0, 60, "tok", t0),
            ])
            .unwrap();
        (tracker, store, history, rx)
    }

    #[test]
    fn halting_state_cancels_everything() {
        let (tracker, store, history, mut rx) = setup();

        let out = tracker
            .on_state_change("i-1", "r1", &ResourceState::Stopped)
            .unwrap();
        assert_eq!(out.cancelled, 2);
        assert_eq!(store.count_live("i-1", "r1").unwrap(), 0);

        let feed = history.for_resource("i-1", 10).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, HistoryKind::AlertsCancelled);
        assert!(matches!(rx.try_recv().unwrap(), AlertEvent::Cancelled { count: 2, .. }));

        // Replayed transition is harmless.
        let again = tracker
            .on_state_change("i-1", "r1", &ResourceState::Terminated)
            .unwrap();
        assert_eq!(again, StateChangeOutcome::default());
        assert_eq!(history.for_resource("i-1", 10).unwrap().len(), 1);
    }

    #[test]
    fn running_is_a_noop() {
        let (tracker, store, _, _) = setup();
        let out = tracker
            .on_state_change("i-1", "r1", &ResourceState::Running)
            .unwrap();
        assert_eq!(out, StateChangeOutcome::default());
        assert_eq!(store.count_live("i-1", "r1").unwrap(), 2);
    }

    #[test]
    fn other_states_are_mirrored() {
        let (tracker, store, _, _) = setup();
        let out = tracker
            .on_state_change("i-1", "r1", &ResourceState::Pending)
            .unwrap();
        assert_eq!(out.updated, 2);
        assert!(store
            .query(&crate::store::AlertQuery::dispatch_scan("r1"))
            .unwrap()
            .is_empty());
        assert_eq!(store.count_live("i-1", "r1").unwrap(), 2);
    }
}
