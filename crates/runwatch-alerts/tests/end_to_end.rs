use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use runwatch_alerts::{
    AlertEvent, AlertStore, ArmRequest, Delivery, DeliveryPolicy, Dispatcher, HistoryKind,
    HistoryLog, PushError, PushMessage, PushTransport, Registrar, StateTracker,
};
use runwatch_core::config::{DispatchConfig, RegistrarConfig};
use runwatch_core::{Clock, ManualClock, ResourceState};
use tokio::sync::broadcast;

#[derive(Default)]
struct CapturingTransport {
    sent: Mutex<Vec<PushMessage>>,
}

#[async_trait]
impl PushTransport for CapturingTransport {
    fn name(&self) -> &str {
        "capture"
    }

    async fn send(&self, msg: &PushMessage) -> Result<String, PushError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(msg.clone());
        Ok(format!("m{}", sent.len()))
    }
}

struct Engine {
    registrar: Registrar,
    tracker: StateTracker,
    dispatcher: Dispatcher,
    store: AlertStore,
    history: HistoryLog,
    transport: Arc<CapturingTransport>,
    clock: ManualClock,
    events: broadcast::Receiver<AlertEvent>,
}

fn engine() -> Engine {
    let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();
    let clock = ManualClock::new(t0);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = AlertStore::open_in_memory().unwrap();
    let history = HistoryLog::new(store.connection());
    let (tx, rx) = broadcast::channel(64);
    let transport = Arc::new(CapturingTransport::default());

    let registrar = Registrar::new(store.clone(), shared.clone(), &RegistrarConfig::default(), tx.clone());
    let tracker = StateTracker::new(store.clone(), history.clone(), shared.clone(), tx.clone());
    let delivery = Delivery::new(transport.clone(), history.clone(), shared.clone(), DeliveryPolicy::default());
    let dispatcher = Dispatcher::new(
        store.clone(),
        tracker.clone(),
        delivery,
        shared,
        &DispatchConfig::default(),
        None,
        tx,
    );

    Engine {
        registrar,
        tracker,
        dispatcher,
        store,
        history,
        transport,
        clock,
        events: rx,
    }
}

fn arm_request(launch: chrono::DateTime<Utc>, minutes: &[u64]) -> ArmRequest {
    ArmRequest {
        resource_id: "i-1".into(),
        resource_name: Some("build-box".into()),
        region: "r1".into(),
        launch_time: launch,
        resource_state: ResourceState::Running,
        thresholds: minutes.iter().map(|m| Duration::from_secs(m * 60)).collect(),
        delivery_target: "device-token-abc".into(),
    }
}

#[tokio::test]
async fn five_minute_alert_fires_once() {
    let mut e = engine();
    let t0 = e.clock.now();
    assert_eq!(e.registrar.arm(&arm_request(t0, &[5])).unwrap(), 1);
    assert!(matches!(e.events.try_recv().unwrap(), AlertEvent::Armed { count: 1, .. }));

    e.clock.advance(chrono::Duration::minutes(6));
    let report = e.dispatcher.tick().await.unwrap();
    assert_eq!(report.sent, 1);

    {
        let sent = e.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Runtime Alert");
        assert_eq!(sent[0].body, "build-box has been running for 0h 6m");
        assert_eq!(sent[0].target, "device-token-abc");
    }
    assert!(e.registrar.alerts_for_resource("i-1", "r1").unwrap().is_empty());
    assert!(matches!(e.events.try_recv().unwrap(), AlertEvent::Fired { threshold_minutes: 5, .. }));

    e.clock.advance(chrono::Duration::minutes(1));
    let report = e.dispatcher.tick().await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(e.transport.sent.lock().unwrap().len(), 1);

    let feed = e.history.recent(10).unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].kind, HistoryKind::Delivered);
    assert_eq!(feed[0].runtime_minutes, Some(6));
}

#[tokio::test]
async fn stop_then_restart_needs_fresh_arm() {
    let e = engine();
    let t0 = e.clock.now();
    e.registrar.arm(&arm_request(t0, &[30, 60])).unwrap();

    e.clock.advance(chrono::Duration::minutes(10));
    let out = e.tracker.on_state_change("i-1", "r1", &ResourceState::Stopped).unwrap();
    assert_eq!(out.cancelled, 2);

    // Relaunched: old records stay dead, new launch time arms new ones.
    let relaunch = e.clock.now();
    e.tracker.on_state_change("i-1", "r1", &ResourceState::Running).unwrap();
    assert_eq!(e.store.count_live("i-1", "r1").unwrap(), 0);
    e.registrar.arm(&arm_request(relaunch, &[30])).unwrap();

    e.clock.advance(chrono::Duration::minutes(31));
    e.dispatcher.tick().await.unwrap();
    let sent = e.transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "build-box has been running for 0h 31m");
}

#[tokio::test]
async fn disarm_prevents_delivery() {
    let e = engine();
    let t0 = e.clock.now();
    e.registrar.arm(&arm_request(t0, &[5])).unwrap();
    assert_eq!(e.registrar.disarm("i-1", "r1").unwrap(), 1);

    e.clock.advance(chrono::Duration::minutes(6));
    let report = e.dispatcher.tick().await.unwrap();
    assert_eq!(report.regions, 0);
    assert!(e.transport.sent.lock().unwrap().is_empty());
}
