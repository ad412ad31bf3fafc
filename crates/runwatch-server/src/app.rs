use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use runwatch_alerts::{
    AlertEvent, AlertStore, Delivery, DeliveryPolicy, Dispatcher, HistoryLog, PushTransport,
    Registrar, StateTracker,
};
use runwatch_core::config::RunwatchConfig;
use runwatch_core::{Clock, ResourceControl, SystemClock};
use runwatch_countdown::{CountdownReconciler, SqliteCountdownStorage, TracingNotifier};
use tokio::sync::broadcast;
use tracing::info;

use crate::relay::{HttpPushTransport, HttpResourceControl, LogOnlyTransport};

/// Shared state handed to every handler as `Arc<AppState>`.
pub struct AppState {
    pub config: RunwatchConfig,
    pub registrar: Registrar,
    pub tracker: StateTracker,
    pub dispatcher: Dispatcher,
    pub history: HistoryLog,
    /// Present only when a control endpoint is configured.
    pub countdowns: Option<CountdownReconciler>,
    pub events: broadcast::Sender<AlertEvent>,
}

impl AppState {
    /// Wire every subsystem onto `conn`, which holds the alert tables.
    pub fn build(config: RunwatchConfig, conn: rusqlite::Connection) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (events, _) = broadcast::channel(256);

        let store = AlertStore::new(conn)?;
        let history = HistoryLog::new(store.connection());

        let transport: Arc<dyn PushTransport> = match config.delivery.relay_url {
            Some(ref url) => {
                info!(%url, "push relay configured");
                Arc::new(HttpPushTransport::new(url.clone(), config.delivery.relay_token.clone()))
            }
            None => {
                info!("no push relay configured, notifications are only logged");
                Arc::new(LogOnlyTransport::default())
            }
        };
        let control: Option<Arc<dyn ResourceControl>> = config.control.url.as_ref().map(|url| {
            Arc::new(HttpResourceControl::new(url.clone(), config.control.token.clone()))
                as Arc<dyn ResourceControl>
        });

        let tracker = StateTracker::new(store.clone(), history.clone(), clock.clone(), events.clone());
        let delivery = Delivery::new(
            transport,
            history.clone(),
            clock.clone(),
            DeliveryPolicy::from_config(&config.delivery),
        );
        let probe = if config.dispatch.verify_with_control {
            control.clone()
        } else {
            None
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            tracker.clone(),
            delivery,
            clock.clone(),
            &config.dispatch,
            probe,
            events.clone(),
        );

        let mut registrar = Registrar::new(store, clock.clone(), &config.registrar, events.clone());
        let countdowns = match control {
            Some(control) => {
                ensure_parent_dir(&config.countdown.db_path);
                let storage = SqliteCountdownStorage::new(rusqlite::Connection::open(
                    &config.countdown.db_path,
                )?)?;
                let reconciler = CountdownReconciler::new(
                    Arc::new(storage),
                    control,
                    Arc::new(TracingNotifier),
                    clock,
                    &config.countdown.warning_leads_secs,
                );
                registrar = registrar.with_countdowns(Arc::new(reconciler.clone()));
                Some(reconciler)
            }
            None => None,
        };

        Ok(Self {
            config,
            registrar,
            tracker,
            dispatcher,
            history,
            countdowns,
            events,
        })
    }
}

pub fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/alerts", get(crate::http::alerts::list_handler))
        .route("/alerts/arm", post(crate::http::alerts::arm_handler))
        .route("/alerts/disarm", post(crate::http::alerts::disarm_handler))
        .route("/resources/state", post(crate::http::alerts::state_handler))
        .route("/history", get(crate::http::history::history_handler))
        .route("/countdowns", get(crate::http::countdowns::list_handler))
        .route("/countdowns/arm", post(crate::http::countdowns::arm_handler))
        .route("/countdowns/cancel", post(crate::http::countdowns::cancel_handler))
        .route("/countdowns/resume", post(crate::http::countdowns::resume_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
