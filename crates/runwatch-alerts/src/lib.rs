//! `runwatch-alerts`: durable runtime alerts with a periodic dispatch loop.
//!
//! # Overview
//!
//! One [`AlertRecord`] is persisted per `(region, resource, threshold)` in the
//! SQLite `alerts` table. The [`Registrar`] arms thresholds from a resource's
//! launch time, the [`StateTracker`] retires them when the resource stops, and
//! the [`Dispatcher`] scans for due alerts on a fixed interval and hands them
//! to [`Delivery`], which retries the push transport and logs every outcome
//! to the append-only [`HistoryLog`].
//!
//! # Record lifecycle
//!
//! | From      | To          | Trigger                                           |
//! |-----------|-------------|---------------------------------------------------|
//! | (none)    | `pending`   | `Registrar::arm` (upsert, idempotent)             |
//! | `pending` | `sent`      | dispatch tick delivered it (soft-deleted at once) |
//! | `pending` | `cancelled` | disarm, resource halted, subsumed, stale at send  |
//! | `pending` | `error`     | fatal target, or transient failures exhausted     |
//! | any, deleted/terminal | purged | retention sweep after `max_age_hours`    |

pub mod db;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod registrar;
pub mod store;
pub mod tracker;
pub mod types;

pub use delivery::{Delivery, DeliveryError, DeliveryPolicy, PushError, PushMessage, PushTransport};
pub use dispatch::{Dispatcher, EngineTimings, TickReport};
pub use error::{AlertError, Result};
pub use history::{HistoryEntry, HistoryKind, HistoryLog};
pub use registrar::Registrar;
pub use store::{AlertQuery, AlertStore};
pub use tracker::{StateChangeOutcome, StateTracker};
pub use types::{alert_id, AlertEvent, AlertRecord, ArmRequest};
