//! Client-side auto-stop countdowns.
//!
//! A countdown is armed with a duration, persisted as an absolute end time,
//! and reconciled on every app start or resume: if the end time has passed
//! the stop action runs immediately, otherwise a timer resumes for what is
//! left and emits warnings at the configured lead times.

pub mod error;
pub mod notifier;
pub mod plan;
pub mod reconciler;
pub mod storage;
pub mod types;

pub use error::{CountdownError, Result};
pub use notifier::{LocalNotifier, TracingNotifier};
pub use plan::{next_step, Step};
pub use reconciler::{CountdownReconciler, ResumeOutcome};
pub use storage::{CountdownStorage, SqliteCountdownStorage};
pub use types::{CountdownPhase, LocalCountdown, LocalNotice};
