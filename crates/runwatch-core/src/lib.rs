//! Shared types for the runtime alert and auto-stop engine.
//!
//! Everything here is consumed by more than one crate: the config model, the
//! resource lifecycle and alert status enums, the clock abstraction, and the
//! traits at the seams to external collaborators (resource control surface,
//! local countdown cancellation).

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod runtime;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{ControlError, CountdownCanceller, ResourceControl, ResourceDescription};
pub use error::{Result, RunwatchError};
pub use types::{AlertStatus, ResourceState};
