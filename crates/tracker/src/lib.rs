//! Live-state tracker: per-broadcaster online/offline state and the stream
//! session lifecycle with engagement metrics.

pub mod hook;
pub mod session_repository;
pub mod tracker;
pub mod types;

pub use hook::{NullOfflineHook, OfflineHook, OfflineTransition};
pub use session_repository::{SessionMetrics, SessionRepository, StreamSession};
pub use tracker::{LiveObservation, LiveTracker};
pub use types::{TrackerError, TrackerResult};
