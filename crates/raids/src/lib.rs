//! Raid subsystem: target selection and dispatch on offline transitions, and
//! correlation of inbound raid-arrival events with outstanding dispatches.

pub mod chat;
pub mod correlator;
pub mod dispatcher;
pub mod history;
pub mod pending;
pub mod types;

pub use chat::{ChatSink, LoggingChatSink, RaidArrivalMessage};
pub use correlator::PendingRaidCorrelator;
pub use dispatcher::{DispatchOutcome, RaidDispatcher};
pub use history::{RaidAttempt, RaidHistoryRepository};
pub use pending::{PendingRaid, PendingRaidBook};
pub use types::{RaidsError, RaidsResult};
