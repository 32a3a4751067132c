pub mod failure;
pub mod grant;

pub use failure::{FailureOutcome, FailureRecord};
pub use grant::{DecryptedGrant, GrantOverview, GrantSummary};
