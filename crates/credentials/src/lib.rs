//! Credential subsystem: the encrypted OAuth grant store, the failure ledger
//! with blacklist and grace semantics, the background token refresher, and
//! the grace-period controller.

pub mod enrollment;
pub mod entities;
pub mod grace;
pub mod notify;
pub mod refresher;
pub mod repository;
pub mod types;

pub use enrollment::EnrollmentService;
pub use entities::{DecryptedGrant, FailureOutcome, FailureRecord, GrantOverview, GrantSummary};
pub use grace::GraceController;
pub use notify::{LoggingNotifier, PartnerNotifier, RoleSync};
pub use refresher::TokenRefresher;
pub use repository::CredentialRepository;
pub use types::{CredentialError, CredentialResult};
