//! Capability seams toward the community platform (DMs, admin alerts, roles).
//!
//! The core never talks to a chat guild directly; the binary wires real
//! collaborators in, tests wire in recorders. All operations are best-effort
//! and idempotent on the receiving side.

use async_trait::async_trait;
use tracing::info;

/// Outbound notifications around token failures and grace expiry. Message
/// wording is owned by the implementations.
#[async_trait]
pub trait PartnerNotifier: Send + Sync {
    /// Admin alert on the first invalid-grant failure for a broadcaster.
    async fn token_error_admin(&self, twitch_user_id: &str, twitch_login: &str, error: &str);

    /// Direct message to the broadcaster with a fresh auth-start link.
    async fn token_error_dm(&self, twitch_user_id: &str, twitch_login: &str, auth_url: &str);

    /// Reminder DM once the grace period ran out.
    async fn grace_reminder_dm(&self, twitch_user_id: &str, twitch_login: &str, auth_url: &str);

    /// Admin summary when a grace period expires.
    async fn grace_expired_admin(
        &self,
        twitch_user_id: &str,
        twitch_login: &str,
        discord_user_id: Option<&str>,
    );
}

/// Partnership-role synchronization against the community guild.
///
/// Removing an absent role and granting a present one are no-ops; missing
/// permissions are logged by the implementation and retried on the next pass.
#[async_trait]
pub trait RoleSync: Send + Sync {
    async fn grant_partner_role(&self, discord_user_id: &str, reason: &str);

    async fn remove_partner_role(&self, discord_user_id: &str, reason: &str);
}

/// Default collaborator that only logs. Used until the guild-facing surface
/// is attached, and in headless deployments.
pub struct LoggingNotifier;

#[async_trait]
impl PartnerNotifier for LoggingNotifier {
    async fn token_error_admin(&self, twitch_user_id: &str, twitch_login: &str, error: &str) {
        info!(twitch_user_id, twitch_login, error, "admin alert: token error");
    }

    async fn token_error_dm(&self, twitch_user_id: &str, twitch_login: &str, auth_url: &str) {
        info!(twitch_user_id, twitch_login, auth_url, "user dm: token error");
    }

    async fn grace_reminder_dm(&self, twitch_user_id: &str, twitch_login: &str, auth_url: &str) {
        info!(twitch_user_id, twitch_login, auth_url, "user dm: grace reminder");
    }

    async fn grace_expired_admin(
        &self,
        twitch_user_id: &str,
        twitch_login: &str,
        discord_user_id: Option<&str>,
    ) {
        info!(twitch_user_id, twitch_login, ?discord_user_id, "admin alert: grace expired");
    }
}

#[async_trait]
impl RoleSync for LoggingNotifier {
    async fn grant_partner_role(&self, discord_user_id: &str, reason: &str) {
        info!(discord_user_id, reason, "role sync: grant partner role");
    }

    async fn remove_partner_role(&self, discord_user_id: &str, reason: &str) {
        info!(discord_user_id, reason, "role sync: remove partner role");
    }
}
