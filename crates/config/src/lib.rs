use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "streamnet.toml",
    "config/streamnet.toml",
    "crates/config/streamnet.toml",
    "../streamnet.toml",
    "../config/streamnet.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub twitch: TwitchConfig,
    pub crypto: CryptoConfig,
    pub partnership: PartnershipConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://streamnet.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Category the poll loop watches for live partner candidates.
    #[serde(default)]
    pub tracked_category_id: Option<String>,
    #[serde(default = "TwitchConfig::default_language")]
    pub language: String,
    /// Override for the Helix API base; unset means the platform default.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Override for the identity-service base; unset means the platform
    /// default.
    #[serde(default)]
    pub id_base_url: Option<String>,
}

impl TwitchConfig {
    fn default_language() -> String {
        "de".to_string()
    }
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            tracked_category_id: None,
            language: Self::default_language(),
            api_base_url: None,
            id_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Service name under which master keys are stored in the OS vault.
    #[serde(default = "CryptoConfig::default_vault_service")]
    pub vault_service: String,
    /// Key id used for new ciphertexts; older kids stay readable.
    #[serde(default = "CryptoConfig::default_master_key_id")]
    pub master_key_id: String,
}

impl CryptoConfig {
    fn default_vault_service() -> String {
        "Streamnet".to_string()
    }

    fn default_master_key_id() -> String {
        "v1".to_string()
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            vault_service: Self::default_vault_service(),
            master_key_id: Self::default_master_key_id(),
        }
    }
}

/// Thresholds of the partnership lifecycle engine.
///
/// ```
/// use streamnet_config::PartnershipConfig;
///
/// let p = PartnershipConfig::default();
/// assert_eq!(p.disable_threshold, 3);
/// assert_eq!(p.grace_period_days, 7);
/// assert_eq!(p.poll_interval_secs, 75);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnershipConfig {
    /// Hours within which refresh failures count as consecutive.
    #[serde(default = "PartnershipConfig::default_failure_window")]
    pub failure_window_hours: u64,
    /// Consecutive invalid-grant failures before auto-raid is disabled.
    #[serde(default = "PartnershipConfig::default_disable_threshold")]
    pub disable_threshold: u32,
    /// Days between auto-raid disable and partnership-role removal.
    #[serde(default = "PartnershipConfig::default_grace_period")]
    pub grace_period_days: u64,
    /// Hours between refresh attempts while below the disable threshold.
    #[serde(default = "PartnershipConfig::default_retry_cooldown")]
    pub retry_cooldown_hours: u64,
    /// Days to avoid re-raiding the same target.
    #[serde(default = "PartnershipConfig::default_raid_target_cooldown")]
    pub raid_target_cooldown_days: u64,
    /// Seconds between live-state polls.
    #[serde(default = "PartnershipConfig::default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Consecutive snapshots a broadcaster must be absent from before the
    /// tracker treats them as offline without an explicit event.
    #[serde(default = "PartnershipConfig::default_offline_miss_threshold")]
    pub offline_miss_threshold: u32,
}

impl PartnershipConfig {
    const fn default_failure_window() -> u64 {
        12
    }

    const fn default_disable_threshold() -> u32 {
        3
    }

    const fn default_grace_period() -> u64 {
        7
    }

    const fn default_retry_cooldown() -> u64 {
        2
    }

    const fn default_raid_target_cooldown() -> u64 {
        7
    }

    const fn default_poll_interval() -> u64 {
        75
    }

    const fn default_offline_miss_threshold() -> u32 {
        2
    }
}

impl Default for PartnershipConfig {
    fn default() -> Self {
        Self {
            failure_window_hours: Self::default_failure_window(),
            disable_threshold: Self::default_disable_threshold(),
            grace_period_days: Self::default_grace_period(),
            retry_cooldown_hours: Self::default_retry_cooldown(),
            raid_target_cooldown_days: Self::default_raid_target_cooldown(),
            poll_interval_secs: Self::default_poll_interval(),
            offline_miss_threshold: Self::default_offline_miss_threshold(),
        }
    }
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use streamnet_config::load;
///
/// std::env::remove_var("STREAMNET_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.database.url.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();

    let mut builder = config::Config::builder();
    builder = builder
        .set_default("database.url", defaults.database.url.clone())
        .unwrap()
        .set_default(
            "database.max_connections",
            i64::from(defaults.database.max_connections),
        )
        .unwrap()
        .set_default("twitch.language", defaults.twitch.language.clone())
        .unwrap()
        .set_default("crypto.vault_service", defaults.crypto.vault_service.clone())
        .unwrap()
        .set_default("crypto.master_key_id", defaults.crypto.master_key_id.clone())
        .unwrap()
        .set_default(
            "partnership.failure_window_hours",
            defaults.partnership.failure_window_hours as i64,
        )
        .unwrap()
        .set_default(
            "partnership.disable_threshold",
            i64::from(defaults.partnership.disable_threshold),
        )
        .unwrap()
        .set_default(
            "partnership.grace_period_days",
            defaults.partnership.grace_period_days as i64,
        )
        .unwrap()
        .set_default(
            "partnership.retry_cooldown_hours",
            defaults.partnership.retry_cooldown_hours as i64,
        )
        .unwrap()
        .set_default(
            "partnership.raid_target_cooldown_days",
            defaults.partnership.raid_target_cooldown_days as i64,
        )
        .unwrap()
        .set_default(
            "partnership.poll_interval_secs",
            defaults.partnership.poll_interval_secs as i64,
        )
        .unwrap()
        .set_default(
            "partnership.offline_miss_threshold",
            i64::from(defaults.partnership.offline_miss_threshold),
        )
        .unwrap();

    let environment_overrides = config::Environment::with_prefix("STREAMNET").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("STREAMNET_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via STREAMNET_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    debug!(?config, "loaded streamnet configuration");
    Ok(config)
}
