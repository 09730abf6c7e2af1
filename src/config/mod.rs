//! Configuration loading for the repository updater.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `REPO_UPDATER_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::types::Family;

const ENV_PREFIX: &str = "REPO_UPDATER_";

/// Longest refresh interval or backoff cap accepted by validation (30 days).
pub const MAX_DELAY_SECONDS: u64 = 30 * 24 * 60 * 60;

/// Application configuration derived from `REPO_UPDATER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub job_store: JobStoreKind,
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos_file: Option<PathBuf>,
    #[serde(default = "default_source_sync_interval_seconds")]
    pub source_sync_interval_seconds: u64,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub backoff: BackoffPolicyConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    #[serde(default)]
    pub npm: NpmConfig,
}

/// Which job store backs the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStoreKind {
    #[default]
    Sql,
    Memory,
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// How often the executor polls the scheduler when nothing wakes it.
    #[serde(default = "default_scheduler_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Steady-state delay between successful automatic syncs.
    #[serde(default = "default_scheduler_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_scheduler_jitter_pct_min")]
    pub jitter_pct_min: f64,
    #[serde(default = "default_scheduler_jitter_pct_max")]
    pub jitter_pct_max: f64,
    /// Upper bound on concurrently running sync jobs.
    #[serde(default = "default_scheduler_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Deadline applied to each strategy invocation.
    #[serde(default = "default_scheduler_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
    /// Delay before a deferred entry is looked at again.
    #[serde(default = "default_scheduler_defer_recheck_seconds")]
    pub defer_recheck_seconds: u64,
}

/// Exponential backoff applied after failed syncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BackoffPolicyConfig {
    /// Delay after the first failure, in seconds (default: 30)
    ///
    /// Subsequent failures use `base_seconds * 2^(failures - 1)`.
    ///
    /// Environment variable: `REPO_UPDATER_BACKOFF_BASE_SECONDS`
    #[serde(default = "default_backoff_base_seconds")]
    pub base_seconds: u64,

    /// Maximum delay in seconds (default: 3600)
    ///
    /// Environment variable: `REPO_UPDATER_BACKOFF_MAX_SECONDS`
    #[serde(default = "default_backoff_max_seconds")]
    pub max_seconds: u64,

    /// Family-specific overrides
    ///
    /// Environment variables:
    /// `REPO_UPDATER_BACKOFF_FAMILY_OVERRIDE_{FAMILY}_BASE_SECONDS` and
    /// `REPO_UPDATER_BACKOFF_FAMILY_OVERRIDE_{FAMILY}_MAX_SECONDS`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub family_overrides: BTreeMap<Family, BackoffFamilyOverride>,
}

/// Family-specific backoff overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BackoffFamilyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seconds: Option<u64>,
}

/// Purge worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PurgeConfig {
    #[serde(default = "default_purge_enabled")]
    pub enabled: bool,
    #[serde(default = "default_purge_interval_seconds")]
    pub interval_seconds: u64,
}

/// npm registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NpmConfig {
    #[serde(default = "default_npm_registry_url")]
    pub registry_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            job_store: JobStoreKind::default(),
            repos_dir: default_repos_dir(),
            repos_file: None,
            source_sync_interval_seconds: default_source_sync_interval_seconds(),
            git_binary: default_git_binary(),
            scheduler: SchedulerConfig::default(),
            backoff: BackoffPolicyConfig::default(),
            purge: PurgeConfig::default(),
            npm: NpmConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_scheduler_tick_interval_ms(),
            refresh_interval_seconds: default_scheduler_refresh_interval_seconds(),
            jitter_pct_min: default_scheduler_jitter_pct_min(),
            jitter_pct_max: default_scheduler_jitter_pct_max(),
            max_concurrent_jobs: default_scheduler_max_concurrent_jobs(),
            job_timeout_seconds: default_scheduler_job_timeout_seconds(),
            defer_recheck_seconds: default_scheduler_defer_recheck_seconds(),
        }
    }
}

impl Default for BackoffPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_backoff_base_seconds(),
            max_seconds: default_backoff_max_seconds(),
            family_overrides: BTreeMap::new(),
        }
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_purge_enabled(),
            interval_seconds: default_purge_interval_seconds(),
        }
    }
}

impl Default for NpmConfig {
    fn default() -> Self {
        Self {
            registry_url: default_npm_registry_url(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms < 10 || self.tick_interval_ms > 60_000 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_ms,
            });
        }

        if self.refresh_interval_seconds < 30
            || self.refresh_interval_seconds > MAX_DELAY_SECONDS
        {
            return Err(ConfigError::InvalidSchedulerRefreshInterval {
                value: self.refresh_interval_seconds,
            });
        }

        for (field, value) in [
            ("minimum percentage", self.jitter_pct_min),
            ("maximum percentage", self.jitter_pct_max),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidSchedulerJitterRange {
                    min: self.jitter_pct_min,
                    max: self.jitter_pct_max,
                    field: field.to_string(),
                });
            }
        }

        if self.jitter_pct_min > self.jitter_pct_max {
            return Err(ConfigError::InvalidSchedulerJitterInverted {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
            });
        }

        if self.max_concurrent_jobs == 0 || self.max_concurrent_jobs > 256 {
            return Err(ConfigError::InvalidSchedulerConcurrency {
                value: self.max_concurrent_jobs,
            });
        }

        if self.job_timeout_seconds == 0 {
            return Err(ConfigError::InvalidSchedulerJobTimeout {
                value: self.job_timeout_seconds,
            });
        }

        Ok(())
    }
}

impl BackoffPolicyConfig {
    /// Validate backoff configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds == 0 || self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidBackoffBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }
        if self.max_seconds > MAX_DELAY_SECONDS {
            return Err(ConfigError::BackoffMaxTooLong {
                scope: "default".to_string(),
                max: self.max_seconds,
            });
        }

        for (family, override_config) in &self.family_overrides {
            let base = override_config.base_seconds.unwrap_or(self.base_seconds);
            let max = override_config.max_seconds.unwrap_or(self.max_seconds);

            if base == 0 || base > max {
                return Err(ConfigError::InvalidBackoffFamilyBounds {
                    family: *family,
                    base,
                    max,
                });
            }
            if max > MAX_DELAY_SECONDS {
                return Err(ConfigError::BackoffMaxTooLong {
                    scope: family.to_string(),
                    max,
                });
            }
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (credentials in URLs are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        config.database_url = redact_url_credentials(&config.database_url);
        config.npm.registry_url = redact_url_credentials(&config.npm.registry_url);
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_store == JobStoreKind::Sql && self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if self.repos_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingReposDir);
        }

        if Url::parse(&self.npm.registry_url).is_err() {
            return Err(ConfigError::InvalidRegistryUrl {
                value: self.npm.registry_url.clone(),
            });
        }

        if self.purge.enabled && self.purge.interval_seconds < 10 {
            return Err(ConfigError::InvalidPurgeInterval {
                value: self.purge.interval_seconds,
            });
        }

        if self.source_sync_interval_seconds < 10 {
            return Err(ConfigError::InvalidSourceSyncInterval {
                value: self.source_sync_interval_seconds,
            });
        }

        self.scheduler.validate()?;
        self.backoff.validate()?;

        Ok(())
    }
}

fn redact_url_credentials(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("[REDACTED]");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://repo-updater.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("./data/repos")
}

fn default_source_sync_interval_seconds() -> u64 {
    300 // 5 minutes
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_scheduler_tick_interval_ms() -> u64 {
    1000
}

fn default_scheduler_refresh_interval_seconds() -> u64 {
    3600 // 1 hour
}

fn default_scheduler_jitter_pct_min() -> f64 {
    0.0
}

fn default_scheduler_jitter_pct_max() -> f64 {
    0.1 // 10% maximum jitter
}

fn default_scheduler_max_concurrent_jobs() -> usize {
    8
}

fn default_scheduler_job_timeout_seconds() -> u64 {
    600 // 10 minutes
}

fn default_scheduler_defer_recheck_seconds() -> u64 {
    5
}

fn default_backoff_base_seconds() -> u64 {
    30
}

fn default_backoff_max_seconds() -> u64 {
    3600 // 1 hour
}

fn default_purge_enabled() -> bool {
    true
}

fn default_purge_interval_seconds() -> u64 {
    600 // 10 minutes
}

fn default_npm_registry_url() -> String {
    "https://registry.npmjs.org".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("database URL is missing; set REPO_UPDATER_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("repository storage directory is missing; set REPO_UPDATER_REPOS_DIR")]
    MissingReposDir,
    #[error("npm registry URL '{value}' is not a valid URL")]
    InvalidRegistryUrl { value: String },
    #[error("scheduler tick interval must be between 10 and 60000 milliseconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("scheduler refresh interval must be between 30 seconds and 30 days, got {value}")]
    InvalidSchedulerRefreshInterval { value: u64 },
    #[error("scheduler jitter percentage {field} is out of bounds (min: {min}, max: {max})")]
    InvalidSchedulerJitterRange { min: f64, max: f64, field: String },
    #[error("scheduler jitter percentage minimum ({min}) cannot be greater than maximum ({max})")]
    InvalidSchedulerJitterInverted { min: f64, max: f64 },
    #[error("scheduler max concurrent jobs must be between 1 and 256, got {value}")]
    InvalidSchedulerConcurrency { value: usize },
    #[error("scheduler job timeout must be positive, got {value}")]
    InvalidSchedulerJobTimeout { value: u64 },
    #[error("backoff base seconds ({base}) must be positive and not exceed max seconds ({max})")]
    InvalidBackoffBounds { base: u64, max: u64 },
    #[error(
        "family {family} backoff base seconds ({base}) must be positive and not exceed max seconds ({max})"
    )]
    InvalidBackoffFamilyBounds { family: Family, base: u64, max: u64 },
    #[error("{scope} backoff max seconds ({max}) exceeds the 30 day limit")]
    BackoffMaxTooLong { scope: String, max: u64 },
    #[error("purge interval must be at least 10 seconds, got {value}")]
    InvalidPurgeInterval { value: u64 },
    #[error("source sync interval must be at least 10 seconds, got {value}")]
    InvalidSourceSyncInterval { value: u64 },
}

/// Loads configuration using layered `.env` files and `REPO_UPDATER_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: dotenv layers first, process environment last.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let job_store = match take_string(&mut layered, "JOB_STORE") {
            None => JobStoreKind::default(),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "sql" => JobStoreKind::Sql,
                "memory" => JobStoreKind::Memory,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "JOB_STORE".to_string(),
                        value,
                    });
                }
            },
        };

        let repos_dir = take_string(&mut layered, "REPOS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_repos_dir);
        let repos_file = take_string(&mut layered, "REPOS_FILE").map(PathBuf::from);
        let source_sync_interval_seconds =
            take_parsed(&mut layered, "SOURCE_SYNC_INTERVAL_SECONDS")?
                .unwrap_or_else(default_source_sync_interval_seconds);
        let git_binary = take_string(&mut layered, "GIT_BINARY").unwrap_or_else(default_git_binary);

        let scheduler = SchedulerConfig {
            tick_interval_ms: take_parsed(&mut layered, "SCHEDULER_TICK_INTERVAL_MS")?
                .unwrap_or_else(default_scheduler_tick_interval_ms),
            refresh_interval_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_REFRESH_INTERVAL_SECONDS",
            )?
            .unwrap_or_else(default_scheduler_refresh_interval_seconds),
            jitter_pct_min: take_parsed(&mut layered, "SCHEDULER_JITTER_PCT_MIN")?
                .unwrap_or_else(default_scheduler_jitter_pct_min),
            jitter_pct_max: take_parsed(&mut layered, "SCHEDULER_JITTER_PCT_MAX")?
                .unwrap_or_else(default_scheduler_jitter_pct_max),
            max_concurrent_jobs: take_parsed(&mut layered, "SCHEDULER_MAX_CONCURRENT_JOBS")?
                .unwrap_or_else(default_scheduler_max_concurrent_jobs),
            job_timeout_seconds: take_parsed(&mut layered, "SCHEDULER_JOB_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_scheduler_job_timeout_seconds),
            defer_recheck_seconds: take_parsed(&mut layered, "SCHEDULER_DEFER_RECHECK_SECONDS")?
                .unwrap_or_else(default_scheduler_defer_recheck_seconds),
        };

        let mut family_overrides: BTreeMap<Family, BackoffFamilyOverride> = BTreeMap::new();
        for family in Family::ALL {
            let prefix = format!(
                "BACKOFF_FAMILY_OVERRIDE_{}_",
                family.as_str().to_ascii_uppercase()
            );
            let base_seconds = take_parsed(&mut layered, &format!("{prefix}BASE_SECONDS"))?;
            let max_seconds = take_parsed(&mut layered, &format!("{prefix}MAX_SECONDS"))?;
            if base_seconds.is_some() || max_seconds.is_some() {
                family_overrides.insert(
                    family,
                    BackoffFamilyOverride {
                        base_seconds,
                        max_seconds,
                    },
                );
            }
        }

        let backoff = BackoffPolicyConfig {
            base_seconds: take_parsed(&mut layered, "BACKOFF_BASE_SECONDS")?
                .unwrap_or_else(default_backoff_base_seconds),
            max_seconds: take_parsed(&mut layered, "BACKOFF_MAX_SECONDS")?
                .unwrap_or_else(default_backoff_max_seconds),
            family_overrides,
        };

        let purge = PurgeConfig {
            enabled: take_parsed(&mut layered, "PURGE_ENABLED")?
                .unwrap_or_else(default_purge_enabled),
            interval_seconds: take_parsed(&mut layered, "PURGE_INTERVAL_SECONDS")?
                .unwrap_or_else(default_purge_interval_seconds),
        };

        let npm = NpmConfig {
            registry_url: take_string(&mut layered, "NPM_REGISTRY_URL")
                .unwrap_or_else(default_npm_registry_url),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            job_store,
            repos_dir,
            repos_file,
            source_sync_interval_seconds,
            git_binary,
            scheduler,
            backoff,
            purge,
            npm,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, key) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}
