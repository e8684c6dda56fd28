//! Ticket engine configuration.
//!
//! This module loads the engine's tunables from environment variables and
//! turns them into policies and backend settings.
//!
//! # Environment Variables
//!
//! - `TICKETS_REGISTRY_NAMESPACE`: Key prefix in the shared cache (required)
//! - `TICKETS_REGISTRY_TIMEOUT_MS`: Bound on each cache call (default: `2000`)
//! - `TICKETS_ROOT_TIME_TO_KILL_SECS`: Root ticket idle timeout (default: `28800`)
//! - `TICKETS_ROOT_MAX_TIME_TO_LIVE_SECS`: Root ticket lifetime cap (default: none)
//! - `TICKETS_DERIVED_MAX_USES`: Uses of a derived ticket (default: `1`)
//! - `TICKETS_DERIVED_TIME_TO_KILL_SECS`: Derived ticket lifetime (default: `10`)
//! - `TICKETS_ONLY_TRACK_MOST_RECENT_SESSION`: `true` keeps one descendant per
//!   tracking key (default: `false`)
//! - `TICKETS_MAX_UPDATE_ATTEMPTS`: Read-modify-write attempts (default: `32`)
//! - `TICKETS_SWEEP_INTERVAL_SECS`: In-process sweeper period (default: `60`)
//!
//! # Invariants
//!
//! - `registry_namespace` is never empty and contains no `:`
//! - Every duration and count is non-zero

use std::time::Duration;

use crate::error::TicketError;
use crate::expiration::ExpirationPolicy;
use crate::orchestrator::OrchestratorSettings;
use crate::registry::{DistributedRegistrySettings, SweepConfig};
use crate::tracking::SessionTrackingPolicy;

/// Ticket engine configuration.
///
/// # Pre-conditions
///
/// When constructed via `from_env()`:
/// - `TICKETS_REGISTRY_NAMESPACE` must be set
/// - All values that are set must parse and be non-zero
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketsConfig {
    /// Key prefix in the shared cache.
    pub registry_namespace: String,
    /// Bound on each cache call.
    pub registry_timeout: Duration,
    /// Root ticket idle timeout.
    pub root_time_to_kill: Duration,
    /// Root ticket lifetime cap.
    pub root_max_time_to_live: Option<Duration>,
    /// Uses of a derived ticket.
    pub derived_max_uses: u64,
    /// Derived ticket lifetime.
    pub derived_time_to_kill: Duration,
    /// Keep only the most recent descendant per tracking key.
    pub only_track_most_recent_session: bool,
    /// Read-modify-write attempts before a version conflict surfaces.
    pub max_update_attempts: usize,
    /// In-process sweeper period.
    pub sweep_interval: Duration,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for TicketError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl TicketsConfig {
    pub const DEFAULT_REGISTRY_TIMEOUT_MS: u64 = 2_000;
    pub const DEFAULT_ROOT_TIME_TO_KILL_SECS: u64 = 8 * 60 * 60;
    pub const DEFAULT_DERIVED_MAX_USES: u64 = 1;
    pub const DEFAULT_DERIVED_TIME_TO_KILL_SECS: u64 = 10;
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
    pub const DEFAULT_MAX_UPDATE_ATTEMPTS: u64 = 32;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `TICKETS_REGISTRY_NAMESPACE` is not set
    /// - Any variable is set but malformed or zero
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    ///
    /// # Errors
    ///
    /// Same as [`TicketsConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let loader = Loader { lookup };

        let registry_namespace = loader.namespace("TICKETS_REGISTRY_NAMESPACE")?;
        let registry_timeout = Duration::from_millis(
            loader.positive("TICKETS_REGISTRY_TIMEOUT_MS", Self::DEFAULT_REGISTRY_TIMEOUT_MS)?,
        );
        let root_time_to_kill = Duration::from_secs(
            loader.positive("TICKETS_ROOT_TIME_TO_KILL_SECS", Self::DEFAULT_ROOT_TIME_TO_KILL_SECS)?,
        );
        let root_max_time_to_live = loader
            .optional_positive("TICKETS_ROOT_MAX_TIME_TO_LIVE_SECS")?
            .map(Duration::from_secs);
        let derived_max_uses = loader.positive("TICKETS_DERIVED_MAX_USES", Self::DEFAULT_DERIVED_MAX_USES)?;
        let derived_time_to_kill = Duration::from_secs(loader.positive(
            "TICKETS_DERIVED_TIME_TO_KILL_SECS",
            Self::DEFAULT_DERIVED_TIME_TO_KILL_SECS,
        )?);
        let only_track_most_recent_session =
            loader.flag("TICKETS_ONLY_TRACK_MOST_RECENT_SESSION", false)?;
        let max_update_attempts = usize::try_from(loader.positive(
            "TICKETS_MAX_UPDATE_ATTEMPTS",
            Self::DEFAULT_MAX_UPDATE_ATTEMPTS,
        )?)
        .map_err(|_| ConfigError::InvalidValue {
            name: "TICKETS_MAX_UPDATE_ATTEMPTS".to_string(),
            message: "too large".to_string(),
        })?;
        let sweep_interval = Duration::from_secs(
            loader.positive("TICKETS_SWEEP_INTERVAL_SECS", Self::DEFAULT_SWEEP_INTERVAL_SECS)?,
        );

        Ok(Self {
            registry_namespace,
            registry_timeout,
            root_time_to_kill,
            root_max_time_to_live,
            derived_max_uses,
            derived_time_to_kill,
            only_track_most_recent_session,
            max_update_attempts,
            sweep_interval,
        })
    }

    /// Expiration policy for root session tickets.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the durations are rejected by the policy.
    pub fn root_policy(&self) -> Result<ExpirationPolicy, TicketError> {
        match self.root_max_time_to_live {
            Some(max) => ExpirationPolicy::timeout_with_max_lifetime(self.root_time_to_kill, max),
            None => ExpirationPolicy::timeout(self.root_time_to_kill),
        }
    }

    /// Expiration policy for derived tickets.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the values are rejected by the policy.
    pub fn derived_policy(&self) -> Result<ExpirationPolicy, TicketError> {
        ExpirationPolicy::multi_use_or_timeout(self.derived_max_uses, self.derived_time_to_kill)
    }

    #[must_use]
    pub const fn tracking_policy(&self) -> SessionTrackingPolicy {
        SessionTrackingPolicy::from_only_track_most_recent(self.only_track_most_recent_session)
    }

    /// Settings for a [`TicketOrchestrator`](crate::orchestrator::TicketOrchestrator).
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if either policy is rejected.
    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings, TicketError> {
        Ok(OrchestratorSettings {
            root_policy: self.root_policy()?,
            derived_policy: self.derived_policy()?,
            tracking: self.tracking_policy(),
            max_update_attempts: self.max_update_attempts,
        })
    }

    #[must_use]
    pub fn registry_settings(&self) -> DistributedRegistrySettings {
        DistributedRegistrySettings {
            namespace: self.registry_namespace.clone(),
            op_timeout: self.registry_timeout,
        }
    }

    #[must_use]
    pub const fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: self.sweep_interval,
        }
    }
}

struct Loader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Loader<F> {
    fn namespace(&self, name: &str) -> Result<String, ConfigError> {
        let value = (self.lookup)(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))?;
        let value = value.trim();

        if value.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if value.contains(':') {
            return Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' must not contain ':'"),
            });
        }
        Ok(value.to_string())
    }

    fn optional_positive(&self, name: &str) -> Result<Option<u64>, ConfigError> {
        let Some(value) = (self.lookup)(name) else {
            return Ok(None);
        };
        match value.trim().parse::<u64>() {
            Ok(0) => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: "must be greater than zero".to_string(),
            }),
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not a valid number"),
            }),
        }
    }

    fn positive(&self, name: &str, default: u64) -> Result<u64, ConfigError> {
        Ok(self.optional_positive(name)?.unwrap_or(default))
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = (self.lookup)(name) else {
            return Ok(default);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not a boolean"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<TicketsConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect();
        TicketsConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("TICKETS_REGISTRY_NAMESPACE", "cas")]).unwrap();

        assert_eq!(config.registry_namespace, "cas");
        assert_eq!(config.registry_timeout, Duration::from_millis(2_000));
        assert_eq!(config.root_time_to_kill, Duration::from_secs(28_800));
        assert_eq!(config.root_max_time_to_live, None);
        assert_eq!(config.derived_max_uses, 1);
        assert_eq!(config.max_update_attempts, 32);
        assert_eq!(config.tracking_policy(), SessionTrackingPolicy::TrackAll);
        assert_eq!(config.sweep_config().interval, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_namespace() {
        assert_eq!(
            load(&[]),
            Err(ConfigError::MissingEnvVar("TICKETS_REGISTRY_NAMESPACE".to_string()))
        );
    }

    #[test]
    fn test_namespace_rejects_separator() {
        let result = load(&[("TICKETS_REGISTRY_NAMESPACE", "a:b")]);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_overrides_build_policies() {
        let config = load(&[
            ("TICKETS_REGISTRY_NAMESPACE", "cas"),
            ("TICKETS_ROOT_TIME_TO_KILL_SECS", "60"),
            ("TICKETS_ROOT_MAX_TIME_TO_LIVE_SECS", "3600"),
            ("TICKETS_DERIVED_MAX_USES", "3"),
            ("TICKETS_ONLY_TRACK_MOST_RECENT_SESSION", "true"),
        ])
        .unwrap();

        let settings = config.orchestrator_settings().unwrap();
        assert_eq!(
            settings.root_policy,
            ExpirationPolicy::Timeout {
                time_to_kill_ms: 60_000,
                max_time_to_live_ms: Some(3_600_000),
            }
        );
        assert_eq!(
            settings.derived_policy,
            ExpirationPolicy::MultiUseOrTimeout {
                max_uses: 3,
                time_to_kill_ms: 10_000,
            }
        );
        assert_eq!(settings.tracking, SessionTrackingPolicy::MostRecentPerKey);
        assert_eq!(config.registry_settings().namespace, "cas");
    }

    #[test]
    fn test_zero_rejected() {
        let result = load(&[
            ("TICKETS_REGISTRY_NAMESPACE", "cas"),
            ("TICKETS_DERIVED_MAX_USES", "0"),
        ]);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_bad_flag() {
        let result = load(&[
            ("TICKETS_REGISTRY_NAMESPACE", "cas"),
            ("TICKETS_ONLY_TRACK_MOST_RECENT_SESSION", "maybe"),
        ]);
        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid value for TICKETS_ONLY_TRACK_MOST_RECENT_SESSION: 'maybe' is not a boolean"
        );
    }

    #[test]
    fn test_config_error_converts_to_ticket_error() {
        let error: TicketError = ConfigError::MissingEnvVar("X".to_string()).into();
        assert!(matches!(error, TicketError::Configuration(_)));
    }
}
