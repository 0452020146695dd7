//! fedledger configuration
//!
//! Shared configuration crate for the coordinator and its tooling.
//!
//! Handles loading configuration from:
//! 1. FL_CONFIG env var (explicit path)
//! 2. ./config.toml (current directory)
//! 3. ~/.fedledger/config.toml (user home)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{env, fs};

/// Global config instance for convenience access
pub static GLOBAL_CONFIG: OnceLock<FedConfig> = OnceLock::new();

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = ".fedledger";

// ============================================================================
// Default Constants
// ============================================================================

const DEFAULT_GROUP_SIZE: usize = 2;
/// Attribution enumerates `2^group_size` subsets per group
pub const MAX_GROUP_SIZE: usize = 16;
const DEFAULT_MAX_ITERATIONS: u64 = 3;
const DEFAULT_ONE_TIME_FEE: u64 = 10;
const DEFAULT_SETTLEMENT_SHARE: f64 = 0.1;
const DEFAULT_INCENTIVE_POOL: u64 = 100;
const DEFAULT_PARTICIPANTS: usize = 3;

const DEFAULT_LEDGER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_EVENT_BUFFER: usize = 1024;

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FedConfig {
    #[serde(default)]
    pub coordinator: CoordinatorToml,
    #[serde(default)]
    pub ledger: LedgerToml,
    #[serde(default)]
    pub store: StoreToml,
    #[serde(default)]
    pub features: FeatureFlags,
}

/// Round policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorToml {
    /// Participants per attribution group (>= 2)
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    /// Aggregation cycles before the round settles
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    #[serde(default = "default_one_time_fee")]
    pub one_time_fee: u64,
    /// Fraction of collected fees paid out on settlement
    #[serde(default = "default_settlement_share")]
    pub settlement_share: f64,
    /// Units split by attribution score per cycle
    #[serde(default = "default_incentive_pool")]
    pub incentive_pool: u64,
    /// Simulated participants (dev coordinator only)
    #[serde(default = "default_participants")]
    pub participants: usize,
}

impl Default for CoordinatorToml {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            one_time_fee: DEFAULT_ONE_TIME_FEE,
            settlement_share: DEFAULT_SETTLEMENT_SHARE,
            incentive_pool: DEFAULT_INCENTIVE_POOL,
            participants: DEFAULT_PARTICIPANTS,
        }
    }
}

fn default_group_size() -> usize {
    DEFAULT_GROUP_SIZE
}
fn default_max_iterations() -> u64 {
    DEFAULT_MAX_ITERATIONS
}
fn default_one_time_fee() -> u64 {
    DEFAULT_ONE_TIME_FEE
}
fn default_settlement_share() -> f64 {
    DEFAULT_SETTLEMENT_SHARE
}
fn default_incentive_pool() -> u64 {
    DEFAULT_INCENTIVE_POOL
}
fn default_participants() -> usize {
    DEFAULT_PARTICIPANTS
}

/// Ledger connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerToml {
    #[serde(default = "default_ledger_timeout")]
    pub timeout_ms: u64,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for LedgerToml {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_LEDGER_TIMEOUT_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

fn default_ledger_timeout() -> u64 {
    DEFAULT_LEDGER_TIMEOUT_MS
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

/// Object store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreToml {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for StoreToml {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// Feature flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub dev_mode: bool,
    /// Weight incentives by Shapley attribution
    #[serde(default)]
    pub attribution: bool,
    /// Fresh round key every aggregation cycle
    #[serde(default = "default_true")]
    pub rotate_key: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            dev_mode: true,
            attribution: false,
            rotate_key: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Set field from var if present and parseable
fn env_parse<T: std::str::FromStr>(vars: Lookup<'_>, key: &str, field: &mut T) {
    if let Some(v) = vars(key) {
        match v.trim().parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => log::warn!("Ignoring unparseable {}={}", key, v),
        }
    }
}

/// Set bool from var if present ("1"/"true" are truthy)
fn env_bool(vars: Lookup<'_>, key: &str, field: &mut bool) {
    if let Some(v) = vars(key) {
        *field = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

// ============================================================================
// Implementation
// ============================================================================

impl FedConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                Self::parse_file(&path)?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check FL_CONFIG env var
        if let Ok(path) = env::var("FL_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            log::warn!("FL_CONFIG points to missing file: {}", path.display());
        }

        // 2. Check ./config.toml
        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.fedledger/config.toml
        Self::default_config_path().filter(|p| p.exists())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key: &str| env::var(key).ok());
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        // Coordinator
        env_parse(vars, "FL_GROUP_SIZE", &mut self.coordinator.group_size);
        env_parse(vars, "FL_MAX_ITERATIONS", &mut self.coordinator.max_iterations);
        env_parse(vars, "FL_ONE_TIME_FEE", &mut self.coordinator.one_time_fee);
        env_parse(
            vars,
            "FL_SETTLEMENT_SHARE",
            &mut self.coordinator.settlement_share,
        );
        env_parse(vars, "FL_INCENTIVE_POOL", &mut self.coordinator.incentive_pool);
        env_parse(vars, "FL_PARTICIPANTS", &mut self.coordinator.participants);

        // Ledger
        env_parse(vars, "FL_LEDGER_TIMEOUT_MS", &mut self.ledger.timeout_ms);
        env_parse(vars, "FL_EVENT_BUFFER", &mut self.ledger.event_buffer);

        // Store
        env_parse(vars, "FL_STORE_CHUNK_SIZE", &mut self.store.chunk_size);

        // Features
        env_bool(vars, "FL_ATTRIBUTION", &mut self.features.attribution);
        env_bool(vars, "FL_ROTATE_KEY", &mut self.features.rotate_key);
        env_bool(vars, "FL_DEV_MODE", &mut self.features.dev_mode);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (2..=MAX_GROUP_SIZE).contains(&self.coordinator.group_size),
            "group_size must be between 2 and {MAX_GROUP_SIZE}, got {}",
            self.coordinator.group_size
        );
        ensure!(
            (0.0..=1.0).contains(&self.coordinator.settlement_share),
            "settlement_share must be within [0, 1], got {}",
            self.coordinator.settlement_share
        );
        ensure!(
            self.coordinator.max_iterations > 0,
            "max_iterations must be positive"
        );
        ensure!(
            self.coordinator.participants > 0,
            "participants must be positive"
        );
        ensure!(self.ledger.event_buffer > 0, "event_buffer must be positive");
        ensure!(self.store.chunk_size > 0, "chunk_size must be positive");
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.features.attribution = true;
        toml::to_string_pretty(&sample).unwrap_or_default()
    }

    /// Get the global config instance, initializing it if necessary.
    ///
    /// Falls back to defaults if loading fails.
    pub fn global() -> &'static FedConfig {
        GLOBAL_CONFIG.get_or_init(|| {
            Self::load().unwrap_or_else(|e| {
                log::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            })
        })
    }

    /// Returns `None` if config hasn't been initialized yet.
    pub fn try_global() -> Option<&'static FedConfig> {
        GLOBAL_CONFIG.get()
    }

    /// Initialize the global config with a specific instance.
    ///
    /// Returns `Err(config)` if already initialized.
    pub fn init_global(config: FedConfig) -> Result<(), FedConfig> {
        GLOBAL_CONFIG.set(config)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = FedConfig::default();
        assert_eq!(config.coordinator.group_size, 2);
        assert_eq!(config.coordinator.max_iterations, 3);
        assert_eq!(config.coordinator.one_time_fee, 10);
        assert_eq!(config.coordinator.settlement_share, 0.1);
        assert_eq!(config.coordinator.incentive_pool, 100);
        assert_eq!(config.ledger.timeout_ms, 30_000);
        assert_eq!(config.ledger.event_buffer, 1024);
        assert_eq!(config.store.chunk_size, 256 * 1024);
        assert!(config.features.dev_mode);
        assert!(config.features.rotate_key);
        assert!(!config.features.attribution);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generate_sample() {
        let sample = FedConfig::generate_sample();
        assert!(sample.contains("[coordinator]"));
        assert!(sample.contains("[ledger]"));
        assert!(sample.contains("[store]"));
        assert!(sample.contains("[features]"));
    }

    #[test]
    fn test_parse_sample() {
        let sample = FedConfig::generate_sample();
        let parsed: FedConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.coordinator.group_size, DEFAULT_GROUP_SIZE);
        assert!(parsed.features.attribution);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[coordinator]\ngroup_size = 4\n\n[features]\nattribution = true"
        )
        .unwrap();

        let config = FedConfig::parse_file(file.path()).unwrap();
        assert_eq!(config.coordinator.group_size, 4);
        assert_eq!(config.coordinator.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert!(config.features.attribution);
        assert!(config.features.rotate_key);
        assert_eq!(config.ledger, LedgerToml::default());
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[coordinator\ngroup_size = ").unwrap();

        let err = FedConfig::parse_file(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = FedConfig::default();
        config.coordinator.group_size = 4;

        let env = vars(&[
            ("FL_GROUP_SIZE", "3"),
            ("FL_SETTLEMENT_SHARE", "0.25"),
            ("FL_ATTRIBUTION", "true"),
            ("FL_ROTATE_KEY", "0"),
            ("FL_LEDGER_TIMEOUT_MS", "500"),
            ("FL_MAX_ITERATIONS", "not a number"),
        ]);
        config.apply_overrides(&|k: &str| env.get(k).cloned());

        assert_eq!(config.coordinator.group_size, 3);
        assert_eq!(config.coordinator.settlement_share, 0.25);
        assert!(config.features.attribution);
        assert!(!config.features.rotate_key);
        assert_eq!(config.ledger.timeout_ms, 500);
        // unparseable values leave the field alone
        assert_eq!(config.coordinator.max_iterations, DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FedConfig::default();
        config.coordinator.group_size = 1;
        assert!(config.validate().is_err());

        let mut config = FedConfig::default();
        config.coordinator.settlement_share = 1.5;
        assert!(config.validate().is_err());

        let mut config = FedConfig::default();
        config.store.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = FedConfig::default();
        config.coordinator.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = FedConfig::default();
        config.coordinator.group_size = MAX_GROUP_SIZE + 1;
        assert!(config.validate().is_err());
        config.coordinator.group_size = MAX_GROUP_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_global_initializes_once() {
        let mut config = FedConfig::default();
        config.coordinator.participants = 7;

        assert!(FedConfig::init_global(config.clone()).is_ok());
        assert_eq!(FedConfig::try_global(), Some(&config));
        assert_eq!(FedConfig::global().coordinator.participants, 7);

        let rejected = FedConfig::init_global(FedConfig::default());
        assert_eq!(rejected, Err(FedConfig::default()));
        assert_eq!(FedConfig::global().coordinator.participants, 7);
    }
}
