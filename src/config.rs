use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TriageError};
use crate::models::Disposition;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub assisted: AssistedConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

/// Sliding-window quota budget, per mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_units_per_window")]
    pub units_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Longest a caller blocks on `MustWait` before requeueing instead
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            units_per_window: default_units_per_window(),
            window_secs: default_window_secs(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

/// Score cut-offs mapping Tier-1 confidence to a disposition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClassificationThresholds {
    #[serde(default = "default_trash_threshold")]
    pub trash: f64,
    #[serde(default = "default_archive_threshold")]
    pub archive: f64,
    #[serde(default = "default_review_threshold")]
    pub review: f64,
}

impl Default for ClassificationThresholds {
    fn default() -> Self {
        Self {
            trash: default_trash_threshold(),
            archive: default_archive_threshold(),
            review: default_review_threshold(),
        }
    }
}

impl ClassificationThresholds {
    /// Map an aggregate score to a disposition; each lower bound is inclusive
    pub fn disposition_for(&self, score: f64) -> Disposition {
        if score >= self.trash {
            Disposition::Trash
        } else if score >= self.archive {
            Disposition::Archive
        } else if score >= self.review {
            Disposition::Review
        } else {
            Disposition::Keep
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.trash) || !in_range(self.archive) || !in_range(self.review) {
            return Err(TriageError::ConfigError(
                "classification thresholds must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(self.trash > self.archive && self.archive > self.review) {
            return Err(TriageError::ConfigError(
                "classification thresholds must satisfy trash > archive > review".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default)]
    pub thresholds: ClassificationThresholds,
    /// Trash/archive calls below this confidence go to Tier-2
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    #[serde(default = "default_rules_weight")]
    pub rules_weight: f64,
    #[serde(default = "default_assisted_weight")]
    pub assisted_weight: f64,
    /// A combined trash below this confidence is demoted to review
    #[serde(default = "default_assisted_trash_floor")]
    pub assisted_trash_floor: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            thresholds: ClassificationThresholds::default(),
            escalation_threshold: default_escalation_threshold(),
            rules_weight: default_rules_weight(),
            assisted_weight: default_assisted_weight(),
            assisted_trash_floor: default_assisted_trash_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistedConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_assisted_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u32,
}

impl Default for AssistedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_model(),
            api_key_env: default_api_key_env(),
            api_base: None,
            timeout_secs: default_assisted_timeout_secs(),
            cache_ttl_days: default_cache_ttl_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_recent_days")]
    pub recent_days: u32,
    #[serde(default = "default_recent_min_confidence")]
    pub recent_min_confidence: f64,
    #[serde(default = "default_high_open_rate")]
    pub high_open_rate: f64,
    #[serde(default)]
    pub extra_protected_phrases: Vec<String>,
    #[serde(default = "default_contacts_ttl_hours")]
    pub contacts_ttl_hours: u64,
    #[serde(default)]
    pub contacts_file: Option<PathBuf>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            recent_days: default_recent_days(),
            recent_min_confidence: default_recent_min_confidence(),
            high_open_rate: default_high_open_rate(),
            extra_protected_phrases: Vec::new(),
            contacts_ttl_hours: default_contacts_ttl_hours(),
            contacts_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default for new mailboxes; sandbox when false
    #[serde(default)]
    pub action_mode: bool,
    #[serde(default = "default_true")]
    pub auto_label: bool,
    #[serde(default = "default_undo_window_days")]
    pub undo_window_days: u32,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    #[serde(default = "default_label_min_confidence")]
    pub label_min_confidence: f64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            action_mode: false,
            auto_label: true,
            undo_window_days: default_undo_window_days(),
            label_prefix: default_label_prefix(),
            label_min_confidence: default_label_min_confidence(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            max_job_attempts: default_max_job_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    #[serde(default = "default_backlog_age_days")]
    pub age_days: u32,
    #[serde(default = "default_backlog_batch_size")]
    pub batch_size: u32,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            age_days: default_backlog_age_days(),
            batch_size: default_backlog_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_token_dir")]
    pub token_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            credentials_path: default_credentials_path(),
            token_dir: default_token_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_pause_alert_after_secs")]
    pub pause_alert_after_secs: u64,
    #[serde(default = "default_credential_failure_burst")]
    pub credential_failure_burst: usize,
    #[serde(default = "default_credential_failure_window_secs")]
    pub credential_failure_window_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            pause_alert_after_secs: default_pause_alert_after_secs(),
            credential_failure_burst: default_credential_failure_burst(),
            credential_failure_window_secs: default_credential_failure_window_secs(),
        }
    }
}

fn default_units_per_window() -> u32 {
    // 250 units/sec Gmail per-user quota over a 60s window
    15_000
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_wait_secs() -> u64 {
    30
}

fn default_trash_threshold() -> f64 {
    0.85
}

fn default_archive_threshold() -> f64 {
    0.55
}

fn default_review_threshold() -> f64 {
    0.30
}

fn default_escalation_threshold() -> f64 {
    0.90
}

fn default_rules_weight() -> f64 {
    0.4
}

fn default_assisted_weight() -> f64 {
    0.6
}

fn default_assisted_trash_floor() -> f64 {
    0.85
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_assisted_timeout_secs() -> u64 {
    10
}

fn default_cache_ttl_days() -> u32 {
    30
}

fn default_recent_days() -> u32 {
    3
}

fn default_recent_min_confidence() -> f64 {
    0.95
}

fn default_high_open_rate() -> f64 {
    0.5
}

fn default_contacts_ttl_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_undo_window_days() -> u32 {
    30
}

fn default_label_prefix() -> String {
    "Triage".to_string()
}

fn default_label_min_confidence() -> f64 {
    0.85
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_secs() -> u64 {
    30
}

fn default_max_job_attempts() -> u32 {
    5
}

fn default_backlog_age_days() -> u32 {
    30
}

fn default_backlog_batch_size() -> u32 {
    100
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".inbox-triage/triage.db")
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_dir() -> PathBuf {
    PathBuf::from(".inbox-triage/tokens")
}

fn default_pause_alert_after_secs() -> u64 {
    3600
}

fn default_credential_failure_burst() -> usize {
    5
}

fn default_credential_failure_window_secs() -> u64 {
    600
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TriageError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TriageError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TriageError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TriageError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| TriageError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.units_per_window == 0 {
            return Err(TriageError::ConfigError(
                "rate_limit.units_per_window must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(TriageError::ConfigError(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }

        self.classification.thresholds.validate()?;

        let c = &self.classification;
        if !(0.0..=1.0).contains(&c.escalation_threshold) {
            return Err(TriageError::ConfigError(
                "classification.escalation_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if (c.rules_weight + c.assisted_weight - 1.0).abs() > 1e-6 {
            return Err(TriageError::ConfigError(format!(
                "classification.rules_weight + assisted_weight must equal 1.0 (got {} + {})",
                c.rules_weight, c.assisted_weight
            )));
        }
        if !(0.0..=1.0).contains(&c.assisted_trash_floor) {
            return Err(TriageError::ConfigError(
                "classification.assisted_trash_floor must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.assisted.timeout_secs == 0 {
            return Err(TriageError::ConfigError(
                "assisted.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.assisted.model.is_empty() {
            return Err(TriageError::ConfigError(
                "assisted.model cannot be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.safety.recent_min_confidence) {
            return Err(TriageError::ConfigError(
                "safety.recent_min_confidence must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.safety.high_open_rate) {
            return Err(TriageError::ConfigError(
                "safety.high_open_rate must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self
            .safety
            .extra_protected_phrases
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return Err(TriageError::ConfigError(
                "safety.extra_protected_phrases cannot contain empty strings".to_string(),
            ));
        }

        if self.execution.undo_window_days == 0 {
            return Err(TriageError::ConfigError(
                "execution.undo_window_days must be at least 1".to_string(),
            ));
        }
        if self.execution.label_prefix.is_empty() {
            return Err(TriageError::ConfigError(
                "execution.label_prefix cannot be empty".to_string(),
            ));
        }
        if self.execution.label_prefix.contains('/') {
            return Err(TriageError::ConfigError(
                "execution.label_prefix cannot contain '/' character".to_string(),
            ));
        }
        if self.execution.workers == 0 || self.execution.workers > 64 {
            return Err(TriageError::ConfigError(
                "execution.workers must be between 1 and 64".to_string(),
            ));
        }

        if self.sync.poll_interval_secs == 0 {
            return Err(TriageError::ConfigError(
                "sync.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(TriageError::ConfigError(
                "sync.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.backlog.batch_size == 0 || self.backlog.batch_size > 500 {
            return Err(TriageError::ConfigError(
                "backlog.batch_size must be between 1 and 500".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    pub fn undo_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.execution.undo_window_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.classification.thresholds.trash, 0.85);
        assert_eq!(config.classification.thresholds.archive, 0.55);
        assert_eq!(config.classification.thresholds.review, 0.30);
        assert_eq!(config.classification.escalation_threshold, 0.90);
        assert_eq!(config.assisted.timeout_secs, 10);
        assert_eq!(config.assisted.cache_ttl_days, 30);
        assert_eq!(config.safety.recent_days, 3);
        assert_eq!(config.execution.undo_window_days, 30);
        assert!(!config.execution.action_mode);
        assert_eq!(config.sync.poll_interval_secs, 600);
        assert_eq!(config.sync.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_boundaries() {
        let t = ClassificationThresholds::default();
        assert_eq!(t.disposition_for(0.85), Disposition::Trash);
        assert_eq!(t.disposition_for(0.849999), Disposition::Archive);
        assert_eq!(t.disposition_for(0.55), Disposition::Archive);
        assert_eq!(t.disposition_for(0.549999), Disposition::Review);
        assert_eq!(t.disposition_for(0.30), Disposition::Review);
        assert_eq!(t.disposition_for(0.299999), Disposition::Keep);
        assert_eq!(t.disposition_for(1.0), Disposition::Trash);
        assert_eq!(t.disposition_for(0.0), Disposition::Keep);
    }

    #[test]
    fn test_config_validation_threshold_order() {
        let mut config = Config::default();
        config.classification.thresholds.archive = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("trash > archive > review"));
    }

    #[test]
    fn test_config_validation_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.classification.assisted_weight = 0.7;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must equal 1.0"));
    }

    #[test]
    fn test_config_validation_zero_window() {
        let mut config = Config::default();
        config.rate_limit.window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_prefix_with_slash() {
        let mut config = Config::default();
        config.execution.label_prefix = "Triage/Docs".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot contain '/'"));
    }

    #[test]
    fn test_config_validation_empty_phrase() {
        let mut config = Config::default();
        config.safety.extra_protected_phrases = vec!["  ".to_string()];
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_load_save_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = Config::default();
        config.execution.label_prefix = "Sorted".to_string();
        config.save(path).await.unwrap();

        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.execution.label_prefix, "Sorted");
        assert_eq!(loaded.rate_limit.units_per_window, config.rate_limit.units_per_window);
    }

    #[tokio::test]
    async fn test_config_load_nonexistent_returns_default() {
        let path = Path::new("/tmp/nonexistent-inbox-triage-config-12345.toml");
        let config = Config::load(path).await.unwrap();
        assert_eq!(config.sync.poll_interval_secs, 600);
    }

    #[tokio::test]
    async fn test_config_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "this is not valid toml {[}]")
            .await
            .unwrap();

        let err = Config::load(temp_file.path()).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[tokio::test]
    async fn test_config_partial_with_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(
            temp_file.path(),
            "[classification.thresholds]\ntrash = 0.9\n\n[sync]\npoll_interval_secs = 120\n",
        )
        .await
        .unwrap();

        let config = Config::load(temp_file.path()).await.unwrap();
        assert_eq!(config.classification.thresholds.trash, 0.9);
        assert_eq!(config.classification.thresholds.archive, 0.55);
        assert_eq!(config.sync.poll_interval_secs, 120);
        assert_eq!(config.sync.max_attempts, 3);
    }
}
