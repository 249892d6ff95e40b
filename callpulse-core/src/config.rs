//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/callpulse/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/callpulse/` (~/.config/callpulse/)
//! - Data: `$XDG_DATA_HOME/callpulse/` (~/.local/share/callpulse/)
//! - State/Logs: `$XDG_STATE_HOME/callpulse/` (~/.local/state/callpulse/)
//!
//! Every section is optional. The analyzer word lists, objective rules and
//! alert thresholds are plain data here so they can be injected into the
//! analyzer and alert evaluator (and replaced by fixtures in tests).

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Category name whose objectives feed the BANT lead score.
pub const LEAD_QUALIFICATION: &str = "lead_qualification";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Conversation analyzer word lists and objective rules
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Alert thresholds
    #[serde(default)]
    pub alerts: AlertThresholds,

    /// Notification channel (optional)
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Ingestion behaviour
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================
// Analyzer
// ============================================

/// A topic marker: the objective tag is recorded when any pattern occurs.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ObjectiveMarker {
    /// Tag appended to `objectives_achieved`
    pub tag: String,
    /// Lowercase substrings that signal the topic was covered
    pub patterns: Vec<String>,
}

impl ObjectiveMarker {
    fn new(tag: &str, patterns: &[&str]) -> Self {
        Self {
            tag: tag.to_string(),
            patterns: strings(patterns),
        }
    }
}

/// Heuristic conversation analysis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    #[serde(default = "default_positive_words")]
    pub positive_words: Vec<String>,

    #[serde(default = "default_negative_words")]
    pub negative_words: Vec<String>,

    /// Vocabulary intersected with the transcript's word set
    #[serde(default = "default_business_keywords")]
    pub business_keywords: Vec<String>,

    /// Phrases that add the `send_proposal` next step
    #[serde(default = "default_interest_phrases")]
    pub interest_phrases: Vec<String>,

    /// Phrases that mark a conversation as escalated
    #[serde(default = "default_escalation_phrases")]
    pub escalation_phrases: Vec<String>,

    /// Objective markers keyed by template category
    #[serde(default = "default_objective_rules")]
    pub objective_rules: HashMap<String, Vec<ObjectiveMarker>>,

    /// Lead score awarded per achieved lead-qualification objective
    #[serde(default = "default_lead_score_per_objective")]
    pub lead_score_per_objective: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            positive_words: default_positive_words(),
            negative_words: default_negative_words(),
            business_keywords: default_business_keywords(),
            interest_phrases: default_interest_phrases(),
            escalation_phrases: default_escalation_phrases(),
            objective_rules: default_objective_rules(),
            lead_score_per_objective: default_lead_score_per_objective(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_positive_words() -> Vec<String> {
    strings(&[
        "great",
        "excellent",
        "good",
        "happy",
        "satisfied",
        "perfect",
        "wonderful",
        "amazing",
        "helpful",
        "thank",
    ])
}

fn default_negative_words() -> Vec<String> {
    strings(&[
        "terrible",
        "awful",
        "bad",
        "angry",
        "frustrated",
        "disappointed",
        "horrible",
        "poor",
        "upset",
        "hate",
    ])
}

fn default_business_keywords() -> Vec<String> {
    strings(&[
        "appointment",
        "budget",
        "contract",
        "demo",
        "discount",
        "integration",
        "invoice",
        "pricing",
        "proposal",
        "quote",
        "renewal",
        "subscription",
        "support",
        "trial",
        "upgrade",
    ])
}

fn default_interest_phrases() -> Vec<String> {
    strings(&[
        "interested",
        "sounds good",
        "send me",
        "move forward",
        "sign up",
    ])
}

fn default_escalation_phrases() -> Vec<String> {
    strings(&[
        "speak to a manager",
        "talk to a human",
        "real person",
        "supervisor",
        "transfer me",
    ])
}

fn default_objective_rules() -> HashMap<String, Vec<ObjectiveMarker>> {
    let mut rules = HashMap::new();
    rules.insert(
        LEAD_QUALIFICATION.to_string(),
        vec![
            ObjectiveMarker::new("budget_discussed", &["budget", "price"]),
            ObjectiveMarker::new("authority_identified", &["decision", "authority"]),
            ObjectiveMarker::new("need_identified", &["need", "problem"]),
            ObjectiveMarker::new("timeline_established", &["timeline", "when"]),
        ],
    );
    rules.insert(
        "customer_support".to_string(),
        vec![
            ObjectiveMarker::new("issue_identified", &["issue", "problem", "error"]),
            ObjectiveMarker::new("solution_provided", &["fixed", "resolved", "solution"]),
            ObjectiveMarker::new("customer_satisfied", &["thank", "that helps"]),
        ],
    );
    rules.insert(
        "appointment_scheduling".to_string(),
        vec![
            ObjectiveMarker::new("availability_checked", &["available", "availability"]),
            ObjectiveMarker::new("appointment_booked", &["booked", "scheduled", "confirm"]),
            ObjectiveMarker::new("reminder_offered", &["reminder"]),
        ],
    );
    rules
}

fn default_lead_score_per_objective() -> u32 {
    25
}

// ============================================
// Alerts
// ============================================

/// Static thresholds for the alert evaluator
#[derive(Debug, Deserialize, Clone)]
pub struct AlertThresholds {
    /// Failure-rate alerts need strictly more calls than this in the month
    #[serde(default = "default_min_calls_for_failure_rate")]
    pub min_calls_for_failure_rate: i64,

    /// Failure ratio (0..1) that must be exceeded
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// Quality scores strictly below this raise a degradation alert
    #[serde(default = "default_low_quality_score")]
    pub low_quality_score: f64,

    /// Objective counts strictly above this raise a high-performance alert
    #[serde(default = "default_high_performance_objectives")]
    pub high_performance_objectives: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_calls_for_failure_rate: default_min_calls_for_failure_rate(),
            failure_rate: default_failure_rate(),
            low_quality_score: default_low_quality_score(),
            high_performance_objectives: default_high_performance_objectives(),
        }
    }
}

fn default_min_calls_for_failure_rate() -> i64 {
    10
}

fn default_failure_rate() -> f64 {
    0.20
}

fn default_low_quality_score() -> f64 {
    2.0
}

fn default_high_performance_objectives() -> usize {
    3
}

// ============================================
// Notifications
// ============================================

/// Webhook notification channel configuration
///
/// When disabled, alerts are only written to the log.
#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint receiving `{ "subject": ..., "message": ... }` POSTs
    pub webhook_url: Option<String>,

    /// Bearer token (optional)
    pub api_key: Option<String>,

    /// Prefix for alert subjects, e.g. `callpulse.alerts.high_failure_rate`
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_notification_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures
    #[serde(default = "default_notification_max_retries")]
    pub max_retries: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            api_key: None,
            subject_prefix: default_subject_prefix(),
            timeout_secs: default_notification_timeout(),
            max_retries: default_notification_max_retries(),
        }
    }
}

impl NotificationConfig {
    /// Check if the webhook is enabled and has an endpoint
    pub fn is_ready(&self) -> bool {
        self.enabled && self.webhook_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        match &self.webhook_url {
            None => {
                return Err(Error::Config(
                    "notifications.webhook_url is required when notifications are enabled"
                        .to_string(),
                ))
            }
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(Error::Config(format!(
                    "notifications.webhook_url must be an http(s) URL, got {url}"
                )))
            }
            Some(_) => {}
        }
        if self.subject_prefix.trim().is_empty() {
            return Err(Error::Config(
                "notifications.subject_prefix must not be empty".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "notifications.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_subject_prefix() -> String {
    "callpulse.alerts".to_string()
}

fn default_notification_timeout() -> u64 {
    10
}

fn default_notification_max_retries() -> usize {
    2
}

// ============================================
// Ingestion
// ============================================

/// Ingestion pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Skip events whose idempotency key was already processed
    #[serde(default = "default_dedupe")]
    pub dedupe: bool,

    /// Seconds an in-flight call marker lives without a matching end event.
    ///
    /// Counted from the `call_started` event's own timestamp, so a start
    /// delivered later than this is never counted as in flight.
    #[serde(default = "default_active_call_ttl")]
    pub active_call_ttl_secs: i64,

    /// Days an idempotency key is kept; redeliveries older than this are
    /// applied again. 0 keeps keys forever.
    #[serde(default = "default_ledger_retention_days")]
    pub ledger_retention_days: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedupe: default_dedupe(),
            active_call_ttl_secs: default_active_call_ttl(),
            ledger_retention_days: default_ledger_retention_days(),
        }
    }
}

fn default_dedupe() -> bool {
    true
}

fn default_ledger_retention_days() -> i64 {
    30
}

fn default_active_call_ttl() -> i64 {
    4 * 60 * 60
}

// ============================================
// Logging
// ============================================

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.notifications.validate()?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/callpulse/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("callpulse").join("config.toml")
    }

    /// `$XDG_DATA_HOME/callpulse/`
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("callpulse")
    }

    /// `$XDG_STATE_HOME/callpulse/`
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("callpulse")
    }

    /// `$XDG_DATA_HOME/callpulse/aggregates.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("aggregates.db")
    }

    /// `$XDG_STATE_HOME/callpulse/callpulse.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("callpulse.log")
    }
}
