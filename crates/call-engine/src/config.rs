//! Engine configuration.
//!
//! Every section has a `Default` so a bare `CallCenterConfig::default()` runs a
//! working engine against `sqlite:dialq.db`. Files are TOML; any section or field
//! may be omitted.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallCenterError, Result};
use crate::routing::types::CallOutcome;

/// Main configuration for the call engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CallCenterConfig {
    pub general: GeneralConfig,
    pub agents: AgentConfig,
    pub queues: QueueConfig,
    pub reconciler: ReconcilerConfig,
    pub scoring: ScoringConfig,
    pub callbacks: CallbackConfig,
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name reported in logs and stats
    pub instance_name: String,
    /// Run the periodic workers when the server starts
    pub enable_workers: bool,
}

/// Agent readiness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Seconds after the last heartbeat before an agent is considered gone
    pub heartbeat_timeout_secs: u64,
    /// Minimum readiness score (0-100) for inclusion in the ready set
    pub readiness_threshold: u8,
    /// Readiness cache entry lifetime
    pub readiness_cache_ttl_ms: u64,
    /// Concurrent call limit for newly registered agents
    pub default_max_concurrent_calls: u32,
    /// Heartbeat sweep interval
    pub sweep_interval_secs: u64,
}

/// Inbound holding queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap on live (waiting or assigned) inbound calls
    pub holding_capacity: u32,
    pub min_wait_estimate_secs: u32,
    pub max_wait_estimate_secs: u32,
    /// Used when there is no completed call history yet
    pub default_call_duration_secs: u32,
    /// How many recent completed calls feed the average duration
    pub recent_call_sample: u32,
    /// Priority given to an inbound caller with no explicit priority
    pub inbound_base_priority: i32,
    /// Subtracted from the priority of callers resolved to a known subject
    pub known_subject_bonus: i32,
    /// Terminal holding entries older than this are purged
    pub terminal_retention_hours: u64,
    pub retention_interval_secs: u64,
}

/// Queue membership reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub batch_size: u32,
    pub max_subjects: u32,
    /// Wall-clock budget for a single run
    pub execution_budget_secs: u64,
    /// Requirement types that never qualify a subject for the outstanding queue
    pub excluded_requirement_types: Vec<String>,
    /// Placeholder requirement every claim carries by default
    pub base_requirement_type: String,
    pub interval_secs: u64,
}

/// Claim value band; the highest band whose floor is reached applies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValueBand {
    pub min_value_cents: i64,
    pub bonus: i32,
}

/// Score adjustment and cooldown for a single call outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomePolicy {
    /// Added to the score (positive pushes the subject back)
    pub adjustment: i32,
    /// Minutes the subject stays out of the outbound queue after this outcome
    pub cooldown_minutes: i64,
}

impl OutcomePolicy {
    const fn new(adjustment: i32, cooldown_minutes: i64) -> Self {
        Self { adjustment, cooldown_minutes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomePolicies {
    pub connected: OutcomePolicy,
    pub no_answer: OutcomePolicy,
    pub voicemail: OutcomePolicy,
    pub busy: OutcomePolicy,
    pub not_interested: OutcomePolicy,
    pub wrong_number: OutcomePolicy,
    pub callback_requested: OutcomePolicy,
}

impl OutcomePolicies {
    pub fn for_outcome(&self, outcome: CallOutcome) -> &OutcomePolicy {
        match outcome {
            CallOutcome::Connected => &self.connected,
            CallOutcome::NoAnswer => &self.no_answer,
            CallOutcome::Voicemail => &self.voicemail,
            CallOutcome::Busy => &self.busy,
            CallOutcome::NotInterested => &self.not_interested,
            CallOutcome::WrongNumber => &self.wrong_number,
            CallOutcome::CallbackRequested => &self.callback_requested,
        }
    }
}

/// Priority scorer weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub base_score: i32,
    pub min_score: i32,
    pub max_score: i32,
    pub days_since_contact_weight: i32,
    pub max_days_since_contact: i64,
    pub pending_requirement_weight: i32,
    pub max_pending_requirements: u32,
    pub value_bands: Vec<ValueBand>,
    pub first_contact_bonus: i32,
    /// Attempts above this count are penalized
    pub high_attempt_threshold: u32,
    pub attempt_penalty: i32,
    pub time_of_day_bonus: i32,
    /// Subtracted for subjects in the unsigned queue
    pub unsigned_bonus: i32,
    pub outcomes: OutcomePolicies,
}

/// Callback injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Start of the advance window, seconds after now
    pub advance_window_start_secs: i64,
    /// End of the advance window, seconds after now
    pub advance_window_end_secs: i64,
    /// Priority of a passively injected callback entry
    pub injected_priority: i32,
    /// Priority of a callback an agent has accepted
    pub accepted_priority: i32,
    pub interval_secs: u64,
}

/// Assignment orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_interval_secs: u64,
    pub max_items_per_tick: u32,
    /// Failed ring attempts before an inbound call is abandoned
    pub max_assignment_attempts: u32,
    /// ASSIGNED holding entries with no agent older than this go back to WAITING
    pub stale_claim_timeout_secs: u64,
    /// Serve the outbound queue when no inbound call is waiting
    pub outbound_enabled: bool,
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Attempts for idempotent reads that hit a transient failure
    pub read_retry_attempts: u32,
    pub read_retry_base_delay_ms: u64,
}

/// Operational HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: "dialq".to_string(),
            enable_workers: true,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            readiness_threshold: 70,
            readiness_cache_ttl_ms: 3_000,
            default_max_concurrent_calls: 1,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            holding_capacity: 100,
            min_wait_estimate_secs: 30,
            max_wait_estimate_secs: 600, // 10 minutes
            default_call_duration_secs: 180,
            recent_call_sample: 50,
            inbound_base_priority: 100,
            known_subject_bonus: 20,
            terminal_retention_hours: 24,
            retention_interval_secs: 3_600,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_subjects: 5_000,
            execution_budget_secs: 25,
            excluded_requirement_types: vec!["INFORMATIONAL".to_string(), "INTERNAL_REVIEW".to_string()],
            base_requirement_type: "BASE".to_string(),
            interval_secs: 300, // 5 minutes
        }
    }
}

impl Default for OutcomePolicies {
    fn default() -> Self {
        Self {
            connected: OutcomePolicy::new(0, 24 * 60),
            no_answer: OutcomePolicy::new(10, 4 * 60),
            voicemail: OutcomePolicy::new(10, 4 * 60),
            busy: OutcomePolicy::new(5, 60),
            not_interested: OutcomePolicy::new(300, 30 * 24 * 60),
            wrong_number: OutcomePolicy::new(400, 90 * 24 * 60),
            callback_requested: OutcomePolicy::new(-100, 0),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_score: 500,
            min_score: 0,
            max_score: 1_000,
            days_since_contact_weight: 5,
            max_days_since_contact: 60,
            pending_requirement_weight: 15,
            max_pending_requirements: 10,
            value_bands: vec![
                ValueBand { min_value_cents: 100_000, bonus: 25 },
                ValueBand { min_value_cents: 1_000_000, bonus: 75 },
                ValueBand { min_value_cents: 5_000_000, bonus: 150 },
            ],
            first_contact_bonus: 50,
            high_attempt_threshold: 5,
            attempt_penalty: 20,
            time_of_day_bonus: 25,
            unsigned_bonus: 40,
            outcomes: OutcomePolicies::default(),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            advance_window_start_secs: 4 * 60,
            advance_window_end_secs: 6 * 60,
            injected_priority: -10_000,
            accepted_priority: -20_000,
            interval_secs: 60,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            max_items_per_tick: 10,
            max_assignment_attempts: 3,
            stale_claim_timeout_secs: 60,
            outbound_enabled: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:dialq.db".to_string(),
            max_connections: 5,
            read_retry_attempts: 3,
            read_retry_base_delay_ms: 50,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn readiness_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.readiness_cache_ttl_ms)
    }
}

impl ReconcilerConfig {
    pub fn execution_budget(&self) -> Duration {
        Duration::from_secs(self.execution_budget_secs)
    }
}

impl CallCenterConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CallCenterError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| CallCenterError::configuration(e.to_string()))?;
        config.validate().map_err(CallCenterError::configuration)?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.queues.holding_capacity == 0 {
            return Err("holding_capacity must be greater than 0".to_string());
        }

        if self.queues.min_wait_estimate_secs > self.queues.max_wait_estimate_secs {
            return Err(format!(
                "min_wait_estimate_secs ({}) exceeds max_wait_estimate_secs ({})",
                self.queues.min_wait_estimate_secs, self.queues.max_wait_estimate_secs
            ));
        }

        if self.agents.heartbeat_timeout_secs == 0 {
            return Err("heartbeat_timeout_secs must be greater than 0".to_string());
        }

        if self.agents.readiness_threshold > 100 {
            return Err("readiness_threshold must be within 0..=100".to_string());
        }

        if self.reconciler.batch_size == 0 {
            return Err("reconciler batch_size must be greater than 0".to_string());
        }

        if self.scoring.min_score > self.scoring.max_score {
            return Err("scoring min_score exceeds max_score".to_string());
        }

        // Callback overrides must sort ahead of every computed score
        if self.callbacks.injected_priority >= self.scoring.min_score {
            return Err(format!(
                "injected_priority ({}) must be below scoring min_score ({})",
                self.callbacks.injected_priority, self.scoring.min_score
            ));
        }

        if self.callbacks.accepted_priority >= self.callbacks.injected_priority {
            return Err(format!(
                "accepted_priority ({}) must be below injected_priority ({})",
                self.callbacks.accepted_priority, self.callbacks.injected_priority
            ));
        }

        if self.callbacks.advance_window_start_secs > self.callbacks.advance_window_end_secs {
            return Err("callback advance window start is after its end".to_string());
        }

        if self.orchestrator.max_assignment_attempts == 0 {
            return Err("max_assignment_attempts must be greater than 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("database url cannot be empty".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CallCenterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_callback_priorities_must_beat_scores() {
        let mut config = CallCenterConfig::default();
        config.callbacks.injected_priority = config.scoring.min_score;
        assert!(config.validate().is_err());

        let mut config = CallCenterConfig::default();
        config.callbacks.accepted_priority = config.callbacks.injected_priority + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CallCenterConfig::from_toml_str(
            r#"
            [queues]
            holding_capacity = 5

            [scoring.outcomes.busy]
            adjustment = 7
            cooldown_minutes = 15
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.queues.holding_capacity, 5);
        assert_eq!(config.queues.max_wait_estimate_secs, 600);
        assert_eq!(config.scoring.outcomes.for_outcome(CallOutcome::Busy).cooldown_minutes, 15);
        assert_eq!(config.reconciler.execution_budget_secs, 25);
    }

    #[test]
    fn test_invalid_toml_is_a_configuration_error() {
        let err = CallCenterConfig::from_toml_str("[queues]\nholding_capacity = 0\n").unwrap_err();
        assert!(matches!(err, CallCenterError::Configuration(_)));
    }
}
