//! Configuration loading and resolution
//!
//! Resolution priority for every value: CLI argument > environment variable >
//! TOML config file > compiled default. The loaded configuration is validated
//! once at startup; invalid values fail fast with `Error::Config`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Engine configuration, one instance shared by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database path
    pub database_path: PathBuf,
    /// Directory for subset files, hotlist reports, selection reports
    pub output_dir: PathBuf,

    /// Worker poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Runs/batches stuck in `running` longer than this are recovered
    pub stale_timeout_secs: u64,
    /// Per-stage timeout (propose, apply, canary, evaluate)
    pub stage_timeout_secs: u64,
    /// Stale sweep interval in seconds
    pub sweep_interval_secs: u64,

    /// Capability call retry policy
    pub retry: RetryConfig,
    /// Decision engine weights and gates
    pub decision: DecisionConfig,
    /// Harness deltas and ceilings
    pub harness: HarnessConfig,
    /// Canary selection defaults
    pub canary: CanaryConfig,

    /// Max structural proposals applied per loop iteration
    pub max_structural_changes_per_loop: u32,
    /// Max proposals emitted by one generator pass
    pub max_proposals_per_run: usize,
    /// Bounded concurrency for per-product classification
    pub classify_concurrency: usize,
    /// Run-log retention in days
    pub runlog_retention_days: i64,

    /// Completion service endpoint (None selects the null completer)
    pub completion_url: Option<String>,
    /// Embedding service endpoint (None selects the null embedder)
    pub embedding_url: Option<String>,
}

/// Retry policy knobs shared by all capability calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

/// Decision engine weights and default gates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Weight of the lexical term-match score
    pub lexical_weight: f64,
    /// Weight of the embedding cosine-similarity score
    pub semantic_weight: f64,
    /// Weight of the attribute-compatibility score
    pub attribute_weight: f64,
    /// Default auto-accept confidence gate (overridable per category)
    pub auto_min_confidence: f64,
    /// Default auto-accept margin gate (overridable per category)
    pub auto_min_margin: f64,
    /// Extra confidence required for categories flagged high_risk
    pub high_risk_confidence_penalty: f64,
    /// Lexical hits saturate toward 1.0 at this count
    pub lexical_saturation: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.45,
            semantic_weight: 0.35,
            attribute_weight: 0.20,
            auto_min_confidence: 0.70,
            auto_min_margin: 0.10,
            high_risk_confidence_penalty: 0.10,
            lexical_saturation: 4.0,
        }
    }
}

/// Harness gate configuration: minimum deltas vs baseline and absolute ceilings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Minimum allowed (candidate - baseline) delta per accuracy tier.
    /// Negative values tolerate small regressions.
    pub min_accuracy_delta_l1: f64,
    pub min_accuracy_delta_l2: f64,
    pub min_accuracy_delta_l3: f64,
    /// Absolute ceilings, checked on the candidate run alone
    pub max_fallback_rate: f64,
    pub max_needs_review_rate: f64,
    /// Absolute floor on the candidate's auto-accepted rate. The 0.0
    /// default disables the check until an operator sets a floor.
    pub min_auto_accepted_rate: f64,
    /// Benchmark snapshots below this sample count are rebuilt before use
    pub min_benchmark_sample_size: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            min_accuracy_delta_l1: -0.01,
            min_accuracy_delta_l2: -0.01,
            min_accuracy_delta_l3: -0.02,
            max_fallback_rate: 0.15,
            max_needs_review_rate: 0.40,
            min_auto_accepted_rate: 0.0,
            min_benchmark_sample_size: 50,
        }
    }
}

/// Canary subset selection defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub sample_size: usize,
    /// Portion of the sample drawn from the confusion hotlist
    pub fixed_ratio: f64,
    pub seed: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            sample_size: 350,
            fixed_ratio: 0.3,
            seed: 42,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("taxloop.db"),
            output_dir: PathBuf::from("out"),
            poll_interval_ms: 2_000,
            stale_timeout_secs: 900,
            stage_timeout_secs: 600,
            sweep_interval_secs: 60,
            retry: RetryConfig::default(),
            decision: DecisionConfig::default(),
            harness: HarnessConfig::default(),
            canary: CanaryConfig::default(),
            max_structural_changes_per_loop: 1,
            max_proposals_per_run: 10,
            classify_concurrency: 8,
            runlog_retention_days: 30,
            completion_url: None,
            embedding_url: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration: TOML file (if present), then environment
    /// overrides, then validation.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
                })?;
                let config: EngineConfig = toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?;
                info!("Configuration loaded from {}", path.display());
                config
            }
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    return Self::load(Some(&default_path));
                }
                EngineConfig::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides (highest non-CLI priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TAXLOOP_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("TAXLOOP_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("TAXLOOP_COMPLETION_URL") {
            self.completion_url = Some(url);
        }
        if let Ok(url) = std::env::var("TAXLOOP_EMBEDDING_URL") {
            self.embedding_url = Some(url);
        }
        if let Ok(val) = std::env::var("TAXLOOP_POLL_INTERVAL_MS") {
            match val.parse() {
                Ok(ms) => self.poll_interval_ms = ms,
                Err(_) => warn!("Ignoring invalid TAXLOOP_POLL_INTERVAL_MS: {}", val),
            }
        }
    }

    /// Validate ranges; fail fast on nonsense values.
    pub fn validate(&self) -> Result<()> {
        let unit = |v: f64, name: &str| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::Config(format!("{} must be in [0,1], got {}", name, v)));
            }
            Ok(())
        };

        unit(self.decision.auto_min_confidence, "decision.auto_min_confidence")?;
        unit(self.decision.auto_min_margin, "decision.auto_min_margin")?;
        unit(self.harness.max_fallback_rate, "harness.max_fallback_rate")?;
        unit(self.harness.max_needs_review_rate, "harness.max_needs_review_rate")?;
        unit(self.harness.min_auto_accepted_rate, "harness.min_auto_accepted_rate")?;
        unit(self.canary.fixed_ratio, "canary.fixed_ratio")?;

        let weight_sum = self.decision.lexical_weight
            + self.decision.semantic_weight
            + self.decision.attribute_weight;
        if weight_sum <= 0.0 {
            return Err(Error::Config(
                "decision weights must sum to a positive value".to_string(),
            ));
        }
        if self.classify_concurrency == 0 {
            return Err(Error::Config("classify_concurrency must be >= 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Default config file location: ~/.config/taxloop/taxloop.toml
pub fn default_config_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config").join("taxloop").join("taxloop.toml")
    } else {
        PathBuf::from("taxloop.toml")
    }
}
