//! Engine and session configuration
//!
//! Configuration is plain serde data. It can be built in code or loaded from a TOML file named by
//! `ARBITER_CONFIG_PATH` (default `arbiter.toml`), with `ARBITER_*` environment variables applied on
//! top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, warn};

/// How `LockedEngine` protects readers from concurrent writers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistency {
    /// Hold the read lock for the whole evaluation; writers wait until it finishes
    #[default]
    HoldForEvaluation,
    /// Copy the sorted rule list under the lock, then evaluate without holding it
    Snapshot,
}

/// Options shared by both engine variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stop after the first rule whose condition holds
    #[serde(default)]
    pub stop_on_first_match: bool,
    /// Evaluate at most this many rules per `execute` call
    #[serde(default)]
    pub max_rules_to_execute: Option<usize>,
    /// Record per-rule timings in the metrics registry
    #[serde(default = "default_true")]
    pub track_performance: bool,
    /// Run the validator on expression conditions when a rule is registered
    #[serde(default = "default_true")]
    pub validate_on_register: bool,
    #[serde(default)]
    pub read_consistency: ReadConsistency,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_on_first_match: false,
            max_rules_to_execute: None,
            track_performance: true,
            validate_on_register: true,
            read_consistency: ReadConsistency::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_stop_on_first_match(mut self, stop: bool) -> Self {
        self.stop_on_first_match = stop;
        self
    }

    #[must_use]
    pub fn with_max_rules_to_execute(mut self, max: usize) -> Self {
        self.max_rules_to_execute = Some(max);
        self
    }

    #[must_use]
    pub fn with_track_performance(mut self, track: bool) -> Self {
        self.track_performance = track;
        self
    }

    #[must_use]
    pub fn with_validate_on_register(mut self, validate: bool) -> Self {
        self.validate_on_register = validate;
        self
    }

    #[must_use]
    pub fn with_read_consistency(mut self, consistency: ReadConsistency) -> Self {
        self.read_consistency = consistency;
        self
    }
}

/// Options for a [`Session`](crate::Session)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Reject rule sets whose dependencies name unregistered fact types
    #[serde(default = "default_true")]
    pub strict_schema: bool,
    /// Upper bound on facts held per type; exceeding it is a fatal error
    #[serde(default)]
    pub max_facts_per_type: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { strict_schema: true, max_facts_per_type: None }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl ArbiterConfig {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).context("invalid arbiter configuration")
    }

    /// Load from `ARBITER_CONFIG_PATH`, falling back to defaults when the file is missing
    pub fn load() -> Result<Self> {
        let path = std::env::var("ARBITER_CONFIG_PATH").unwrap_or_else(|_| "arbiter.toml".to_string());

        let config = match fs::read_to_string(&path) {
            Ok(source) => {
                Self::from_toml_str(&source).with_context(|| format!("failed to parse '{path}'"))?
            }
            Err(_) => {
                warn!("Configuration file '{}' not found. Using default configuration.", path);
                Self::default()
            }
        };

        Ok(config.apply_env_overrides())
    }

    /// Apply `ARBITER_*` environment variable overrides
    #[must_use]
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(stop) = env_parse::<bool>("ARBITER_STOP_ON_FIRST_MATCH") {
            self.engine.stop_on_first_match = stop;
        }
        if let Some(max) = env_parse::<usize>("ARBITER_MAX_RULES_TO_EXECUTE") {
            self.engine.max_rules_to_execute = Some(max);
        }
        if let Some(track) = env_parse::<bool>("ARBITER_TRACK_PERFORMANCE") {
            self.engine.track_performance = track;
        }
        if let Some(strict) = env_parse::<bool>("ARBITER_STRICT_SCHEMA") {
            self.session.strict_schema = strict;
        }
        if let Some(max) = env_parse::<usize>("ARBITER_MAX_FACTS_PER_TYPE") {
            self.session.max_facts_per_type = Some(max);
        }

        info!(
            stop_on_first_match = self.engine.stop_on_first_match,
            track_performance = self.engine.track_performance,
            strict_schema = self.session.strict_schema,
            "configuration loaded"
        );
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn default_true() -> bool {
    true
}
