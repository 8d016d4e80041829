//! Store configuration (`molt.toml` in the store root).
//!
//! Every field has a default, so a missing file or a partial file is valid.

use crate::core::error::MoltError;
use crate::core::vocab::LimitPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "molt.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Allow more than one active context per agent.
    pub multi_active: bool,
    /// Upper bound on waiting for a per-context lock.
    pub lock_timeout_ms: u64,
    pub vocab: Vocabulary,
    pub limits: Limits,
    pub patterns: PatternConfig,
    pub recommend: RecommendConfig,
    pub snapshots: SnapshotPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            multi_active: false,
            lock_timeout_ms: 2_000,
            vocab: Vocabulary::default(),
            limits: Limits::default(),
            patterns: PatternConfig::default(),
            recommend: RecommendConfig::default(),
            snapshots: SnapshotPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn load(root: &Path) -> Result<Self, MoltError> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(MoltError::IoError)?;
        let config: StoreConfig = toml::from_str(&content)?;
        config.check()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honour.
    pub fn check(&self) -> Result<(), MoltError> {
        if self.vocab.agents.is_empty() {
            return Err(MoltError::ValidationError(
                "vocab.agents must name at least one agent".to_string(),
            ));
        }
        if self.patterns.threshold == 0 || self.patterns.window == 0 {
            return Err(MoltError::ValidationError(
                "patterns.threshold and patterns.window must be positive".to_string(),
            ));
        }
        let w = self.recommend.text_weight + self.recommend.success_weight;
        if self.recommend.text_weight < 0.0 || self.recommend.success_weight < 0.0 || w <= 0.0 {
            return Err(MoltError::ValidationError(
                "recommend weights must be non-negative and not both zero".to_string(),
            ));
        }
        for (name, bound) in [
            ("search", &self.limits.search),
            ("pagination", &self.limits.pagination),
            ("stats", &self.limits.stats),
            ("recommend", &self.limits.recommend),
        ] {
            if bound.default == 0 || bound.default > bound.max {
                return Err(MoltError::ValidationError(format!(
                    "limits.{}: default must be in 1..=max",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn check_agent(&self, agent: &str) -> Result<(), MoltError> {
        if self.vocab.agents.iter().any(|a| a == agent) {
            Ok(())
        } else {
            Err(MoltError::ValidationError(format!(
                "Invalid agent '{}'; must be one of: {}",
                agent,
                self.vocab.agents.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    pub agents: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            agents: ["claude", "codex", "gemini", "cursor", "copilot", "human"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Default and ceiling for one result-size knob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitBound {
    pub default: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub search: LimitBound,
    pub pagination: LimitBound,
    pub stats: LimitBound,
    pub recommend: LimitBound,
    pub max_goal_chars: usize,
    pub max_query_chars: usize,
    pub max_detail_chars: usize,
    pub max_approach_chars: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            search: LimitBound { default: 20, max: 100 },
            pagination: LimitBound { default: 50, max: 500 },
            stats: LimitBound { default: 10, max: 50 },
            recommend: LimitBound { default: 5, max: 25 },
            max_goal_chars: 2_000,
            max_query_chars: 4_000,
            max_detail_chars: 8_000,
            max_approach_chars: 4_000,
        }
    }
}

impl Limits {
    /// Resolve a caller-requested size against a bound.
    ///
    /// `None` takes the default. Zero is always invalid. Oversized requests are
    /// clamped to `max` or rejected, depending on `policy`.
    pub fn resolve(
        bound: LimitBound,
        requested: Option<usize>,
        policy: LimitPolicy,
        what: &str,
    ) -> Result<usize, MoltError> {
        let Some(n) = requested else {
            return Ok(bound.default);
        };
        if n == 0 {
            return Err(MoltError::ValidationError(format!(
                "{} limit must be positive",
                what
            )));
        }
        if n <= bound.max {
            return Ok(n);
        }
        match policy {
            LimitPolicy::Clamp => Ok(bound.max),
            LimitPolicy::Reject => Err(MoltError::ValidationError(format!(
                "{} limit {} exceeds maximum {}",
                what, n, bound.max
            ))),
        }
    }

    pub fn check_field(&self, field: &str, value: &str, max_chars: usize) -> Result<(), MoltError> {
        let len = value.chars().count();
        if len > max_chars {
            return Err(MoltError::ValidationError(format!(
                "{} is {} chars; limit is {}",
                field, len, max_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Failures of one kind needed to emit a signature.
    pub threshold: usize,
    /// Trailing number of actions (or queries) inspected.
    pub window: usize,
    pub no_progress_actions: usize,
    pub query_churn: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: 10,
            no_progress_actions: 10,
            query_churn: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendConfig {
    pub text_weight: f64,
    pub success_weight: f64,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            text_weight: 0.6,
            success_weight: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    pub on_complete: bool,
    pub on_handoff: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            on_complete: true,
            on_handoff: true,
        }
    }
}
