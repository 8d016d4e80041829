//! Pattern detector: failure signatures and warnings over a context's history.
//!
//! Detection is a pure function of the stored context and the pattern
//! config; nothing here is persisted.

use crate::core::config::PatternConfig;
use crate::core::error::MoltError;
use crate::core::store::Store;
use crate::core::vocab::{ActionResult, ActionType, ApproachResult};
use crate::plugins::contexts::{self, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// One action type failing repeatedly.
    ActionFailures,
    /// The same query text issued over and over.
    RepeatedQuery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSignature {
    pub kind: PatternKind,
    /// Action type for `action_failures`, normalized query text for `repeated_query`.
    pub key: String,
    pub occurrences: usize,
    pub max_consecutive: usize,
    /// True when `max_consecutive` alone reaches the threshold.
    pub consecutive: bool,
    /// Number of trailing records inspected.
    pub window: usize,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub severity: Severity,
    pub code: String,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<PatternSignature>,
}

fn tail<T>(items: &[T], window: usize) -> &[T] {
    &items[items.len().saturating_sub(window)..]
}

fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Threshold as applied; a zero threshold behaves like one.
fn min_hits(cfg: &PatternConfig) -> usize {
    cfg.threshold.max(1)
}

/// Collect (timestamp, matched) runs for one key and summarize them.
fn summarize(
    kind: PatternKind,
    key: String,
    hits: &[(i64, bool)],
    cfg: &PatternConfig,
    window: usize,
) -> Option<PatternSignature> {
    let matched: Vec<i64> = hits.iter().filter(|(_, m)| *m).map(|(ts, _)| *ts).collect();
    let threshold = min_hits(cfg);
    if matched.len() < threshold {
        return None;
    }
    let (&first_seen, &last_seen) = (matched.first()?, matched.last()?);
    let mut run = 0;
    let mut max_run = 0;
    for (_, m) in hits {
        run = if *m { run + 1 } else { 0 };
        max_run = max_run.max(run);
    }
    Some(PatternSignature {
        kind,
        key,
        occurrences: matched.len(),
        max_consecutive: max_run,
        consecutive: max_run >= threshold,
        window,
        first_seen,
        last_seen,
    })
}

/// Failure signatures for one context, sorted by (kind, key).
pub fn detect(ctx: &Context, cfg: &PatternConfig) -> Vec<PatternSignature> {
    let mut out = Vec::new();

    let actions = tail(&ctx.actions, cfg.window);
    for action_type in ActionType::ALL {
        // Consecutive means consecutive among actions of this type.
        let hits: Vec<(i64, bool)> = actions
            .iter()
            .filter(|a| a.action_type == *action_type)
            .map(|a| (a.timestamp, a.result == ActionResult::Failure))
            .collect();
        if let Some(sig) = summarize(
            PatternKind::ActionFailures,
            action_type.as_str().to_string(),
            &hits,
            cfg,
            actions.len(),
        ) {
            out.push(sig);
        }
    }

    let queries = tail(&ctx.queries, cfg.window);
    let mut by_text: BTreeMap<String, Vec<(i64, bool)>> = BTreeMap::new();
    for q in queries {
        let norm = normalize_query(&q.text);
        for (key, hits) in by_text.iter_mut() {
            hits.push((q.timestamp, *key == norm));
        }
        by_text
            .entry(norm)
            .or_insert_with(|| vec![(q.timestamp, true)]);
    }
    for (key, hits) in by_text {
        if let Some(sig) = summarize(PatternKind::RepeatedQuery, key, &hits, cfg, queries.len()) {
            out.push(sig);
        }
    }

    out.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.key.cmp(&b.key)));
    out
}

fn pattern_warning(sig: &PatternSignature) -> Warning {
    match sig.kind {
        PatternKind::ActionFailures => Warning {
            severity: if sig.consecutive {
                Severity::Critical
            } else {
                Severity::Warning
            },
            code: "repeated_failure".to_string(),
            cause: format!(
                "'{}' failed {} times in the last {} actions ({} in a row)",
                sig.key, sig.occurrences, sig.window, sig.max_consecutive
            ),
            pattern: Some(sig.clone()),
        },
        PatternKind::RepeatedQuery => Warning {
            severity: Severity::Info,
            code: "repeated_query".to_string(),
            cause: format!(
                "query \"{}\" was asked {} times in the last {} queries",
                sig.key, sig.occurrences, sig.window
            ),
            pattern: Some(sig.clone()),
        },
    }
}

/// Threshold warnings plus one warning per pattern, most severe first.
pub fn warnings(ctx: &Context, cfg: &PatternConfig, patterns: &[PatternSignature]) -> Vec<Warning> {
    let mut out = Vec::new();

    let since_success = ctx
        .actions
        .iter()
        .rev()
        .take_while(|a| a.result != ActionResult::Success)
        .count();
    if since_success >= cfg.no_progress_actions {
        out.push(Warning {
            severity: Severity::Warning,
            code: "no_progress".to_string(),
            cause: format!("{} actions since the last successful one", since_success),
            pattern: None,
        });
    }

    let last_action = ctx.actions.iter().map(|a| a.timestamp).max();
    let idle_queries = ctx
        .queries
        .iter()
        .filter(|q| last_action.is_none_or(|ts| q.timestamp > ts))
        .count();
    if idle_queries >= cfg.query_churn {
        out.push(Warning {
            severity: Severity::Info,
            code: "query_churn".to_string(),
            cause: format!("{} queries without any action taken", idle_queries),
            pattern: None,
        });
    }

    let failed = ctx
        .approaches
        .iter()
        .filter(|a| matches!(a.result, ApproachResult::Failure | ApproachResult::Abandoned))
        .count();
    if failed >= min_hits(cfg) {
        out.push(Warning {
            severity: Severity::Warning,
            code: "failing_approaches".to_string(),
            cause: format!("{} approaches failed or were abandoned", failed),
            pattern: None,
        });
    }

    out.extend(patterns.iter().map(pattern_warning));
    out.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.code.cmp(&b.code))
            .then_with(|| a.cause.cmp(&b.cause))
    });
    out
}

pub fn detect_failure_patterns(store: &Store, id: &str) -> Result<Vec<PatternSignature>, MoltError> {
    let ctx = contexts::get(store, id)?;
    Ok(detect(&ctx, &store.config.patterns))
}

pub fn get_enhanced_warnings(store: &Store, id: &str) -> Result<Vec<Warning>, MoltError> {
    let ctx = contexts::get(store, id)?;
    let cfg = &store.config.patterns;
    let patterns = detect(&ctx, cfg);
    let found = warnings(&ctx, cfg, &patterns);
    tracing::debug!(id, patterns = patterns.len(), warnings = found.len(), "warnings computed");
    Ok(found)
}
