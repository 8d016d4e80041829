//! Recommendation scorer: rank past contexts that may help with the target.

use crate::core::broker::DbBroker;
use crate::core::config::{Limits, RecommendConfig};
use crate::core::error::MoltError;
use crate::core::store::Store;
use crate::core::vocab::{ApproachResult, LimitPolicy};
use crate::plugins::contexts::{self, Context};
use crate::plugins::patterns::{self, PatternSignature};
use crate::plugins::search::{self, SearchQuery};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::cmp::Ordering;

const GOAL_WEIGHT: f64 = 0.9;
const AGENT_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub context: Context,
    pub score: f64,
    pub text_similarity: f64,
    pub success_ratio: f64,
    /// Failure patterns already seen in the recommended context.
    pub known_pitfalls: Vec<PatternSignature>,
}

pub fn jaccard(a: &FxHashSet<String>, b: &FxHashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn goal_terms(goal: &str) -> FxHashSet<String> {
    search::tokenize(goal).into_iter().collect()
}

pub fn success_ratio(ctx: &Context) -> f64 {
    if ctx.approaches.is_empty() {
        return 0.0;
    }
    let wins = ctx
        .approaches
        .iter()
        .filter(|a| a.result == ApproachResult::Success)
        .count();
    wins as f64 / ctx.approaches.len() as f64
}

fn score_candidate(
    target: &Context,
    target_terms: &FxHashSet<String>,
    candidate: Context,
    weights: &RecommendConfig,
    store: &Store,
) -> Recommendation {
    let same_agent = if candidate.agent == target.agent { 1.0 } else { 0.0 };
    let text_similarity =
        GOAL_WEIGHT * jaccard(target_terms, &goal_terms(&candidate.goal)) + AGENT_WEIGHT * same_agent;
    let ratio = success_ratio(&candidate);
    let known_pitfalls = patterns::detect(&candidate, &store.config.patterns);
    Recommendation {
        score: text_similarity * weights.text_weight + ratio * weights.success_weight,
        text_similarity,
        success_ratio: ratio,
        known_pitfalls,
        context: candidate,
    }
}

fn by_rank(a: &Recommendation, b: &Recommendation) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.context.updated_at.cmp(&a.context.updated_at))
        .then(b.context.revision.cmp(&a.context.revision))
        .then(a.context.id.cmp(&b.context.id))
}

/// Recommend up to `limit` contexts for `id`, clamping oversized limits.
pub fn recommend(store: &Store, id: &str, limit: i64) -> Result<Vec<Recommendation>, MoltError> {
    recommend_with(store, id, Some(limit), LimitPolicy::Clamp)
}

pub fn recommend_with(
    store: &Store,
    id: &str,
    limit: Option<i64>,
    policy: LimitPolicy,
) -> Result<Vec<Recommendation>, MoltError> {
    let requested = match limit {
        Some(n) if n <= 0 => {
            return Err(MoltError::ValidationError(format!(
                "recommend limit must be positive, got {}",
                n
            )));
        }
        Some(n) => Some(n as usize),
        None => None,
    };
    let limit = Limits::resolve(store.config.limits.recommend, requested, policy, "recommend")?;

    let broker = DbBroker::new(&store.root);
    let (target, candidates) =
        broker.with_conn(&store.db_path(), "molt", None, "recommend", |conn| {
            let target = contexts::load_required(conn, id)?;
            let ranked = search::rank(conn, &SearchQuery::default(), None)?;
            let mut candidates = Vec::new();
            for (cid, _) in ranked {
                if cid == target.id {
                    continue;
                }
                if let Some(ctx) = contexts::load(conn, &cid)?
                    && !ctx.archived
                    && !ctx.approaches.is_empty()
                {
                    candidates.push(ctx);
                }
            }
            Ok((target, candidates))
        })?;

    let target_terms = goal_terms(&target.goal);
    let weights = &store.config.recommend;
    let mut scored: Vec<Recommendation> = candidates
        .into_par_iter()
        .map(|c| score_candidate(&target, &target_terms, c, weights, store))
        .collect();
    scored.sort_by(by_rank);
    scored.truncate(limit);

    tracing::debug!(id, returned = scored.len(), "recommendations scored");
    Ok(scored)
}
