//! Per-context and store-wide statistics.

use crate::core::broker::DbBroker;
use crate::core::config::Limits;
use crate::core::error::MoltError;
use crate::core::store::Store;
use crate::core::vocab::{ActionResult, LimitPolicy};
use crate::plugins::contexts;
use crate::plugins::recommend::success_ratio;
use crate::plugins::snapshot;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionTypeStats {
    pub action_type: String,
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub partial: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub id: String,
    pub queries: usize,
    pub actions: usize,
    pub approaches: usize,
    pub queries_by_type: BTreeMap<String, usize>,
    /// Busiest action types first, bounded by the stats limit.
    pub top_actions: Vec<ActionTypeStats>,
    pub approaches_by_result: BTreeMap<String, usize>,
    pub success_ratio: f64,
    pub snapshots: i64,
    pub first_activity: Option<i64>,
    pub last_activity: Option<i64>,
    pub active_span_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub contexts: usize,
    pub archived: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_agent: BTreeMap<String, usize>,
    pub snapshots: i64,
}

pub fn context_stats(store: &Store, id: &str) -> Result<ContextStats, MoltError> {
    context_stats_top(store, id, None, LimitPolicy::Clamp)
}

pub fn context_stats_top(
    store: &Store,
    id: &str,
    top: Option<usize>,
    policy: LimitPolicy,
) -> Result<ContextStats, MoltError> {
    let top = Limits::resolve(store.config.limits.stats, top, policy, "stats")?;
    let broker = DbBroker::new(&store.root);
    let (ctx, snapshots) = broker.with_conn(&store.db_path(), "molt", None, "stats.context", |conn| {
        let ctx = contexts::load_required(conn, id)?;
        let snaps = snapshot::count_for(conn, id)?;
        Ok((ctx, snaps))
    })?;

    let mut queries_by_type = BTreeMap::new();
    for q in &ctx.queries {
        *queries_by_type.entry(q.query_type.to_string()).or_insert(0) += 1;
    }

    let mut per_type: BTreeMap<String, ActionTypeStats> = BTreeMap::new();
    for a in &ctx.actions {
        let entry = per_type
            .entry(a.action_type.to_string())
            .or_insert_with(|| ActionTypeStats {
                action_type: a.action_type.to_string(),
                total: 0,
                success: 0,
                failure: 0,
                partial: 0,
            });
        entry.total += 1;
        match a.result {
            ActionResult::Success => entry.success += 1,
            ActionResult::Failure => entry.failure += 1,
            ActionResult::Partial => entry.partial += 1,
        }
    }
    let mut top_actions: Vec<ActionTypeStats> = per_type.into_values().collect();
    top_actions.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.action_type.cmp(&b.action_type)));
    top_actions.truncate(top);

    let mut approaches_by_result = BTreeMap::new();
    for ap in &ctx.approaches {
        *approaches_by_result.entry(ap.result.to_string()).or_insert(0) += 1;
    }

    let stamps = ctx
        .queries
        .iter()
        .map(|q| q.timestamp)
        .chain(ctx.actions.iter().map(|a| a.timestamp))
        .chain(ctx.approaches.iter().map(|a| a.timestamp));
    let first_activity = stamps.clone().min();
    let last_activity = stamps.max();
    let active_span_ms = match (first_activity, last_activity) {
        (Some(first), Some(last)) => last - first,
        _ => 0,
    };

    Ok(ContextStats {
        id: ctx.id.clone(),
        queries: ctx.queries.len(),
        actions: ctx.actions.len(),
        approaches: ctx.approaches.len(),
        queries_by_type,
        top_actions,
        approaches_by_result,
        success_ratio: success_ratio(&ctx),
        snapshots,
        first_activity,
        last_activity,
        active_span_ms,
    })
}

pub fn store_stats(store: &Store) -> Result<StoreStats, MoltError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&store.db_path(), "molt", None, "stats.store", |conn| {
        let mut by_status = BTreeMap::new();
        let mut by_agent = BTreeMap::new();
        let mut contexts = 0;
        let mut archived = 0;

        let mut stmt = conn.prepare("SELECT status, agent, archived FROM contexts")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let agent: String = row.get(1)?;
            let is_archived: i64 = row.get(2)?;
            contexts += 1;
            if is_archived != 0 {
                archived += 1;
            }
            *by_status.entry(status).or_insert(0) += 1;
            *by_agent.entry(agent).or_insert(0) += 1;
        }
        let snapshots: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;

        Ok(StoreStats {
            contexts,
            archived,
            by_status,
            by_agent,
            snapshots,
        })
    })
}
