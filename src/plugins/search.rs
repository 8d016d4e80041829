//! Search index: a derived projection over the contexts table.
//!
//! `search_docs` keeps one row per context with the top-level fields needed
//! for filtering and ranking; `search_terms` maps tokens to the field they
//! were found in. Both are written in the same transaction as the context
//! itself, and both can be dropped and regenerated from `contexts` at any time.

use crate::core::broker::DbBroker;
use crate::core::config::Limits;
use crate::core::db;
use crate::core::error::MoltError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::vocab::{LimitPolicy, SearchScope, Status, SyncMode};
use crate::plugins::contexts::{self, Context};
use regex::Regex;
use rusqlite::{Connection, params};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;

const INDEX_VERSION_KEY: &str = "search_index_version";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub status: Option<Status>,
    pub agent: Option<String>,
    pub include_archived: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub scope: SearchScope,
    pub filters: SearchFilters,
    pub limit: Option<usize>,
    pub limit_policy: LimitPolicy,
}

impl SearchFilters {
    /// Whether a loaded context still satisfies these filters.
    pub fn admits(&self, ctx: &Context) -> bool {
        (self.include_archived || !ctx.archived)
            && self.status.is_none_or(|s| s == ctx.status)
            && self.agent.as_ref().is_none_or(|a| *a == ctx.agent)
    }
}

impl SearchQuery {
    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }
}

/// Why a context matched, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Nested,
    TopLevel,
    GoalSubstring,
    GoalExact,
    /// Empty query text: every context passing the filters.
    Unfiltered,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub context: Context,
    pub matched: MatchKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub mode: SyncMode,
    pub reprojected: usize,
    pub removed: usize,
    pub documents: usize,
}

/// Ranked search results, loaded from the repository one at a time.
pub struct SearchResults {
    conn: Option<Connection>,
    pending: VecDeque<(String, MatchKind)>,
    filters: SearchFilters,
    total: usize,
}

impl SearchResults {
    /// Number of contexts that matched at ranking time. Contexts purged or
    /// moved outside the filters before they are loaded are not yielded.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Drain into plain contexts, stopping at the first storage error.
    pub fn into_contexts(self) -> Result<Vec<Context>, MoltError> {
        self.map(|hit| hit.map(|h| h.context)).collect()
    }
}

impl Iterator for SearchResults {
    type Item = Result<SearchHit, MoltError>;

    fn next(&mut self) -> Option<Self::Item> {
        let conn = self.conn.as_ref()?;
        while let Some((id, matched)) = self.pending.pop_front() {
            match contexts::load(conn, &id) {
                Ok(Some(context)) if self.filters.admits(&context) => {
                    return Some(Ok(SearchHit { context, matched }));
                }
                // Purged, archived or reassigned after ranking.
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tokenizing
// ---------------------------------------------------------------------------

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}_]+").unwrap())
}

/// Lowercased alphanumeric runs, first occurrence order, no duplicates.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut seen = FxHashSet::default();
    token_re()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Projection maintenance
// ---------------------------------------------------------------------------

const TOP_FIELDS: &[&str] = &["goal", "status", "agent"];

/// Write (or rewrite) the projection of one context. Runs in the caller's transaction.
pub(crate) fn project(conn: &Connection, ctx: &Context) -> Result<(), MoltError> {
    conn.execute(
        "INSERT INTO search_docs(context_id, goal_lc, status, agent, archived, updated_at, revision)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(context_id) DO UPDATE SET
             goal_lc = excluded.goal_lc, status = excluded.status, agent = excluded.agent,
             archived = excluded.archived, updated_at = excluded.updated_at,
             revision = excluded.revision",
        params![
            ctx.id,
            ctx.goal.to_lowercase(),
            ctx.status.as_str(),
            ctx.agent,
            ctx.archived as i64,
            ctx.updated_at,
            ctx.revision
        ],
    )?;
    conn.execute(
        "DELETE FROM search_terms WHERE context_id = ?1",
        params![ctx.id],
    )?;

    let mut terms: FxHashSet<(String, &'static str)> = FxHashSet::default();
    for t in tokenize(&ctx.goal) {
        terms.insert((t, "goal"));
    }
    terms.insert((ctx.status.as_str().to_string(), "status"));
    for t in tokenize(&ctx.agent) {
        terms.insert((t, "agent"));
    }
    for q in &ctx.queries {
        for t in tokenize(&q.text) {
            terms.insert((t, "query"));
        }
    }
    for a in &ctx.actions {
        terms.insert((a.action_type.as_str().to_string(), "action"));
        if let Some(detail) = &a.detail {
            for t in tokenize(detail) {
                terms.insert((t, "action"));
            }
        }
    }
    for ap in &ctx.approaches {
        for t in tokenize(&ap.description) {
            terms.insert((t, "approach"));
        }
    }

    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO search_terms(term, field, context_id) VALUES(?1, ?2, ?3)",
    )?;
    for (term, field) in &terms {
        stmt.execute(params![term, field, ctx.id])?;
    }
    Ok(())
}

/// Drop the projection of one context.
pub(crate) fn forget(conn: &Connection, id: &str) -> Result<(), MoltError> {
    conn.execute("DELETE FROM search_terms WHERE context_id = ?1", params![id])?;
    conn.execute("DELETE FROM search_docs WHERE context_id = ?1", params![id])?;
    Ok(())
}

fn count(conn: &Connection, sql: &str) -> Result<usize, MoltError> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as usize)
}

fn rebuild_in(conn: &Connection) -> Result<IndexReport, MoltError> {
    let removed = count(conn, "SELECT COUNT(*) FROM search_docs")?;
    conn.execute("DELETE FROM search_terms", [])?;
    conn.execute("DELETE FROM search_docs", [])?;

    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM contexts")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for id in &ids {
        let ctx = contexts::load_required(conn, id)?;
        project(conn, &ctx)?;
    }
    db::write_meta(conn, INDEX_VERSION_KEY, schemas::SEARCH_INDEX_VERSION)?;
    Ok(IndexReport {
        mode: SyncMode::Full,
        reprojected: ids.len(),
        removed,
        documents: ids.len(),
    })
}

fn sync_incremental_in(conn: &Connection) -> Result<IndexReport, MoltError> {
    let stale: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT c.id FROM contexts c
             LEFT JOIN search_docs d ON d.context_id = c.id
             WHERE d.context_id IS NULL OR d.revision != c.revision",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let orphans: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT d.context_id FROM search_docs d
             LEFT JOIN contexts c ON c.id = d.context_id
             WHERE c.id IS NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for id in &stale {
        let ctx = contexts::load_required(conn, id)?;
        project(conn, &ctx)?;
    }
    for id in &orphans {
        forget(conn, id)?;
    }
    Ok(IndexReport {
        mode: SyncMode::Incremental,
        reprojected: stale.len(),
        removed: orphans.len(),
        documents: count(conn, "SELECT COUNT(*) FROM search_docs")?,
    })
}

/// Rebuild the projection if it is missing, outdated, or out of step with the contexts table.
pub fn ensure_index(store: &Store) -> Result<(), MoltError> {
    let broker = DbBroker::new(&store.root);
    let report = broker.with_tx(&store.db_path(), "molt", None, "index.ensure", |conn| {
        let version = db::read_meta(conn, INDEX_VERSION_KEY)?;
        let contexts = count(conn, "SELECT COUNT(*) FROM contexts")?;
        let docs = count(conn, "SELECT COUNT(*) FROM search_docs")?;
        if version.as_deref() == Some(schemas::SEARCH_INDEX_VERSION) && contexts == docs {
            return Ok(None);
        }
        rebuild_in(conn).map(Some)
    })?;
    if let Some(r) = report {
        tracing::info!(documents = r.documents, "search index rebuilt on open");
    }
    Ok(())
}

/// Drop and regenerate the whole projection.
pub fn rebuild_index(store: &Store) -> Result<IndexReport, MoltError> {
    sync_index(store, SyncMode::Full)
}

pub fn sync_index(store: &Store, mode: SyncMode) -> Result<IndexReport, MoltError> {
    let broker = DbBroker::new(&store.root);
    let op = format!("index.sync.{}", mode);
    let report = broker.with_tx(&store.db_path(), "molt", None, &op, |conn| match mode {
        SyncMode::Full => rebuild_in(conn),
        SyncMode::Incremental => sync_incremental_in(conn),
    })?;
    tracing::info!(
        mode = %report.mode,
        reprojected = report.reprojected,
        removed = report.removed,
        "search index synced"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

struct Candidate {
    id: String,
    goal_lc: String,
    updated_at: i64,
    revision: i64,
}

/// Rank matching context ids, best first. `limit = None` returns every match.
pub(crate) fn rank(
    conn: &Connection,
    query: &SearchQuery,
    limit: Option<usize>,
) -> Result<Vec<(String, MatchKind)>, MoltError> {
    let mut sql = "SELECT context_id, goal_lc, updated_at, revision FROM search_docs WHERE 1 = 1"
        .to_string();
    let mut bind: Vec<String> = Vec::new();
    if !query.filters.include_archived {
        sql.push_str(" AND archived = 0");
    }
    if let Some(status) = query.filters.status {
        bind.push(status.as_str().to_string());
        sql.push_str(&format!(" AND status = ?{}", bind.len()));
    }
    if let Some(agent) = &query.filters.agent {
        bind.push(agent.clone());
        sql.push_str(&format!(" AND agent = ?{}", bind.len()));
    }

    let candidates: Vec<Candidate> = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bind.iter()), |row| {
            Ok(Candidate {
                id: row.get(0)?,
                goal_lc: row.get(1)?,
                updated_at: row.get(2)?,
                revision: row.get(3)?,
            })
        })?;
        rows.collect::<Result<_, _>>()?
    };

    let text_lc = query
        .text
        .as_deref()
        .map(|t| t.trim().to_lowercase())
        .unwrap_or_default();
    let tokens = tokenize(&text_lc);

    // token index -> (context id -> found at top level?, found nested?)
    let mut hits: FxHashMap<String, Vec<(bool, bool)>> = FxHashMap::default();
    if !tokens.is_empty() {
        let mut stmt = conn.prepare_cached("SELECT context_id, field FROM search_terms WHERE term = ?1")?;
        for (i, token) in tokens.iter().enumerate() {
            let rows = stmt.query_map(params![token], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, field) = row?;
                let slots = hits
                    .entry(id)
                    .or_insert_with(|| vec![(false, false); tokens.len()]);
                if TOP_FIELDS.contains(&field.as_str()) {
                    slots[i].0 = true;
                } else {
                    slots[i].1 = true;
                }
            }
        }
    }

    let mut ranked: Vec<(MatchKind, Candidate)> = candidates
        .into_iter()
        .filter_map(|c| {
            let kind = if text_lc.is_empty() {
                Some(MatchKind::Unfiltered)
            } else if c.goal_lc == text_lc {
                Some(MatchKind::GoalExact)
            } else if c.goal_lc.contains(&text_lc) {
                Some(MatchKind::GoalSubstring)
            } else if tokens.is_empty() {
                None
            } else {
                let slots = hits.get(&c.id)?;
                if slots.iter().all(|(top, _)| *top) {
                    Some(MatchKind::TopLevel)
                } else if query.scope == SearchScope::All
                    && slots.iter().all(|(top, nested)| *top || *nested)
                {
                    Some(MatchKind::Nested)
                } else {
                    None
                }
            };
            kind.map(|k| (k, c))
        })
        .collect();

    ranked.sort_by(|(ka, a), (kb, b)| {
        kb.cmp(ka)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(b.revision.cmp(&a.revision))
            .then(a.id.cmp(&b.id))
    });
    if let Some(n) = limit {
        ranked.truncate(n);
    }
    Ok(ranked.into_iter().map(|(k, c)| (c.id, k)).collect())
}

/// Ranked, lazily loaded search over the working set (or beyond, per filters).
pub fn search(store: &Store, query: &SearchQuery) -> Result<SearchResults, MoltError> {
    let limit = Limits::resolve(
        store.config.limits.search,
        query.limit,
        query.limit_policy,
        "search",
    )?;
    let broker = DbBroker::new(&store.root);
    let ranked = broker.with_conn(&store.db_path(), "molt", None, "search", |conn| {
        rank(conn, query, Some(limit))
    })?;
    tracing::debug!(matches = ranked.len(), "search ranked");

    let conn = if ranked.is_empty() {
        None
    } else {
        Some(db::db_connect(&store.db_path().to_string_lossy())?)
    };
    Ok(SearchResults {
        conn,
        filters: query.filters.clone(),
        total: ranked.len(),
        pending: ranked.into(),
    })
}
