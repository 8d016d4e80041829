//! Context repository: durable storage for contexts and their snapshots.
//!
//! The `contexts` table is the single source of truth. Every mutation runs
//! under the per-context lock inside one `IMMEDIATE` transaction, bumps the
//! record's `version` and the store-wide `revision` clock, and refreshes the
//! search projection in the same transaction.

use crate::core::broker::DbBroker;
use crate::core::config::Limits;
use crate::core::db;
use crate::core::error::MoltError;
use crate::core::locks::{self, global_locks};
use crate::core::store::Store;
use crate::core::time;
use crate::core::vocab::{
    ActionResult, ActionType, ApproachResult, LimitPolicy, QueryType, SnapshotReason, Status,
};
use crate::plugins::search;
use crate::plugins::snapshot::{self, Snapshot};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub goal: String,
    pub status: Status,
    pub agent: String,
    #[serde(default)]
    pub queries: Vec<Query>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub approaches: Vec<Approach>,
    pub archived: bool,
    pub version: u64,
    pub revision: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub query_type: QueryType,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub result: ActionResult,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approach {
    pub description: String,
    pub result: ApproachResult,
    pub timestamp: i64,
}

/// Embedded history, stored as one JSON column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct History {
    #[serde(default)]
    queries: Vec<Query>,
    #[serde(default)]
    actions: Vec<Action>,
    #[serde(default)]
    approaches: Vec<Approach>,
}

/// A field-level change applied by `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    SetGoal {
        goal: String,
    },
    SetStatus {
        status: Status,
    },
    SetAgent {
        agent: String,
    },
    AddQuery {
        query_type: QueryType,
        text: String,
    },
    AddAction {
        action_type: ActionType,
        result: ActionResult,
        #[serde(default)]
        detail: Option<String>,
    },
    AddApproach {
        description: String,
        result: ApproachResult,
    },
}

/// Before/after pair returned by `apply`, for callers that react to transitions.
#[derive(Debug, Clone)]
pub struct ContextChange {
    pub before: Context,
    pub after: Context,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextFilter {
    pub status: Option<Status>,
    pub agent: Option<String>,
    pub include_archived: bool,
    pub archived_only: bool,
    pub limit: Option<usize>,
    pub limit_policy: LimitPolicy,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const CONTEXT_COLUMNS: &str =
    "id, goal, status, agent, archived, version, revision, created_at, updated_at, history";

fn context_from_row(row: &Row<'_>) -> Result<Context, MoltError> {
    let status: String = row.get(2)?;
    let history_json: String = row.get(9)?;
    let history: History = serde_json::from_str(&history_json)?;
    let version: i64 = row.get(5)?;
    Ok(Context {
        id: row.get(0)?,
        goal: row.get(1)?,
        status: status.parse()?,
        agent: row.get(3)?,
        archived: row.get::<_, i64>(4)? != 0,
        version: version as u64,
        revision: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        queries: history.queries,
        actions: history.actions,
        approaches: history.approaches,
    })
}

fn history_json(ctx: &Context) -> Result<String, MoltError> {
    let history = History {
        queries: ctx.queries.clone(),
        actions: ctx.actions.clone(),
        approaches: ctx.approaches.clone(),
    };
    Ok(serde_json::to_string(&history)?)
}

pub(crate) fn load(conn: &Connection, id: &str) -> Result<Option<Context>, MoltError> {
    let sql = format!("SELECT {} FROM contexts WHERE id = ?1", CONTEXT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(context_from_row(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn load_required(conn: &Connection, id: &str) -> Result<Context, MoltError> {
    load(conn, id)?.ok_or_else(|| MoltError::NotFound(format!("context '{}'", id)))
}

fn insert(conn: &Connection, ctx: &Context) -> Result<(), MoltError> {
    conn.execute(
        "INSERT INTO contexts(id, goal, status, agent, archived, version, revision, created_at, updated_at, history)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            ctx.id,
            ctx.goal,
            ctx.status.as_str(),
            ctx.agent,
            ctx.archived as i64,
            ctx.version as i64,
            ctx.revision,
            ctx.created_at,
            ctx.updated_at,
            history_json(ctx)?,
        ],
    )?;
    search::project(conn, ctx)
}

/// Compare-and-swap write: succeeds only if the stored version is still `expected_version`.
pub(crate) fn save(conn: &Connection, ctx: &Context, expected_version: u64) -> Result<(), MoltError> {
    let changed = conn.execute(
        "UPDATE contexts
         SET goal = ?2, status = ?3, agent = ?4, archived = ?5, version = ?6, revision = ?7,
             updated_at = ?8, history = ?9
         WHERE id = ?1 AND version = ?10",
        params![
            ctx.id,
            ctx.goal,
            ctx.status.as_str(),
            ctx.agent,
            ctx.archived as i64,
            ctx.version as i64,
            ctx.revision,
            ctx.updated_at,
            history_json(ctx)?,
            expected_version as i64,
        ],
    )?;
    if changed == 0 {
        return Err(MoltError::Conflict(format!(
            "context '{}' was modified concurrently (expected version {})",
            ctx.id, expected_version
        )));
    }
    search::project(conn, ctx)
}

pub(crate) fn delete(conn: &Connection, id: &str) -> Result<(), MoltError> {
    conn.execute("DELETE FROM contexts WHERE id = ?1", params![id])?;
    search::forget(conn, id)
}

/// Stamp a mutated record: new version, strictly later `updated_at`, next revision.
pub(crate) fn touch(conn: &Connection, ctx: &mut Context) -> Result<(), MoltError> {
    ctx.version += 1;
    ctx.updated_at = time::advance_ms(ctx.updated_at);
    ctx.revision = db::next_counter(conn, "revision")?;
    Ok(())
}

/// Enforce "one active, non-archived context per agent" unless multi-active is on.
pub(crate) fn check_active_slot(
    conn: &Connection,
    store: &Store,
    agent: &str,
    exclude_id: Option<&str>,
) -> Result<(), MoltError> {
    if store.config.multi_active {
        return Ok(());
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM contexts
             WHERE agent = ?1 AND status = 'active' AND archived = 0 AND id != ?2
             LIMIT 1",
            params![agent, exclude_id.unwrap_or("")],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(other) => Err(MoltError::Conflict(format!(
            "agent '{}' already has an active context '{}'",
            agent, other
        ))),
        None => Ok(()),
    }
}

fn lock_timeout(store: &Store) -> Duration {
    Duration::from_millis(store.config.lock_timeout_ms)
}

pub(crate) fn lock_contexts(store: &Store, ids: &[String]) -> Result<locks::LockSet, MoltError> {
    lock_with_agents(store, ids, &[])
}

/// Context keys plus the agent keys whose active slot the caller may claim.
pub(crate) fn lock_with_agents(
    store: &Store,
    ids: &[String],
    agents: &[String],
) -> Result<locks::LockSet, MoltError> {
    let keys: Vec<String> = ids
        .iter()
        .map(|id| locks::context_key(id))
        .chain(agents.iter().map(|a| locks::agent_key(a)))
        .collect();
    global_locks().acquire(&store.db_path(), &keys, lock_timeout(store))
}

/// Current agents of `ids`, read outside any transaction. The slot check
/// inside the write transaction remains authoritative.
pub(crate) fn current_agents(store: &Store, ids: &[String]) -> Result<Vec<String>, MoltError> {
    let conn = db::db_connect(&store.db_path().to_string_lossy())?;
    let mut agents = Vec::new();
    for id in ids {
        if let Some(ctx) = load(&conn, id)? {
            agents.push(ctx.agent);
        }
    }
    Ok(agents)
}

/// Agents whose active slot a mutation batch can claim.
fn claimed_agents(store: &Store, id: &str, mutations: &[Mutation]) -> Result<Vec<String>, MoltError> {
    let mut agents = Vec::new();
    let mut claims = false;
    for m in mutations {
        match m {
            Mutation::SetAgent { agent } => {
                agents.push(agent.clone());
                claims = true;
            }
            Mutation::SetStatus {
                status: Status::Active,
            } => claims = true,
            _ => {}
        }
    }
    if claims {
        agents.extend(current_agents(store, &[id.to_string()])?);
    }
    Ok(agents)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_goal(store: &Store, goal: &str) -> Result<(), MoltError> {
    if goal.trim().is_empty() {
        return Err(MoltError::ValidationError("goal cannot be empty".to_string()));
    }
    let limits = &store.config.limits;
    limits.check_field("goal", goal, limits.max_goal_chars)
}

fn check_mutation(store: &Store, m: &Mutation) -> Result<(), MoltError> {
    let limits = &store.config.limits;
    match m {
        Mutation::SetGoal { goal } => check_goal(store, goal),
        Mutation::SetStatus { .. } => Ok(()),
        Mutation::SetAgent { agent } => store.config.check_agent(agent),
        Mutation::AddQuery { text, .. } => {
            if text.trim().is_empty() {
                return Err(MoltError::ValidationError("query text cannot be empty".to_string()));
            }
            limits.check_field("query text", text, limits.max_query_chars)
        }
        Mutation::AddAction { detail, .. } => match detail {
            Some(d) => limits.check_field("action detail", d, limits.max_detail_chars),
            None => Ok(()),
        },
        Mutation::AddApproach { description, .. } => {
            if description.trim().is_empty() {
                return Err(MoltError::ValidationError(
                    "approach description cannot be empty".to_string(),
                ));
            }
            limits.check_field("approach description", description, limits.max_approach_chars)
        }
    }
}

fn apply_mutation(ctx: &mut Context, m: &Mutation, now: i64) {
    match m {
        Mutation::SetGoal { goal } => ctx.goal = goal.clone(),
        Mutation::SetStatus { status } => ctx.status = *status,
        Mutation::SetAgent { agent } => ctx.agent = agent.clone(),
        Mutation::AddQuery { query_type, text } => ctx.queries.push(Query {
            query_type: *query_type,
            text: text.clone(),
            timestamp: now,
        }),
        Mutation::AddAction {
            action_type,
            result,
            detail,
        } => ctx.actions.push(Action {
            action_type: *action_type,
            result: *result,
            timestamp: now,
            detail: detail.clone(),
        }),
        Mutation::AddApproach {
            description,
            result,
        } => ctx.approaches.push(Approach {
            description: description.clone(),
            result: *result,
            timestamp: now,
        }),
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Create a new active context for `agent`.
pub fn create(store: &Store, goal: &str, agent: &str) -> Result<Context, MoltError> {
    check_goal(store, goal)?;
    store.config.check_agent(agent)?;

    let id = time::new_record_id("ctx");
    let _locks = global_locks().acquire(
        &store.db_path(),
        &[locks::agent_key(agent), locks::context_key(&id)],
        lock_timeout(store),
    )?;

    let broker = DbBroker::new(&store.root);
    let ctx = broker.with_tx(&store.db_path(), agent, None, "context.create", |conn| {
        check_active_slot(conn, store, agent, None)?;
        let now = time::now_epoch_ms();
        let ctx = Context {
            id: id.clone(),
            goal: goal.to_string(),
            status: Status::Active,
            agent: agent.to_string(),
            queries: Vec::new(),
            actions: Vec::new(),
            approaches: Vec::new(),
            archived: false,
            version: 1,
            revision: db::next_counter(conn, "revision")?,
            created_at: now,
            updated_at: now,
        };
        insert(conn, &ctx)?;
        Ok(ctx)
    })?;

    tracing::info!(id = %ctx.id, agent = %ctx.agent, "context created");
    Ok(ctx)
}

/// Fetch a context by id. Archived contexts are still returned.
pub fn get(store: &Store, id: &str) -> Result<Context, MoltError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&store.db_path(), "molt", None, "context.get", |conn| {
        load_required(conn, id)
    })
}

/// Apply `mutations` atomically and return the updated context.
pub fn update(store: &Store, id: &str, mutations: &[Mutation]) -> Result<Context, MoltError> {
    apply(store, id, None, mutations).map(|change| change.after)
}

/// Apply `mutations` atomically, optionally guarded by the caller's last seen version.
pub fn apply(
    store: &Store,
    id: &str,
    expected_version: Option<u64>,
    mutations: &[Mutation],
) -> Result<ContextChange, MoltError> {
    if mutations.is_empty() {
        return Err(MoltError::ValidationError(
            "update requires at least one mutation".to_string(),
        ));
    }
    for m in mutations {
        check_mutation(store, m)?;
    }

    let agents = claimed_agents(store, id, mutations)?;
    let _locks = lock_with_agents(store, &[id.to_string()], &agents)?;
    let broker = DbBroker::new(&store.root);
    let change = broker.with_tx(&store.db_path(), "molt", None, "context.update", |conn| {
        let before = load_required(conn, id)?;
        if before.archived {
            return Err(MoltError::Conflict(format!(
                "context '{}' is archived; restore it before updating",
                id
            )));
        }
        if let Some(expected) = expected_version
            && expected != before.version
        {
            return Err(MoltError::Conflict(format!(
                "context '{}' is at version {}, caller expected {}",
                id, before.version, expected
            )));
        }

        let mut after = before.clone();
        let now = time::advance_ms(before.updated_at);
        for m in mutations {
            apply_mutation(&mut after, m, now);
        }

        let becomes_active = after.status == Status::Active
            && (before.status != Status::Active || before.agent != after.agent);
        if becomes_active {
            check_active_slot(conn, store, &after.agent, Some(id))?;
        }

        touch(conn, &mut after)?;
        save(conn, &after, before.version)?;
        Ok(ContextChange { before, after })
    })?;

    tracing::debug!(
        id = %change.after.id,
        version = change.after.version,
        mutations = mutations.len(),
        "context updated"
    );
    Ok(change)
}

/// List contexts, most recently touched first.
pub fn list(store: &Store, filter: &ContextFilter) -> Result<Vec<Context>, MoltError> {
    let limit = Limits::resolve(
        store.config.limits.pagination,
        filter.limit,
        filter.limit_policy,
        "list",
    )?;
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&store.db_path(), "molt", None, "context.list", |conn| {
        let mut sql = format!("SELECT {} FROM contexts WHERE 1 = 1", CONTEXT_COLUMNS);
        let mut bind: Vec<String> = Vec::new();
        if filter.archived_only {
            sql.push_str(" AND archived = 1");
        } else if !filter.include_archived {
            sql.push_str(" AND archived = 0");
        }
        if let Some(status) = filter.status {
            bind.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", bind.len()));
        }
        if let Some(agent) = &filter.agent {
            bind.push(agent.clone());
            sql.push_str(&format!(" AND agent = ?{}", bind.len()));
        }
        sql.push_str(&format!(
            " ORDER BY updated_at DESC, revision DESC LIMIT {}",
            limit
        ));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(bind.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(context_from_row(row)?);
        }
        Ok(out)
    })
}

/// Snapshot the active context.
///
/// With an id, that context is captured if it is active and not archived.
/// Without one, the most recently touched active context is captured.
/// `Ok(None)` means there was nothing active to snapshot.
pub fn create_snapshot(
    store: &Store,
    context_id: Option<&str>,
    reason: SnapshotReason,
) -> Result<Option<Snapshot>, MoltError> {
    let target = match context_id {
        Some(id) => id.to_string(),
        None => {
            let broker = DbBroker::new(&store.root);
            let found: Option<String> =
                broker.with_conn(&store.db_path(), "molt", None, "snapshot.resolve", |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT id FROM contexts WHERE status = 'active' AND archived = 0
                             ORDER BY updated_at DESC, revision DESC LIMIT 1",
                            [],
                            |row| row.get(0),
                        )
                        .optional()?)
                })?;
            match found {
                Some(id) => id,
                None => return Ok(None),
            }
        }
    };

    let _locks = lock_contexts(store, std::slice::from_ref(&target))?;
    let broker = DbBroker::new(&store.root);
    let snap = broker.with_tx(&store.db_path(), "molt", None, "snapshot.create", |conn| {
        let ctx = load_required(conn, &target)?;
        if ctx.status != Status::Active || ctx.archived {
            return Ok(None);
        }
        snapshot::capture(conn, &ctx, reason).map(Some)
    })?;

    match &snap {
        Some(s) => tracing::info!(id = %s.id, context = %s.context_id, reason = %s.reason, "snapshot created"),
        None => tracing::debug!(context = %target, "no active context to snapshot"),
    }
    Ok(snap)
}

/// Snapshots newest first, optionally scoped to one context.
pub fn list_snapshots(
    store: &Store,
    context_id: Option<&str>,
    limit: Option<usize>,
    policy: LimitPolicy,
) -> Result<Vec<Snapshot>, MoltError> {
    let limit = Limits::resolve(store.config.limits.pagination, limit, policy, "snapshot list")?;
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&store.db_path(), "molt", None, "snapshot.list", |conn| {
        snapshot::load_snapshots(conn, context_id, limit)
    })
}
