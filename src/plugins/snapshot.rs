//! Snapshot manager: immutable point-in-time copies of contexts.
//!
//! Snapshots are written once and never updated. They go away only through
//! the explicit retention action (`archive::prune_snapshots`).

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::MoltError;
use crate::core::store::Store;
use crate::core::time;
use crate::core::vocab::{SnapshotReason, Status};
use crate::plugins::contexts::{self, Context, Mutation};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub context_id: String,
    pub reason: SnapshotReason,
    pub timestamp: i64,
    pub payload: Context,
    pub payload_hash: String,
}

/// Result of an update that went through the snapshot policy.
#[derive(Debug, Clone, Serialize)]
pub struct ObservedUpdate {
    pub context: Context,
    pub snapshots: Vec<Snapshot>,
}

pub fn payload_hash(payload_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Freeze `ctx` into a new snapshot row. Runs inside the caller's transaction.
pub(crate) fn capture(
    conn: &Connection,
    ctx: &Context,
    reason: SnapshotReason,
) -> Result<Snapshot, MoltError> {
    let payload_json = serde_json::to_string(ctx)?;
    let snap = Snapshot {
        id: time::new_record_id("snap"),
        context_id: ctx.id.clone(),
        reason,
        timestamp: time::now_epoch_ms(),
        payload: ctx.clone(),
        payload_hash: payload_hash(&payload_json),
    };
    let seq = db::next_counter(conn, "snapshot_seq")?;
    conn.execute(
        "INSERT INTO snapshots(id, context_id, reason, ts, seq, payload, payload_hash)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            snap.id,
            snap.context_id,
            snap.reason.as_str(),
            snap.timestamp,
            seq,
            payload_json,
            snap.payload_hash
        ],
    )?;
    Ok(snap)
}

pub(crate) fn load_snapshots(
    conn: &Connection,
    context_id: Option<&str>,
    limit: usize,
) -> Result<Vec<Snapshot>, MoltError> {
    let (sql, bind): (String, Vec<String>) = match context_id {
        Some(id) => (
            format!(
                "SELECT id, context_id, reason, ts, payload, payload_hash FROM snapshots
                 WHERE context_id = ?1 ORDER BY seq DESC LIMIT {}",
                limit
            ),
            vec![id.to_string()],
        ),
        None => (
            format!(
                "SELECT id, context_id, reason, ts, payload, payload_hash FROM snapshots
                 ORDER BY seq DESC LIMIT {}",
                limit
            ),
            vec![],
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(bind.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let reason: String = row.get(2)?;
        let payload: String = row.get(4)?;
        out.push(Snapshot {
            id: row.get(0)?,
            context_id: row.get(1)?,
            reason: reason.parse()?,
            timestamp: row.get(3)?,
            payload: serde_json::from_str(&payload)?,
            payload_hash: row.get(5)?,
        });
    }
    Ok(out)
}

pub(crate) fn count_for(conn: &Connection, context_id: &str) -> Result<i64, MoltError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM snapshots WHERE context_id = ?1",
        params![context_id],
        |row| row.get(0),
    )?)
}

/// Delete all but the newest `keep_latest` snapshots of a context.
pub(crate) fn delete_older(
    conn: &Connection,
    context_id: &str,
    keep_latest: usize,
) -> Result<usize, MoltError> {
    let removed = conn.execute(
        "DELETE FROM snapshots WHERE context_id = ?1 AND id NOT IN (
             SELECT id FROM snapshots WHERE context_id = ?1 ORDER BY seq DESC LIMIT ?2
         )",
        params![context_id, keep_latest as i64],
    )?;
    Ok(removed)
}

/// Snapshot with a caller-supplied reason string.
///
/// The reason is validated before anything is read or written.
pub fn snapshot(
    store: &Store,
    context_id: Option<&str>,
    reason: &str,
) -> Result<Option<Snapshot>, MoltError> {
    let reason: SnapshotReason = reason.parse()?;
    contexts::create_snapshot(store, context_id, reason)
}

/// Reasons the snapshot policy assigns to a before/after transition.
pub fn policy_reasons(store: &Store, before: &Context, after: &Context) -> Vec<SnapshotReason> {
    let policy = &store.config.snapshots;
    let mut reasons = Vec::new();
    if policy.on_complete && after.status == Status::Completed && before.status != Status::Completed
    {
        reasons.push(SnapshotReason::Milestone);
    }
    if policy.on_handoff && after.agent != before.agent {
        reasons.push(SnapshotReason::Handoff);
    }
    reasons
}

/// Apply the auto-snapshot policy to an observed mutation.
///
/// Policy snapshots freeze `after` exactly as the mutation committed it,
/// whatever its status, so a completed context still gets its milestone
/// snapshot even if another writer has moved it on since.
pub fn observe(store: &Store, before: &Context, after: &Context) -> Result<Vec<Snapshot>, MoltError> {
    let reasons = policy_reasons(store, before, after);
    if reasons.is_empty() {
        return Ok(Vec::new());
    }

    let _locks = contexts::lock_contexts(store, std::slice::from_ref(&after.id))?;
    let broker = DbBroker::new(&store.root);
    let snaps = broker.with_tx(&store.db_path(), "molt", None, "snapshot.policy", |conn| {
        // Purged in the meantime.
        contexts::load_required(conn, &after.id)?;
        reasons
            .iter()
            .map(|reason| capture(conn, after, *reason))
            .collect::<Result<Vec<_>, _>>()
    })?;

    for s in &snaps {
        tracing::info!(id = %s.id, context = %s.context_id, reason = %s.reason, "policy snapshot");
    }
    Ok(snaps)
}

/// `contexts::apply` followed by `observe`.
pub fn update_observed(
    store: &Store,
    id: &str,
    expected_version: Option<u64>,
    mutations: &[Mutation],
) -> Result<ObservedUpdate, MoltError> {
    let change = contexts::apply(store, id, expected_version, mutations)?;
    let snapshots = observe(store, &change.before, &change.after)?;
    Ok(ObservedUpdate {
        context: change.after,
        snapshots,
    })
}
