//! Archive/export pipeline.
//!
//! Export serializes contexts as JSON, Markdown or plain text, optionally
//! zstd-compressed (JSON only). Archive transitions move whole id sets
//! between the working set and cold storage in one transaction.

use crate::core::broker::DbBroker;
use crate::core::error::MoltError;
use crate::core::output::compact_line;
use crate::core::store::Store;
use crate::core::time;
use crate::core::vocab::{ArchiveAction, CompressionLevel, ExportFormat, Status};
use crate::plugins::contexts::{self, Context};
use crate::plugins::snapshot;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub format_version: u32,
    pub exported_at: i64,
    pub contexts: Vec<Context>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportOutput {
    pub format: ExportFormat,
    pub compression: CompressionLevel,
    pub exported: Vec<String>,
    pub skipped: Vec<Rejection>,
    /// sha256 of `data`.
    pub checksum: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    pub action: ArchiveAction,
    /// False when any id was rejected; nothing transitioned in that case.
    pub committed: bool,
    pub transitioned: Vec<String>,
    pub rejected: Vec<Rejection>,
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn reject(id: &str, reason: impl Into<String>) -> Rejection {
    Rejection {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Drop duplicate ids, keeping first-seen order.
fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut seen = FxHashSet::default();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

fn compress(data: Vec<u8>, level: CompressionLevel) -> Result<Vec<u8>, MoltError> {
    match level.zstd_level() {
        None => Ok(data),
        Some(lvl) => zstd::encode_all(&data[..], lvl)
            .map_err(|e| MoltError::CompressionError(format!("zstd encode failed: {}", e))),
    }
}

fn decompress(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, MoltError> {
    match level.zstd_level() {
        None => Ok(data.to_vec()),
        Some(_) => zstd::decode_all(data)
            .map_err(|e| MoltError::CompressionError(format!("zstd decode failed: {}", e))),
    }
}

// ---------------------------------------------------------------------------
// Renderers
// ---------------------------------------------------------------------------

fn render_markdown(doc: &ExportDocument) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Context export\n");
    let _ = writeln!(out, "Exported at {} ({} contexts)\n", doc.exported_at, doc.contexts.len());
    for ctx in &doc.contexts {
        let _ = writeln!(out, "## {}\n", ctx.goal);
        let _ = writeln!(out, "- id: `{}`", ctx.id);
        let _ = writeln!(out, "- status: {}", ctx.status);
        let _ = writeln!(out, "- agent: {}", ctx.agent);
        let _ = writeln!(out, "- archived: {}", ctx.archived);
        let _ = writeln!(out, "- created_at: {}", ctx.created_at);
        let _ = writeln!(out, "- updated_at: {}\n", ctx.updated_at);
        if !ctx.queries.is_empty() {
            let _ = writeln!(out, "### Queries\n");
            for q in &ctx.queries {
                let _ = writeln!(out, "- [{}] {}", q.query_type, q.text);
            }
            out.push('\n');
        }
        if !ctx.actions.is_empty() {
            let _ = writeln!(out, "### Actions\n");
            for a in &ctx.actions {
                match &a.detail {
                    Some(d) => {
                        let _ = writeln!(out, "- {} ({}): {}", a.action_type, a.result, d);
                    }
                    None => {
                        let _ = writeln!(out, "- {} ({})", a.action_type, a.result);
                    }
                }
            }
            out.push('\n');
        }
        if !ctx.approaches.is_empty() {
            let _ = writeln!(out, "### Approaches\n");
            for ap in &ctx.approaches {
                let _ = writeln!(out, "- [{}] {}", ap.result, ap.description);
            }
            out.push('\n');
        }
    }
    out
}

fn render_text(doc: &ExportDocument) -> String {
    let mut out = String::new();
    for ctx in &doc.contexts {
        let archived = if ctx.archived { " archived" } else { "" };
        let _ = writeln!(
            out,
            "{} [{}{}] {}: {}",
            ctx.id,
            ctx.status,
            archived,
            ctx.agent,
            compact_line(&ctx.goal, 120)
        );
        for q in &ctx.queries {
            let _ = writeln!(out, "  query {}: {}", q.query_type, compact_line(&q.text, 100));
        }
        for a in &ctx.actions {
            let detail = a.detail.as_deref().map(|d| compact_line(d, 80)).unwrap_or_default();
            let _ = writeln!(out, "  action {} {} {}", a.action_type, a.result, detail);
        }
        for ap in &ctx.approaches {
            let _ = writeln!(
                out,
                "  approach {}: {}",
                ap.result,
                compact_line(&ap.description, 100)
            );
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

pub fn export_contexts(
    store: &Store,
    ids: &[String],
    format: ExportFormat,
    compression: CompressionLevel,
) -> Result<ExportOutput, MoltError> {
    if ids.is_empty() {
        return Err(MoltError::ValidationError(
            "export requires at least one context id".to_string(),
        ));
    }
    if format != ExportFormat::Json && compression != CompressionLevel::None {
        return Err(MoltError::ValidationError(format!(
            "{} export does not support compression '{}'; use 'none'",
            format, compression
        )));
    }

    let ids = unique_ids(ids);
    let broker = DbBroker::new(&store.root);
    let (found, skipped) = broker.with_conn(&store.db_path(), "molt", None, "archive.export", |conn| {
        let mut found = Vec::new();
        let mut skipped = Vec::new();
        for id in &ids {
            match contexts::load(conn, id)? {
                Some(ctx) => found.push(ctx),
                None => skipped.push(reject(id, "not found")),
            }
        }
        Ok((found, skipped))
    })?;
    if found.is_empty() {
        return Err(MoltError::NotFound(format!(
            "none of the requested contexts exist: {}",
            ids.join(", ")
        )));
    }

    let doc = ExportDocument {
        format_version: EXPORT_FORMAT_VERSION,
        exported_at: time::now_epoch_ms(),
        contexts: found,
    };
    let raw = match format {
        ExportFormat::Json => serde_json::to_vec_pretty(&doc)?,
        ExportFormat::Markdown => render_markdown(&doc).into_bytes(),
        ExportFormat::Text => render_text(&doc).into_bytes(),
    };
    let data = compress(raw, compression)?;

    let exported: Vec<String> = doc.contexts.iter().map(|c| c.id.clone()).collect();
    tracing::info!(
        format = %format,
        compression = %compression,
        exported = exported.len(),
        skipped = skipped.len(),
        bytes = data.len(),
        "contexts exported"
    );
    Ok(ExportOutput {
        format,
        compression,
        exported,
        skipped,
        checksum: hash_bytes(&data),
        data,
    })
}

/// Parse a JSON export produced with the given compression level.
pub fn decode_export(data: &[u8], compression: CompressionLevel) -> Result<ExportDocument, MoltError> {
    let raw = decompress(data, compression)?;
    let doc: ExportDocument = serde_json::from_slice(&raw)?;
    if doc.format_version != EXPORT_FORMAT_VERSION {
        return Err(MoltError::ValidationError(format!(
            "unsupported export format_version {}",
            doc.format_version
        )));
    }
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Archive transitions
// ---------------------------------------------------------------------------

/// Apply `action` to every id, or to none of them.
pub fn execute_archive(
    store: &Store,
    ids: &[String],
    action: ArchiveAction,
) -> Result<ArchiveResult, MoltError> {
    if ids.is_empty() {
        return Err(MoltError::ValidationError(
            "archive requires at least one context id".to_string(),
        ));
    }
    let ids = unique_ids(ids);
    let agents = match action {
        ArchiveAction::Restore => contexts::current_agents(store, &ids)?,
        _ => Vec::new(),
    };
    let _locks = contexts::lock_with_agents(store, &ids, &agents)?;

    let broker = DbBroker::new(&store.root);
    let op = format!("archive.{}", action);
    let result = broker.with_tx(&store.db_path(), "molt", None, &op, |conn| {
        let mut loaded = Vec::new();
        let mut rejected = Vec::new();
        let mut still_live = Vec::new();
        let mut restoring_agents = FxHashSet::default();

        for id in &ids {
            let Some(ctx) = contexts::load(conn, id)? else {
                rejected.push(reject(id, "not found"));
                continue;
            };
            match action {
                ArchiveAction::Archive if ctx.archived => {
                    rejected.push(reject(id, "already archived"));
                }
                ArchiveAction::Restore if !ctx.archived => {
                    rejected.push(reject(id, "not archived"));
                }
                ArchiveAction::Restore if ctx.status == Status::Active && !store.config.multi_active => {
                    let slot = contexts::check_active_slot(conn, store, &ctx.agent, Some(id));
                    if let Err(e) = slot {
                        rejected.push(reject(id, e.to_string()));
                    } else if !restoring_agents.insert(ctx.agent.clone()) {
                        rejected.push(reject(
                            id,
                            format!("another active context for agent '{}' is restored in the same batch", ctx.agent),
                        ));
                    } else {
                        loaded.push(ctx);
                    }
                }
                ArchiveAction::Purge if !ctx.archived => still_live.push(ctx.id),
                ArchiveAction::Purge => {
                    let snaps = snapshot::count_for(conn, id)?;
                    if snaps > 0 {
                        rejected.push(reject(
                            id,
                            format!("{} snapshots remain; prune them before purging", snaps),
                        ));
                    } else {
                        loaded.push(ctx);
                    }
                }
                _ => loaded.push(ctx),
            }
        }

        if !still_live.is_empty() {
            return Err(MoltError::Conflict(format!(
                "purge requires archived contexts; not archived: {}",
                still_live.join(", ")
            )));
        }
        if !rejected.is_empty() {
            return Ok(ArchiveResult {
                action,
                committed: false,
                transitioned: Vec::new(),
                rejected,
            });
        }

        let mut transitioned = Vec::new();
        for mut ctx in loaded {
            match action {
                ArchiveAction::Purge => contexts::delete(conn, &ctx.id)?,
                ArchiveAction::Archive | ArchiveAction::Restore => {
                    let prev = ctx.version;
                    ctx.archived = action == ArchiveAction::Archive;
                    contexts::touch(conn, &mut ctx)?;
                    contexts::save(conn, &ctx, prev)?;
                }
            }
            transitioned.push(ctx.id);
        }
        Ok(ArchiveResult {
            action,
            committed: true,
            transitioned,
            rejected: Vec::new(),
        })
    })?;

    if result.committed {
        tracing::info!(action = %action, count = result.transitioned.len(), "archive batch committed");
    } else {
        tracing::warn!(action = %action, rejected = result.rejected.len(), "archive batch rejected");
    }
    Ok(result)
}

/// Delete all but the newest `keep_latest` snapshots of one context.
pub fn prune_snapshots(store: &Store, context_id: &str, keep_latest: usize) -> Result<usize, MoltError> {
    let _locks = contexts::lock_contexts(store, &[context_id.to_string()])?;
    let broker = DbBroker::new(&store.root);
    let removed = broker.with_tx(&store.db_path(), "molt", None, "snapshot.prune", |conn| {
        contexts::load_required(conn, context_id)?;
        snapshot::delete_older(conn, context_id, keep_latest)
    })?;
    tracing::info!(context = context_id, removed, keep_latest, "snapshots pruned");
    Ok(removed)
}
