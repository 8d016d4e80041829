//! Molt tool interface.
//!
//! Agents talk to Molt with JSON lines over stdin/stdout. Each request names a
//! tool from the static `TOOLS` table and carries an argument bag; the bag is
//! decoded into a typed `Tool` variant and dispatched to the owning subsystem.
//! Results are always structured JSON, never pre-rendered text.
//!
//! # Response Envelope
//!
//! - `success`: whether the tool ran to completion
//! - `receipt`: tool name, time, and hashes of inputs and outputs
//! - `result` or `error { code, message }`

use crate::core::error::MoltError;
use crate::core::store::Store;
use crate::core::vocab::{
    ArchiveAction, CompressionLevel, ExportFormat, LimitPolicy, SyncMode,
};
use crate::plugins::contexts::{self, Mutation};
use crate::plugins::{archive, patterns, recommend, search, snapshot, stats};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Digest;
use std::io::{BufRead, Write};

/// Standard tool request envelope
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolRequest {
    /// Request ID for correlation
    #[serde(default = "default_request_id")]
    pub id: String,
    /// Tool name, e.g. `context.create`
    pub tool: String,
    /// Tool arguments
    #[serde(default)]
    pub args: Value,
}

pub fn default_request_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Standard tool response envelope
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolResponse {
    pub id: String,
    pub success: bool,
    pub receipt: Receipt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

/// Receipt documenting what happened
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Receipt {
    pub tool: String,
    pub timestamp: String,
    /// Content hash of the argument bag
    pub inputs_hash: String,
    /// Content hash of the result
    pub outputs_hash: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolError {
    /// One of `not_found`, `validation`, `conflict`, `storage`
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub capability: Capability,
    pub description: &'static str,
}

/// Every tool Molt answers to. Dispatch is a match on `Tool`, built from this table.
pub const TOOLS: &[ToolSpec] = &[
    ToolSpec { name: "context.create", capability: Capability::Write, description: "Create an active context for an agent" },
    ToolSpec { name: "context.get", capability: Capability::Read, description: "Fetch a context by id" },
    ToolSpec { name: "context.update", capability: Capability::Write, description: "Apply mutations atomically; policy snapshots are taken on completion and handoff" },
    ToolSpec { name: "snapshot.create", capability: Capability::Write, description: "Snapshot the active context (null when nothing is active)" },
    ToolSpec { name: "snapshot.list", capability: Capability::Read, description: "List snapshots newest first" },
    ToolSpec { name: "search", capability: Capability::Read, description: "Ranked search over goal, status, agent and history" },
    ToolSpec { name: "patterns.detect", capability: Capability::Read, description: "Detect repeated failure patterns in a context" },
    ToolSpec { name: "warnings.get", capability: Capability::Read, description: "Threshold and pattern warnings for a context" },
    ToolSpec { name: "stats.get", capability: Capability::Read, description: "Context statistics, or store statistics without an id" },
    ToolSpec { name: "export", capability: Capability::Read, description: "Export contexts as json, markdown or text" },
    ToolSpec { name: "recommend", capability: Capability::Read, description: "Recommend past contexts with successful approaches" },
    ToolSpec { name: "archive.execute", capability: Capability::Write, description: "Archive, restore or purge a set of contexts atomically" },
    ToolSpec { name: "index.sync", capability: Capability::Write, description: "Re-sync the search projection" },
];

pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|t| t.name == name)
}

// ---------------------------------------------------------------------------
// Typed arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateArgs {
    pub goal: String,
    pub agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdArgs {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateArgs {
    pub id: String,
    pub mutations: Vec<Mutation>,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

fn manual_reason() -> String {
    "manual".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotArgs {
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default = "manual_reason")]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnapshotListArgs {
    pub context_id: Option<String>,
    pub limit: Option<usize>,
    pub limit_policy: LimitPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatsArgs {
    pub id: Option<String>,
    pub top: Option<usize>,
    pub limit_policy: LimitPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportArgs {
    pub ids: Vec<String>,
    #[serde(default = "default_format")]
    pub format: ExportFormat,
    #[serde(default = "default_compression")]
    pub compression: CompressionLevel,
}

fn default_format() -> ExportFormat {
    ExportFormat::Json
}

fn default_compression() -> CompressionLevel {
    CompressionLevel::None
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendArgs {
    pub id: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub limit_policy: LimitPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveArgs {
    pub ids: Vec<String>,
    pub action: ArchiveAction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncArgs {
    #[serde(default = "default_sync_mode")]
    pub mode: SyncMode,
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Incremental
}

/// A decoded tool call.
#[derive(Debug, Clone)]
pub enum Tool {
    ContextCreate(CreateArgs),
    ContextGet(IdArgs),
    ContextUpdate(UpdateArgs),
    SnapshotCreate(SnapshotArgs),
    SnapshotList(SnapshotListArgs),
    Search(search::SearchQuery),
    PatternsDetect(IdArgs),
    WarningsGet(IdArgs),
    StatsGet(StatsArgs),
    Export(ExportArgs),
    Recommend(RecommendArgs),
    ArchiveExecute(ArchiveArgs),
    IndexSync(SyncArgs),
}

fn args<T: DeserializeOwned>(tool: &str, bag: Value) -> Result<T, MoltError> {
    // Absent args decode like an empty object so all-default structs work.
    let bag = if bag.is_null() { json!({}) } else { bag };
    serde_json::from_value(bag)
        .map_err(|e| MoltError::ValidationError(format!("invalid arguments for '{}': {}", tool, e)))
}

impl Tool {
    pub fn parse(name: &str, bag: Value) -> Result<Self, MoltError> {
        let tool = match name {
            "context.create" => Tool::ContextCreate(args(name, bag)?),
            "context.get" => Tool::ContextGet(args(name, bag)?),
            "context.update" => Tool::ContextUpdate(args(name, bag)?),
            "snapshot.create" => Tool::SnapshotCreate(args(name, bag)?),
            "snapshot.list" => Tool::SnapshotList(args(name, bag)?),
            "search" => Tool::Search(args(name, bag)?),
            "patterns.detect" => Tool::PatternsDetect(args(name, bag)?),
            "warnings.get" => Tool::WarningsGet(args(name, bag)?),
            "stats.get" => Tool::StatsGet(args(name, bag)?),
            "export" => Tool::Export(args(name, bag)?),
            "recommend" => Tool::Recommend(args(name, bag)?),
            "archive.execute" => Tool::ArchiveExecute(args(name, bag)?),
            "index.sync" => Tool::IndexSync(args(name, bag)?),
            other => {
                let known: Vec<&str> = TOOLS.iter().map(|t| t.name).collect();
                return Err(MoltError::ValidationError(format!(
                    "unknown tool '{}'; known tools: {}",
                    other,
                    known.join(", ")
                )));
            }
        };
        Ok(tool)
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn export_value(out: archive::ExportOutput) -> Result<Value, MoltError> {
    let mut value = serde_json::to_value(&out)?;
    value["bytes"] = json!(out.data.len());
    if out.compression == CompressionLevel::None {
        value["content"] = json!(String::from_utf8_lossy(&out.data));
    } else {
        value["data_base64"] = json!(BASE64.encode(&out.data));
    }
    Ok(value)
}

pub fn dispatch(store: &Store, tool: Tool) -> Result<Value, MoltError> {
    let value = match tool {
        Tool::ContextCreate(a) => serde_json::to_value(contexts::create(store, &a.goal, &a.agent)?)?,
        Tool::ContextGet(a) => serde_json::to_value(contexts::get(store, &a.id)?)?,
        Tool::ContextUpdate(a) => serde_json::to_value(snapshot::update_observed(
            store,
            &a.id,
            a.expected_version,
            &a.mutations,
        )?)?,
        Tool::SnapshotCreate(a) => {
            serde_json::to_value(snapshot::snapshot(store, a.context_id.as_deref(), &a.reason)?)?
        }
        Tool::SnapshotList(a) => serde_json::to_value(contexts::list_snapshots(
            store,
            a.context_id.as_deref(),
            a.limit,
            a.limit_policy,
        )?)?,
        Tool::Search(q) => {
            let results = search::search(store, &q)?;
            let total = results.total();
            let hits = results.collect::<Result<Vec<_>, _>>()?;
            json!({ "total": total, "results": hits })
        }
        Tool::PatternsDetect(a) => serde_json::to_value(patterns::detect_failure_patterns(store, &a.id)?)?,
        Tool::WarningsGet(a) => serde_json::to_value(patterns::get_enhanced_warnings(store, &a.id)?)?,
        Tool::StatsGet(a) => match a.id {
            Some(id) => serde_json::to_value(stats::context_stats_top(store, &id, a.top, a.limit_policy)?)?,
            None => serde_json::to_value(stats::store_stats(store)?)?,
        },
        Tool::Export(a) => export_value(archive::export_contexts(store, &a.ids, a.format, a.compression)?)?,
        Tool::Recommend(a) => {
            serde_json::to_value(recommend::recommend_with(store, &a.id, a.limit, a.limit_policy)?)?
        }
        Tool::ArchiveExecute(a) => serde_json::to_value(archive::execute_archive(store, &a.ids, a.action)?)?,
        Tool::IndexSync(a) => serde_json::to_value(search::sync_index(store, a.mode)?)?,
    };
    Ok(value)
}

fn hash_json(value: &Value) -> String {
    format!(
        "{:x}",
        sha2::Sha256::digest(serde_json::to_string(value).unwrap_or_default())
    )
}

pub fn success_response(request_id: String, tool: String, args: &Value, result: Value) -> ToolResponse {
    ToolResponse {
        id: request_id,
        success: true,
        receipt: Receipt {
            tool,
            timestamp: crate::core::time::now_epoch_z(),
            inputs_hash: hash_json(args),
            outputs_hash: hash_json(&result),
        },
        result: Some(result),
        error: None,
    }
}

pub fn error_response(request_id: String, tool: String, args: &Value, err: &MoltError) -> ToolResponse {
    ToolResponse {
        id: request_id,
        success: false,
        receipt: Receipt {
            tool,
            timestamp: crate::core::time::now_epoch_z(),
            inputs_hash: hash_json(args),
            outputs_hash: hash_json(&Value::Null),
        },
        result: None,
        error: Some(ToolError {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    }
}

/// Decode, dispatch and wrap one request. Failures become error responses.
pub fn handle(store: &Store, request: ToolRequest) -> ToolResponse {
    let ToolRequest { id, tool, args } = request;
    let outcome = Tool::parse(&tool, args.clone()).and_then(|call| dispatch(store, call));
    match outcome {
        Ok(result) => success_response(id, tool, &args, result),
        Err(e) => {
            tracing::debug!(tool = %tool, code = e.code(), error = %e, "tool call failed");
            error_response(id, tool, &args, &e)
        }
    }
}

/// Serve JSON-line requests until `reader` is exhausted. Returns the number handled.
pub fn serve<R: BufRead, W: Write>(store: &Store, reader: R, mut writer: W) -> Result<usize, MoltError> {
    let mut handled = 0;
    for line in reader.lines() {
        let line = line.map_err(MoltError::IoError)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolRequest>(trimmed) {
            Ok(req) => handle(store, req),
            Err(e) => error_response(
                default_request_id(),
                String::new(),
                &Value::Null,
                &MoltError::ValidationError(format!("malformed request: {}", e)),
            ),
        };
        writeln!(writer, "{}", serde_json::to_string(&response)?).map_err(MoltError::IoError)?;
        writer.flush().map_err(MoltError::IoError)?;
        handled += 1;
    }
    Ok(handled)
}
