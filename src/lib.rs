//! Molt: a context store for AI agents
//!
//! **Molt is a local-first, daemonless store that agents call to persist their
//! work sessions, shed snapshots, and learn from earlier attempts.**
//!
//! # Core Principles
//!
//! - **Local-first**: all state lives in one SQLite file under the store root
//! - **Single source of truth**: the contexts table; search and pattern output
//!   are projections that can be dropped and rebuilt
//! - **Agent-first**: every operation returns structured JSON
//! - **Audited**: every store operation leaves a line in `broker.events.jsonl`
//!
//! # Architecture
//!
//! ## Dual-Store Model
//!
//! - **User Store** (`~/.molt/`): shared by every project on the machine
//! - **Repo Store** (`<repo>/.molt/`): scoped to one checkout
//!
//! `--root` or `MOLT_HOME` override both.
//!
//! ## The Thin Waist
//!
//! All state access routes through `DbBroker`:
//! - mutations run in one `IMMEDIATE` transaction
//! - per-context keyed locks (`core::locks`) serialize writers to the same context
//! - every call is appended to the audit ledger
//!
//! ## Subsystems (Plugins)
//!
//! - `contexts`: the context repository
//! - `snapshot`: immutable snapshots and the auto-snapshot policy
//! - `search`: ranked search over a rebuildable projection
//! - `patterns`: failure signatures and warnings
//! - `recommend`: similar past contexts, weighted by approach success
//! - `archive`: archive/restore/purge and json/markdown/text export
//! - `stats`: per-context and store-wide counts
//!
//! # Examples
//!
//! ```bash
//! molt init
//! molt context create --goal "fix flaky login test" --agent claude
//! molt search "login"
//! molt warn --id ctx_01J...
//! echo '{"tool":"context.get","args":{"id":"ctx_01J..."}}' | molt rpc
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: storage, locking, config, vocabulary and the tool interface
//! - [`plugins`]: subsystem implementations

pub mod core;
pub mod plugins;

use core::{
    config::{CONFIG_FILE_NAME, StoreConfig},
    error::MoltError,
    output::{self, OutputFormat},
    rpc,
    store::{Store, StoreKind},
    time,
    vocab::{
        ActionResult, ActionType, ApproachResult, ArchiveAction, CompressionLevel, ExportFormat,
        LimitPolicy, QueryType, SearchScope, Status, SyncMode,
    },
};
use plugins::{
    archive, contexts,
    contexts::{ContextFilter, Mutation},
    patterns, recommend, search, snapshot, stats,
};

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::fs;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::str::FromStr;

pub const MOLT_HOME_ENV: &str = "MOLT_HOME";
pub const MOLT_LOG_ENV: &str = "MOLT_LOG";

#[derive(Parser, Debug)]
#[clap(
    name = "molt",
    version = env!("CARGO_PKG_VERSION"),
    about = "Context store and intelligence engine for AI agents"
)]
struct Cli {
    /// Store root (overrides MOLT_HOME and the default locations).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    /// Use the user store (~/.molt) instead of <cwd>/.molt.
    #[clap(long, global = true)]
    user: bool,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "json")]
    format: OutputFormat,
    /// Reject oversized limits instead of clamping them.
    #[clap(long, global = true)]
    strict_limits: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store and write a default molt.toml
    Init,

    /// Create, read, update and list contexts
    #[clap(subcommand)]
    Context(ContextCommand),

    /// Take, list and prune snapshots
    #[clap(subcommand)]
    Snapshot(SnapshotCommand),

    /// Ranked search over contexts
    Search {
        /// Query text (empty lists everything in the working set)
        #[clap(default_value = "")]
        text: String,
        /// Widen matching to queries, actions and approaches
        #[clap(long)]
        all: bool,
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        agent: Option<String>,
        #[clap(long)]
        include_archived: bool,
        #[clap(long)]
        limit: Option<usize>,
    },

    /// Warnings for a context
    Warn {
        #[clap(long)]
        id: String,
    },

    /// Failure patterns for a context
    Patterns {
        #[clap(long)]
        id: String,
    },

    /// Context statistics, or store statistics without --id
    Stats {
        #[clap(long)]
        id: Option<String>,
        #[clap(long)]
        top: Option<usize>,
    },

    /// Past contexts worth learning from
    Recommend {
        #[clap(long)]
        id: String,
        #[clap(long, allow_hyphen_values = true)]
        limit: Option<i64>,
    },

    /// Export contexts
    Export {
        /// Comma-separated context ids
        #[clap(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,
        #[clap(long, default_value = "json")]
        export_format: String,
        #[clap(long, default_value = "none")]
        compression: String,
        /// Write the export here instead of embedding it in the output
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Archive, restore or purge contexts (all or nothing)
    Archive {
        #[clap(long)]
        action: String,
        #[clap(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,
    },

    /// Maintain the search projection
    #[clap(subcommand)]
    Index(IndexCommand),

    /// Serve JSON-line tool requests on stdin
    Rpc,

    /// List the tool table
    Tools,
}

#[derive(Subcommand, Debug)]
enum ContextCommand {
    /// Create an active context
    Create {
        #[clap(long)]
        goal: String,
        #[clap(long)]
        agent: String,
    },
    /// Get a context by id
    Get {
        #[clap(long)]
        id: String,
    },
    /// Apply one or more mutations atomically
    Update {
        #[clap(long)]
        id: String,
        #[clap(long)]
        goal: Option<String>,
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        agent: Option<String>,
        /// Record a query
        #[clap(long)]
        query: Option<String>,
        #[clap(long, default_value = "search")]
        query_type: String,
        /// Record an action of this type
        #[clap(long)]
        action: Option<String>,
        #[clap(long, default_value = "success")]
        result: String,
        #[clap(long)]
        detail: Option<String>,
        /// Record an approach
        #[clap(long)]
        approach: Option<String>,
        #[clap(long, default_value = "success")]
        approach_result: String,
        /// Fail with a conflict unless the context is still at this version
        #[clap(long)]
        expected_version: Option<u64>,
    },
    /// List contexts, most recently touched first
    List {
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        agent: Option<String>,
        #[clap(long)]
        include_archived: bool,
        #[clap(long)]
        archived_only: bool,
        #[clap(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Snapshot a context (or the most recently touched active one)
    Create {
        #[clap(long)]
        id: Option<String>,
        #[clap(long, default_value = "manual")]
        reason: String,
    },
    /// List snapshots newest first
    List {
        #[clap(long)]
        id: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Keep only the newest snapshots of a context
    Prune {
        #[clap(long)]
        id: String,
        #[clap(long, default_value_t = 0)]
        keep: usize,
    },
}

#[derive(Subcommand, Debug)]
enum IndexCommand {
    /// Drop and regenerate the projection
    Rebuild,
    /// Re-project stale contexts
    Sync {
        #[clap(long, default_value = "incremental")]
        mode: String,
    },
}

fn parse_opt<T: FromStr<Err = MoltError>>(value: Option<&str>) -> Result<Option<T>, MoltError> {
    value.map(str::parse).transpose()
}

/// Store root: `--root`, then `MOLT_HOME`, then `~/.molt` or `<cwd>/.molt`.
pub fn resolve_store_root(explicit: Option<PathBuf>, user: bool) -> Result<(StoreKind, PathBuf), MoltError> {
    let kind = if user { StoreKind::User } else { StoreKind::Repo };
    if let Some(root) = explicit {
        return Ok((kind, root));
    }
    if let Ok(home) = std::env::var(MOLT_HOME_ENV)
        && !home.trim().is_empty()
    {
        return Ok((kind, PathBuf::from(home)));
    }
    if user {
        let home = std::env::var("HOME").map_err(|_| {
            MoltError::ValidationError("HOME is not set; pass --root".to_string())
        })?;
        return Ok((kind, PathBuf::from(home).join(".molt")));
    }
    Ok((kind, std::env::current_dir()?.join(".molt")))
}

/// stderr subscriber filtered by `MOLT_LOG` (default `warn`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(MOLT_LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact();
    let _ = subscriber.try_init();
}

fn mutations_from_flags(cmd: &ContextCommand) -> Result<Vec<Mutation>, MoltError> {
    let ContextCommand::Update {
        goal,
        status,
        agent,
        query,
        query_type,
        action,
        result,
        detail,
        approach,
        approach_result,
        ..
    } = cmd
    else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    if let Some(goal) = goal {
        out.push(Mutation::SetGoal { goal: goal.clone() });
    }
    if let Some(status) = parse_opt::<Status>(status.as_deref())? {
        out.push(Mutation::SetStatus { status });
    }
    if let Some(agent) = agent {
        out.push(Mutation::SetAgent { agent: agent.clone() });
    }
    if let Some(text) = query {
        out.push(Mutation::AddQuery {
            query_type: QueryType::from_str(query_type)?,
            text: text.clone(),
        });
    }
    if let Some(action_type) = parse_opt::<ActionType>(action.as_deref())? {
        out.push(Mutation::AddAction {
            action_type,
            result: ActionResult::from_str(result)?,
            detail: detail.clone(),
        });
    }
    if let Some(description) = approach {
        out.push(Mutation::AddApproach {
            description: description.clone(),
            result: ApproachResult::from_str(approach_result)?,
        });
    }
    Ok(out)
}

fn emit(format: OutputFormat, cmd: &str, value: Value, text: impl FnOnce() -> String) -> Result<(), MoltError> {
    match format {
        OutputFormat::Json => {
            let envelope = time::command_envelope(cmd, "ok", json!({ "result": value }));
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => println!("{}", text()),
    }
    Ok(())
}

fn run_context_cli(store: &Store, cli: &Cli, cmd: &ContextCommand) -> Result<(), MoltError> {
    let policy = limit_policy(cli);
    match cmd {
        ContextCommand::Create { goal, agent } => {
            let ctx = contexts::create(store, goal, agent)?;
            let line = output::context_line(&ctx);
            emit(cli.format, "context.create", serde_json::to_value(&ctx)?, || line)
        }
        ContextCommand::Get { id } => {
            let ctx = contexts::get(store, id)?;
            let line = output::context_line(&ctx);
            emit(cli.format, "context.get", serde_json::to_value(&ctx)?, || line)
        }
        ContextCommand::Update {
            id, expected_version, ..
        } => {
            let mutations = mutations_from_flags(cmd)?;
            let observed = snapshot::update_observed(store, id, *expected_version, &mutations)?;
            let line = output::context_line(&observed.context);
            emit(cli.format, "context.update", serde_json::to_value(&observed)?, || line)
        }
        ContextCommand::List {
            status,
            agent,
            include_archived,
            archived_only,
            limit,
        } => {
            let filter = ContextFilter {
                status: parse_opt(status.as_deref())?,
                agent: agent.clone(),
                include_archived: *include_archived,
                archived_only: *archived_only,
                limit: *limit,
                limit_policy: policy,
            };
            let found = contexts::list(store, &filter)?;
            let text = output::render_contexts(&found);
            emit(cli.format, "context.list", serde_json::to_value(&found)?, || text)
        }
    }
}

fn run_snapshot_cli(store: &Store, cli: &Cli, cmd: &SnapshotCommand) -> Result<(), MoltError> {
    match cmd {
        SnapshotCommand::Create { id, reason } => {
            let snap = snapshot::snapshot(store, id.as_deref(), reason)?;
            let text = match &snap {
                Some(s) => format!("{} {} ({})", s.id, s.context_id, s.reason),
                None => "no active context to snapshot".to_string(),
            };
            emit(cli.format, "snapshot.create", serde_json::to_value(&snap)?, || text)
        }
        SnapshotCommand::List { id, limit } => {
            let snaps = contexts::list_snapshots(store, id.as_deref(), *limit, limit_policy(cli))?;
            let text = snaps
                .iter()
                .map(|s| format!("{} {} {} {}", s.id, s.context_id, s.reason, s.timestamp))
                .collect::<Vec<_>>()
                .join("\n");
            emit(cli.format, "snapshot.list", serde_json::to_value(&snaps)?, || text)
        }
        SnapshotCommand::Prune { id, keep } => {
            let removed = archive::prune_snapshots(store, id, *keep)?;
            emit(
                cli.format,
                "snapshot.prune",
                json!({ "context_id": id, "removed": removed, "kept": keep }),
                || format!("removed {} snapshot(s)", removed),
            )
        }
    }
}

fn limit_policy(cli: &Cli) -> LimitPolicy {
    if cli.strict_limits {
        LimitPolicy::Reject
    } else {
        LimitPolicy::Clamp
    }
}

fn run_export(
    store: &Store,
    cli: &Cli,
    ids: &[String],
    format: &str,
    compression: &str,
    out: Option<&PathBuf>,
) -> Result<(), MoltError> {
    let format = ExportFormat::from_str(format)?;
    let compression = CompressionLevel::from_str(compression)?;
    let export = archive::export_contexts(store, ids, format, compression)?;
    let mut value = serde_json::to_value(&export)?;
    match out {
        Some(path) => {
            fs::write(path, &export.data)?;
            value["path"] = json!(path.to_string_lossy());
        }
        None if compression == CompressionLevel::None => {
            value["content"] = json!(String::from_utf8_lossy(&export.data));
        }
        None => {
            return Err(MoltError::ValidationError(
                "compressed exports need --out".to_string(),
            ));
        }
    }
    let text = match out {
        Some(path) => format!("wrote {} bytes to {}", export.data.len(), path.display()),
        None => String::from_utf8_lossy(&export.data).into_owned(),
    };
    emit(cli.format, "export", value, || text)
}

pub fn run() -> Result<(), MoltError> {
    init_tracing();
    let cli = Cli::parse();
    let (kind, root) = resolve_store_root(cli.root.clone(), cli.user)?;

    if let Command::Init = cli.command {
        let store = Store::open(kind, &root)?;
        let config_path = store.root.join(CONFIG_FILE_NAME);
        let created = !config_path.exists();
        if created {
            let rendered = toml::to_string_pretty(&StoreConfig::default())
                .map_err(|e| MoltError::ValidationError(format!("cannot render config: {}", e)))?;
            fs::write(&config_path, rendered)?;
        }
        return emit(
            cli.format,
            "init",
            json!({ "root": store.root.to_string_lossy(), "config_created": created }),
            || format!("store ready at {}", store.root.display()),
        );
    }
    if let Command::Tools = cli.command {
        return emit(cli.format, "tools", serde_json::to_value(rpc::TOOLS)?, || {
            rpc::TOOLS
                .iter()
                .map(|t| format!("{:<16} {:?}  {}", t.name, t.capability, t.description))
                .collect::<Vec<_>>()
                .join("\n")
        });
    }

    let store = Store::open(kind, &root)?;
    let policy = limit_policy(&cli);

    match &cli.command {
        Command::Init | Command::Tools => Ok(()),
        Command::Context(cmd) => run_context_cli(&store, &cli, cmd),
        Command::Snapshot(cmd) => run_snapshot_cli(&store, &cli, cmd),
        Command::Search {
            text,
            all,
            status,
            agent,
            include_archived,
            limit,
        } => {
            let query = search::SearchQuery {
                text: Some(text.clone()),
                scope: if *all { SearchScope::All } else { SearchScope::Top },
                filters: search::SearchFilters {
                    status: parse_opt(status.as_deref())?,
                    agent: agent.clone(),
                    include_archived: *include_archived,
                },
                limit: *limit,
                limit_policy: policy,
            };
            let hits = search::search(&store, &query)?.collect::<Result<Vec<_>, _>>()?;
            let text = output::render_hits(&hits);
            emit(cli.format, "search", serde_json::to_value(&hits)?, || text)
        }
        Command::Warn { id } => {
            let warnings = patterns::get_enhanced_warnings(&store, id)?;
            let text = output::render_warnings(&warnings);
            emit(cli.format, "warnings.get", serde_json::to_value(&warnings)?, || text)
        }
        Command::Patterns { id } => {
            let sigs = patterns::detect_failure_patterns(&store, id)?;
            let text = sigs
                .iter()
                .map(|s| format!("{:?} {} x{} (max run {})", s.kind, s.key, s.occurrences, s.max_consecutive))
                .collect::<Vec<_>>()
                .join("\n");
            emit(cli.format, "patterns.detect", serde_json::to_value(&sigs)?, || text)
        }
        Command::Stats { id, top } => {
            let value = match id {
                Some(id) => serde_json::to_value(stats::context_stats_top(&store, id, *top, policy)?)?,
                None => serde_json::to_value(stats::store_stats(&store)?)?,
            };
            let text = serde_json::to_string_pretty(&value)?;
            emit(cli.format, "stats.get", value, || text)
        }
        Command::Recommend { id, limit } => {
            let recs = recommend::recommend_with(&store, id, *limit, policy)?;
            let text = output::render_recommendations(&recs);
            emit(cli.format, "recommend", serde_json::to_value(&recs)?, || text)
        }
        Command::Export {
            ids,
            export_format,
            compression,
            out,
        } => run_export(&store, &cli, ids, export_format, compression, out.as_ref()),
        Command::Archive { action, ids } => {
            let action = ArchiveAction::from_str(action)?;
            let result = archive::execute_archive(&store, ids, action)?;
            let text = output::render_archive(&result);
            emit(cli.format, "archive.execute", serde_json::to_value(&result)?, || text)
        }
        Command::Index(IndexCommand::Rebuild) => {
            let report = search::rebuild_index(&store)?;
            let text = format!("reprojected {} context(s)", report.reprojected);
            emit(cli.format, "index.rebuild", serde_json::to_value(&report)?, || text)
        }
        Command::Index(IndexCommand::Sync { mode }) => {
            let report = search::sync_index(&store, SyncMode::from_str(mode)?)?;
            let text = format!(
                "reprojected {}, removed {}, {} documents",
                report.reprojected, report.removed, report.documents
            );
            emit(cli.format, "index.sync", serde_json::to_value(&report)?, || text)
        }
        Command::Rpc => {
            let stdin = io::stdin();
            let handled = rpc::serve(&store, BufReader::new(stdin.lock()), io::stdout().lock())?;
            tracing::info!(handled, "rpc input closed");
            Ok(())
        }
    }
}
