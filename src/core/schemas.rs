//! Centralized database schema definitions.
//!
//! Molt keeps one SQLite database per store:
//! - `contexts` and `snapshots` are the source of truth.
//! - `search_docs` and `search_terms` are a derived projection that can be
//!   dropped and regenerated from `contexts` at any time.
//! - `meta` and `counters` hold bookkeeping (index version, revision clock).

pub const CONTEXT_DB_NAME: &str = "contexts.db";
pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";

/// Bump when the projection layout or tokenizer changes; forces a rebuild on open.
pub const SEARCH_INDEX_VERSION: &str = "1";

pub const CONTEXT_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const CONTEXT_DB_SCHEMA_COUNTERS: &str = "
    CREATE TABLE IF NOT EXISTS counters (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )
";

pub const CONTEXT_DB_SCHEMA_CONTEXTS: &str = "
    CREATE TABLE IF NOT EXISTS contexts (
        id TEXT PRIMARY KEY,
        goal TEXT NOT NULL,
        status TEXT NOT NULL,
        agent TEXT NOT NULL,
        archived INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        history TEXT NOT NULL -- JSON {queries, actions, approaches}
    )
";
pub const CONTEXT_DB_INDEX_AGENT_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_contexts_agent_status ON contexts(agent, status, archived)";
pub const CONTEXT_DB_INDEX_UPDATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_contexts_updated ON contexts(updated_at DESC, revision DESC)";

pub const CONTEXT_DB_SCHEMA_SNAPSHOTS: &str = "
    CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        context_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        ts INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        payload TEXT NOT NULL,
        payload_hash TEXT NOT NULL,
        FOREIGN KEY(context_id) REFERENCES contexts(id)
    )
";
pub const CONTEXT_DB_INDEX_SNAPSHOTS_CONTEXT: &str =
    "CREATE INDEX IF NOT EXISTS idx_snapshots_context ON snapshots(context_id, seq DESC)";

pub const SEARCH_SCHEMA_DOCS: &str = "
    CREATE TABLE IF NOT EXISTS search_docs (
        context_id TEXT PRIMARY KEY,
        goal_lc TEXT NOT NULL,
        status TEXT NOT NULL,
        agent TEXT NOT NULL,
        archived INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        revision INTEGER NOT NULL
    )
";
pub const SEARCH_SCHEMA_TERMS: &str = "
    CREATE TABLE IF NOT EXISTS search_terms (
        term TEXT NOT NULL,
        field TEXT NOT NULL, -- goal | status | agent | query | action | approach
        context_id TEXT NOT NULL,
        PRIMARY KEY(term, field, context_id)
    )
";
pub const SEARCH_INDEX_TERMS_CONTEXT: &str =
    "CREATE INDEX IF NOT EXISTS idx_search_terms_context ON search_terms(context_id)";

pub const CONTEXT_DB_SCHEMAS: &[&str] = &[
    CONTEXT_DB_SCHEMA_META,
    CONTEXT_DB_SCHEMA_COUNTERS,
    CONTEXT_DB_SCHEMA_CONTEXTS,
    CONTEXT_DB_INDEX_AGENT_STATUS,
    CONTEXT_DB_INDEX_UPDATED,
    CONTEXT_DB_SCHEMA_SNAPSHOTS,
    CONTEXT_DB_INDEX_SNAPSHOTS_CONTEXT,
    SEARCH_SCHEMA_DOCS,
    SEARCH_SCHEMA_TERMS,
    SEARCH_INDEX_TERMS_CONTEXT,
];
