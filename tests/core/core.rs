use base64::Engine as _;
use molt::core::broker::DbBroker;
use molt::core::config::{CONFIG_FILE_NAME, StoreConfig};
use molt::core::error::MoltError;
use molt::core::locks::{agent_key, context_key, global_locks};
use molt::core::rpc::{self, Tool, ToolRequest};
use molt::core::store::{Store, StoreKind};
use molt::core::vocab::{ApproachResult, ArchiveAction, CompressionLevel, Status};
use molt::plugins::archive;
use molt::plugins::contexts::{self, Mutation};
use serde_json::{Value, json};
use std::fs;
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn setup() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(StoreKind::Repo, tmp.path()).unwrap();
    (tmp, store)
}

fn call(store: &Store, tool: &str, args: Value) -> Value {
    let resp = rpc::handle(
        store,
        ToolRequest {
            id: "req-1".to_string(),
            tool: tool.to_string(),
            args,
        },
    );
    assert!(resp.success, "{} failed: {:?}", tool, resp.error);
    assert_eq!(resp.id, "req-1");
    resp.result.unwrap()
}

fn call_err(store: &Store, tool: &str, args: Value) -> String {
    let resp = rpc::handle(
        store,
        ToolRequest {
            id: "req-2".to_string(),
            tool: tool.to_string(),
            args,
        },
    );
    assert!(!resp.success);
    assert!(resp.result.is_none());
    resp.error.unwrap().code
}

// ---------------------------------------------------------------------------
// Tool dispatch
// ---------------------------------------------------------------------------

#[test]
fn tool_table_is_complete_and_unique() {
    let mut names: Vec<&str> = rpc::TOOLS.iter().map(|t| t.name).collect();
    assert_eq!(names.len(), 13);
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 13);
    assert!(rpc::find_tool("context.create").is_some());
    assert!(rpc::find_tool("context.drop").is_none());
}

#[test]
fn rpc_covers_a_context_lifecycle() {
    let (_tmp, store) = setup();
    let created = call(&store, "context.create", json!({"goal": "fix bug", "agent": "claude"}));
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "active");

    let updated = call(
        &store,
        "context.update",
        json!({
            "id": id,
            "expected_version": 1,
            "mutations": [
                {"op": "add_action", "action_type": "build", "result": "failure"},
                {"op": "add_action", "action_type": "build", "result": "failure"},
                {"op": "add_action", "action_type": "build", "result": "failure", "detail": "E0308"},
                {"op": "add_approach", "description": "pin toolchain", "result": "partial"}
            ]
        }),
    );
    assert_eq!(updated["context"]["version"], 2);
    assert_eq!(updated["snapshots"], json!([]));

    let got = call(&store, "context.get", json!({"id": id}));
    assert_eq!(got, updated["context"]);

    let sigs = call(&store, "patterns.detect", json!({"id": id}));
    assert_eq!(sigs[0]["key"], "build");
    let warnings = call(&store, "warnings.get", json!({"id": id}));
    assert_eq!(warnings[0]["severity"], "critical");
    assert_eq!(warnings[0]["pattern"]["key"], "build");

    let snap = call(&store, "snapshot.create", json!({"context_id": id}));
    assert_eq!(snap["reason"], "manual");
    let listed = call(&store, "snapshot.list", json!({"context_id": id}));
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let found = call(&store, "search", json!({"text": "bug"}));
    assert_eq!(found["total"], 1);
    assert_eq!(found["results"][0]["matched"], "goal_substring");

    let stats = call(&store, "stats.get", json!({"id": id}));
    assert_eq!(stats["actions"], 3);
    assert_eq!(stats["snapshots"], 1);
    let store_stats = call(&store, "stats.get", Value::Null);
    assert_eq!(store_stats["contexts"], 1);
    assert_eq!(store_stats["by_status"]["active"], 1);

    let sync = call(&store, "index.sync", json!({"mode": "full"}));
    assert_eq!(sync["documents"], 1);
}

#[test]
fn rpc_soft_outcomes_and_error_codes() {
    let (_tmp, store) = setup();
    assert_eq!(call(&store, "snapshot.create", json!({})), Value::Null);
    assert_eq!(call_err(&store, "context.get", json!({"id": "ctx_missing"})), "not_found");
    assert_eq!(
        call_err(&store, "context.create", json!({"goal": "g", "agent": "robot"})),
        "validation"
    );
    assert_eq!(
        call_err(&store, "snapshot.create", json!({"reason": "because"})),
        "validation"
    );
    assert_eq!(call_err(&store, "context.create", json!({"goal": "g"})), "validation");
    assert_eq!(call_err(&store, "teleport", json!({})), "validation");

    call(&store, "context.create", json!({"goal": "one", "agent": "claude"}));
    assert_eq!(
        call_err(&store, "context.create", json!({"goal": "two", "agent": "claude"})),
        "conflict"
    );
    assert_eq!(
        call_err(&store, "recommend", json!({"id": "ctx_missing", "limit": 0})),
        "validation"
    );
}

#[test]
fn rpc_export_embeds_plain_or_base64_data() {
    let (_tmp, store) = setup();
    let created = call(&store, "context.create", json!({"goal": "export me", "agent": "codex"}));
    let id = created["id"].as_str().unwrap().to_string();

    let plain = call(&store, "export", json!({"ids": [id]}));
    let content = plain["content"].as_str().unwrap();
    let doc: Value = serde_json::from_str(content).unwrap();
    assert_eq!(doc["contexts"][0], created);

    let packed = call(&store, "export", json!({"ids": [id], "compression": "high"}));
    assert!(packed.get("content").is_none());
    let data = base64::engine::general_purpose::STANDARD
        .decode(packed["data_base64"].as_str().unwrap())
        .unwrap();
    assert_eq!(packed["bytes"], data.len());
    assert_eq!(packed["checksum"], archive::hash_bytes(&data).as_str());
    let decoded = archive::decode_export(&data, CompressionLevel::High).unwrap();
    assert_eq!(decoded.contexts[0].id, id);

    assert_eq!(
        call_err(&store, "export", json!({"ids": [id], "format": "markdown", "compression": "low"})),
        "validation"
    );
}

#[test]
fn rpc_archive_and_recommend() {
    let (_tmp, store) = setup();
    let target = call(&store, "context.create", json!({"goal": "tune gc", "agent": "claude"}));
    let past = call(&store, "context.create", json!({"goal": "tune gc pauses", "agent": "codex"}));
    let (tid, pid) = (
        target["id"].as_str().unwrap().to_string(),
        past["id"].as_str().unwrap().to_string(),
    );
    call(
        &store,
        "context.update",
        json!({"id": pid, "mutations": [{"op": "add_approach", "description": "bigger heap", "result": "success"}]}),
    );

    let recs = call(&store, "recommend", json!({"id": tid, "limit": 3}));
    assert_eq!(recs[0]["context"]["id"], pid.as_str());
    assert_eq!(recs[0]["success_ratio"], 1.0);

    let purge = call_err(&store, "archive.execute", json!({"ids": [pid], "action": "purge"}));
    assert_eq!(purge, "conflict");
    let archived = call(&store, "archive.execute", json!({"ids": [pid], "action": "archive"}));
    assert_eq!(archived["committed"], true);
    let recs = call(&store, "recommend", json!({"id": tid}));
    assert_eq!(recs, json!([]));
}

#[test]
fn serve_answers_each_line() {
    let (_tmp, store) = setup();
    let input = concat!(
        r#"{"id":"a","tool":"context.create","args":{"goal":"served","agent":"gemini"}}"#,
        "\n\n",
        "not json\n",
        r#"{"id":"c","tool":"search","args":{"text":"served"}}"#,
        "\n"
    );
    let mut out = Vec::new();
    let handled = rpc::serve(&store, Cursor::new(input), &mut out).unwrap();
    assert_eq!(handled, 3);

    let lines: Vec<Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines[0]["id"], "a");
    assert_eq!(lines[0]["success"], true);
    assert_eq!(lines[0]["receipt"]["tool"], "context.create");
    assert_eq!(lines[1]["success"], false);
    assert_eq!(lines[1]["error"]["code"], "validation");
    assert_eq!(lines[2]["result"]["total"], 1);
}

#[test]
fn parsed_tools_dispatch_directly() {
    let (_tmp, store) = setup();
    let tool = Tool::parse("context.create", json!({"goal": "direct", "agent": "human"})).unwrap();
    let value = rpc::dispatch(&store, tool).unwrap();
    assert_eq!(value["agent"], "human");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn held_context_lock_times_out_as_conflict() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        lock_timeout_ms: 50,
        ..StoreConfig::default()
    };
    let store = Store::open_with_config(StoreKind::Repo, tmp.path(), config).unwrap();
    let ctx = contexts::create(&store, "locked", "claude").unwrap();

    let held = global_locks()
        .acquire(&store.db_path(), &[context_key(&ctx.id)], Duration::from_millis(50))
        .unwrap();
    let err = contexts::update(
        &store,
        &ctx.id,
        &[Mutation::SetGoal {
            goal: "blocked".to_string(),
        }],
    )
    .unwrap_err();
    assert!(matches!(err, MoltError::Conflict(_)));

    // Other contexts are unaffected while the lock is held.
    let other = contexts::create(&store, "free", "codex").unwrap();
    assert!(
        contexts::update(
            &store,
            &other.id,
            &[Mutation::SetStatus {
                status: Status::Paused
            }]
        )
        .is_ok()
    );

    drop(held);
    assert!(
        contexts::update(
            &store,
            &ctx.id,
            &[Mutation::SetGoal {
                goal: "unblocked".to_string()
            }]
        )
        .is_ok()
    );
    assert_eq!(contexts::get(&store, &ctx.id).unwrap().version, 2);
}

#[test]
fn slot_claiming_writes_wait_for_the_agent_lock() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        lock_timeout_ms: 50,
        ..StoreConfig::default()
    };
    let store = Store::open_with_config(StoreKind::Repo, tmp.path(), config).unwrap();
    let paused = contexts::create(&store, "paused work", "claude").unwrap();
    contexts::update(
        &store,
        &paused.id,
        &[Mutation::SetStatus {
            status: Status::Paused,
        }],
    )
    .unwrap();
    let cold = contexts::create(&store, "cold work", "codex").unwrap();
    archive::execute_archive(&store, std::slice::from_ref(&cold.id), ArchiveAction::Archive).unwrap();

    let held = global_locks()
        .acquire(
            &store.db_path(),
            &[agent_key("claude"), agent_key("codex")],
            Duration::from_millis(50),
        )
        .unwrap();

    // Edits that cannot claim a slot are not blocked by the agent key.
    contexts::update(
        &store,
        &paused.id,
        &[Mutation::SetGoal {
            goal: "paused work, renamed".to_string(),
        }],
    )
    .unwrap();

    let reactivate = [Mutation::SetStatus {
        status: Status::Active,
    }];
    assert!(matches!(
        contexts::update(&store, &paused.id, &reactivate).unwrap_err(),
        MoltError::Conflict(_)
    ));
    assert!(matches!(
        archive::execute_archive(&store, std::slice::from_ref(&cold.id), ArchiveAction::Restore)
            .unwrap_err(),
        MoltError::Conflict(_)
    ));
    assert!(contexts::get(&store, &cold.id).unwrap().archived);

    drop(held);
    assert_eq!(
        contexts::update(&store, &paused.id, &reactivate).unwrap().status,
        Status::Active
    );
    assert!(
        archive::execute_archive(&store, std::slice::from_ref(&cold.id), ArchiveAction::Restore)
            .unwrap()
            .committed
    );
}

#[test]
fn parallel_writers_on_distinct_contexts_all_land() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        multi_active: true,
        ..StoreConfig::default()
    };
    let store = Arc::new(Store::open_with_config(StoreKind::Repo, tmp.path(), config).unwrap());
    let ids: Vec<String> = (0..4)
        .map(|i| contexts::create(&store, &format!("ctx {}", i), "claude").unwrap().id)
        .collect();

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for n in 0..5 {
                    contexts::update(
                        &store,
                        &id,
                        &[Mutation::AddApproach {
                            description: format!("attempt {}", n),
                            result: ApproachResult::Partial,
                        }],
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    for id in &ids {
        let ctx = contexts::get(&store, id).unwrap();
        assert_eq!(ctx.approaches.len(), 5);
        assert_eq!(ctx.version, 6);
    }
}

#[test]
fn reads_never_see_half_applied_updates() {
    let (_tmp, store) = setup();
    let store = Arc::new(store);
    let ctx = contexts::create(&store, "pairs", "claude").unwrap();

    let writer = {
        let store = Arc::clone(&store);
        let id = ctx.id.clone();
        thread::spawn(move || {
            for n in 0..20 {
                contexts::update(
                    &store,
                    &id,
                    &[
                        Mutation::SetGoal {
                            goal: format!("pairs {}", n),
                        },
                        Mutation::AddApproach {
                            description: format!("{}", n),
                            result: ApproachResult::Success,
                        },
                    ],
                )
                .unwrap();
            }
        })
    };
    for _ in 0..40 {
        let seen = contexts::get(&store, &ctx.id).unwrap();
        match seen.approaches.last() {
            Some(last) => assert_eq!(seen.goal, format!("pairs {}", last.description)),
            None => assert_eq!(seen.goal, "pairs"),
        }
    }
    writer.join().unwrap();
}

// ---------------------------------------------------------------------------
// Configuration and audit
// ---------------------------------------------------------------------------

#[test]
fn config_file_sets_vocabulary_and_limits() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join(CONFIG_FILE_NAME),
        "[vocab]\nagents = [\"agent1\"]\n\n[limits.search]\ndefault = 1\nmax = 2\n",
    )
    .unwrap();
    let store = Store::open(StoreKind::Repo, tmp.path()).unwrap();
    assert!(contexts::create(&store, "g", "claude").is_err());
    contexts::create(&store, "first", "agent1").unwrap();
    assert_eq!(call(&store, "search", json!({}))["total"], 1);
    assert_eq!(
        call_err(&store, "search", json!({"limit": 3, "limit_policy": "reject"})),
        "validation"
    );
}

#[test]
fn invalid_config_refuses_to_open() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join(CONFIG_FILE_NAME), "[vocab]\nagents = []\n").unwrap();
    assert!(matches!(
        Store::open(StoreKind::Repo, tmp.path()).unwrap_err(),
        MoltError::ValidationError(_)
    ));
}

#[test]
fn failed_mutations_are_audited_and_leave_state_unchanged() {
    let (_tmp, store) = setup();
    let ctx = contexts::create(&store, "audited", "claude").unwrap();
    let err = contexts::apply(
        &store,
        &ctx.id,
        Some(7),
        &[Mutation::SetGoal {
            goal: "nope".to_string(),
        }],
    )
    .unwrap_err();
    assert!(matches!(err, MoltError::Conflict(_)));
    assert_eq!(contexts::get(&store, &ctx.id).unwrap(), ctx);

    let events = DbBroker::new(&store.root).audit_events(None).unwrap();
    let failed: Vec<_> = events.iter().filter(|e| e.status == "error").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].op, "context.update");
    assert_eq!(failed[0].db_id, "contexts.db");
}
