use molt::core::error::MoltError;
use molt::core::store::{Store, StoreKind};
use molt::core::vocab::{
    ActionResult, ActionType, ArchiveAction, CompressionLevel, ExportFormat, LimitPolicy,
    QueryType, Status,
};
use molt::plugins::archive::{self, hash_bytes};
use molt::plugins::contexts::{self, Mutation};
use molt::plugins::search::{self, SearchQuery};
use molt::plugins::snapshot;
use tempfile::TempDir;

fn setup() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(StoreKind::Repo, tmp.path()).unwrap();
    (tmp, store)
}

fn populated(store: &Store, goal: &str, agent: &str) -> String {
    let ctx = contexts::create(store, goal, agent).unwrap();
    contexts::update(
        store,
        &ctx.id,
        &[
            Mutation::AddQuery {
                query_type: QueryType::Search,
                text: "where are retries configured".to_string(),
            },
            Mutation::AddAction {
                action_type: ActionType::Edit,
                result: ActionResult::Success,
                detail: Some("raised retry budget".to_string()),
            },
        ],
    )
    .unwrap();
    ctx.id
}

fn one(id: &str) -> Vec<String> {
    vec![id.to_string()]
}

#[test]
fn json_export_round_trips_to_get() {
    let (_tmp, store) = setup();
    let id = populated(&store, "harden retries", "claude");
    let out = archive::export_contexts(&store, &one(&id), ExportFormat::Json, CompressionLevel::None).unwrap();
    assert_eq!(out.exported, one(&id));
    assert!(out.skipped.is_empty());
    assert_eq!(out.checksum, hash_bytes(&out.data));

    let doc = archive::decode_export(&out.data, CompressionLevel::None).unwrap();
    assert_eq!(doc.contexts, vec![contexts::get(&store, &id).unwrap()]);

    // Plain JSON parses without any Molt types, too.
    let raw: serde_json::Value = serde_json::from_slice(&out.data).unwrap();
    assert_eq!(raw["contexts"][0]["id"], id.as_str());
}

#[test]
fn compressed_exports_decode() {
    let (_tmp, store) = setup();
    let id = populated(&store, "harden retries", "claude");
    let plain = archive::export_contexts(&store, &one(&id), ExportFormat::Json, CompressionLevel::None).unwrap();
    for level in [CompressionLevel::Low, CompressionLevel::High] {
        let out = archive::export_contexts(&store, &one(&id), ExportFormat::Json, level).unwrap();
        assert_ne!(out.data, plain.data);
        let doc = archive::decode_export(&out.data, level).unwrap();
        assert_eq!(doc.contexts[0], contexts::get(&store, &id).unwrap());
    }
}

#[test]
fn markdown_and_text_exports() {
    let (_tmp, store) = setup();
    let id = populated(&store, "harden retries", "claude");

    let md = archive::export_contexts(&store, &one(&id), ExportFormat::Markdown, CompressionLevel::None).unwrap();
    let md = String::from_utf8(md.data).unwrap();
    assert!(md.contains("## harden retries"));
    assert!(md.contains("### Actions"));
    assert!(md.contains("raised retry budget"));

    let txt = archive::export_contexts(&store, &one(&id), ExportFormat::Text, CompressionLevel::None).unwrap();
    let txt = String::from_utf8(txt.data).unwrap();
    assert!(txt.starts_with(&id));
    assert!(txt.contains("query search: where are retries configured"));

    for format in [ExportFormat::Markdown, ExportFormat::Text] {
        let err = archive::export_contexts(&store, &one(&id), format, CompressionLevel::High).unwrap_err();
        assert!(matches!(err, MoltError::ValidationError(_)));
    }
}

#[test]
fn export_reports_unknown_ids() {
    let (_tmp, store) = setup();
    let id = populated(&store, "goal", "claude");
    let ids = vec![id.clone(), "ctx_missing".to_string()];
    let out = archive::export_contexts(&store, &ids, ExportFormat::Json, CompressionLevel::None).unwrap();
    assert_eq!(out.exported, one(&id));
    assert_eq!(out.skipped.len(), 1);
    assert_eq!(out.skipped[0].id, "ctx_missing");

    let err = archive::export_contexts(&store, &one("ctx_missing"), ExportFormat::Json, CompressionLevel::None)
        .unwrap_err();
    assert!(matches!(err, MoltError::NotFound(_)));
    let err = archive::export_contexts(&store, &[], ExportFormat::Json, CompressionLevel::None).unwrap_err();
    assert!(matches!(err, MoltError::ValidationError(_)));
}

#[test]
fn archive_hides_from_search_and_restore_brings_back() {
    let (_tmp, store) = setup();
    let id = populated(&store, "cold storage candidate", "claude");

    let res = archive::execute_archive(&store, &one(&id), ArchiveAction::Archive).unwrap();
    assert!(res.committed);
    assert_eq!(res.transitioned, one(&id));
    assert!(search::search(&store, &SearchQuery::text("cold")).unwrap().is_empty());
    assert!(contexts::get(&store, &id).unwrap().archived);

    let res = archive::execute_archive(&store, &one(&id), ArchiveAction::Restore).unwrap();
    assert!(res.committed);
    assert_eq!(search::search(&store, &SearchQuery::text("cold")).unwrap().total(), 1);
}

#[test]
fn restore_rechecks_active_slot() {
    let (_tmp, store) = setup();
    let old = contexts::create(&store, "old", "claude").unwrap();
    archive::execute_archive(&store, &one(&old.id), ArchiveAction::Archive).unwrap();
    let _new = contexts::create(&store, "new", "claude").unwrap();

    let res = archive::execute_archive(&store, &one(&old.id), ArchiveAction::Restore).unwrap();
    assert!(!res.committed);
    assert_eq!(res.rejected.len(), 1);
    assert!(contexts::get(&store, &old.id).unwrap().archived);
}

#[test]
fn batch_is_all_or_nothing() {
    let (_tmp, store) = setup();
    let a = contexts::create(&store, "a", "claude").unwrap();
    let b = contexts::create(&store, "b", "codex").unwrap();
    archive::execute_archive(&store, &one(&b.id), ArchiveAction::Archive).unwrap();

    let ids = vec![a.id.clone(), b.id.clone(), "ctx_missing".to_string()];
    let res = archive::execute_archive(&store, &ids, ArchiveAction::Archive).unwrap();
    assert!(!res.committed);
    assert!(res.transitioned.is_empty());
    let rejected: Vec<&str> = res.rejected.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(rejected, vec![b.id.as_str(), "ctx_missing"]);
    assert!(!contexts::get(&store, &a.id).unwrap().archived);
}

#[test]
fn purge_with_any_live_id_transitions_nothing() {
    let (_tmp, store) = setup();
    let live = contexts::create(&store, "live", "claude").unwrap();
    let cold = contexts::create(&store, "cold", "codex").unwrap();
    archive::execute_archive(&store, &one(&cold.id), ArchiveAction::Archive).unwrap();

    let ids = vec![cold.id.clone(), live.id.clone()];
    let err = archive::execute_archive(&store, &ids, ArchiveAction::Purge).unwrap_err();
    match err {
        MoltError::Conflict(msg) => assert!(msg.contains(&live.id)),
        other => panic!("expected conflict, got {:?}", other),
    }
    assert!(contexts::get(&store, &cold.id).is_ok());
    assert!(contexts::get(&store, &live.id).is_ok());
}

#[test]
fn purge_requires_snapshots_to_be_pruned_first() {
    let (_tmp, store) = setup();
    let ctx = contexts::create(&store, "keep history", "claude").unwrap();
    snapshot::snapshot(&store, Some(&ctx.id), "manual").unwrap();
    snapshot::snapshot(&store, Some(&ctx.id), "manual").unwrap();
    archive::execute_archive(&store, &one(&ctx.id), ArchiveAction::Archive).unwrap();

    let res = archive::execute_archive(&store, &one(&ctx.id), ArchiveAction::Purge).unwrap();
    assert!(!res.committed);
    assert!(res.rejected[0].reason.contains("snapshots"));

    assert_eq!(archive::prune_snapshots(&store, &ctx.id, 1).unwrap(), 1);
    assert_eq!(
        contexts::list_snapshots(&store, Some(&ctx.id), None, LimitPolicy::Clamp)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(archive::prune_snapshots(&store, &ctx.id, 0).unwrap(), 1);

    let res = archive::execute_archive(&store, &one(&ctx.id), ArchiveAction::Purge).unwrap();
    assert!(res.committed);
    assert!(matches!(
        contexts::get(&store, &ctx.id).unwrap_err(),
        MoltError::NotFound(_)
    ));
}

#[test]
fn archived_contexts_remain_retrievable_and_exportable() {
    let (_tmp, store) = setup();
    let id = populated(&store, "goal", "claude");
    contexts::update(
        &store,
        &id,
        &[Mutation::SetStatus {
            status: Status::Completed,
        }],
    )
    .unwrap();
    archive::execute_archive(&store, &one(&id), ArchiveAction::Archive).unwrap();
    let got = contexts::get(&store, &id).unwrap();
    let out = archive::export_contexts(&store, &one(&id), ExportFormat::Json, CompressionLevel::None).unwrap();
    let doc = archive::decode_export(&out.data, CompressionLevel::None).unwrap();
    assert_eq!(doc.contexts, vec![got]);
}
