use molt::core::config::StoreConfig;
use molt::core::error::MoltError;
use molt::core::store::{Store, StoreKind};
use molt::core::vocab::{
    ActionResult, ActionType, ApproachResult, LimitPolicy, QueryType, SnapshotReason, Status,
};
use molt::plugins::archive;
use molt::plugins::contexts::{self, ContextFilter, Mutation};
use molt::core::vocab::ArchiveAction;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn setup() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(StoreKind::Repo, tmp.path()).unwrap();
    (tmp, store)
}

#[test]
fn create_then_get_matches_for_every_agent() {
    let (_tmp, store) = setup();
    for (i, agent) in store.config.vocab.agents.clone().iter().enumerate() {
        let goal = format!("goal number {}", i);
        let created = contexts::create(&store, &goal, agent).unwrap();
        let fetched = contexts::get(&store, &created.id).unwrap();
        assert_eq!(fetched.goal, goal);
        assert_eq!(&fetched.agent, agent);
        assert_eq!(fetched.status, Status::Active);
        assert!(!fetched.archived);
        assert_eq!(fetched, created);
    }
}

#[test]
fn update_records_history_in_order() {
    let (_tmp, store) = setup();
    let ctx = contexts::create(&store, "speed up the build", "codex").unwrap();
    contexts::update(
        &store,
        &ctx.id,
        &[
            Mutation::AddQuery {
                query_type: QueryType::Question,
                text: "why is linking slow".to_string(),
            },
            Mutation::AddAction {
                action_type: ActionType::Build,
                result: ActionResult::Failure,
                detail: Some("linker OOM".to_string()),
            },
        ],
    )
    .unwrap();
    let updated = contexts::update(
        &store,
        &ctx.id,
        &[Mutation::AddApproach {
            description: "switch to mold".to_string(),
            result: ApproachResult::Success,
        }],
    )
    .unwrap();

    assert_eq!(updated.version, 3);
    assert_eq!(updated.queries.len(), 1);
    assert_eq!(updated.actions[0].detail.as_deref(), Some("linker OOM"));
    assert_eq!(updated.approaches[0].result, ApproachResult::Success);
    assert!(updated.approaches[0].timestamp >= updated.actions[0].timestamp);
    assert_eq!(contexts::get(&store, &ctx.id).unwrap(), updated);
}

#[test]
fn update_validates_before_writing() {
    let (_tmp, store) = setup();
    let ctx = contexts::create(&store, "goal", "claude").unwrap();

    let err = contexts::update(&store, &ctx.id, &[]).unwrap_err();
    assert!(matches!(err, MoltError::ValidationError(_)));

    let err = contexts::update(
        &store,
        &ctx.id,
        &[Mutation::AddQuery {
            query_type: QueryType::Lookup,
            text: "x".repeat(store.config.limits.max_query_chars + 1),
        }],
    )
    .unwrap_err();
    assert!(matches!(err, MoltError::ValidationError(_)));

    let err = contexts::update(
        &store,
        "ctx_nope",
        &[Mutation::SetGoal {
            goal: "g".to_string(),
        }],
    )
    .unwrap_err();
    assert!(matches!(err, MoltError::NotFound(_)));

    assert_eq!(contexts::get(&store, &ctx.id).unwrap().version, 1);
}

#[test]
fn archived_context_is_read_only() {
    let (_tmp, store) = setup();
    let ctx = contexts::create(&store, "goal", "claude").unwrap();
    archive::execute_archive(&store, std::slice::from_ref(&ctx.id), ArchiveAction::Archive).unwrap();

    let err = contexts::update(
        &store,
        &ctx.id,
        &[Mutation::SetGoal {
            goal: "changed".to_string(),
        }],
    )
    .unwrap_err();
    assert!(matches!(err, MoltError::Conflict(_)));
    let still = contexts::get(&store, &ctx.id).unwrap();
    assert!(still.archived);
    assert_eq!(still.goal, "goal");
}

#[test]
fn archiving_frees_the_active_slot() {
    let (_tmp, store) = setup();
    let first = contexts::create(&store, "first", "gemini").unwrap();
    archive::execute_archive(&store, std::slice::from_ref(&first.id), ArchiveAction::Archive).unwrap();
    assert!(contexts::create(&store, "second", "gemini").is_ok());
}

#[test]
fn concurrent_updates_to_one_context_are_serialized() {
    let (_tmp, store) = setup();
    let store = Arc::new(store);
    let ctx = contexts::create(&store, "hot context", "claude").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            let id = ctx.id.clone();
            thread::spawn(move || {
                contexts::update(
                    &store,
                    &id,
                    &[Mutation::AddQuery {
                        query_type: QueryType::Search,
                        text: format!("query {}", i),
                    }],
                )
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    let after = contexts::get(&store, &ctx.id).unwrap();
    assert_eq!(after.queries.len(), 8);
    assert_eq!(after.version, 9);
}

#[test]
fn concurrent_creates_respect_single_active_per_agent() {
    let (_tmp, store) = setup();
    let store = Arc::new(store);
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || contexts::create(&store, &format!("race {}", i), "cursor"))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, MoltError::Conflict(_)))
    );
}

#[test]
fn list_filters_and_bounds() {
    let (_tmp, store) = setup();
    let a = contexts::create(&store, "a", "claude").unwrap();
    let _b = contexts::create(&store, "b", "codex").unwrap();
    let c = contexts::create(&store, "c", "gemini").unwrap();
    archive::execute_archive(&store, std::slice::from_ref(&c.id), ArchiveAction::Archive).unwrap();

    assert_eq!(contexts::list(&store, &ContextFilter::default()).unwrap().len(), 2);
    let archived = contexts::list(
        &store,
        &ContextFilter {
            archived_only: true,
            ..ContextFilter::default()
        },
    )
    .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, c.id);

    let one = contexts::list(
        &store,
        &ContextFilter {
            include_archived: true,
            limit: Some(1),
            ..ContextFilter::default()
        },
    )
    .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].id, c.id);

    let err = contexts::list(
        &store,
        &ContextFilter {
            limit: Some(100_000),
            limit_policy: LimitPolicy::Reject,
            ..ContextFilter::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, MoltError::ValidationError(_)));

    let paused_only = contexts::list(
        &store,
        &ContextFilter {
            status: Some(Status::Paused),
            ..ContextFilter::default()
        },
    )
    .unwrap();
    assert!(paused_only.is_empty());
    let _ = a;
}

#[test]
fn create_snapshot_soft_outcomes() {
    let (_tmp, store) = setup();
    assert!(
        contexts::create_snapshot(&store, None, SnapshotReason::Auto)
            .unwrap()
            .is_none()
    );

    let ctx = contexts::create(&store, "goal", "claude").unwrap();
    contexts::update(
        &store,
        &ctx.id,
        &[Mutation::SetStatus {
            status: Status::Paused,
        }],
    )
    .unwrap();
    assert!(
        contexts::create_snapshot(&store, Some(&ctx.id), SnapshotReason::Manual)
            .unwrap()
            .is_none()
    );
    assert!(
        contexts::create_snapshot(&store, None, SnapshotReason::Manual)
            .unwrap()
            .is_none()
    );

    let err = contexts::create_snapshot(&store, Some("ctx_missing"), SnapshotReason::Manual).unwrap_err();
    assert!(matches!(err, MoltError::NotFound(_)));
}

#[test]
fn create_snapshot_without_id_picks_most_recent_active() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        multi_active: true,
        ..StoreConfig::default()
    };
    let store = Store::open_with_config(StoreKind::Repo, tmp.path(), config).unwrap();
    let older = contexts::create(&store, "older", "claude").unwrap();
    let newer = contexts::create(&store, "newer", "claude").unwrap();

    let snap = contexts::create_snapshot(&store, None, SnapshotReason::Auto)
        .unwrap()
        .unwrap();
    assert_eq!(snap.context_id, newer.id);

    contexts::update(
        &store,
        &older.id,
        &[Mutation::SetGoal {
            goal: "older, touched".to_string(),
        }],
    )
    .unwrap();
    let snap = contexts::create_snapshot(&store, None, SnapshotReason::Auto)
        .unwrap()
        .unwrap();
    assert_eq!(snap.context_id, older.id);
}
