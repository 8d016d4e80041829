use molt::core::config::{CONFIG_FILE_NAME, StoreConfig};
use molt::core::error::MoltError;
use molt::core::store::{Store, StoreKind};
use molt::core::vocab::{ActionResult, ActionType, ApproachResult, QueryType};
use molt::plugins::contexts::{self, Mutation};
use molt::plugins::patterns::{self, PatternKind, Severity};
use std::fs;
use tempfile::TempDir;

fn setup_agent1() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join(CONFIG_FILE_NAME),
        "[vocab]\nagents = [\"agent1\", \"agent2\"]\n",
    )
    .unwrap();
    let store = Store::open(StoreKind::Repo, tmp.path()).unwrap();
    (tmp, store)
}

fn record(store: &Store, id: &str, action_type: ActionType, result: ActionResult) {
    contexts::update(
        store,
        id,
        &[Mutation::AddAction {
            action_type,
            result,
            detail: None,
        }],
    )
    .unwrap();
}

#[test]
fn three_failed_builds_yield_signature_and_warning() {
    let (_tmp, store) = setup_agent1();
    let a = contexts::create(&store, "fix bug", "agent1").unwrap();
    for _ in 0..3 {
        record(&store, &a.id, ActionType::Build, ActionResult::Failure);
    }

    let sigs = patterns::detect_failure_patterns(&store, &a.id).unwrap();
    assert_eq!(sigs.len(), 1);
    assert_eq!(sigs[0].kind, PatternKind::ActionFailures);
    assert_eq!(sigs[0].key, "build");
    assert_eq!(sigs[0].occurrences, 3);
    assert!(sigs[0].consecutive);

    let warnings = patterns::get_enhanced_warnings(&store, &a.id).unwrap();
    let referencing: Vec<_> = warnings
        .iter()
        .filter(|w| w.pattern.as_ref() == Some(&sigs[0]))
        .collect();
    assert_eq!(referencing.len(), 1);
    assert_eq!(referencing[0].severity, Severity::Critical);
    assert!(referencing[0].cause.contains("build"));
}

#[test]
fn two_failures_stay_below_threshold() {
    let (_tmp, store) = setup_agent1();
    let a = contexts::create(&store, "fix bug", "agent1").unwrap();
    record(&store, &a.id, ActionType::Build, ActionResult::Failure);
    record(&store, &a.id, ActionType::Build, ActionResult::Failure);
    record(&store, &a.id, ActionType::Test, ActionResult::Failure);
    assert!(patterns::detect_failure_patterns(&store, &a.id).unwrap().is_empty());
    assert!(patterns::get_enhanced_warnings(&store, &a.id).unwrap().is_empty());
}

#[test]
fn configured_threshold_and_window_apply() {
    let tmp = TempDir::new().unwrap();
    let mut config = StoreConfig::default();
    config.patterns.threshold = 2;
    config.patterns.window = 3;
    let store = Store::open_with_config(StoreKind::Repo, tmp.path(), config).unwrap();
    let a = contexts::create(&store, "goal", "claude").unwrap();

    record(&store, &a.id, ActionType::Run, ActionResult::Failure);
    record(&store, &a.id, ActionType::Run, ActionResult::Failure);
    assert_eq!(patterns::detect_failure_patterns(&store, &a.id).unwrap().len(), 1);

    // Two successes push one failure out of the three-action window.
    record(&store, &a.id, ActionType::Edit, ActionResult::Success);
    record(&store, &a.id, ActionType::Edit, ActionResult::Success);
    assert!(patterns::detect_failure_patterns(&store, &a.id).unwrap().is_empty());
}

#[test]
fn no_progress_and_query_churn_warnings() {
    let tmp = TempDir::new().unwrap();
    let mut config = StoreConfig::default();
    config.patterns.no_progress_actions = 4;
    config.patterns.query_churn = 3;
    let store = Store::open_with_config(StoreKind::Repo, tmp.path(), config).unwrap();
    let a = contexts::create(&store, "goal", "claude").unwrap();

    for t in [ActionType::Edit, ActionType::Run, ActionType::Review, ActionType::Deploy] {
        record(&store, &a.id, t, ActionResult::Partial);
    }
    for text in ["where is it", "what calls it", "who owns it"] {
        contexts::update(
            &store,
            &a.id,
            &[Mutation::AddQuery {
                query_type: QueryType::Question,
                text: text.to_string(),
            }],
        )
        .unwrap();
    }

    let warnings = patterns::get_enhanced_warnings(&store, &a.id).unwrap();
    let codes: Vec<&str> = warnings.iter().map(|w| w.code.as_str()).collect();
    assert_eq!(codes, vec!["no_progress", "query_churn"]);
    assert_eq!(warnings[0].severity, Severity::Warning);
    assert!(warnings.iter().all(|w| w.pattern.is_none()));
}

#[test]
fn failing_approaches_warn() {
    let (_tmp, store) = setup_agent1();
    let a = contexts::create(&store, "goal", "agent1").unwrap();
    for result in [ApproachResult::Failure, ApproachResult::Abandoned, ApproachResult::Failure] {
        contexts::update(
            &store,
            &a.id,
            &[Mutation::AddApproach {
                description: "try again".to_string(),
                result,
            }],
        )
        .unwrap();
    }
    let warnings = patterns::get_enhanced_warnings(&store, &a.id).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].code, "failing_approaches");
}

#[test]
fn output_is_deterministic_across_calls() {
    let (_tmp, store) = setup_agent1();
    let a = contexts::create(&store, "goal", "agent1").unwrap();
    for t in [ActionType::Test, ActionType::Build, ActionType::Test, ActionType::Build, ActionType::Test, ActionType::Build] {
        record(&store, &a.id, t, ActionResult::Failure);
    }
    let first = patterns::get_enhanced_warnings(&store, &a.id).unwrap();
    for _ in 0..3 {
        assert_eq!(patterns::get_enhanced_warnings(&store, &a.id).unwrap(), first);
    }
    let keys: Vec<String> = patterns::detect_failure_patterns(&store, &a.id)
        .unwrap()
        .into_iter()
        .map(|s| s.key)
        .collect();
    assert_eq!(keys, vec!["build", "test"]);
}

#[test]
fn unknown_context_is_not_found() {
    let (_tmp, store) = setup_agent1();
    assert!(matches!(
        patterns::detect_failure_patterns(&store, "ctx_missing").unwrap_err(),
        MoltError::NotFound(_)
    ));
}
