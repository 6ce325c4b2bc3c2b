use riskpipe_core::{
    entity::{parse_timestamp, EntityRecord, EventRecord},
    event::RunEvent,
    store::{ScoreStore, ScoreWrite},
    Pipeline, PipelineError, Ruleset, RunInput, RunOptions,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn make_store() -> ScoreStore {
    let store = ScoreStore::in_memory().unwrap();
    store.migrate().unwrap();
    store
}

fn pipeline(analysis: &str) -> Pipeline {
    pipeline_with(Ruleset::churn_default(), analysis)
}

fn pipeline_with(ruleset: Ruleset, analysis: &str) -> Pipeline {
    let mut options = RunOptions::new(parse_timestamp(analysis).unwrap());
    options.actor = "nightly-batch".into();
    Pipeline::new(ruleset, options)
}

fn input() -> RunInput {
    let event = |entity_id: i64, ts: &str, status: &str| EventRecord {
        entity_id: Some(entity_id),
        timestamp: Some(ts.into()),
        status:    Some(status.into()),
        amount:    None,
    };
    RunInput {
        entities: vec![
            EntityRecord { id: Some(1), region: Some("USA".into()), signup_date: None },
            EntityRecord { id: Some(2), region: Some("UK".into()), signup_date: None },
        ],
        events: vec![
            event(1, "2024-01-01", "active"),
            event(1, "2024-03-01", "cancelled"),
            event(2, "2024-03-20", "active"),
            event(9, "2024-03-20", "active"),
        ],
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn migrate_is_idempotent() {
    let store = make_store();
    store.migrate().unwrap();
    assert_eq!(store.score_count().unwrap(), 0);
    assert_eq!(store.path(), None);
}

#[test]
fn persisted_run_writes_scores_and_audit_rows() {
    let store = make_store();
    let output = pipeline("2024-04-01").run_and_persist(&input(), &store).unwrap();

    assert_eq!(store.run_count().unwrap(), 1);
    assert_eq!(store.score_count().unwrap(), 2);
    assert_eq!(store.audit_count(1).unwrap(), 1);
    assert_eq!(store.audit_count(2).unwrap(), 1);

    let date = output.analysis_time.date();
    let cached = store.cached_score(1, date, "churn", "1").unwrap().unwrap();
    let r = output.results.iter().find(|r| r.entity.id == 1).unwrap();
    assert_eq!(cached.score, r.score());
    assert_eq!(cached.category, r.category);
    assert_eq!(cached.features, r.features);

    assert!(store.cached_score(1, date, "churn", "2").unwrap().is_none());
}

#[test]
fn rerun_for_same_day_writes_nothing_new() {
    let store = make_store();
    pipeline("2024-04-01").run_and_persist(&input(), &store).unwrap();
    let second = pipeline("2024-04-01 18:00").run_and_persist(&input(), &store).unwrap();

    assert_eq!(store.run_count().unwrap(), 2);
    assert_eq!(store.score_count().unwrap(), 2);
    assert_eq!(store.audit_count(1).unwrap(), 1);

    let events = store.events_for_run(&second.run_id).unwrap();
    let last: RunEvent = serde_json::from_str(&events.last().unwrap().payload).unwrap();
    assert_eq!(
        last,
        RunEvent::RunCompleted { scored: 2, rejected: 1, scores_written: 0 },
    );
}

#[test]
fn new_analysis_date_gets_its_own_cache_row() {
    let store = make_store();
    pipeline("2024-04-01").run_and_persist(&input(), &store).unwrap();
    pipeline("2024-07-01").run_and_persist(&input(), &store).unwrap();

    assert_eq!(store.score_count().unwrap(), 4);
    assert_eq!(store.audit_count(1).unwrap(), 2);
}

#[test]
fn changed_snapshot_is_updated_and_audited() {
    let store = make_store();
    let output = pipeline("2024-04-01").run(&input()).unwrap();
    let r = &output.results[0];

    let mut snapshot = riskpipe_core::store::ScoreSnapshot {
        entity_id:       r.entity.id,
        analysis_date:   output.analysis_time.date(),
        ruleset_name:    "churn".into(),
        ruleset_version: "1".into(),
        score:           r.score(),
        category:        r.category,
        strategy:        r.segment.strategy.clone(),
        action:          r.segment.action.clone(),
        features:        r.features.clone(),
    };

    // The run row is referenced by the event log only, not by scores.
    let first = store.upsert_score("run-a", &snapshot, "analyst", "2024-04-01T00:00:00Z").unwrap();
    assert_eq!(first, ScoreWrite::Inserted);

    let same = store.upsert_score("run-b", &snapshot, "analyst", "2024-04-01T01:00:00Z").unwrap();
    assert_eq!(same, ScoreWrite::Unchanged);

    let old_score = snapshot.score;
    snapshot.score += 5;
    let changed = store.upsert_score("run-c", &snapshot, "analyst", "2024-04-01T02:00:00Z").unwrap();
    assert_eq!(changed, ScoreWrite::Updated { old_score });

    assert_eq!(store.score_count().unwrap(), 1);
    assert_eq!(store.audit_count(r.entity.id).unwrap(), 2);
    let cached = store
        .cached_score(r.entity.id, snapshot.analysis_date, "churn", "1")
        .unwrap()
        .unwrap();
    assert_eq!(cached.score, old_score + 5);
}

#[test]
fn run_log_records_lifecycle_in_order() {
    let store = make_store();
    let output = pipeline("2024-04-01").run_and_persist(&input(), &store).unwrap();

    let types: Vec<String> = store
        .events_for_run(&output.run_id)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["run_started", "record_rejected", "run_completed"]);
}

/// Both shipped rulesets are version "1"; the name keeps their rows apart.
#[test]
fn rulesets_sharing_a_version_keep_separate_rows() {
    let store = make_store();
    pipeline("2024-04-01").run_and_persist(&input(), &store).unwrap();
    pipeline_with(Ruleset::fraud_default(), "2024-04-01")
        .run_and_persist(&input(), &store)
        .unwrap();

    assert_eq!(store.score_count().unwrap(), 4);
    assert_eq!(store.audit_count(1).unwrap(), 2);

    let date = parse_timestamp("2024-04-01").unwrap().date();
    let churn = store.cached_score(1, date, "churn", "1").unwrap().unwrap();
    let fraud = store.cached_score(1, date, "fraud", "1").unwrap().unwrap();
    assert_eq!(churn.ruleset_name, "churn");
    assert_ne!(churn.strategy, "Allow");
    assert_eq!(fraud.strategy, "Allow");
}

#[test]
fn failed_run_leaves_run_row_with_failure_event_and_no_scores() {
    let store = make_store();
    let mut bad = input();
    bad.events.push(EventRecord {
        entity_id: Some(1),
        timestamp: Some("2024-02-01".into()),
        status:    Some("paused".into()),
        amount:    None,
    });

    let mut options = RunOptions::new(parse_timestamp("2024-04-01").unwrap());
    options.strict = true;
    let err = Pipeline::new(Ruleset::churn_default(), options)
        .run_and_persist(&bad, &store)
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRecord { .. }), "{err}");

    assert_eq!(store.run_count().unwrap(), 1);
    assert_eq!(store.score_count().unwrap(), 0);
    assert_eq!(store.audit_count(1).unwrap(), 0);

    let failed = store.events_of_type("run_failed").unwrap();
    assert_eq!(failed.len(), 1);
    let types: Vec<String> = store
        .events_for_run(&failed[0].run_id)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["run_started", "run_failed"]);

    match serde_json::from_str::<RunEvent>(&failed[0].payload).unwrap() {
        RunEvent::RunFailed { reason } => assert!(reason.contains("paused"), "{reason}"),
        other => panic!("expected RunFailed, got {other:?}"),
    }
    assert!(store.events_of_type("run_completed").unwrap().is_empty());
}

#[test]
fn transaction_error_rolls_back_every_write() {
    let store = make_store();
    let result: Result<(), PipelineError> = store.in_transaction(|store| {
        store.insert_run("run-x", "churn", "1", "2024-04-01 00:00:00", "analyst", "2024-04-01T00:00:00Z")?;
        Err(PipelineError::Other(anyhow::anyhow!("disk full")))
    });

    assert!(result.is_err());
    assert_eq!(store.run_count().unwrap(), 0);
}

#[test]
fn file_store_opens_and_migrates() {
    let path = std::env::temp_dir().join(format!("riskpipe-{}.db", std::process::id()));
    let path = path.to_string_lossy().to_string();
    let _ = std::fs::remove_file(&path);

    {
        let store = ScoreStore::open(&path).unwrap();
        store.migrate().unwrap();
        assert_eq!(store.path(), Some(path.as_str()));
        pipeline("2024-04-01").run_and_persist(&input(), &store).unwrap();
    }

    let reopened = ScoreStore::open(&path).unwrap();
    assert_eq!(reopened.score_count().unwrap(), 2);
    drop(reopened);
    let _ = std::fs::remove_file(&path);
}
