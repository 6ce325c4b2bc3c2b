use chrono::NaiveDate;
use riskpipe_core::{
    classifier::RiskCategory,
    entity::{parse_timestamp, Entity, EntityRecord, EventRecord},
    features,
    report::{self, Dimension},
    scoring::ScoreBreakdown,
    segmenter::Segment,
    EntityResult, Pipeline, Ruleset, RunInput, RunOptions,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn result(id: i64, region: &str, score: u32, category: RiskCategory, value: f64) -> EntityResult {
    let mut fv = features::extract(
        id,
        &[],
        parse_timestamp("2024-06-01").unwrap(),
        Ruleset::churn_default().features(),
    );
    fv.total_amount = value;

    EntityResult {
        entity: Entity {
            id,
            region: region.into(),
            signup_date: NaiveDate::from_ymd_opt(2024, 1, 15),
        },
        features: fv,
        breakdown: ScoreBreakdown { score, contributions: Vec::new() },
        category,
        segment: Segment {
            strategy:   format!("{} plan", category.as_str()),
            action:     "review".into(),
            rule_index: 0,
        },
    }
}

fn three_categories() -> Vec<EntityResult> {
    vec![
        result(1, "USA", 10, RiskCategory::Low, 100.0),
        result(2, "UK", 50, RiskCategory::Medium, 40.0),
        result(3, "USA", 90, RiskCategory::VeryHigh, 10.0),
    ]
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn one_group_per_category_with_its_own_score() {
    let report = report::group_by(&three_categories(), &[Dimension::Category]);

    assert_eq!(report.rows.len(), 3);
    for row in &report.rows {
        assert_eq!(row.count, 1);
        assert_eq!(row.distinct_entities, 1);
    }

    let summary: Vec<(&str, f64)> = report
        .rows
        .iter()
        .map(|r| (r.keys[0].as_str(), r.avg_score))
        .collect();
    assert_eq!(summary, vec![("very_high", 90.0), ("medium", 50.0), ("low", 10.0)]);
}

#[test]
fn nested_grouping_reports_share_of_parent() {
    let report = report::group_by(&three_categories(), &[Dimension::Region, Dimension::Category]);

    let usa_low = report
        .rows
        .iter()
        .find(|r| r.keys == ["USA", "low"])
        .unwrap();
    assert_eq!(usa_low.pct_of_parent, 50.0);
    assert!((usa_low.pct_of_total - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(usa_low.total_value, 100.0);

    let uk = report.rows.iter().find(|r| r.keys[0] == "UK").unwrap();
    assert_eq!(uk.pct_of_parent, 100.0);
}

#[test]
fn grouping_without_dimensions_aggregates_everything() {
    let report = report::group_by(&three_categories(), &[]);

    assert_eq!(report.rows.len(), 1);
    let all = &report.rows[0];
    assert_eq!(all.count, 3);
    assert_eq!(all.avg_score, 50.0);
    assert_eq!(all.total_value, 150.0);
    assert_eq!(all.avg_value, 50.0);
}

#[test]
fn pivot_columns_are_fixed_by_configuration() {
    let columns = Ruleset::churn_default().categories();
    let pivot = report::category_pivot(&three_categories(), Dimension::Region, &columns);

    assert_eq!(pivot.columns.len(), 5);
    let keys: Vec<&str> = pivot.rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["UK", "USA"]);

    let usa = &pivot.rows[1];
    assert_eq!(usa.counts, vec![1, 0, 0, 1, 0]);
    assert_eq!(usa.total, 2);

    let text = report::render_pivot_text(&pivot);
    assert!(text.contains("very_high"));
    assert!(text.lines().count() == 3);
}

#[test]
fn cohort_retention_counts_entities_still_active() {
    let event = |entity_id: i64, ts: &str, status: &str| EventRecord {
        entity_id: Some(entity_id),
        timestamp: Some(ts.into()),
        status:    Some(status.into()),
        amount:    None,
    };
    let entity = |id: i64, signup: &str| EntityRecord {
        id:          Some(id),
        region:      Some("USA".into()),
        signup_date: Some(signup.into()),
    };

    let input = RunInput {
        entities: vec![
            entity(1, "2024-01-10"),
            entity(2, "2024-01-20"),
            entity(3, "2024-02-05"),
        ],
        events: vec![
            event(1, "2024-01-10", "active"),
            event(1, "2024-02-10", "active"),
            event(2, "2024-01-20", "active"),
            event(2, "2024-02-20", "cancelled"),
            event(3, "2024-02-05", "active"),
        ],
    };
    let output = Pipeline::new(
        Ruleset::churn_default(),
        RunOptions::new(parse_timestamp("2024-03-01").unwrap()),
    )
    .run(&input)
    .unwrap();

    let cohorts = report::cohort_retention(&output.results);
    assert_eq!(cohorts.len(), 2);
    assert_eq!(cohorts[0].cohort, "2024-01");
    assert_eq!((cohorts[0].entities, cohorts[0].retained), (2, 1));
    assert_eq!(cohorts[0].retention_rate, 50.0);
    assert_eq!(cohorts[1].cohort, "2024-02");
    assert_eq!(cohorts[1].retention_rate, 100.0);
}

#[test]
fn detail_text_respects_row_limit() {
    let input = RunInput {
        entities: (1..=4)
            .map(|id| EntityRecord {
                id:          Some(id),
                region:      Some("UK".into()),
                signup_date: None,
            })
            .collect(),
        events: Vec::new(),
    };
    let output = Pipeline::new(
        Ruleset::churn_default(),
        RunOptions::new(parse_timestamp("2024-03-01").unwrap()),
    )
    .run(&input)
    .unwrap();

    let text = report::render_detail_text(&output, Some(2));
    assert_eq!(text.lines().count(), 4);
    assert!(text.ends_with("... 2 more\n"));
    assert!(text.contains("Monitor Only"));
}
