use std::collections::BTreeSet;

use expstore::aggregate::AggregateRequest;
use expstore::database::{Database, PersistenceMode};
use expstore::registry::{ExperimentSearch, NewExperiment, NewExperimentType, NewTag, TextSearch};
use expstore::schema::SchemaDefinition;
use serde_json::{Map, json};
use uuid::Uuid;

struct Catalog {
    db: Database,
    ab: Uuid,
    a: Uuid,
    bc: Uuid,
}

// {a,b} and {a} are "Recall" experiments, {b,c} is a "Vision" experiment.
fn catalog() -> Catalog {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let recall = db
        .create_experiment_type(&NewExperimentType::new(
            "Recall",
            "recall_data",
            SchemaDefinition::new().column("words", "INTEGER"),
        ))
        .expect("recall");
    let vision = db
        .create_experiment_type(&NewExperimentType::new(
            "Vision",
            "vision_data",
            SchemaDefinition::new().column("acuity", "FLOAT").column("eye", "STRING"),
        ))
        .expect("vision");
    let ab = db
        .create_experiment(&NewExperiment::new(recall.id, "Word list, long delay").with_tags(["a", "b"]))
        .expect("ab")
        .uuid;
    let a = db
        .create_experiment(&NewExperiment::new(recall.id, "Word list, short delay").with_tags(["a"]))
        .expect("a")
        .uuid;
    let bc = db
        .create_experiment(&NewExperiment::new(vision.id, "Snellen chart").with_tags(["b", "c"]))
        .expect("bc")
        .uuid;

    let mut words = Map::new();
    for n in 0..3 {
        words.insert("words".into(), json!(10 + n));
        db.insert_data(&ab, &format!("P{n}"), &words).expect("ab row");
    }
    db.insert_data(&a, "P1", &words).expect("a row");
    let mut acuity = Map::new();
    acuity.insert("acuity".into(), json!(1.25));
    acuity.insert("eye".into(), json!("left"));
    db.insert_data(&bc, "P1", &acuity).expect("bc row");
    db.insert_data(&bc, "P2", &acuity).expect("bc row");
    Catalog { db, ab, a, bc }
}

fn owners(db: &Database, search: ExperimentSearch) -> BTreeSet<Uuid> {
    db.experiments(&search, 0, None)
        .expect("search")
        .into_iter()
        .map(|bound| bound.experiment.uuid)
        .collect()
}

#[test]
fn tag_match_all_and_match_any() {
    let c = catalog();
    assert_eq!(owners(&c.db, ExperimentSearch::tagged(["a", "b"], true)), BTreeSet::from([c.ab]));
    assert_eq!(
        owners(&c.db, ExperimentSearch::tagged(["a", "b"], false)),
        BTreeSet::from([c.ab, c.a, c.bc])
    );
    assert_eq!(
        owners(&c.db, ExperimentSearch::tagged(["a"], false)),
        BTreeSet::from([c.ab, c.a])
    );
    assert!(owners(&c.db, ExperimentSearch::tagged(["z"], false)).is_empty());
}

#[test]
fn aggregated_rows_carry_experiment_metadata() {
    let c = catalog();
    let result = c
        .db
        .aggregate(&AggregateRequest::new(ExperimentSearch::tagged(["a", "b"], true)))
        .expect("aggregate");
    assert_eq!(result.total_experiments, 1);
    assert_eq!(result.total_rows, 3);
    assert_eq!(result.data.len(), 3);
    for row in &result.data {
        assert_eq!(row.row.experiment_uuid, c.ab);
        assert_eq!(row.experiment_metadata.type_name, "Recall");
        assert_eq!(row.experiment_metadata.tags, ["a", "b"]);
    }
    assert_eq!(result.experiment_info[&c.ab].data_count, 3);
}

#[test]
fn heterogeneous_tables_merge_in_binding_order() {
    let c = catalog();
    let result = c
        .db
        .aggregate(&AggregateRequest::new(ExperimentSearch::tagged(["b"], false)))
        .expect("aggregate");
    assert_eq!(result.total_experiments, 2);
    assert_eq!(result.total_rows, 5);
    let order: Vec<Uuid> = result.data.iter().map(|r| r.row.experiment_uuid).collect();
    assert_eq!(order, [c.ab, c.ab, c.ab, c.bc, c.bc]);
    assert_eq!(result.data[0].row.value("words"), Some(&json!(10)));
    assert_eq!(result.data[4].row.value("eye"), Some(&json!("left")));
    assert!(result.data[4].row.value("words").is_none());

    let page = c
        .db
        .aggregate(&AggregateRequest::new(ExperimentSearch::tagged(["b"], false)).page(2, 2))
        .expect("page");
    let order: Vec<Uuid> = page.data.iter().map(|r| r.row.experiment_uuid).collect();
    assert_eq!(order, [c.ab, c.bc]);
    assert_eq!(page.total_rows, 5);
    let past_end = c
        .db
        .aggregate(&AggregateRequest::new(ExperimentSearch::tagged(["b"], false)).page(10, 5))
        .expect("past end");
    assert!(past_end.data.is_empty());
    assert_eq!(past_end.total_rows, 5);
}

#[test]
fn text_search_matches_description_or_type_name() {
    let c = catalog();
    let by_description = ExperimentSearch {
        text: Some("WORD LIST".into()),
        ..ExperimentSearch::default()
    };
    assert_eq!(owners(&c.db, by_description), BTreeSet::from([c.ab, c.a]));
    let by_type = ExperimentSearch {
        text: Some("visi".into()),
        ..ExperimentSearch::default()
    };
    assert_eq!(owners(&c.db, by_type), BTreeSet::from([c.bc]));
    let combined = ExperimentSearch {
        text: Some("short".into()),
        ..ExperimentSearch::tagged(["a"], true)
    };
    assert_eq!(owners(&c.db, combined), BTreeSet::from([c.a]));
}

#[test]
fn text_search_folds_non_ascii_case() {
    let c = catalog();
    let kind = c
        .db
        .create_experiment_type(&NewExperimentType::new("Écoute", "ecoute_data", SchemaDefinition::new()))
        .expect("type");
    let experiment = c
        .db
        .create_experiment(&NewExperiment::new(kind.id, "Äußere Reize"))
        .expect("experiment")
        .uuid;
    for text in ["écoute", "ÉCOUTE", "äußere", "ÄUßERE"] {
        let search = ExperimentSearch {
            text: Some(text.to_string()),
            ..ExperimentSearch::default()
        };
        assert_eq!(owners(&c.db, search), BTreeSet::from([experiment]), "{text}");
    }
    let types = c
        .db
        .search_experiment_types(&TextSearch { text: Some("ÉCOUTE".into()), ..TextSearch::default() }, 0, None)
        .expect("types");
    assert_eq!(types.len(), 1);
}

#[test]
fn future_bounds_exclude_everything() {
    let c = catalog();
    let later = chrono::Utc::now() + chrono::Duration::days(1);
    let result = c
        .db
        .aggregate(&AggregateRequest::new(ExperimentSearch::default()).created_between(Some(later), None))
        .expect("aggregate");
    assert_eq!(result.total_experiments, 0);
    assert_eq!(result.total_rows, 0);
    assert!(result.experiment_info.is_empty());
}

#[test]
fn catalog_searches() {
    let c = catalog();
    let types = c
        .db
        .search_experiment_types(&TextSearch { text: Some("recall".into()), ..TextSearch::default() }, 0, None)
        .expect("types");
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].table_name, "recall_data");

    c.db.create_tag(&NewTag { name: "a".into(), description: Some("Auditory".into()) }).expect("tag");
    c.db.create_tag(&NewTag { name: "b".into(), description: None }).expect("tag");
    let tags = c
        .db
        .search_tags(&TextSearch { text: Some("audit".into()), ..TextSearch::default() }, 0, None)
        .expect("tags");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "a");
    assert_eq!(c.db.tags(0, None).expect("all tags").len(), 2);
}
