use expstore::database::{Database, PersistenceMode};
use expstore::datatype::ColumnType;
use expstore::error::StoreError;
use expstore::registry::{NewExperimentType, ExperimentTypeUpdate};
use expstore::schema::{FIXED_COLUMNS, SchemaDefinition};
use serde_json::json;

fn db() -> Database {
    Database::new(PersistenceMode::InMemory).expect("db")
}

#[test]
fn describe_returns_fixed_then_declared_columns() {
    let db = db();
    let declared = SchemaDefinition::new()
        .column("zeta", "json")
        .column("alpha", "INTEGER")
        .column("middle", json!({"type": "Text", "nullable": false}))
        .column("when_seen", "DATETIME")
        .column("flag", "BOOLEAN")
        .column("ratio", "FLOAT")
        .column("label", "STRING");
    let kind = db
        .create_experiment_type(&NewExperimentType::new("survey", "survey_data", declared))
        .expect("provisioned");
    let columns = db.describe_columns(kind.id).expect("described");
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let mut expected: Vec<&str> = FIXED_COLUMNS.to_vec();
    expected.extend(["zeta", "alpha", "middle", "when_seen", "flag", "ratio", "label"]);
    assert_eq!(names, expected);

    let custom: Vec<(Option<ColumnType>, bool)> = columns[5..]
        .iter()
        .map(|c| (c.column_type, c.nullable))
        .collect();
    assert_eq!(
        custom,
        [
            (Some(ColumnType::Json), true),
            (Some(ColumnType::Integer), true),
            (Some(ColumnType::Text), false),
            (Some(ColumnType::DateTime), true),
            (Some(ColumnType::Boolean), true),
            (Some(ColumnType::Float), true),
            (Some(ColumnType::String), true),
        ]
    );
    assert!(columns[..5].iter().all(|c| c.fixed && !c.nullable));
    assert_eq!(db.describe_columns_by_name("survey").expect("by name"), columns);
}

#[test]
fn invalid_definitions_report_every_violation_and_create_nothing() {
    let db = db();
    let declared = SchemaDefinition::new()
        .column("participant_id", "STRING")
        .column("blob", "BLOB")
        .column("ok", "INTEGER")
        .column("odd", json!({"type": "TEXT", "default": "x"}))
        .column("OK", "TEXT");
    let err = db
        .create_experiment_type(&NewExperimentType::new("broken", "broken_data", declared))
        .expect_err("rejected");
    match err {
        StoreError::SchemaValidation { violations } => {
            let columns: Vec<&str> = violations.iter().map(|v| v.column.as_str()).collect();
            assert!(columns.contains(&"participant_id"));
            assert!(columns.contains(&"blob"));
            assert!(columns.contains(&"odd"));
            assert!(columns.contains(&"OK"));
            assert!(!columns.contains(&"ok"));
        }
        other => panic!("expected a schema validation error, got {other:?}"),
    }
    assert!(matches!(
        db.describe_columns_by_name("broken"),
        Err(StoreError::ExperimentTypeNotFound(_))
    ));
    assert!(db.experiment_types(0, None).expect("list").is_empty());
}

#[test]
fn binding_names_follow_the_identifier_policy() {
    let db = db();
    for table_name in ["1data", "data-set", "x\"; drop table experiments; --", "sqlite_master", "experiments", ""] {
        let result = db.create_experiment_type(&NewExperimentType::new(
            format!("named {table_name}"),
            table_name,
            SchemaDefinition::new(),
        ));
        assert!(
            matches!(result, Err(StoreError::InvalidArgument { field: "table_name", .. })),
            "{table_name} should be refused"
        );
    }
}

#[test]
fn second_binding_of_a_table_is_refused() {
    let db = db();
    db.create_experiment_type(&NewExperimentType::new("first", "shared_data", SchemaDefinition::new()))
        .expect("first");
    let err = db
        .create_experiment_type(&NewExperimentType::new(
            "second",
            "shared_data",
            SchemaDefinition::new().column("x", "INTEGER"),
        ))
        .expect_err("duplicate");
    assert!(matches!(err, StoreError::DuplicateTableBinding(ref t) if t == "shared_data"));
    assert!(err.is_conflict());
    let err = db
        .create_experiment_type(&NewExperimentType::new("first", "other_data", SchemaDefinition::new()))
        .expect_err("duplicate name");
    assert!(matches!(err, StoreError::DuplicateName { .. }));
    assert!(matches!(
        db.describe_columns_by_name("second"),
        Err(StoreError::ExperimentTypeNotFound(_))
    ));
}

#[test]
fn bindings_never_collide_with_index_names() {
    let db = db();
    db.create_experiment_type(&NewExperimentType::new("a", "a", SchemaDefinition::new()))
        .expect("a");
    db.create_experiment_type(&NewExperimentType::new(
        "ix",
        "ix_a_participant_id",
        SchemaDefinition::new(),
    ))
    .expect("binding shaped like an index name");
    db.create_experiment_type(&NewExperimentType::new(
        "ix b",
        "ix_b_experiment_uuid",
        SchemaDefinition::new(),
    ))
    .expect("ix_b_experiment_uuid");
    db.create_experiment_type(&NewExperimentType::new("b", "b", SchemaDefinition::new()))
        .expect("b after a table shaped like its index");
    assert_eq!(db.experiment_types(0, None).expect("types").len(), 4);
}

#[test]
fn metadata_updates_and_extension() {
    let db = db();
    let kind = db
        .create_experiment_type(&NewExperimentType::new("memory", "memory_data", SchemaDefinition::new().column("recall", "INTEGER")))
        .expect("provisioned");
    let renamed = db
        .update_experiment_type(
            kind.id,
            &ExperimentTypeUpdate {
                name: Some("working memory".into()),
                description: Some("n-back".into()),
            },
        )
        .expect("updated");
    assert_eq!(renamed.name, "working memory");
    assert_eq!(renamed.table_name, "memory_data");
    assert!(renamed.updated_at >= kind.updated_at);

    let extended = db
        .extend_experiment_type(kind.id, &SchemaDefinition::new().column("load", "INTEGER"))
        .expect("extended");
    assert_eq!(extended.schema_definition.len(), 2);
    let names: Vec<String> = db
        .describe_columns(kind.id)
        .expect("described")
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names.last().map(String::as_str), Some("load"));
}
