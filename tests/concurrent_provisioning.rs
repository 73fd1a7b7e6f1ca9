use std::sync::{Arc, Barrier};
use std::thread;

use expstore::database::{Database, DatabaseOptions, PersistenceMode};
use expstore::error::StoreError;
use expstore::registry::NewExperimentType;
use expstore::schema::SchemaDefinition;

const CALLERS: usize = 8;

fn declaration(caller: usize) -> NewExperimentType {
    NewExperimentType::new(
        format!("contender {caller}"),
        "contested_data",
        SchemaDefinition::new().column("value", "INTEGER"),
    )
}

fn tally(results: Vec<Result<(), StoreError>>) -> (usize, usize) {
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(StoreError::DuplicateTableBinding(_))))
        .count();
    (successes, duplicates)
}

fn physical_tables(path: &std::path::Path) -> i64 {
    let connection = rusqlite::Connection::open(path).expect("raw connection");
    connection
        .query_row(
            "select count(*) from sqlite_master where type = 'table' and name = 'contested_data'",
            [],
            |row| row.get(0),
        )
        .expect("count tables")
}

#[test]
fn separate_connections_bind_a_table_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("contested.db");
    // created up front so every caller finds the registry in place
    Database::open(DatabaseOptions::file(&path)).expect("db");

    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|caller| {
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            thread::spawn(move || {
                let db = Database::open(DatabaseOptions::file(path)).expect("db");
                barrier.wait();
                db.create_experiment_type(&declaration(caller)).map(|_| ())
            })
        })
        .collect();
    let results = handles.into_iter().map(|h| h.join().expect("join")).collect();

    assert_eq!(tally(results), (1, CALLERS - 1));
    assert_eq!(physical_tables(&path), 1);
    let db = Database::open(DatabaseOptions::file(&path)).expect("db");
    assert_eq!(db.experiment_types(0, None).expect("types").len(), 1);
}

#[test]
fn shared_database_binds_a_table_once() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|caller| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                db.create_experiment_type(&declaration(caller)).map(|_| ())
            })
        })
        .collect();
    let results = handles.into_iter().map(|h| h.join().expect("join")).collect();
    assert_eq!(tally(results), (1, CALLERS - 1));
    assert_eq!(db.experiment_types(0, None).expect("types").len(), 1);
}
