//! Expstore – runtime-declared experiment schemas on SQLite.
//!
//! Researchers declare *experiment types*: a name, a table binding and a schema
//! definition mapping column names to abstract type tokens. Each type gets its
//! own physical table, created at runtime. *Experiments* belong to exactly one
//! type and carry a small set of tags; their data rows live in the type's table.
//!
//! Every dynamic table carries the same fixed columns (`id`, `experiment_uuid`,
//! `participant_id`, `created_at`, `updated_at`) followed by the declared ones.
//!
//! ## Modules
//! * [`datatype`] – the closed set of column type tokens, their physical mapping
//!   and the coercion of JSON values into stored values.
//! * [`schema`] – schema definitions, identifier policy and validation.
//! * [`registry`] – the catalog of experiment types, experiments and tags.
//! * [`provision`] – creation, reflection, extension and removal of tables.
//! * [`access`] – type checked CRUD and filtered listing against one table.
//! * [`aggregate`] – tag and text searches across every matching table.
//! * [`database`] – the [`database::Database`] facade owning the connection.
//! * [`crate::config`] – layered settings from defaults, a file and the environment.
//!
//! ## Quick Start
//! ```
//! use expstore::database::{Database, PersistenceMode};
//! use expstore::registry::{NewExperiment, NewExperimentType};
//! use expstore::schema::SchemaDefinition;
//! use serde_json::{Map, json};
//!
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! let kind = db
//!     .create_experiment_type(&NewExperimentType::new(
//!         "scores",
//!         "t_data",
//!         SchemaDefinition::new().column("score", "FLOAT"),
//!     ))
//!     .unwrap();
//! let experiment = db.create_experiment(&NewExperiment::new(kind.id, "pilot")).unwrap();
//! let mut values = Map::new();
//! values.insert("score".into(), json!(0.5));
//! let row = db.insert_data(&experiment.uuid, "P1", &values).unwrap();
//! assert_eq!(row.value("score"), Some(&json!(0.5)));
//! ```

pub mod access;
pub mod aggregate;
pub mod config;
pub mod database;
pub mod datatype;
pub mod error;
pub mod provision;
pub mod registry;
pub mod schema;
