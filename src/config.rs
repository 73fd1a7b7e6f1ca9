//! Settings layered from defaults, an optional JSON file and `EXPSTORE__*`
//! environment variables (e.g. `EXPSTORE__DATABASE__PATH=/var/lib/expstore.db`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::access::Limits;
use crate::database::{DatabaseOptions, PersistenceMode};
use crate::error::{Result, StoreError};
use crate::registry::NewExperimentType;

/// Base name of the settings file looked up in the working directory.
pub const DEFAULT_FILE: &str = "expstore";

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Absent means an in-memory database.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub limits: Limits,
    pub log: LogSettings,
    /// JSON array of experiment type declarations applied on start-up.
    pub bootstrap: Option<PathBuf>,
}

impl Settings {
    /// Loads settings from `file`, or from `expstore.json` when present.
    pub fn load(file: Option<&Path>) -> Result<Settings> {
        let builder = Config::builder()
            .set_default("database.busy_timeout_ms", 5000)?
            .set_default("limits.max_page_size", 1000)?
            .set_default("limits.default_page_size", 100)?
            .set_default("log.filter", "expstore=info")?;
        let builder = match file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_FILE).required(false)),
        };
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("EXPSTORE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.limits.max_page_size == 0 {
            return Err(StoreError::Config("limits.max_page_size must be positive".into()));
        }
        if self.limits.default_page_size == 0 || self.limits.default_page_size > self.limits.max_page_size {
            return Err(StoreError::Config(format!(
                "limits.default_page_size must be between 1 and {}",
                self.limits.max_page_size
            )));
        }
        Ok(())
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            mode: match &self.database.path {
                Some(path) => PersistenceMode::File(path.clone()),
                None => PersistenceMode::InMemory,
            },
            busy_timeout: Duration::from_millis(self.database.busy_timeout_ms),
            limits: self.limits,
        }
    }

    /// Declarations from the bootstrap file, empty when none is configured.
    pub fn bootstrap_types(&self) -> Result<Vec<NewExperimentType>> {
        let Some(path) = &self.bootstrap else {
            return Ok(Vec::new());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Config(format!("malformed bootstrap file {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_override_defaults() {
        let file = settings_file(r#"{"database": {"path": "data.db"}, "limits": {"max_page_size": 50, "default_page_size": 25}}"#);
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.database.busy_timeout_ms, 5000);
        assert_eq!(settings.limits.max_page_size, 50);
        assert_eq!(settings.limits.default_page_size, 25);
        assert_eq!(
            settings.database_options().mode,
            PersistenceMode::File(PathBuf::from("data.db"))
        );
    }

    #[test]
    fn default_page_size_must_fit_the_maximum() {
        let file = settings_file(r#"{"limits": {"max_page_size": 10, "default_page_size": 20}}"#);
        assert!(matches!(Settings::load(Some(file.path())), Err(StoreError::Config(_))));
    }

    #[test]
    fn bootstrap_file_lists_declarations() {
        let bootstrap = settings_file(
            r#"[{"name": "reaction", "table_name": "reaction_data", "schema_definition": {"ms": "INTEGER"}}]"#,
        );
        let file = settings_file(&format!(
            r#"{{"bootstrap": {}}}"#,
            serde_json::to_string(&bootstrap.path()).unwrap()
        ));
        let settings = Settings::load(Some(file.path())).unwrap();
        let types = settings.bootstrap_types().unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].table_name, "reaction_data");
        assert_eq!(types[0].schema_definition.len(), 1);
    }
}
