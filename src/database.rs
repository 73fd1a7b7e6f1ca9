//! The `Database` wires the registry, the provisioner, the data accessor and
//! the aggregation engine around one SQLite connection.
//!
//! Callers address data through experiment uuids only; the table an experiment
//! writes to is always resolved through the registry.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{DataAccessor, DataQuery, DataRow, Limits, Page, RowFilter};
use crate::aggregate::{self, AggregateRequest, AggregateResult};
use crate::datatype::now;
use crate::error::{Result, StoreError};
use crate::provision::{self, ColumnDescription};
use crate::registry::{
    BoundExperiment, Experiment, ExperimentSearch, ExperimentType, ExperimentTypeUpdate,
    ExperimentUpdate, NewExperiment, NewExperimentType, NewTag, Registry, Tag, TagUpdate, TextSearch,
};
use crate::schema::SchemaDefinition;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub mode: PersistenceMode,
    pub busy_timeout: Duration,
    pub limits: Limits,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            mode: PersistenceMode::InMemory,
            busy_timeout: Duration::from_millis(5000),
            limits: Limits::default(),
        }
    }
}

impl DatabaseOptions {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        DatabaseOptions {
            mode: PersistenceMode::File(path.into()),
            ..DatabaseOptions::default()
        }
    }
}

#[derive(Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
    limits: Limits,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Database> {
        Database::open(DatabaseOptions {
            mode,
            ..DatabaseOptions::default()
        })
    }

    pub fn open(options: DatabaseOptions) -> Result<Database> {
        let connection = match &options.mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => {
                let connection = Connection::open(path)?;
                connection.busy_timeout(options.busy_timeout)?;
                let journal: String = connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                debug!(path = %path.display(), journal = %journal, "opened database file");
                connection
            }
        };
        connection.pragma_update(None, "foreign_keys", true)?;
        Registry::initialize(&connection)?;
        Ok(Database {
            connection: Arc::new(Mutex::new(connection)),
            limits: options.limits,
        })
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    // ------------- Experiment types -------------

    pub fn create_experiment_type(&self, declaration: &NewExperimentType) -> Result<ExperimentType> {
        let mut connection = self.lock()?;
        match provision::provision(&mut connection, declaration, &now()) {
            Ok(handle) => Ok(handle.experiment_type),
            Err(e) => {
                warn!(name = %declaration.name, table = %declaration.table_name, error = %e, "provisioning refused");
                Err(e)
            }
        }
    }

    pub fn experiment_type(&self, id: i64) -> Result<ExperimentType> {
        let connection = self.lock()?;
        Registry::new(&connection)
            .experiment_type(id)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(id.to_string()))
    }

    pub fn experiment_type_by_name(&self, name: &str) -> Result<ExperimentType> {
        let connection = self.lock()?;
        Registry::new(&connection)
            .experiment_type_by_name(name)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(name.to_string()))
    }

    pub fn experiment_types(&self, skip: usize, limit: Option<usize>) -> Result<Vec<ExperimentType>> {
        let connection = self.lock()?;
        Registry::new(&connection).experiment_types(skip, self.limits.clamp(limit))
    }

    pub fn update_experiment_type(&self, id: i64, update: &ExperimentTypeUpdate) -> Result<ExperimentType> {
        let connection = self.lock()?;
        let registry = Registry::new(&connection);
        registry.update_experiment_type(id, update, &now())?;
        registry
            .experiment_type(id)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(id.to_string()))
    }

    /// Appends nullable columns to the type's table.
    pub fn extend_experiment_type(&self, id: i64, additions: &SchemaDefinition) -> Result<ExperimentType> {
        let mut connection = self.lock()?;
        let experiment_type = Registry::new(&connection)
            .experiment_type(id)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(id.to_string()))?;
        Ok(provision::extend(&mut connection, &experiment_type, additions, &now())?.experiment_type)
    }

    pub fn delete_experiment_type(&self, id: i64) -> Result<()> {
        let mut connection = self.lock()?;
        let experiment_type = Registry::new(&connection)
            .experiment_type(id)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(id.to_string()))?;
        provision::deprovision(&mut connection, &experiment_type)
    }

    pub fn describe_columns(&self, experiment_type_id: i64) -> Result<Vec<ColumnDescription>> {
        let connection = self.lock()?;
        let experiment_type = Registry::new(&connection)
            .experiment_type(experiment_type_id)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(experiment_type_id.to_string()))?;
        provision::describe_columns(&connection, &experiment_type.table_name)
    }

    pub fn describe_columns_by_name(&self, name: &str) -> Result<Vec<ColumnDescription>> {
        let connection = self.lock()?;
        let experiment_type = Registry::new(&connection)
            .experiment_type_by_name(name)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(name.to_string()))?;
        provision::describe_columns(&connection, &experiment_type.table_name)
    }

    pub fn describe_experiment_columns(&self, experiment_uuid: &Uuid) -> Result<Vec<ColumnDescription>> {
        let connection = self.lock()?;
        let bound = resolve(&connection, experiment_uuid)?;
        provision::describe_columns(&connection, &bound.table_name)
    }

    // ------------- Experiments -------------

    pub fn create_experiment(&self, experiment: &NewExperiment) -> Result<Experiment> {
        let connection = self.lock()?;
        let registry = Registry::new(&connection);
        if registry.experiment_type(experiment.experiment_type_id)?.is_none() {
            return Err(StoreError::ExperimentTypeNotFound(experiment.experiment_type_id.to_string()));
        }
        let created = registry.insert_experiment(experiment, &now())?;
        info!(uuid = %created.uuid, experiment_type_id = created.experiment_type_id, "created experiment");
        Ok(created)
    }

    pub fn experiment(&self, uuid: &Uuid) -> Result<BoundExperiment> {
        let connection = self.lock()?;
        resolve(&connection, uuid)
    }

    pub fn experiments(&self, search: &ExperimentSearch, skip: usize, limit: Option<usize>) -> Result<Vec<BoundExperiment>> {
        let connection = self.lock()?;
        aggregate::search_experiments(&connection, search, skip, limit, self.limits)
    }

    pub fn update_experiment(&self, uuid: &Uuid, update: &ExperimentUpdate) -> Result<Experiment> {
        let connection = self.lock()?;
        Registry::new(&connection).update_experiment(uuid, update, &now())?;
        Ok(resolve(&connection, uuid)?.experiment)
    }

    pub fn delete_experiment(&self, uuid: &Uuid) -> Result<()> {
        let connection = self.lock()?;
        match Registry::new(&connection).delete_experiment(uuid) {
            Ok(()) => {
                info!(uuid = %uuid, "deleted experiment");
                Ok(())
            }
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "experiment deletion refused");
                Err(e)
            }
        }
    }

    // ------------- Tags -------------

    pub fn create_tag(&self, tag: &NewTag) -> Result<Tag> {
        let connection = self.lock()?;
        Registry::new(&connection).insert_tag(tag, &now())
    }

    pub fn tag(&self, id: i64) -> Result<Tag> {
        let connection = self.lock()?;
        Registry::new(&connection)
            .tag(id)?
            .ok_or_else(|| StoreError::TagNotFound(id.to_string()))
    }

    pub fn tag_by_name(&self, name: &str) -> Result<Tag> {
        let connection = self.lock()?;
        Registry::new(&connection)
            .tag_by_name(name)?
            .ok_or_else(|| StoreError::TagNotFound(name.to_string()))
    }

    pub fn tags(&self, skip: usize, limit: Option<usize>) -> Result<Vec<Tag>> {
        let connection = self.lock()?;
        Registry::new(&connection).tags(skip, self.limits.clamp(limit))
    }

    pub fn update_tag(&self, id: i64, update: &TagUpdate) -> Result<Tag> {
        let connection = self.lock()?;
        let registry = Registry::new(&connection);
        registry.update_tag(id, update, &now())?;
        registry
            .tag(id)?
            .ok_or_else(|| StoreError::TagNotFound(id.to_string()))
    }

    pub fn delete_tag(&self, id: i64) -> Result<()> {
        let connection = self.lock()?;
        Registry::new(&connection).delete_tag(id)
    }

    // ------------- Data -------------

    pub fn insert_data(&self, experiment_uuid: &Uuid, participant_id: &str, values: &Map<String, Value>) -> Result<DataRow> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        let row = accessor(&tx, experiment_uuid, self.limits)?.insert(experiment_uuid, participant_id, values)?;
        tx.commit()?;
        Ok(row)
    }

    pub fn data_row(&self, experiment_uuid: &Uuid, id: i64) -> Result<DataRow> {
        let connection = self.lock()?;
        accessor(&connection, experiment_uuid, self.limits)?.get(id, Some(experiment_uuid))
    }

    /// Lists rows of one experiment; any experiment set in `filter` is replaced.
    pub fn list_data(&self, experiment_uuid: &Uuid, filter: &RowFilter, page: &Page) -> Result<Vec<DataRow>> {
        let connection = self.lock()?;
        let filter = RowFilter {
            experiment_uuids: Some(vec![*experiment_uuid]),
            ..filter.clone()
        };
        accessor(&connection, experiment_uuid, self.limits)?.list(&filter, page)
    }

    pub fn query_data(&self, experiment_uuid: &Uuid, query: DataQuery) -> Result<Vec<DataRow>> {
        let connection = self.lock()?;
        accessor(&connection, experiment_uuid, self.limits)?.query(query, Some(*experiment_uuid))
    }

    pub fn update_data(
        &self,
        experiment_uuid: &Uuid,
        id: i64,
        participant_id: &str,
        values: &Map<String, Value>,
    ) -> Result<DataRow> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = accessor(&tx, experiment_uuid, self.limits)?.update(
            id,
            participant_id,
            values,
            Some(experiment_uuid),
        )?;
        tx.commit()?;
        Ok(row)
    }

    pub fn delete_data(&self, experiment_uuid: &Uuid, id: i64) -> Result<()> {
        let connection = self.lock()?;
        accessor(&connection, experiment_uuid, self.limits)?.delete(id, Some(experiment_uuid))
    }

    pub fn count_data(&self, experiment_uuid: &Uuid, filter: &RowFilter) -> Result<u64> {
        let connection = self.lock()?;
        let filter = RowFilter {
            experiment_uuids: Some(vec![*experiment_uuid]),
            ..filter.clone()
        };
        accessor(&connection, experiment_uuid, self.limits)?.count(&filter)
    }

    // ------------- Search -------------

    pub fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateResult> {
        let connection = self.lock()?;
        aggregate::aggregate(&connection, request, self.limits)
    }

    pub fn search_experiment_types(&self, search: &TextSearch, skip: usize, limit: Option<usize>) -> Result<Vec<ExperimentType>> {
        let connection = self.lock()?;
        aggregate::search_experiment_types(&connection, search, skip, limit, self.limits)
    }

    pub fn search_tags(&self, search: &TextSearch, skip: usize, limit: Option<usize>) -> Result<Vec<Tag>> {
        let connection = self.lock()?;
        aggregate::search_tags(&connection, search, skip, limit, self.limits)
    }
}

fn resolve(connection: &Connection, uuid: &Uuid) -> Result<BoundExperiment> {
    Registry::new(connection)
        .experiment(uuid)?
        .ok_or(StoreError::ExperimentNotFound(*uuid))
}

/// Accessor for the table the experiment's type is bound to.
fn accessor<'db>(connection: &'db Connection, uuid: &Uuid, limits: Limits) -> Result<DataAccessor<'db>> {
    let bound = resolve(connection, uuid)?;
    let type_id = bound.experiment.experiment_type_id;
    let experiment_type = Registry::new(connection)
        .experiment_type(type_id)?
        .ok_or_else(|| StoreError::ExperimentTypeNotFound(type_id.to_string()))?;
    DataAccessor::for_type(connection, &experiment_type, limits)
}
