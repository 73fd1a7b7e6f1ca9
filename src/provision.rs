//! Physical tables behind experiment types.
//!
//! Every structural change goes through one transaction together with the
//! registry write that describes it, so the catalog and the live tables never
//! disagree. Table names are validated identifiers and always quoted.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};

use crate::datatype::ColumnType;
use crate::error::{Result, SchemaViolation, StoreError};
use crate::registry::{ExperimentType, NewExperimentType, Registry};
use crate::schema::{
    ColumnDef, SchemaDefinition, is_fixed_column, quote_identifier, validate_against,
    validate_binding_name, validate_schema,
};

/// A provisioned table together with the registry row bound to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhysicalTableHandle {
    pub experiment_type: ExperimentType,
    pub columns: Vec<ColumnDef>,
}

impl PhysicalTableHandle {
    pub fn table_name(&self) -> &str {
        &self.experiment_type.table_name
    }
}

/// One column of a live table, as reported by SQLite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    pub declared_type: String,
    /// `None` for fixed columns whose declared type has no token.
    pub column_type: Option<ColumnType>,
    pub nullable: bool,
    pub fixed: bool,
}

fn create_table_sql(table_name: &str, columns: &[ColumnDef]) -> String {
    let table = quote_identifier(table_name);
    let mut clauses = vec![
        "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "\"experiment_uuid\" CHAR(36) NOT NULL REFERENCES \"experiments\"(\"uuid\")".to_string(),
        "\"participant_id\" VARCHAR(100) NOT NULL".to_string(),
        "\"created_at\" DATETIME NOT NULL".to_string(),
        "\"updated_at\" DATETIME NOT NULL".to_string(),
    ];
    clauses.extend(columns.iter().map(ColumnDef::declaration));
    let mut sql = format!("create table {table} (\n    {}\n);\n", clauses.join(",\n    "));
    for indexed in ["experiment_uuid", "participant_id"] {
        sql.push_str(&format!(
            "create index {} on {table} ({});\n",
            quote_identifier(&format!("{table_name}.{indexed}")),
            quote_identifier(indexed)
        ));
    }
    sql
}

fn already_exists(error: &rusqlite::Error) -> bool {
    matches!(error, rusqlite::Error::SqliteFailure(_, Some(message)) if message.contains("already exists"))
}

/// Validates the declaration, then registers it and creates its table in one
/// immediate transaction. Nothing is issued when validation fails.
pub fn provision(
    connection: &mut Connection,
    declaration: &NewExperimentType,
    now: &DateTime<Utc>,
) -> Result<PhysicalTableHandle> {
    validate_binding_name(&declaration.table_name)?;
    let columns = validate_schema(&declaration.schema_definition)?;

    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let id = Registry::new(&tx).insert_experiment_type(declaration, now)?;
    tx.execute_batch(&create_table_sql(&declaration.table_name, &columns))
        .map_err(|e| {
            if already_exists(&e) {
                StoreError::DuplicateTableBinding(declaration.table_name.clone())
            } else {
                e.into()
            }
        })?;
    let experiment_type = Registry::new(&tx)
        .experiment_type(id)?
        .ok_or_else(|| StoreError::ExperimentTypeNotFound(id.to_string()))?;
    tx.commit()?;

    info!(
        name = %experiment_type.name,
        table = %experiment_type.table_name,
        columns = columns.len(),
        "provisioned experiment type"
    );
    Ok(PhysicalTableHandle {
        experiment_type,
        columns,
    })
}

/// Reflects the live table, in physical column order.
pub fn describe_columns(connection: &Connection, table_name: &str) -> Result<Vec<ColumnDescription>> {
    let mut statement = connection.prepare_cached(
        "select name, type, \"notnull\", pk from pragma_table_info(?) order by cid",
    )?;
    let descriptions = statement
        .query_map([table_name], |row| {
            let name: String = row.get(0)?;
            let declared_type: String = row.get(1)?;
            let not_null: i64 = row.get(2)?;
            let primary_key: i64 = row.get(3)?;
            Ok(ColumnDescription {
                column_type: ColumnType::from_declared(&declared_type),
                fixed: is_fixed_column(&name),
                nullable: not_null == 0 && primary_key == 0,
                name,
                declared_type,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if descriptions.is_empty() {
        return Err(StoreError::ExperimentTypeNotFound(table_name.to_string()));
    }
    Ok(descriptions)
}

/// The custom columns of a live table, read back into column definitions.
pub fn custom_columns(connection: &Connection, table_name: &str) -> Result<Vec<ColumnDef>> {
    describe_columns(connection, table_name)?
        .into_iter()
        .filter(|description| !description.fixed)
        .map(|description| match description.column_type {
            Some(column_type) => Ok(ColumnDef {
                name: description.name,
                column_type,
                nullable: description.nullable,
            }),
            None => Err(StoreError::Persistence(format!(
                "column '{}' of '{table_name}' has undeclared type '{}'",
                description.name, description.declared_type
            ))),
        })
        .collect()
}

/// Appends nullable columns to a provisioned table and records them in the
/// stored schema definition.
pub fn extend(
    connection: &mut Connection,
    experiment_type: &ExperimentType,
    additions: &SchemaDefinition,
    now: &DateTime<Utc>,
) -> Result<PhysicalTableHandle> {
    let existing = custom_columns(connection, &experiment_type.table_name)?;
    let added = validate_against(additions, &existing)?;
    let required: Vec<SchemaViolation> = added
        .iter()
        .filter(|column| !column.nullable)
        .map(|column| SchemaViolation::new(&column.name, "columns added to an existing table must be nullable"))
        .collect();
    if !required.is_empty() {
        return Err(StoreError::SchemaValidation {
            violations: required,
        });
    }

    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let table = quote_identifier(&experiment_type.table_name);
    for column in &added {
        tx.execute_batch(&format!("alter table {table} add column {};", column.declaration()))?;
    }
    let registry = Registry::new(&tx);
    let definition = experiment_type.schema_definition.merged_with(additions);
    registry.update_schema_definition(experiment_type.id, &definition, now)?;
    let experiment_type = registry
        .experiment_type(experiment_type.id)?
        .ok_or_else(|| StoreError::ExperimentTypeNotFound(experiment_type.id.to_string()))?;
    let columns = custom_columns(&tx, &experiment_type.table_name)?;
    tx.commit()?;

    info!(
        name = %experiment_type.name,
        added = added.len(),
        "extended experiment type"
    );
    Ok(PhysicalTableHandle {
        experiment_type,
        columns,
    })
}

/// Drops a table. Callers hold the transaction that also removes its registry row.
pub fn drop_table(connection: &Connection, table_name: &str) -> Result<()> {
    validate_binding_name(table_name)?;
    connection.execute_batch(&format!("drop table if exists {};", quote_identifier(table_name)))?;
    Ok(())
}

/// Removes an experiment type and its table, refusing while experiments use it.
pub fn deprovision(connection: &mut Connection, experiment_type: &ExperimentType) -> Result<()> {
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let registry = Registry::new(&tx);
    let experiments = registry.count_experiments_of_type(experiment_type.id)?;
    if experiments > 0 {
        warn!(name = %experiment_type.name, experiments, "refused to delete experiment type in use");
        return Err(StoreError::InUse {
            entity: format!("experiment type '{}'", experiment_type.name),
            detail: format!("{experiments} experiments still reference it"),
        });
    }
    registry.delete_experiment_type(experiment_type.id)?;
    drop_table(&tx, &experiment_type.table_name)?;
    tx.commit()?;
    info!(name = %experiment_type.name, table = %experiment_type.table_name, "deleted experiment type");
    Ok(())
}
