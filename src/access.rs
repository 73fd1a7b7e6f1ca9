//! Type checked CRUD against one dynamic table.
//!
//! The accessor only knows the table through its binding name and the custom
//! column definitions reflected from it. Identifiers are quoted, values are
//! always bound parameters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::datatype::{ColumnType, format_timestamp, json_type_name, now, parse_datetime, parse_timestamp};
use crate::error::{Constraint, Result, StoreError, constraint_violation};
use crate::registry::{Conditions, ExperimentType};
use crate::schema::{
    ColumnDef, FIXED_COLUMNS, is_fixed_column, quote_identifier, validate_binding_name, validate_schema,
};

pub const MAX_PARTICIPANT_ID_LENGTH: usize = 100;

/// Page size bounds applied to every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_page_size: usize,
    pub default_page_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_page_size: 1000,
            default_page_size: 100,
        }
    }
}

impl Limits {
    /// Effective limit for a requested one.
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .min(self.max_page_size)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Page {
            offset,
            limit: Some(limit),
        }
    }
}

/// Row selection. Every present field narrows the result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowFilter {
    /// Column equality; a null value matches rows where the column is null.
    #[serde(default)]
    pub equals: Map<String, Value>,
    pub experiment_uuids: Option<Vec<Uuid>>,
    pub participant_id: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
}

impl RowFilter {
    pub fn for_experiment(experiment_uuid: Uuid) -> Self {
        RowFilter {
            experiment_uuids: Some(vec![experiment_uuid]),
            ..RowFilter::default()
        }
    }
    pub fn with_equal(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(column.into(), value.into());
        self
    }
    pub fn with_participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }
}

/// Flat query form: column values, date bounds, participant and paging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataQuery {
    #[serde(default)]
    pub filters: Map<String, Value>,
    pub participant_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl DataQuery {
    pub fn into_parts(self, experiment_uuid: Option<Uuid>) -> (RowFilter, Page) {
        (
            RowFilter {
                equals: self.filters,
                experiment_uuids: experiment_uuid.map(|uuid| vec![uuid]),
                participant_id: self.participant_id,
                created_after: self.start_date,
                created_before: self.end_date,
            },
            Page {
                offset: self.offset,
                limit: self.limit,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataRow {
    pub id: i64,
    pub experiment_uuid: Uuid,
    pub participant_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl DataRow {
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }
}

fn conversion_error(index: usize, e: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
}

fn integer_param(value: usize) -> SqlValue {
    SqlValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

pub struct DataAccessor<'db> {
    db: &'db Connection,
    table_name: String,
    columns: Vec<ColumnDef>,
    limits: Limits,
}

impl<'db> DataAccessor<'db> {
    pub fn new(
        connection: &'db Connection,
        table_name: impl Into<String>,
        columns: Vec<ColumnDef>,
        limits: Limits,
    ) -> Result<DataAccessor<'db>> {
        let table_name = table_name.into();
        validate_binding_name(&table_name)?;
        Ok(DataAccessor {
            db: connection,
            table_name,
            columns,
            limits,
        })
    }

    /// Accessor for the table bound to `experiment_type`, checking values
    /// against its stored schema definition.
    pub fn for_type(
        connection: &'db Connection,
        experiment_type: &ExperimentType,
        limits: Limits,
    ) -> Result<DataAccessor<'db>> {
        let columns = validate_schema(&experiment_type.schema_definition)?;
        DataAccessor::new(connection, experiment_type.table_name.as_str(), columns, limits)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    fn table(&self) -> String {
        quote_identifier(&self.table_name)
    }

    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    fn select_list(&self) -> String {
        FIXED_COLUMNS
            .iter()
            .copied()
            .chain(self.columns.iter().map(|column| column.name.as_str()))
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn row(&self, row: &Row) -> rusqlite::Result<DataRow> {
        let uuid: String = row.get(1)?;
        let created_at: String = row.get(3)?;
        let updated_at: String = row.get(4)?;
        let mut values = Map::with_capacity(self.columns.len());
        for (offset, column) in self.columns.iter().enumerate() {
            let value = column
                .column_type
                .decode(row.get_ref(FIXED_COLUMNS.len() + offset)?);
            values.insert(column.name.clone(), value);
        }
        Ok(DataRow {
            id: row.get(0)?,
            experiment_uuid: Uuid::parse_str(&uuid).map_err(|e| {
                conversion_error(1, StoreError::Persistence(format!("malformed uuid '{uuid}': {e}")))
            })?,
            participant_id: row.get(2)?,
            created_at: parse_timestamp(&created_at).map_err(|e| conversion_error(3, e))?,
            updated_at: parse_timestamp(&updated_at).map_err(|e| conversion_error(4, e))?,
            values,
        })
    }

    /// Coerces the value written to, or compared with, a custom column.
    fn coerce(&self, column: &ColumnDef, value: &Value, nullable: bool) -> Result<SqlValue> {
        column.column_type.coerce(&column.name, value, nullable)
    }

    fn unknown_columns<'a>(&self, keys: impl Iterator<Item = &'a String>, allow_fixed: bool) -> Result<()> {
        let unknown: Vec<String> = keys
            .filter(|key| !(allow_fixed && is_fixed_column(key)) && self.column(key).is_none())
            .cloned()
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(StoreError::UnknownColumn { columns: unknown })
        }
    }

    fn fixed_value(column: &str, value: &Value) -> Result<SqlValue> {
        let fixed = column.to_ascii_lowercase();
        let mismatch = |expected: &str| StoreError::TypeMismatch {
            column: column.to_string(),
            expected: expected.to_string(),
            found: json_type_name(value).to_string(),
        };
        match fixed.as_str() {
            "id" => ColumnType::Integer.coerce(column, value, false),
            "experiment_uuid" => value
                .as_str()
                .and_then(|text| Uuid::parse_str(text).ok())
                .map(|uuid| SqlValue::Text(uuid.to_string()))
                .ok_or_else(|| mismatch("UUID")),
            "participant_id" => value
                .as_str()
                .map(|text| SqlValue::Text(text.to_string()))
                .ok_or_else(|| mismatch("STRING")),
            _ => value
                .as_str()
                .and_then(parse_datetime)
                .map(|time| SqlValue::Text(format_timestamp(&time)))
                .ok_or_else(|| mismatch("DATETIME")),
        }
    }

    fn conditions(&self, filter: &RowFilter) -> Result<Conditions> {
        self.unknown_columns(filter.equals.keys(), true)?;
        let mut conditions = Conditions::default();
        for (name, value) in &filter.equals {
            let column = self.column(name);
            let quoted = match column {
                Some(column) => quote_identifier(&column.name),
                None => quote_identifier(&name.to_ascii_lowercase()),
            };
            if value.is_null() {
                conditions.push_clause(format!("{quoted} is null"));
                continue;
            }
            let bound = match column {
                Some(column) => self.coerce(column, value, true)?,
                None => Self::fixed_value(name, value)?,
            };
            conditions.push(format!("{quoted} = ?"), [bound]);
        }
        if let Some(uuids) = &filter.experiment_uuids {
            if uuids.is_empty() {
                conditions.push_clause("0");
            } else {
                let placeholders = vec!["?"; uuids.len()].join(", ");
                conditions.push(
                    format!("\"experiment_uuid\" in ({placeholders})"),
                    uuids.iter().map(|uuid| SqlValue::Text(uuid.to_string())),
                );
            }
        }
        if let Some(participant_id) = &filter.participant_id {
            conditions.push("\"participant_id\" = ?", [SqlValue::Text(participant_id.clone())]);
        }
        if let Some(after) = &filter.created_after {
            conditions.push("\"created_at\" >= ?", [SqlValue::Text(format_timestamp(after))]);
        }
        if let Some(before) = &filter.created_before {
            conditions.push("\"created_at\" <= ?", [SqlValue::Text(format_timestamp(before))]);
        }
        Ok(conditions)
    }

    fn scoped(&self, id: i64, experiment_uuid: Option<&Uuid>) -> Conditions {
        let mut conditions = Conditions::default();
        conditions.push("\"id\" = ?", [SqlValue::Integer(id)]);
        if let Some(uuid) = experiment_uuid {
            conditions.push("\"experiment_uuid\" = ?", [SqlValue::Text(uuid.to_string())]);
        }
        conditions
    }

    // ------------- Operations -------------

    pub fn insert(
        &self,
        experiment_uuid: &Uuid,
        participant_id: &str,
        values: &Map<String, Value>,
    ) -> Result<DataRow> {
        let length = participant_id.chars().count();
        if participant_id.trim().is_empty() || length > MAX_PARTICIPANT_ID_LENGTH {
            return Err(StoreError::invalid(
                "participant_id",
                format!("must be 1 to {MAX_PARTICIPANT_ID_LENGTH} characters, got {length}"),
            ));
        }
        self.unknown_columns(values.keys(), false)?;

        let mut names = vec![
            "\"experiment_uuid\"".to_string(),
            "\"participant_id\"".to_string(),
            "\"created_at\"".to_string(),
            "\"updated_at\"".to_string(),
        ];
        let stamp = format_timestamp(&now());
        let mut bound = vec![
            SqlValue::Text(experiment_uuid.to_string()),
            SqlValue::Text(participant_id.to_string()),
            SqlValue::Text(stamp.clone()),
            SqlValue::Text(stamp),
        ];
        for column in &self.columns {
            match values.get(&column.name) {
                Some(value) => {
                    bound.push(self.coerce(column, value, column.nullable)?);
                    names.push(quote_identifier(&column.name));
                }
                None if !column.nullable => {
                    return Err(StoreError::TypeMismatch {
                        column: column.name.clone(),
                        expected: format!("non-null {}", column.column_type),
                        found: "missing".to_string(),
                    });
                }
                None => {}
            }
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "insert into {} ({}) values ({placeholders})",
            self.table(),
            names.join(", ")
        );
        let inserted = self.db.prepare_cached(&sql)?.execute(params_from_iter(bound));
        if let Err(e) = inserted {
            return Err(match constraint_violation(&e) {
                Some((Constraint::ForeignKey, _)) => StoreError::ExperimentNotFound(*experiment_uuid),
                _ => e.into(),
            });
        }
        let id = self.db.last_insert_rowid();
        debug!(table = %self.table_name, id, "inserted row");
        self.get(id, None)
    }

    pub fn find(&self, id: i64, experiment_uuid: Option<&Uuid>) -> Result<Option<DataRow>> {
        let conditions = self.scoped(id, experiment_uuid);
        let sql = format!("select {} from {}{}", self.select_list(), self.table(), conditions.sql());
        Ok(self
            .db
            .prepare_cached(&sql)?
            .query_row(params_from_iter(conditions.params()), |row| self.row(row))
            .optional()?)
    }

    pub fn get(&self, id: i64, experiment_uuid: Option<&Uuid>) -> Result<DataRow> {
        self.find(id, experiment_uuid)?.ok_or(StoreError::RowNotFound(id))
    }

    /// Rows matching `filter`, ordered by id.
    pub fn list(&self, filter: &RowFilter, page: &Page) -> Result<Vec<DataRow>> {
        let conditions = self.conditions(filter)?;
        let limit = self.limits.clamp(page.limit);
        let sql = format!(
            "select {} from {}{} order by \"id\" limit ? offset ?",
            self.select_list(),
            self.table(),
            conditions.sql()
        );
        let params = conditions
            .params()
            .iter()
            .cloned()
            .chain([integer_param(limit), integer_param(page.offset)]);
        let mut statement = self.db.prepare(&sql)?;
        let rows = statement
            .query_map(params_from_iter(params), |row| self.row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(table = %self.table_name, rows = rows.len(), "listed rows");
        Ok(rows)
    }

    pub fn query(&self, query: DataQuery, experiment_uuid: Option<Uuid>) -> Result<Vec<DataRow>> {
        let (filter, page) = query.into_parts(experiment_uuid);
        self.list(&filter, &page)
    }

    pub fn update(
        &self,
        id: i64,
        participant_id: &str,
        values: &Map<String, Value>,
        experiment_uuid: Option<&Uuid>,
    ) -> Result<DataRow> {
        let immutable: Vec<String> = values.keys().filter(|key| is_fixed_column(key)).cloned().collect();
        if !immutable.is_empty() {
            return Err(StoreError::ImmutableColumn { columns: immutable });
        }
        self.unknown_columns(values.keys(), false)?;
        let mut assignments = Vec::with_capacity(values.len() + 1);
        let mut bound = Vec::with_capacity(values.len() + 2);
        for column in &self.columns {
            if let Some(value) = values.get(&column.name) {
                bound.push(self.coerce(column, value, column.nullable)?);
                assignments.push(format!("{} = ?", quote_identifier(&column.name)));
            }
        }

        let current = self.get(id, experiment_uuid)?;
        if current.participant_id != participant_id {
            return Err(StoreError::ParticipantMismatch {
                row_id: id,
                participant_id: participant_id.to_string(),
            });
        }
        // updated_at must move forward even within one clock tick
        let stamp = now().max(current.updated_at + chrono::Duration::microseconds(1));
        assignments.push("\"updated_at\" = ?".to_string());
        bound.push(SqlValue::Text(format_timestamp(&stamp)));
        bound.push(SqlValue::Integer(id));

        let sql = format!(
            "update {} set {} where \"id\" = ?",
            self.table(),
            assignments.join(", ")
        );
        self.db.prepare_cached(&sql)?.execute(params_from_iter(bound))?;
        debug!(table = %self.table_name, id, columns = values.len(), "updated row");
        self.get(id, None)
    }

    pub fn delete(&self, id: i64, experiment_uuid: Option<&Uuid>) -> Result<()> {
        let conditions = self.scoped(id, experiment_uuid);
        let sql = format!("delete from {}{}", self.table(), conditions.sql());
        let deleted = self
            .db
            .prepare_cached(&sql)?
            .execute(params_from_iter(conditions.params()))?;
        if deleted == 0 {
            return Err(StoreError::RowNotFound(id));
        }
        debug!(table = %self.table_name, id, "deleted row");
        Ok(())
    }

    pub fn count(&self, filter: &RowFilter) -> Result<u64> {
        let conditions = self.conditions(filter)?;
        let sql = format!("select count(*) from {}{}", self.table(), conditions.sql());
        let count: i64 = self
            .db
            .prepare(&sql)?
            .query_row(params_from_iter(conditions.params()), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Row counts per experiment; experiments without matching rows are absent.
    pub fn count_by_experiment(&self, filter: &RowFilter) -> Result<BTreeMap<Uuid, u64>> {
        let conditions = self.conditions(filter)?;
        let sql = format!(
            "select \"experiment_uuid\", count(*) from {}{} group by \"experiment_uuid\"",
            self.table(),
            conditions.sql()
        );
        let mut statement = self.db.prepare(&sql)?;
        let mut rows = statement.query(params_from_iter(conditions.params()))?;
        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let uuid: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let uuid = Uuid::parse_str(&uuid)
                .map_err(|e| StoreError::Persistence(format!("malformed uuid '{uuid}': {e}")))?;
            counts.insert(uuid, count as u64);
        }
        Ok(counts)
    }
}
