// used for persistence
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Value as SqlValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::datatype::{format_timestamp, parse_timestamp};
use crate::error::{Constraint, Result, StoreError, constraint_violation};
use crate::schema::SchemaDefinition;

/// Upper bound on the number of tags one experiment may carry.
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LENGTH: usize = 50;
pub const MAX_NAME_LENGTH: usize = 100;

// ------------- Records -------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentType {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub table_name: String,
    pub schema_definition: SchemaDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Declaration of a new experiment type, as received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct NewExperimentType {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub table_name: String,
    #[serde(default)]
    pub schema_definition: SchemaDefinition,
}

impl NewExperimentType {
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        schema_definition: SchemaDefinition,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            table_name: table_name.into(),
            schema_definition,
        }
    }
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Metadata changes; the schema itself only grows through `extend`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExperimentTypeUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub uuid: Uuid,
    pub experiment_type_id: i64,
    pub description: String,
    pub tags: Vec<String>,
    pub additional_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewExperiment {
    pub experiment_type_id: i64,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub additional_data: Map<String, Value>,
}

impl NewExperiment {
    pub fn new(experiment_type_id: i64, description: impl Into<String>) -> Self {
        Self {
            experiment_type_id,
            description: description.into(),
            tags: Vec::new(),
            additional_data: Map::new(),
        }
    }
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_data.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExperimentUpdate {
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub additional_data: Option<Map<String, Value>>,
}

/// An experiment together with the type facts needed to reach its rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundExperiment {
    pub experiment: Experiment,
    pub type_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTag {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Experiment level search predicate shared by searches and aggregation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExperimentSearch {
    /// Empty means no tag predicate.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Superset semantics when true, non-empty intersection when false.
    #[serde(default = "default_match_all")]
    pub match_all: bool,
    /// Case-insensitive substring of the description or the type name.
    pub text: Option<String>,
    pub experiment_type_id: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

fn default_match_all() -> bool {
    true
}

impl ExperimentSearch {
    pub fn tagged<I, S>(tags: I, match_all: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            match_all,
            ..Self::default()
        }
    }
}

/// Text plus creation-time window, used by the catalog searches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextSearch {
    pub text: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

// ------------- Validation -------------

fn check_name(field: &'static str, name: &str) -> Result<()> {
    let length = name.chars().count();
    if name.trim().is_empty() {
        return Err(StoreError::invalid(field, "must not be empty"));
    }
    if length > MAX_NAME_LENGTH {
        return Err(StoreError::invalid(
            field,
            format!("at most {MAX_NAME_LENGTH} characters allowed, got {length}"),
        ));
    }
    Ok(())
}

/// Tags are a small set: bounded, non-empty names, no repeats.
pub fn check_tags(tags: &[String]) -> Result<()> {
    if tags.len() > MAX_TAGS {
        return Err(StoreError::invalid(
            "tags",
            format!("at most {MAX_TAGS} tags allowed, got {}", tags.len()),
        ));
    }
    for (position, tag) in tags.iter().enumerate() {
        if tag.trim().is_empty() || tag.chars().count() > MAX_TAG_LENGTH {
            return Err(StoreError::invalid(
                "tags",
                format!("'{tag}' must be 1 to {MAX_TAG_LENGTH} characters"),
            ));
        }
        if tags[..position].contains(tag) {
            return Err(StoreError::invalid("tags", format!("'{tag}' appears more than once")));
        }
    }
    Ok(())
}

// ------------- Row mapping -------------

fn conversion_error(index: usize, e: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
}

fn timestamp_at(row: &Row, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(index)?;
    parse_timestamp(&text).map_err(|e| conversion_error(index, e))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row, index: usize) -> rusqlite::Result<T> {
    let text: String = row.get(index)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(index, e.into()))
}

const EXPERIMENT_TYPE_COLUMNS: &str =
    "t.id, t.name, t.description, t.table_name, t.schema_definition, t.created_at, t.updated_at";

fn experiment_type_from_row(row: &Row) -> rusqlite::Result<ExperimentType> {
    let definition: String = row.get(4)?;
    Ok(ExperimentType {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        table_name: row.get(3)?,
        schema_definition: SchemaDefinition::from_json(&definition)
            .map_err(|e| conversion_error(4, e))?,
        created_at: timestamp_at(row, 5)?,
        updated_at: timestamp_at(row, 6)?,
    })
}

const EXPERIMENT_COLUMNS: &str = "e.uuid, e.experiment_type_id, e.description, e.tags, \
     e.additional_data, e.created_at, e.updated_at";

fn experiment_from_row(row: &Row) -> rusqlite::Result<Experiment> {
    let uuid: String = row.get(0)?;
    Ok(Experiment {
        uuid: Uuid::parse_str(&uuid).map_err(|e| {
            conversion_error(0, StoreError::Persistence(format!("malformed uuid '{uuid}': {e}")))
        })?,
        experiment_type_id: row.get(1)?,
        description: row.get(2)?,
        tags: json_at(row, 3)?,
        additional_data: json_at(row, 4)?,
        created_at: timestamp_at(row, 5)?,
        updated_at: timestamp_at(row, 6)?,
    })
}

fn bound_experiment_from_row(row: &Row) -> rusqlite::Result<BoundExperiment> {
    Ok(BoundExperiment {
        experiment: experiment_from_row(row)?,
        type_name: row.get(7)?,
        table_name: row.get(8)?,
    })
}

fn tag_from_row(row: &Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: timestamp_at(row, 3)?,
        updated_at: timestamp_at(row, 4)?,
    })
}

fn page_params(skip: usize, limit: usize) -> [SqlValue; 2] {
    [
        SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)),
        SqlValue::Integer(i64::try_from(skip).unwrap_or(i64::MAX)),
    ]
}

/// Accumulates `where` clauses with their positional parameters.
#[derive(Debug, Default)]
pub(crate) struct Conditions {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl Conditions {
    /// Adds a clause whose `?` placeholders take `values` in order.
    pub(crate) fn push(&mut self, clause: impl Into<String>, values: impl IntoIterator<Item = SqlValue>) {
        self.clauses.push(clause.into());
        self.params.extend(values);
    }
    pub(crate) fn push_clause(&mut self, clause: impl Into<String>) {
        self.clauses.push(clause.into());
    }
    pub(crate) fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" where {}", self.clauses.join(" and "))
        }
    }
    pub(crate) fn params(&self) -> &[SqlValue] {
        &self.params
    }
    fn created_between(
        &mut self,
        column: &str,
        after: Option<&DateTime<Utc>>,
        before: Option<&DateTime<Utc>>,
    ) {
        if let Some(after) = after {
            self.push(format!("{column} >= ?"), [SqlValue::Text(format_timestamp(after))]);
        }
        if let Some(before) = before {
            self.push(format!("{column} <= ?"), [SqlValue::Text(format_timestamp(before))]);
        }
    }
    fn text_in(&mut self, columns: &[&str], text: Option<&String>) {
        if let Some(text) = text.map(|t| t.trim()).filter(|t| !t.is_empty()) {
            let alternatives: Vec<String> = columns
                .iter()
                .map(|column| format!("instr(fold_case(coalesce({column}, '')), ?) > 0"))
                .collect();
            let needle = text.to_lowercase();
            self.push(
                format!("({})", alternatives.join(" or ")),
                columns.iter().map(|_| SqlValue::Text(needle.clone())),
            );
        }
    }
}

/// Registers `fold_case(text)`, a Unicode lowercase. SQLite's own `lower()`
/// only folds ASCII.
fn register_fold_case(connection: &Connection) -> Result<()> {
    connection.create_scalar_function(
        "fold_case",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let folded = match ctx.get_raw(0) {
                ValueRef::Text(t) => Some(String::from_utf8_lossy(t).to_lowercase()),
                ValueRef::Integer(i) => Some(i.to_string()),
                ValueRef::Real(f) => Some(f.to_string()),
                ValueRef::Null | ValueRef::Blob(_) => None,
            };
            Ok(folded)
        },
    )?;
    Ok(())
}

// ------------- Registry -------------

/// Catalog of experiment types, experiments and tags kept in the same SQLite
/// database as the dynamic tables.
pub struct Registry<'db> {
    pub db: &'db Connection,
}

impl<'db> Registry<'db> {
    pub fn new(connection: &'db Connection) -> Registry<'db> {
        Registry { db: connection }
    }

    /// Creates the registry tables when they do not exist yet.
    pub fn initialize(connection: &Connection) -> Result<()> {
        register_fold_case(connection)?;
        connection.execute_batch(
            "
            create table if not exists experiment_types (
                id integer not null,
                name text not null,
                description text null,
                table_name text not null,
                schema_definition text not null,
                created_at text not null,
                updated_at text not null,
                constraint referenceable_experiment_type primary key (
                    id autoincrement
                ),
                constraint unique_experiment_type_name unique (
                    name
                ),
                constraint unique_experiment_type_table_name unique (
                    table_name
                )
            );
            create table if not exists experiments (
                uuid text not null,
                experiment_type_id integer not null,
                description text not null,
                tags text not null default '[]',
                additional_data text not null default '{}',
                created_at text not null,
                updated_at text not null,
                constraint referenceable_experiment primary key (
                    uuid
                ),
                constraint experiment_has_type foreign key (
                    experiment_type_id
                ) references experiment_types(id)
            );
            create index if not exists experiments_by_type on experiments (
                experiment_type_id
            );
            create table if not exists tags (
                id integer not null,
                name text not null,
                description text null,
                created_at text not null,
                updated_at text not null,
                constraint referenceable_tag primary key (
                    id autoincrement
                ),
                constraint unique_tag_name unique (
                    name
                )
            );
            ",
        )?;
        Ok(())
    }

    // ------------- Experiment types -------------

    /// Inserts the registry row of a new type. Uniqueness of name and binding
    /// is decided here, by the constraints, never by a prior lookup.
    pub fn insert_experiment_type(&self, declaration: &NewExperimentType, now: &DateTime<Utc>) -> Result<i64> {
        check_name("name", &declaration.name)?;
        let stamp = format_timestamp(now);
        let inserted = self
            .db
            .prepare_cached(
                "
                insert into experiment_types (
                    name,
                    description,
                    table_name,
                    schema_definition,
                    created_at,
                    updated_at
                ) values (?, ?, ?, ?, ?, ?)
            ",
            )?
            .execute(params![
                &declaration.name,
                &declaration.description,
                &declaration.table_name,
                declaration.schema_definition.to_json()?,
                &stamp,
                &stamp
            ]);
        match inserted {
            Ok(_) => Ok(self.db.last_insert_rowid()),
            Err(e) => Err(match constraint_violation(&e) {
                Some((Constraint::Unique, message)) if message.contains("table_name") => {
                    StoreError::DuplicateTableBinding(declaration.table_name.clone())
                }
                Some((Constraint::Unique, _)) => StoreError::DuplicateName {
                    entity: "experiment type",
                    name: declaration.name.clone(),
                },
                _ => e.into(),
            }),
        }
    }

    fn experiment_type_where(&self, condition: &str, value: SqlValue) -> Result<Option<ExperimentType>> {
        let sql = format!("select {EXPERIMENT_TYPE_COLUMNS} from experiment_types t where {condition}");
        Ok(self
            .db
            .prepare_cached(&sql)?
            .query_row([value], experiment_type_from_row)
            .optional()?)
    }

    pub fn experiment_type(&self, id: i64) -> Result<Option<ExperimentType>> {
        self.experiment_type_where("t.id = ?", SqlValue::Integer(id))
    }

    pub fn experiment_type_by_name(&self, name: &str) -> Result<Option<ExperimentType>> {
        self.experiment_type_where("t.name = ?", SqlValue::Text(name.to_string()))
    }

    pub fn experiment_type_by_table_name(&self, table_name: &str) -> Result<Option<ExperimentType>> {
        self.experiment_type_where("t.table_name = ?", SqlValue::Text(table_name.to_string()))
    }

    pub fn experiment_types(&self, skip: usize, limit: usize) -> Result<Vec<ExperimentType>> {
        let sql = format!(
            "select {EXPERIMENT_TYPE_COLUMNS} from experiment_types t order by t.id limit ? offset ?"
        );
        let mut statement = self.db.prepare_cached(&sql)?;
        let types = statement
            .query_map(page_params(skip, limit), experiment_type_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(types)
    }

    pub fn search_experiment_types(&self, search: &TextSearch, skip: usize, limit: usize) -> Result<Vec<ExperimentType>> {
        let mut conditions = Conditions::default();
        conditions.text_in(&["t.name", "t.description"], search.text.as_ref());
        conditions.created_between(
            "t.created_at",
            search.created_after.as_ref(),
            search.created_before.as_ref(),
        );
        let sql = format!(
            "select {EXPERIMENT_TYPE_COLUMNS} from experiment_types t{} \
             order by t.created_at desc, t.id desc limit ? offset ?",
            conditions.sql()
        );
        let mut statement = self.db.prepare(&sql)?;
        let params = conditions.params().iter().cloned().chain(page_params(skip, limit));
        let types = statement
            .query_map(params_from_iter(params), experiment_type_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(types)
    }

    pub fn update_experiment_type(&self, id: i64, update: &ExperimentTypeUpdate, now: &DateTime<Utc>) -> Result<()> {
        if let Some(name) = &update.name {
            check_name("name", name)?;
        }
        let updated = self
            .db
            .prepare_cached(
                "
                update experiment_types
                    set name = coalesce(?, name),
                        description = coalesce(?, description),
                        updated_at = ?
                    where id = ?
            ",
            )?
            .execute(params![&update.name, &update.description, format_timestamp(now), id]);
        match updated {
            Ok(0) => Err(StoreError::ExperimentTypeNotFound(id.to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(match constraint_violation(&e) {
                Some((Constraint::Unique, _)) => StoreError::DuplicateName {
                    entity: "experiment type",
                    name: update.name.clone().unwrap_or_default(),
                },
                _ => e.into(),
            }),
        }
    }

    pub fn update_schema_definition(&self, id: i64, definition: &SchemaDefinition, now: &DateTime<Utc>) -> Result<()> {
        let updated = self
            .db
            .prepare_cached("update experiment_types set schema_definition = ?, updated_at = ? where id = ?")?
            .execute(params![definition.to_json()?, format_timestamp(now), id])?;
        if updated == 0 {
            return Err(StoreError::ExperimentTypeNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete_experiment_type(&self, id: i64) -> Result<()> {
        let deleted = self
            .db
            .prepare_cached("delete from experiment_types where id = ?")?
            .execute([id]);
        match deleted {
            Ok(0) => Err(StoreError::ExperimentTypeNotFound(id.to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(match constraint_violation(&e) {
                Some((Constraint::ForeignKey, _)) => StoreError::InUse {
                    entity: format!("experiment type {id}"),
                    detail: "experiments still reference it".to_string(),
                },
                _ => e.into(),
            }),
        }
    }

    pub fn count_experiments_of_type(&self, experiment_type_id: i64) -> Result<u64> {
        let count: i64 = self
            .db
            .prepare_cached("select count(*) from experiments where experiment_type_id = ?")?
            .query_row([experiment_type_id], |r| r.get(0))?;
        Ok(count as u64)
    }

    // ------------- Experiments -------------

    pub fn insert_experiment(&self, experiment: &NewExperiment, now: &DateTime<Utc>) -> Result<Experiment> {
        if experiment.description.trim().is_empty() {
            return Err(StoreError::invalid("description", "must not be empty"));
        }
        check_tags(&experiment.tags)?;
        let record = Experiment {
            uuid: Uuid::new_v4(),
            experiment_type_id: experiment.experiment_type_id,
            description: experiment.description.clone(),
            tags: experiment.tags.clone(),
            additional_data: experiment.additional_data.clone(),
            created_at: *now,
            updated_at: *now,
        };
        let stamp = format_timestamp(now);
        let inserted = self
            .db
            .prepare_cached(
                "
                insert into experiments (
                    uuid,
                    experiment_type_id,
                    description,
                    tags,
                    additional_data,
                    created_at,
                    updated_at
                ) values (?, ?, ?, ?, ?, ?, ?)
            ",
            )?
            .execute(params![
                record.uuid.to_string(),
                record.experiment_type_id,
                &record.description,
                serde_json::to_string(&record.tags)?,
                serde_json::to_string(&record.additional_data)?,
                &stamp,
                &stamp
            ]);
        match inserted {
            Ok(_) => Ok(record),
            Err(e) => Err(match constraint_violation(&e) {
                Some((Constraint::ForeignKey, _)) => {
                    StoreError::ExperimentTypeNotFound(record.experiment_type_id.to_string())
                }
                _ => e.into(),
            }),
        }
    }

    pub fn experiment(&self, uuid: &Uuid) -> Result<Option<BoundExperiment>> {
        let sql = format!(
            "select {EXPERIMENT_COLUMNS}, t.name, t.table_name from experiments e \
             join experiment_types t on t.id = e.experiment_type_id where e.uuid = ?"
        );
        Ok(self
            .db
            .prepare_cached(&sql)?
            .query_row([uuid.to_string()], bound_experiment_from_row)
            .optional()?)
    }

    /// Experiments matching `search`, newest first. Without a page every match
    /// is returned.
    pub fn search_experiments(&self, search: &ExperimentSearch, page: Option<(usize, usize)>) -> Result<Vec<BoundExperiment>> {
        check_tags(&search.tags)?;
        let mut conditions = Conditions::default();
        if !search.tags.is_empty() {
            let tags = search.tags.iter().map(|tag| SqlValue::Text(tag.clone()));
            if search.match_all {
                for tag in tags {
                    conditions.push(
                        "exists (select 1 from json_each(e.tags) where json_each.value = ?)",
                        [tag],
                    );
                }
            } else {
                let placeholders = vec!["?"; search.tags.len()].join(", ");
                conditions.push(
                    format!(
                        "exists (select 1 from json_each(e.tags) where json_each.value in ({placeholders}))"
                    ),
                    tags,
                );
            }
        }
        conditions.text_in(&["e.description", "t.name"], search.text.as_ref());
        if let Some(experiment_type_id) = search.experiment_type_id {
            conditions.push("e.experiment_type_id = ?", [SqlValue::Integer(experiment_type_id)]);
        }
        conditions.created_between(
            "e.created_at",
            search.created_after.as_ref(),
            search.created_before.as_ref(),
        );
        let mut sql = format!(
            "select {EXPERIMENT_COLUMNS}, t.name, t.table_name from experiments e \
             join experiment_types t on t.id = e.experiment_type_id{} \
             order by e.created_at desc, e.uuid",
            conditions.sql()
        );
        let mut params: Vec<SqlValue> = conditions.params().to_vec();
        if let Some((skip, limit)) = page {
            sql.push_str(" limit ? offset ?");
            params.extend(page_params(skip, limit));
        }
        let mut statement = self.db.prepare(&sql)?;
        let experiments = statement
            .query_map(params_from_iter(params), bound_experiment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(experiments)
    }

    pub fn update_experiment(&self, uuid: &Uuid, update: &ExperimentUpdate, now: &DateTime<Utc>) -> Result<()> {
        if let Some(description) = &update.description {
            if description.trim().is_empty() {
                return Err(StoreError::invalid("description", "must not be empty"));
            }
        }
        if let Some(tags) = &update.tags {
            check_tags(tags)?;
        }
        let tags = update.tags.as_ref().map(serde_json::to_string).transpose()?;
        let additional_data = update
            .additional_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let updated = self
            .db
            .prepare_cached(
                "
                update experiments
                    set description = coalesce(?, description),
                        tags = coalesce(?, tags),
                        additional_data = coalesce(?, additional_data),
                        updated_at = ?
                    where uuid = ?
            ",
            )?
            .execute(params![
                &update.description,
                tags,
                additional_data,
                format_timestamp(now),
                uuid.to_string()
            ])?;
        if updated == 0 {
            return Err(StoreError::ExperimentNotFound(*uuid));
        }
        Ok(())
    }

    pub fn delete_experiment(&self, uuid: &Uuid) -> Result<()> {
        let deleted = self
            .db
            .prepare_cached("delete from experiments where uuid = ?")?
            .execute([uuid.to_string()]);
        match deleted {
            Ok(0) => Err(StoreError::ExperimentNotFound(*uuid)),
            Ok(_) => Ok(()),
            Err(e) => Err(match constraint_violation(&e) {
                Some((Constraint::ForeignKey, _)) => StoreError::InUse {
                    entity: format!("experiment {uuid}"),
                    detail: "data rows still reference it".to_string(),
                },
                _ => e.into(),
            }),
        }
    }

    // ------------- Tags -------------

    pub fn insert_tag(&self, tag: &NewTag, now: &DateTime<Utc>) -> Result<Tag> {
        check_name("name", &tag.name)?;
        let stamp = format_timestamp(now);
        let inserted = self
            .db
            .prepare_cached(
                "
                insert into tags (
                    name,
                    description,
                    created_at,
                    updated_at
                ) values (?, ?, ?, ?)
            ",
            )?
            .execute(params![&tag.name, &tag.description, &stamp, &stamp]);
        match inserted {
            Ok(_) => Ok(Tag {
                id: self.db.last_insert_rowid(),
                name: tag.name.clone(),
                description: tag.description.clone(),
                created_at: *now,
                updated_at: *now,
            }),
            Err(e) => Err(match constraint_violation(&e) {
                Some((Constraint::Unique, _)) => StoreError::DuplicateName {
                    entity: "tag",
                    name: tag.name.clone(),
                },
                _ => e.into(),
            }),
        }
    }

    fn tag_where(&self, condition: &str, value: SqlValue) -> Result<Option<Tag>> {
        let sql = format!(
            "select id, name, description, created_at, updated_at from tags where {condition}"
        );
        Ok(self
            .db
            .prepare_cached(&sql)?
            .query_row([value], tag_from_row)
            .optional()?)
    }

    pub fn tag(&self, id: i64) -> Result<Option<Tag>> {
        self.tag_where("id = ?", SqlValue::Integer(id))
    }

    pub fn tag_by_name(&self, name: &str) -> Result<Option<Tag>> {
        self.tag_where("name = ?", SqlValue::Text(name.to_string()))
    }

    pub fn search_tags(&self, search: &TextSearch, skip: usize, limit: usize) -> Result<Vec<Tag>> {
        let mut conditions = Conditions::default();
        conditions.text_in(&["name", "description"], search.text.as_ref());
        conditions.created_between(
            "created_at",
            search.created_after.as_ref(),
            search.created_before.as_ref(),
        );
        let sql = format!(
            "select id, name, description, created_at, updated_at from tags{} \
             order by created_at desc, id desc limit ? offset ?",
            conditions.sql()
        );
        let mut statement = self.db.prepare(&sql)?;
        let params = conditions.params().iter().cloned().chain(page_params(skip, limit));
        let tags = statement
            .query_map(params_from_iter(params), tag_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    pub fn tags(&self, skip: usize, limit: usize) -> Result<Vec<Tag>> {
        let mut statement = self.db.prepare_cached(
            "select id, name, description, created_at, updated_at from tags order by id limit ? offset ?",
        )?;
        let tags = statement
            .query_map(page_params(skip, limit), tag_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    pub fn update_tag(&self, id: i64, update: &TagUpdate, now: &DateTime<Utc>) -> Result<()> {
        if let Some(name) = &update.name {
            check_name("name", name)?;
        }
        let updated = self
            .db
            .prepare_cached(
                "
                update tags
                    set name = coalesce(?, name),
                        description = coalesce(?, description),
                        updated_at = ?
                    where id = ?
            ",
            )?
            .execute(params![&update.name, &update.description, format_timestamp(now), id]);
        match updated {
            Ok(0) => Err(StoreError::TagNotFound(id.to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(match constraint_violation(&e) {
                Some((Constraint::Unique, _)) => StoreError::DuplicateName {
                    entity: "tag",
                    name: update.name.clone().unwrap_or_default(),
                },
                _ => e.into(),
            }),
        }
    }

    pub fn delete_tag(&self, id: i64) -> Result<()> {
        let deleted = self
            .db
            .prepare_cached("delete from tags where id = ?")?
            .execute([id])?;
        if deleted == 0 {
            return Err(StoreError::TagNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::now;

    fn registry_connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        connection.pragma_update(None, "foreign_keys", true).unwrap();
        Registry::initialize(&connection).unwrap();
        connection
    }

    #[test]
    fn tag_sets_are_bounded_and_distinct() {
        assert!(check_tags(&["a".to_string(), "b".to_string()]).is_ok());
        assert!(check_tags(&["a".to_string(), "a".to_string()]).is_err());
        assert!(check_tags(&[" ".to_string()]).is_err());
        let eleven: Vec<String> = (0..11).map(|i| format!("t{i}")).collect();
        assert!(matches!(
            check_tags(&eleven),
            Err(StoreError::InvalidArgument { field: "tags", .. })
        ));
    }

    #[test]
    fn type_name_uniqueness_comes_from_the_constraint() {
        let connection = registry_connection();
        let registry = Registry::new(&connection);
        let first = NewExperimentType::new("memory", "memory_data", SchemaDefinition::new());
        registry.insert_experiment_type(&first, &now()).unwrap();
        let same_name = NewExperimentType::new("memory", "other_data", SchemaDefinition::new());
        assert!(matches!(
            registry.insert_experiment_type(&same_name, &now()),
            Err(StoreError::DuplicateName { .. })
        ));
        let same_table = NewExperimentType::new("recall", "memory_data", SchemaDefinition::new());
        assert!(matches!(
            registry.insert_experiment_type(&same_table, &now()),
            Err(StoreError::DuplicateTableBinding(_))
        ));
    }

    #[test]
    fn experiments_require_an_existing_type() {
        let connection = registry_connection();
        let registry = Registry::new(&connection);
        assert!(matches!(
            registry.insert_experiment(&NewExperiment::new(42, "orphan"), &now()),
            Err(StoreError::ExperimentTypeNotFound(_))
        ));
    }

    #[test]
    fn experiment_round_trips_tags_and_data() {
        let connection = registry_connection();
        let registry = Registry::new(&connection);
        let type_id = registry
            .insert_experiment_type(
                &NewExperimentType::new("vision", "vision_data", SchemaDefinition::new()),
                &now(),
            )
            .unwrap();
        let created = registry
            .insert_experiment(
                &NewExperiment::new(type_id, "Visual stimuli")
                    .with_tags(["visual", "pilot"])
                    .with_data("session", 3),
                &now(),
            )
            .unwrap();
        let found = registry.experiment(&created.uuid).unwrap().expect("stored");
        assert_eq!(found.experiment, created);
        assert_eq!(found.type_name, "vision");
        assert_eq!(found.table_name, "vision_data");
    }

    #[test]
    fn tag_catalog_crud() {
        let connection = registry_connection();
        let registry = Registry::new(&connection);
        let tag = registry
            .insert_tag(&NewTag { name: "pilot".into(), description: None }, &now())
            .unwrap();
        assert!(matches!(
            registry.insert_tag(&NewTag { name: "pilot".into(), description: None }, &now()),
            Err(StoreError::DuplicateName { entity: "tag", .. })
        ));
        registry
            .update_tag(
                tag.id,
                &TagUpdate { name: None, description: Some("first runs".into()) },
                &now(),
            )
            .unwrap();
        let found = registry.tag_by_name("pilot").unwrap().unwrap();
        assert_eq!(found.description.as_deref(), Some("first runs"));
        let hits = registry
            .search_tags(&TextSearch { text: Some("FIRST".into()), ..TextSearch::default() }, 0, 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        registry.delete_tag(tag.id).unwrap();
        assert!(matches!(registry.delete_tag(tag.id), Err(StoreError::TagNotFound(_))));
    }
}
