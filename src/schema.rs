//! Schema definitions and their validation.
//!
//! A schema definition maps column names to type specs, where a spec is either a
//! bare token (`"FLOAT"`) or a record (`{"type": "FLOAT", "nullable": false}`).
//! Validation produces the normalized, ordered [`ColumnDef`] list that both the
//! provisioner and the data accessor work from.

use std::collections::HashSet;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datatype::{ColumnType, PhysicalType};
use crate::error::{Result, SchemaViolation, StoreError};

/// Columns every dynamic table carries, in physical order.
pub const FIXED_COLUMNS: [&str; 5] = [
    "id",
    "experiment_uuid",
    "participant_id",
    "created_at",
    "updated_at",
];

/// Registry tables that no binding name may shadow.
pub const REGISTRY_TABLES: [&str; 3] = ["experiment_types", "experiments", "tags"];

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap();
}

pub fn is_fixed_column(name: &str) -> bool {
    FIXED_COLUMNS.iter().any(|fixed| fixed.eq_ignore_ascii_case(name))
}

fn identifier_problem(name: &str) -> Option<String> {
    if IDENTIFIER.is_match(name) {
        None
    } else {
        Some(
            "must start with a letter or underscore, contain only letters, digits and \
             underscores, and be at most 63 characters"
                .to_string(),
        )
    }
}

/// Checks a table binding name before it is ever placed in a statement.
pub fn validate_binding_name(name: &str) -> Result<()> {
    if let Some(problem) = identifier_problem(name) {
        return Err(StoreError::invalid("table_name", format!("'{name}' {problem}")));
    }
    let lowered = name.to_ascii_lowercase();
    if lowered.starts_with("sqlite_") || REGISTRY_TABLES.contains(&lowered.as_str()) {
        return Err(StoreError::invalid(
            "table_name",
            format!("'{name}' is reserved by the store"),
        ));
    }
    Ok(())
}

/// Quotes an identifier for inclusion in a statement.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ------------- Definition -------------

/// Raw, user supplied schema definition. Keeps declaration order and, unlike a
/// JSON map, keeps repeated keys so duplicates can be reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDefinition {
    entries: Vec<(String, Value)>,
}

impl SchemaDefinition {
    pub fn new() -> Self {
        Self::default()
    }
    /// Appends a column; chainable for building definitions in code.
    pub fn column(mut self, name: impl Into<String>, spec: impl Into<Value>) -> Self {
        self.entries.push((name.into(), spec.into()));
        self
    }
    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Definition with `other`'s columns appended after this one's.
    pub fn merged_with(&self, other: &SchemaDefinition) -> SchemaDefinition {
        let mut entries = self.entries.clone();
        entries.extend(other.entries.iter().cloned());
        SchemaDefinition { entries }
    }
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
    pub fn from_json(text: &str) -> Result<SchemaDefinition> {
        Ok(serde_json::from_str(text)?)
    }
}

impl Serialize for SchemaDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, spec) in &self.entries {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

struct DefinitionVisitor;

impl<'de> Visitor<'de> for DefinitionVisitor {
    type Value = SchemaDefinition;
    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a mapping of column name to type spec")
    }
    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, spec)) = access.next_entry::<String, Value>()? {
            entries.push((name, spec));
        }
        Ok(SchemaDefinition { entries })
    }
}

impl<'de> Deserialize<'de> for SchemaDefinition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(DefinitionVisitor)
    }
}

// ------------- Normalized -------------

/// One validated custom column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn physical(&self) -> PhysicalType {
        PhysicalType {
            nullable: self.nullable,
            ..self.column_type.physical()
        }
    }
    /// Column clause used in `create table` and `alter table ... add column`.
    pub(crate) fn declaration(&self) -> String {
        let mut clause = format!(
            "{} {}",
            quote_identifier(&self.name),
            self.column_type.physical().sql_type
        );
        if !self.nullable {
            clause.push_str(" NOT NULL");
        }
        clause
    }
}

/// Resolves a single type spec, or explains why it cannot be resolved.
fn resolve_spec(spec: &Value) -> std::result::Result<(ColumnType, bool), Vec<String>> {
    match spec {
        Value::String(token) => token
            .parse::<ColumnType>()
            .map(|column_type| (column_type, true))
            .map_err(|e| vec![e.to_string()]),
        Value::Object(record) => {
            let mut problems = Vec::new();
            let unrecognized: Vec<&str> = record
                .keys()
                .map(String::as_str)
                .filter(|key| *key != "type" && *key != "nullable")
                .collect();
            let column_type = match record.get("type") {
                Some(Value::String(token)) => match token.parse::<ColumnType>() {
                    Ok(column_type) => Some(column_type),
                    Err(e) => {
                        problems.push(e.to_string());
                        None
                    }
                },
                Some(_) => {
                    problems.push("'type' must be a string token".to_string());
                    None
                }
                None => {
                    problems.push("type spec record is missing 'type'".to_string());
                    None
                }
            };
            if !unrecognized.is_empty() {
                problems.push(format!(
                    "unrecognized type spec fields: {} (only 'type' and 'nullable' are allowed)",
                    unrecognized.join(", ")
                ));
            }
            let nullable = match record.get("nullable") {
                None => true,
                Some(Value::Bool(nullable)) => *nullable,
                Some(_) => {
                    problems.push("'nullable' must be a boolean".to_string());
                    true
                }
            };
            match column_type {
                Some(column_type) if problems.is_empty() => Ok((column_type, nullable)),
                _ => Err(problems),
            }
        }
        other => Err(vec![format!(
            "type spec must be a token string or a {{type, nullable}} record, got {}",
            crate::datatype::json_type_name(other)
        )]),
    }
}

/// Validates a schema definition, reporting every offending column at once.
pub fn validate_schema(definition: &SchemaDefinition) -> Result<Vec<ColumnDef>> {
    validate_against(definition, &[])
}

/// Validates `definition` as an addition to an already provisioned column set.
pub(crate) fn validate_against(
    definition: &SchemaDefinition,
    existing: &[ColumnDef],
) -> Result<Vec<ColumnDef>> {
    let mut violations = Vec::new();
    let mut seen: HashSet<String> = existing
        .iter()
        .map(|column| column.name.to_ascii_lowercase())
        .collect();
    let mut columns = Vec::with_capacity(definition.len());
    for (name, spec) in definition.entries() {
        let before = violations.len();
        if let Some(problem) = identifier_problem(name) {
            violations.push(SchemaViolation::new(name, format!("name {problem}")));
        }
        if is_fixed_column(name) {
            violations.push(SchemaViolation::new(name, "reserved column name"));
        }
        let resolved = match resolve_spec(spec) {
            Ok(resolved) => Some(resolved),
            Err(problems) => {
                for problem in problems {
                    violations.push(SchemaViolation::new(name, problem));
                }
                None
            }
        };
        if !seen.insert(name.to_ascii_lowercase()) && !is_fixed_column(name) {
            let reason = if existing.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
                "column already exists"
            } else {
                "duplicate column name"
            };
            violations.push(SchemaViolation::new(name, reason));
        }
        if let (Some((column_type, nullable)), true) = (resolved, violations.len() == before) {
            columns.push(ColumnDef {
                name: name.clone(),
                column_type,
                nullable,
            });
        }
    }
    if violations.is_empty() {
        Ok(columns)
    } else {
        Err(StoreError::SchemaValidation { violations })
    }
}
