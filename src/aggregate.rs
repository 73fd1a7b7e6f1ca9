//! Searches across experiments and the heterogeneous tables behind them.
//!
//! Experiments are resolved from the registry first, then grouped by the table
//! their type is bound to. Each group is counted before it is read, so only the
//! rows inside the requested window are ever fetched. The merged sequence
//! orders groups by binding name and rows by id within a group.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::access::{DataAccessor, DataRow, Limits, Page, RowFilter};
use crate::error::{Result, StoreError};
use crate::registry::{BoundExperiment, ExperimentSearch, ExperimentType, Registry, Tag, TextSearch};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregateRequest {
    #[serde(flatten)]
    pub search: ExperimentSearch,
    #[serde(default)]
    pub skip: usize,
    pub limit: Option<usize>,
}

impl AggregateRequest {
    pub fn new(search: ExperimentSearch) -> Self {
        AggregateRequest {
            search,
            skip: 0,
            limit: None,
        }
    }
    pub fn page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }
    pub fn created_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.search.created_after = after;
        self.search.created_before = before;
        self
    }
}

/// Experiment facts attached to every aggregated row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentMetadata {
    pub uuid: Uuid,
    pub description: String,
    pub type_name: String,
    pub tags: Vec<String>,
}

impl From<&BoundExperiment> for ExperimentMetadata {
    fn from(bound: &BoundExperiment) -> Self {
        ExperimentMetadata {
            uuid: bound.experiment.uuid,
            description: bound.experiment.description.clone(),
            type_name: bound.type_name.clone(),
            tags: bound.experiment.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedRow {
    #[serde(flatten)]
    pub row: DataRow,
    pub experiment_metadata: ExperimentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentSummary {
    pub description: String,
    pub type_name: String,
    pub tags: Vec<String>,
    pub data_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub data: Vec<AggregatedRow>,
    pub total_rows: u64,
    pub total_experiments: usize,
    pub experiment_info: BTreeMap<Uuid, ExperimentSummary>,
    pub skip: usize,
    pub limit: usize,
}

/// Rows of every experiment matching the request, merged into one page.
pub fn aggregate(connection: &Connection, request: &AggregateRequest, limits: Limits) -> Result<AggregateResult> {
    let limit = limits.clamp(request.limit);
    let registry = Registry::new(connection);
    let experiments = registry.search_experiments(&request.search, None)?;

    let mut groups: BTreeMap<&str, Vec<&BoundExperiment>> = BTreeMap::new();
    for bound in &experiments {
        groups.entry(bound.table_name.as_str()).or_default().push(bound);
    }

    let window_start = request.skip as u64;
    let window_end = window_start.saturating_add(limit as u64);
    let mut experiment_info = BTreeMap::new();
    let mut data = Vec::new();
    let mut seen: u64 = 0;
    for members in groups.values() {
        let type_id = members[0].experiment.experiment_type_id;
        let experiment_type = registry
            .experiment_type(type_id)?
            .ok_or_else(|| StoreError::ExperimentTypeNotFound(type_id.to_string()))?;
        let accessor = DataAccessor::for_type(connection, &experiment_type, limits)?;
        let filter = RowFilter {
            experiment_uuids: Some(members.iter().map(|bound| bound.experiment.uuid).collect()),
            created_after: request.search.created_after,
            created_before: request.search.created_before,
            ..RowFilter::default()
        };
        let counts = accessor.count_by_experiment(&filter)?;
        let group_total: u64 = counts.values().sum();
        let by_uuid: HashMap<Uuid, &BoundExperiment> = members
            .iter()
            .map(|bound| (bound.experiment.uuid, *bound))
            .collect();
        for bound in members {
            experiment_info.insert(
                bound.experiment.uuid,
                ExperimentSummary {
                    description: bound.experiment.description.clone(),
                    type_name: bound.type_name.clone(),
                    tags: bound.experiment.tags.clone(),
                    data_count: counts.get(&bound.experiment.uuid).copied().unwrap_or(0),
                },
            );
        }

        let start = window_start.max(seen);
        let end = window_end.min(seen + group_total);
        if start < end {
            let page = Page::new((start - seen) as usize, (end - start) as usize);
            for row in accessor.list(&filter, &page)? {
                if let Some(bound) = by_uuid.get(&row.experiment_uuid) {
                    data.push(AggregatedRow {
                        experiment_metadata: ExperimentMetadata::from(*bound),
                        row,
                    });
                }
            }
        }
        seen += group_total;
    }

    debug!(
        experiments = experiments.len(),
        tables = groups.len(),
        total_rows = seen,
        returned = data.len(),
        "aggregated experiment data"
    );
    Ok(AggregateResult {
        data,
        total_rows: seen,
        total_experiments: experiments.len(),
        experiment_info,
        skip: request.skip,
        limit,
    })
}

pub fn search_experiments(
    connection: &Connection,
    search: &ExperimentSearch,
    skip: usize,
    limit: Option<usize>,
    limits: Limits,
) -> Result<Vec<BoundExperiment>> {
    Registry::new(connection).search_experiments(search, Some((skip, limits.clamp(limit))))
}

pub fn search_experiment_types(
    connection: &Connection,
    search: &TextSearch,
    skip: usize,
    limit: Option<usize>,
    limits: Limits,
) -> Result<Vec<ExperimentType>> {
    Registry::new(connection).search_experiment_types(search, skip, limits.clamp(limit))
}

pub fn search_tags(
    connection: &Connection,
    search: &TextSearch,
    skip: usize,
    limit: Option<usize>,
    limits: Limits,
) -> Result<Vec<Tag>> {
    Registry::new(connection).search_tags(search, skip, limits.clamp(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::now;
    use crate::provision::provision;
    use crate::registry::{NewExperiment, NewExperimentType};
    use crate::schema::SchemaDefinition;
    use serde_json::{Map, json};

    struct Fixture {
        connection: Connection,
        uuids: Vec<Uuid>,
    }

    // Two tables: "alpha_data" holds experiments 0 and 1, "beta_data" holds 2.
    fn fixture(rows: [usize; 3]) -> Fixture {
        let mut connection = Connection::open_in_memory().unwrap();
        connection.pragma_update(None, "foreign_keys", true).unwrap();
        Registry::initialize(&connection).unwrap();
        let alpha = provision(
            &mut connection,
            &NewExperimentType::new("alpha", "alpha_data", SchemaDefinition::new().column("n", "INTEGER")),
            &now(),
        )
        .unwrap();
        let beta = provision(
            &mut connection,
            &NewExperimentType::new("beta", "beta_data", SchemaDefinition::new().column("n", "INTEGER")),
            &now(),
        )
        .unwrap();
        let registry = Registry::new(&connection);
        let plan = [
            (alpha.experiment_type.id, "first", vec!["a", "b"]),
            (alpha.experiment_type.id, "second", vec!["a"]),
            (beta.experiment_type.id, "third", vec!["b", "c"]),
        ];
        let mut uuids = Vec::new();
        for (index, (type_id, description, tags)) in plan.into_iter().enumerate() {
            let experiment = registry
                .insert_experiment(&NewExperiment::new(type_id, description).with_tags(tags), &now())
                .unwrap();
            let bound_type = if index < 2 { &alpha.experiment_type } else { &beta.experiment_type };
            let accessor = DataAccessor::for_type(&connection, bound_type, Limits::default()).unwrap();
            for n in 0..rows[index] {
                let mut values = Map::new();
                values.insert("n".into(), json!(n));
                accessor.insert(&experiment.uuid, "P1", &values).unwrap();
            }
            uuids.push(experiment.uuid);
        }
        Fixture { connection, uuids }
    }

    #[test]
    fn window_spans_group_boundaries() {
        let f = fixture([2, 2, 3]);
        let request = AggregateRequest::new(ExperimentSearch::default()).page(3, 2);
        let result = aggregate(&f.connection, &request, Limits::default()).unwrap();
        assert_eq!(result.total_rows, 7);
        assert_eq!(result.total_experiments, 3);
        let owners: Vec<Uuid> = result.data.iter().map(|r| r.experiment_metadata.uuid).collect();
        assert_eq!(owners, [f.uuids[1], f.uuids[2]]);
        assert_eq!(result.data[1].experiment_metadata.type_name, "beta");
        assert_eq!(result.experiment_info[&f.uuids[2]].data_count, 3);
    }

    #[test]
    fn experiments_without_rows_still_count() {
        let f = fixture([0, 1, 0]);
        let request = AggregateRequest::new(ExperimentSearch::tagged(["a"], true));
        let result = aggregate(&f.connection, &request, Limits::default()).unwrap();
        assert_eq!(result.total_experiments, 2);
        assert_eq!(result.total_rows, 1);
        assert_eq!(result.experiment_info[&f.uuids[0]].data_count, 0);
    }

    #[test]
    fn requested_limit_is_capped() {
        let f = fixture([1, 0, 0]);
        let limits = Limits {
            max_page_size: 10,
            default_page_size: 5,
        };
        let request = AggregateRequest::new(ExperimentSearch::default()).page(0, 50);
        let result = aggregate(&f.connection, &request, limits).unwrap();
        assert_eq!(result.limit, 10);
        let types = search_experiment_types(&f.connection, &TextSearch::default(), 0, None, limits).unwrap();
        assert_eq!(types.len(), 2);
    }
}
