//! Public facade tying the catalog, the ingestion pipeline and the five
//! aggregation shapes together.

use serde::Serialize;

use crate::catalog;
use crate::config::Config;
use crate::ingest::{self, IngestMessage, IngestReport, ResolverCache};
use crate::store::operations::aggregate::{GroupSummary, LatestState, UsageSummary};
use crate::store::operations::entities::EntityRecord;
use crate::store::operations::facts::FactRow;
use crate::store::operations::inputs::InputRecord;
use crate::store::operations::snapshots::Window;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Latest observation of one entity plus its state span.
    Latest,
    /// Per-entity folded metrics (max, min).
    Max,
    /// Count and sums grouped by the kind's link roles.
    SumGrouped,
    /// Raw ordered series for one entity.
    List,
    /// Distinct entity ids matching a label prefix.
    Distinct,
}

/// Everything needed to run one windowed query. `start_ts`/`end_ts` are a
/// half-open range with `0` meaning unbounded.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub fact_kind: String,
    pub mode: QueryMode,
    pub entity_id: Option<String>,
    pub group_role: Option<String>,
    pub label: Option<String>,
    pub label_prefix: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
}

impl QueryParams {
    pub fn new(fact_kind: &str, mode: QueryMode) -> Self {
        Self {
            fact_kind: fact_kind.to_string(),
            mode,
            entity_id: None,
            group_role: None,
            label: None,
            label_prefix: None,
            start_ts: 0,
            end_ts: 0,
        }
    }

    pub fn entity(mut self, entity_id: &str) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn group_by(mut self, role: &str) -> Self {
        self.group_role = Some(role.to_string());
        self
    }

    pub fn label_starts_with(mut self, label: &str, prefix: &str) -> Self {
        self.label = Some(label.to_string());
        self.label_prefix = Some(prefix.to_string());
        self
    }

    pub fn between(mut self, start_ts: i64, end_ts: i64) -> Self {
        self.start_ts = start_ts;
        self.end_ts = end_ts;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryResult {
    Latest(Option<LatestState>),
    Summaries(Vec<UsageSummary>),
    Groups(Vec<GroupSummary>),
    Series(Vec<FactRow>),
    Members(Vec<String>),
}

pub struct Engine {
    store: Store,
    cache_capacity: usize,
}

impl Engine {
    /// Open the store at the configured path and bring it up to the
    /// current schema version.
    pub fn open(config: &Config) -> Result<Self, StoreError> {
        let store = Store::open(&config.sled_path)?;
        store.run_migrations()?;
        Ok(Self {
            store,
            cache_capacity: config.resolver_cache_capacity,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Ingest one batch of messages for a named feed.
    pub fn ingest(
        &self,
        feed_name: &str,
        messages: &[IngestMessage],
    ) -> Result<IngestReport, StoreError> {
        let feed = catalog::feed(feed_name).ok_or_else(|| {
            StoreError::Validation(format!("unknown feed {feed_name}"))
        })?;
        let mut cache = ResolverCache::new(self.cache_capacity);
        ingest::run_batch(&self.store, feed, messages, &mut cache)
    }

    /// Run one windowed query. An empty window or an unknown entity yields
    /// an empty result, never an error; only unknown feed or kind names
    /// are rejected.
    pub fn query_window(
        &self,
        feed_name: &str,
        params: &QueryParams,
    ) -> Result<QueryResult, StoreError> {
        let feed = catalog::feed(feed_name).ok_or_else(|| {
            StoreError::Validation(format!("unknown feed {feed_name}"))
        })?;
        let spec = feed.kind(&params.fact_kind).ok_or_else(|| {
            StoreError::Validation(format!(
                "unknown fact kind {} in feed {feed_name}",
                params.fact_kind
            ))
        })?;
        let window = Window::new(params.start_ts, params.end_ts);

        match params.mode {
            QueryMode::Latest => {
                let entity_id = require_entity(params)?;
                Ok(QueryResult::Latest(self.store.latest_state(
                    feed.name, spec, entity_id, window,
                )?))
            }
            QueryMode::Max => Ok(QueryResult::Summaries(self.store.max_in_window(
                feed.name,
                spec,
                window,
                params.entity_id.as_deref(),
                params.group_role.as_deref(),
            )?)),
            QueryMode::SumGrouped => Ok(QueryResult::Groups(self.store.sum_grouped(
                feed.name,
                spec,
                window,
                spec.group_roles,
            )?)),
            QueryMode::List => {
                let entity_id = require_entity(params)?;
                Ok(QueryResult::Series(self.store.list_in_window(
                    feed.name, spec, entity_id, window,
                )?))
            }
            QueryMode::Distinct => {
                let label = params.label.as_deref().ok_or_else(|| {
                    StoreError::Validation("distinct query requires a label".to_string())
                })?;
                let prefix = params.label_prefix.as_deref().unwrap_or("");
                Ok(QueryResult::Members(self.store.distinct_members(
                    feed.name, spec, window, label, prefix,
                )?))
            }
        }
    }

    /// Read-only natural-key to surrogate-id translation; never creates.
    pub fn resolve_entity(
        &self,
        feed_name: &str,
        kind: &str,
        natural_key: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .find_entity(feed_name, kind, natural_key)?
            .map(|record| record.id))
    }

    /// Read-only natural-key lookup; never creates.
    pub fn find_entity(
        &self,
        feed_name: &str,
        kind: &str,
        natural_key: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.store.find_entity(feed_name, kind, natural_key)
    }

    pub fn register_input(&self, name: &str) -> Result<InputRecord, StoreError> {
        self.store.register_input(name)
    }

    pub fn list_inputs(&self, limit: usize, offset: usize) -> Result<Vec<InputRecord>, StoreError> {
        self.store.list_inputs(limit, offset)
    }
}

fn require_entity(params: &QueryParams) -> Result<&str, StoreError> {
    params.entity_id.as_deref().ok_or_else(|| {
        StoreError::Validation(format!("{:?} query requires an entity id", params.mode))
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open_engine(dir: &tempfile::TempDir) -> Engine {
        let config = Config {
            sled_path: dir.path().join("db").to_string_lossy().into_owned(),
            ..Config::default()
        };
        Engine::open(&config).unwrap()
    }

    #[test]
    fn unknown_feed_and_kind_are_rejected() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);

        assert!(matches!(
            engine.ingest("tape", &[]),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            engine.query_window("xfs", &QueryParams::new("mystery", QueryMode::Max)),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn empty_window_yields_empty_results_not_errors() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);

        let summaries = engine
            .query_window("xfs", &QueryParams::new("quota-usage", QueryMode::Max))
            .unwrap();
        assert!(matches!(summaries, QueryResult::Summaries(s) if s.is_empty()));

        let latest = engine
            .query_window(
                "compute",
                &QueryParams::new("instance-state", QueryMode::Latest).entity("missing"),
            )
            .unwrap();
        assert!(matches!(latest, QueryResult::Latest(None)));

        assert!(engine
            .resolve_entity("compute", "instance", "missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn latest_without_entity_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);

        assert!(matches!(
            engine.query_window(
                "compute",
                &QueryParams::new("instance-state", QueryMode::Latest)
            ),
            Err(StoreError::Validation(_))
        ));
    }
}
