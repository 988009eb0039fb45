use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sled::Transactional;
use uuid::Uuid;

use crate::catalog::{Cardinality, FactKindSpec};
use crate::store::keys;
use crate::store::operations::snapshots::Window;
use crate::store::{Store, StoreError};

/// One measurement of one entity at one snapshot. Pure append: never
/// updated or deleted once written (PerEntity kinds replace in place,
/// which is their contract, not an update of history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactRow {
    pub entity_id: String,
    pub snapshot_id: String,
    /// Snapshot timestamp, denormalized for window scans.
    pub ts: i64,
    /// Link roles to other entities (owner, queue, hypervisor...).
    pub links: BTreeMap<String, String>,
    /// Numeric measurements; `None` means "unlimited" and survives
    /// aggregation as `None`, never coerced to zero.
    pub metrics: BTreeMap<String, Option<i64>>,
    /// Categorical observations (state name, zone, addresses).
    pub labels: BTreeMap<String, String>,
    /// Domain completion timestamp for event facts.
    pub event_ts: Option<i64>,
}

/// A fact prepared during ingestion pass 1, applied in pass 2.
#[derive(Debug, Clone)]
pub struct StagedFact {
    pub kind: &'static str,
    pub cardinality: Cardinality,
    pub row: FactRow,
    row_tag: String,
}

impl StagedFact {
    pub fn new(spec: &'static FactKindSpec, row: FactRow) -> Self {
        let row_tag = match spec.cardinality {
            Cardinality::Unique => "0".to_string(),
            Cardinality::Multi => Uuid::new_v4().to_string(),
            Cardinality::PerEntity => String::new(),
        };
        Self {
            kind: spec.name,
            cardinality: spec.cardinality,
            row,
            row_tag,
        }
    }

    fn primary_key(&self, feed: &str) -> String {
        match self.cardinality {
            Cardinality::Unique => {
                keys::fact_unique_key(feed, self.kind, &self.row.entity_id, self.row.ts)
            }
            Cardinality::Multi => keys::fact_multi_key(
                feed,
                self.kind,
                &self.row.entity_id,
                self.row.ts,
                &self.row_tag,
            ),
            Cardinality::PerEntity => keys::fact_event_key(feed, self.kind, &self.row.entity_id),
        }
    }

    fn index_key(&self, feed: &str) -> Option<String> {
        match self.cardinality {
            // PerEntity rows are windowed by event_ts, not snapshot ts;
            // they are found by kind prefix scan instead.
            Cardinality::PerEntity => None,
            _ => Some(keys::fact_ts_index_key(
                feed,
                self.kind,
                self.row.ts,
                &self.row.entity_id,
                &self.row_tag,
            )),
        }
    }
}

impl Store {
    /// Apply a whole staged batch in one transaction: either every row
    /// commits or none does. Returns the number of rows written (unique
    /// rewrites with identical content do not count).
    pub fn apply_facts(&self, feed: &str, staged: &[StagedFact]) -> Result<usize, StoreError> {
        let mut prepared = Vec::with_capacity(staged.len());
        for fact in staged {
            prepared.push((
                fact.primary_key(feed),
                fact.index_key(feed),
                Self::serialize(&fact.row)?,
                fact.cardinality,
                fact.row.entity_id.clone(),
            ));
        }

        let written = (&self.facts, &self.facts_by_ts)
            .transaction(|(tx_facts, tx_index)| {
                let mut count = 0usize;
                for (primary, index, value, cardinality, entity_id) in &prepared {
                    if entity_id.is_empty() {
                        return Err(sled::transaction::ConflictableTransactionError::Abort(
                            StoreError::Validation("fact row without a resolved entity".into()),
                        ));
                    }

                    if *cardinality == Cardinality::Unique {
                        if let Some(existing) = tx_facts.get(primary.as_bytes())? {
                            if existing.as_ref() == value.as_slice() {
                                continue;
                            }
                            tracing::warn!(key = %primary, "Overwriting unique fact with changed content");
                        }
                    }

                    tx_facts.insert(primary.as_bytes(), value.as_slice())?;
                    if let Some(index) = index {
                        tx_index.insert(index.as_bytes(), primary.as_bytes())?;
                    }
                    count += 1;
                }
                Ok(count)
            })
            .map_err(
                |error: sled::transaction::TransactionError<StoreError>| match error {
                    sled::transaction::TransactionError::Abort(store_error) => store_error,
                    sled::transaction::TransactionError::Storage(storage_error) => {
                        StoreError::Sled(storage_error)
                    }
                },
            )?;

        Ok(written)
    }

    /// Row-by-row twin of `apply_facts`, without the batch transaction.
    /// Exists to prove the bulk path observationally transparent; the
    /// pipeline itself always uses `apply_facts`.
    pub fn apply_facts_serial(&self, feed: &str, staged: &[StagedFact]) -> Result<usize, StoreError> {
        let mut count = 0usize;
        for fact in staged {
            if fact.row.entity_id.is_empty() {
                return Err(StoreError::Validation(
                    "fact row without a resolved entity".into(),
                ));
            }

            let primary = fact.primary_key(feed);
            let value = Self::serialize(&fact.row)?;

            if fact.cardinality == Cardinality::Unique {
                if let Some(existing) = self.facts.get(primary.as_bytes())? {
                    if existing.as_ref() == value.as_slice() {
                        continue;
                    }
                    tracing::warn!(key = %primary, "Overwriting unique fact with changed content");
                }
            }

            self.facts.insert(primary.as_bytes(), value.as_slice())?;
            if let Some(index) = fact.index_key(feed) {
                self.facts_by_ts
                    .insert(index.as_bytes(), primary.as_bytes())?;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Ordered history of one entity's facts of one kind inside a window,
    /// ascending by (snapshot ts, snapshot id).
    pub fn facts_for(
        &self,
        feed: &str,
        kind: &str,
        entity_id: &str,
        window: Window,
    ) -> Result<Vec<FactRow>, StoreError> {
        let prefix = keys::fact_entity_prefix(feed, kind, entity_id);
        let mut rows = Vec::new();
        for item in self.facts.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            let row: FactRow = Self::deserialize(&raw)?;
            if window.contains(row.ts) {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| (a.ts, &a.snapshot_id).cmp(&(b.ts, &b.snapshot_id)));
        Ok(rows)
    }

    /// All rows of a kind inside a window across entities, via the time
    /// index, ascending by (ts, entity id).
    pub fn facts_in_window(
        &self,
        feed: &str,
        kind: &str,
        window: Window,
    ) -> Result<Vec<FactRow>, StoreError> {
        let prefix = keys::fact_kind_prefix(feed, kind);
        let start_key = format!("{}{}", prefix, keys::ts_component(window.start));
        let mut rows = Vec::new();

        for item in self.facts_by_ts.range(start_key.as_bytes()..) {
            let (key, primary) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let Some((ts, _, _)) = keys::parse_ts_index_item(&key, prefix.len()) else {
                continue;
            };
            if window.past_end(ts) {
                break;
            }
            if !window.contains(ts) {
                continue;
            }
            if let Some(raw) = self.facts.get(&primary)? {
                rows.push(Self::deserialize::<FactRow>(&raw)?);
            }
        }

        rows.sort_by(|a, b| (a.ts, &a.snapshot_id, &a.entity_id).cmp(&(b.ts, &b.snapshot_id, &b.entity_id)));
        Ok(rows)
    }

    /// The single stored row of a per-entity event kind, if recorded.
    /// Event keys have no snapshot component, so the prefix scans above
    /// never see them.
    pub fn event_fact(
        &self,
        feed: &str,
        kind: &str,
        entity_id: &str,
    ) -> Result<Option<FactRow>, StoreError> {
        let key = keys::fact_event_key(feed, kind, entity_id);
        match self.facts.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every row of a kind regardless of window; the scan path for
    /// event-windowed kinds.
    pub fn all_facts(&self, feed: &str, kind: &str) -> Result<Vec<FactRow>, StoreError> {
        let prefix = keys::fact_kind_prefix(feed, kind);
        let mut rows = Vec::new();
        for item in self.facts.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            rows.push(Self::deserialize::<FactRow>(&raw)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::catalog::feed;

    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path().join("db").to_str().unwrap()).unwrap()
    }

    fn quota_row(entity_id: &str, snapshot_id: &str, ts: i64, usage: i64) -> FactRow {
        FactRow {
            entity_id: entity_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            ts,
            links: BTreeMap::new(),
            metrics: BTreeMap::from([
                ("soft".to_string(), Some(100)),
                ("hard".to_string(), Some(200)),
                ("usage".to_string(), Some(usage)),
            ]),
            labels: BTreeMap::new(),
            event_ts: None,
        }
    }

    fn quota_spec() -> &'static FactKindSpec {
        feed("xfs").unwrap().kind("quota-usage").unwrap()
    }

    fn fs_spec() -> &'static FactKindSpec {
        feed("hnas").unwrap().kind("filesystem-usage").unwrap()
    }

    #[test]
    fn facts_for_orders_by_snapshot_ts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let staged = vec![
            StagedFact::new(quota_spec(), quota_row("e1", "s2", 200, 20)),
            StagedFact::new(quota_spec(), quota_row("e1", "s1", 100, 10)),
            StagedFact::new(quota_spec(), quota_row("e1", "s3", 300, 30)),
        ];
        store.apply_facts("xfs", &staged).unwrap();

        let rows = store
            .facts_for("xfs", "quota-usage", "e1", Window::unbounded())
            .unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![100, 200, 300]);
    }

    #[test]
    fn unique_rewrite_with_identical_content_is_noop() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let row = FactRow {
            metrics: BTreeMap::from([("capacity".to_string(), Some(1000))]),
            ..quota_row("fs1", "s1", 100, 0)
        };
        let first = store
            .apply_facts("hnas", &[StagedFact::new(fs_spec(), row.clone())])
            .unwrap();
        let second = store
            .apply_facts("hnas", &[StagedFact::new(fs_spec(), row)])
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(
            store
                .facts_for("hnas", "filesystem-usage", "fs1", Window::unbounded())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn multi_kind_resend_appends_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let row = quota_row("e1", "s1", 100, 10);
        store
            .apply_facts("xfs", &[StagedFact::new(quota_spec(), row.clone())])
            .unwrap();
        store
            .apply_facts("xfs", &[StagedFact::new(quota_spec(), row)])
            .unwrap();

        // Timestamp-only dedup cannot tell a resend apart; the duplicate
        // row is the documented idempotency gap.
        assert_eq!(
            store
                .facts_for("xfs", "quota-usage", "e1", Window::unbounded())
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn batch_with_invalid_row_leaves_no_facts_behind() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let staged = vec![
            StagedFact::new(quota_spec(), quota_row("e1", "s1", 100, 10)),
            StagedFact::new(quota_spec(), quota_row("e2", "s1", 100, 20)),
            StagedFact::new(quota_spec(), quota_row("", "s1", 100, 30)),
        ];

        let err = store.apply_facts("xfs", &staged).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        assert!(store.all_facts("xfs", "quota-usage").unwrap().is_empty());
        assert!(store
            .facts_in_window("xfs", "quota-usage", Window::unbounded())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn facts_in_window_respects_half_open_bounds() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let staged = vec![
            StagedFact::new(quota_spec(), quota_row("e1", "s1", 100, 10)),
            StagedFact::new(quota_spec(), quota_row("e2", "s2", 200, 20)),
            StagedFact::new(quota_spec(), quota_row("e3", "s3", 300, 30)),
        ];
        store.apply_facts("xfs", &staged).unwrap();

        let rows = store
            .facts_in_window("xfs", "quota-usage", Window::new(100, 300))
            .unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![100, 200]);
    }

    #[test]
    fn per_entity_kind_replaces_in_place() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let job_spec = feed("hpc").unwrap().kind("job").unwrap();

        let mut row = quota_row("job1", "s1", 100, 0);
        row.metrics = BTreeMap::from([("cores".to_string(), Some(4))]);
        row.event_ts = Some(150);
        store
            .apply_facts("hpc", &[StagedFact::new(job_spec, row.clone())])
            .unwrap();

        row.metrics.insert("cores".to_string(), Some(8));
        store
            .apply_facts("hpc", &[StagedFact::new(job_spec, row)])
            .unwrap();

        let rows = store.all_facts("hpc", "job").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metrics["cores"], Some(8));
    }
}
