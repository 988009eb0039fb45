//! The five windowed aggregation shapes every derived query specializes.
//!
//! All of them read committed snapshot/fact state only and never write;
//! a summary computed mid-ingest may trail the in-flight batch by design.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::catalog::{Cardinality, FactKindSpec, Summary, WindowBy};
use crate::store::operations::facts::FactRow;
use crate::store::operations::snapshots::Window;
use crate::store::{Store, StoreError};

/// Latest observed state of one entity in a window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestState {
    pub entity_id: String,
    /// Snapshot timestamp of the latest observation.
    pub ts: i64,
    /// Seconds the entity has continuously held the current state name,
    /// bounded by the queried range.
    pub span: i64,
    pub state: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, Option<i64>>,
    pub links: BTreeMap<String, String>,
}

/// Per-entity (optionally per-group) folded metrics for a window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub entity_id: String,
    /// Natural key of the secondary grouping entity, when grouped.
    pub group: Option<String>,
    pub metrics: BTreeMap<String, Option<i64>>,
}

/// One group of a completion-event roll-up.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    /// Natural keys of the grouping entities, in role order.
    pub keys: Vec<String>,
    pub count: u64,
    pub sums: BTreeMap<String, i64>,
}

/// The timestamp that scopes a row into a window for its kind.
fn applicable_ts(spec: &FactKindSpec, row: &FactRow) -> Option<i64> {
    match spec.window_by {
        WindowBy::Snapshot => Some(row.ts),
        WindowBy::EventTs => row.event_ts,
    }
}

/// Fold one sample into a per-field accumulator. `None` means unlimited:
/// it dominates Max (a window that ever saw "no limit" has no limit) and
/// loses Min (any concrete sample is a tighter bound).
fn fold_metric(summary: Summary, acc: Option<i64>, sample: Option<i64>) -> Option<i64> {
    match (summary, acc, sample) {
        (Summary::Max, None, _) | (Summary::Max, _, None) => None,
        (Summary::Max, Some(a), Some(b)) => Some(a.max(b)),
        (Summary::Min, None, s) => s,
        (Summary::Min, a, None) => a,
        (Summary::Min, Some(a), Some(b)) => Some(a.min(b)),
        (Summary::Sum, None, s) => s,
        (Summary::Sum, a, None) => a,
        (Summary::Sum, Some(a), Some(b)) => Some(a + b),
    }
}

impl Store {
    fn rows_in_window(
        &self,
        feed: &str,
        spec: &FactKindSpec,
        window: Window,
    ) -> Result<Vec<FactRow>, StoreError> {
        match spec.window_by {
            WindowBy::Snapshot => self.facts_in_window(feed, spec.name, window),
            WindowBy::EventTs => {
                let mut rows = self.all_facts(feed, spec.name)?;
                rows.retain(|row| matches!(row.event_ts, Some(ts) if window.contains(ts)));
                Ok(rows)
            }
        }
    }

    fn entity_rows_in_window(
        &self,
        feed: &str,
        spec: &FactKindSpec,
        entity_id: &str,
        window: Window,
    ) -> Result<Vec<FactRow>, StoreError> {
        let mut rows = if spec.cardinality == Cardinality::PerEntity {
            self.event_fact(feed, spec.name, entity_id)?
                .into_iter()
                .collect()
        } else {
            self.facts_for(feed, spec.name, entity_id, Window::unbounded())?
        };
        rows.retain(|row| matches!(applicable_ts(spec, row), Some(ts) if window.contains(ts)));
        Ok(rows)
    }

    fn natural_key_of(
        &self,
        feed: &str,
        memo: &mut HashMap<String, String>,
        entity_id: &str,
    ) -> Result<String, StoreError> {
        if let Some(known) = memo.get(entity_id) {
            return Ok(known.clone());
        }
        let key = self
            .get_entity(feed, entity_id)?
            .map(|record| record.natural_key)
            .unwrap_or_else(|| entity_id.to_string());
        memo.insert(entity_id.to_string(), key.clone());
        Ok(key)
    }

    /// Shape 1: the fact with the maximum (ts, snapshot id) in the window,
    /// plus the duration of the most-recent contiguous run of the same
    /// state name. The whole ordered in-window history is retrieved to
    /// find where that run starts; accuracy is preferred over cost here.
    pub fn latest_state(
        &self,
        feed: &str,
        spec: &FactKindSpec,
        entity_id: &str,
        window: Window,
    ) -> Result<Option<LatestState>, StoreError> {
        let history = self.entity_rows_in_window(feed, spec, entity_id, window)?;
        let Some(latest) = history.last() else {
            return Ok(None);
        };

        let state = spec
            .state_label
            .and_then(|label| latest.labels.get(label).cloned());

        let mut run_start_ts = latest.ts;
        match spec.state_label {
            Some(label) => {
                let current = latest.labels.get(label);
                for row in history.iter().rev() {
                    if row.labels.get(label) != current {
                        break;
                    }
                    run_start_ts = row.ts;
                }
            }
            // Without a state label the span degrades to the distance
            // between the oldest and newest observation in range.
            None => {
                if let Some(first) = history.first() {
                    run_start_ts = first.ts;
                }
            }
        }

        Ok(Some(LatestState {
            entity_id: entity_id.to_string(),
            ts: latest.ts,
            span: latest.ts - run_start_ts,
            state,
            labels: latest.labels.clone(),
            metrics: latest.metrics.clone(),
            links: latest.links.clone(),
        }))
    }

    /// Shape 2: per-field peak (or trough) per entity, optionally split by
    /// a secondary link role. Usage counters are point-in-time samples of
    /// "currently used", so the window's true peak is the max of samples;
    /// spikes between samples are invisible, which is a sampling
    /// limitation, not a defect.
    pub fn max_in_window(
        &self,
        feed: &str,
        spec: &FactKindSpec,
        window: Window,
        entity_id: Option<&str>,
        group_role: Option<&str>,
    ) -> Result<Vec<UsageSummary>, StoreError> {
        let rows = match entity_id {
            Some(id) => self.entity_rows_in_window(feed, spec, id, window)?,
            None => self.rows_in_window(feed, spec, window)?,
        };

        let mut buckets: BTreeMap<(String, Option<String>), BTreeMap<String, Option<i64>>> =
            BTreeMap::new();

        for row in &rows {
            let group = match group_role {
                Some(role) => match row.links.get(role) {
                    Some(link_id) => Some(link_id.clone()),
                    // A grouped query drops rows missing the role, the
                    // way an inner join would.
                    None => continue,
                },
                None => None,
            };

            let bucket = buckets
                .entry((row.entity_id.clone(), group))
                .or_default();

            for field in spec.fields {
                let Some(sample) = row.metrics.get(field.name).copied() else {
                    continue;
                };
                match bucket.entry(field.name.to_string()) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        slot.insert(sample);
                    }
                    std::collections::btree_map::Entry::Occupied(mut slot) => {
                        let folded = fold_metric(field.summary, *slot.get(), sample);
                        slot.insert(folded);
                    }
                }
            }
        }

        let mut memo = HashMap::new();
        let mut summaries = Vec::with_capacity(buckets.len());
        for ((entity, group_id), metrics) in buckets {
            let group = match group_id {
                Some(id) => Some(self.natural_key_of(feed, &mut memo, &id)?),
                None => None,
            };
            summaries.push(UsageSummary {
                entity_id: entity,
                group,
                metrics,
            });
        }
        Ok(summaries)
    }

    /// Shape 3: roll-up of completion events whose domain timestamp falls
    /// in the window, grouped by link roles resolved to natural keys.
    /// Rows missing any grouping role are dropped.
    pub fn sum_grouped(
        &self,
        feed: &str,
        spec: &FactKindSpec,
        window: Window,
        roles: &[&str],
    ) -> Result<Vec<GroupSummary>, StoreError> {
        let rows = self.rows_in_window(feed, spec, window)?;

        let mut memo = HashMap::new();
        let mut groups: BTreeMap<Vec<String>, (u64, BTreeMap<String, i64>)> = BTreeMap::new();

        'rows: for row in &rows {
            let mut group_keys = Vec::with_capacity(roles.len());
            for role in roles {
                match row.links.get(*role) {
                    Some(link_id) => {
                        group_keys.push(self.natural_key_of(feed, &mut memo, link_id)?)
                    }
                    None => continue 'rows,
                }
            }

            let (count, sums) = groups.entry(group_keys).or_default();
            *count += 1;
            for field in spec.fields {
                if field.summary != Summary::Sum {
                    continue;
                }
                if let Some(Some(value)) = row.metrics.get(field.name) {
                    *sums.entry(field.name.to_string()).or_insert(0) += value;
                }
            }
        }

        Ok(groups
            .into_iter()
            .map(|(keys, (count, sums))| GroupSummary { keys, count, sums })
            .collect())
    }

    /// Shape 4: the raw ordered time series for one entity, one row per
    /// snapshot it appeared in, for trend display.
    pub fn list_in_window(
        &self,
        feed: &str,
        spec: &FactKindSpec,
        entity_id: &str,
        window: Window,
    ) -> Result<Vec<FactRow>, StoreError> {
        self.entity_rows_in_window(feed, spec, entity_id, window)
    }

    /// Shape 5: distinct entity ids with at least one in-window row whose
    /// `label` value starts with `prefix`. Deduped by entity id, since an
    /// entity appears once per snapshot it was seen in.
    pub fn distinct_members(
        &self,
        feed: &str,
        spec: &FactKindSpec,
        window: Window,
        label: &str,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows = self.rows_in_window(feed, spec, window)?;
        let members: BTreeSet<String> = rows
            .into_iter()
            .filter(|row| {
                row.labels
                    .get(label)
                    .map(|value| value.starts_with(prefix))
                    .unwrap_or(false)
            })
            .map(|row| row.entity_id)
            .collect();
        Ok(members.into_iter().collect())
    }
}
