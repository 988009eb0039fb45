//! Two-pass batch ingestion.
//!
//! Pass 1 resolves entities and stages fact rows; pass 2 applies the whole
//! batch in one store transaction. Malformed records are skipped and
//! counted, never turned into a batch failure.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::catalog::FeedSpec;
use crate::store::operations::facts::{FactRow, StagedFact};
use crate::store::{Store, StoreError};

/// Entity reference inside an incoming record, by natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub kind: String,
    pub natural_key: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
}

impl EntityRef {
    pub fn new(kind: &str, natural_key: &str) -> Self {
        Self {
            kind: kind.to_string(),
            natural_key: natural_key.to_string(),
            attrs: BTreeMap::new(),
        }
    }
}

/// One record of an incoming message, before entity resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInput {
    pub fact_kind: String,
    pub entity: EntityRef,
    /// Role name to linked entity, resolved during staging.
    #[serde(default)]
    pub links: Vec<(String, EntityRef)>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Option<i64>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub event_ts: Option<i64>,
}

/// One delivery from a collector: a schema tag, the capture instant, and
/// the records observed at that instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMessage {
    pub schema: String,
    pub timestamp: i64,
    #[serde(default)]
    pub dedup_key: Option<String>,
    pub records: Vec<RecordInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub snapshots_created: usize,
    pub facts_written: usize,
    pub records_skipped: usize,
    pub messages_skipped: usize,
}

/// Bounded map from (kind, natural key) to surrogate id, evicting the
/// least recently touched entry at capacity. Repeated owners across the
/// rows of a large report hit the cache instead of the store.
#[derive(Debug)]
pub struct ResolverCache {
    capacity: usize,
    entries: HashMap<(String, String), String>,
    order: VecDeque<(String, String)>,
}

impl ResolverCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, kind: &str, natural_key: &str) -> Option<String> {
        let key = (kind.to_string(), natural_key.to_string());
        let id = self.entries.get(&key)?.clone();
        self.touch(&key);
        Some(id)
    }

    pub fn insert(&mut self, kind: &str, natural_key: &str, id: String) {
        let key = (kind.to_string(), natural_key.to_string());
        if self.entries.insert(key.clone(), id).is_none() {
            if self.entries.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
            self.order.push_back(key);
        } else {
            self.touch(&key);
        }
    }

    fn touch(&mut self, key: &(String, String)) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
            self.order.push_back(key.clone());
        }
    }
}

/// Parse an allocation number from a `name-123` or `name-a123` suffix.
/// Returns `None` for names that do not follow the convention.
pub fn extract_allocation(name: &str) -> Option<i64> {
    let lowered = name.to_lowercase();
    // A bare number with no separator is an id, not a suffix.
    let (_, suffix) = lowered.rsplit_once('-')?;
    let digits = suffix.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok()
}

fn resolve_cached(
    store: &Store,
    feed: &str,
    cache: &mut ResolverCache,
    entity: &EntityRef,
    extra_attrs: Option<(&str, serde_json::Value)>,
) -> Result<String, StoreError> {
    // Attribute-carrying references always reach the store so that the
    // last write wins; bare references can be served from the cache.
    if entity.attrs.is_empty() && extra_attrs.is_none() {
        if let Some(id) = cache.get(&entity.kind, &entity.natural_key) {
            return Ok(id);
        }
    }

    let id = match extra_attrs {
        Some((name, value)) => {
            let mut attrs = entity.attrs.clone();
            attrs.entry(name.to_string()).or_insert(value);
            store.resolve_entity(feed, &entity.kind, &entity.natural_key, &attrs)?
        }
        None => store.resolve_entity(feed, &entity.kind, &entity.natural_key, &entity.attrs)?,
    };
    cache.insert(&entity.kind, &entity.natural_key, id.clone());
    Ok(id)
}

/// Ingest a batch of messages for one feed.
///
/// Message-level idempotency is per feed: `dedup_by_message` feeds skip a
/// resend with a seen dedup key wholesale, `dedup_in_batch` feeds skip
/// repeated timestamps within the batch, and other feeds re-process a
/// resend at the same timestamp (duplicate Multi rows are the documented
/// gap of timestamp-only dedup).
pub fn run_batch(
    store: &Store,
    feed: &'static FeedSpec,
    messages: &[IngestMessage],
    cache: &mut ResolverCache,
) -> Result<IngestReport, StoreError> {
    let mut report = IngestReport::default();
    let mut staged: Vec<StagedFact> = Vec::new();
    let mut seen_ts: HashSet<i64> = HashSet::new();

    for message in messages {
        if !feed.accepts_schema(&message.schema) {
            tracing::debug!(feed = feed.name, schema = %message.schema, "Schema not accepted, skipping message");
            report.messages_skipped += 1;
            continue;
        }
        if feed.dedup_in_batch && !seen_ts.insert(message.timestamp) {
            tracing::debug!(feed = feed.name, ts = message.timestamp, "Repeated timestamp in batch, skipping message");
            report.messages_skipped += 1;
            continue;
        }

        let dedup_key = if feed.dedup_by_message {
            message.dedup_key.as_deref()
        } else {
            None
        };
        let outcome = store.get_or_create_snapshot(feed.name, message.timestamp, dedup_key)?;
        if outcome.already_ingested() {
            tracing::info!(feed = feed.name, ts = message.timestamp, "Message already ingested, skipping");
            report.messages_skipped += 1;
            continue;
        }
        if outcome.created() {
            report.snapshots_created += 1;
        }
        let snapshot = outcome.record().clone();

        for record in &message.records {
            let Some(kind_spec) = feed.kind(&record.fact_kind) else {
                tracing::warn!(feed = feed.name, kind = %record.fact_kind, "Unknown fact kind, skipping record");
                report.records_skipped += 1;
                continue;
            };
            if record.entity.natural_key.is_empty() {
                tracing::warn!(feed = feed.name, kind = %record.fact_kind, "Record without a natural key, skipping");
                report.records_skipped += 1;
                continue;
            }

            let derived = if feed.derive_allocation {
                extract_allocation(&record.entity.natural_key)
                    .map(|allocation| ("allocation", serde_json::Value::from(allocation)))
            } else {
                None
            };
            let entity_id = resolve_cached(store, feed.name, cache, &record.entity, derived)?;

            let mut links = BTreeMap::new();
            for (role, link) in &record.links {
                // A broken link drops the role only, never the record.
                if link.natural_key.is_empty() {
                    tracing::debug!(feed = feed.name, role = %role, "Link without a natural key, dropped");
                    continue;
                }
                let link_id = resolve_cached(store, feed.name, cache, link, None)?;
                links.insert(role.clone(), link_id);
            }

            staged.push(StagedFact::new(
                kind_spec,
                FactRow {
                    entity_id,
                    snapshot_id: snapshot.id.clone(),
                    ts: snapshot.ts,
                    links,
                    metrics: record.metrics.clone(),
                    labels: record.labels.clone(),
                    event_ts: record.event_ts,
                },
            ));
        }
    }

    report.facts_written = store.apply_facts(feed.name, &staged)?;
    tracing::info!(
        feed = feed.name,
        snapshots = report.snapshots_created,
        facts = report.facts_written,
        skipped_records = report.records_skipped,
        skipped_messages = report.messages_skipped,
        "Batch ingested"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::catalog::feed;
    use crate::store::operations::snapshots::Window;

    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path().join("db").to_str().unwrap()).unwrap()
    }

    fn quota_record(fs: &str, owner: &str, usage: i64) -> RecordInput {
        RecordInput {
            fact_kind: "quota-usage".to_string(),
            entity: EntityRef::new("filesystem", fs),
            links: vec![("owner".to_string(), EntityRef::new("owner", owner))],
            metrics: BTreeMap::from([
                ("soft".to_string(), Some(100)),
                ("hard".to_string(), Some(200)),
                ("usage".to_string(), Some(usage)),
            ]),
            labels: BTreeMap::new(),
            event_ts: None,
        }
    }

    fn xfs_message(ts: i64, dedup: Option<&str>, records: Vec<RecordInput>) -> IngestMessage {
        IngestMessage {
            schema: "xfs.quota.report".to_string(),
            timestamp: ts,
            dedup_key: dedup.map(str::to_string),
            records,
        }
    }

    #[test]
    fn batch_resolves_entities_and_writes_facts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let spec = feed("xfs").unwrap();
        let mut cache = ResolverCache::new(100);

        let report = run_batch(
            &store,
            spec,
            &[xfs_message(
                1_000,
                Some("msg-1"),
                vec![quota_record("fs1", "alice", 10), quota_record("fs1", "bob", 7)],
            )],
            &mut cache,
        )
        .unwrap();

        assert_eq!(report.snapshots_created, 1);
        assert_eq!(report.facts_written, 2);
        assert_eq!(report.records_skipped, 0);

        let fs = store.find_entity("xfs", "filesystem", "fs1").unwrap().unwrap();
        let rows = store
            .facts_for("xfs", "quota-usage", &fs.id, Window::unbounded())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.links.contains_key("owner")));
    }

    #[test]
    fn dedup_key_resend_is_skipped_wholesale() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let spec = feed("xfs").unwrap();
        let mut cache = ResolverCache::new(100);

        let message = xfs_message(1_000, Some("msg-1"), vec![quota_record("fs1", "alice", 10)]);
        run_batch(&store, spec, &[message.clone()], &mut cache).unwrap();
        let resend = run_batch(&store, spec, &[message], &mut cache).unwrap();

        assert_eq!(resend.messages_skipped, 1);
        assert_eq!(resend.facts_written, 0);

        let fs = store.find_entity("xfs", "filesystem", "fs1").unwrap().unwrap();
        assert_eq!(
            store
                .facts_for("xfs", "quota-usage", &fs.id, Window::unbounded())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn resend_without_dedup_key_duplicates_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let spec = feed("xfs").unwrap();
        let mut cache = ResolverCache::new(100);

        let message = xfs_message(1_000, None, vec![quota_record("fs1", "alice", 10)]);
        run_batch(&store, spec, &[message.clone()], &mut cache).unwrap();
        run_batch(&store, spec, &[message], &mut cache).unwrap();

        let fs = store.find_entity("xfs", "filesystem", "fs1").unwrap().unwrap();
        assert_eq!(
            store
                .facts_for("xfs", "quota-usage", &fs.id, Window::unbounded())
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn in_batch_timestamp_dedup_for_hcp() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let spec = feed("hcp").unwrap();
        let mut cache = ResolverCache::new(100);

        let record = RecordInput {
            fact_kind: "namespace-usage".to_string(),
            entity: EntityRef::new("namespace", "astro-tb100"),
            links: vec![],
            metrics: BTreeMap::from([("objects".to_string(), Some(5))]),
            labels: BTreeMap::new(),
            event_ts: None,
        };
        let message = IngestMessage {
            schema: "hcp.tenants".to_string(),
            timestamp: 1_000,
            dedup_key: None,
            records: vec![record],
        };

        let report = run_batch(&store, spec, &[message.clone(), message], &mut cache).unwrap();
        assert_eq!(report.messages_skipped, 1);
        assert_eq!(report.facts_written, 1);

        let namespace = store
            .find_entity("hcp", "namespace", "astro-tb100")
            .unwrap()
            .unwrap();
        assert_eq!(namespace.attrs["allocation"], serde_json::Value::from(100));
    }

    #[test]
    fn wrong_schema_and_bad_records_skip_not_fail() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let spec = feed("xfs").unwrap();
        let mut cache = ResolverCache::new(100);

        let mut unknown_kind = quota_record("fs1", "alice", 10);
        unknown_kind.fact_kind = "mystery".to_string();
        let missing_key = quota_record("", "alice", 10);
        let mut broken_link = quota_record("fs2", "", 5);
        broken_link.links = vec![("owner".to_string(), EntityRef::new("owner", ""))];

        let report = run_batch(
            &store,
            spec,
            &[
                IngestMessage {
                    schema: "not.xfs".to_string(),
                    timestamp: 900,
                    dedup_key: None,
                    records: vec![quota_record("fs1", "alice", 10)],
                },
                xfs_message(1_000, None, vec![unknown_kind, missing_key, broken_link]),
            ],
            &mut cache,
        )
        .unwrap();

        assert_eq!(report.messages_skipped, 1);
        assert_eq!(report.records_skipped, 2);
        // The broken-link record survives without its owner role.
        assert_eq!(report.facts_written, 1);

        let fs = store.find_entity("xfs", "filesystem", "fs2").unwrap().unwrap();
        let rows = store
            .facts_for("xfs", "quota-usage", &fs.id, Window::unbounded())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].links.is_empty());
    }

    #[test]
    fn bulk_and_serial_application_agree() {
        let dir = tempdir().unwrap();
        let bulk_store = open_store(&dir);
        let serial_dir = tempdir().unwrap();
        let serial_store = open_store(&serial_dir);
        let spec = feed("xfs").unwrap().kind("quota-usage").unwrap();

        let staged: Vec<StagedFact> = (0..10)
            .map(|i| {
                StagedFact::new(
                    spec,
                    FactRow {
                        entity_id: format!("fs{}", i % 3),
                        snapshot_id: "s1".to_string(),
                        ts: 1_000,
                        links: BTreeMap::new(),
                        metrics: BTreeMap::from([("usage".to_string(), Some(i))]),
                        labels: BTreeMap::new(),
                        event_ts: None,
                    },
                )
            })
            .collect();

        let bulk = bulk_store.apply_facts("xfs", &staged).unwrap();
        let serial = serial_store.apply_facts_serial("xfs", &staged).unwrap();
        assert_eq!(bulk, serial);

        for entity in ["fs0", "fs1", "fs2"] {
            let bulk_rows = bulk_store
                .facts_for("xfs", "quota-usage", entity, Window::unbounded())
                .unwrap();
            let serial_rows = serial_store
                .facts_for("xfs", "quota-usage", entity, Window::unbounded())
                .unwrap();
            assert_eq!(bulk_rows, serial_rows);
        }
    }

    #[test]
    fn resolver_cache_is_bounded_and_lru() {
        let mut cache = ResolverCache::new(2);
        cache.insert("owner", "a", "id-a".to_string());
        cache.insert("owner", "b", "id-b".to_string());

        // Touch "a" so "b" is the eviction candidate.
        assert_eq!(cache.get("owner", "a").as_deref(), Some("id-a"));
        cache.insert("owner", "c", "id-c".to_string());

        assert_eq!(cache.len(), 2);
        assert!(cache.get("owner", "b").is_none());
        assert_eq!(cache.get("owner", "a").as_deref(), Some("id-a"));
        assert_eq!(cache.get("owner", "c").as_deref(), Some("id-c"));
    }

    #[test]
    fn extract_allocation_parses_suffix_conventions() {
        assert_eq!(extract_allocation("astro-tb100"), Some(100));
        assert_eq!(extract_allocation("ASTRO-TB100"), Some(100));
        assert_eq!(extract_allocation("data-42"), Some(42));
        assert_eq!(extract_allocation("multi-part-name-x7"), Some(7));
        assert_eq!(extract_allocation("no-digits-here"), None);
        assert_eq!(extract_allocation("plain"), None);
        assert_eq!(extract_allocation("12345"), None);
        assert_eq!(extract_allocation(""), None);
    }
}
