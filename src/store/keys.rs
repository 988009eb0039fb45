//! Key layouts for the sled trees.
//!
//! Timestamp components are zero-padded to 20 digits so that lexicographic
//! key order matches numeric order; window queries are then plain ordered
//! scans.

/// Width of the zero-padded timestamp component.
const TS_WIDTH: usize = 20;

pub fn ts_component(ts: i64) -> String {
    format!("{:0width$}", ts.max(0), width = TS_WIDTH)
}

pub fn entity_key(feed: &str, entity_id: &str) -> String {
    format!("{}:{}", feed, entity_id)
}

pub fn entity_natural_key(feed: &str, kind: &str, natural_key: &str) -> String {
    format!("{}:{}:{}", feed, kind, natural_key)
}

pub fn entity_kind_prefix(feed: &str, kind: &str) -> String {
    format!("{}:{}:", feed, kind)
}

pub fn snapshot_key(feed: &str, ts: i64) -> String {
    format!("{}:{}", feed, ts_component(ts))
}

pub fn snapshot_prefix(feed: &str) -> String {
    format!("{}:", feed)
}

pub fn snapshot_dedup_key(feed: &str, dedup_key: &str) -> String {
    format!("{}:{}", feed, dedup_key)
}

/// Primary fact key for kinds with at most one row per (entity, snapshot).
pub fn fact_unique_key(feed: &str, kind: &str, entity_id: &str, ts: i64) -> String {
    format!("{}:{}:{}:{}:0", feed, kind, entity_id, ts_component(ts))
}

/// Primary fact key for kinds with many rows per (entity, snapshot); the
/// row tag makes each append distinct.
pub fn fact_multi_key(feed: &str, kind: &str, entity_id: &str, ts: i64, row_tag: &str) -> String {
    format!("{}:{}:{}:{}:{}", feed, kind, entity_id, ts_component(ts), row_tag)
}

/// Primary fact key for one-row-per-entity kinds (completion events);
/// re-ingest replaces the row in place.
pub fn fact_event_key(feed: &str, kind: &str, entity_id: &str) -> String {
    format!("{}:{}:{}", feed, kind, entity_id)
}

pub fn fact_entity_prefix(feed: &str, kind: &str, entity_id: &str) -> String {
    format!("{}:{}:{}:", feed, kind, entity_id)
}

pub fn fact_kind_prefix(feed: &str, kind: &str) -> String {
    format!("{}:{}:", feed, kind)
}

/// Time-ordered secondary index entry; value stores the primary key bytes.
pub fn fact_ts_index_key(feed: &str, kind: &str, ts: i64, entity_id: &str, row_tag: &str) -> String {
    format!("{}:{}:{}:{}:{}", feed, kind, ts_component(ts), entity_id, row_tag)
}

/// Parse `{ts}:{entity_id}:{row_tag}` out of a ts-index key once the
/// `{feed}:{kind}:` prefix has been stripped.
pub fn parse_ts_index_item(key: &[u8], prefix_len: usize) -> Option<(i64, String, String)> {
    let text = std::str::from_utf8(key).ok()?;
    let rest = text.get(prefix_len..)?;
    let mut parts = rest.splitn(3, ':');
    let ts = parts.next()?.parse::<i64>().ok()?;
    let entity_id = parts.next()?.to_string();
    let row_tag = parts.next()?.to_string();
    Some((ts, entity_id, row_tag))
}

/// Parse the timestamp out of a snapshot key once the `{feed}:` prefix has
/// been stripped.
pub fn parse_snapshot_item(key: &[u8], prefix_len: usize) -> Option<i64> {
    let text = std::str::from_utf8(key).ok()?;
    text.get(prefix_len..)?.parse::<i64>().ok()
}

pub fn input_key(name: &str) -> String {
    name.to_string()
}
