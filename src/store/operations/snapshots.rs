use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::keys;
use crate::store::{Store, StoreError};

/// Half-open timestamp range `[start, end)`. A bound of `0` means
/// unbounded on that side; the sentinel comes from the query interface
/// this engine sits behind and must be preserved exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn contains(&self, ts: i64) -> bool {
        (self.start == 0 || ts >= self.start) && (self.end == 0 || ts < self.end)
    }

    /// True once an ascending scan has passed the upper bound.
    pub fn past_end(&self, ts: i64) -> bool {
        self.end != 0 && ts >= self.end
    }
}

/// One ingestion instant for one feed; immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: String,
    pub feed: String,
    pub ts: i64,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of `get_or_create_snapshot`. `AlreadyIngested` is only reported
/// when a dedup key was seen before: the whole batch message must then be
/// treated as done and its fact writes skipped.
#[derive(Debug, Clone)]
pub enum SnapshotOutcome {
    Created(SnapshotRecord),
    Existing(SnapshotRecord),
    AlreadyIngested(SnapshotRecord),
}

impl SnapshotOutcome {
    pub fn record(&self) -> &SnapshotRecord {
        match self {
            SnapshotOutcome::Created(r)
            | SnapshotOutcome::Existing(r)
            | SnapshotOutcome::AlreadyIngested(r) => r,
        }
    }

    pub fn already_ingested(&self) -> bool {
        matches!(self, SnapshotOutcome::AlreadyIngested(_))
    }

    pub fn created(&self) -> bool {
        matches!(self, SnapshotOutcome::Created(_))
    }
}

impl Store {
    /// One snapshot per distinct timestamp per feed. The timestamp key is
    /// the uniqueness constraint; a concurrent creator that loses the
    /// compare-and-swap re-reads the winner's row.
    pub fn get_or_create_snapshot(
        &self,
        feed: &str,
        ts: i64,
        dedup_key: Option<&str>,
    ) -> Result<SnapshotOutcome, StoreError> {
        if ts <= 0 {
            return Err(StoreError::Validation(format!(
                "snapshot timestamp must be positive, got {ts}"
            )));
        }

        if let Some(dedup) = dedup_key {
            let dk = keys::snapshot_dedup_key(feed, dedup);
            if let Some(raw) = self.snapshot_dedup.get(dk.as_bytes())? {
                let marked_ts: i64 = String::from_utf8_lossy(&raw).parse().unwrap_or(0);
                if let Some(record) = self.get_snapshot_at(feed, marked_ts)? {
                    return Ok(SnapshotOutcome::AlreadyIngested(record));
                }
            }
        }

        let primary = keys::snapshot_key(feed, ts);
        loop {
            if let Some(raw) = self.snapshots.get(primary.as_bytes())? {
                let record: SnapshotRecord = Self::deserialize(&raw)?;
                self.mark_dedup(feed, ts, dedup_key)?;
                return Ok(SnapshotOutcome::Existing(record));
            }

            let record = SnapshotRecord {
                id: Uuid::new_v4().to_string(),
                feed: feed.to_string(),
                ts,
                dedup_key: dedup_key.map(str::to_string),
                created_at: Utc::now(),
            };
            let value = Self::serialize(&record)?;

            match self
                .snapshots
                .compare_and_swap(primary.as_bytes(), None::<&[u8]>, Some(value))?
            {
                Ok(()) => {
                    self.mark_dedup(feed, ts, dedup_key)?;
                    return Ok(SnapshotOutcome::Created(record));
                }
                Err(_) => continue,
            }
        }
    }

    fn mark_dedup(&self, feed: &str, ts: i64, dedup_key: Option<&str>) -> Result<(), StoreError> {
        if let Some(dedup) = dedup_key {
            let dk = keys::snapshot_dedup_key(feed, dedup);
            self.snapshot_dedup
                .insert(dk.as_bytes(), ts.to_string().as_bytes())?;
        }
        Ok(())
    }

    pub fn get_snapshot_at(&self, feed: &str, ts: i64) -> Result<Option<SnapshotRecord>, StoreError> {
        let key = keys::snapshot_key(feed, ts);
        match self.snapshots.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Snapshots whose timestamp falls in the window, ascending by ts.
    pub fn snapshots_in_window(
        &self,
        feed: &str,
        window: Window,
    ) -> Result<Vec<SnapshotRecord>, StoreError> {
        let prefix = keys::snapshot_prefix(feed);
        let start_key = keys::snapshot_key(feed, window.start);
        let mut records = Vec::new();

        for item in self.snapshots.range(start_key.as_bytes()..) {
            let (key, raw) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let Some(ts) = keys::parse_snapshot_item(&key, prefix.len()) else {
                continue;
            };
            if window.past_end(ts) {
                break;
            }
            if window.contains(ts) {
                records.push(Self::deserialize(&raw)?);
            }
        }

        Ok(records)
    }

    pub fn snapshot_ids_in_window(
        &self,
        feed: &str,
        window: Window,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .snapshots_in_window(feed, window)?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }

    /// The snapshot with the maximum timestamp inside the window, if any.
    pub fn latest_snapshot(
        &self,
        feed: &str,
        window: Window,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.snapshots_in_window(feed, window)?.into_iter().last())
    }
}
