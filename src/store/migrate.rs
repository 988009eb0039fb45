use crate::store::keys;
use crate::store::{Store, StoreError};

const VERSION_KEY: &str = "_meta:version";

type MigrationFn = fn(&Store) -> Result<(), StoreError>;

fn migrations() -> Vec<(&'static str, MigrationFn)> {
    vec![
        ("001_initial", m001_initial),
        ("002_facts_by_ts", m002_facts_by_ts),
    ]
}

/// Run every migration newer than the stored version.
///
/// Each migration must be idempotent: a crash between `func()` and
/// `set_version()` re-runs it on the next start. The version is
/// checkpointed after each step and never moves backwards.
pub fn run(store: &Store) -> Result<(), StoreError> {
    let current = get_current_version(store)?;
    let all = migrations();

    for (index, (name, func)) in all.iter().enumerate() {
        let version = (index + 1) as u32;
        if version > current {
            tracing::info!(version, name, "Running migration");
            func(store)?;
            set_version(store, version)?;
            tracing::info!(version, name, "Migration complete");
        } else {
            tracing::debug!(version, name, "Migration already applied, skipping");
        }
    }

    Ok(())
}

pub fn get_current_version(store: &Store) -> Result<u32, StoreError> {
    match store.meta.get(VERSION_KEY.as_bytes())? {
        Some(raw) => {
            if raw.len() == 4 {
                let bytes: [u8; 4] = raw.as_ref().try_into().unwrap_or([0; 4]);
                Ok(u32::from_be_bytes(bytes))
            } else {
                let text = String::from_utf8(raw.to_vec()).unwrap_or_else(|_| "0".to_string());
                Ok(text.parse::<u32>().unwrap_or(0))
            }
        }
        None => Ok(0),
    }
}

pub fn set_version(store: &Store, version: u32) -> Result<(), StoreError> {
    let current = get_current_version(store)?;
    if version < current {
        return Err(StoreError::Migration {
            version,
            message: format!("Refuse to downgrade from {} to {}", current, version),
        });
    }

    store
        .meta
        .insert(VERSION_KEY.as_bytes(), &version.to_be_bytes())?;
    Ok(())
}

fn m001_initial(_store: &Store) -> Result<(), StoreError> {
    Ok(())
}

/// Rebuild the time-ordered fact index from the facts tree. Snapshotted
/// facts carry a five-part primary key with the zero-padded timestamp in
/// fourth position; per-entity event rows have three parts and are not
/// time-indexed.
fn m002_facts_by_ts(store: &Store) -> Result<(), StoreError> {
    for item in store.facts.iter() {
        let (key, _) = item?;
        let Ok(text) = std::str::from_utf8(&key) else {
            continue;
        };
        let parts: Vec<&str> = text.split(':').collect();
        let [feed, kind, entity_id, ts_text, row_tag] = parts.as_slice() else {
            continue;
        };
        let Ok(ts) = ts_text.parse::<i64>() else {
            continue;
        };

        let index_key = keys::fact_ts_index_key(feed, kind, ts, entity_id, row_tag);
        store
            .facts_by_ts
            .insert(index_key.as_bytes(), text.as_bytes())?;
    }

    Ok(())
}
