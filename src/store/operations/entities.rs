use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::keys;
use crate::store::{Store, StoreError};

const MAX_CAS_ATTEMPTS: u32 = 5;

/// A first-class object with a durable external identity (instance, tenant,
/// filesystem, owner, job...). Created on first reference, never deleted.
/// Descriptive attributes are overwritten in place on each ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    pub kind: String,
    pub natural_key: String,
    pub attrs: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Get-or-create an entity by `(kind, natural_key)` within a feed.
    ///
    /// The secondary index on the natural key is the uniqueness constraint:
    /// concurrent creators race on a compare-and-swap of that index entry,
    /// and the loser re-reads and returns the winner's surrogate id.
    /// Provided attributes overwrite stored ones (last write wins); keys not
    /// present in `attrs` are left untouched.
    pub fn resolve_entity(
        &self,
        feed: &str,
        kind: &str,
        natural_key: &str,
        attrs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, StoreError> {
        if natural_key.is_empty() {
            return Err(StoreError::Validation(format!(
                "empty natural key for entity kind {kind}"
            )));
        }

        let index_key = keys::entity_natural_key(feed, kind, natural_key);

        for _ in 0..MAX_CAS_ATTEMPTS {
            if let Some(raw) = self.entity_keys.get(index_key.as_bytes())? {
                let id = String::from_utf8_lossy(&raw).to_string();
                if !attrs.is_empty() {
                    self.merge_entity_attrs(feed, &id, kind, natural_key, attrs)?;
                }
                return Ok(id);
            }

            let now = Utc::now();
            let record = EntityRecord {
                id: Uuid::new_v4().to_string(),
                kind: kind.to_string(),
                natural_key: natural_key.to_string(),
                attrs: attrs.clone(),
                created_at: now,
                updated_at: now,
            };

            match self.entity_keys.compare_and_swap(
                index_key.as_bytes(),
                None::<&[u8]>,
                Some(record.id.as_bytes()),
            )? {
                Ok(()) => {
                    let primary = keys::entity_key(feed, &record.id);
                    self.entities
                        .insert(primary.as_bytes(), Self::serialize(&record)?)?;
                    return Ok(record.id);
                }
                // Lost the race; loop around and read the winner's id.
                Err(_) => continue,
            }
        }

        Err(StoreError::CasRetryExhausted {
            entity: format!("entity/{kind}"),
            key: natural_key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    fn merge_entity_attrs(
        &self,
        feed: &str,
        entity_id: &str,
        kind: &str,
        natural_key: &str,
        attrs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let primary = keys::entity_key(feed, entity_id);
        let mut record = match self.entities.get(primary.as_bytes())? {
            Some(raw) => Self::deserialize::<EntityRecord>(&raw)?,
            // Index entry without a primary row: recreate rather than fail,
            // the index is authoritative for identity.
            None => EntityRecord {
                id: entity_id.to_string(),
                kind: kind.to_string(),
                natural_key: natural_key.to_string(),
                attrs: BTreeMap::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        };

        for (name, value) in attrs {
            record.attrs.insert(name.clone(), value.clone());
        }
        record.updated_at = Utc::now();

        self.entities
            .insert(primary.as_bytes(), Self::serialize(&record)?)?;
        Ok(())
    }

    pub fn get_entity(&self, feed: &str, entity_id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let key = keys::entity_key(feed, entity_id);
        match self.entities.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read-only natural-key lookup; never creates.
    pub fn find_entity(
        &self,
        feed: &str,
        kind: &str,
        natural_key: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let index_key = keys::entity_natural_key(feed, kind, natural_key);
        match self.entity_keys.get(index_key.as_bytes())? {
            Some(raw) => {
                let id = String::from_utf8_lossy(&raw).to_string();
                self.get_entity(feed, &id)
            }
            None => Ok(None),
        }
    }

    pub fn list_entities(
        &self,
        feed: &str,
        kind: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let prefix = keys::entity_kind_prefix(feed, kind);
        let mut records = Vec::new();
        let mut skipped = 0usize;
        for item in self.entity_keys.scan_prefix(prefix.as_bytes()) {
            if records.len() >= limit {
                break;
            }
            let (_, raw) = item?;
            if skipped < offset {
                skipped += 1;
                continue;
            }
            let id = String::from_utf8_lossy(&raw).to_string();
            if let Some(record) = self.get_entity(feed, &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
