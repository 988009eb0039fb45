use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::keys;
use crate::store::{Store, StoreError};

/// A named upstream source registered before it may deliver batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Register a new input name. The name is the uniqueness constraint;
    /// a second registration with the same name is a conflict, not an
    /// upsert.
    pub fn register_input(&self, name: &str) -> Result<InputRecord, StoreError> {
        if name.is_empty() {
            return Err(StoreError::Validation("empty input name".to_string()));
        }

        let key = keys::input_key(name);
        let record = InputRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let value = Self::serialize(&record)?;

        match self
            .inputs
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(record),
            Err(_) => Err(StoreError::Conflict {
                entity: "input".to_string(),
                key: name.to_string(),
            }),
        }
    }

    pub fn get_input(&self, name: &str) -> Result<Option<InputRecord>, StoreError> {
        let key = keys::input_key(name);
        match self.inputs.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// All registered inputs in name order.
    pub fn list_inputs(&self, limit: usize, offset: usize) -> Result<Vec<InputRecord>, StoreError> {
        let mut records = Vec::new();
        for item in self.inputs.iter().skip(offset) {
            if records.len() >= limit {
                break;
            }
            let (_, raw) = item?;
            records.push(Self::deserialize(&raw)?);
        }
        Ok(records)
    }
}
