//! Persisted revision watermark for incremental autolink passes.

use personlink_core::store::{DocumentStore, KIND_FIELD};
use personlink_core::{Error, FilterCondition, Query, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Fixed id of the singleton watermark document.
pub const WATERMARK_ID: &str = "linker-watch-revision";

/// The highest contact revision whose changes have been fully linked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchRevisionNumber {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_number: Option<u64>,
}

impl WatchRevisionNumber {
    pub const KIND: &'static str = "watchRevisionNumber";

    pub fn to_document(&self) -> Result<Value> {
        let mut doc = serde_json::to_value(self)?;
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| Error::Serialization("watermark is not an object".to_string()))?;
        obj.insert("_id".to_string(), Value::from(WATERMARK_ID));
        obj.insert(KIND_FIELD.to_string(), Value::from(Self::KIND));
        Ok(doc)
    }
}

/// Loads and saves the [`WatchRevisionNumber`] singleton.
#[derive(Clone)]
pub struct WatermarkStore {
    store: Arc<dyn DocumentStore>,
}

impl WatermarkStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// The stored watermark, `None` when no pass has ever completed.
    pub async fn load(&self) -> Result<Option<u64>> {
        let query = Query::new(WatchRevisionNumber::KIND)
            .filter(FilterCondition::equals("_id", WATERMARK_ID))
            .limit(1);
        let Some(doc) = self.store.find(&query).await?.results.into_iter().next() else {
            return Ok(None);
        };
        let current: WatchRevisionNumber = serde_json::from_value(doc)?;
        Ok(current.revision_number)
    }

    /// Persist `revision` unless it would move the watermark backwards.
    pub async fn save(&self, revision: u64) -> Result<u64> {
        if let Some(existing) = self.load().await? {
            if existing >= revision {
                debug!("Watermark {} already at or past {}", existing, revision);
                return Ok(existing);
            }
        }
        let doc = WatchRevisionNumber {
            id: Some(WATERMARK_ID.to_string()),
            revision_number: Some(revision),
        }
        .to_document()?;
        self.store.put(vec![doc]).await?;
        debug!("Saved watermark {}", revision);
        Ok(revision)
    }
}
