use crate::filter::{Filter, Query};
use crate::store::{
    doc_id, doc_rev, BatchOperation, BatchResponse, DocumentStore, FindResult, PutResult,
    DEFAULT_PAGE_SIZE, DEL_FIELD, ID_FIELD, KIND_FIELD, REV_FIELD,
};
use crate::{Error, Result};
use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory document store with a single monotonic revision counter.
///
/// The `apply_*` methods perform a mutation and hand back the stored
/// documents exactly as written, which is what the durable layer logs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<AHashMap<String, Value>>>,
    last_rev: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.docs.read().len()
    }

    /// Highest revision handed out so far
    pub fn current_rev(&self) -> u64 {
        self.last_rev.load(Ordering::SeqCst)
    }

    fn next_rev(&self) -> u64 {
        self.last_rev.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Every stored document, deleted ones included.
    pub fn documents(&self) -> Vec<Value> {
        let mut docs: Vec<Value> = self.docs.read().values().cloned().collect();
        docs.sort_by_key(|d| doc_rev(d).unwrap_or(0));
        docs
    }

    /// Insert a document verbatim, keeping its revision. Used for recovery.
    pub fn restore(&self, doc: Value) -> Result<()> {
        let id = doc_id(&doc)
            .ok_or_else(|| Error::InvalidDocument("restored document has no _id".to_string()))?
            .to_string();
        let rev = doc_rev(&doc).unwrap_or(0);
        self.last_rev.fetch_max(rev, Ordering::SeqCst);
        self.docs.write().insert(id, doc);
        Ok(())
    }

    /// Raise the revision counter to at least `rev`
    pub fn restore_rev(&self, rev: u64) {
        self.last_rev.fetch_max(rev, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.docs.write().clear();
        self.last_rev.store(0, Ordering::SeqCst);
    }

    pub fn apply_put(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        for doc in &docs {
            if !doc.is_object() {
                return Err(Error::InvalidDocument(
                    "document must be a JSON object".to_string(),
                ));
            }
            if !doc.get(KIND_FIELD).map(Value::is_string).unwrap_or(false) {
                return Err(Error::InvalidDocument("document has no _kind".to_string()));
            }
        }
        let mut written = Vec::with_capacity(docs.len());
        let mut map = self.docs.write();
        for mut doc in docs {
            let Some(obj) = doc.as_object_mut() else {
                continue;
            };
            let id = match obj.get(ID_FIELD).and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => uuid::Uuid::new_v4().to_string(),
            };
            obj.insert(ID_FIELD.to_string(), Value::from(id.clone()));
            obj.insert(REV_FIELD.to_string(), Value::from(self.next_rev()));
            if !obj.contains_key(DEL_FIELD) {
                obj.insert(DEL_FIELD.to_string(), Value::Bool(false));
            }
            map.insert(id, doc.clone());
            written.push(doc);
        }
        Ok(written)
    }

    pub fn apply_merge(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut written = Vec::with_capacity(docs.len());
        let mut map = self.docs.write();
        for doc in docs {
            let id = doc_id(&doc)
                .ok_or_else(|| Error::InvalidDocument("merge requires an _id".to_string()))?
                .to_string();
            let existing = map
                .get_mut(&id)
                .ok_or_else(|| Error::DocumentNotFound(id.clone()))?;
            if let (Some(target), Some(fields)) = (existing.as_object_mut(), doc.as_object()) {
                for (key, value) in fields {
                    if key != REV_FIELD && key != KIND_FIELD {
                        target.insert(key.clone(), value.clone());
                    }
                }
                target.insert(REV_FIELD.to_string(), Value::from(self.next_rev()));
            }
            written.push(existing.clone());
        }
        Ok(written)
    }

    pub fn apply_del(&self, ids: &[String]) -> Vec<Value> {
        let mut written = Vec::new();
        let mut map = self.docs.write();
        for id in ids {
            if let Some(doc) = map.get_mut(id) {
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert(DEL_FIELD.to_string(), Value::Bool(true));
                    obj.insert(REV_FIELD.to_string(), Value::from(self.next_rev()));
                }
                written.push(doc.clone());
            }
        }
        written
    }

    pub fn apply_del_query(&self, query: &Query) -> Vec<Value> {
        let live = Query {
            include_deleted: false,
            ..query.clone()
        };
        let ids: Vec<String> = self
            .docs
            .read()
            .values()
            .filter(|d| live.matches(d))
            .filter_map(|d| doc_id(d).map(str::to_string))
            .collect();
        self.apply_del(&ids)
    }

    /// Evaluate `query` and cut one page out of the ordered result set.
    pub fn find_page(&self, query: &Query) -> Result<FindResult> {
        let after = match &query.page {
            Some(page) => Some(decode_page_key(page)?),
            None => None,
        };
        let map = self.docs.read();
        let mut matched: Vec<((Value, String), &Value)> = map
            .values()
            .filter(|d| query.matches(d))
            .map(|d| (query.sort_key(d), d))
            .collect();
        matched.sort_by(|a, b| query.compare_keys(&a.0, &b.0));

        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let mut remaining = matched
            .into_iter()
            .filter(|(key, _)| match &after {
                Some(after) => query.compare_keys(key, after) == std::cmp::Ordering::Greater,
                None => true,
            })
            .peekable();

        let mut results = Vec::new();
        let mut last_key = None;
        while results.len() < limit {
            match remaining.next() {
                Some((key, doc)) => {
                    results.push(doc.clone());
                    last_key = Some(key);
                }
                None => break,
            }
        }
        let next = match (remaining.peek(), last_key) {
            (Some(_), Some(key)) => Some(encode_page_key(&key)?),
            _ => None,
        };
        Ok(FindResult { results, next })
    }
}

fn encode_page_key(key: &(Value, String)) -> Result<String> {
    Ok(serde_json::to_string(&[key.0.clone(), Value::from(key.1.clone())])?)
}

fn decode_page_key(page: &str) -> Result<(Value, String)> {
    let parts: Vec<Value> = serde_json::from_str(page)
        .map_err(|e| Error::InvalidParameter(format!("bad page key: {}", e)))?;
    match parts.as_slice() {
        [value, Value::String(id)] => Ok((value.clone(), id.clone())),
        _ => Err(Error::InvalidParameter(format!("bad page key: {}", page))),
    }
}

fn put_results(docs: &[Value]) -> Vec<PutResult> {
    docs.iter()
        .filter_map(|d| {
            Some(PutResult {
                id: doc_id(d)?.to_string(),
                rev: doc_rev(d)?,
            })
        })
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, query: &Query) -> Result<FindResult> {
        self.find_page(query)
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<Value>> {
        let map = self.docs.read();
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    async fn put(&self, docs: Vec<Value>) -> Result<Vec<PutResult>> {
        Ok(put_results(&self.apply_put(docs)?))
    }

    async fn merge(&self, docs: Vec<Value>) -> Result<Vec<PutResult>> {
        Ok(put_results(&self.apply_merge(docs)?))
    }

    async fn del(&self, ids: &[String]) -> Result<Vec<PutResult>> {
        Ok(put_results(&self.apply_del(ids)))
    }

    async fn del_query(&self, query: &Query) -> Result<usize> {
        Ok(self.apply_del_query(query).len())
    }

    async fn execute_batch(&self, ops: Vec<BatchOperation>) -> Result<Vec<BatchResponse>> {
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(match op {
                BatchOperation::Put { objects } => {
                    BatchResponse::Put(put_results(&self.apply_put(objects)?))
                }
                BatchOperation::Merge { objects } => {
                    BatchResponse::Merge(put_results(&self.apply_merge(objects)?))
                }
                BatchOperation::Del { ids } => BatchResponse::Del(put_results(&self.apply_del(&ids))),
                BatchOperation::DelQuery { query } => {
                    BatchResponse::DelQuery(self.apply_del_query(&query).len())
                }
            });
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterCondition;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_assigns_id_and_monotonic_rev() {
        let store = MemoryStore::new();
        let first = store.put(vec![json!({"_kind": "contact"})]).await.unwrap();
        let second = store.put(vec![json!({"_kind": "contact", "_id": "c2"})]).await.unwrap();
        assert!(!first[0].id.is_empty());
        assert_eq!(second[0].id, "c2");
        assert!(second[0].rev > first[0].rev);
    }

    #[tokio::test]
    async fn test_put_rejects_missing_kind() {
        let store = MemoryStore::new();
        assert!(store.put(vec![json!({"name": "x"})]).await.is_err());
    }

    #[tokio::test]
    async fn test_soft_delete_bumps_rev_and_hides_from_find() {
        let store = MemoryStore::new();
        let put = store.put(vec![json!({"_kind": "contact", "_id": "c1"})]).await.unwrap();
        let del = store.del(&["c1".to_string()]).await.unwrap();
        assert!(del[0].rev > put[0].rev);

        let live = store.find(&Query::new("contact")).await.unwrap();
        assert!(live.results.is_empty());

        let all = store
            .find(&Query::new("contact").include_deleted(true))
            .await
            .unwrap();
        assert_eq!(all.results.len(), 1);

        let fetched = store.get(&["c1".to_string()]).await.unwrap();
        assert_eq!(fetched[0]["_del"], json!(true));
    }

    #[tokio::test]
    async fn test_pagination_follows_rev_order() {
        let store = MemoryStore::new();
        for i in 0..7 {
            store
                .put(vec![json!({"_kind": "contact", "n": i})])
                .await
                .unwrap();
        }
        let query = Query::new("contact").order_by("_rev").limit(3);
        let first = store.find(&query).await.unwrap();
        assert_eq!(first.results.len(), 3);
        assert!(first.next.is_some());

        let all = store.find_all(&query).await.unwrap();
        let ns: Vec<i64> = all.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_merge_and_del_query() {
        let store = MemoryStore::new();
        store
            .put(vec![
                json!({"_kind": "manualLink", "_id": "l1", "contactEntityA": "a"}),
                json!({"_kind": "manualLink", "_id": "l2", "contactEntityA": "b"}),
            ])
            .await
            .unwrap();
        store
            .merge(vec![json!({"_id": "l2", "contactEntityA": "a"})])
            .await
            .unwrap();
        let removed = store
            .del_query(&Query::new("manualLink").filter(FilterCondition::equals("contactEntityA", "a")))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.del_query(&Query::new("manualLink")).await.unwrap(), 0);
    }

    #[test]
    fn test_restore_advances_rev_counter() {
        let store = MemoryStore::new();
        store
            .restore(json!({"_id": "x", "_kind": "person", "_rev": 41}))
            .unwrap();
        assert_eq!(store.current_rev(), 41);
        let written = store.apply_put(vec![json!({"_kind": "person"})]).unwrap();
        assert_eq!(doc_rev(&written[0]), Some(42));
    }
}
