//! The document store contract the linker runs against.
//!
//! Documents are JSON objects carrying the reserved fields `_id`, `_kind`,
//! `_rev` and `_del`. Deletes are soft: a deleted document keeps its id,
//! gets `_del: true` and a fresh revision, so incremental readers that ask
//! for `include_deleted` observe it.

use crate::filter::Query;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ID_FIELD: &str = "_id";
pub const KIND_FIELD: &str = "_kind";
pub const REV_FIELD: &str = "_rev";
pub const DEL_FIELD: &str = "_del";

/// Default page size handed out by stores when a query has no limit.
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindResult {
    pub results: Vec<Value>,
    /// Opaque key for the next page, absent on the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResult {
    pub id: String,
    pub rev: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum BatchOperation {
    Put { objects: Vec<Value> },
    Merge { objects: Vec<Value> },
    Del { ids: Vec<String> },
    DelQuery { query: Query },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchResponse {
    Put(Vec<PutResult>),
    Merge(Vec<PutResult>),
    Del(Vec<PutResult>),
    DelQuery(usize),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// One page of documents matching `query`.
    async fn find(&self, query: &Query) -> Result<FindResult>;

    /// Fetch documents by id. Deleted documents are returned, missing ids are skipped.
    async fn get(&self, ids: &[String]) -> Result<Vec<Value>>;

    /// Insert or replace whole documents, assigning ids where absent.
    async fn put(&self, docs: Vec<Value>) -> Result<Vec<PutResult>>;

    /// Shallow-merge fields into existing documents.
    async fn merge(&self, docs: Vec<Value>) -> Result<Vec<PutResult>>;

    async fn del(&self, ids: &[String]) -> Result<Vec<PutResult>>;

    /// Delete everything matching `query`, returning how many documents were removed.
    async fn del_query(&self, query: &Query) -> Result<usize>;

    async fn execute_batch(&self, ops: Vec<BatchOperation>) -> Result<Vec<BatchResponse>> {
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                BatchOperation::Put { objects } => BatchResponse::Put(self.put(objects).await?),
                BatchOperation::Merge { objects } => {
                    BatchResponse::Merge(self.merge(objects).await?)
                }
                BatchOperation::Del { ids } => BatchResponse::Del(self.del(&ids).await?),
                BatchOperation::DelQuery { query } => {
                    BatchResponse::DelQuery(self.del_query(&query).await?)
                }
            };
            responses.push(response);
        }
        Ok(responses)
    }

    /// Follow `next` keys until the result set is exhausted.
    async fn find_all(&self, query: &Query) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        let mut page_query = query.clone();
        loop {
            let page = self.find(&page_query).await?;
            all.extend(page.results);
            match page.next {
                Some(next) => page_query.page = Some(next),
                None => break,
            }
        }
        Ok(all)
    }
}

pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

pub fn doc_rev(doc: &Value) -> Option<u64> {
    doc.get(REV_FIELD).and_then(Value::as_u64)
}

pub fn doc_kind(doc: &Value) -> Option<&str> {
    doc.get(KIND_FIELD).and_then(Value::as_str)
}

pub fn is_deleted(doc: &Value) -> bool {
    doc.get(DEL_FIELD).and_then(Value::as_bool).unwrap_or(false)
}
