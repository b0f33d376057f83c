//! # personlink Ledger
//!
//! Durable record of explicit user link and unlink actions.
//!
//! Rows are directed pairs of contact link hashes stored in two kinds,
//! `manualLink` and `manualUnlink`. Lookups always query both sides, so
//! "A linked with B" and "B linked with A" are the same fact to readers.
//!
//! The auto-linker consults this ledger on every contact: a manual link
//! forces a merge and a manual unlink forbids one.

use ahash::AHashSet;
use personlink_core::store::doc_id;
use personlink_core::{
    Contact, DocumentStore, Error, FilterCondition, Person, Query, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub const ENTITY_A: &str = "contactEntityA";
pub const ENTITY_B: &str = "contactEntityB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LedgerKind {
    ManualLink,
    ManualUnlink,
}

impl LedgerKind {
    pub fn kind(self) -> &'static str {
        match self {
            LedgerKind::ManualLink => "manualLink",
            LedgerKind::ManualUnlink => "manualUnlink",
        }
    }
}

/// One directed ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub contact_entity_a: String,
    pub contact_entity_b: String,
}

impl LinkRecord {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            id: None,
            contact_entity_a: a.into(),
            contact_entity_b: b.into(),
        }
    }

    pub fn involves(&self, hash: &str) -> bool {
        self.contact_entity_a == hash || self.contact_entity_b == hash
    }

    /// The hash on the far side of `hash`, if this row involves it.
    pub fn other_side(&self, hash: &str) -> Option<&str> {
        if self.contact_entity_a == hash {
            Some(&self.contact_entity_b)
        } else if self.contact_entity_b == hash {
            Some(&self.contact_entity_a)
        } else {
            None
        }
    }

    fn same_pair(&self, a: &str, b: &str) -> bool {
        self.contact_entity_a == a && self.contact_entity_b == b
    }

    fn to_document(&self, kind: LedgerKind) -> Result<Value> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("_kind".to_string(), Value::from(kind.kind()));
        }
        Ok(doc)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualLinkSummary {
    pub links_added: usize,
    pub unlinks_removed: usize,
    pub unlinks_propagated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualUnlinkSummary {
    pub unlinks_added: usize,
    pub links_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetSummary {
    pub manual_links: usize,
    pub manual_unlinks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDump {
    pub manual_links: Vec<LinkRecord>,
    pub manual_unlinks: Vec<LinkRecord>,
}

#[derive(Clone)]
pub struct ManualLinkLedger {
    store: Arc<dyn DocumentStore>,
}

impl ManualLinkLedger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Record that the user merged the contacts of `group_a` with those of `group_b`.
    pub async fn record_manual_link(
        &self,
        group_a: &[String],
        group_b: &[String],
    ) -> Result<ManualLinkSummary> {
        if group_a.is_empty() || group_b.is_empty() {
            return Err(Error::InvalidParameter(
                "both contact groups must be non-empty".to_string(),
            ));
        }

        let ids: Vec<String> = group_a.iter().chain(group_b.iter()).cloned().collect();
        let loaded = self.load_contacts(&ids).await?;
        if loaded.is_empty() {
            return Err(Error::ContactNotFound(
                "none of the linked contacts could be loaded".to_string(),
            ));
        }

        let mut hashes_a = Vec::new();
        let mut hashes_b = Vec::new();
        for contact in &loaded {
            let hash = contact.link_hash()?;
            let id = contact.id()?;
            if group_a.iter().any(|a| a == id) {
                push_unique(&mut hashes_a, hash);
            } else {
                push_unique(&mut hashes_b, hash);
            }
        }

        let mut summary = ManualLinkSummary::default();
        let mut new_links = Vec::new();
        let mut stale_unlinks = Vec::new();
        for a in &hashes_a {
            for b in &hashes_b {
                if a == b {
                    continue;
                }
                if self.find_pair(LedgerKind::ManualLink, a, b).await?.is_empty() {
                    new_links.push(LinkRecord::new(a.clone(), b.clone()));
                }
                stale_unlinks.extend(self.find_pair(LedgerKind::ManualUnlink, a, b).await?);
                stale_unlinks.extend(self.find_pair(LedgerKind::ManualUnlink, b, a).await?);
            }
        }

        summary.links_added = new_links.len();
        self.insert(LedgerKind::ManualLink, &new_links).await?;
        summary.unlinks_removed = self.remove(&stale_unlinks).await?;

        let merged: Vec<String> = hashes_a.iter().chain(hashes_b.iter()).cloned().collect();
        let propagated = self.propagate_unlinks(&merged).await?;
        summary.unlinks_propagated = propagated.len();
        self.insert(LedgerKind::ManualUnlink, &propagated).await?;

        info!(
            "Recorded manual link: {} links, {} unlinks superseded, {} unlinks propagated",
            summary.links_added, summary.unlinks_removed, summary.unlinks_propagated
        );
        Ok(summary)
    }

    /// Carry every unlink held by any merged hash over to the whole merged set.
    async fn propagate_unlinks(&self, merged: &[String]) -> Result<Vec<LinkRecord>> {
        let mut as_a = Vec::new();
        let mut as_b = Vec::new();
        for hash in merged {
            as_a.extend(self.find_side(LedgerKind::ManualUnlink, ENTITY_A, hash).await?);
            as_b.extend(self.find_side(LedgerKind::ManualUnlink, ENTITY_B, hash).await?);
        }

        let mut added: Vec<LinkRecord> = Vec::new();
        let mut consider = |a: &str, b: &str, known: &[LinkRecord]| {
            if a.is_empty() || b.is_empty() || a == b {
                return;
            }
            if known.iter().any(|r| r.same_pair(a, b)) || added.iter().any(|r| r.same_pair(a, b)) {
                return;
            }
            added.push(LinkRecord::new(a, b));
        };

        for row in &as_a {
            for hash in merged {
                consider(hash.as_str(), row.contact_entity_b.as_str(), as_a.as_slice());
            }
        }
        for row in &as_b {
            for hash in merged {
                consider(row.contact_entity_a.as_str(), hash.as_str(), as_b.as_slice());
            }
        }
        Ok(added)
    }

    /// Record that the user split `contact_id` off `person`.
    ///
    /// `person` may or may not still list the contact; either way the rows
    /// are written against its other contacts.
    pub async fn record_manual_unlink(
        &self,
        person: &Person,
        contact_id: &str,
    ) -> Result<ManualUnlinkSummary> {
        if contact_id.is_empty() {
            return Err(Error::InvalidParameter("contact id must be specified".to_string()));
        }

        let mut ids: Vec<String> = person
            .contact_ids
            .iter()
            .filter(|id| id.as_str() != contact_id)
            .cloned()
            .collect();
        ids.push(contact_id.to_string());
        let loaded = self.load_contacts(&ids).await?;

        let removed = loaded
            .iter()
            .find(|c| c.id.as_deref() == Some(contact_id))
            .ok_or_else(|| Error::ContactNotFound(contact_id.to_string()))?;
        let removed_hash = removed.link_hash()?;

        let mut unlinks = Vec::new();
        let mut stale_links = Vec::new();
        for contact in loaded.iter().filter(|c| c.id.as_deref() != Some(contact_id)) {
            let hash = contact.link_hash()?;
            if hash == removed_hash {
                continue;
            }
            if self
                .find_pair(LedgerKind::ManualUnlink, &hash, &removed_hash)
                .await?
                .is_empty()
            {
                unlinks.push(LinkRecord::new(hash.clone(), removed_hash.clone()));
            }
            stale_links.extend(self.find_pair(LedgerKind::ManualLink, &hash, &removed_hash).await?);
            stale_links.extend(self.find_pair(LedgerKind::ManualLink, &removed_hash, &hash).await?);
        }

        self.insert(LedgerKind::ManualUnlink, &unlinks).await?;
        let summary = ManualUnlinkSummary {
            unlinks_added: unlinks.len(),
            links_removed: self.remove(&stale_links).await?,
        };
        info!(
            "Recorded manual unlink of {}: {} unlinks, {} links removed",
            contact_id, summary.unlinks_added, summary.links_removed
        );
        Ok(summary)
    }

    pub async fn manual_links(&self, contact_id: &str) -> Result<Vec<LinkRecord>> {
        let hash = self.hash_for_contact(contact_id).await?;
        self.records_for_hash(LedgerKind::ManualLink, &hash).await
    }

    pub async fn unlink_links(&self, contact_id: &str) -> Result<Vec<LinkRecord>> {
        let hash = self.hash_for_contact(contact_id).await?;
        self.records_for_hash(LedgerKind::ManualUnlink, &hash).await
    }

    /// Rows of `kind` with `hash` on either side, side-A matches first.
    pub async fn records_for_hash(&self, kind: LedgerKind, hash: &str) -> Result<Vec<LinkRecord>> {
        let mut records = self.find_side(kind, ENTITY_A, hash).await?;
        for record in self.find_side(kind, ENTITY_B, hash).await? {
            if !records.contains(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Ids of live contacts currently carrying `hash`.
    pub async fn contact_ids_for_hash(&self, hash: &str) -> Result<Vec<String>> {
        let docs = self
            .store
            .find_all(
                &Query::new(Contact::KIND).filter(FilterCondition::equals("linkHash", hash)),
            )
            .await?;
        Ok(docs
            .iter()
            .filter_map(|d| doc_id(d).map(str::to_string))
            .collect())
    }

    /// Remove every ledger row.
    pub async fn reset(&self) -> Result<ResetSummary> {
        let summary = ResetSummary {
            manual_links: self
                .store
                .del_query(&Query::new(LedgerKind::ManualLink.kind()))
                .await?,
            manual_unlinks: self
                .store
                .del_query(&Query::new(LedgerKind::ManualUnlink.kind()))
                .await?,
        };
        info!(
            "Ledger cleared of {} manual links and {} manual unlinks",
            summary.manual_links, summary.manual_unlinks
        );
        Ok(summary)
    }

    pub async fn dump(&self) -> Result<LedgerDump> {
        Ok(LedgerDump {
            manual_links: self.all(LedgerKind::ManualLink).await?,
            manual_unlinks: self.all(LedgerKind::ManualUnlink).await?,
        })
    }

    async fn all(&self, kind: LedgerKind) -> Result<Vec<LinkRecord>> {
        let docs = self
            .store
            .find_all(&Query::new(kind.kind()).order_by("_rev"))
            .await?;
        parse_records(docs)
    }

    async fn hash_for_contact(&self, contact_id: &str) -> Result<String> {
        let contacts = self.load_contacts(&[contact_id.to_string()]).await?;
        contacts
            .first()
            .ok_or_else(|| Error::ContactNotFound(contact_id.to_string()))?
            .link_hash()
    }

    async fn load_contacts(&self, ids: &[String]) -> Result<Vec<Contact>> {
        Contact::load_many(self.store.as_ref(), ids).await
    }

    async fn find_side(&self, kind: LedgerKind, side: &str, hash: &str) -> Result<Vec<LinkRecord>> {
        let docs = self
            .store
            .find_all(&Query::new(kind.kind()).filter(FilterCondition::equals(side, hash)))
            .await?;
        parse_records(docs)
    }

    async fn find_pair(&self, kind: LedgerKind, a: &str, b: &str) -> Result<Vec<LinkRecord>> {
        let docs = self
            .store
            .find_all(
                &Query::new(kind.kind())
                    .filter(FilterCondition::equals(ENTITY_A, a))
                    .filter(FilterCondition::equals(ENTITY_B, b)),
            )
            .await?;
        parse_records(docs)
    }

    async fn insert(&self, kind: LedgerKind, records: &[LinkRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let docs = records
            .iter()
            .map(|r| r.to_document(kind))
            .collect::<Result<Vec<_>>>()?;
        self.store.put(docs).await?;
        debug!("Inserted {} {} rows", records.len(), kind.kind());
        Ok(())
    }

    async fn remove(&self, records: &[LinkRecord]) -> Result<usize> {
        let mut seen = AHashSet::new();
        let ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.store.del(&ids).await?.len())
    }
}

fn parse_records(docs: Vec<Value>) -> Result<Vec<LinkRecord>> {
    docs.into_iter()
        .map(|d| serde_json::from_value(d).map_err(Error::from))
        .collect()
}

fn push_unique(hashes: &mut Vec<String>, hash: String) {
    if !hashes.contains(&hash) {
        hashes.push(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use personlink_core::MemoryStore;

    async fn setup(contacts: Vec<Contact>) -> (ManualLinkLedger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let docs = contacts
            .iter()
            .map(|c| c.to_document().unwrap())
            .collect();
        store.put(docs).await.unwrap();
        (ManualLinkLedger::new(store.clone()), store)
    }

    fn contact(id: &str) -> Contact {
        Contact::new().with_id(id).with_email(format!("{}@example.com", id))
    }

    fn hash(id: &str) -> String {
        contact(id).link_hash().unwrap()
    }

    #[tokio::test]
    async fn test_manual_link_is_cross_product() {
        let (ledger, _) = setup(vec![contact("a1"), contact("a2"), contact("b1")]).await;
        let summary = ledger
            .record_manual_link(&["a1".into(), "a2".into()], &["b1".into()])
            .await
            .unwrap();
        assert_eq!(summary.links_added, 2);

        let dump = ledger.dump().await.unwrap();
        assert!(dump.manual_links.iter().any(|r| r.same_pair(&hash("a1"), &hash("b1"))));
        assert!(dump.manual_links.iter().any(|r| r.same_pair(&hash("a2"), &hash("b1"))));

        // relinking the same pair adds nothing
        let again = ledger
            .record_manual_link(&["a1".into(), "a2".into()], &["b1".into()])
            .await
            .unwrap();
        assert_eq!(again.links_added, 0);
    }

    #[tokio::test]
    async fn test_queries_are_symmetric() {
        let (ledger, _) = setup(vec![contact("x"), contact("y")]).await;
        ledger
            .record_manual_link(&["x".into()], &["y".into()])
            .await
            .unwrap();
        let from_x = ledger.manual_links("x").await.unwrap();
        let from_y = ledger.manual_links("y").await.unwrap();
        assert_eq!(from_x.len(), 1);
        assert_eq!(from_x, from_y);
    }

    #[tokio::test]
    async fn test_unlink_removes_links_both_ways() {
        let (ledger, _) = setup(vec![contact("x"), contact("y")]).await;
        ledger
            .record_manual_link(&["x".into()], &["y".into()])
            .await
            .unwrap();

        let person = Person::with_contacts(vec!["x".into()]);
        let summary = ledger.record_manual_unlink(&person, "y").await.unwrap();
        assert_eq!(summary.unlinks_added, 1);
        assert_eq!(summary.links_removed, 1);
        assert!(ledger.manual_links("x").await.unwrap().is_empty());

        let unlinks = ledger.unlink_links("y").await.unwrap();
        assert_eq!(unlinks, ledger.unlink_links("x").await.unwrap());
        assert_eq!(unlinks[0].contact_entity_a, hash("x"));
        assert_eq!(unlinks[0].contact_entity_b, hash("y"));
    }

    #[tokio::test]
    async fn test_link_supersedes_unlink() {
        let (ledger, _) = setup(vec![contact("x"), contact("y")]).await;
        let person = Person::with_contacts(vec!["x".into(), "y".into()]);
        ledger.record_manual_unlink(&person, "y").await.unwrap();

        let summary = ledger
            .record_manual_link(&["y".into()], &["x".into()])
            .await
            .unwrap();
        assert_eq!(summary.unlinks_removed, 1);
        assert!(ledger.unlink_links("x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlinks_propagate_to_merged_identity() {
        let (ledger, _) = setup(vec![contact("x"), contact("y"), contact("z")]).await;
        // x must never merge with z
        let person = Person::with_contacts(vec!["x".into()]);
        ledger.record_manual_unlink(&person, "z").await.unwrap();

        let summary = ledger
            .record_manual_link(&["x".into()], &["y".into()])
            .await
            .unwrap();
        assert_eq!(summary.unlinks_propagated, 1);

        let unlinks = ledger.unlink_links("y").await.unwrap();
        assert_eq!(unlinks.len(), 1);
        assert!(unlinks[0].same_pair(&hash("y"), &hash("z")));
    }

    #[tokio::test]
    async fn test_unlink_requires_loadable_contact() {
        let (ledger, _) = setup(vec![contact("x")]).await;
        let person = Person::with_contacts(vec!["x".into()]);
        let err = ledger.record_manual_unlink(&person, "ghost").await.unwrap_err();
        assert!(matches!(err, Error::ContactNotFound(_)));
    }

    #[tokio::test]
    async fn test_link_requires_contacts() {
        let (ledger, _) = setup(vec![]).await;
        assert!(matches!(
            ledger.record_manual_link(&["a".into()], &[]).await,
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            ledger.record_manual_link(&["a".into()], &["b".into()]).await,
            Err(Error::ContactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_and_hash_lookup() {
        let (ledger, _) = setup(vec![contact("x"), contact("y")]).await;
        ledger
            .record_manual_link(&["x".into()], &["y".into()])
            .await
            .unwrap();
        assert_eq!(ledger.contact_ids_for_hash(&hash("y")).await.unwrap(), vec!["y"]);

        let reset = ledger.reset().await.unwrap();
        assert_eq!(reset.manual_links, 1);
        assert_eq!(reset.manual_unlinks, 0);
        assert!(ledger.dump().await.unwrap().manual_links.is_empty());
    }
}
