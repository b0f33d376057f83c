//! The autolink pass: walk changed contacts in revision order and keep the
//! person table consistent with the similarity rules.
//!
//! ```text
//! Enumerating -> ProcessingContact (loop) -> Yielded | Completed
//! ```
//!
//! Each contact is handled on its own. A contact that fails is logged and
//! skipped, and the watermark stops below it so the next pass retries it.

use crate::jobs::YieldController;
use crate::plugins::PluginDispatcher;
use personlink_core::store::{doc_id, doc_rev, REV_FIELD};
use personlink_core::{
    Contact, CurrentPerson, DocumentStore, Error, FilterCondition, ListSortOrder, Person, Query,
    Result, DEFAULT_PAGE_SIZE,
};
use personlink_similarity::SimilarityScorer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PassOutcome {
    Yielded,
    Completed,
}

/// Summary of one autolink pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub job_id: String,
    pub outcome: PassOutcome,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    /// Highest revision below which every contact was linked
    pub watermark: Option<u64>,
}

/// What a single contact did to the person table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Deleted contact with no person
    Skipped,
    Detached { person_id: String },
    PersonDeleted { person_id: String },
    Refreshed { person_id: String },
    Created { person_id: String },
    Merged { survivor_id: String, removed: Vec<String> },
}

/// A person saved together with freshly written contacts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPerson {
    pub person: Person,
    pub contacts: Vec<Contact>,
}

#[derive(Clone)]
pub struct Autolinker {
    store: Arc<dyn DocumentStore>,
    scorer: SimilarityScorer,
    plugins: Arc<PluginDispatcher>,
    list_sort_order: ListSortOrder,
    page_size: usize,
}

impl Autolinker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        scorer: SimilarityScorer,
        plugins: Arc<PluginDispatcher>,
    ) -> Self {
        Self {
            store,
            scorer,
            plugins,
            list_sort_order: ListSortOrder::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_list_sort_order(mut self, order: ListSortOrder) -> Self {
        self.list_sort_order = order;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn list_sort_order(&self) -> ListSortOrder {
        self.list_sort_order
    }

    /// Run a pass over every contact changed after `since`, or over all
    /// contacts when `since` is `None`. Deleted contacts are included.
    pub async fn run_pass(
        &self,
        job_id: &str,
        since: Option<u64>,
        yields: &YieldController,
    ) -> Result<PassReport> {
        let docs = self.changed_contacts(since).await?;
        info!(
            "Autolinker job {} starting over {} contacts (since {:?})",
            job_id,
            docs.len(),
            since
        );
        Ok(self.process_documents(job_id, docs, since, yields).await)
    }

    /// Run a pass over an explicit contact list, in the order given.
    pub async fn run_contacts(
        &self,
        job_id: &str,
        contacts: Vec<Contact>,
        yields: &YieldController,
    ) -> Result<PassReport> {
        let docs = contacts
            .iter()
            .map(Contact::to_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(self.process_documents(job_id, docs, None, yields).await)
    }

    async fn changed_contacts(&self, since: Option<u64>) -> Result<Vec<Value>> {
        let mut query = Query::new(Contact::KIND)
            .include_deleted(true)
            .order_by(REV_FIELD)
            .limit(self.page_size);
        if let Some(rev) = since {
            query = query.filter(FilterCondition::greater_than(REV_FIELD, rev as f64));
        }
        self.store.find_all(&query).await
    }

    async fn process_documents(
        &self,
        job_id: &str,
        docs: Vec<Value>,
        since: Option<u64>,
        yields: &YieldController,
    ) -> PassReport {
        let started = Instant::now();
        let total = docs.len();
        let mut watermark = since;
        let mut blocked = false;
        let mut processed = 0;
        let mut failed = 0;
        let mut outcome = PassOutcome::Completed;

        for doc in docs {
            if yields.should_job_yield(job_id) {
                info!(
                    "Autolinker job {} yielding after {} of {} contacts",
                    job_id, processed, total
                );
                outcome = PassOutcome::Yielded;
                break;
            }

            let rev = doc_rev(&doc);
            let id = doc_id(&doc).unwrap_or("<unknown>").to_string();
            let result = match Contact::from_document(doc) {
                Ok(contact) => self.link_contact(&contact).await,
                Err(e) => Err(e),
            };
            processed += 1;

            match result {
                Ok(action) => {
                    debug!("Contact {}: {:?}", id, action);
                    if !blocked {
                        watermark = match (watermark, rev) {
                            (Some(w), Some(r)) => Some(w.max(r)),
                            (None, r) => r,
                            (w, None) => w,
                        };
                    }
                }
                Err(e) => {
                    error!("Failed to autolink contact {}: {}", id, e);
                    failed += 1;
                    blocked = true;
                }
            }
        }

        yields.remove_job(job_id);
        info!(
            "Autolinker job {} {:?}: {} of {} contacts ({} failed) in {:.2?}, watermark {:?}",
            job_id,
            outcome,
            processed,
            total,
            failed,
            started.elapsed(),
            watermark
        );

        PassReport {
            job_id: job_id.to_string(),
            outcome,
            total,
            processed,
            failed,
            watermark,
        }
    }

    /// Bring the person table in line with one contact.
    pub async fn link_contact(&self, contact: &Contact) -> Result<LinkAction> {
        let contact_id = contact.id()?;
        let current = match Person::find_for_contact(self.store.as_ref(), contact_id).await? {
            Some(person) => CurrentPerson::AttachedTo(person),
            None => CurrentPerson::NoCurrentPerson,
        };

        if contact.deleted {
            return self.detach_deleted_contact(contact_id, current).await;
        }

        let weights = self.scorer.score(contact, &current).await?;
        let candidates = weights.qualifying(current.person_id());
        if candidates.is_empty() {
            return self.save_without_new_links(contact, current).await;
        }
        self.merge_people(contact, current, candidates).await
    }

    async fn detach_deleted_contact(
        &self,
        contact_id: &str,
        current: CurrentPerson,
    ) -> Result<LinkAction> {
        let CurrentPerson::AttachedTo(person) = current else {
            debug!("Deleted contact {} had no person", contact_id);
            return Ok(LinkAction::Skipped);
        };
        let person_id = person.id()?.to_string();

        if person.contact_count() > 1 {
            let original = person.clone();
            let mut updated = person;
            updated.remove_contact_id(contact_id);
            self.fixup_and_save(&mut updated).await?;
            self.plugins.person_changed(&original, &updated).await;
            Ok(LinkAction::Detached { person_id })
        } else {
            self.store.del(&[person_id.clone()]).await?;
            self.plugins.person_removed(&person).await;
            Ok(LinkAction::PersonDeleted { person_id })
        }
    }

    async fn save_without_new_links(
        &self,
        contact: &Contact,
        current: CurrentPerson,
    ) -> Result<LinkAction> {
        match current {
            CurrentPerson::AttachedTo(person) => {
                let original = person.clone();
                let mut updated = person;
                self.fixup_and_save(&mut updated).await?;
                self.plugins.person_changed(&original, &updated).await;
                Ok(LinkAction::Refreshed {
                    person_id: updated.id()?.to_string(),
                })
            }
            CurrentPerson::NoCurrentPerson => {
                let mut person = Person::with_contacts(vec![contact.id()?.to_string()]);
                let mut normalized = contact.clone();
                normalized.normalize(self.scorer.comparator());
                person.fixup(std::slice::from_ref(&normalized), self.list_sort_order);
                self.save_person(&mut person).await?;
                self.plugins.person_added(&person).await;
                Ok(LinkAction::Created {
                    person_id: person.id()?.to_string(),
                })
            }
        }
    }

    /// Fold every candidate, and the contact's current person, into the
    /// one holding the most contacts.
    async fn merge_people(
        &self,
        contact: &Contact,
        current: CurrentPerson,
        mut candidates: Vec<Person>,
    ) -> Result<LinkAction> {
        let mut best = 0;
        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.contact_count() > candidates[best].contact_count() {
                best = index;
            }
        }

        let had_person = matches!(current, CurrentPerson::AttachedTo(_));
        let (survivor, others) = match current {
            CurrentPerson::AttachedTo(person)
                if person.contact_count() >= candidates[best].contact_count() =>
            {
                (person, candidates)
            }
            CurrentPerson::AttachedTo(person) => {
                let survivor = candidates.remove(best);
                candidates.push(person);
                (survivor, candidates)
            }
            CurrentPerson::NoCurrentPerson => {
                let survivor = candidates.remove(best);
                (survivor, candidates)
            }
        };

        let new_contact = if had_person { None } else { Some(contact.id()?) };
        let merged_ids = Person::order_contact_ids(&survivor, &others, new_contact);

        let original = survivor.clone();
        let mut updated = survivor;
        updated.contact_ids = merged_ids;

        let removed = others
            .iter()
            .map(|p| p.id().map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        if !removed.is_empty() {
            self.store.del(&removed).await?;
        }

        self.fixup_and_save(&mut updated).await?;
        self.plugins.person_changed(&original, &updated).await;
        for person in &others {
            self.plugins.person_removed(person).await;
        }

        let survivor_id = updated.id()?.to_string();
        info!(
            "Linked contact {} into person {} ({} persons merged away)",
            contact.id()?,
            survivor_id,
            removed.len()
        );
        Ok(LinkAction::Merged {
            survivor_id,
            removed,
        })
    }

    /// Reload the person's contacts, re-derive its fields and save it.
    ///
    /// Phone numbers are normalized with the scorer's comparator so the
    /// person's `normalizedValue`s line up with its lookup keys.
    pub async fn fixup_and_save(&self, person: &mut Person) -> Result<()> {
        let mut contacts = person.reload_contacts(self.store.as_ref()).await?;
        for contact in &mut contacts {
            contact.normalize(self.scorer.comparator());
        }
        person.fixup(&contacts, self.list_sort_order);
        self.save_person(person).await
    }

    /// Write `person`, picking up the id and revision the store assigned.
    pub async fn save_person(&self, person: &mut Person) -> Result<()> {
        let written = self.store.put(vec![person.to_document()?]).await?;
        let result = written
            .into_iter()
            .next()
            .ok_or_else(|| Error::Storage("person save returned no result".to_string()))?;
        person.id = Some(result.id);
        person.rev = Some(result.rev);
        Ok(())
    }

    /// Save `contacts`, attach them to `person`, then save the person.
    pub async fn save_new_person_and_contacts(
        &self,
        mut person: Person,
        contacts: Vec<Contact>,
    ) -> Result<SavedPerson> {
        if person.id.is_some() && person.deleted {
            return Err(Error::InvalidParameter(
                "cannot attach contacts to a deleted person".to_string(),
            ));
        }

        let docs = contacts
            .iter()
            .map(|contact| {
                let mut contact = contact.clone();
                contact.normalize(self.scorer.comparator());
                contact.to_document()
            })
            .collect::<Result<Vec<_>>>()?;
        let written = self.store.put(docs).await?;
        if written.len() != contacts.len() {
            warn!(
                "Saved {} of {} contacts for new person",
                written.len(),
                contacts.len()
            );
        }
        let ids: Vec<String> = written.into_iter().map(|r| r.id).collect();
        let saved = Contact::load_many(self.store.as_ref(), &ids).await?;

        for contact in &saved {
            person.add_contact_id(contact.id()?);
        }
        self.fixup_and_save(&mut person).await?;
        self.plugins.person_added(&person).await;

        Ok(SavedPerson {
            person,
            contacts: saved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{LinkerPlugin, RecordingPlugin};
    use async_trait::async_trait;
    use personlink_core::{MemoryStore, PhoneType};
    use personlink_ledger::ManualLinkLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: Arc<MemoryStore>,
        plugins: Arc<PluginDispatcher>,
        recorder: Arc<RecordingPlugin>,
        linker: Autolinker,
        yields: YieldController,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let ledger = ManualLinkLedger::new(dyn_store.clone());
        let scorer = SimilarityScorer::new(dyn_store.clone(), ledger);
        let plugins = Arc::new(PluginDispatcher::new());
        let recorder = Arc::new(RecordingPlugin::new());
        plugins.register(recorder.clone());
        let linker = Autolinker::new(dyn_store, scorer, plugins.clone()).with_page_size(3);
        Fixture {
            store,
            plugins,
            recorder,
            linker,
            yields: YieldController::new(),
        }
    }

    async fn insert(store: &MemoryStore, contact: Contact) -> Contact {
        let written = store.put(vec![contact.to_document().unwrap()]).await.unwrap();
        let doc = store.get(&[written[0].id.clone()]).await.unwrap().remove(0);
        Contact::from_document(doc).unwrap()
    }

    async fn live_persons(store: &MemoryStore) -> Vec<Person> {
        store
            .find_all(&Query::new(Person::KIND))
            .await
            .unwrap()
            .into_iter()
            .map(|d| Person::from_document(d).unwrap())
            .collect()
    }

    async fn seed_person(f: &Fixture, contacts: Vec<Contact>) -> Person {
        let mut ids = Vec::new();
        for contact in contacts {
            ids.push(insert(&f.store, contact).await.id.unwrap());
        }
        let mut person = Person::with_contacts(ids);
        f.linker.fixup_and_save(&mut person).await.unwrap();
        person
    }

    #[tokio::test]
    async fn test_shared_email_links_two_contacts() {
        let f = fixture();
        insert(&f.store, Contact::new().with_name("Ada", "Lovelace").with_email("ada@example.com")).await;
        insert(&f.store, Contact::new().with_email("ADA@example.com")).await;

        let report = f.linker.run_pass("aaa", None, &f.yields).await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Completed);
        assert_eq!(report.processed, 2);
        assert_eq!(report.watermark, Some(2));

        let persons = live_persons(&f.store).await;
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].contact_count(), 2);
        assert_eq!(persons[0].emails.len(), 1);
        assert_eq!(f.recorder.count("personAdded"), 1);
        assert_eq!(f.recorder.count("personChanged"), 1);
        assert_eq!(f.recorder.count("personRemoved"), 0);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let f = fixture();
        insert(&f.store, Contact::new().with_name("Ada", "Lovelace")).await;
        insert(&f.store, Contact::new().with_name("ada", "LOVELACE").with_phone("555 0100", PhoneType::Mobile)).await;
        insert(&f.store, Contact::new().with_name("Grace", "Hopper")).await;

        f.linker.run_pass("aaa", None, &f.yields).await.unwrap();
        let mut first: Vec<Vec<String>> = live_persons(&f.store)
            .await
            .into_iter()
            .map(|p| p.contact_ids)
            .collect();
        first.sort();
        assert_eq!(first.len(), 2);

        f.recorder.clear();
        f.linker.run_pass("aab", None, &f.yields).await.unwrap();
        let mut second: Vec<Vec<String>> = live_persons(&f.store)
            .await
            .into_iter()
            .map(|p| p.contact_ids)
            .collect();
        second.sort();
        assert_eq!(first, second);
        assert_eq!(f.recorder.count("personAdded"), 0);
        assert_eq!(f.recorder.count("personRemoved"), 0);
    }

    #[tokio::test]
    async fn test_survivor_has_most_contacts() {
        let f = fixture();
        let p1 = seed_person(&f, vec![
            Contact::new().with_email("one@example.com"),
            Contact::new().with_email("one.b@example.com"),
            Contact::new().with_email("one.c@example.com"),
        ])
        .await;
        let p2 = seed_person(&f, vec![Contact::new().with_email("two@example.com")]).await;
        let p3 = seed_person(&f, vec![
            Contact::new().with_email("three@example.com"),
            Contact::new().with_email("three.b@example.com"),
        ])
        .await;

        let x = insert(
            &f.store,
            Contact::new()
                .with_email("two@example.com")
                .with_email("three@example.com")
                .with_email("one@example.com"),
        )
        .await;

        let action = f.linker.link_contact(&x).await.unwrap();
        let expected_removed = vec![p2.id.clone().unwrap(), p3.id.clone().unwrap()];
        assert_eq!(
            action,
            LinkAction::Merged {
                survivor_id: p1.id.clone().unwrap(),
                removed: expected_removed,
            }
        );

        let persons = live_persons(&f.store).await;
        assert_eq!(persons.len(), 1);
        let mut expected = p1.contact_ids.clone();
        expected.extend(p2.contact_ids.clone());
        expected.extend(p3.contact_ids.clone());
        expected.push(x.id.clone().unwrap());
        assert_eq!(persons[0].contact_ids, expected);
        assert_eq!(f.recorder.count("personChanged"), 1);
        assert_eq!(f.recorder.count("personRemoved"), 2);
    }

    #[tokio::test]
    async fn test_current_person_wins_ties() {
        let f = fixture();
        let mine = seed_person(&f, vec![Contact::new().with_name("Ada", "Lovelace")]).await;
        let other = seed_person(&f, vec![Contact::new().with_email("ada@example.com")]).await;

        let mut contact = Contact::from_document(
            f.store.get(&[mine.contact_ids[0].clone()]).await.unwrap().remove(0),
        )
        .unwrap();
        contact.emails.push(personlink_core::Address::new("ada@example.com"));
        f.store.put(vec![contact.to_document().unwrap()]).await.unwrap();

        let action = f.linker.link_contact(&contact).await.unwrap();
        assert_eq!(
            action,
            LinkAction::Merged {
                survivor_id: mine.id.clone().unwrap(),
                removed: vec![other.id.clone().unwrap()],
            }
        );
    }

    #[tokio::test]
    async fn test_deleted_contact_cascades() {
        let f = fixture();
        let person = seed_person(&f, vec![
            Contact::new().with_email("a@example.com"),
            Contact::new().with_email("b@example.com"),
        ])
        .await;
        let since = f.store.current_rev();

        f.store.del(&[person.contact_ids[0].clone()]).await.unwrap();
        let report = f.linker.run_pass("aaa", Some(since), &f.yields).await.unwrap();
        assert_eq!(report.processed, 1);
        let persons = live_persons(&f.store).await;
        assert_eq!(persons[0].contact_ids, vec![person.contact_ids[1].clone()]);
        assert_eq!(persons[0].emails.len(), 1);
        assert_eq!(f.recorder.event_names(), vec!["personChanged"]);

        let since = f.store.current_rev();
        f.store.del(&[person.contact_ids[1].clone()]).await.unwrap();
        f.linker.run_pass("aab", Some(since), &f.yields).await.unwrap();
        assert!(live_persons(&f.store).await.is_empty());
        assert_eq!(f.recorder.count("personRemoved"), 1);

        // a deleted contact with no person is skipped
        let orphan = insert(&f.store, Contact::new().with_email("c@example.com")).await;
        f.store.del(&[orphan.id.clone().unwrap()]).await.unwrap();
        let deleted = Contact::from_document(
            f.store.get(&[orphan.id.unwrap()]).await.unwrap().remove(0),
        )
        .unwrap();
        assert_eq!(f.linker.link_contact(&deleted).await.unwrap(), LinkAction::Skipped);
    }

    struct YieldAfter {
        yields: Arc<YieldController>,
        job_id: &'static str,
        after: usize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl LinkerPlugin for YieldAfter {
        fn name(&self) -> &str {
            "yield-after"
        }

        async fn person_added(&self, _person: &Person) -> Result<()> {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.yields.add_job_to_yield(self.job_id);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_yield_and_resume() {
        let f = fixture();
        let yields = Arc::new(YieldController::new());
        f.plugins.register(Arc::new(YieldAfter {
            yields: yields.clone(),
            job_id: "aaa",
            after: 5,
            seen: AtomicUsize::new(0),
        }));

        let mut revs = Vec::new();
        for i in 0..10 {
            let contact = insert(&f.store, Contact::new().with_email(format!("user{}@example.com", i))).await;
            revs.push(contact.rev.unwrap());
        }

        let report = f.linker.run_pass("aaa", None, &yields).await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Yielded);
        assert_eq!(report.processed, 5);
        assert_eq!(report.watermark, Some(revs[4]));
        assert!(!yields.should_job_yield("aaa"));

        let report = f.linker.run_pass("aab", report.watermark, &yields).await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Completed);
        assert_eq!(report.processed, 5);
        assert_eq!(report.watermark, Some(revs[9]));

        assert_eq!(live_persons(&f.store).await.len(), 10);
        assert_eq!(f.recorder.count("personAdded"), 10);
    }

    #[tokio::test]
    async fn test_failed_contact_holds_watermark() {
        let f = fixture();
        let first = insert(&f.store, Contact::new().with_email("a@example.com")).await;
        f.store
            .put(vec![serde_json::json!({"_kind": "contact", "phoneNumbers": "not a list"})])
            .await
            .unwrap();
        insert(&f.store, Contact::new().with_email("b@example.com")).await;

        let report = f.linker.run_pass("aaa", None, &f.yields).await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Completed);
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.watermark, first.rev);
        assert_eq!(live_persons(&f.store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_save_new_person_and_contacts() {
        let f = fixture();
        let saved = f
            .linker
            .save_new_person_and_contacts(
                Person::new(),
                vec![
                    Contact::new().with_name("Alan", "Turing"),
                    Contact::new().with_email("alan@example.com"),
                ],
            )
            .await
            .unwrap();
        assert!(saved.person.id.is_some());
        assert_eq!(saved.person.contact_count(), 2);
        assert_eq!(saved.person.sort_key, "turing alan");
        assert_eq!(saved.contacts.len(), 2);
        assert_eq!(f.recorder.event_names(), vec!["personAdded"]);
    }
}
