//! The linker service: one context object owning every collaborator.

use crate::autolinker::{Autolinker, PassOutcome, PassReport, SavedPerson};
use crate::config::LinkerConfig;
use crate::jobs::{JobIdGenerator, YieldController};
use crate::plugins::{LinkerPlugin, PluginDispatcher};
use crate::scheduler::{ActivityDescriptor, ActivityFired, ActivityId, CompleteRequest, Scheduler};
use crate::watermark::WatermarkStore;
use parking_lot::Mutex;
use personlink_core::{Contact, DocumentStore, Error, Person, PhoneNumberComparator, Result};
use personlink_ledger::{
    LedgerDump, LinkRecord, ManualLinkLedger, ManualLinkSummary, ManualUnlinkSummary,
    ResetSummary,
};
use personlink_similarity::SimilarityScorer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualLinkResult {
    pub person: Person,
    pub removed_person_id: String,
    pub ledger: ManualLinkSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualUnlinkResult {
    pub person: Person,
    pub new_person: Person,
    pub ledger: ManualUnlinkSummary,
}

/// Clears the single-pass flag when a pass ends, however it ends.
struct PassGuard<'a> {
    context: &'a LinkerContext,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.context.current_job.lock().take();
        self.context.running.store(false, Ordering::Release);
    }
}

pub struct LinkerContext {
    store: Arc<dyn DocumentStore>,
    autolinker: Autolinker,
    ledger: ManualLinkLedger,
    plugins: Arc<PluginDispatcher>,
    scheduler: Arc<dyn Scheduler>,
    watermarks: WatermarkStore,
    job_ids: JobIdGenerator,
    yields: YieldController,
    running: AtomicBool,
    current_job: Mutex<Option<String>>,
    watch_activity: Mutex<Option<ActivityId>>,
    config: LinkerConfig,
}

impl LinkerContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        scheduler: Arc<dyn Scheduler>,
        config: LinkerConfig,
    ) -> Self {
        let ledger = ManualLinkLedger::new(store.clone());
        let scorer = SimilarityScorer::new(store.clone(), ledger.clone());
        Self::assemble(store, scheduler, config, ledger, scorer)
    }

    /// Use `comparator` for phone parsing instead of the digit comparator.
    pub fn with_comparator(
        store: Arc<dyn DocumentStore>,
        scheduler: Arc<dyn Scheduler>,
        config: LinkerConfig,
        comparator: Arc<dyn PhoneNumberComparator>,
    ) -> Self {
        let ledger = ManualLinkLedger::new(store.clone());
        let scorer =
            SimilarityScorer::new(store.clone(), ledger.clone()).with_comparator(comparator);
        Self::assemble(store, scheduler, config, ledger, scorer)
    }

    fn assemble(
        store: Arc<dyn DocumentStore>,
        scheduler: Arc<dyn Scheduler>,
        config: LinkerConfig,
        ledger: ManualLinkLedger,
        scorer: SimilarityScorer,
    ) -> Self {
        let plugins = Arc::new(PluginDispatcher::new());
        let autolinker = Autolinker::new(store.clone(), scorer, plugins.clone())
            .with_list_sort_order(config.list_sort_order)
            .with_page_size(config.page_size);
        Self {
            ledger,
            watermarks: WatermarkStore::new(store.clone()),
            store,
            autolinker,
            plugins,
            scheduler,
            job_ids: JobIdGenerator::new(),
            yields: YieldController::new(),
            running: AtomicBool::new(false),
            current_job: Mutex::new(None),
            watch_activity: Mutex::new(None),
            config,
        }
    }

    pub fn register_plugin(&self, plugin: Arc<dyn LinkerPlugin>) {
        self.plugins.register(plugin);
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ManualLinkLedger {
        &self.ledger
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn current_job(&self) -> Option<String> {
        self.current_job.lock().clone()
    }

    pub fn watch_activity(&self) -> Option<ActivityId> {
        *self.watch_activity.lock()
    }

    fn begin_pass(&self) -> Result<(PassGuard<'_>, String)> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AutolinkRunning);
        }
        let guard = PassGuard { context: self };
        let job_id = self.job_ids.generate_job_id();
        *self.current_job.lock() = Some(job_id.clone());
        Ok((guard, job_id))
    }

    /// Relink every contact, then watch for changes above the new watermark.
    ///
    /// A yielded pass still arms the watch, at the watermark it reached, so
    /// the remaining contacts are picked up by the next watch pass.
    pub async fn force_autolink(&self) -> Result<PassReport> {
        let (_guard, job_id) = self.begin_pass()?;
        let report = self.autolinker.run_pass(&job_id, None, &self.yields).await?;
        let watermark = self.persist_watermark(&report).await?;
        if report.outcome == PassOutcome::Yielded {
            info!(
                "Forced pass {} yielded, watching from revision {:?}",
                job_id, watermark
            );
        }
        self.create_watch(watermark).await?;
        Ok(report)
    }

    /// Relink contacts changed after `rev_changed_start`.
    ///
    /// Called when the watch fires. The watch is re-armed however the pass
    /// ends: at the new watermark when it completed or yielded, and at the
    /// last durable watermark when it failed or could not start.
    pub async fn db_updated_relink_changes(
        &self,
        activity_id: Option<ActivityId>,
        rev_changed_start: Option<u64>,
    ) -> Result<PassReport> {
        let result = self.relink_changes(rev_changed_start).await;
        let watermark = match &result {
            Ok((_, watermark)) => *watermark,
            Err(e) => {
                warn!(
                    "Watch-triggered pass at revision {:?} failed: {}",
                    rev_changed_start, e
                );
                self.durable_watermark(rev_changed_start).await
            }
        };

        let rearmed = self.rearm_watch(activity_id, watermark).await;
        match (result, rearmed) {
            (Ok((report, _)), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), rearmed) => {
                if let Err(rearm_error) = rearmed {
                    error!("Failed to re-arm the contact watch: {}", rearm_error);
                }
                Err(e)
            }
        }
    }

    async fn relink_changes(
        &self,
        rev_changed_start: Option<u64>,
    ) -> Result<(PassReport, Option<u64>)> {
        let (_guard, job_id) = self.begin_pass()?;
        info!(
            "Watch callback for job {} at revision {:?}",
            job_id, rev_changed_start
        );
        let report = self
            .autolinker
            .run_pass(&job_id, rev_changed_start, &self.yields)
            .await?;
        let watermark = self.persist_watermark(&report).await?.or(rev_changed_start);
        self.plugins.sync_done().await;
        Ok((report, watermark))
    }

    /// The persisted watermark, never below `fallback`.
    async fn durable_watermark(&self, fallback: Option<u64>) -> Option<u64> {
        match self.watermarks.load().await {
            Ok(stored) => stored.max(fallback),
            Err(e) => {
                warn!("Failed to load the watermark: {}", e);
                fallback
            }
        }
    }

    async fn rearm_watch(
        &self,
        activity_id: Option<ActivityId>,
        watermark: Option<u64>,
    ) -> Result<()> {
        let Some(id) = activity_id else {
            self.create_watch(watermark).await?;
            return Ok(());
        };
        match self
            .scheduler
            .complete(id, CompleteRequest::restart_at(watermark))
            .await
        {
            Ok(()) => {
                *self.watch_activity.lock() = Some(id);
                Ok(())
            }
            // A forced pass replaced the watch while this one ran.
            Err(Error::Scheduler(_)) if self.watch_activity().is_some_and(|w| w != id) => {
                debug!("Activity {} was superseded by {:?}", id, self.watch_activity());
                Ok(())
            }
            Err(e) => {
                warn!("Activity {} could not be restarted ({}), creating a new watch", id, e);
                self.create_watch(watermark).await?;
                Ok(())
            }
        }
    }

    /// Dispatch a fired watch activity.
    pub async fn handle_fired(&self, fired: ActivityFired) -> Result<PassReport> {
        self.db_updated_relink_changes(Some(fired.activity_id), fired.callback.rev_changed_start)
            .await
    }

    /// Relink an explicit list of contacts without touching the watermark.
    pub async fn autolink_contacts(&self, contacts: Vec<Contact>) -> Result<PassReport> {
        let (_guard, job_id) = self.begin_pass()?;
        self.autolinker
            .run_contacts(&job_id, contacts, &self.yields)
            .await
    }

    /// Ask a running pass to stop at the next contact boundary.
    ///
    /// Without `job_id` the currently running pass is asked.
    pub fn yield_autolink(&self, job_id: Option<&str>) -> Result<String> {
        let job_id = match job_id {
            Some(id) => id.to_string(),
            None => self
                .current_job()
                .ok_or_else(|| Error::InvalidParameter("no autolink pass is running".to_string()))?,
        };
        info!("Autolinker job {} asked to yield", job_id);
        self.yields.add_job_to_yield(&job_id);
        Ok(job_id)
    }

    /// Create the contact watch at the persisted watermark.
    pub async fn setup_watch(&self) -> Result<ActivityId> {
        let watermark = self.watermarks.load().await?;
        self.create_watch(watermark).await
    }

    async fn create_watch(&self, watermark: Option<u64>) -> Result<ActivityId> {
        let id = self
            .scheduler
            .create(ActivityDescriptor::linker_watch(watermark))
            .await?;
        *self.watch_activity.lock() = Some(id);
        Ok(id)
    }

    async fn persist_watermark(&self, report: &PassReport) -> Result<Option<u64>> {
        match report.watermark {
            Some(rev) => Ok(Some(self.watermarks.save(rev).await?)),
            None => Ok(None),
        }
    }

    async fn load_person(&self, person_id: &str) -> Result<Person> {
        let person = Person::load(self.store.as_ref(), person_id).await?;
        if person.deleted {
            return Err(Error::InvalidParameter(format!(
                "person {} is marked for deletion",
                person_id
            )));
        }
        Ok(person)
    }

    /// Fail before any write if a contact cannot be keyed in the ledger.
    async fn require_link_hashes(&self, contact_ids: &[String]) -> Result<()> {
        for contact in Contact::load_many(self.store.as_ref(), contact_ids).await? {
            if !contact.deleted {
                contact.link_hash()?;
            }
        }
        Ok(())
    }

    /// Merge `person_to_link` into `person_to_link_to` and record the decision.
    pub async fn manually_link(
        &self,
        person_to_link_to: &str,
        person_to_link: &str,
    ) -> Result<ManualLinkResult> {
        let mut missing = String::new();
        if person_to_link_to.is_empty() {
            missing.push_str("The 'personToLinkTo' parameter was not specified. ");
        }
        if person_to_link.is_empty() {
            missing.push_str("The 'personToLink' parameter was not specified.");
        }
        if !missing.is_empty() {
            return Err(Error::InvalidParameter(missing.trim_end().to_string()));
        }
        if person_to_link_to == person_to_link {
            return Err(Error::InvalidParameter(
                "cannot link a person to itself".to_string(),
            ));
        }

        let target = self.load_person(person_to_link_to).await?;
        let absorbed = self.load_person(person_to_link).await?;
        let group_a = target.contact_ids.clone();
        let group_b = absorbed.contact_ids.clone();
        if group_a.is_empty() || group_b.is_empty() {
            return Err(Error::InvalidParameter(
                "both persons must have contacts".to_string(),
            ));
        }
        self.require_link_hashes(&group_a).await?;
        self.require_link_hashes(&group_b).await?;

        let original = target.clone();
        let mut updated = target;
        for contact_id in &group_b {
            updated.add_contact_id(contact_id.clone());
        }
        self.autolinker.fixup_and_save(&mut updated).await?;
        self.plugins.person_changed(&original, &updated).await;

        let removed_person_id = absorbed.id()?.to_string();
        self.store.del(&[removed_person_id.clone()]).await?;
        self.plugins.person_removed(&absorbed).await;

        let ledger = self.ledger.record_manual_link(&group_a, &group_b).await?;
        info!(
            "Manually linked person {} into {}",
            removed_person_id, person_to_link_to
        );
        Ok(ManualLinkResult {
            person: updated,
            removed_person_id,
            ledger,
        })
    }

    /// Split `contact_id` off its person into a person of its own.
    pub async fn manually_unlink(
        &self,
        person_to_remove_link_from: &str,
        contact_to_remove_from_person: &str,
    ) -> Result<ManualUnlinkResult> {
        let mut missing = String::new();
        if person_to_remove_link_from.is_empty() {
            missing.push_str("The 'personToRemoveLinkFrom' parameter was not specified. ");
        }
        if contact_to_remove_from_person.is_empty() {
            missing.push_str("The 'contactToRemoveFromPerson' parameter was not specified.");
        }
        if !missing.is_empty() {
            return Err(Error::InvalidParameter(missing.trim_end().to_string()));
        }

        let person = self.load_person(person_to_remove_link_from).await?;
        if !person.has_contact(contact_to_remove_from_person) {
            return Err(Error::InvalidParameter(format!(
                "contact {} does not belong to person {}",
                contact_to_remove_from_person, person_to_remove_link_from
            )));
        }
        if person.contact_count() < 2 {
            return Err(Error::InvalidParameter(format!(
                "contact {} is the only contact of person {}",
                contact_to_remove_from_person, person_to_remove_link_from
            )));
        }
        self.require_link_hashes(&person.contact_ids).await?;

        let original = person.clone();
        let mut updated = person;
        updated.remove_contact_id(contact_to_remove_from_person);
        self.autolinker.fixup_and_save(&mut updated).await?;
        self.plugins.person_changed(&original, &updated).await;

        let mut new_person = Person::with_contacts(vec![contact_to_remove_from_person.to_string()]);
        self.autolinker.fixup_and_save(&mut new_person).await?;
        self.plugins.person_added(&new_person).await;

        let ledger = self
            .ledger
            .record_manual_unlink(&updated, contact_to_remove_from_person)
            .await?;
        info!(
            "Manually unlinked contact {} from person {}",
            contact_to_remove_from_person, person_to_remove_link_from
        );
        Ok(ManualUnlinkResult {
            person: updated,
            new_person,
            ledger,
        })
    }

    /// Delete a person none of whose contacts is still live.
    ///
    /// Returns `false` and leaves the person alone when it still has contacts.
    pub async fn delete_orphaned_person(&self, person_id: &str) -> Result<bool> {
        if person_id.is_empty() {
            return Err(Error::InvalidParameter(
                "The 'personId' parameter was not specified.".to_string(),
            ));
        }
        let person = Person::load(self.store.as_ref(), person_id).await?;
        if person.deleted {
            return Ok(false);
        }
        let live = person
            .reload_contacts(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|c| !c.deleted)
            .count();
        if live > 0 {
            warn!(
                "Person {} still has {} contacts and cannot be deleted",
                person_id, live
            );
            return Ok(false);
        }
        self.store.del(&[person_id.to_string()]).await?;
        self.plugins.person_removed(&person).await;
        Ok(true)
    }

    pub async fn save_new_person_and_contacts(
        &self,
        person: Person,
        contacts: Vec<Contact>,
    ) -> Result<SavedPerson> {
        self.autolinker
            .save_new_person_and_contacts(person, contacts)
            .await
    }

    /// Record a manual link between two contact groups without touching persons.
    pub async fn performed_manual_link(
        &self,
        group_a: &[String],
        group_b: &[String],
    ) -> Result<ManualLinkSummary> {
        self.ledger.record_manual_link(group_a, group_b).await
    }

    /// Record a manual unlink of `contact_id` from `person_id` without touching persons.
    pub async fn performed_unlink(
        &self,
        person_id: &str,
        contact_id: &str,
    ) -> Result<ManualUnlinkSummary> {
        let person = Person::load(self.store.as_ref(), person_id).await?;
        self.ledger.record_manual_unlink(&person, contact_id).await
    }

    pub async fn manual_links(&self, contact_id: &str) -> Result<Vec<LinkRecord>> {
        self.ledger.manual_links(contact_id).await
    }

    pub async fn unlink_links(&self, contact_id: &str) -> Result<Vec<LinkRecord>> {
        self.ledger.unlink_links(contact_id).await
    }

    pub async fn reset_ledger(&self) -> Result<ResetSummary> {
        self.ledger.reset().await
    }

    pub async fn dump_ledger(&self) -> Result<LedgerDump> {
        self.ledger.dump().await
    }
}
