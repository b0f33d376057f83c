// Integration tests for personlink
use personlink::prelude::*;
use personlink_engine::{ActivityFired, RecordingPlugin};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

struct Service {
    storage: Arc<StorageManager>,
    scheduler: Arc<LocalScheduler>,
    fired: UnboundedReceiver<ActivityFired>,
    context: LinkerContext,
}

fn open(dir: &std::path::Path) -> Service {
    let storage = Arc::new(StorageManager::open(dir).unwrap());
    let (scheduler, fired) = LocalScheduler::new(storage.clone());
    let scheduler = Arc::new(scheduler);
    let context = LinkerContext::new(storage.clone(), scheduler.clone(), LinkerConfig::default());
    Service {
        storage,
        scheduler,
        fired,
        context,
    }
}

async fn insert(storage: &StorageManager, contact: Contact) -> String {
    let written = storage.put(vec![contact.to_document().unwrap()]).await.unwrap();
    written[0].id.clone()
}

async fn persons_len(storage: &StorageManager) -> usize {
    persons(storage).await.len()
}

async fn persons(storage: &StorageManager) -> Vec<Person> {
    storage
        .find_all(&Query::new(Person::KIND))
        .await
        .unwrap()
        .into_iter()
        .map(|d| Person::from_document(d).unwrap())
        .collect()
}

#[tokio::test]
async fn test_linked_persons_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = {
        let service = open(dir.path());
        let a = insert(&service.storage, Contact::new().with_name("Ada", "Lovelace").with_email("ada@example.com")).await;
        let b = insert(&service.storage, Contact::new().with_name("Ada", "Lovelace").with_email("ADA@example.com")).await;
        insert(&service.storage, Contact::new().with_name("Alan", "Turing")).await;

        let report = service.context.force_autolink().await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Completed);
        assert_eq!(persons(&service.storage).await.len(), 2);
        service.storage.save().unwrap();
        (a, b)
    };

    let service = open(dir.path());
    let persons = persons(&service.storage).await;
    assert_eq!(persons.len(), 2);
    let ada = persons.iter().find(|p| p.has_contact(&a)).unwrap();
    assert!(ada.has_contact(&b));
    assert_eq!(ada.contact_count(), 2);

    let report = service.context.force_autolink().await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(persons_len(&service.storage).await, 2);
}

#[tokio::test]
async fn test_manual_unlink_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = {
        let service = open(dir.path());
        let a = insert(&service.storage, Contact::new().with_phone("+1 415 555 0101", PhoneType::Mobile).with_email("jo@example.com")).await;
        let b = insert(&service.storage, Contact::new().with_email("jo@example.com")).await;
        service.context.force_autolink().await.unwrap();

        let merged = persons(&service.storage).await;
        assert_eq!(merged.len(), 1);
        let person_id = merged[0].id.clone().unwrap();
        service.context.manually_unlink(&person_id, &b).await.unwrap();
        (a, b)
    };

    // Reopen from the WAL alone.
    let service = open(dir.path());
    assert_eq!(service.context.unlink_links(&a).await.unwrap().len(), 1);

    service.context.force_autolink().await.unwrap();
    let persons = persons(&service.storage).await;
    assert_eq!(persons.len(), 2);
    assert!(persons.iter().all(|p| p.contact_count() == 1));
    assert!(persons.iter().any(|p| p.has_contact(&b)));
}

#[tokio::test]
async fn test_watch_relinks_new_contacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = open(dir.path());
    let recorder = Arc::new(RecordingPlugin::new());
    service.context.register_plugin(recorder.clone());

    insert(&service.storage, Contact::new().with_email("lin@example.com")).await;
    service.context.force_autolink().await.unwrap();
    assert_eq!(service.scheduler.poll().await.unwrap(), 0);

    insert(&service.storage, Contact::new().with_name("Lin", "Wu").with_email("lin@example.com")).await;
    let rev = service.storage.memory().current_rev();
    assert_eq!(service.scheduler.poll().await.unwrap(), 1);

    let fired = service.fired.recv().await.unwrap();
    let report = service.context.handle_fired(fired).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.watermark, Some(rev));

    let persons = persons(&service.storage).await;
    assert_eq!(persons.len(), 1);
    assert_eq!(persons[0].contact_count(), 2);
    assert_eq!(recorder.count("syncDone"), 1);
}

#[tokio::test]
async fn test_ledger_reset_restores_automatic_linking() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(dir.path());
    let a = insert(&service.storage, Contact::new().with_email("kit@example.com").with_sync_identity("acct", "1")).await;
    let b = insert(&service.storage, Contact::new().with_email("kit@example.com").with_sync_identity("acct", "2")).await;
    service.context.force_autolink().await.unwrap();
    let person_id = persons(&service.storage).await[0].id.clone().unwrap();
    service.context.manually_unlink(&person_id, &b).await.unwrap();

    let dump = service.context.dump_ledger().await.unwrap();
    assert_eq!(dump.manual_unlinks.len(), 1);

    let reset = service.context.reset_ledger().await.unwrap();
    assert_eq!(reset.manual_unlinks, 1);
    assert!(service.context.unlink_links(&a).await.unwrap().is_empty());

    service.context.force_autolink().await.unwrap();
    assert_eq!(persons_len(&service.storage).await, 1);
}
