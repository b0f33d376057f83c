//! Watch activities: re-run the linker when contacts change.
//!
//! An activity pairs a trigger query with a callback. Once any document
//! matches the trigger the activity fires, delivering its callback, and
//! stays quiet until the handler completes it with `restart`.

use async_trait::async_trait;
use parking_lot::Mutex;
use personlink_core::store::REV_FIELD;
use personlink_core::{Contact, DocumentStore, Error, FilterCondition, Query, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type ActivityId = u64;

/// Name of the linker's contact watch.
pub const LINKER_WATCH: &str = "linkerWatch";

/// Parameters handed back when a watch fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchCallback {
    pub rev_changed_start: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDescriptor {
    pub name: String,
    pub description: String,
    pub trigger: Query,
    pub callback: WatchCallback,
}

impl ActivityDescriptor {
    /// The contact watch: fires on any contact, deleted ones included, above `revision`.
    pub fn linker_watch(revision: Option<u64>) -> Self {
        Self {
            name: LINKER_WATCH.to_string(),
            description: "Kicks off the linker on contact changes".to_string(),
            trigger: contact_watch_query(revision),
            callback: WatchCallback {
                rev_changed_start: revision,
            },
        }
    }
}

pub fn contact_watch_query(revision: Option<u64>) -> Query {
    let query = Query::new(Contact::KIND).include_deleted(true).limit(1);
    match revision {
        Some(rev) => query.filter(FilterCondition::greater_than(REV_FIELD, rev as f64)),
        None => query,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// Re-arm the activity instead of retiring it
    pub restart: bool,
    pub trigger: Option<Query>,
    pub callback: Option<WatchCallback>,
}

impl CompleteRequest {
    pub fn restart_at(revision: Option<u64>) -> Self {
        Self {
            restart: true,
            trigger: Some(contact_watch_query(revision)),
            callback: Some(WatchCallback {
                rev_changed_start: revision,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityFired {
    pub activity_id: ActivityId,
    pub callback: WatchCallback,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register an activity, replacing any existing one with the same name.
    async fn create(&self, activity: ActivityDescriptor) -> Result<ActivityId>;

    async fn complete(&self, activity_id: ActivityId, request: CompleteRequest) -> Result<()>;

    async fn cancel(&self, activity_id: ActivityId) -> Result<()>;
}

struct Activity {
    descriptor: ActivityDescriptor,
    armed: bool,
}

/// In-process scheduler that evaluates triggers by polling the store.
pub struct LocalScheduler {
    store: Arc<dyn DocumentStore>,
    activities: Mutex<BTreeMap<ActivityId, Activity>>,
    next_id: AtomicU64,
    sender: mpsc::UnboundedSender<ActivityFired>,
}

impl LocalScheduler {
    /// Create a scheduler and the receiving end of its callback channel.
    pub fn new(
        store: Arc<dyn DocumentStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ActivityFired>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            store,
            activities: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            sender,
        };
        (scheduler, receiver)
    }

    pub fn activity_count(&self) -> usize {
        self.activities.lock().len()
    }

    pub fn descriptor(&self, activity_id: ActivityId) -> Option<ActivityDescriptor> {
        self.activities
            .lock()
            .get(&activity_id)
            .map(|a| a.descriptor.clone())
    }

    /// Evaluate every armed trigger once, firing those that match.
    pub async fn poll(&self) -> Result<usize> {
        let armed: Vec<(ActivityId, ActivityDescriptor)> = self
            .activities
            .lock()
            .iter()
            .filter(|(_, a)| a.armed)
            .map(|(id, a)| (*id, a.descriptor.clone()))
            .collect();

        let mut fired = 0;
        for (activity_id, descriptor) in armed {
            if self.store.find(&descriptor.trigger).await?.results.is_empty() {
                continue;
            }
            {
                let mut activities = self.activities.lock();
                match activities.get_mut(&activity_id) {
                    Some(activity) if activity.armed => activity.armed = false,
                    _ => continue,
                }
            }
            debug!("Activity {} ({}) fired", activity_id, descriptor.name);
            let event = ActivityFired {
                activity_id,
                callback: descriptor.callback,
            };
            if self.sender.send(event).is_err() {
                warn!("Activity {} fired but nobody is listening", activity_id);
            }
            fired += 1;
        }
        Ok(fired)
    }

    /// Poll on a fixed interval until the task is aborted.
    pub fn spawn_poller(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll().await {
                    warn!("Watch poll failed: {}", e);
                }
            }
        })
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn create(&self, activity: ActivityDescriptor) -> Result<ActivityId> {
        let mut activities = self.activities.lock();
        activities.retain(|_, a| a.descriptor.name != activity.name);
        let activity_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(
            "Created activity {} ({}) at revision {:?}",
            activity_id, activity.name, activity.callback.rev_changed_start
        );
        activities.insert(
            activity_id,
            Activity {
                descriptor: activity,
                armed: true,
            },
        );
        Ok(activity_id)
    }

    async fn complete(&self, activity_id: ActivityId, request: CompleteRequest) -> Result<()> {
        let mut activities = self.activities.lock();
        if !request.restart {
            return activities
                .remove(&activity_id)
                .map(|_| ())
                .ok_or_else(|| Error::Scheduler(format!("unknown activity {}", activity_id)));
        }
        let activity = activities
            .get_mut(&activity_id)
            .ok_or_else(|| Error::Scheduler(format!("unknown activity {}", activity_id)))?;
        if let Some(trigger) = request.trigger {
            activity.descriptor.trigger = trigger;
        }
        if let Some(callback) = request.callback {
            activity.descriptor.callback = callback;
        }
        activity.armed = true;
        debug!("Activity {} restarted", activity_id);
        Ok(())
    }

    async fn cancel(&self, activity_id: ActivityId) -> Result<()> {
        self.activities
            .lock()
            .remove(&activity_id)
            .map(|_| ())
            .ok_or_else(|| Error::Scheduler(format!("unknown activity {}", activity_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use personlink_core::MemoryStore;

    #[tokio::test]
    async fn test_watch_fires_once_until_restarted() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, mut fired) = LocalScheduler::new(store.clone());

        let id = scheduler
            .create(ActivityDescriptor::linker_watch(Some(0)))
            .await
            .unwrap();
        assert_eq!(scheduler.poll().await.unwrap(), 0);

        let contact = Contact::new().with_email("a@example.com");
        store.put(vec![contact.to_document().unwrap()]).await.unwrap();

        assert_eq!(scheduler.poll().await.unwrap(), 1);
        let event = fired.recv().await.unwrap();
        assert_eq!(event.activity_id, id);
        assert_eq!(event.callback.rev_changed_start, Some(0));
        assert_eq!(scheduler.poll().await.unwrap(), 0);

        let rev = store.current_rev();
        scheduler
            .complete(id, CompleteRequest::restart_at(Some(rev)))
            .await
            .unwrap();
        assert_eq!(scheduler.poll().await.unwrap(), 0);

        store.del(&[event_contact_id(&store).await]).await.unwrap();
        assert_eq!(scheduler.poll().await.unwrap(), 1);
        assert_eq!(
            fired.recv().await.unwrap().callback.rev_changed_start,
            Some(rev)
        );
    }

    async fn event_contact_id(store: &MemoryStore) -> String {
        let found = store.find(&Query::new(Contact::KIND)).await.unwrap();
        found.results[0]["_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_create_replaces_by_name() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _fired) = LocalScheduler::new(store);
        let first = scheduler
            .create(ActivityDescriptor::linker_watch(None))
            .await
            .unwrap();
        let second = scheduler
            .create(ActivityDescriptor::linker_watch(Some(4)))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(scheduler.activity_count(), 1);
        assert!(scheduler.complete(first, CompleteRequest::default()).await.is_err());
        scheduler.cancel(second).await.unwrap();
        assert_eq!(scheduler.activity_count(), 0);
    }
}
