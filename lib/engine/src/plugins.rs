//! Change notifications for code that mirrors the person table.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use personlink_core::{Person, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Receives person lifecycle events. Every method defaults to a no-op.
#[async_trait]
pub trait LinkerPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn person_added(&self, _person: &Person) -> Result<()> {
        Ok(())
    }

    async fn person_removed(&self, _person: &Person) -> Result<()> {
        Ok(())
    }

    async fn person_changed(&self, _original: &Person, _updated: &Person) -> Result<()> {
        Ok(())
    }

    /// A watch-triggered pass has finished.
    async fn sync_done(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PluginEvent {
    PersonAdded { person: Person },
    PersonRemoved { person: Person },
    PersonChanged { original: Person, updated: Person },
    SyncDone,
}

impl PluginEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PluginEvent::PersonAdded { .. } => "personAdded",
            PluginEvent::PersonRemoved { .. } => "personRemoved",
            PluginEvent::PersonChanged { .. } => "personChanged",
            PluginEvent::SyncDone => "syncDone",
        }
    }
}

/// Fans events out to every registered plugin.
///
/// A failing plugin is logged and the remaining plugins still run.
#[derive(Default)]
pub struct PluginDispatcher {
    plugins: RwLock<Vec<Arc<dyn LinkerPlugin>>>,
}

impl PluginDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn LinkerPlugin>) {
        info!("Registered linker plugin '{}'", plugin.name());
        self.plugins.write().push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    pub async fn dispatch(&self, event: &PluginEvent) {
        let plugins: Vec<Arc<dyn LinkerPlugin>> = self.plugins.read().clone();
        for plugin in plugins {
            let result = match event {
                PluginEvent::PersonAdded { person } => plugin.person_added(person).await,
                PluginEvent::PersonRemoved { person } => plugin.person_removed(person).await,
                PluginEvent::PersonChanged { original, updated } => {
                    plugin.person_changed(original, updated).await
                }
                PluginEvent::SyncDone => plugin.sync_done().await,
            };
            if let Err(e) = result {
                error!(
                    "Exception in plugin {}'s {}: {}",
                    plugin.name(),
                    event.name(),
                    e
                );
            }
        }
    }

    pub async fn person_added(&self, person: &Person) {
        self.dispatch(&PluginEvent::PersonAdded {
            person: person.clone(),
        })
        .await
    }

    pub async fn person_removed(&self, person: &Person) {
        self.dispatch(&PluginEvent::PersonRemoved {
            person: person.clone(),
        })
        .await
    }

    pub async fn person_changed(&self, original: &Person, updated: &Person) {
        self.dispatch(&PluginEvent::PersonChanged {
            original: original.clone(),
            updated: updated.clone(),
        })
        .await
    }

    pub async fn sync_done(&self) {
        self.dispatch(&PluginEvent::SyncDone).await
    }
}

/// Logs every event at info level.
pub struct LoggingPlugin;

#[async_trait]
impl LinkerPlugin for LoggingPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    async fn person_added(&self, person: &Person) -> Result<()> {
        info!("Person added: {:?} ({} contacts)", person.id, person.contact_count());
        Ok(())
    }

    async fn person_removed(&self, person: &Person) -> Result<()> {
        info!("Person removed: {:?}", person.id);
        Ok(())
    }

    async fn person_changed(&self, original: &Person, updated: &Person) -> Result<()> {
        info!(
            "Person changed: {:?} ({} -> {} contacts)",
            updated.id,
            original.contact_count(),
            updated.contact_count()
        );
        Ok(())
    }

    async fn sync_done(&self) -> Result<()> {
        info!("Linker sync done");
        Ok(())
    }
}

/// Keeps every event it receives, in order.
#[derive(Default)]
pub struct RecordingPlugin {
    events: Mutex<Vec<PluginEvent>>,
}

impl RecordingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PluginEvent> {
        self.events.lock().clone()
    }

    /// Event names only, e.g. `["personAdded", "personChanged"]`.
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(PluginEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: PluginEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[async_trait]
impl LinkerPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        "recording"
    }

    async fn person_added(&self, person: &Person) -> Result<()> {
        self.record(PluginEvent::PersonAdded {
            person: person.clone(),
        })
    }

    async fn person_removed(&self, person: &Person) -> Result<()> {
        self.record(PluginEvent::PersonRemoved {
            person: person.clone(),
        })
    }

    async fn person_changed(&self, original: &Person, updated: &Person) -> Result<()> {
        self.record(PluginEvent::PersonChanged {
            original: original.clone(),
            updated: updated.clone(),
        })
    }

    async fn sync_done(&self) -> Result<()> {
        self.record(PluginEvent::SyncDone)
    }
}
