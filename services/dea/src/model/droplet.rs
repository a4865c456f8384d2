//! Droplets and the agent-wide droplet collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use dea_id::InstanceId;
use dea_messages::DropletId;

use super::{DropletInstance, InstanceRecord};

/// Persisted form of the collection: droplet id → instance id → record.
pub type SnapshotDocument = BTreeMap<DropletId, BTreeMap<InstanceId, InstanceRecord>>;

/// One deployed application and its instances on this node.
#[derive(Debug, Default)]
pub struct Droplet {
    instances: HashMap<InstanceId, Arc<DropletInstance>>,
}

impl Droplet {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// All droplets known to the agent.
///
/// Structural changes take the collection write lock. Readers get
/// point-in-time copies of the instance handles, so no caller holds the
/// lock while doing I/O or publishing.
#[derive(Debug, Default)]
pub struct DropletCollection {
    droplets: RwLock<HashMap<DropletId, Droplet>>,
}

impl DropletCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DropletId, Droplet>> {
        self.droplets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DropletId, Droplet>> {
        self.droplets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an instance, creating its droplet on first use.
    pub fn add_instance(&self, instance: Arc<DropletInstance>) {
        self.write()
            .entry(instance.droplet_id())
            .or_default()
            .instances
            .insert(instance.id(), instance);
    }

    /// Removes an instance; a droplet left without instances is dropped.
    /// Returns whether the instance was present.
    pub fn remove_instance(&self, instance: &DropletInstance) -> bool {
        let mut droplets = self.write();
        let Some(droplet) = droplets.get_mut(&instance.droplet_id()) else {
            return false;
        };

        let removed = droplet.instances.remove(&instance.id()).is_some();
        if droplet.is_empty() {
            droplets.remove(&instance.droplet_id());
        }
        removed
    }

    /// Every instance of every droplet.
    pub fn instances(&self) -> Vec<Arc<DropletInstance>> {
        self.read()
            .values()
            .flat_map(|d| d.instances.values().cloned())
            .collect()
    }

    /// Instances of one droplet; empty if the droplet is unknown.
    pub fn droplet_instances(&self, droplet: DropletId) -> Vec<Arc<DropletInstance>> {
        self.read()
            .get(&droplet)
            .map(|d| d.instances.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instance_count(&self, droplet: DropletId) -> usize {
        self.read().get(&droplet).map_or(0, Droplet::instance_count)
    }

    pub fn find(&self, droplet: DropletId, instance: &InstanceId) -> Option<Arc<DropletInstance>> {
        self.read().get(&droplet)?.instances.get(instance).cloned()
    }

    pub fn contains_droplet(&self, droplet: DropletId) -> bool {
        self.read().contains_key(&droplet)
    }

    pub fn droplet_count(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copies every record into the persisted document shape.
    pub fn to_document(&self) -> SnapshotDocument {
        let mut document = SnapshotDocument::new();
        for instance in self.instances() {
            let record = instance.snapshot();
            document
                .entry(record.droplet_id)
                .or_default()
                .insert(record.instance_id, record);
        }
        document
    }
}
