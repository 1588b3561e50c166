//! Per-device identity registries used to delete stale entries from the store.

use std::{
    collections::HashSet,
    hash::Hash,
    sync::{Mutex, MutexGuard},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{lifecycle::LifecycleItem, protocol::MatchField, statistics::snapshot::FlowStatistics};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub String);

impl FlowId {
    /// Id for a flow the switch reports but nobody configured.
    pub fn alien(table_id: u8, sequence: u64) -> Self {
        Self(format!("#UF$TABLE*{table_id}-{sequence}"))
    }

    pub fn is_alien(&self) -> bool {
        self.0.starts_with("#UF$TABLE*")
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a flow as seen in statistics replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRegistryKey {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub match_fields: Vec<MatchField>,
}

impl FlowRegistryKey {
    pub fn new(table_id: u8, priority: u16, cookie: u64, mut match_fields: Vec<MatchField>) -> Self {
        match_fields.sort();
        Self {
            table_id,
            priority,
            cookie,
            match_fields,
        }
    }

    pub fn from_statistics(flow: &FlowStatistics) -> Self {
        Self::new(
            flow.table_id,
            flow.priority,
            flow.cookie,
            flow.match_fields.clone(),
        )
    }

    pub fn from_lifecycle_item(item: &LifecycleItem) -> Option<Self> {
        match item {
            LifecycleItem::Flow {
                table_id,
                priority,
                cookie,
                match_fields,
            } => Some(Self::new(*table_id, *priority, *cookie, match_fields.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub table_id: u8,
    pub flow_id: FlowId,
}

#[derive(Debug, Default)]
pub struct DeviceFlowRegistry {
    flows: IndexMap<FlowRegistryKey, FlowDescriptor>,
    marked: HashSet<FlowRegistryKey>,
    alien_sequence: u64,
}

impl DeviceFlowRegistry {
    pub fn store(&mut self, key: FlowRegistryKey, flow_id: FlowId) {
        let descriptor = FlowDescriptor {
            table_id: key.table_id,
            flow_id,
        };
        trace!("Storing flow {descriptor:?}");
        self.flows.insert(key, descriptor);
    }

    /// Known id of the flow, or a freshly stored alien id.
    pub fn store_if_necessary(&mut self, key: FlowRegistryKey) -> FlowId {
        if let Some(descriptor) = self.flows.get(&key) {
            return descriptor.flow_id.clone();
        }

        self.alien_sequence += 1;
        let flow_id = FlowId::alien(key.table_id, self.alien_sequence);
        self.store(key, flow_id.clone());
        flow_id
    }

    /// Ids for `keys` without storing the flows: the known id, or a reserved alien id for flows
    /// seen for the first time. Repeated keys share one id.
    pub fn reserve_ids(&mut self, keys: &[FlowRegistryKey]) -> Vec<(FlowId, bool)> {
        let mut reserved: IndexMap<&FlowRegistryKey, FlowId> = IndexMap::new();

        keys.iter()
            .map(|key| {
                if let Some(descriptor) = self.flows.get(key) {
                    return (descriptor.flow_id.clone(), false);
                }
                if let Some(flow_id) = reserved.get(key) {
                    return (flow_id.clone(), false);
                }
                self.alien_sequence += 1;
                let flow_id = FlowId::alien(key.table_id, self.alien_sequence);
                reserved.insert(key, flow_id.clone());
                (flow_id, true)
            })
            .collect()
    }

    pub fn retrieve_descriptor(&self, key: &FlowRegistryKey) -> Option<&FlowDescriptor> {
        self.flows.get(key)
    }

    pub fn mark_to_be_removed(&mut self, key: FlowRegistryKey) {
        self.marked.insert(key);
    }

    /// Drops every marked flow, returning their descriptors.
    pub fn remove_marked(&mut self) -> Vec<FlowDescriptor> {
        let removed = self
            .marked
            .drain()
            .filter_map(|key| self.flows.shift_remove(&key))
            .collect::<Vec<_>>();
        if !removed.is_empty() {
            trace!("Removed {} marked flows", removed.len());
        }
        removed
    }

    pub fn all_keys(&self) -> Vec<FlowRegistryKey> {
        self.flows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Registry of plain numeric ids, used for groups and meters.
#[derive(Debug)]
pub struct IdRegistry<Id> {
    ids: IndexMap<Id, ()>,
    marked: HashSet<Id>,
}

impl<Id> Default for IdRegistry<Id> {
    fn default() -> Self {
        Self {
            ids: IndexMap::new(),
            marked: HashSet::new(),
        }
    }
}

impl<Id: Copy + Eq + Hash> IdRegistry<Id> {
    pub fn store(&mut self, id: Id) {
        self.ids.insert(id, ());
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.ids.contains_key(id)
    }

    pub fn mark_to_be_removed(&mut self, id: Id) {
        self.marked.insert(id);
    }

    pub fn remove_marked(&mut self) -> Vec<Id> {
        self.marked
            .drain()
            .filter(|id| self.ids.shift_remove(id).is_some())
            .collect()
    }

    pub fn all_ids(&self) -> Vec<Id> {
        self.ids.keys().copied().collect()
    }
}

pub type DeviceGroupRegistry = IdRegistry<u32>;
pub type DeviceMeterRegistry = IdRegistry<u32>;

/// The registries of one device, each behind its own device-scoped lock.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    flows: Mutex<DeviceFlowRegistry>,
    groups: Mutex<DeviceGroupRegistry>,
    meters: Mutex<DeviceMeterRegistry>,
}

impl DeviceRegistry {
    pub fn flows(&self) -> MutexGuard<'_, DeviceFlowRegistry> {
        self.flows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn groups(&self) -> MutexGuard<'_, DeviceGroupRegistry> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn meters(&self) -> MutexGuard<'_, DeviceMeterRegistry> {
        self.meters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
