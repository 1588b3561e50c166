//! The operational store statistics are written to.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::*;

use crate::{
    device::DatapathId,
    error::StoreError,
    registry::FlowId,
    statistics::{SnapshotBody, StatisticsCategory, StatisticsSnapshot},
};

/// Path of one stored item below its device node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKey {
    Flow { table_id: u8, flow_id: FlowId },
    FlowTable(u8),
    NodeConnector(String),
    Queue { node_connector_id: String, queue_id: u32 },
    Group(u32),
    GroupStatistics(u32),
    Meter(u32),
    MeterStatistics(u32),
    AggregateFlow,
    GroupFeatures,
    MeterFeatures,
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flow { table_id, flow_id } => write!(f, "table/{table_id}/flow/{flow_id}"),
            Self::FlowTable(table_id) => write!(f, "table/{table_id}/statistics"),
            Self::NodeConnector(id) => write!(f, "node-connector/{id}/statistics"),
            Self::Queue {
                node_connector_id,
                queue_id,
            } => write!(f, "node-connector/{node_connector_id}/queue/{queue_id}"),
            Self::Group(group_id) => write!(f, "group/{group_id}"),
            Self::GroupStatistics(group_id) => write!(f, "group/{group_id}/statistics"),
            Self::Meter(meter_id) => write!(f, "meter/{meter_id}"),
            Self::MeterStatistics(meter_id) => write!(f, "meter/{meter_id}/statistics"),
            Self::AggregateFlow => write!(f, "aggregate-flow-statistics"),
            Self::GroupFeatures => write!(f, "group-features"),
            Self::MeterFeatures => write!(f, "meter-features"),
        }
    }
}

impl ItemKey {
    /// Items stored below this one, which go away together with it.
    fn children(&self) -> Vec<ItemKey> {
        match self {
            Self::Group(group_id) => vec![Self::GroupStatistics(*group_id)],
            Self::Meter(meter_id) => vec![Self::MeterStatistics(*meter_id)],
            _ => Vec::new(),
        }
    }
}

/// One logical write: the fresh snapshot plus the stale keys it replaces.
#[derive(Debug, Clone)]
pub struct StatisticsWrite {
    pub datapath_id: DatapathId,
    pub snapshot: Arc<StatisticsSnapshot>,
    /// Ids of the flow entries, in snapshot order. Empty for other categories.
    pub flow_ids: Vec<FlowId>,
    pub removals: Vec<ItemKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatheringStatus {
    pub begin: DateTime<Utc>,
    pub end: Option<GatheringStatusEnd>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatheringStatusEnd {
    pub end: DateTime<Utc>,
    pub succeeded: bool,
}

#[async_trait::async_trait]
pub trait StatisticsWriter: Send + Sync {
    async fn write(&self, write: StatisticsWrite, is_on_fly: bool) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait StatisticsStore: Send + Sync {
    fn lookup(&self, category: StatisticsCategory) -> Option<Arc<dyn StatisticsWriter>>;

    async fn write_gathering_status(
        &self,
        datapath_id: DatapathId,
        status: GatheringStatus,
    ) -> Result<(), StoreError>;

    /// Writes one item outside of a gathering round.
    async fn put_item(
        &self,
        datapath_id: DatapathId,
        key: ItemKey,
        value: Value,
    ) -> Result<(), StoreError>;

    async fn delete_items(
        &self,
        datapath_id: DatapathId,
        keys: Vec<ItemKey>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteCounters {
    pub writes: u64,
    pub on_fly_writes: u64,
    pub last_write: Option<DateTime<Utc>>,
    pub last_entries: usize,
    pub last_removals: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceItems {
    pub items: IndexMap<String, Value>,
    #[serde(skip)]
    keys: IndexMap<ItemKey, ()>,
    pub gathering_status: Option<GatheringStatus>,
    pub writes: IndexMap<StatisticsCategory, WriteCounters>,
}

impl DeviceItems {
    fn put(&mut self, key: ItemKey, value: Value) {
        self.items.insert(key.to_string(), value);
        self.keys.insert(key, ());
    }

    fn delete(&mut self, key: &ItemKey) {
        for child in key.children() {
            self.delete(&child);
        }
        self.items.shift_remove(&key.to_string());
        self.keys.shift_remove(key);
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ItemKey> {
        self.keys.keys()
    }
}

#[derive(Debug, Default)]
struct InMemoryStoreInner {
    devices: RwLock<IndexMap<DatapathId, DeviceItems>>,
    failing: Mutex<HashSet<StatisticsCategory>>,
    missing_writers: Mutex<HashSet<StatisticsCategory>>,
}

/// Store keeping every device's items in memory, serialized as JSON.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<InMemoryStoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write of `category` fail until called again with `false`.
    pub fn fail_writes(&self, category: StatisticsCategory, fail: bool) {
        let mut failing = self
            .inner
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fail {
            failing.insert(category);
        } else {
            failing.remove(&category);
        }
    }

    pub fn remove_writer(&self, category: StatisticsCategory) {
        self.inner
            .missing_writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(category);
    }

    pub async fn device(&self, datapath_id: DatapathId) -> Option<DeviceItems> {
        self.inner.devices.read().await.get(&datapath_id).cloned()
    }

    pub async fn contains(&self, datapath_id: DatapathId, key: &ItemKey) -> bool {
        self.inner
            .devices
            .read()
            .await
            .get(&datapath_id)
            .is_some_and(|device| device.contains(key))
    }

    pub async fn remove_device(&self, datapath_id: DatapathId) {
        self.inner.devices.write().await.shift_remove(&datapath_id);
    }
}

#[async_trait::async_trait]
impl StatisticsStore for InMemoryStore {
    fn lookup(&self, category: StatisticsCategory) -> Option<Arc<dyn StatisticsWriter>> {
        let missing = self
            .inner
            .missing_writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&category);
        if missing {
            return None;
        }

        Some(Arc::new(CategoryWriter {
            category,
            inner: self.inner.clone(),
        }))
    }

    async fn write_gathering_status(
        &self,
        datapath_id: DatapathId,
        status: GatheringStatus,
    ) -> Result<(), StoreError> {
        let mut devices = self.inner.devices.write().await;
        devices.entry(datapath_id).or_default().gathering_status = Some(status);
        Ok(())
    }

    async fn put_item(
        &self,
        datapath_id: DatapathId,
        key: ItemKey,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut devices = self.inner.devices.write().await;
        devices.entry(datapath_id).or_default().put(key, value);
        Ok(())
    }

    async fn delete_items(
        &self,
        datapath_id: DatapathId,
        keys: Vec<ItemKey>,
    ) -> Result<(), StoreError> {
        let mut devices = self.inner.devices.write().await;
        if let Some(device) = devices.get_mut(&datapath_id) {
            for key in &keys {
                device.delete(key);
            }
        }
        Ok(())
    }
}

struct CategoryWriter {
    category: StatisticsCategory,
    inner: Arc<InMemoryStoreInner>,
}

#[async_trait::async_trait]
impl StatisticsWriter for CategoryWriter {
    #[instrument(level = "trace", skip(self, write), fields(category = %self.category, dpid = %write.datapath_id))]
    async fn write(&self, write: StatisticsWrite, is_on_fly: bool) -> Result<(), StoreError> {
        let failing = self
            .inner
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&self.category);
        if failing {
            return Err(StoreError::Write {
                category: self.category,
                reason: "store refused the write".to_string(),
            });
        }

        let entries = keyed_entries(&write).map_err(|reason| StoreError::Write {
            category: self.category,
            reason,
        })?;

        let mut devices = self.inner.devices.write().await;
        let device = devices.entry(write.datapath_id).or_default();

        for key in &write.removals {
            device.delete(key);
        }
        let entry_count = entries.len();
        for (key, value) in entries {
            device.put(key, value);
        }

        let counters = device.writes.entry(self.category).or_default();
        counters.writes += 1;
        if is_on_fly {
            counters.on_fly_writes += 1;
        }
        counters.last_write = Some(Utc::now());
        counters.last_entries = entry_count;
        counters.last_removals = write.removals.len();

        Ok(())
    }
}

fn keyed_entries(write: &StatisticsWrite) -> Result<Vec<(ItemKey, Value)>, String> {
    let values = entry_values(&write.snapshot.body).map_err(|error| error.to_string())?;

    let keys = match &write.snapshot.body {
        SnapshotBody::Flow(flows) => {
            if flows.len() != write.flow_ids.len() {
                return Err(format!(
                    "{} flows but {} flow ids",
                    flows.len(),
                    write.flow_ids.len()
                ));
            }
            flows
                .iter()
                .zip(&write.flow_ids)
                .map(|(flow, flow_id)| ItemKey::Flow {
                    table_id: flow.table_id,
                    flow_id: flow_id.clone(),
                })
                .collect()
        }
        _ => write.snapshot.item_keys(),
    };

    Ok(keys.into_iter().zip(values).collect())
}

fn entry_values(body: &SnapshotBody) -> Result<Vec<Value>, serde_json::Error> {
    fn all<T: Serialize>(entries: &[T]) -> Result<Vec<Value>, serde_json::Error> {
        entries.iter().map(serde_json::to_value).collect()
    }

    match body {
        SnapshotBody::Flow(entries) => all(entries),
        SnapshotBody::Table(entries) => all(entries),
        SnapshotBody::Port(entries) => all(entries),
        SnapshotBody::Queue(entries) => all(entries),
        SnapshotBody::Group(entries) => all(entries),
        SnapshotBody::GroupDesc(entries) => all(entries),
        SnapshotBody::Meter(entries) => all(entries),
        SnapshotBody::MeterConfig(entries) => all(entries),
        SnapshotBody::Aggregate(aggregate) => Ok(vec![serde_json::to_value(aggregate)?]),
        SnapshotBody::GroupFeatures(features) => Ok(vec![serde_json::to_value(features)?]),
        SnapshotBody::MeterFeatures(features) => Ok(vec![serde_json::to_value(features)?]),
    }
}
