//! Mirrors configuration changes into the store while periodic polling is off.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::*;

use crate::{
    device::DatapathId,
    lifecycle::{ItemLifecycleEvent, ItemLifecycleListener, LifecycleItem},
    registry::{DeviceRegistry, FlowRegistryKey},
    store::{ItemKey, StatisticsStore},
};

/// Listener that keeps `store` and `registry` in sync with added and removed items of one device.
pub fn store_item_lifecycle_listener(
    datapath_id: DatapathId,
    store: Arc<dyn StatisticsStore>,
    registry: Arc<DeviceRegistry>,
) -> ItemLifecycleListener {
    ItemLifecycleListener::new(move |event| {
        let store = store.clone();
        let registry = registry.clone();
        async move { on_event(datapath_id, store.as_ref(), &registry, event).await }
    })
}

#[instrument(level = "debug", skip(store, registry))]
async fn on_event(
    datapath_id: DatapathId,
    store: &dyn StatisticsStore,
    registry: &DeviceRegistry,
    event: ItemLifecycleEvent,
) -> Result<()> {
    match event {
        ItemLifecycleEvent::Added(item) => {
            let Some(key) = register(registry, &item) else {
                return Ok(());
            };
            let value = serde_json::to_value(&item).context("Failed serializing item")?;
            store
                .put_item(datapath_id, key.clone(), value)
                .await
                .with_context(|| format!("Failed storing {key}"))?;
        }
        ItemLifecycleEvent::Removed(item) => {
            let Some(key) = unregister(registry, &item) else {
                trace!("{item:?} was never registered");
                return Ok(());
            };
            store
                .delete_items(datapath_id, vec![key.clone()])
                .await
                .with_context(|| format!("Failed deleting {key}"))?;
        }
    }

    Ok(())
}

/// Records the item in its registry and returns where it is stored.
fn register(registry: &DeviceRegistry, item: &LifecycleItem) -> Option<ItemKey> {
    match item {
        LifecycleItem::Flow { table_id, .. } => {
            let key = FlowRegistryKey::from_lifecycle_item(item)?;
            let flow_id = registry.flows().store_if_necessary(key);
            Some(ItemKey::Flow {
                table_id: *table_id,
                flow_id,
            })
        }
        LifecycleItem::Group { group_id } => {
            registry.groups().store(*group_id);
            Some(ItemKey::Group(*group_id))
        }
        LifecycleItem::Meter { meter_id } => {
            registry.meters().store(*meter_id);
            Some(ItemKey::Meter(*meter_id))
        }
    }
}

fn unregister(registry: &DeviceRegistry, item: &LifecycleItem) -> Option<ItemKey> {
    match item {
        LifecycleItem::Flow { .. } => {
            let key = FlowRegistryKey::from_lifecycle_item(item)?;
            let mut flows = registry.flows();
            flows.mark_to_be_removed(key);
            let descriptor = flows.remove_marked().into_iter().next()?;
            Some(ItemKey::Flow {
                table_id: descriptor.table_id,
                flow_id: descriptor.flow_id,
            })
        }
        LifecycleItem::Group { group_id } => {
            let mut groups = registry.groups();
            if !groups.contains(group_id) {
                return None;
            }
            groups.mark_to_be_removed(*group_id);
            groups.remove_marked();
            Some(ItemKey::Group(*group_id))
        }
        LifecycleItem::Meter { meter_id } => {
            let mut meters = registry.meters();
            if !meters.contains(meter_id) {
                return None;
            }
            meters.mark_to_be_removed(*meter_id);
            meters.remove_marked();
            Some(ItemKey::Meter(*meter_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lifecycle::ItemLifecycleSource,
        protocol::{MatchField, MatchFieldType},
        store::InMemoryStore,
    };

    fn flow(priority: u16) -> LifecycleItem {
        LifecycleItem::Flow {
            table_id: 2,
            priority,
            cookie: 7,
            match_fields: vec![MatchField {
                field: MatchFieldType::EthType,
                value: 0x0800,
                mask: None,
            }],
        }
    }

    #[tokio::test]
    async fn added_and_removed_items_reach_the_store() {
        let store = InMemoryStore::new();
        let registry = Arc::new(DeviceRegistry::default());
        let source = ItemLifecycleSource::default();
        source.set_listener(Some(store_item_lifecycle_listener(
            DatapathId(9),
            Arc::new(store.clone()),
            registry.clone(),
        )));

        source
            .notify(ItemLifecycleEvent::Added(flow(10)))
            .await
            .unwrap();
        source
            .notify(ItemLifecycleEvent::Added(LifecycleItem::Group { group_id: 3 }))
            .await
            .unwrap();

        let flow_key = ItemKey::Flow {
            table_id: 2,
            flow_id: crate::registry::FlowId("#UF$TABLE*2-1".to_string()),
        };
        assert!(store.contains(DatapathId(9), &flow_key).await);
        assert!(store.contains(DatapathId(9), &ItemKey::Group(3)).await);
        assert_eq!(registry.groups().all_ids(), vec![3]);

        source
            .notify(ItemLifecycleEvent::Removed(flow(10)))
            .await
            .unwrap();
        source
            .notify(ItemLifecycleEvent::Removed(LifecycleItem::Group { group_id: 3 }))
            .await
            .unwrap();

        let device = store.device(DatapathId(9)).await.unwrap();
        assert!(!device.contains(&flow_key));
        assert!(!device.contains(&ItemKey::Group(3)));
        assert!(registry.flows().is_empty());
        assert!(registry.groups().all_ids().is_empty());
    }

    #[tokio::test]
    async fn removing_unknown_items_is_a_no_op() {
        let store = InMemoryStore::new();
        let listener = store_item_lifecycle_listener(
            DatapathId(1),
            Arc::new(store.clone()),
            Arc::new(DeviceRegistry::default()),
        );
        let source = ItemLifecycleSource::default();
        source.set_listener(Some(listener));

        source
            .notify(ItemLifecycleEvent::Removed(LifecycleItem::Meter { meter_id: 1 }))
            .await
            .unwrap();
        source
            .notify(ItemLifecycleEvent::Removed(flow(1)))
            .await
            .unwrap();
        assert!(store.device(DatapathId(1)).await.is_none());
    }
}
