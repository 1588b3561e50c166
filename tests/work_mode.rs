use std::{sync::Arc, time::Duration};

use anyhow::*;
use openflow_stats::{
    device::{DatapathId, DeviceContext},
    lifecycle::{ItemLifecycleEvent, ItemLifecycleSource, LifecycleItem},
    statistics::{SchedulerState, StatisticsConfig, StatisticsManager, WorkMode},
    store::{InMemoryStore, ItemKey},
    transport::fake::FakeSwitch,
};

fn config() -> StatisticsConfig {
    StatisticsConfig {
        min_poll_delay: Duration::from_millis(100),
        max_poll_delay: Duration::from_secs(1),
        request_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lifecycle_events_update_store_while_polling_is_off() -> Result<()> {
    let store = InMemoryStore::new();
    let manager = StatisticsManager::new(config(), Arc::new(store.clone()), WorkMode::CollectAll);

    let mut devices = Vec::new();
    for index in 1..=3 {
        let switch = Arc::new(FakeSwitch::builder(DatapathId(index)).build());
        let source = Arc::new(ItemLifecycleSource::default());
        manager
            .device_connected(
                DeviceContext::new(switch.info(), switch.clone())
                    .with_lifecycle_source(source.clone()),
            )
            .await?;
        devices.push((switch, source));
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let devices = manager.devices().await?;
            if devices.iter().all(|device| device.synchronized) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("Timed out waiting for the first rounds")??;

    manager.change_work_mode(WorkMode::FullyDisabled).await?;
    for (_switch, source) in &devices {
        assert!(source.has_listener());
    }
    for device in manager.devices().await? {
        assert!(device.scheduler_state.is_none());
    }

    let (switch, source) = &devices[0];
    let seen = switch.requests_seen().len();
    source
        .notify(ItemLifecycleEvent::Added(LifecycleItem::Meter { meter_id: 42 }))
        .await?;
    assert!(store.contains(DatapathId(1), &ItemKey::Meter(42)).await);
    source
        .notify(ItemLifecycleEvent::Removed(LifecycleItem::Meter { meter_id: 42 }))
        .await?;
    assert!(!store.contains(DatapathId(1), &ItemKey::Meter(42)).await);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(switch.requests_seen().len(), seen);

    manager.change_work_mode(WorkMode::CollectAll).await?;
    for (_switch, source) in &devices {
        assert!(!source.has_listener());
    }
    for device in manager.devices().await? {
        assert_eq!(device.scheduler_state, Some(SchedulerState::Running));
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(switch.requests_seen().len() > seen);

    manager.close().await?;
    for (_switch, source) in &devices {
        assert!(!source.has_listener());
    }

    Ok(())
}
