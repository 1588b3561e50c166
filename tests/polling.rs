use std::{sync::Arc, time::Duration};

use anyhow::*;
use clap::Parser;
use openflow_stats::{
    cli,
    device::{DatapathId, DeviceContext},
    protocol::MultipartType,
    statistics::{StatisticsCategory, StatisticsManager},
    store::{InMemoryStore, ItemKey},
    transport::fake::{FakeFlow, FakeSwitch},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_polling_converges_store() -> Result<()> {
    cli::init_with(cli::Args::parse_from(vec![
        &std::env::args().next().unwrap_or_default(), // Required dummy argv[0] (program name)
        "--min-poll-delay-ms",
        "50",
        "--max-poll-delay-ms",
        "500",
        "--request-timeout-ms",
        "1000",
        "--disabled-categories",
        "queue",
    ]));

    let switch = Arc::new(
        FakeSwitch::builder(DatapathId(11))
            .flows(vec![FakeFlow::new(0, 1, 0), FakeFlow::new(0, 2, 0)])
            .groups(vec![1, 2])
            .meters(vec![7])
            .reply_parts(2)
            .build(),
    );
    let store = InMemoryStore::new();
    let manager = StatisticsManager::new(
        cli::statistics_config(),
        Arc::new(store.clone()),
        cli::work_mode(),
    );
    manager
        .device_connected(DeviceContext::new(switch.info(), switch.clone()))
        .await?;

    let device = wait_for_rounds(&manager, DatapathId(11), 1).await?;
    assert!(!device.collecting.contains(&StatisticsCategory::Queue));
    assert!(store.contains(DatapathId(11), &ItemKey::Group(2)).await);
    assert!(store.contains(DatapathId(11), &ItemKey::Meter(7)).await);

    switch.set_groups(vec![1]);
    switch.set_flows(vec![FakeFlow::new(0, 2, 0)]);
    let rounds = device.rounds;
    wait_for_rounds(&manager, DatapathId(11), rounds + 2).await?;

    let items = store
        .device(DatapathId(11))
        .await
        .context("Device should have stored items")?;
    assert!(!items.contains(&ItemKey::Group(2)));
    assert!(!items.contains(&ItemKey::GroupStatistics(2)));
    assert_eq!(
        items
            .keys()
            .filter(|key| matches!(key, ItemKey::Flow { .. }))
            .count(),
        1
    );
    assert!(!switch.requests_seen().contains(&MultipartType::Queue));

    manager.device_disconnected(DatapathId(11)).await?;
    let seen = switch.requests_seen().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(switch.requests_seen().len(), seen);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_fails_round_and_keeps_polling_alive() -> Result<()> {
    let switch = Arc::new(
        FakeSwitch::builder(DatapathId(12))
            .reply_delay(Duration::from_millis(20))
            .build(),
    );
    let store = InMemoryStore::new();
    let manager = StatisticsManager::new(
        openflow_stats::statistics::StatisticsConfig {
            min_poll_delay: Duration::from_millis(50),
            max_poll_delay: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        Arc::new(store.clone()),
        openflow_stats::statistics::WorkMode::CollectAll,
    );
    manager
        .device_connected(DeviceContext::new(switch.info(), switch.clone()))
        .await?;
    let device = wait_for_rounds(&manager, DatapathId(12), 1).await?;

    switch.disconnect();
    let device = wait_for_rounds(&manager, DatapathId(12), device.rounds + 2).await?;
    let last_round = device.last_round.context("A round should be recorded")?;
    assert!(!last_round.success);

    manager.close().await?;
    assert!(manager.devices().await?.is_empty());

    Ok(())
}

async fn wait_for_rounds(
    manager: &StatisticsManager,
    datapath_id: DatapathId,
    rounds: u64,
) -> Result<openflow_stats::statistics::ManagedDeviceInfo> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(device) = manager.device(datapath_id).await?
                && device.rounds >= rounds
            {
                return Ok(device);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("Timed out waiting for statistics rounds")?
}
