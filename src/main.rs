use std::{sync::Arc, time::Duration};

use anyhow::*;
use tracing::*;

use openflow_stats::{
    cli,
    device::{DatapathId, DeviceContext},
    lifecycle::ItemLifecycleSource,
    logger,
    statistics::StatisticsManager,
    store::InMemoryStore,
    transport::fake::{FakeFlow, FakeSwitch},
    web::{self, AppState},
};

#[tokio::main(flavor = "multi_thread", worker_threads = 10)]
async fn main() -> Result<()> {
    // CLI should be started before logger to allow control over verbosity
    cli::init();
    // Logger should start before everything else to register any log information
    logger::init(cli::log_path(), cli::is_verbose(), cli::is_tracing());

    debug!("Command line call: {}", cli::command_line_string());
    debug!("Command line input struct call: {}", cli::command_line());

    let store = InMemoryStore::new();
    let manager = StatisticsManager::new(
        cli::statistics_config(),
        Arc::new(store.clone()),
        cli::work_mode(),
    );

    for index in 1..=cli::fake_switches() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(index))
                .flows(
                    (0..4)
                        .map(|priority| FakeFlow::new((priority % 2) as u8, priority, index))
                        .collect(),
                )
                .groups(vec![1, 2])
                .meters(vec![1])
                .reply_delay(Duration::from_millis(50 * index))
                .build(),
        );
        let device = DeviceContext::new(switch.info(), switch)
            .with_lifecycle_source(Arc::new(ItemLifecycleSource::default()));

        manager
            .device_connected(device)
            .await
            .with_context(|| format!("Failed connecting fake switch {index}"))?;
    }

    web::run(
        cli::web_server(),
        AppState {
            manager: manager.clone(),
            store,
        },
    )
    .await;

    for device in manager.devices().await? {
        debug!("Disconnecting {}", device.datapath_id);
        manager.device_disconnected(device.datapath_id).await?;
    }
    manager.close().await?;

    Ok(())
}
