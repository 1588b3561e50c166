mod actor;
mod protocol;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{
    device::{DatapathId, DeviceContext},
    protocol::OfVersion,
    statistics::{RoundReport, SchedulerState, StatisticsCategory, StatisticsConfig},
    store::StatisticsStore,
};

use actor::ManagerActor;
use protocol::ManagerCommand;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum WorkMode {
    /// Every managed device is polled periodically.
    #[serde(rename = "COLLECTALL")]
    #[strum(serialize = "COLLECTALL")]
    CollectAll,
    /// No polling. Add and remove events keep the store current where a device reports them.
    #[serde(rename = "FULLYDISABLED")]
    #[strum(serialize = "FULLYDISABLED")]
    FullyDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedDeviceInfo {
    pub datapath_id: DatapathId,
    pub version: OfVersion,
    pub collecting: Vec<StatisticsCategory>,
    pub scheduler_state: Option<SchedulerState>,
    pub poll_delay_ms: Option<u64>,
    pub rounds: u64,
    pub listener_registered: bool,
    /// Whether the first round after connect succeeded.
    pub synchronized: bool,
    pub last_round: Option<RoundReport>,
}

/// Owns the statistics context and poll scheduler of every connected device.
///
/// All mutations go through one actor task, so registering, closing and mode changes never
/// interleave.
#[derive(Clone)]
pub struct StatisticsManager {
    sender: mpsc::Sender<ManagerCommand>,
    _task: Arc<Mutex<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for StatisticsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsManager").finish()
    }
}

impl StatisticsManager {
    pub fn new(
        config: StatisticsConfig,
        store: Arc<dyn StatisticsStore>,
        work_mode: WorkMode,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(32);
        let actor = ManagerActor::new(config, store, work_mode, sender.downgrade());
        let _task = Arc::new(Mutex::new(tokio::spawn(actor.start(receiver))));
        Self { sender, _task }
    }

    /// Starts gathering for a freshly connected device. Its first round runs right away and
    /// periodic polling is armed once it succeeded. A device whose first round fails is dropped
    /// and its connection shut down.
    pub async fn device_connected(&self, device: DeviceContext) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::DeviceConnected {
                device,
                response: response_tx,
            })
            .await?;
        response_rx.await?
    }

    pub async fn device_disconnected(&self, datapath_id: DatapathId) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::DeviceDisconnected {
                datapath_id,
                response: response_tx,
            })
            .await?;
        response_rx.await?
    }

    pub async fn work_mode(&self) -> Result<WorkMode> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::GetWorkMode {
                response: response_tx,
            })
            .await?;
        Ok(response_rx.await?)
    }

    /// Completes once every managed device runs in `mode`.
    pub async fn change_work_mode(&self, mode: WorkMode) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::ChangeWorkMode {
                mode,
                response: response_tx,
            })
            .await?;
        response_rx.await?
    }

    pub async fn devices(&self) -> Result<Vec<ManagedDeviceInfo>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::GetDevices {
                response: response_tx,
            })
            .await?;
        Ok(response_rx.await?)
    }

    pub async fn device(&self, datapath_id: DatapathId) -> Result<Option<ManagedDeviceInfo>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::GetDevice {
                datapath_id,
                response: response_tx,
            })
            .await?;
        Ok(response_rx.await?)
    }

    /// Stops every device. Later connects are refused.
    pub async fn close(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::Close {
                response: response_tx,
            })
            .await?;
        response_rx.await?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        device::ConnectionState,
        lifecycle::ItemLifecycleSource,
        protocol::MultipartType,
        store::InMemoryStore,
        transport::{Transport, fake::FakeSwitch},
    };

    fn short_config() -> StatisticsConfig {
        StatisticsConfig {
            min_poll_delay: Duration::from_secs(1),
            max_poll_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    struct Device {
        switch: Arc<FakeSwitch>,
        source: Arc<ItemLifecycleSource>,
    }

    async fn connect(manager: &StatisticsManager, datapath_id: u64) -> Device {
        connect_switch(manager, FakeSwitch::builder(DatapathId(datapath_id)).build()).await
    }

    async fn connect_switch(manager: &StatisticsManager, switch: FakeSwitch) -> Device {
        let switch = Arc::new(switch);
        let source = Arc::new(ItemLifecycleSource::default());
        manager
            .device_connected(
                DeviceContext::new(switch.info(), switch.clone())
                    .with_lifecycle_source(source.clone()),
            )
            .await
            .unwrap();
        Device { switch, source }
    }

    #[test]
    fn work_mode_names() {
        assert_eq!(WorkMode::CollectAll.to_string(), "COLLECTALL");
        assert_eq!("FULLYDISABLED".parse::<WorkMode>(), Ok(WorkMode::FullyDisabled));
        assert_eq!(
            serde_json::to_string(&WorkMode::FullyDisabled).unwrap(),
            "\"FULLYDISABLED\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mode_changes_swap_polling_for_listeners() {
        let manager = StatisticsManager::new(
            short_config(),
            Arc::new(InMemoryStore::new()),
            WorkMode::CollectAll,
        );
        let devices = vec![connect(&manager, 1).await, connect(&manager, 2).await];
        assert!(manager.device_connected(DeviceContext::new(
            devices[0].switch.info(),
            devices[0].switch.clone()
        ))
        .await
        .is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        for info in manager.devices().await.unwrap() {
            assert_eq!(info.scheduler_state, Some(SchedulerState::Running));
            assert!(info.rounds >= 1);
            assert!(!info.listener_registered);
        }

        manager
            .change_work_mode(WorkMode::FullyDisabled)
            .await
            .unwrap();
        manager
            .change_work_mode(WorkMode::FullyDisabled)
            .await
            .unwrap();
        assert_eq!(manager.work_mode().await.unwrap(), WorkMode::FullyDisabled);

        let seen: Vec<usize> = devices
            .iter()
            .map(|device| device.switch.requests_seen().len())
            .collect();
        tokio::time::sleep(Duration::from_secs(30)).await;
        for (device, seen) in devices.iter().zip(seen) {
            assert!(device.source.has_listener());
            assert_eq!(device.switch.requests_seen().len(), seen);
        }
        for info in manager.devices().await.unwrap() {
            assert_eq!(info.scheduler_state, None);
            assert!(info.listener_registered);
        }

        manager.change_work_mode(WorkMode::CollectAll).await.unwrap();
        for device in &devices {
            assert!(!device.source.has_listener());
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        for info in manager.devices().await.unwrap() {
            assert_eq!(info.scheduler_state, Some(SchedulerState::Running));
            assert!(info.rounds >= 1);
        }

        manager.close().await.unwrap();
        assert!(manager.devices().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fully_disabled_device_gathers_once_then_listens() {
        let store = InMemoryStore::new();
        let manager = StatisticsManager::new(
            short_config(),
            Arc::new(store.clone()),
            WorkMode::FullyDisabled,
        );
        let device = connect(&manager, 3).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        let info = manager.device(DatapathId(3)).await.unwrap().unwrap();
        assert!(info.listener_registered);
        assert_eq!(info.scheduler_state, None);
        assert!(info.last_round.is_some_and(|round| round.initial && round.success));
        let requests = device.switch.requests_seen().len();
        assert_eq!(requests, info.collecting.len());

        manager
            .device_disconnected(DatapathId(3))
            .await
            .unwrap();
        assert!(!device.source.has_listener());
        assert!(manager.device_disconnected(DatapathId(3)).await.is_err());
        assert!(manager.device(DatapathId(3)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_polling_waits_for_a_slow_first_round() {
        let manager = StatisticsManager::new(
            StatisticsConfig {
                request_timeout: Duration::from_secs(10),
                ..short_config()
            },
            Arc::new(InMemoryStore::new()),
            WorkMode::FullyDisabled,
        );
        let device = connect_switch(
            &manager,
            FakeSwitch::builder(DatapathId(4))
                .reply_delay(Duration::from_secs(5))
                .build(),
        )
        .await;
        manager.change_work_mode(WorkMode::CollectAll).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let info = manager.device(DatapathId(4)).await.unwrap().unwrap();
        assert!(!info.synchronized);
        assert_eq!(info.scheduler_state, None);
        assert!(device.switch.requests_seen().len() <= info.collecting.len());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let info = manager.device(DatapathId(4)).await.unwrap().unwrap();
        assert!(info.synchronized);
        assert_eq!(info.scheduler_state, Some(SchedulerState::Running));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let info = manager.device(DatapathId(4)).await.unwrap().unwrap();
        assert!(info.rounds >= 1);
        assert!(info.last_round.is_some_and(|round| !round.initial && round.success));

        manager.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fully_disabled_registers_listener_without_polling() {
        let manager = StatisticsManager::new(
            StatisticsConfig {
                polling_enabled: false,
                ..short_config()
            },
            Arc::new(InMemoryStore::new()),
            WorkMode::FullyDisabled,
        );
        let device = connect(&manager, 5).await;
        assert!(device.source.has_listener());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let info = manager.device(DatapathId(5)).await.unwrap().unwrap();
        assert!(info.listener_registered);
        assert!(info.synchronized);
        assert_eq!(info.scheduler_state, None);

        manager.change_work_mode(WorkMode::CollectAll).await.unwrap();
        assert!(!device.source.has_listener());
        let info = manager.device(DatapathId(5)).await.unwrap().unwrap();
        assert_eq!(info.scheduler_state, None);

        manager
            .change_work_mode(WorkMode::FullyDisabled)
            .await
            .unwrap();
        assert!(device.source.has_listener());
        assert!(device.switch.requests_seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_round_drops_the_device() {
        let manager = StatisticsManager::new(
            short_config(),
            Arc::new(InMemoryStore::new()),
            WorkMode::CollectAll,
        );
        let broken = connect_switch(
            &manager,
            FakeSwitch::builder(DatapathId(6))
                .failing(MultipartType::Flow)
                .build(),
        )
        .await;
        let healthy = connect(&manager, 7).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(manager.device(DatapathId(6)).await.unwrap().is_none());
        assert_eq!(broken.switch.connection_state(), ConnectionState::Rip);
        let requests = broken.switch.requests_seen().len();

        let info = manager.device(DatapathId(7)).await.unwrap().unwrap();
        assert!(info.synchronized);
        assert_eq!(info.scheduler_state, Some(SchedulerState::Running));
        assert_eq!(healthy.switch.connection_state(), ConnectionState::Working);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broken.switch.requests_seen().len(), requests);
    }
}
