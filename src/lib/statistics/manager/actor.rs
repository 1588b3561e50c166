use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::*;

use crate::{
    device::{DatapathId, DeviceContext},
    statistics::{
        AdaptivePollScheduler, MultipartReplyTranslator, StatisticsConfig, StatisticsContext,
        manager::{ManagedDeviceInfo, WorkMode, protocol::ManagerCommand},
    },
    store::StatisticsStore,
};

struct ManagedDevice {
    context: Arc<StatisticsContext>,
    session: u64,
    scheduler: Option<AdaptivePollScheduler>,
    /// First round after connect. Periodic polling is armed only once it succeeded.
    initial_round: Option<JoinHandle<()>>,
    synchronized: bool,
}

impl ManagedDevice {
    fn info(&self) -> ManagedDeviceInfo {
        let device = self.context.device();
        let listener_registered = device
            .lifecycle_source
            .as_ref()
            .is_some_and(|source| source.has_listener());

        ManagedDeviceInfo {
            datapath_id: self.context.datapath_id(),
            version: device.info.version,
            collecting: self.context.collecting().to_vec(),
            scheduler_state: self.scheduler.as_ref().map(|scheduler| scheduler.state()),
            poll_delay_ms: self
                .scheduler
                .as_ref()
                .map(|scheduler| scheduler.current_delay().as_millis() as u64),
            rounds: self
                .scheduler
                .as_ref()
                .map(|scheduler| scheduler.rounds())
                .unwrap_or_default(),
            listener_registered,
            synchronized: self.synchronized,
            last_round: self.context.last_round(),
        }
    }

    /// Hands add/remove events of this device to the store while polling is off.
    fn register_listener(&self) {
        if let Some(source) = &self.context.device().lifecycle_source {
            source.set_listener(Some(self.context.item_lifecycle_listener()));
        }
    }

    fn unregister_listener(&self) {
        if let Some(source) = &self.context.device().lifecycle_source {
            source.set_listener(None);
        }
    }

    async fn stop_polling(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.close().await;
        }
    }

    /// Arms periodic polling unless it already runs or the first round is still pending.
    fn start_polling(&mut self, config: &StatisticsConfig) -> Result<()> {
        if !config.polling_enabled {
            debug!(
                "Statistics polling disabled, not scheduling {}",
                self.context.datapath_id()
            );
            return Ok(());
        }
        if self.scheduler.is_some() || !self.synchronized {
            return Ok(());
        }

        let scheduler = AdaptivePollScheduler::new(self.context.clone());
        scheduler.start_up(false).with_context(|| {
            format!("Failed starting polling of {}", self.context.datapath_id())
        })?;
        self.scheduler = Some(scheduler);
        Ok(())
    }
}

pub struct ManagerActor {
    config: StatisticsConfig,
    store: Arc<dyn StatisticsStore>,
    translator: MultipartReplyTranslator,
    work_mode: WorkMode,
    devices: IndexMap<DatapathId, ManagedDevice>,
    next_session: u64,
    closed: bool,
    commands: mpsc::WeakSender<ManagerCommand>,
}

impl ManagerActor {
    pub async fn start(mut self, mut receiver: mpsc::Receiver<ManagerCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                ManagerCommand::DeviceConnected { device, response } => {
                    let result = self.device_connected(device).await;
                    let _ = response.send(result);
                }
                ManagerCommand::DeviceDisconnected {
                    datapath_id,
                    response,
                } => {
                    let result = self.device_disconnected(datapath_id).await;
                    let _ = response.send(result);
                }
                ManagerCommand::GetWorkMode { response } => {
                    let _ = response.send(self.work_mode);
                }
                ManagerCommand::ChangeWorkMode { mode, response } => {
                    let result = self.change_work_mode(mode).await;
                    let _ = response.send(result);
                }
                ManagerCommand::GetDevices { response } => {
                    let devices = self.devices.values().map(ManagedDevice::info).collect();
                    let _ = response.send(devices);
                }
                ManagerCommand::GetDevice {
                    datapath_id,
                    response,
                } => {
                    let device = self.devices.get(&datapath_id).map(ManagedDevice::info);
                    let _ = response.send(device);
                }
                ManagerCommand::Close { response } => {
                    let result = self.close().await;
                    let _ = response.send(result);
                }
                ManagerCommand::InitialRoundFinished {
                    datapath_id,
                    session,
                    succeeded,
                } => {
                    if let Err(error) = self
                        .initial_round_finished(datapath_id, session, succeeded)
                        .await
                    {
                        error!("Failed handling first round of {datapath_id}: {error:?}");
                    }
                }
            }
        }

        if let Err(error) = self.close().await {
            error!("Failed closing statistics manager: {error:?}");
        }
    }

    #[instrument(level = "debug", skip(config, store, commands))]
    pub fn new(
        config: StatisticsConfig,
        store: Arc<dyn StatisticsStore>,
        work_mode: WorkMode,
        commands: mpsc::WeakSender<ManagerCommand>,
    ) -> Self {
        Self {
            config,
            store,
            translator: MultipartReplyTranslator::default(),
            work_mode,
            devices: IndexMap::new(),
            next_session: 0,
            closed: false,
            commands,
        }
    }

    #[instrument(level = "debug", skip(self, device), fields(dpid = %device.datapath_id()))]
    async fn device_connected(&mut self, device: DeviceContext) -> Result<()> {
        if self.closed {
            return Err(anyhow!("Statistics manager is closed"));
        }

        let datapath_id = device.datapath_id();
        if self.devices.contains_key(&datapath_id) {
            return Err(anyhow!(
                "Failed registering device: {datapath_id} is already managed"
            ));
        }

        let context = StatisticsContext::new(
            device,
            self.config.clone(),
            self.store.clone(),
            self.translator.clone(),
        );

        self.next_session += 1;
        let session = self.next_session;

        let mut managed = ManagedDevice {
            context: context.clone(),
            session,
            scheduler: None,
            initial_round: None,
            synchronized: false,
        };

        if self.work_mode == WorkMode::FullyDisabled {
            context.set_collecting_enabled(false);
            managed.register_listener();
        }
        managed.initial_round = Some(self.spawn_initial_round(context, session));

        self.devices.insert(datapath_id, managed);
        info!("Managing statistics of {datapath_id} ({})", self.work_mode);

        Ok(())
    }

    /// Runs the first round of a device and reports its outcome back to the actor.
    fn spawn_initial_round(
        &self,
        context: Arc<StatisticsContext>,
        session: u64,
    ) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let round_timeout = self.config.default_round_timeout;

        tokio::spawn(async move {
            let datapath_id = context.datapath_id();
            let succeeded =
                match tokio::time::timeout(round_timeout, context.gather_dynamic_data(true)).await {
                    Ok(report) => report.success,
                    Err(_) => {
                        warn!("First round of {datapath_id} abandoned after {round_timeout:?}");
                        false
                    }
                };

            if let Some(commands) = commands.upgrade() {
                let _ = commands
                    .send(ManagerCommand::InitialRoundFinished {
                        datapath_id,
                        session,
                        succeeded,
                    })
                    .await;
            }
        })
    }

    /// Arms polling after a successful first round. A device that fails it is dropped and its
    /// connection shut down.
    #[instrument(level = "debug", skip(self))]
    async fn initial_round_finished(
        &mut self,
        datapath_id: DatapathId,
        session: u64,
        succeeded: bool,
    ) -> Result<()> {
        let Some(managed) = self
            .devices
            .get_mut(&datapath_id)
            .filter(|managed| managed.session == session)
        else {
            trace!("First round of a previous session of {datapath_id}, ignoring");
            return Ok(());
        };
        managed.initial_round = None;

        if !succeeded {
            warn!("First statistics round of {datapath_id} failed, shutting down its connection");
            managed.context.device().transport.shutdown_connection();
            return self.device_disconnected(datapath_id).await;
        }

        managed.synchronized = true;
        debug!("{datapath_id} synchronized");
        if self.work_mode == WorkMode::CollectAll {
            managed.start_polling(&self.config)?;
        }

        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn device_disconnected(&mut self, datapath_id: DatapathId) -> Result<()> {
        let mut managed = self
            .devices
            .swap_remove(&datapath_id)
            .ok_or_else(|| anyhow!("Device {datapath_id} is not managed"))?;

        managed.stop_polling().await;
        managed.context.close();
        if let Some(initial_round) = managed.initial_round.take() {
            initial_round.abort();
        }

        info!("Stopped statistics of {datapath_id}");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn change_work_mode(&mut self, mode: WorkMode) -> Result<()> {
        if mode == self.work_mode {
            debug!("Already in {mode}");
            return Ok(());
        }

        match mode {
            WorkMode::FullyDisabled => {
                for managed in self.devices.values_mut() {
                    managed.stop_polling().await;
                    managed.context.set_collecting_enabled(false);
                    managed.register_listener();
                }
            }
            WorkMode::CollectAll => {
                for managed in self.devices.values_mut() {
                    managed.unregister_listener();
                    managed.context.set_collecting_enabled(true);
                    managed.start_polling(&self.config)?;
                }
            }
        }

        info!("Statistics work mode changed from {} to {mode}", self.work_mode);
        self.work_mode = mode;

        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn close(&mut self) -> Result<()> {
        self.closed = true;

        let datapath_ids: Vec<DatapathId> = self.devices.keys().copied().collect();
        for datapath_id in datapath_ids {
            self.device_disconnected(datapath_id).await?;
        }

        Ok(())
    }
}
