use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    device::{Capabilities, ConnectionState, DatapathId, DeviceContext},
    error::{GatherError, RequestError},
    lifecycle::ItemLifecycleListener,
    protocol::MultipartReply,
    registry::DeviceRegistry,
    statistics::{
        StatisticsCategory, StatisticsConfig,
        listener::store_item_lifecycle_listener,
        request::{MultipartCollector, RequestCorrelator},
        translator::MultipartReplyTranslator,
    },
    store::{GatheringStatus, GatheringStatusEnd, ItemKey, StatisticsStore},
    transport::InboundMessage,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryFailure {
    pub category: StatisticsCategory,
    pub reason: String,
}

/// Outcome of one gathering round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub datapath_id: DatapathId,
    pub initial: bool,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub success: bool,
    pub gathered: Vec<StatisticsCategory>,
    pub failed: Vec<CategoryFailure>,
}

/// Statistics gathering for one connected device.
pub struct StatisticsContext {
    pub(super) device: DeviceContext,
    pub(super) config: StatisticsConfig,
    pub(super) correlator: RequestCorrelator<Vec<MultipartReply>>,
    pub(super) translator: MultipartReplyTranslator,
    pub(super) store: Arc<dyn StatisticsStore>,
    pub(super) registry: Arc<DeviceRegistry>,
    pub(super) last_observed: Mutex<HashMap<StatisticsCategory, HashSet<ItemKey>>>,
    collecting: Vec<StatisticsCategory>,
    collecting_enabled: AtomicBool,
    listener: ItemLifecycleListener,
    last_round: Mutex<Option<RoundReport>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StatisticsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsContext")
            .field("device", &self.device)
            .field("collecting", &self.collecting)
            .field("closed", &self.closed)
            .finish()
    }
}

impl StatisticsContext {
    /// Must be called from within a tokio runtime: replies are dispatched by a spawned task.
    #[instrument(level = "debug", skip_all, fields(dpid = %device.datapath_id()))]
    pub fn new(
        device: DeviceContext,
        config: StatisticsConfig,
        store: Arc<dyn StatisticsStore>,
        translator: MultipartReplyTranslator,
    ) -> Arc<Self> {
        let correlator = RequestCorrelator::default();
        let registry = Arc::new(DeviceRegistry::default());
        let shutdown = CancellationToken::new();

        let dispatcher = tokio::spawn(Self::dispatch_replies(
            device.datapath_id(),
            device.transport.subscribe(),
            correlator.clone(),
            shutdown.clone(),
        ));

        let listener =
            store_item_lifecycle_listener(device.datapath_id(), store.clone(), registry.clone());
        let collecting = collecting_categories(&device, &config);
        debug!("Collecting {collecting:?}");

        Arc::new(Self {
            device,
            config,
            correlator,
            translator,
            store,
            registry,
            last_observed: Mutex::new(HashMap::new()),
            collecting,
            collecting_enabled: AtomicBool::new(true),
            listener,
            last_round: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    async fn dispatch_replies(
        datapath_id: DatapathId,
        mut receiver: broadcast::Receiver<Arc<InboundMessage>>,
        correlator: RequestCorrelator<Vec<MultipartReply>>,
        shutdown: CancellationToken,
    ) {
        let mut collector = MultipartCollector::default();

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = receiver.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Transport of {datapath_id} closed its channel");
                    correlator.close();
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Reply channel of {datapath_id} lagged by {count} messages");
                    continue;
                }
            };

            match message.as_ref() {
                InboundMessage::MultipartReply(reply) => {
                    if !correlator.is_pending(reply.xid) {
                        trace!("Dropping reply part of {}, nobody waits for it", reply.xid);
                        collector.discard(reply.xid);
                        continue;
                    }
                    if let Some((xid, parts)) = collector.push(reply.clone()) {
                        trace!("Reply {xid} complete with {} parts", parts.len());
                        let _ = correlator.complete(xid, Ok(parts));
                        let dropped = collector.retain_pending(&correlator);
                        if dropped > 0 {
                            debug!("Dropped partial replies of {dropped} abandoned requests");
                        }
                    }
                }
                InboundMessage::Error {
                    xid,
                    error_type,
                    code,
                } => {
                    collector.discard(*xid);
                    let _ = correlator.complete(
                        *xid,
                        Err(RequestError::Switch {
                            error_type: *error_type,
                            code: *code,
                        }),
                    );
                }
                InboundMessage::Disconnected => {
                    debug!("{datapath_id} disconnected, failing outstanding requests");
                    collector.clear();
                    correlator.close();
                    break;
                }
            }
        }
    }

    pub fn datapath_id(&self) -> DatapathId {
        self.device.datapath_id()
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn collecting(&self) -> &[StatisticsCategory] {
        &self.collecting
    }

    pub fn item_lifecycle_listener(&self) -> ItemLifecycleListener {
        self.listener.clone()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Periodic rounds are no-ops while disabled. Initial rounds always run.
    pub fn set_collecting_enabled(&self, enabled: bool) {
        self.collecting_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn last_round(&self) -> Option<RoundReport> {
        lock(&self.last_round).clone()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.correlator.outstanding()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Runs one round over every collected category and joins them.
    #[instrument(level = "debug", skip(self), fields(dpid = %self.datapath_id()))]
    pub async fn gather_dynamic_data(&self, initial: bool) -> RoundReport {
        let started = Utc::now();
        let mut report = RoundReport {
            datapath_id: self.datapath_id(),
            initial,
            started,
            finished: started,
            success: true,
            gathered: Vec::new(),
            failed: Vec::new(),
        };

        if self.is_closed() {
            debug!("Context closed, not gathering");
            report.success = false;
            return report;
        }

        if !self.config.polling_enabled {
            debug!("Statistics polling is disabled");
            return report;
        }

        if !initial && !self.collecting_enabled.load(Ordering::SeqCst) {
            debug!("Statistics collecting is disabled by work mode");
            return report;
        }

        match self.device.transport.connection_state() {
            ConnectionState::Rip => {
                warn!("Device connection is gone, round fails");
                report.success = false;
                report.failed = self
                    .collecting
                    .iter()
                    .map(|&category| CategoryFailure {
                        category,
                        reason: GatherError::DeviceGone.to_string(),
                    })
                    .collect();
                self.record(&report);
                return report;
            }
            ConnectionState::Handshaking => {
                debug!("Device still handshaking, nothing to gather yet");
                return report;
            }
            ConnectionState::Working => {}
        }

        self.mark_gathering_start(started).await;

        let results = futures::future::join_all(
            self.collecting
                .iter()
                .map(|&category| async move { (category, self.gather_category(category, initial).await) }),
        )
        .await;

        for (category, result) in results {
            match result {
                Ok(entries) => {
                    trace!("{category}: {entries} entries");
                    report.gathered.push(category);
                }
                Err(error) => {
                    debug!("{category} failed: {error}");
                    report.failed.push(CategoryFailure {
                        category,
                        reason: error.to_string(),
                    });
                }
            }
        }

        report.success = report.failed.is_empty();
        report.finished = Utc::now();
        self.mark_gathering_end(started, report.finished, report.success)
            .await;
        self.record(&report);

        report
    }

    fn record(&self, report: &RoundReport) {
        *lock(&self.last_round) = Some(report.clone());
    }

    async fn mark_gathering_start(&self, begin: DateTime<Utc>) {
        let status = GatheringStatus { begin, end: None };
        if let Err(error) = self
            .store
            .write_gathering_status(self.datapath_id(), status)
            .await
        {
            warn!("Failed writing gathering start: {error}");
        }
    }

    async fn mark_gathering_end(&self, begin: DateTime<Utc>, end: DateTime<Utc>, succeeded: bool) {
        let status = GatheringStatus {
            begin,
            end: Some(GatheringStatusEnd { end, succeeded }),
        };
        if let Err(error) = self
            .store
            .write_gathering_status(self.datapath_id(), status)
            .await
        {
            warn!("Failed writing gathering end: {error}");
        }
    }

    /// Stops reply dispatching and fails every outstanding request. Idempotent.
    #[instrument(level = "debug", skip(self), fields(dpid = %self.datapath_id()))]
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            trace!("Already closed");
            return;
        }

        self.shutdown.cancel();
        let failed = self.correlator.close();
        if let Some(source) = &self.device.lifecycle_source {
            source.set_listener(None);
        }
        lock(&self.dispatcher).take();

        info!("Statistics context closed, {failed} outstanding requests failed");
    }
}

impl Drop for StatisticsContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Categories to request each round, in request order.
pub fn collecting_categories(
    device: &DeviceContext,
    config: &StatisticsConfig,
) -> Vec<StatisticsCategory> {
    let info = &device.info;
    let capabilities = info.capabilities;
    let mut categories = Vec::new();

    if capabilities.contains(Capabilities::TABLE_STATS) {
        categories.push(StatisticsCategory::Table);
    }
    if capabilities.contains(Capabilities::FLOW_STATS) {
        categories.push(StatisticsCategory::Flow);
        categories.push(StatisticsCategory::Aggregate);
    }
    if info.groups_available() {
        categories.extend([
            StatisticsCategory::GroupDesc,
            StatisticsCategory::Group,
            StatisticsCategory::GroupFeatures,
        ]);
    }
    if info.meters_available() {
        categories.extend([
            StatisticsCategory::MeterConfig,
            StatisticsCategory::Meter,
            StatisticsCategory::MeterFeatures,
        ]);
    }
    if capabilities.contains(Capabilities::PORT_STATS) {
        categories.push(StatisticsCategory::Port);
    }
    if capabilities.contains(Capabilities::QUEUE_STATS) {
        categories.push(StatisticsCategory::Queue);
    }

    categories.retain(|category| !config.disabled_categories.contains(category));
    categories
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        device::DatapathId,
        protocol::{MultipartType, OfVersion},
        store::InMemoryStore,
        transport::fake::{FakeFlow, FakeSwitch},
    };

    fn context_for(
        switch: &Arc<FakeSwitch>,
        store: &InMemoryStore,
        config: StatisticsConfig,
    ) -> Arc<StatisticsContext> {
        let device = DeviceContext::new(switch.info(), switch.clone());
        StatisticsContext::new(
            device,
            config,
            Arc::new(store.clone()),
            MultipartReplyTranslator::default(),
        )
    }

    fn config() -> StatisticsConfig {
        StatisticsConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn categories_follow_capabilities() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(1))
                .version(OfVersion::V10)
                .capabilities(Capabilities::FLOW_STATS | Capabilities::PORT_STATS)
                .build(),
        );
        let context = context_for(&switch, &InMemoryStore::new(), config());
        assert_eq!(
            context.collecting(),
            &[
                StatisticsCategory::Flow,
                StatisticsCategory::Aggregate,
                StatisticsCategory::Port
            ]
        );

        let switch = Arc::new(FakeSwitch::builder(DatapathId(2)).build());
        let context = context_for(
            &switch,
            &InMemoryStore::new(),
            StatisticsConfig {
                disabled_categories: vec![StatisticsCategory::Queue, StatisticsCategory::Aggregate],
                ..config()
            },
        );
        assert_eq!(
            context.collecting(),
            &[
                StatisticsCategory::Table,
                StatisticsCategory::Flow,
                StatisticsCategory::GroupDesc,
                StatisticsCategory::Group,
                StatisticsCategory::GroupFeatures,
                StatisticsCategory::MeterConfig,
                StatisticsCategory::Meter,
                StatisticsCategory::MeterFeatures,
                StatisticsCategory::Port,
            ]
        );
    }

    #[tokio::test]
    async fn round_writes_every_category() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(7))
                .flows(vec![FakeFlow::new(0, 1, 0), FakeFlow::new(1, 2, 0)])
                .groups(vec![1, 2])
                .meters(vec![5])
                .reply_parts(2)
                .build(),
        );
        let store = InMemoryStore::new();
        let context = context_for(&switch, &store, config());

        let report = context.gather_dynamic_data(true).await;
        assert!(report.success, "{report:?}");
        assert_eq!(report.gathered.len(), context.collecting().len());

        let device = store.device(DatapathId(7)).await.unwrap();
        assert!(device.contains(&ItemKey::Group(2)));
        assert!(device.contains(&ItemKey::MeterStatistics(5)));
        assert!(device.contains(&ItemKey::FlowTable(1)));
        assert!(device.contains(&ItemKey::NodeConnector("openflow:7:2".to_string())));
        assert_eq!(
            device.keys().filter(|key| matches!(key, ItemKey::Flow { .. })).count(),
            2
        );
        let status = device.gathering_status.unwrap();
        assert!(status.end.unwrap().succeeded);
        assert_eq!(device.writes[&StatisticsCategory::Flow].on_fly_writes, 1);
    }

    #[tokio::test]
    async fn failed_category_does_not_abort_siblings() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(3))
                .groups(vec![4])
                .failing(MultipartType::Flow)
                .build(),
        );
        let store = InMemoryStore::new();
        store.fail_writes(StatisticsCategory::Port, true);
        let context = context_for(&switch, &store, config());

        let report = context.gather_dynamic_data(false).await;
        assert!(!report.success);
        let failed: Vec<_> = report.failed.iter().map(|failure| failure.category).collect();
        assert_eq!(failed, vec![StatisticsCategory::Flow, StatisticsCategory::Port]);

        assert!(store.contains(DatapathId(3), &ItemKey::Group(4)).await);
        assert!(store.contains(DatapathId(3), &ItemKey::AggregateFlow).await);
        let status = store.device(DatapathId(3)).await.unwrap().gathering_status.unwrap();
        assert!(!status.end.unwrap().succeeded);
    }

    #[tokio::test]
    async fn stale_groups_are_removed_in_the_same_write() {
        let switch = Arc::new(FakeSwitch::builder(DatapathId(4)).groups(vec![1, 2]).build());
        let store = InMemoryStore::new();
        let context = context_for(&switch, &store, config());

        assert!(context.gather_dynamic_data(true).await.success);
        assert!(store.contains(DatapathId(4), &ItemKey::GroupStatistics(2)).await);

        switch.set_groups(vec![1, 3]);
        assert!(context.gather_dynamic_data(false).await.success);

        let device = store.device(DatapathId(4)).await.unwrap();
        assert!(device.contains(&ItemKey::Group(1)));
        assert!(device.contains(&ItemKey::Group(3)));
        assert!(!device.contains(&ItemKey::Group(2)));
        assert!(!device.contains(&ItemKey::GroupStatistics(2)));
        assert_eq!(context.registry().groups().all_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn rip_device_fails_and_handshaking_device_is_skipped() {
        let switch = Arc::new(FakeSwitch::builder(DatapathId(5)).build());
        let store = InMemoryStore::new();
        let context = context_for(&switch, &store, config());

        switch.set_connection_state(ConnectionState::Handshaking);
        let report = context.gather_dynamic_data(false).await;
        assert!(report.success);
        assert!(report.gathered.is_empty());

        switch.set_connection_state(ConnectionState::Rip);
        let report = context.gather_dynamic_data(false).await;
        assert!(!report.success);
        assert!(switch.requests_seen().is_empty());
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests_once() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(6))
                .silent(MultipartType::Flow)
                .silent(MultipartType::Table)
                .build(),
        );
        let store = InMemoryStore::new();
        let context = context_for(
            &switch,
            &store,
            StatisticsConfig {
                request_timeout: Duration::from_secs(3600),
                ..config()
            },
        );

        let round = tokio::spawn({
            let context = context.clone();
            async move { context.gather_dynamic_data(false).await }
        });

        while switch.requests_seen().len() < context.collecting().len()
            || context.outstanding_requests() > 2
        {
            tokio::task::yield_now().await;
        }
        assert_eq!(context.outstanding_requests(), 2);

        context.close();
        context.close();

        let report = round.await.unwrap();
        assert!(!report.success);
        let closed: Vec<_> = report
            .failed
            .iter()
            .filter(|failure| failure.reason == RequestError::Closed.to_string())
            .map(|failure| failure.category)
            .collect();
        assert_eq!(closed, vec![StatisticsCategory::Table, StatisticsCategory::Flow]);
        assert_eq!(context.outstanding_requests(), 0);

        let report = context.gather_dynamic_data(false).await;
        assert!(!report.success);
    }

    #[tokio::test]
    async fn disabled_collecting_skips_periodic_rounds_only() {
        let switch = Arc::new(FakeSwitch::builder(DatapathId(8)).build());
        let store = InMemoryStore::new();
        let context = context_for(&switch, &store, config());
        context.set_collecting_enabled(false);

        let report = context.gather_dynamic_data(false).await;
        assert!(report.success);
        assert!(switch.requests_seen().is_empty());

        assert!(context.gather_dynamic_data(true).await.success);
        assert!(!switch.requests_seen().is_empty());
    }
}
