use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Result, bail};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::statistics::{StatisticsContext, TimeCounter};

/// Rounds are abandoned after this many average round times.
const ROUND_TIMEOUT_FACTOR: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug)]
struct SchedulerStatus {
    state: SchedulerState,
    current_delay: Duration,
    rounds: u64,
    last_round_succeeded: Option<bool>,
}

/// Drives the gathering rounds of one device, pacing them by how long the rounds take.
#[derive(Debug)]
pub struct AdaptivePollScheduler {
    context: Arc<StatisticsContext>,
    min_delay: Duration,
    max_delay: Duration,
    default_round_timeout: Duration,
    status: Arc<Mutex<SchedulerStatus>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptivePollScheduler {
    pub fn new(context: Arc<StatisticsContext>) -> Self {
        let config = &context.config;
        let min_delay = config.min_poll_delay;
        let max_delay = config.max_poll_delay;
        let default_round_timeout = config.default_round_timeout;
        debug_assert!(min_delay <= max_delay, "poll delay bounds are inverted");

        Self {
            context,
            min_delay,
            max_delay,
            default_round_timeout,
            status: Arc::new(Mutex::new(SchedulerStatus {
                state: SchedulerState::Idle,
                current_delay: min_delay,
                rounds: 0,
                last_round_succeeded: None,
            })),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Arms the polling loop. With `immediate_first_round` the first round starts right away and
    /// runs as the initial round of the device.
    #[instrument(level = "debug", skip(self), fields(dpid = %self.context.datapath_id()))]
    pub fn start_up(&self, immediate_first_round: bool) -> Result<()> {
        {
            let mut status = lock(&self.status);
            if status.state != SchedulerState::Idle {
                bail!("Scheduler already {:?}", status.state);
            }
            status.state = SchedulerState::Running;
        }

        let task = tokio::spawn(Self::run(
            self.context.clone(),
            self.status.clone(),
            self.shutdown.clone(),
            PollBounds {
                min_delay: self.min_delay,
                max_delay: self.max_delay,
                default_round_timeout: self.default_round_timeout,
            },
            immediate_first_round,
        ));
        *lock(&self.task) = Some(task);

        Ok(())
    }

    async fn run(
        context: Arc<StatisticsContext>,
        status: Arc<Mutex<SchedulerStatus>>,
        shutdown: CancellationToken,
        bounds: PollBounds,
        immediate_first_round: bool,
    ) {
        let datapath_id = context.datapath_id();
        let mut time_counter = TimeCounter::new();
        let mut initial = immediate_first_round;
        let mut delay = if immediate_first_round {
            Duration::ZERO
        } else {
            bounds.min_delay
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let average_ms = time_counter.average_time_between_marks();
            let watchdog = round_timeout(average_ms, bounds.default_round_timeout);

            time_counter.mark_start();
            let round = tokio::time::timeout(watchdog, context.gather_dynamic_data(initial));
            let succeeded = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = round => match result {
                    Ok(report) => report.success,
                    Err(_) => {
                        warn!("Round of {datapath_id} abandoned after {watchdog:?}");
                        false
                    }
                },
            };
            time_counter.add_time_mark();
            initial = false;

            if !succeeded {
                warn!("Statistics round of {datapath_id} failed");
            }

            delay = next_delay(
                time_counter.average_time_between_marks(),
                bounds.min_delay,
                bounds.max_delay,
            );
            debug!("Next round of {datapath_id} in {delay:?}");

            let mut current = lock(&status);
            current.current_delay = delay;
            current.rounds += 1;
            current.last_round_succeeded = Some(succeeded);
        }

        trace!("Polling of {datapath_id} stopped");
    }

    /// Cancels the pending round and waits for the loop to finish. Idempotent.
    #[instrument(level = "debug", skip(self), fields(dpid = %self.context.datapath_id()))]
    pub async fn close(&self) {
        lock(&self.status).state = SchedulerState::Stopped;
        self.shutdown.cancel();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                error!("Polling task of {} ended abnormally: {error}", self.context.datapath_id());
            }
        }
    }

    pub fn state(&self) -> SchedulerState {
        lock(&self.status).state
    }

    pub fn current_delay(&self) -> Duration {
        lock(&self.status).current_delay
    }

    pub fn rounds(&self) -> u64 {
        lock(&self.status).rounds
    }

    pub fn last_round_succeeded(&self) -> Option<bool> {
        lock(&self.status).last_round_succeeded
    }

    pub fn context(&self) -> &Arc<StatisticsContext> {
        &self.context
    }
}

impl Drop for AdaptivePollScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
struct PollBounds {
    min_delay: Duration,
    max_delay: Duration,
    default_round_timeout: Duration,
}

/// Delay before the next round: the average round time clamped to `[min, max]`.
pub fn next_delay(average_ms: u64, min: Duration, max: Duration) -> Duration {
    debug_assert!(min <= max, "poll delay bounds are inverted");
    Duration::from_millis(average_ms).max(min).min(max)
}

fn round_timeout(average_ms: u64, default: Duration) -> Duration {
    if average_ms == 0 {
        return default;
    }
    Duration::from_millis(average_ms.saturating_mul(ROUND_TIMEOUT_FACTOR))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DatapathId, DeviceContext},
        protocol::MultipartType,
        statistics::{MultipartReplyTranslator, StatisticsConfig},
        store::InMemoryStore,
        transport::fake::FakeSwitch,
    };

    fn scheduler_for(switch: &Arc<FakeSwitch>, config: StatisticsConfig) -> AdaptivePollScheduler {
        let context = StatisticsContext::new(
            DeviceContext::new(switch.info(), switch.clone()),
            config,
            Arc::new(InMemoryStore::new()),
            MultipartReplyTranslator::default(),
        );
        AdaptivePollScheduler::new(context)
    }

    fn config() -> StatisticsConfig {
        StatisticsConfig {
            min_poll_delay: Duration::from_secs(1),
            max_poll_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    async fn wait_for_rounds(scheduler: &AdaptivePollScheduler, rounds: u64) {
        while scheduler.rounds() < rounds {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[test]
    fn delay_is_clamped_average() {
        let min = Duration::from_millis(3000);
        let max = Duration::from_millis(900_000);
        assert_eq!(next_delay(0, min, max), min);
        assert_eq!(next_delay(2999, min, max), min);
        assert_eq!(next_delay(4500, min, max), Duration::from_millis(4500));
        assert_eq!(next_delay(u64::MAX, min, max), max);

        assert_eq!(round_timeout(0, Duration::from_secs(50)), Duration::from_secs(50));
        assert_eq!(round_timeout(400, Duration::from_secs(50)), Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_switch_is_polled_less_often() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(1))
                .reply_delay(Duration::from_secs(2))
                .build(),
        );
        let scheduler = scheduler_for(&switch, config());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start_up(true).unwrap();
        assert!(scheduler.start_up(true).is_err());
        assert_eq!(scheduler.state(), SchedulerState::Running);

        wait_for_rounds(&scheduler, 2).await;
        assert_eq!(scheduler.current_delay(), Duration::from_secs(2));
        assert_eq!(scheduler.last_round_succeeded(), Some(true));

        switch.set_reply_delay(Duration::ZERO);
        wait_for_rounds(&scheduler, 4).await;
        assert_eq!(scheduler.current_delay(), Duration::from_secs(1));

        scheduler.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_category_still_arms_the_next_round() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(2))
                .failing(MultipartType::Flow)
                .build(),
        );
        let scheduler = scheduler_for(&switch, config());
        scheduler.start_up(true).unwrap();

        wait_for_rounds(&scheduler, 3).await;
        assert_eq!(scheduler.last_round_succeeded(), Some(false));
        let flow_requests = switch
            .requests_seen()
            .into_iter()
            .filter(|multipart_type| *multipart_type == MultipartType::Flow)
            .count();
        assert!(flow_requests >= 3);

        scheduler.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_round_is_abandoned_by_the_watchdog() {
        let switch = Arc::new(
            FakeSwitch::builder(DatapathId(3))
                .silent(MultipartType::Table)
                .build(),
        );
        let scheduler = scheduler_for(
            &switch,
            StatisticsConfig {
                request_timeout: Duration::from_secs(3600),
                default_round_timeout: Duration::from_secs(5),
                ..config()
            },
        );
        let started = tokio::time::Instant::now();
        scheduler.start_up(true).unwrap();

        wait_for_rounds(&scheduler, 1).await;
        assert_eq!(scheduler.last_round_succeeded(), Some(false));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(scheduler.context().outstanding_requests(), 0);

        scheduler.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_the_pending_round() {
        let switch = Arc::new(FakeSwitch::builder(DatapathId(4)).build());
        let scheduler = scheduler_for(&switch, config());

        scheduler.start_up(false).unwrap();
        scheduler.close().await;
        scheduler.close().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(switch.requests_seen().is_empty());
        assert_eq!(scheduler.rounds(), 0);
        assert!(scheduler.start_up(true).is_err());
    }
}
