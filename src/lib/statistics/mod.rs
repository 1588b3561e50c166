pub mod context;
mod gathering;
pub mod listener;
pub mod manager;
pub mod request;
pub mod scheduler;
pub mod snapshot;
pub mod time_counter;
pub mod translator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use context::{CategoryFailure, RoundReport, StatisticsContext};
pub use manager::{ManagedDeviceInfo, StatisticsManager, WorkMode};
pub use scheduler::{AdaptivePollScheduler, SchedulerState};
pub use snapshot::{SnapshotBody, StatisticsCategory, StatisticsSnapshot};
pub use time_counter::TimeCounter;
pub use translator::MultipartReplyTranslator;

pub const DEFAULT_MIN_POLL_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_MAX_POLL_DELAY: Duration = Duration::from_millis(900_000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub min_poll_delay: Duration,
    pub max_poll_delay: Duration,
    pub request_timeout: Duration,
    /// Watchdog for a round while no average round time is known yet.
    pub default_round_timeout: Duration,
    pub polling_enabled: bool,
    pub disabled_categories: Vec<StatisticsCategory>,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            min_poll_delay: DEFAULT_MIN_POLL_DELAY,
            max_poll_delay: DEFAULT_MAX_POLL_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_round_timeout: DEFAULT_ROUND_TIMEOUT,
            polling_enabled: true,
            disabled_categories: Vec::new(),
        }
    }
}
