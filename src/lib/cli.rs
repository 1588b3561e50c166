use std::time::Duration;

use clap::Parser;
use once_cell::sync::OnceCell;
use tracing::*;

use crate::statistics::{StatisticsCategory, StatisticsConfig, WorkMode};

static MANAGER: OnceCell<Manager> = OnceCell::new();

struct Manager {
    clap_matches: Args,
}

#[derive(Debug, Parser)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION")
)]
pub struct Args {
    /// Turns all log categories up to Debug, for more information check RUST_LOG env variable.
    #[arg(short, long)]
    verbose: bool,

    /// Sets the IP and port that the server will be provided
    #[arg(long, default_value = "0.0.0.0:8080")]
    web_server: std::net::SocketAddrV4,

    /// Turns all log categories up to Trace to the log file, for more information check RUST_LOG env variable.
    #[arg(long)]
    enable_tracing_level_log_file: bool,

    /// Specifies the path in which the logs will be stored.
    #[arg(long, default_value = "./logs")]
    log_path: Option<String>,

    /// Lower bound of the delay between two statistics rounds of a device, in milliseconds.
    #[arg(long, default_value = "3000")]
    min_poll_delay_ms: u64,

    /// Upper bound of the delay between two statistics rounds of a device, in milliseconds.
    #[arg(long, default_value = "900000")]
    max_poll_delay_ms: u64,

    /// Time a switch gets to answer one statistics request, in milliseconds.
    #[arg(long, default_value = "10000")]
    request_timeout_ms: u64,

    /// Watchdog of a round while no average round time is known yet, in seconds.
    #[arg(long, default_value = "50")]
    round_timeout_secs: u64,

    /// Never polls statistics. Connected devices are still tracked.
    #[arg(long)]
    disable_statistics_polling: bool,

    /// Work mode the statistics manager starts in.
    #[arg(long, default_value = "COLLECTALL", value_name = "COLLECTALL|FULLYDISABLED")]
    work_mode: WorkMode,

    /// Space-separated list of statistics categories that are never requested, e.g.: "queue meter-features".
    #[arg(long, num_args = 1.., value_delimiter = ' ', value_parser = category_parser)]
    disabled_categories: Vec<StatisticsCategory>,

    /// Number of simulated switches to connect on start, for running without a controller transport.
    #[arg(long, default_value = "0")]
    fake_switches: u64,
}

#[instrument(level = "debug")]
fn category_parser(entry: &str) -> Result<StatisticsCategory, String> {
    let normalized = entry.replace(['-', '_'], "");
    normalized
        .parse::<StatisticsCategory>()
        .map_err(|error| format!("Unknown statistics category {entry:?}: {error}"))
}

/// Constructs our manager, Should be done inside main
#[instrument(level = "debug")]
pub fn init() {
    let expanded_args = std::env::args()
        .map(|arg| {
            // Fallback to the original if it fails to expand
            shellexpand::env(&arg.clone())
                .inspect_err(|_| {
                    warn!("Failed expanding arg: {arg:?}, using the non-expanded instead.")
                })
                .unwrap_or_else(|_| arg.into())
                .into_owned()
        })
        .collect::<Vec<String>>();

    let reparsed_expanded_args = Args::parse_from(expanded_args);

    init_with(reparsed_expanded_args);
}

/// Constructs our manager, Should be done inside main
/// Note: differently from init(), this doesn't expand env variables
#[instrument(level = "debug")]
pub fn init_with(args: Args) {
    MANAGER.get_or_init(|| Manager { clap_matches: args });
}

/// Local acessor to the parsed Args
fn args() -> &'static Args {
    &MANAGER
        .get()
        .expect("cli::init should be called before reading arguments")
        .clap_matches
}

/// Checks if the verbosity parameter was used
#[instrument(level = "debug")]
pub fn is_verbose() -> bool {
    args().verbose
}

#[instrument(level = "debug")]
pub fn is_tracing() -> bool {
    args().enable_tracing_level_log_file
}

#[instrument(level = "debug")]
pub fn log_path() -> String {
    let log_path = args()
        .log_path
        .clone()
        .expect("Clap arg \"log-path\" should always be \"Some(_)\" because of the default value.")
        .parse::<std::path::PathBuf>()
        .expect("Failed parsing the passed log-path");

    std::fs::canonicalize(&log_path)
        .inspect_err(|_| {
            warn!("Failed canonicalizing path: {log_path:?}, using the non-canonized instead.")
        })
        .unwrap_or(log_path)
        .into_os_string()
        .into_string()
        .expect("Failed converting PathBuf into string")
}

#[instrument(level = "debug")]
pub fn command_line_string() -> String {
    std::env::args().collect::<Vec<String>>().join(" ")
}

/// Returns a pretty string of the current Args struct
#[instrument(level = "debug")]
pub fn command_line() -> String {
    format!("{:#?}", args())
}

#[instrument(level = "debug")]
pub fn web_server() -> std::net::SocketAddrV4 {
    args().web_server
}

#[instrument(level = "debug")]
pub fn min_poll_delay() -> Duration {
    Duration::from_millis(args().min_poll_delay_ms)
}

#[instrument(level = "debug")]
pub fn max_poll_delay() -> Duration {
    Duration::from_millis(args().max_poll_delay_ms)
}

#[instrument(level = "debug")]
pub fn request_timeout() -> Duration {
    Duration::from_millis(args().request_timeout_ms)
}

#[instrument(level = "debug")]
pub fn round_timeout() -> Duration {
    Duration::from_secs(args().round_timeout_secs)
}

#[instrument(level = "debug")]
pub fn is_statistics_polling_enabled() -> bool {
    !args().disable_statistics_polling
}

#[instrument(level = "debug")]
pub fn work_mode() -> WorkMode {
    args().work_mode
}

#[instrument(level = "debug")]
pub fn disabled_categories() -> Vec<StatisticsCategory> {
    args().disabled_categories.clone()
}

#[instrument(level = "debug")]
pub fn fake_switches() -> u64 {
    args().fake_switches
}

/// Statistics configuration assembled from the arguments.
#[instrument(level = "debug")]
pub fn statistics_config() -> StatisticsConfig {
    let mut min_poll_delay = min_poll_delay();
    let max_poll_delay = max_poll_delay();
    if min_poll_delay > max_poll_delay {
        warn!("Minimum poll delay {min_poll_delay:?} exceeds the maximum, using {max_poll_delay:?}");
        min_poll_delay = max_poll_delay;
    }

    StatisticsConfig {
        min_poll_delay,
        max_poll_delay,
        request_timeout: request_timeout(),
        default_round_timeout: round_timeout(),
        polling_enabled: is_statistics_polling_enabled(),
        disabled_categories: disabled_categories(),
    }
}
