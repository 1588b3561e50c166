use thiserror::Error;

use crate::{device::Xid, statistics::StatisticsCategory};

pub const CONNECTION_CLOSED: &str = "Connection closed.";

/// Failure of a single statistics request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{CONNECTION_CLOSED}")]
    Closed,
    #[error("Request {xid} timed out after {timeout_ms} ms")]
    Timeout { xid: Xid, timeout_ms: u64 },
    #[error("Failed sending request: {0}")]
    Transport(String),
    #[error("Switch rejected request (type: {error_type}, code: {code})")]
    Switch { error_type: u16, code: u16 },
    #[error("Request {0} already completed")]
    AlreadyCompleted(Xid),
    #[error("No outstanding request with {0}")]
    UnknownXid(Xid),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("No writer registered for {0}")]
    NoWriter(StatisticsCategory),
    #[error("Failed writing {category}: {reason}")]
    Write {
        category: StatisticsCategory,
        reason: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("Malformed {multipart_type} reply: {reason}")]
    Malformed {
        multipart_type: &'static str,
        reason: String,
    },
}

/// Why one category of a gathering round failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatherError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Device is disconnected")]
    DeviceGone,
}
