pub mod fake;

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{
    device::{ConnectionState, Xid},
    error::RequestError,
    protocol::{MultipartReply, MultipartRequest},
};

/// Messages a switch connection pushes up to the statistics side.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    MultipartReply(MultipartReply),
    Error { xid: Xid, error_type: u16, code: u16 },
    Disconnected,
}

/// The connection to one switch, with the wire codec behind it.
///
/// Replies arrive on the broadcast channel returned by [`Transport::subscribe`],
/// possibly before `send_multipart_request` returns.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send_multipart_request(&self, request: MultipartRequest) -> Result<(), RequestError>;

    fn subscribe(&self) -> broadcast::Receiver<Arc<InboundMessage>>;

    fn connection_state(&self) -> ConnectionState;

    /// Closes the connection, used when a freshly connected device cannot be synchronized.
    fn shutdown_connection(&self);
}
