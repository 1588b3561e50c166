use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{lifecycle::ItemLifecycleSource, protocol::OfVersion, transport::Transport};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DatapathId(pub u64);

impl DatapathId {
    pub fn node_id(&self) -> String {
        format!("openflow:{}", self.0)
    }
}

impl std::fmt::Display for DatapathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.node_id())
    }
}

impl std::str::FromStr for DatapathId {
    type Err = std::num::ParseIntError;

    /// Accepts both `42` and `openflow:42`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("openflow:").unwrap_or(s);
        raw.parse().map(Self)
    }
}

/// Transaction id of one request on one connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Xid(pub u32);

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

bitflags! {
    /// `ofp_capabilities` as announced in the features reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const FLOW_STATS = 1 << 0;
        const TABLE_STATS = 1 << 1;
        const PORT_STATS = 1 << 2;
        const GROUP_STATS = 1 << 3;
        const IP_REASM = 1 << 5;
        const QUEUE_STATS = 1 << 6;
        const PORT_BLOCKED = 1 << 8;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub datapath_id: DatapathId,
    pub version: OfVersion,
    pub capabilities: Capabilities,
    pub meters_available: bool,
}

impl DeviceInfo {
    pub fn groups_available(&self) -> bool {
        self.version == OfVersion::V13 && self.capabilities.contains(Capabilities::GROUP_STATS)
    }

    pub fn meters_available(&self) -> bool {
        self.version == OfVersion::V13 && self.meters_available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Handshaking,
    Working,
    Rip,
}

/// Everything the statistics side needs to know about a connected switch.
#[derive(Clone)]
pub struct DeviceContext {
    pub info: DeviceInfo,
    pub transport: Arc<dyn Transport>,
    pub lifecycle_source: Option<Arc<ItemLifecycleSource>>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("info", &self.info)
            .field("has_lifecycle_source", &self.lifecycle_source.is_some())
            .finish()
    }
}

impl DeviceContext {
    pub fn new(info: DeviceInfo, transport: Arc<dyn Transport>) -> Self {
        Self {
            info,
            transport,
            lifecycle_source: None,
        }
    }

    pub fn with_lifecycle_source(mut self, source: Arc<ItemLifecycleSource>) -> Self {
        self.lifecycle_source = Some(source);
        self
    }

    pub fn datapath_id(&self) -> DatapathId {
        self.info.datapath_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datapath_id_parsing() {
        assert_eq!("openflow:21".parse::<DatapathId>(), Ok(DatapathId(21)));
        assert_eq!("21".parse::<DatapathId>(), Ok(DatapathId(21)));
        assert!("openflow:abc".parse::<DatapathId>().is_err());
        assert_eq!(DatapathId(21).to_string(), "openflow:21");
    }

    #[test]
    fn groups_need_capability_and_version() {
        let mut info = DeviceInfo {
            datapath_id: DatapathId(1),
            version: OfVersion::V13,
            capabilities: Capabilities::FLOW_STATS | Capabilities::GROUP_STATS,
            meters_available: true,
        };
        assert!(info.groups_available());
        assert!(info.meters_available());

        info.version = OfVersion::V10;
        assert!(!info.groups_available());
        assert!(!info.meters_available());
    }
}
