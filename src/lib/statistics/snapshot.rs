//! Version-independent statistics records, one snapshot per category and round.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    device::{DatapathId, Xid},
    protocol::{Action, Instruction, MatchField, MultipartType},
    store::ItemKey,
};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum StatisticsCategory {
    Flow,
    Aggregate,
    Table,
    Port,
    Queue,
    Group,
    GroupDesc,
    GroupFeatures,
    Meter,
    MeterConfig,
    MeterFeatures,
}

impl StatisticsCategory {
    pub fn multipart_type(&self) -> MultipartType {
        match self {
            Self::Flow => MultipartType::Flow,
            Self::Aggregate => MultipartType::Aggregate,
            Self::Table => MultipartType::Table,
            Self::Port => MultipartType::PortStats,
            Self::Queue => MultipartType::Queue,
            Self::Group => MultipartType::Group,
            Self::GroupDesc => MultipartType::GroupDesc,
            Self::GroupFeatures => MultipartType::GroupFeatures,
            Self::Meter => MultipartType::Meter,
            Self::MeterConfig => MultipartType::MeterConfig,
            Self::MeterFeatures => MultipartType::MeterFeatures,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDuration {
    pub second: u32,
    pub nanosecond: u32,
}

impl StatsDuration {
    pub fn new(second: u32, nanosecond: u32) -> Self {
        Self { second, nanosecond }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub datapath_id: DatapathId,
    pub xid: Xid,
    pub body: SnapshotBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotBody {
    Flow(Vec<FlowStatistics>),
    Aggregate(AggregateFlowStatistics),
    Table(Vec<FlowTableStatistics>),
    Port(Vec<NodeConnectorStatistics>),
    Queue(Vec<QueueStatistics>),
    Group(Vec<GroupStatistics>),
    GroupDesc(Vec<GroupDescription>),
    GroupFeatures(GroupFeatures),
    Meter(Vec<MeterStatistics>),
    MeterConfig(Vec<MeterConfigStatistics>),
    MeterFeatures(MeterFeatures),
}

impl StatisticsSnapshot {
    pub fn category(&self) -> StatisticsCategory {
        match &self.body {
            SnapshotBody::Flow(_) => StatisticsCategory::Flow,
            SnapshotBody::Aggregate(_) => StatisticsCategory::Aggregate,
            SnapshotBody::Table(_) => StatisticsCategory::Table,
            SnapshotBody::Port(_) => StatisticsCategory::Port,
            SnapshotBody::Queue(_) => StatisticsCategory::Queue,
            SnapshotBody::Group(_) => StatisticsCategory::Group,
            SnapshotBody::GroupDesc(_) => StatisticsCategory::GroupDesc,
            SnapshotBody::GroupFeatures(_) => StatisticsCategory::GroupFeatures,
            SnapshotBody::Meter(_) => StatisticsCategory::Meter,
            SnapshotBody::MeterConfig(_) => StatisticsCategory::MeterConfig,
            SnapshotBody::MeterFeatures(_) => StatisticsCategory::MeterFeatures,
        }
    }

    /// Appends the entries of a later reply part. Single-record bodies are replaced.
    ///
    /// Returns `false` when the part belongs to a different category.
    pub fn merge(&mut self, part: StatisticsSnapshot) -> bool {
        match (&mut self.body, part.body) {
            (SnapshotBody::Flow(entries), SnapshotBody::Flow(more)) => entries.extend(more),
            (SnapshotBody::Table(entries), SnapshotBody::Table(more)) => entries.extend(more),
            (SnapshotBody::Port(entries), SnapshotBody::Port(more)) => entries.extend(more),
            (SnapshotBody::Queue(entries), SnapshotBody::Queue(more)) => entries.extend(more),
            (SnapshotBody::Group(entries), SnapshotBody::Group(more)) => entries.extend(more),
            (SnapshotBody::GroupDesc(entries), SnapshotBody::GroupDesc(more)) => {
                entries.extend(more)
            }
            (SnapshotBody::Meter(entries), SnapshotBody::Meter(more)) => entries.extend(more),
            (SnapshotBody::MeterConfig(entries), SnapshotBody::MeterConfig(more)) => {
                entries.extend(more)
            }
            (SnapshotBody::Aggregate(current), SnapshotBody::Aggregate(more)) => *current = more,
            (SnapshotBody::GroupFeatures(current), SnapshotBody::GroupFeatures(more)) => {
                *current = more
            }
            (SnapshotBody::MeterFeatures(current), SnapshotBody::MeterFeatures(more)) => {
                *current = more
            }
            _ => return false,
        }
        true
    }

    /// Store keys of every entry, except flows whose ids come from the flow registry.
    pub fn item_keys(&self) -> Vec<ItemKey> {
        match &self.body {
            SnapshotBody::Flow(_) => Vec::new(),
            SnapshotBody::Aggregate(_) => vec![ItemKey::AggregateFlow],
            SnapshotBody::Table(entries) => entries
                .iter()
                .map(|entry| ItemKey::FlowTable(entry.table_id))
                .collect(),
            SnapshotBody::Port(entries) => entries
                .iter()
                .map(|entry| ItemKey::NodeConnector(entry.node_connector_id.clone()))
                .collect(),
            SnapshotBody::Queue(entries) => entries
                .iter()
                .map(|entry| ItemKey::Queue {
                    node_connector_id: entry.node_connector_id.clone(),
                    queue_id: entry.queue_id,
                })
                .collect(),
            SnapshotBody::Group(entries) => entries
                .iter()
                .map(|entry| ItemKey::GroupStatistics(entry.group_id))
                .collect(),
            SnapshotBody::GroupDesc(entries) => entries
                .iter()
                .map(|entry| ItemKey::Group(entry.group_id))
                .collect(),
            SnapshotBody::GroupFeatures(_) => vec![ItemKey::GroupFeatures],
            SnapshotBody::Meter(entries) => entries
                .iter()
                .map(|entry| ItemKey::MeterStatistics(entry.meter_id))
                .collect(),
            SnapshotBody::MeterConfig(entries) => entries
                .iter()
                .map(|entry| ItemKey::Meter(entry.meter_id))
                .collect(),
            SnapshotBody::MeterFeatures(_) => vec![ItemKey::MeterFeatures],
        }
    }

    pub fn entry_count(&self) -> usize {
        match &self.body {
            SnapshotBody::Flow(entries) => entries.len(),
            SnapshotBody::Table(entries) => entries.len(),
            SnapshotBody::Port(entries) => entries.len(),
            SnapshotBody::Queue(entries) => entries.len(),
            SnapshotBody::Group(entries) => entries.len(),
            SnapshotBody::GroupDesc(entries) => entries.len(),
            SnapshotBody::Meter(entries) => entries.len(),
            SnapshotBody::MeterConfig(entries) => entries.len(),
            SnapshotBody::Aggregate(_)
            | SnapshotBody::GroupFeatures(_)
            | SnapshotBody::MeterFeatures(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatistics {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub flags: u16,
    pub duration: StatsDuration,
    pub packet_count: u64,
    pub byte_count: u64,
    /// Sorted by field so equal matches compare equal.
    pub match_fields: Vec<MatchField>,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateFlowStatistics {
    pub packet_count: u64,
    pub byte_count: u64,
    pub flow_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowTableStatistics {
    pub table_id: u8,
    pub active_flows: u32,
    pub packets_looked_up: u64,
    pub packets_matched: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub received: u64,
    pub transmitted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnectorStatistics {
    pub node_connector_id: String,
    pub port_no: u32,
    pub packets: Counters,
    pub bytes: Counters,
    pub receive_drops: u64,
    pub transmit_drops: u64,
    pub receive_errors: u64,
    pub transmit_errors: u64,
    pub receive_frame_error: u64,
    pub receive_over_run_error: u64,
    pub receive_crc_error: u64,
    pub collision_count: u64,
    pub duration: Option<StatsDuration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub node_connector_id: String,
    pub port_no: u32,
    pub queue_id: u32,
    pub transmitted_bytes: u64,
    pub transmitted_packets: u64,
    pub transmission_errors: u64,
    pub duration: StatsDuration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStatistics {
    pub bucket_id: u32,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatistics {
    pub group_id: u32,
    pub ref_count: u32,
    pub packet_count: u64,
    pub byte_count: u64,
    pub duration: StatsDuration,
    pub buckets: Vec<BucketStatistics>,
}

/// Listed in `ofp_group_type` order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
pub enum GroupType {
    All,
    Select,
    Indirect,
    FastFailover,
}

impl GroupType {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::All),
            1 => Some(Self::Select),
            2 => Some(Self::Indirect),
            3 => Some(Self::FastFailover),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBucket {
    pub bucket_id: u32,
    pub weight: u16,
    pub watch_port: u32,
    pub watch_group: u32,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub group_id: u32,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
pub enum GroupCapability {
    Chaining,
    ChainingChecks,
    SelectLiveness,
    SelectWeight,
}

bitflags! {
    /// Actions a group type supports, at their `ofp_action_type` bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct GroupActionSupport: u32 {
        const OUTPUT = 1 << 0;
        const COPY_TTL_OUT = 1 << 11;
        const COPY_TTL_IN = 1 << 12;
        const SET_MPLS_TTL = 1 << 15;
        const DEC_MPLS_TTL = 1 << 16;
        const PUSH_VLAN = 1 << 17;
        const POP_VLAN = 1 << 18;
        const PUSH_MPLS = 1 << 19;
        const POP_MPLS = 1 << 20;
        const SET_QUEUE = 1 << 21;
        const GROUP = 1 << 22;
        const SET_NW_TTL = 1 << 23;
        const DEC_NW_TTL = 1 << 24;
        const SET_FIELD = 1 << 25;
        const PUSH_PBB = 1 << 26;
        const POP_PBB = 1 << 27;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFeatures {
    pub group_types: Vec<GroupType>,
    pub capabilities: Vec<GroupCapability>,
    pub max_groups: Vec<u32>,
    pub actions: Vec<GroupActionSupport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandStatistics {
    pub band_id: u32,
    pub packet_band_count: u64,
    pub byte_band_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterStatistics {
    pub meter_id: u32,
    pub flow_count: u32,
    pub packet_in_count: u64,
    pub byte_in_count: u64,
    pub duration: StatsDuration,
    pub band_stats: Vec<BandStatistics>,
}

bitflags! {
    /// `ofp_meter_flags`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MeterFlags: u16 {
        const KBPS = 1 << 0;
        const PKTPS = 1 << 1;
        const BURST = 1 << 2;
        const STATS = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterBand {
    Drop {
        rate: u32,
        burst_size: u32,
    },
    DscpRemark {
        rate: u32,
        burst_size: u32,
        prec_level: u8,
    },
    Experimenter {
        rate: u32,
        burst_size: u32,
        experimenter: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterBandHeader {
    pub band_id: u32,
    pub band: MeterBand,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfigStatistics {
    pub meter_id: u32,
    pub flags: MeterFlags,
    pub bands: Vec<MeterBandHeader>,
}

/// Listed in canonical order, which is alphabetical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
pub enum MeterCapability {
    Burst,
    Kbps,
    Pktps,
    Stats,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
pub enum MeterBandKind {
    Drop,
    DscpRemark,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterFeatures {
    pub max_meter: u32,
    pub max_bands: u8,
    pub max_color: u8,
    pub capabilities: Vec<MeterCapability>,
    pub band_types: Vec<MeterBandKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_snapshot(tables: &[u8]) -> StatisticsSnapshot {
        StatisticsSnapshot {
            datapath_id: DatapathId(1),
            xid: Xid(1),
            body: SnapshotBody::Table(
                tables
                    .iter()
                    .map(|&table_id| FlowTableStatistics {
                        table_id,
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn merge_appends_parts_of_the_same_category() {
        let mut snapshot = table_snapshot(&[0, 1]);
        assert!(snapshot.merge(table_snapshot(&[2])));
        assert_eq!(snapshot.entry_count(), 3);
        assert_eq!(
            snapshot.item_keys(),
            vec![
                ItemKey::FlowTable(0),
                ItemKey::FlowTable(1),
                ItemKey::FlowTable(2)
            ]
        );

        let aggregate = StatisticsSnapshot {
            datapath_id: DatapathId(1),
            xid: Xid(1),
            body: SnapshotBody::Aggregate(AggregateFlowStatistics::default()),
        };
        assert!(!snapshot.merge(aggregate));
        assert_eq!(snapshot.category(), StatisticsCategory::Table);
    }

    #[test]
    fn category_names_parse_case_insensitively() {
        assert_eq!(
            "groupdesc".parse::<StatisticsCategory>(),
            Ok(StatisticsCategory::GroupDesc)
        );
        assert_eq!(StatisticsCategory::Port.multipart_type(), MultipartType::PortStats);
    }
}
