//! Decoded OpenFlow multipart messages as handed over by the wire codec.
//!
//! Encoding and decoding of the binary format happens outside this crate; these
//! types carry the already decoded, still version-specific fields.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::device::Xid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OfVersion {
    V10,
    V13,
}

impl OfVersion {
    pub fn from_wire(version: u8) -> Option<Self> {
        match version {
            0x01 => Some(Self::V10),
            0x04 => Some(Self::V13),
            _ => None,
        }
    }

    pub fn wire_version(&self) -> u8 {
        match self {
            Self::V10 => 0x01,
            Self::V13 => 0x04,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
pub enum MultipartType {
    #[strum(serialize = "OFPMPDESC")]
    Desc,
    #[strum(serialize = "OFPMPFLOW")]
    Flow,
    #[strum(serialize = "OFPMPAGGREGATE")]
    Aggregate,
    #[strum(serialize = "OFPMPTABLE")]
    Table,
    #[strum(serialize = "OFPMPPORTSTATS")]
    PortStats,
    #[strum(serialize = "OFPMPQUEUE")]
    Queue,
    #[strum(serialize = "OFPMPGROUP")]
    Group,
    #[strum(serialize = "OFPMPGROUPDESC")]
    GroupDesc,
    #[strum(serialize = "OFPMPGROUPFEATURES")]
    GroupFeatures,
    #[strum(serialize = "OFPMPMETER")]
    Meter,
    #[strum(serialize = "OFPMPMETERCONFIG")]
    MeterConfig,
    #[strum(serialize = "OFPMPMETERFEATURES")]
    MeterFeatures,
    #[strum(serialize = "OFPMPTABLEFEATURES")]
    TableFeatures,
    #[strum(serialize = "OFPMPPORTDESC")]
    PortDesc,
    #[strum(serialize = "OFPMPEXPERIMENTER")]
    Experimenter,
}

impl MultipartType {
    pub fn from_code(code: u16) -> Option<Self> {
        let multipart_type = match code {
            0 => Self::Desc,
            1 => Self::Flow,
            2 => Self::Aggregate,
            3 => Self::Table,
            4 => Self::PortStats,
            5 => Self::Queue,
            6 => Self::Group,
            7 => Self::GroupDesc,
            8 => Self::GroupFeatures,
            9 => Self::Meter,
            10 => Self::MeterConfig,
            11 => Self::MeterFeatures,
            12 => Self::TableFeatures,
            13 => Self::PortDesc,
            0xffff => Self::Experimenter,
            _ => return None,
        };
        Some(multipart_type)
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::Desc => 0,
            Self::Flow => 1,
            Self::Aggregate => 2,
            Self::Table => 3,
            Self::PortStats => 4,
            Self::Queue => 5,
            Self::Group => 6,
            Self::GroupDesc => 7,
            Self::GroupFeatures => 8,
            Self::Meter => 9,
            Self::MeterConfig => 10,
            Self::MeterFeatures => 11,
            Self::TableFeatures => 12,
            Self::PortDesc => 13,
            Self::Experimenter => 0xffff,
        }
    }
}

pub const OFPTT_ALL: u8 = 0xff;
pub const OFPP_ANY: u32 = 0xffff_ffff;
pub const OFPQ_ALL: u32 = 0xffff_ffff;
pub const OFPG_ALL: u32 = 0xffff_fffc;
pub const OFPM_ALL: u32 = 0xffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartRequest {
    pub xid: Xid,
    pub body: MultipartRequestBody,
}

/// Request bodies, always wildcarded the way periodic polling asks for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultipartRequestBody {
    Flow { table_id: u8, out_port: u32, out_group: u32 },
    Aggregate { table_id: u8, out_port: u32, out_group: u32 },
    Table,
    PortStats { port_no: u32 },
    Queue { port_no: u32, queue_id: u32 },
    Group { group_id: u32 },
    GroupDesc,
    GroupFeatures,
    Meter { meter_id: u32 },
    MeterConfig { meter_id: u32 },
    MeterFeatures,
    Other(MultipartType),
}

impl MultipartRequest {
    pub fn all(xid: Xid, multipart_type: MultipartType) -> Self {
        let body = match multipart_type {
            MultipartType::Flow => MultipartRequestBody::Flow {
                table_id: OFPTT_ALL,
                out_port: OFPP_ANY,
                out_group: OFPG_ALL,
            },
            MultipartType::Aggregate => MultipartRequestBody::Aggregate {
                table_id: OFPTT_ALL,
                out_port: OFPP_ANY,
                out_group: OFPG_ALL,
            },
            MultipartType::Table => MultipartRequestBody::Table,
            MultipartType::PortStats => MultipartRequestBody::PortStats { port_no: OFPP_ANY },
            MultipartType::Queue => MultipartRequestBody::Queue {
                port_no: OFPP_ANY,
                queue_id: OFPQ_ALL,
            },
            MultipartType::Group => MultipartRequestBody::Group { group_id: OFPG_ALL },
            MultipartType::GroupDesc => MultipartRequestBody::GroupDesc,
            MultipartType::GroupFeatures => MultipartRequestBody::GroupFeatures,
            MultipartType::Meter => MultipartRequestBody::Meter { meter_id: OFPM_ALL },
            MultipartType::MeterConfig => MultipartRequestBody::MeterConfig { meter_id: OFPM_ALL },
            MultipartType::MeterFeatures => MultipartRequestBody::MeterFeatures,
            other => MultipartRequestBody::Other(other),
        };

        Self { xid, body }
    }

    pub fn multipart_type(&self) -> MultipartType {
        match &self.body {
            MultipartRequestBody::Flow { .. } => MultipartType::Flow,
            MultipartRequestBody::Aggregate { .. } => MultipartType::Aggregate,
            MultipartRequestBody::Table => MultipartType::Table,
            MultipartRequestBody::PortStats { .. } => MultipartType::PortStats,
            MultipartRequestBody::Queue { .. } => MultipartType::Queue,
            MultipartRequestBody::Group { .. } => MultipartType::Group,
            MultipartRequestBody::GroupDesc => MultipartType::GroupDesc,
            MultipartRequestBody::GroupFeatures => MultipartType::GroupFeatures,
            MultipartRequestBody::Meter { .. } => MultipartType::Meter,
            MultipartRequestBody::MeterConfig { .. } => MultipartType::MeterConfig,
            MultipartRequestBody::MeterFeatures => MultipartType::MeterFeatures,
            MultipartRequestBody::Other(multipart_type) => *multipart_type,
        }
    }
}

/// One part of a (possibly multi-part) reply. The last part has `request_more` unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartReply {
    pub xid: Xid,
    pub version: OfVersion,
    pub request_more: bool,
    pub body: MultipartReplyBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MultipartReplyBody {
    Desc(DescReply),
    Flow(Vec<FlowStats>),
    Aggregate(AggregateReply),
    Table(Vec<TableStats>),
    PortStats(Vec<PortStats>),
    Queue(Vec<QueueStats>),
    Group(Vec<GroupStats>),
    GroupDesc(Vec<GroupDesc>),
    GroupFeatures(GroupFeaturesReply),
    Meter(Vec<MeterStats>),
    MeterConfig(Vec<MeterConfig>),
    MeterFeatures(MeterFeaturesReply),
    TableFeatures(Vec<u8>),
    PortDesc(Vec<u32>),
    Experimenter { experimenter: u32, exp_type: u32 },
    Unknown { type_code: u16 },
}

impl MultipartReplyBody {
    pub fn multipart_type(&self) -> Option<MultipartType> {
        let multipart_type = match self {
            Self::Desc(_) => MultipartType::Desc,
            Self::Flow(_) => MultipartType::Flow,
            Self::Aggregate(_) => MultipartType::Aggregate,
            Self::Table(_) => MultipartType::Table,
            Self::PortStats(_) => MultipartType::PortStats,
            Self::Queue(_) => MultipartType::Queue,
            Self::Group(_) => MultipartType::Group,
            Self::GroupDesc(_) => MultipartType::GroupDesc,
            Self::GroupFeatures(_) => MultipartType::GroupFeatures,
            Self::Meter(_) => MultipartType::Meter,
            Self::MeterConfig(_) => MultipartType::MeterConfig,
            Self::MeterFeatures(_) => MultipartType::MeterFeatures,
            Self::TableFeatures(_) => MultipartType::TableFeatures,
            Self::PortDesc(_) => MultipartType::PortDesc,
            Self::Experimenter { .. } => MultipartType::Experimenter,
            Self::Unknown { type_code } => return MultipartType::from_code(*type_code),
        };
        Some(multipart_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescReply {
    pub manufacturer: String,
    pub hardware: String,
    pub software: String,
    pub serial_number: String,
    pub datapath: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchFieldType {
    InPort,
    EthDst,
    EthSrc,
    EthType,
    VlanVid,
    IpDscp,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    Metadata,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchField {
    pub field: MatchFieldType,
    pub value: u64,
    pub mask: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Output { port: u32, max_len: u16 },
    CopyTtlOut,
    CopyTtlIn,
    SetMplsTtl(u8),
    DecMplsTtl,
    PushVlan(u16),
    PopVlan,
    PushMpls(u16),
    PopMpls(u16),
    SetQueue(u32),
    Group(u32),
    SetNwTtl(u8),
    DecNwTtl,
    SetField(MatchField),
    PushPbb(u16),
    PopPbb,
    Experimenter(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instruction {
    GotoTable(u8),
    WriteMetadata { metadata: u64, mask: u64 },
    WriteActions(Vec<Action>),
    ApplyActions(Vec<Action>),
    ClearActions,
    Meter(u32),
}

/// OpenFlow 1.0 replies fill `actions`, 1.3 replies fill `instructions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub flags: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub match_fields: Vec<MatchField>,
    pub instructions: Vec<Instruction>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReply {
    pub packet_count: u64,
    pub byte_count: u64,
    pub flow_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub table_id: u8,
    pub active_count: u32,
    pub lookup_count: u64,
    pub matched_count: u64,
}

/// Durations are absent on OpenFlow 1.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    pub port_no: u32,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_frame_err: u64,
    pub rx_over_err: u64,
    pub rx_crc_err: u64,
    pub collisions: u64,
    pub duration_sec: Option<u32>,
    pub duration_nsec: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub port_no: u32,
    pub queue_id: u32,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub duration_sec: u32,
    pub duration_nsec: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounter {
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub group_id: u32,
    pub ref_count: u32,
    pub packet_count: u64,
    pub byte_count: u64,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub bucket_stats: Vec<BucketCounter>,
}

pub const OFPGT_ALL: u8 = 0;
pub const OFPGT_SELECT: u8 = 1;
pub const OFPGT_INDIRECT: u8 = 2;
pub const OFPGT_FF: u8 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub weight: u16,
    pub watch_port: u32,
    pub watch_group: u32,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub group_id: u32,
    /// Raw `ofp_group_type` code.
    pub group_type: u8,
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTypesBitmap {
    pub all: bool,
    pub select: bool,
    pub indirect: bool,
    pub ff: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCapabilitiesBitmap {
    pub chaining: bool,
    pub chaining_checks: bool,
    pub select_liveness: bool,
    pub select_weight: bool,
}

/// Action support flags of one group type, one flag per `ofp_action_type`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTypeBitmap {
    pub output: bool,
    pub copy_ttl_out: bool,
    pub copy_ttl_in: bool,
    pub set_mpls_ttl: bool,
    pub dec_mpls_ttl: bool,
    pub push_vlan: bool,
    pub pop_vlan: bool,
    pub push_mpls: bool,
    pub pop_mpls: bool,
    pub set_queue: bool,
    pub group: bool,
    pub set_nw_ttl: bool,
    pub dec_nw_ttl: bool,
    pub set_field: bool,
    pub push_pbb: bool,
    pub pop_pbb: bool,
    pub experimenter: bool,
}

impl ActionTypeBitmap {
    pub fn all() -> Self {
        Self {
            output: true,
            copy_ttl_out: true,
            copy_ttl_in: true,
            set_mpls_ttl: true,
            dec_mpls_ttl: true,
            push_vlan: true,
            pop_vlan: true,
            push_mpls: true,
            pop_mpls: true,
            set_queue: true,
            group: true,
            set_nw_ttl: true,
            dec_nw_ttl: true,
            set_field: true,
            push_pbb: true,
            pop_pbb: true,
            experimenter: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFeaturesReply {
    pub types: GroupTypesBitmap,
    pub capabilities: GroupCapabilitiesBitmap,
    pub max_groups: Vec<u32>,
    pub actions_bitmap: Vec<ActionTypeBitmap>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandCounter {
    pub packet_band_count: u64,
    pub byte_band_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterStats {
    pub meter_id: u32,
    pub flow_count: u32,
    pub packet_in_count: u64,
    pub byte_in_count: u64,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub band_stats: Vec<BandCounter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterFlagsBitmap {
    pub kbps: bool,
    pub pktps: bool,
    pub burst: bool,
    pub stats: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterBandEntry {
    Drop { rate: u32, burst_size: u32 },
    DscpRemark { rate: u32, burst_size: u32, prec_level: u8 },
    Experimenter { rate: u32, burst_size: u32, experimenter: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    pub flags: MeterFlagsBitmap,
    pub meter_id: u32,
    pub bands: Vec<MeterBandEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterBandTypeBitmap {
    pub drop: bool,
    pub dscp_remark: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterFeaturesReply {
    pub max_meter: u32,
    pub band_types: MeterBandTypeBitmap,
    pub capabilities: MeterFlagsBitmap,
    pub max_bands: u8,
    pub max_color: u8,
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn multipart_type_codes_are_stable() {
        for multipart_type in MultipartType::iter() {
            assert_eq!(
                MultipartType::from_code(multipart_type.code()),
                Some(multipart_type)
            );
        }
        assert_eq!(MultipartType::from_code(14), None);
        assert_eq!(MultipartType::GroupDesc.to_string(), "OFPMPGROUPDESC");
    }

    #[test]
    fn wildcard_requests() {
        let request = MultipartRequest::all(Xid(7), MultipartType::Queue);
        assert_eq!(request.multipart_type(), MultipartType::Queue);
        assert_eq!(
            request.body,
            MultipartRequestBody::Queue {
                port_no: OFPP_ANY,
                queue_id: OFPQ_ALL
            }
        );
    }
}
