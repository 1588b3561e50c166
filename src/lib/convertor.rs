//! Conversions from version-specific payloads to the version-independent model.

use tracing::*;

use crate::{
    device::DatapathId,
    protocol::{
        FlowStats, GroupDesc, Instruction, MeterBandEntry, MeterConfig, MeterFlagsBitmap,
        OfVersion,
    },
    statistics::snapshot::{
        FlowStatistics, GroupBucket, GroupDescription, GroupType, MeterBand, MeterBandHeader,
        MeterConfigStatistics, MeterFlags, StatsDuration,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertorData {
    pub version: OfVersion,
    pub datapath_id: DatapathId,
}

impl ConvertorData {
    pub fn new(version: OfVersion, datapath_id: DatapathId) -> Self {
        Self {
            version,
            datapath_id,
        }
    }
}

/// Converts payloads whose shape depends on the protocol version.
///
/// `None` means the payload cannot be represented in the common model.
pub trait ConvertorExecutor: Send + Sync {
    fn convert_flow_stats(
        &self,
        flows: &[FlowStats],
        data: &ConvertorData,
    ) -> Option<Vec<FlowStatistics>>;

    fn convert_group_desc(
        &self,
        groups: &[GroupDesc],
        data: &ConvertorData,
    ) -> Option<Vec<GroupDescription>>;

    fn convert_meter_config(
        &self,
        configs: &[MeterConfig],
        data: &ConvertorData,
    ) -> Option<Vec<MeterConfigStatistics>>;

    fn node_connector_id(&self, port_no: u32, data: &ConvertorData) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConvertorExecutor;

impl ConvertorExecutor for DefaultConvertorExecutor {
    fn convert_flow_stats(
        &self,
        flows: &[FlowStats],
        data: &ConvertorData,
    ) -> Option<Vec<FlowStatistics>> {
        let converted = flows
            .iter()
            .map(|flow| {
                let mut match_fields = flow.match_fields.clone();
                match_fields.sort();

                let instructions = match data.version {
                    OfVersion::V13 => flow.instructions.clone(),
                    OfVersion::V10 if flow.actions.is_empty() => Vec::new(),
                    OfVersion::V10 => vec![Instruction::ApplyActions(flow.actions.clone())],
                };

                FlowStatistics {
                    table_id: flow.table_id,
                    priority: flow.priority,
                    cookie: flow.cookie,
                    idle_timeout: flow.idle_timeout,
                    hard_timeout: flow.hard_timeout,
                    flags: flow.flags,
                    duration: StatsDuration::new(flow.duration_sec, flow.duration_nsec),
                    packet_count: flow.packet_count,
                    byte_count: flow.byte_count,
                    match_fields,
                    instructions,
                }
            })
            .collect();

        Some(converted)
    }

    fn convert_group_desc(
        &self,
        groups: &[GroupDesc],
        _data: &ConvertorData,
    ) -> Option<Vec<GroupDescription>> {
        groups
            .iter()
            .map(|group| {
                let Some(group_type) = GroupType::from_wire(group.group_type) else {
                    debug!(
                        "Group {} has unknown type code {}",
                        group.group_id, group.group_type
                    );
                    return None;
                };

                let buckets = group
                    .buckets
                    .iter()
                    .enumerate()
                    .map(|(bucket_id, bucket)| GroupBucket {
                        bucket_id: bucket_id as u32,
                        weight: bucket.weight,
                        watch_port: bucket.watch_port,
                        watch_group: bucket.watch_group,
                        actions: bucket.actions.clone(),
                    })
                    .collect();

                Some(GroupDescription {
                    group_id: group.group_id,
                    group_type,
                    buckets,
                })
            })
            .collect()
    }

    fn convert_meter_config(
        &self,
        configs: &[MeterConfig],
        _data: &ConvertorData,
    ) -> Option<Vec<MeterConfigStatistics>> {
        let converted = configs
            .iter()
            .map(|config| MeterConfigStatistics {
                meter_id: config.meter_id,
                flags: meter_flags(&config.flags),
                bands: config
                    .bands
                    .iter()
                    .enumerate()
                    .map(|(band_id, band)| MeterBandHeader {
                        band_id: band_id as u32,
                        band: meter_band(band),
                    })
                    .collect(),
            })
            .collect();

        Some(converted)
    }

    fn node_connector_id(&self, port_no: u32, data: &ConvertorData) -> String {
        let port = reserved_port_name(port_no, data.version)
            .map(str::to_string)
            .unwrap_or_else(|| port_no.to_string());
        format!("{}:{port}", data.datapath_id.node_id())
    }
}

fn meter_flags(flags: &MeterFlagsBitmap) -> MeterFlags {
    let mut meter_flags = MeterFlags::empty();
    meter_flags.set(MeterFlags::KBPS, flags.kbps);
    meter_flags.set(MeterFlags::PKTPS, flags.pktps);
    meter_flags.set(MeterFlags::BURST, flags.burst);
    meter_flags.set(MeterFlags::STATS, flags.stats);
    meter_flags
}

fn meter_band(band: &MeterBandEntry) -> MeterBand {
    match *band {
        MeterBandEntry::Drop { rate, burst_size } => MeterBand::Drop { rate, burst_size },
        MeterBandEntry::DscpRemark {
            rate,
            burst_size,
            prec_level,
        } => MeterBand::DscpRemark {
            rate,
            burst_size,
            prec_level,
        },
        MeterBandEntry::Experimenter {
            rate,
            burst_size,
            experimenter,
        } => MeterBand::Experimenter {
            rate,
            burst_size,
            experimenter,
        },
    }
}

/// Names of the reserved ports, which sit at the top of each version's port range.
pub fn reserved_port_name(port_no: u32, version: OfVersion) -> Option<&'static str> {
    let base = match version {
        OfVersion::V10 => 0xfff8,
        OfVersion::V13 => 0xffff_fff8,
    };
    let max = match version {
        OfVersion::V10 => 0xffff,
        OfVersion::V13 => 0xffff_ffff,
    };
    if port_no < base || port_no > max {
        return None;
    }

    let name = match port_no - base {
        0 => "IN_PORT",
        1 => "TABLE",
        2 => "NORMAL",
        3 => "FLOOD",
        4 => "ALL",
        5 => "CONTROLLER",
        6 => "LOCAL",
        _ => "ANY",
    };
    Some(name)
}
