use std::sync::Arc;

use tracing::*;

use crate::{
    convertor::{ConvertorData, ConvertorExecutor, DefaultConvertorExecutor},
    device::DatapathId,
    error::TranslateError,
    protocol::{
        ActionTypeBitmap, GroupCapabilitiesBitmap, GroupTypesBitmap, MeterBandTypeBitmap,
        MeterFlagsBitmap, MultipartReply, MultipartReplyBody, OfVersion,
    },
    statistics::snapshot::*,
};

/// Turns one multipart reply part into a statistics snapshot.
#[derive(Clone)]
pub struct MultipartReplyTranslator {
    convertor: Arc<dyn ConvertorExecutor>,
}

impl Default for MultipartReplyTranslator {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConvertorExecutor))
    }
}

impl std::fmt::Debug for MultipartReplyTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartReplyTranslator").finish()
    }
}

impl MultipartReplyTranslator {
    pub fn new(convertor: Arc<dyn ConvertorExecutor>) -> Self {
        Self { convertor }
    }

    /// Categories without a statistics model yield `Ok(None)`.
    #[instrument(level = "trace", skip(self, reply), fields(xid = %reply.xid))]
    pub fn translate(
        &self,
        datapath_id: DatapathId,
        version: OfVersion,
        reply: &MultipartReply,
    ) -> Result<Option<StatisticsSnapshot>, TranslateError> {
        let data = ConvertorData::new(version, datapath_id);

        let body = match &reply.body {
            MultipartReplyBody::Flow(flows) => {
                let flows = self.convertor.convert_flow_stats(flows, &data).ok_or_else(|| {
                    malformed("OFPMPFLOW", "flow statistics could not be converted")
                })?;
                SnapshotBody::Flow(flows)
            }
            MultipartReplyBody::Aggregate(aggregate) => {
                SnapshotBody::Aggregate(AggregateFlowStatistics {
                    packet_count: aggregate.packet_count,
                    byte_count: aggregate.byte_count,
                    flow_count: aggregate.flow_count,
                })
            }
            MultipartReplyBody::Table(tables) => SnapshotBody::Table(
                tables
                    .iter()
                    .map(|table| FlowTableStatistics {
                        table_id: table.table_id,
                        active_flows: table.active_count,
                        packets_looked_up: table.lookup_count,
                        packets_matched: table.matched_count,
                    })
                    .collect(),
            ),
            MultipartReplyBody::PortStats(ports) => SnapshotBody::Port(
                ports
                    .iter()
                    .map(|port| NodeConnectorStatistics {
                        node_connector_id: self.convertor.node_connector_id(port.port_no, &data),
                        port_no: port.port_no,
                        packets: Counters {
                            received: port.rx_packets,
                            transmitted: port.tx_packets,
                        },
                        bytes: Counters {
                            received: port.rx_bytes,
                            transmitted: port.tx_bytes,
                        },
                        receive_drops: port.rx_dropped,
                        transmit_drops: port.tx_dropped,
                        receive_errors: port.rx_errors,
                        transmit_errors: port.tx_errors,
                        receive_frame_error: port.rx_frame_err,
                        receive_over_run_error: port.rx_over_err,
                        receive_crc_error: port.rx_crc_err,
                        collision_count: port.collisions,
                        duration: port.duration_sec.map(|second| {
                            StatsDuration::new(second, port.duration_nsec.unwrap_or_default())
                        }),
                    })
                    .collect(),
            ),
            MultipartReplyBody::Queue(queues) => SnapshotBody::Queue(
                queues
                    .iter()
                    .map(|queue| QueueStatistics {
                        node_connector_id: self.convertor.node_connector_id(queue.port_no, &data),
                        port_no: queue.port_no,
                        queue_id: queue.queue_id,
                        transmitted_bytes: queue.tx_bytes,
                        transmitted_packets: queue.tx_packets,
                        transmission_errors: queue.tx_errors,
                        duration: StatsDuration::new(queue.duration_sec, queue.duration_nsec),
                    })
                    .collect(),
            ),
            MultipartReplyBody::Group(groups) => SnapshotBody::Group(
                groups
                    .iter()
                    .map(|group| GroupStatistics {
                        group_id: group.group_id,
                        ref_count: group.ref_count,
                        packet_count: group.packet_count,
                        byte_count: group.byte_count,
                        duration: StatsDuration::new(group.duration_sec, group.duration_nsec),
                        buckets: group
                            .bucket_stats
                            .iter()
                            .enumerate()
                            .map(|(bucket_id, bucket)| BucketStatistics {
                                bucket_id: bucket_id as u32,
                                packet_count: bucket.packet_count,
                                byte_count: bucket.byte_count,
                            })
                            .collect(),
                    })
                    .collect(),
            ),
            MultipartReplyBody::GroupDesc(groups) => {
                let groups = self.convertor.convert_group_desc(groups, &data).ok_or_else(|| {
                    malformed("OFPMPGROUPDESC", "group description has an unknown group type")
                })?;
                SnapshotBody::GroupDesc(groups)
            }
            MultipartReplyBody::GroupFeatures(features) => {
                SnapshotBody::GroupFeatures(GroupFeatures {
                    group_types: group_types(&features.types),
                    capabilities: group_capabilities(&features.capabilities),
                    max_groups: features.max_groups.clone(),
                    actions: features
                        .actions_bitmap
                        .iter()
                        .map(group_action_support)
                        .collect(),
                })
            }
            MultipartReplyBody::Meter(meters) => SnapshotBody::Meter(
                meters
                    .iter()
                    .map(|meter| MeterStatistics {
                        meter_id: meter.meter_id,
                        flow_count: meter.flow_count,
                        packet_in_count: meter.packet_in_count,
                        byte_in_count: meter.byte_in_count,
                        duration: StatsDuration::new(meter.duration_sec, meter.duration_nsec),
                        band_stats: meter
                            .band_stats
                            .iter()
                            .enumerate()
                            .map(|(band_id, band)| BandStatistics {
                                band_id: band_id as u32,
                                packet_band_count: band.packet_band_count,
                                byte_band_count: band.byte_band_count,
                            })
                            .collect(),
                    })
                    .collect(),
            ),
            MultipartReplyBody::MeterConfig(configs) => {
                let configs = self
                    .convertor
                    .convert_meter_config(configs, &data)
                    .ok_or_else(|| {
                        malformed("OFPMPMETERCONFIG", "meter config could not be converted")
                    })?;
                SnapshotBody::MeterConfig(configs)
            }
            MultipartReplyBody::MeterFeatures(features) => {
                SnapshotBody::MeterFeatures(MeterFeatures {
                    max_meter: features.max_meter,
                    max_bands: features.max_bands,
                    max_color: features.max_color,
                    capabilities: meter_capabilities(&features.capabilities),
                    band_types: meter_band_kinds(&features.band_types),
                })
            }
            MultipartReplyBody::Desc(_)
            | MultipartReplyBody::TableFeatures(_)
            | MultipartReplyBody::PortDesc(_)
            | MultipartReplyBody::Experimenter { .. }
            | MultipartReplyBody::Unknown { .. } => {
                debug!(
                    "No statistics in {} reply from {datapath_id}",
                    reply
                        .body
                        .multipart_type()
                        .map(|multipart_type| multipart_type.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                );
                return Ok(None);
            }
        };

        Ok(Some(StatisticsSnapshot {
            datapath_id,
            xid: reply.xid,
            body,
        }))
    }
}

fn malformed(multipart_type: &'static str, reason: &str) -> TranslateError {
    TranslateError::Malformed {
        multipart_type,
        reason: reason.to_string(),
    }
}

pub fn group_action_support(bitmap: &ActionTypeBitmap) -> GroupActionSupport {
    let mut support = GroupActionSupport::empty();
    support.set(GroupActionSupport::OUTPUT, bitmap.output);
    support.set(GroupActionSupport::COPY_TTL_OUT, bitmap.copy_ttl_out);
    support.set(GroupActionSupport::COPY_TTL_IN, bitmap.copy_ttl_in);
    support.set(GroupActionSupport::SET_MPLS_TTL, bitmap.set_mpls_ttl);
    support.set(GroupActionSupport::DEC_MPLS_TTL, bitmap.dec_mpls_ttl);
    support.set(GroupActionSupport::PUSH_VLAN, bitmap.push_vlan);
    support.set(GroupActionSupport::POP_VLAN, bitmap.pop_vlan);
    support.set(GroupActionSupport::PUSH_MPLS, bitmap.push_mpls);
    support.set(GroupActionSupport::POP_MPLS, bitmap.pop_mpls);
    support.set(GroupActionSupport::SET_QUEUE, bitmap.set_queue);
    support.set(GroupActionSupport::GROUP, bitmap.group);
    support.set(GroupActionSupport::SET_NW_TTL, bitmap.set_nw_ttl);
    support.set(GroupActionSupport::DEC_NW_TTL, bitmap.dec_nw_ttl);
    support.set(GroupActionSupport::SET_FIELD, bitmap.set_field);
    support.set(GroupActionSupport::PUSH_PBB, bitmap.push_pbb);
    support.set(GroupActionSupport::POP_PBB, bitmap.pop_pbb);
    support
}

fn group_types(types: &GroupTypesBitmap) -> Vec<GroupType> {
    [
        (types.all, GroupType::All),
        (types.select, GroupType::Select),
        (types.indirect, GroupType::Indirect),
        (types.ff, GroupType::FastFailover),
    ]
    .into_iter()
    .filter_map(|(supported, group_type)| supported.then_some(group_type))
    .collect()
}

fn group_capabilities(capabilities: &GroupCapabilitiesBitmap) -> Vec<GroupCapability> {
    [
        (capabilities.chaining, GroupCapability::Chaining),
        (capabilities.chaining_checks, GroupCapability::ChainingChecks),
        (capabilities.select_liveness, GroupCapability::SelectLiveness),
        (capabilities.select_weight, GroupCapability::SelectWeight),
    ]
    .into_iter()
    .filter_map(|(supported, capability)| supported.then_some(capability))
    .collect()
}

fn meter_capabilities(flags: &MeterFlagsBitmap) -> Vec<MeterCapability> {
    [
        (flags.burst, MeterCapability::Burst),
        (flags.kbps, MeterCapability::Kbps),
        (flags.pktps, MeterCapability::Pktps),
        (flags.stats, MeterCapability::Stats),
    ]
    .into_iter()
    .filter_map(|(supported, capability)| supported.then_some(capability))
    .collect()
}

fn meter_band_kinds(band_types: &MeterBandTypeBitmap) -> Vec<MeterBandKind> {
    [
        (band_types.drop, MeterBandKind::Drop),
        (band_types.dscp_remark, MeterBandKind::DscpRemark),
    ]
    .into_iter()
    .filter_map(|(supported, kind)| supported.then_some(kind))
    .collect()
}
