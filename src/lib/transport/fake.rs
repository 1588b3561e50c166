use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::*;

use crate::{
    device::{Capabilities, ConnectionState, DatapathId, DeviceInfo, Xid},
    error::RequestError,
    protocol::*,
    transport::{InboundMessage, Transport},
};

/// `ofp_error_type` OFPET_BAD_REQUEST, code OFPBRC_BAD_MULTIPART.
const BAD_REQUEST: u16 = 1;
const BAD_MULTIPART: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFlow {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub match_fields: Vec<MatchField>,
}

impl FakeFlow {
    pub fn new(table_id: u8, priority: u16, cookie: u64) -> Self {
        Self {
            table_id,
            priority,
            cookie,
            match_fields: vec![MatchField {
                field: MatchFieldType::InPort,
                value: u64::from(priority),
                mask: None,
            }],
        }
    }
}

#[derive(Debug, Default)]
struct FakeSwitchState {
    flows: Vec<FakeFlow>,
    groups: Vec<u32>,
    meters: Vec<u32>,
    ports: Vec<u32>,
    queues: Vec<(u32, u32)>,
    tables: u8,
    failing: HashSet<MultipartType>,
    silent: HashSet<MultipartType>,
    reply_delay: Duration,
    reply_parts: usize,
    connection_state: Option<ConnectionState>,
    requests_seen: Vec<MultipartType>,
    tick: u64,
}

/// In-process switch answering multipart requests with deterministic counters.
pub struct FakeSwitch {
    info: DeviceInfo,
    sender: broadcast::Sender<Arc<InboundMessage>>,
    state: Arc<Mutex<FakeSwitchState>>,
}

impl std::fmt::Debug for FakeSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeSwitch")
            .field("info", &self.info)
            .finish()
    }
}

impl FakeSwitch {
    pub fn builder(datapath_id: DatapathId) -> FakeSwitchBuilder {
        let (sender, _) = broadcast::channel(1024);

        FakeSwitchBuilder(Self {
            info: DeviceInfo {
                datapath_id,
                version: OfVersion::V13,
                capabilities: Capabilities::FLOW_STATS
                    | Capabilities::TABLE_STATS
                    | Capabilities::PORT_STATS
                    | Capabilities::GROUP_STATS
                    | Capabilities::QUEUE_STATS,
                meters_available: true,
            },
            sender,
            state: Arc::new(Mutex::new(FakeSwitchState {
                ports: vec![1, 2],
                queues: vec![(1, 0)],
                tables: 2,
                reply_parts: 1,
                connection_state: Some(ConnectionState::Working),
                ..Default::default()
            })),
        })
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn state(&self) -> MutexGuard<'_, FakeSwitchState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_flows(&self, flows: Vec<FakeFlow>) {
        self.state().flows = flows;
    }

    pub fn set_groups(&self, groups: Vec<u32>) {
        self.state().groups = groups;
    }

    pub fn set_meters(&self, meters: Vec<u32>) {
        self.state().meters = meters;
    }

    pub fn set_ports(&self, ports: Vec<u32>) {
        self.state().ports = ports;
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        self.state().reply_delay = delay;
    }

    pub fn fail_category(&self, multipart_type: MultipartType, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing.insert(multipart_type);
        } else {
            state.failing.remove(&multipart_type);
        }
    }

    pub fn silence_category(&self, multipart_type: MultipartType, silent: bool) {
        let mut state = self.state();
        if silent {
            state.silent.insert(multipart_type);
        } else {
            state.silent.remove(&multipart_type);
        }
    }

    pub fn set_connection_state(&self, connection_state: ConnectionState) {
        self.state().connection_state = Some(connection_state);
    }

    /// Drops the connection and tells every subscriber about it.
    pub fn disconnect(&self) {
        self.set_connection_state(ConnectionState::Rip);
        let _ = self.sender.send(Arc::new(InboundMessage::Disconnected));
    }

    pub fn requests_seen(&self) -> Vec<MultipartType> {
        self.state().requests_seen.clone()
    }

    fn build_replies(&self, request: &MultipartRequest, state: &mut FakeSwitchState) -> Vec<InboundMessage> {
        let multipart_type = request.multipart_type();
        state.tick += 1;
        let tick = state.tick;
        let version = self.info.version;

        let chunks = |len: usize| -> usize { len.div_ceil(state.reply_parts.max(1)).max(1) };

        let bodies: Vec<MultipartReplyBody> = match multipart_type {
            MultipartType::Flow => {
                let flows: Vec<FlowStats> = state
                    .flows
                    .iter()
                    .map(|flow| fake_flow_stats(flow, version, tick))
                    .collect();
                let size = chunks(flows.len());
                split(flows, size, MultipartReplyBody::Flow)
            }
            MultipartType::Aggregate => vec![MultipartReplyBody::Aggregate(AggregateReply {
                packet_count: tick * 10 * state.flows.len() as u64,
                byte_count: tick * 640 * state.flows.len() as u64,
                flow_count: state.flows.len() as u32,
            })],
            MultipartType::Table => {
                let tables: Vec<TableStats> = (0..state.tables)
                    .map(|table_id| TableStats {
                        table_id,
                        active_count: state
                            .flows
                            .iter()
                            .filter(|flow| flow.table_id == table_id)
                            .count() as u32,
                        lookup_count: tick * 100,
                        matched_count: tick * 90,
                    })
                    .collect();
                let size = chunks(tables.len());
                split(tables, size, MultipartReplyBody::Table)
            }
            MultipartType::PortStats => {
                let ports: Vec<PortStats> = state
                    .ports
                    .iter()
                    .map(|&port_no| fake_port_stats(port_no, version, tick))
                    .collect();
                let size = chunks(ports.len());
                split(ports, size, MultipartReplyBody::PortStats)
            }
            MultipartType::Queue => {
                let queues: Vec<QueueStats> = state
                    .queues
                    .iter()
                    .map(|&(port_no, queue_id)| QueueStats {
                        port_no,
                        queue_id,
                        tx_bytes: tick * 1500,
                        tx_packets: tick,
                        tx_errors: 0,
                        duration_sec: tick as u32,
                        duration_nsec: 0,
                    })
                    .collect();
                let size = chunks(queues.len());
                split(queues, size, MultipartReplyBody::Queue)
            }
            MultipartType::Group => {
                let groups: Vec<GroupStats> = state
                    .groups
                    .iter()
                    .map(|&group_id| GroupStats {
                        group_id,
                        ref_count: 1,
                        packet_count: tick * 5,
                        byte_count: tick * 320,
                        duration_sec: tick as u32,
                        duration_nsec: 0,
                        bucket_stats: vec![BucketCounter {
                            packet_count: tick * 5,
                            byte_count: tick * 320,
                        }],
                    })
                    .collect();
                let size = chunks(groups.len());
                split(groups, size, MultipartReplyBody::Group)
            }
            MultipartType::GroupDesc => {
                let groups: Vec<GroupDesc> = state
                    .groups
                    .iter()
                    .map(|&group_id| GroupDesc {
                        group_id,
                        group_type: OFPGT_ALL,
                        buckets: vec![Bucket {
                            weight: 0,
                            watch_port: OFPP_ANY,
                            watch_group: OFPG_ALL,
                            actions: vec![Action::Output {
                                port: 1,
                                max_len: 0xffff,
                            }],
                        }],
                    })
                    .collect();
                let size = chunks(groups.len());
                split(groups, size, MultipartReplyBody::GroupDesc)
            }
            MultipartType::GroupFeatures => {
                vec![MultipartReplyBody::GroupFeatures(GroupFeaturesReply {
                    types: GroupTypesBitmap {
                        all: true,
                        select: true,
                        indirect: true,
                        ff: true,
                    },
                    capabilities: GroupCapabilitiesBitmap {
                        chaining: true,
                        ..Default::default()
                    },
                    max_groups: vec![64, 64, 64, 64],
                    actions_bitmap: vec![ActionTypeBitmap::all(); 4],
                })]
            }
            MultipartType::Meter => {
                let meters: Vec<MeterStats> = state
                    .meters
                    .iter()
                    .map(|&meter_id| MeterStats {
                        meter_id,
                        flow_count: 1,
                        packet_in_count: tick * 3,
                        byte_in_count: tick * 192,
                        duration_sec: tick as u32,
                        duration_nsec: 0,
                        band_stats: vec![BandCounter::default()],
                    })
                    .collect();
                let size = chunks(meters.len());
                split(meters, size, MultipartReplyBody::Meter)
            }
            MultipartType::MeterConfig => {
                let meters: Vec<MeterConfig> = state
                    .meters
                    .iter()
                    .map(|&meter_id| MeterConfig {
                        flags: MeterFlagsBitmap {
                            kbps: true,
                            ..Default::default()
                        },
                        meter_id,
                        bands: vec![MeterBandEntry::Drop {
                            rate: 1000,
                            burst_size: 100,
                        }],
                    })
                    .collect();
                let size = chunks(meters.len());
                split(meters, size, MultipartReplyBody::MeterConfig)
            }
            MultipartType::MeterFeatures => {
                vec![MultipartReplyBody::MeterFeatures(MeterFeaturesReply {
                    max_meter: 256,
                    band_types: MeterBandTypeBitmap {
                        drop: true,
                        dscp_remark: true,
                    },
                    capabilities: MeterFlagsBitmap {
                        kbps: true,
                        pktps: true,
                        burst: false,
                        stats: true,
                    },
                    max_bands: 4,
                    max_color: 2,
                })]
            }
            MultipartType::Desc => vec![MultipartReplyBody::Desc(DescReply {
                manufacturer: "Fake".to_string(),
                hardware: "FakeSwitch".to_string(),
                software: env!("CARGO_PKG_VERSION").to_string(),
                serial_number: self.info.datapath_id.0.to_string(),
                datapath: self.info.datapath_id.node_id(),
            })],
            other => vec![MultipartReplyBody::Unknown {
                type_code: other.code(),
            }],
        };

        let last = bodies.len().saturating_sub(1);
        bodies
            .into_iter()
            .enumerate()
            .map(|(index, body)| {
                InboundMessage::MultipartReply(MultipartReply {
                    xid: request.xid,
                    version,
                    request_more: index != last,
                    body,
                })
            })
            .collect()
    }
}

fn split<T, F>(entries: Vec<T>, size: usize, wrap: F) -> Vec<MultipartReplyBody>
where
    T: Clone,
    F: Fn(Vec<T>) -> MultipartReplyBody,
{
    if entries.is_empty() {
        return vec![wrap(Vec::new())];
    }
    entries.chunks(size).map(|chunk| wrap(chunk.to_vec())).collect()
}

fn fake_flow_stats(flow: &FakeFlow, version: OfVersion, tick: u64) -> FlowStats {
    let output = Action::Output {
        port: 2,
        max_len: 0xffff,
    };
    let (instructions, actions) = match version {
        OfVersion::V13 => (vec![Instruction::ApplyActions(vec![output])], Vec::new()),
        OfVersion::V10 => (Vec::new(), vec![output]),
    };

    FlowStats {
        table_id: flow.table_id,
        duration_sec: tick as u32,
        duration_nsec: 0,
        priority: flow.priority,
        idle_timeout: 0,
        hard_timeout: 0,
        flags: 0,
        cookie: flow.cookie,
        packet_count: tick * 10,
        byte_count: tick * 640,
        match_fields: flow.match_fields.clone(),
        instructions,
        actions,
    }
}

fn fake_port_stats(port_no: u32, version: OfVersion, tick: u64) -> PortStats {
    let duration = match version {
        OfVersion::V13 => Some(tick as u32),
        OfVersion::V10 => None,
    };

    PortStats {
        port_no,
        rx_packets: tick * 20,
        tx_packets: tick * 21,
        rx_bytes: tick * 1280,
        tx_bytes: tick * 1344,
        duration_sec: duration,
        duration_nsec: duration.map(|_| 0),
        ..Default::default()
    }
}

pub struct FakeSwitchBuilder(FakeSwitch);

impl FakeSwitchBuilder {
    pub fn build(self) -> FakeSwitch {
        self.0
    }

    pub fn version(mut self, version: OfVersion) -> Self {
        self.0.info.version = version;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.0.info.capabilities = capabilities;
        self
    }

    pub fn meters_available(mut self, meters_available: bool) -> Self {
        self.0.info.meters_available = meters_available;
        self
    }

    pub fn flows(self, flows: Vec<FakeFlow>) -> Self {
        self.0.set_flows(flows);
        self
    }

    pub fn groups(self, groups: Vec<u32>) -> Self {
        self.0.set_groups(groups);
        self
    }

    pub fn meters(self, meters: Vec<u32>) -> Self {
        self.0.set_meters(meters);
        self
    }

    pub fn ports(self, ports: Vec<u32>) -> Self {
        self.0.set_ports(ports);
        self
    }

    pub fn reply_delay(self, delay: Duration) -> Self {
        self.0.set_reply_delay(delay);
        self
    }

    /// Splits every repeated reply over up to `parts` messages.
    pub fn reply_parts(self, parts: usize) -> Self {
        self.0.state().reply_parts = parts.max(1);
        self
    }

    pub fn failing(self, multipart_type: MultipartType) -> Self {
        self.0.fail_category(multipart_type, true);
        self
    }

    pub fn silent(self, multipart_type: MultipartType) -> Self {
        self.0.silence_category(multipart_type, true);
        self
    }
}

#[async_trait::async_trait]
impl Transport for FakeSwitch {
    #[instrument(level = "trace", skip(self, request), fields(dpid = %self.info.datapath_id, xid = %request.xid))]
    async fn send_multipart_request(&self, request: MultipartRequest) -> Result<(), RequestError> {
        let multipart_type = request.multipart_type();

        let (messages, delay) = {
            let mut state = self.state();
            if state.connection_state == Some(ConnectionState::Rip) {
                return Err(RequestError::Closed);
            }
            state.requests_seen.push(multipart_type);

            if state.silent.contains(&multipart_type) {
                trace!("Not answering {multipart_type}");
                return Ok(());
            }

            let messages = if state.failing.contains(&multipart_type) {
                vec![InboundMessage::Error {
                    xid: request.xid,
                    error_type: BAD_REQUEST,
                    code: BAD_MULTIPART,
                }]
            } else {
                self.build_replies(&request, &mut state)
            };

            (messages, state.reply_delay)
        };

        if delay.is_zero() {
            publish(&self.sender, messages);
            return Ok(());
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            publish(&sender, messages);
        });

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<InboundMessage>> {
        self.sender.subscribe()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state()
            .connection_state
            .unwrap_or(ConnectionState::Handshaking)
    }

    fn shutdown_connection(&self) {
        debug!("Shutting down fake connection of {}", self.info.datapath_id);
        self.disconnect();
    }
}

fn publish(sender: &broadcast::Sender<Arc<InboundMessage>>, messages: Vec<InboundMessage>) {
    for message in messages {
        if let Err(error) = sender.send(Arc::new(message)) {
            trace!("No one listening for fake replies: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_synchronously_in_parts() {
        let switch = FakeSwitch::builder(DatapathId(1))
            .flows((0..5).map(|n| FakeFlow::new(0, n, 0)).collect())
            .reply_parts(2)
            .build();
        let mut receiver = switch.subscribe();

        switch
            .send_multipart_request(MultipartRequest::all(Xid(3), MultipartType::Flow))
            .await
            .unwrap();

        let mut flows = 0;
        let mut parts = 0;
        while let Ok(message) = receiver.try_recv() {
            let InboundMessage::MultipartReply(reply) = message.as_ref() else {
                panic!("unexpected message {message:?}");
            };
            assert_eq!(reply.xid, Xid(3));
            parts += 1;
            if let MultipartReplyBody::Flow(entries) = &reply.body {
                flows += entries.len();
            }
            if !reply.request_more {
                break;
            }
        }
        assert_eq!(parts, 2);
        assert_eq!(flows, 5);
    }

    #[tokio::test]
    async fn failing_category_answers_with_error() {
        let switch = FakeSwitch::builder(DatapathId(1))
            .failing(MultipartType::Queue)
            .build();
        let mut receiver = switch.subscribe();

        switch
            .send_multipart_request(MultipartRequest::all(Xid(9), MultipartType::Queue))
            .await
            .unwrap();

        let message = receiver.try_recv().unwrap();
        assert!(matches!(
            message.as_ref(),
            InboundMessage::Error { xid: Xid(9), .. }
        ));
    }

    #[tokio::test]
    async fn disconnected_switch_refuses_requests() {
        let switch = FakeSwitch::builder(DatapathId(1)).build();
        switch.disconnect();

        let result = switch
            .send_multipart_request(MultipartRequest::all(Xid(1), MultipartType::Table))
            .await;
        assert_eq!(result, Err(RequestError::Closed));
        assert_eq!(switch.connection_state(), ConnectionState::Rip);
    }
}
