/*
 * Copyright (c) 2022 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::mem::swap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use serde::{Serialize, Serializer};

use super::endpoint::EndpointInfo;
use super::enums::{IpProtocol, TcpFlags};
use super::platform_data::{GeoInfo, PlatformData};
use super::{timestamp_to_micros, Timestamp};
use crate::flow_generator::FlowState;

#[derive(Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CloseType {
    Unknown = 0,
    TcpFin = 1,                 //  1: 正常结束
    TcpServerRst = 2,           //  2: 传输-服务端重置
    Timeout = 3,                //  3: 连接超时
    ForcedReport = 5,           //  5: 周期性上报
    ClientSynRepeat = 7,        //  7: 建连-客户端SYN结束
    ServerHalfClose = 8,        //  8: 断连-服务端半关
    TcpClientRst = 9,           //  9: 传输-客户端重置
    ServerSynAckRepeat = 10,    // 10: 建连-服务端SYN结束
    ClientHalfClose = 11,       // 11: 断连-客户端半关
    ClientSourcePortReuse = 13, // 13: 建连-客户端端口复用
    ServerReset = 15,           // 15: 建连-服务端直接重置
    ServerQueueLack = 17,       // 17: 传输-服务端队列溢出
    ClientEstablishReset = 18,  // 18: 建连-客户端其他重置
    ServerEstablishReset = 19,  // 19: 建连-服务端其他重置
    TcpFinClientRst = 20,       // 20: 正常结束-客户端重置
    Evicted = 21,               // 21: 流表容量不足被淘汰
    Max = 22,
}

impl CloseType {
    // tick records leave the flow in the table
    pub fn is_terminal(self) -> bool {
        self != CloseType::ForcedReport
    }
}

impl Default for CloseType {
    fn default() -> Self {
        CloseType::Unknown
    }
}

#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct FlowKey {
    pub ip_src: IpAddr,
    pub ip_dst: IpAddr,
    pub port_src: u16,
    pub port_dst: u16,
    #[serde(rename = "protocol")]
    pub proto: IpProtocol,
}

impl FlowKey {
    pub fn reverse(&mut self) {
        swap(&mut self.ip_src, &mut self.ip_dst);
        swap(&mut self.port_src, &mut self.port_dst);
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        FlowKey {
            ip_src: Ipv4Addr::UNSPECIFIED.into(),
            ip_dst: Ipv4Addr::UNSPECIFIED.into(),
            port_src: 0,
            port_dst: 0,
            proto: IpProtocol::default(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip_src:{} ip_dst:{} proto:{} port_src:{} port_dst:{}",
            self.ip_src, self.ip_dst, self.proto, self.port_src, self.port_dst
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowMetricsPeer {
    pub byte_count: u64,         // 每个上报周期清零
    pub packet_count: u64,       // 每个上报周期清零
    pub tick_byte_count: u64,    // 每次tick输出后清零
    pub tick_packet_count: u64,  // 每次tick输出后清零
    pub total_byte_count: u64,   // 整个Flow生命周期的统计量
    pub total_packet_count: u64, // 整个Flow生命周期的统计量
    pub first: Timestamp,        // 整个Flow生命周期首包的时间戳
    pub last: Timestamp,         // 整个Flow生命周期尾包的时间戳

    pub l3_epc_id: i32,
    pub is_l2_end: bool,
    pub is_l3_end: bool,
    pub is_device: bool,
    pub is_local_ip: bool,
    pub tcp_flags: TcpFlags,       // 每个tick内TCP Flags的或运算结果
    pub total_tcp_flags: TcpFlags, // 整个Flow生命周期的TCP的Flags的或运算结果

    pub region_id: u32,
    pub subnet_id: u32,
    pub pod_id: u32,
    pub geo: Option<Arc<GeoInfo>>,
}

impl FlowMetricsPeer {
    pub const SRC: u8 = 0;
    pub const DST: u8 = 1;

    pub fn update_endpoint_info(&mut self, info: &EndpointInfo) {
        self.l3_epc_id = info.l3_epc_id;
        self.is_l2_end = info.l2_end;
        self.is_l3_end = info.l3_end;
        self.is_device = info.is_device;
        self.is_local_ip = info.is_local_ip;
    }

    // l3_epc_id参与流匹配，不随平台信息改变
    pub fn update_platform_data(&mut self, data: &PlatformData) {
        self.region_id = data.region_id;
        self.subnet_id = data.subnet_id;
        self.pod_id = data.pod_id;
        self.is_device = true;
        self.is_local_ip = data.is_local;
    }

    pub fn reset_interval(&mut self) {
        self.packet_count = 0;
        self.byte_count = 0;
    }

    pub fn reset_tick(&mut self) {
        self.tick_packet_count = 0;
        self.tick_byte_count = 0;
        self.tcp_flags = TcpFlags::empty();
    }
}

pub fn serialize_flow_metrics<S>(v: &[FlowMetricsPeer; 2], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    #[derive(Serialize)]
    struct Ser<'a> {
        byte_tx: u64,
        byte_rx: u64,
        packet_tx: u64,
        packet_rx: u64,
        tick_byte_tx: u64,
        tick_byte_rx: u64,
        tick_packet_tx: u64,
        tick_packet_rx: u64,
        total_byte_tx: u64,
        total_byte_rx: u64,
        total_packet_tx: u64,
        total_packet_rx: u64,
        l3_epc_id_0: i32,
        l3_epc_id_1: i32,
        l2_end_0: bool,
        l2_end_1: bool,
        l3_end_0: bool,
        l3_end_1: bool,
        region_id_0: u32,
        region_id_1: u32,
        subnet_id_0: u32,
        subnet_id_1: u32,
        pod_id_0: u32,
        pod_id_1: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        geo_0: Option<&'a GeoInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        geo_1: Option<&'a GeoInfo>,
        tcp_flags_bit_0: TcpFlags,
        tcp_flags_bit_1: TcpFlags,
    }
    let s = Ser {
        byte_tx: v[0].byte_count,
        byte_rx: v[1].byte_count,
        packet_tx: v[0].packet_count,
        packet_rx: v[1].packet_count,
        tick_byte_tx: v[0].tick_byte_count,
        tick_byte_rx: v[1].tick_byte_count,
        tick_packet_tx: v[0].tick_packet_count,
        tick_packet_rx: v[1].tick_packet_count,
        total_byte_tx: v[0].total_byte_count,
        total_byte_rx: v[1].total_byte_count,
        total_packet_tx: v[0].total_packet_count,
        total_packet_rx: v[1].total_packet_count,
        l3_epc_id_0: v[0].l3_epc_id,
        l3_epc_id_1: v[1].l3_epc_id,
        l2_end_0: v[0].is_l2_end,
        l2_end_1: v[1].is_l2_end,
        l3_end_0: v[0].is_l3_end,
        l3_end_1: v[1].is_l3_end,
        region_id_0: v[0].region_id,
        region_id_1: v[1].region_id,
        subnet_id_0: v[0].subnet_id,
        subnet_id_1: v[1].subnet_id,
        pod_id_0: v[0].pod_id,
        pod_id_1: v[1].pod_id,
        geo_0: v[0].geo.as_deref(),
        geo_1: v[1].geo.as_deref(),
        tcp_flags_bit_0: v[0].tcp_flags,
        tcp_flags_bit_1: v[1].tcp_flags,
    };
    serializer.serialize_newtype_struct("flow_metrics", &s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketDirection {
    ClientToServer = FlowMetricsPeer::SRC,
    ServerToClient = FlowMetricsPeer::DST,
}

impl PacketDirection {
    pub fn reversed(&self) -> Self {
        match self {
            PacketDirection::ClientToServer => PacketDirection::ServerToClient,
            PacketDirection::ServerToClient => PacketDirection::ClientToServer,
        }
    }
}

impl Default for PacketDirection {
    fn default() -> PacketDirection {
        PacketDirection::ClientToServer
    }
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToServer => write!(f, "c2s"),
            Self::ServerToClient => write!(f, "s2c"),
        }
    }
}

#[derive(Serialize, Default, Clone, Debug)]
pub struct Flow {
    #[serde(flatten)]
    pub flow_key: FlowKey,
    #[serde(flatten, serialize_with = "serialize_flow_metrics")]
    pub flow_metrics_peers: [FlowMetricsPeer; 2],

    pub flow_id: u64,

    #[serde(serialize_with = "timestamp_to_micros")]
    pub start_time: Timestamp,
    #[serde(serialize_with = "timestamp_to_micros")]
    pub end_time: Timestamp,
    #[serde(serialize_with = "timestamp_to_micros")]
    pub duration: Timestamp,

    #[serde(skip)]
    pub flow_stat_time: Timestamp,

    pub close_type: CloseType,
    pub is_active_service: bool,
    pub is_new_flow: bool,
    pub reversed: bool,
}

impl Flow {
    // 交换SRC/DST两侧的统计数据，不重新计算
    pub fn reverse(&mut self) {
        self.reversed = !self.reversed;
        self.flow_key.reverse();
        self.flow_metrics_peers.swap(0, 1);
    }

    fn is_heartbeat(&self) -> bool {
        let src_tcp_flags = &self.flow_metrics_peers[FlowMetricsPeer::SRC as usize].total_tcp_flags;
        let dst_tcp_flags = &self.flow_metrics_peers[FlowMetricsPeer::DST as usize].total_tcp_flags;

        if src_tcp_flags.contains(TcpFlags::PSH) || dst_tcp_flags.contains(TcpFlags::PSH) {
            return false;
        }

        // Sender:    Client                   Server
        // TCP Flags: SYN
        //                                     SYN-ACK
        //            [ACK]
        //            RST|RST-ACK
        src_tcp_flags.contains(TcpFlags::SYN | TcpFlags::RST)
            && dst_tcp_flags.contains(TcpFlags::SYN_ACK)
    }

    fn server_sent_rst(&self) -> bool {
        self.flow_metrics_peers[FlowMetricsPeer::DST as usize]
            .total_tcp_flags
            .contains(TcpFlags::RST)
    }

    pub fn update_close_type(&mut self, flow_state: FlowState) {
        self.close_type = match flow_state {
            FlowState::Raw | FlowState::Exception | FlowState::Max => CloseType::Unknown,
            FlowState::Opening1 => CloseType::ClientSynRepeat,
            FlowState::Opening2 => CloseType::ServerSynAckRepeat,
            FlowState::Established => CloseType::Timeout,
            FlowState::ClosingTx1 => CloseType::ServerHalfClose,
            FlowState::ClosingRx1 => CloseType::ClientHalfClose,
            FlowState::ClosingTx2 | FlowState::ClosingRx2 | FlowState::Closed => CloseType::TcpFin,
            FlowState::Reset if self.is_heartbeat() => CloseType::TcpFinClientRst,
            FlowState::Reset if self.server_sent_rst() => CloseType::TcpServerRst,
            FlowState::Reset => CloseType::TcpClientRst,
            FlowState::Syn1 | FlowState::ClientL4PortReuse if self.is_heartbeat() => {
                CloseType::TcpFinClientRst
            }
            FlowState::Syn1 | FlowState::ClientL4PortReuse => CloseType::ClientSourcePortReuse,
            FlowState::ServerReset => CloseType::ServerReset,
            FlowState::SynAck1 => CloseType::ServerQueueLack,
            FlowState::ServerCandidateQueueLack
                if self.flow_metrics_peers[FlowMetricsPeer::DST as usize].total_packet_count
                    > 3 =>
            {
                CloseType::ServerQueueLack
            }
            FlowState::ServerCandidateQueueLack => CloseType::TcpClientRst,
            FlowState::EstablishReset | FlowState::OpeningRst if self.is_heartbeat() => {
                CloseType::TcpFinClientRst
            }
            FlowState::EstablishReset | FlowState::OpeningRst if self.server_sent_rst() => {
                CloseType::ServerEstablishReset
            }
            FlowState::EstablishReset | FlowState::OpeningRst => CloseType::ClientEstablishReset,
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow_id:{} {} close_type:{:?} reversed:{} is_active_service:{}\n\t src: {:?}\n\t dst: {:?}",
            self.flow_id,
            self.flow_key,
            self.close_type,
            self.reversed,
            self.is_active_service,
            self.flow_metrics_peers[0],
            self.flow_metrics_peers[1]
        )
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn flow_with_counts(src: (u64, u64), dst: (u64, u64)) -> Flow {
        let mut flow = Flow {
            flow_key: FlowKey {
                ip_src: Ipv4Addr::new(10, 0, 0, 1).into(),
                ip_dst: Ipv4Addr::new(10, 0, 0, 2).into(),
                port_src: 40000,
                port_dst: 53,
                proto: IpProtocol::Udp,
            },
            ..Default::default()
        };
        let peers = &mut flow.flow_metrics_peers;
        peers[0].total_packet_count = src.0;
        peers[0].total_byte_count = src.1;
        peers[1].total_packet_count = dst.0;
        peers[1].total_byte_count = dst.1;
        flow
    }

    #[test]
    fn reverse_swaps_counters() {
        let mut flow = flow_with_counts((5, 500), (2, 200));
        flow.reverse();

        let peers = &flow.flow_metrics_peers;
        assert_eq!((peers[0].total_packet_count, peers[0].total_byte_count), (2, 200));
        assert_eq!((peers[1].total_packet_count, peers[1].total_byte_count), (5, 500));
        assert_eq!(flow.flow_key.port_src, 53);
        assert_eq!(flow.flow_key.ip_dst, IpAddr::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(flow.reversed);

        flow.reverse();
        assert!(!flow.reversed);
        assert_eq!(flow.flow_metrics_peers[0].total_packet_count, 5);
    }

    #[test]
    fn close_type_from_state() {
        let mut flow = flow_with_counts((1, 64), (1, 64));
        flow.update_close_type(FlowState::Established);
        assert_eq!(flow.close_type, CloseType::Timeout);
        flow.update_close_type(FlowState::Closed);
        assert_eq!(flow.close_type, CloseType::TcpFin);
        flow.update_close_type(FlowState::Reset);
        assert_eq!(flow.close_type, CloseType::TcpClientRst);

        flow.flow_metrics_peers[1].total_tcp_flags = TcpFlags::RST_ACK;
        flow.update_close_type(FlowState::Reset);
        assert_eq!(flow.close_type, CloseType::TcpServerRst);

        flow.flow_metrics_peers[0].total_tcp_flags = TcpFlags::SYN | TcpFlags::RST;
        flow.flow_metrics_peers[1].total_tcp_flags = TcpFlags::SYN_ACK;
        flow.update_close_type(FlowState::Reset);
        assert_eq!(flow.close_type, CloseType::TcpFinClientRst);
    }

    #[test]
    fn tick_reset_keeps_totals() {
        let mut peer = FlowMetricsPeer {
            tick_packet_count: 3,
            tick_byte_count: 300,
            total_packet_count: 9,
            total_byte_count: 900,
            tcp_flags: TcpFlags::ACK,
            ..Default::default()
        };
        peer.reset_tick();
        assert_eq!((peer.tick_packet_count, peer.tick_byte_count), (0, 0));
        assert_eq!((peer.total_packet_count, peer.total_byte_count), (9, 900));
        assert!(peer.tcp_flags.is_empty());
    }

    #[test]
    fn serialize_flat_json() {
        let flow = flow_with_counts((5, 500), (2, 200));
        let v = serde_json::to_value(&flow).unwrap();
        assert_eq!(v["protocol"], 17);
        assert_eq!(v["port_dst"], 53);
        assert_eq!(v["total_packet_tx"], 5);
        assert_eq!(v["total_byte_rx"], 200);
        assert_eq!(v["close_type"], "Unknown");
        assert!(v.get("geo_0").is_none());
        assert!(v.get("flow_stat_time").is_none());
    }
}
