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

use std::net::IpAddr;
use std::time::Duration;

use super::{FlowState, FLOW_METRICS_PEER_DST, FLOW_METRICS_PEER_SRC};
use crate::common::{
    flow::PacketDirection, lookup_key::LookupKey, meta_packet::MetaPacket,
    tagged_flow::TaggedFlow, Timestamp,
};

/*
    FlowMapKey是流节点映射表的唯一标识，由IP对、端口对和协议对称地计算得到，
    同一条流的两个方向得到相同的key。不同的流可能碰撞到同一个key，
    需要根据流节点的match_node方法在映射表中唯一标识一条流。
*/
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
pub struct FlowMapKey {
    lhs: u64,
    rhs: u64,
}

impl FlowMapKey {
    fn fold_ip(ip: &IpAddr) -> u32 {
        match ip {
            IpAddr::V4(v4) => u32::from_le_bytes(v4.octets()),
            IpAddr::V6(v6) => v6
                .segments()
                .chunks(2)
                .fold(0, |hash, c| hash ^ ((c[0] as u32) << 16 | c[1] as u32)),
        }
    }

    fn l3_hash(lookup_key: &LookupKey) -> u64 {
        let (src, dst) = (
            Self::fold_ip(&lookup_key.src_ip),
            Self::fold_ip(&lookup_key.dst_ip),
        );
        if src >= dst {
            (src as u64) << 32 | dst as u64
        } else {
            (dst as u64) << 32 | src as u64
        }
    }

    fn l4_hash(lookup_key: &LookupKey) -> u64 {
        if lookup_key.src_port >= lookup_key.dst_port {
            (lookup_key.src_port as u64) << 16 | lookup_key.dst_port as u64
        } else {
            (lookup_key.dst_port as u64) << 16 | lookup_key.src_port as u64
        }
    }

    pub fn new(lookup_key: &LookupKey) -> Self {
        Self {
            lhs: Self::l3_hash(lookup_key),
            rhs: (u8::from(lookup_key.proto) as u64) << 32 | Self::l4_hash(lookup_key),
        }
    }

    pub fn fold(&self) -> u64 {
        self.lhs ^ self.rhs.rotate_left(17)
    }
}

#[derive(Default)]
pub struct FlowNode {
    pub tagged_flow: TaggedFlow,
    pub min_arrived_time: Timestamp,
    // 最近一个Packet的时间戳
    pub recent_time: Timestamp,
    // 相对超时时间
    pub timeout: Duration,
    // 用作time_set比对的标识，等于注册时间轮的秒数，只有创建FlowNode和刷新超时才会更新
    pub timestamp_key: u64,

    pub packet_in_tick: bool, // 当前统计周期（目前是自然秒）是否有包
    // 当前上报周期的起始时间
    pub report_time: Timestamp,
    pub flow_state: FlowState,
}

impl FlowNode {
    pub fn deadline(&self) -> Timestamp {
        self.recent_time + self.timeout
    }

    // tick输出之后调用
    pub(super) fn reset_flow_stat_info(&mut self) {
        self.packet_in_tick = false;
        let flow = &mut self.tagged_flow.flow;
        flow.flow_stat_time = Timestamp::ZERO;
        flow.is_new_flow = false;
        flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC].reset_tick();
        flow.flow_metrics_peers[FLOW_METRICS_PEER_DST].reset_tick();
    }

    // 报文进入新的上报周期时调用，清零周期计数
    pub(super) fn reset_report_interval(&mut self, report_time: Timestamp) {
        self.report_time = report_time;
        let flow = &mut self.tagged_flow.flow;
        flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC].reset_interval();
        flow.flow_metrics_peers[FLOW_METRICS_PEER_DST].reset_interval();
    }

    // 匹配成功时根据flow_key写入报文方向
    pub fn match_node(&self, meta_packet: &mut MetaPacket) -> bool {
        let flow = &self.tagged_flow.flow;
        let flow_key = &flow.flow_key;
        let lookup_key = &meta_packet.lookup_key;
        if flow_key.proto != lookup_key.proto {
            return false;
        }

        let direction = if flow_key.ip_src == lookup_key.src_ip
            && flow_key.ip_dst == lookup_key.dst_ip
            && flow_key.port_src == lookup_key.src_port
            && flow_key.port_dst == lookup_key.dst_port
        {
            PacketDirection::ClientToServer
        } else if flow_key.ip_src == lookup_key.dst_ip
            && flow_key.ip_dst == lookup_key.src_ip
            && flow_key.port_src == lookup_key.dst_port
            && flow_key.port_dst == lookup_key.src_port
        {
            PacketDirection::ServerToClient
        } else {
            return false;
        };

        // 相同五元组在不同VPC中是不同的流
        let (src_epc, dst_epc) = meta_packet.l3_epc_ids();
        let peers = &flow.flow_metrics_peers;
        let epc_match = match direction {
            PacketDirection::ClientToServer => {
                peers[FLOW_METRICS_PEER_SRC].l3_epc_id == src_epc
                    && peers[FLOW_METRICS_PEER_DST].l3_epc_id == dst_epc
            }
            PacketDirection::ServerToClient => {
                peers[FLOW_METRICS_PEER_SRC].l3_epc_id == dst_epc
                    && peers[FLOW_METRICS_PEER_DST].l3_epc_id == src_epc
            }
        };
        if epc_match {
            meta_packet.direction = direction;
        }
        epc_match
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    use super::*;
    use crate::common::endpoint::{EndpointData, EndpointInfo};
    use crate::common::enums::IpProtocol;
    use crate::common::flow::FlowKey;

    fn packet(src: (IpAddr, u16), dst: (IpAddr, u16), epc: (i32, i32)) -> MetaPacket {
        let mut p = MetaPacket::new(Timestamp::from_secs(1), src, dst, IpProtocol::Udp, 100);
        p.endpoint_data = Some(Arc::new(EndpointData::new(
            EndpointInfo::with_epc(epc.0),
            EndpointInfo::with_epc(epc.1),
        )));
        p
    }

    fn node_for(p: &MetaPacket) -> FlowNode {
        let mut node = FlowNode::default();
        let flow = &mut node.tagged_flow.flow;
        flow.flow_key = FlowKey {
            ip_src: p.lookup_key.src_ip,
            ip_dst: p.lookup_key.dst_ip,
            port_src: p.lookup_key.src_port,
            port_dst: p.lookup_key.dst_port,
            proto: p.lookup_key.proto,
        };
        let (src_epc, dst_epc) = p.l3_epc_ids();
        flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC].l3_epc_id = src_epc;
        flow.flow_metrics_peers[FLOW_METRICS_PEER_DST].l3_epc_id = dst_epc;
        node
    }

    #[test]
    fn flow_map_key_is_symmetric() {
        let a: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let b: IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();
        let p = packet((a, 1234), (b, 53), (1, 2));
        let r = packet((b, 53), (a, 1234), (2, 1));
        assert_eq!(FlowMapKey::new(&p.lookup_key), FlowMapKey::new(&r.lookup_key));

        let v6a: IpAddr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1).into();
        let v6b: IpAddr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2).into();
        let p = packet((v6a, 1234), (v6b, 53), (1, 2));
        let r = packet((v6b, 53), (v6a, 1234), (2, 1));
        assert_eq!(FlowMapKey::new(&p.lookup_key), FlowMapKey::new(&r.lookup_key));
    }

    #[test]
    fn match_sets_direction() {
        let a: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let b: IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();
        let mut p = packet((a, 1234), (b, 53), (1, 2));
        let node = node_for(&p);
        assert!(node.match_node(&mut p));
        assert_eq!(p.direction, PacketDirection::ClientToServer);

        let mut r = packet((b, 53), (a, 1234), (2, 1));
        assert!(node.match_node(&mut r));
        assert_eq!(r.direction, PacketDirection::ServerToClient);
    }

    #[test]
    fn mismatch_on_epc_or_port() {
        let a: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let b: IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();
        let p = packet((a, 1234), (b, 53), (1, 2));
        let node = node_for(&p);

        let mut other_vpc = packet((a, 1234), (b, 53), (3, 2));
        assert!(!node.match_node(&mut other_vpc));
        let mut other_port = packet((a, 1235), (b, 53), (1, 2));
        assert!(!node.match_node(&mut other_port));
        let mut tcp = packet((a, 1234), (b, 53), (1, 2));
        tcp.lookup_key.proto = IpProtocol::Tcp;
        assert!(!node.match_node(&mut tcp));
    }
}
