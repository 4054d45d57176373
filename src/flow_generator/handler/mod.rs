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

mod other;
mod tcp;
mod udp;

pub use other::OtherHandler;
pub use tcp::TcpHandler;
pub use udp::UdpHandler;

use std::mem;

use enum_dispatch::enum_dispatch;

use super::{
    flow_node::FlowNode,
    flow_state::{FlowState, StateMachine},
    service_table::{ServiceKey, ServiceTable},
    FlowConfig, FLOW_METRICS_PEER_DST, FLOW_METRICS_PEER_SRC,
};
use crate::common::{
    enums::IpProtocol,
    flow::{Flow, FlowKey, FlowMetricsPeer, PacketDirection},
    MetaPacket,
};
use crate::platform::Enricher;

// 处理一个报文期间handler需要的共享状态，全部只读
pub struct HandlerContext<'a> {
    pub config: &'a FlowConfig,
    pub service_table: &'a ServiceTable,
    pub state_machine_master: &'a StateMachine,
    pub state_machine_slave: &'a StateMachine,
    pub enricher: &'a Enricher,
}

#[enum_dispatch]
pub trait L4Handler {
    /// 用流的第一个报文初始化FlowNode，可能立即反转流方向
    fn init_flow(&self, ctx: &HandlerContext, node: &mut FlowNode, meta_packet: &mut MetaPacket);

    /// 返回true表示流已经结束，需要立即输出并从流表中删除
    fn update_flow(
        &self,
        ctx: &HandlerContext,
        node: &mut FlowNode,
        meta_packet: &mut MetaPacket,
    ) -> bool;

    /// 返回true表示流方向被反转
    fn update_direction(
        &self,
        ctx: &HandlerContext,
        node: &mut FlowNode,
        meta_packet: &mut MetaPacket,
        is_first_packet: bool,
    ) -> bool;
}

#[enum_dispatch(L4Handler)]
pub enum FlowHandler {
    TcpHandler,
    UdpHandler,
    OtherHandler,
}

impl From<IpProtocol> for FlowHandler {
    fn from(proto: IpProtocol) -> Self {
        match proto {
            IpProtocol::Tcp => TcpHandler.into(),
            IpProtocol::Udp => UdpHandler.into(),
            _ => OtherHandler.into(),
        }
    }
}

pub(super) fn init_common(ctx: &HandlerContext, node: &mut FlowNode, meta_packet: &mut MetaPacket) {
    meta_packet.direction = PacketDirection::ClientToServer;

    let lookup_key = &meta_packet.lookup_key;
    let timestamp = lookup_key.timestamp;
    let packet_len = meta_packet.packet_len as u64;
    let endpoint_data = meta_packet
        .endpoint_data
        .as_deref()
        .copied()
        .unwrap_or_default();

    let mut src = FlowMetricsPeer {
        total_packet_count: 1,
        packet_count: 1,
        tick_packet_count: 1,
        total_byte_count: packet_len,
        byte_count: packet_len,
        tick_byte_count: packet_len,
        first: timestamp,
        last: timestamp,
        ..Default::default()
    };
    src.update_endpoint_info(&endpoint_data.src_info);
    let mut dst = FlowMetricsPeer::default();
    dst.update_endpoint_info(&endpoint_data.dst_info);

    node.tagged_flow.flow = Flow {
        flow_key: FlowKey {
            ip_src: lookup_key.src_ip,
            ip_dst: lookup_key.dst_ip,
            port_src: lookup_key.src_port,
            port_dst: lookup_key.dst_port,
            proto: lookup_key.proto,
        },
        flow_metrics_peers: [src, dst],
        start_time: timestamp,
        end_time: timestamp,
        // FlowStatTime取整至统计时间的开始
        flow_stat_time: timestamp.round_to(ctx.config.stat_interval.into()),
        is_new_flow: true,
        ..Default::default()
    };
    ctx.enricher.enrich(&mut node.tagged_flow.flow);

    node.min_arrived_time = timestamp;
    node.recent_time = timestamp;
    node.timestamp_key = timestamp.as_secs();
    node.packet_in_tick = true;
    node.report_time = timestamp.round_to(ctx.config.report_interval.into());
    node.flow_state = FlowState::Raw;
}

pub(super) fn update_common(
    ctx: &HandlerContext,
    node: &mut FlowNode,
    meta_packet: &MetaPacket,
) {
    let pkt_timestamp = meta_packet.lookup_key.timestamp;
    if pkt_timestamp > node.recent_time {
        node.recent_time = pkt_timestamp;
        // Duration仅使用包的时间计算，不包括超时时间
        let flow = &mut node.tagged_flow.flow;
        flow.end_time = pkt_timestamp;
        flow.duration = node.recent_time - node.min_arrived_time;
    }

    if pkt_timestamp >= node.report_time + ctx.config.report_interval {
        node.reset_report_interval(pkt_timestamp.round_to(ctx.config.report_interval.into()));
    }

    let flow = &mut node.tagged_flow.flow;
    if !node.packet_in_tick {
        // 只需要赋值一次，且使用包的时间戳
        node.packet_in_tick = true;
        flow.flow_stat_time = pkt_timestamp.round_to(ctx.config.stat_interval.into());
    }

    let packet_len = meta_packet.packet_len as u64;
    let peer = &mut flow.flow_metrics_peers[meta_packet.direction as usize];
    peer.packet_count += 1;
    peer.tick_packet_count += 1;
    peer.total_packet_count += 1;
    peer.byte_count += packet_len;
    peer.tick_byte_count += packet_len;
    peer.total_byte_count += packet_len;
    peer.last = pkt_timestamp;
    if peer.first.is_zero() {
        peer.first = pkt_timestamp;
    }
}

// 双向都有包之后使用established_rst超时
pub(super) fn update_bidirectional_timeout(ctx: &HandlerContext, node: &mut FlowNode) {
    let peers = &node.tagged_flow.flow.flow_metrics_peers;
    if peers[FLOW_METRICS_PEER_SRC].packet_count > 0 && peers[FLOW_METRICS_PEER_DST].packet_count > 0
    {
        node.timeout = ctx.config.flow_timeout.established_rst;
    }
}

// 使用报文的源、目的构造ServiceKey，不是流的源、目的
pub(super) fn service_keys(meta_packet: &MetaPacket) -> (ServiceKey, ServiceKey) {
    let lookup_key = &meta_packet.lookup_key;
    let (src_epc, dst_epc) = meta_packet.l3_epc_ids();
    (
        ServiceKey::new(lookup_key.src_ip, src_epc as i16, lookup_key.src_port),
        ServiceKey::new(lookup_key.dst_ip, dst_epc as i16, lookup_key.dst_port),
    )
}

pub(super) fn apply_scores(
    node: &mut FlowNode,
    meta_packet: &mut MetaPacket,
    (mut src_score, mut dst_score): (u8, u8),
) -> bool {
    // 转换为流的源、目的的分数
    if meta_packet.direction == PacketDirection::ServerToClient {
        mem::swap(&mut src_score, &mut dst_score);
    }

    let flow = &mut node.tagged_flow.flow;
    let reversed = !ServiceTable::is_client_to_server(src_score, dst_score);
    if reversed {
        flow.reverse();
        mem::swap(&mut src_score, &mut dst_score);
        meta_packet.direction = meta_packet.direction.reversed();
    }
    flow.is_active_service = ServiceTable::is_active_service(src_score, dst_score);
    reversed
}
