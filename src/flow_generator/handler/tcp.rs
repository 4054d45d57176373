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

use super::{apply_scores, init_common, service_keys, update_common, HandlerContext, L4Handler};
use crate::common::{enums::TcpFlags, flow::PacketDirection, MetaPacket};
use crate::flow_generator::{
    flow_node::FlowNode, FlowState, StateValue, TimeoutKind, FLOW_METRICS_PEER_DST,
    FLOW_METRICS_PEER_SRC,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpHandler;

impl TcpHandler {
    fn update_flow_state_machine(
        ctx: &HandlerContext,
        node: &mut FlowNode,
        flags: TcpFlags,
        direction: PacketDirection,
    ) -> bool {
        let mut value = ctx
            .state_machine_master
            .get(node.flow_state, flags)
            .copied()
            .unwrap_or(StateValue::new(
                // exception timeout
                TimeoutKind::Exception,
                FlowState::Exception,
                false,
            ));

        if direction == PacketDirection::ServerToClient {
            if let Some(v) = ctx.state_machine_slave.get(node.flow_state, flags) {
                value = *v;
            }
        }

        node.flow_state = value.state;
        let peers = &node.tagged_flow.flow.flow_metrics_peers;
        if peers[FLOW_METRICS_PEER_SRC].total_packet_count == 0
            || peers[FLOW_METRICS_PEER_DST].total_packet_count == 0
        {
            // single direction timeout
            node.timeout = ctx.config.flow_timeout.single_direction;
        } else {
            node.timeout = ctx.config.flow_timeout.get(value.timeout);
        }

        value.closed
    }

    fn update_state(
        ctx: &HandlerContext,
        node: &mut FlowNode,
        flags: TcpFlags,
        direction: PacketDirection,
    ) -> bool {
        if flags.is_invalid() {
            // exception timeout
            node.timeout = ctx.config.flow_timeout.exception;
            node.flow_state = FlowState::Exception;
            return false;
        }
        Self::update_flow_state_machine(ctx, node, flags, direction)
    }
}

impl L4Handler for TcpHandler {
    fn init_flow(&self, ctx: &HandlerContext, node: &mut FlowNode, meta_packet: &mut MetaPacket) {
        init_common(ctx, node, meta_packet);
        let flags = meta_packet.tcp_data.flags;
        let src = &mut node.tagged_flow.flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC];
        src.tcp_flags = flags;
        src.total_tcp_flags = flags;

        self.update_direction(ctx, node, meta_packet, true);
        meta_packet.is_active_service = node.tagged_flow.flow.is_active_service;
        // 第一个包不会让流结束
        Self::update_state(ctx, node, flags, meta_packet.direction);
    }

    fn update_flow(
        &self,
        ctx: &HandlerContext,
        node: &mut FlowNode,
        meta_packet: &mut MetaPacket,
    ) -> bool {
        let flags = meta_packet.tcp_data.flags;
        let peer = &mut node.tagged_flow.flow.flow_metrics_peers[meta_packet.direction as usize];
        peer.tcp_flags |= flags;
        peer.total_tcp_flags |= flags;
        update_common(ctx, node, meta_packet);

        // 有特殊包时更新ServiceTable并矫正流方向：SYN+ACK或SYN
        if flags.contains(TcpFlags::SYN) {
            self.update_direction(ctx, node, meta_packet, false);
        }
        meta_packet.is_active_service = node.tagged_flow.flow.is_active_service;

        Self::update_state(ctx, node, flags, meta_packet.direction)
    }

    fn update_direction(
        &self,
        ctx: &HandlerContext,
        node: &mut FlowNode,
        meta_packet: &mut MetaPacket,
        is_first_packet: bool,
    ) -> bool {
        let (src_key, dst_key) = service_keys(meta_packet);
        let scores = ctx.service_table.get_tcp_score(
            is_first_packet,
            meta_packet.tcp_data.flags,
            src_key,
            dst_key,
        );
        apply_scores(node, meta_packet, scores)
    }
}
