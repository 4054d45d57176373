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

use super::{
    apply_scores, init_common, service_keys, update_bidirectional_timeout, update_common,
    HandlerContext, L4Handler,
};
use crate::common::MetaPacket;
use crate::flow_generator::{flow_node::FlowNode, FlowState};

#[derive(Clone, Copy, Debug, Default)]
pub struct UdpHandler;

impl L4Handler for UdpHandler {
    fn init_flow(&self, ctx: &HandlerContext, node: &mut FlowNode, meta_packet: &mut MetaPacket) {
        init_common(ctx, node, meta_packet);
        node.flow_state = FlowState::Established;
        node.timeout = ctx.config.flow_timeout.opening;
        self.update_direction(ctx, node, meta_packet, true);
        meta_packet.is_active_service = node.tagged_flow.flow.is_active_service;
    }

    fn update_flow(
        &self,
        ctx: &HandlerContext,
        node: &mut FlowNode,
        meta_packet: &mut MetaPacket,
    ) -> bool {
        update_common(ctx, node, meta_packet);
        update_bidirectional_timeout(ctx, node);
        self.update_direction(ctx, node, meta_packet, false);
        meta_packet.is_active_service = node.tagged_flow.flow.is_active_service;
        false
    }

    fn update_direction(
        &self,
        ctx: &HandlerContext,
        node: &mut FlowNode,
        meta_packet: &mut MetaPacket,
        is_first_packet: bool,
    ) -> bool {
        let (src_key, dst_key) = service_keys(meta_packet);
        let scores = ctx
            .service_table
            .get_udp_score(is_first_packet, src_key, dst_key);
        apply_scores(node, meta_packet, scores)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::super::test_context::{matched, packet, Owned};
    use super::*;
    use crate::common::enums::IpProtocol;
    use crate::common::flow::PacketDirection;
    use crate::flow_generator::{FLOW_METRICS_PEER_DST, FLOW_METRICS_PEER_SRC};

    const CLIENT: (IpAddr, u16) = (IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 41234);
    const SERVER: (IpAddr, u16) = (IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 53);

    #[test]
    fn first_packet_from_client() {
        let owned = Owned::default();
        let ctx = owned.ctx();
        let mut node = FlowNode::default();
        let mut p = packet(10, CLIENT, SERVER, IpProtocol::Udp, 100);
        UdpHandler.init_flow(&ctx, &mut node, &mut p);

        let flow = &node.tagged_flow.flow;
        assert!(!flow.reversed);
        assert_eq!(flow.flow_key.ip_src, CLIENT.0);
        assert_eq!(node.flow_state, FlowState::Established);
        assert_eq!(node.timeout, ctx.config.flow_timeout.opening);
        let src = &flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC];
        assert_eq!((src.total_packet_count, src.packet_count, src.tick_packet_count), (1, 1, 1));
        assert_eq!(src.total_byte_count, 100);
        assert_eq!(p.direction, PacketDirection::ClientToServer);
    }

    #[test]
    fn first_packet_from_known_server_reverses() {
        let owned = Owned::default();
        let ctx = owned.ctx();
        // 先让服务端端口学习到较高的分数
        for _ in 0..3 {
            let mut node = FlowNode::default();
            let mut p = packet(1, CLIENT, SERVER, IpProtocol::Udp, 60);
            UdpHandler.init_flow(&ctx, &mut node, &mut p);
        }

        let mut node = FlowNode::default();
        let mut p = packet(10, SERVER, CLIENT, IpProtocol::Udp, 200);
        UdpHandler.init_flow(&ctx, &mut node, &mut p);
        let flow = &node.tagged_flow.flow;
        assert!(flow.reversed);
        assert_eq!(flow.flow_key.ip_src, CLIENT.0);
        assert_eq!(flow.flow_key.port_dst, SERVER.1);
        assert_eq!(flow.flow_metrics_peers[FLOW_METRICS_PEER_DST].total_byte_count, 200);
        assert_eq!(flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC].total_packet_count, 0);
        assert_eq!(p.direction, PacketDirection::ServerToClient);
    }

    #[test]
    fn bidirectional_switches_timeout() {
        let owned = Owned::default();
        let ctx = owned.ctx();
        let mut node = FlowNode::default();
        let mut p = packet(10, CLIENT, SERVER, IpProtocol::Udp, 100);
        UdpHandler.init_flow(&ctx, &mut node, &mut p);

        let mut p = matched(&node, packet(10, CLIENT, SERVER, IpProtocol::Udp, 100));
        assert!(!UdpHandler.update_flow(&ctx, &mut node, &mut p));
        assert_eq!(node.timeout, ctx.config.flow_timeout.opening);

        let mut p = matched(&node, packet(11, SERVER, CLIENT, IpProtocol::Udp, 300));
        assert!(!UdpHandler.update_flow(&ctx, &mut node, &mut p));
        assert_eq!(node.timeout, ctx.config.flow_timeout.established_rst);
        assert_eq!(p.direction, PacketDirection::ServerToClient);

        let flow = &node.tagged_flow.flow;
        assert_eq!(flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC].total_packet_count, 2);
        assert_eq!(flow.flow_metrics_peers[FLOW_METRICS_PEER_DST].total_byte_count, 300);
        assert_eq!(flow.duration, crate::common::Timestamp::from_secs(1));
    }

    #[test]
    fn direction_is_idempotent() {
        let owned = Owned::default();
        let ctx = owned.ctx();
        let mut node = FlowNode::default();
        let mut p = packet(10, CLIENT, SERVER, IpProtocol::Udp, 100);
        UdpHandler.init_flow(&ctx, &mut node, &mut p);
        let reversed = node.tagged_flow.flow.reversed;
        for secs in 11..20 {
            let mut p = matched(&node, packet(secs, SERVER, CLIENT, IpProtocol::Udp, 100));
            UdpHandler.update_flow(&ctx, &mut node, &mut p);
            assert_eq!(node.tagged_flow.flow.reversed, reversed);
        }
    }
}
