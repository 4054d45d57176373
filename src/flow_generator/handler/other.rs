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

// 非TCP/UDP协议只在第一个包时确定方向，ServiceTable中没有学习过的端口不会反转
#[derive(Clone, Copy, Debug, Default)]
pub struct OtherHandler;

impl L4Handler for OtherHandler {
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
        meta_packet.is_active_service = node.tagged_flow.flow.is_active_service;
        false
    }

    fn update_direction(
        &self,
        ctx: &HandlerContext,
        node: &mut FlowNode,
        meta_packet: &mut MetaPacket,
        _: bool,
    ) -> bool {
        let (src_key, dst_key) = service_keys(meta_packet);
        let scores = ctx.service_table.get_other_score(src_key, dst_key);
        apply_scores(node, meta_packet, scores)
    }
}
