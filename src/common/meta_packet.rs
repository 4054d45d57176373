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
use std::net::IpAddr;
use std::sync::Arc;

use super::endpoint::{EndpointData, EPC_FROM_INTERNET};
use super::enums::{IpProtocol, TcpFlags};
use super::flow::PacketDirection;
use super::lookup_key::LookupKey;
use super::Timestamp;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaPacketTcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

/// Decoded packet descriptor handed to the flow map.
///
/// Everything except `direction`, `is_active_service` and `flow_id` is
/// read only to the flow map; those three are written back while the
/// packet is processed.
#[derive(Clone, Debug, Default)]
pub struct MetaPacket {
    pub lookup_key: LookupKey,
    pub packet_len: u32,
    pub payload_len: u16,
    pub tcp_data: MetaPacketTcpHeader,
    pub endpoint_data: Option<Arc<EndpointData>>,

    pub direction: PacketDirection,
    pub is_active_service: bool,
    pub flow_id: u64,
}

impl MetaPacket {
    pub fn new(
        timestamp: Timestamp,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        proto: IpProtocol,
        packet_len: u32,
    ) -> Self {
        Self {
            lookup_key: LookupKey {
                timestamp,
                src_ip: src.0,
                dst_ip: dst.0,
                src_port: src.1,
                dst_port: dst.1,
                proto,
            },
            packet_len,
            ..Default::default()
        }
    }

    pub fn l3_epc_ids(&self) -> (i32, i32) {
        match self.endpoint_data.as_ref() {
            Some(d) => (d.src_info.l3_epc_id, d.dst_info.l3_epc_id),
            None => (EPC_FROM_INTERNET, EPC_FROM_INTERNET),
        }
    }
}

impl fmt::Display for MetaPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} len: {} payload: {} flags: {} direction: {}",
            self.lookup_key, self.packet_len, self.payload_len, self.tcp_data.flags, self.direction
        )
    }
}
