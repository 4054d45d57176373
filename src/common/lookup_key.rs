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
use std::net::{IpAddr, Ipv4Addr};

use super::enums::IpProtocol;
use super::Timestamp;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupKey {
    pub timestamp: Timestamp,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: IpProtocol,
}

impl Default for LookupKey {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::ZERO,
            src_ip: Ipv4Addr::UNSPECIFIED.into(),
            dst_ip: Ipv4Addr::UNSPECIFIED.into(),
            src_port: 0,
            dst_port: 0,
            proto: IpProtocol::default(),
        }
    }
}

impl LookupKey {
    pub fn is_ipv4(&self) -> bool {
        self.src_ip.is_ipv4()
    }

    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.src_ip, &mut self.dst_ip);
        std::mem::swap(&mut self.src_port, &mut self.dst_port);
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}:{} > {}:{} proto: {}",
            self.timestamp, self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.proto
        )
    }
}
