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

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid ip address {0}")]
    InvalidIp(String),
    #[error("mixed ip family {0} and {1}")]
    MixedIpFamily(IpAddr, IpAddr),
    #[error("invalid ip protocol {0}")]
    InvalidIpProtocol(u8),
    #[error("zero packet length")]
    ZeroPacketLength,
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(String),
    #[error("invalid packet record: {0}")]
    InvalidJson(#[from] serde_json::Error),
}
