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

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use serde::Deserialize;

use super::{SERVICE_TABLE_IPV4_CAPACITY, SERVICE_TABLE_IPV6_CAPACITY, STATISTICAL_INTERVAL};

pub const TIMEOUT_OTHERS: Duration = Duration::from_secs(5);
pub const TIMEOUT_ESTABLISHED: Duration = Duration::from_secs(300);
pub const TIMEOUT_CLOSING: Duration = Duration::from_secs(35);
pub const TIMEOUT_CLOSED_FIN: Duration = Duration::from_secs(2);
pub const TIMEOUT_OPENING_RST: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Opening,
    Established,
    Closing,
    EstablishedRst,
    Exception,
    ClosedFin,
    SingleDirection,
    OpeningRst,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FlowTimeout {
    pub opening: Duration,
    pub established: Duration,
    pub closing: Duration,
    pub established_rst: Duration,
    pub exception: Duration,
    pub closed_fin: Duration,
    pub single_direction: Duration,
    pub opening_rst: Duration,

    pub min: Duration,
    pub max: Duration, // time window
}

impl Default for FlowTimeout {
    fn default() -> Self {
        let mut ft = Self {
            opening: TIMEOUT_OTHERS,
            established: TIMEOUT_ESTABLISHED,
            closing: TIMEOUT_OTHERS,
            established_rst: TIMEOUT_CLOSING,
            exception: TIMEOUT_OTHERS,
            closed_fin: TIMEOUT_CLOSED_FIN,
            single_direction: TIMEOUT_OTHERS,
            opening_rst: TIMEOUT_OPENING_RST,
            min: Duration::ZERO,
            max: Duration::ZERO,
        };
        ft.update_min_max();
        ft
    }
}

impl FlowTimeout {
    pub fn update_min_max(&mut self) {
        let all = [
            self.opening,
            self.established,
            self.closing,
            self.established_rst,
            self.exception,
            self.closed_fin,
            self.single_direction,
            self.opening_rst,
        ];
        self.min = all.iter().copied().min().unwrap_or_default();
        self.max = all.iter().copied().max().unwrap_or_default();
    }

    pub fn get(&self, kind: TimeoutKind) -> Duration {
        match kind {
            TimeoutKind::Opening => self.opening,
            TimeoutKind::Established => self.established,
            TimeoutKind::Closing => self.closing,
            TimeoutKind::EstablishedRst => self.established_rst,
            TimeoutKind::Exception => self.exception,
            TimeoutKind::ClosedFin => self.closed_fin,
            TimeoutKind::SingleDirection => self.single_direction,
            TimeoutKind::OpeningRst => self.opening_rst,
        }
    }
}

// sweeper的时间来源：回放场景使用报文时间，实时场景使用系统时间
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Clock {
    Packet,
    System,
}

impl Default for Clock {
    fn default() -> Self {
        Clock::Packet
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    pub capacity: u32,
    pub shards: usize,
    pub packet_delay: Duration,
    pub flush_interval: Duration,
    pub stat_interval: Duration,
    pub report_interval: Duration,
    pub clock: Clock,
    pub flow_timeout: FlowTimeout,

    pub service_table_ipv4_capacity: usize,
    pub service_table_ipv6_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            capacity: 65535,
            shards: 16,
            packet_delay: Duration::from_secs(1),
            flush_interval: Duration::from_secs(1),
            stat_interval: STATISTICAL_INTERVAL,
            report_interval: Duration::from_secs(60),
            clock: Clock::default(),
            flow_timeout: FlowTimeout::default(),
            service_table_ipv4_capacity: SERVICE_TABLE_IPV4_CAPACITY,
            service_table_ipv6_capacity: SERVICE_TABLE_IPV6_CAPACITY,
        }
    }
}

impl FlowConfig {
    // 分片数取2的幂且不超过容量，各分片容量之和不超过capacity
    pub fn shard_count(&self) -> usize {
        let mut n = self.shards.max(1).next_power_of_two();
        while n > 1 && n > self.capacity as usize {
            n >>= 1;
        }
        n
    }

    // 每个分片的流数量上限，至少为1
    pub fn shard_capacity(&self) -> usize {
        (self.capacity as usize / self.shard_count()).max(1)
    }
}

pub type FlowAccess = Arc<ArcSwap<FlowConfig>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_ordering() {
        let t = FlowTimeout::default();
        assert!(t.opening <= t.established_rst);
        assert!(t.established_rst <= t.established);
        assert_eq!(t.min, TIMEOUT_OPENING_RST);
        assert_eq!(t.max, TIMEOUT_ESTABLISHED);
    }

    #[test]
    fn timeout_by_kind() {
        let mut t = FlowTimeout::default();
        t.exception = Duration::from_secs(7);
        t.update_min_max();
        assert_eq!(t.get(TimeoutKind::Exception), Duration::from_secs(7));
        assert_eq!(t.get(TimeoutKind::ClosedFin), TIMEOUT_CLOSED_FIN);
    }

    #[test]
    fn shard_capacity_never_zero() {
        let mut c = FlowConfig::default();
        c.capacity = 3;
        c.shards = 16;
        assert_eq!(c.shard_count(), 2);
        assert_eq!(c.shard_capacity(), 1);
        assert!(c.shard_count() * c.shard_capacity() <= c.capacity as usize);

        c.capacity = 1000;
        c.shards = 12;
        assert_eq!(c.shard_count(), 16);
        assert_eq!(c.shard_capacity(), 62);
    }
}
