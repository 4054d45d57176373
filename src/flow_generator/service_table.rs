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

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::common::enums::TcpFlags;
use crate::utils::hasher::jenkins64;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ServiceKey {
    V4(Ipv4Key),
    V6(Ipv6Key),
}

impl ServiceKey {
    pub fn new(addr: IpAddr, epc_id: i16, port: u16) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::V4(Ipv4Key::new(v4, epc_id, port)),
            IpAddr::V6(v6) => Self::V6(Ipv6Key::new(v6, epc_id, port)),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::V4(k) => k.port,
            Self::V6(k) => k.port,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Ipv4Key {
    addr: Ipv4Addr,
    epc_id: i16,
    port: u16,
}

impl Ipv4Key {
    pub fn new(addr: Ipv4Addr, epc_id: i16, port: u16) -> Self {
        Self { addr, epc_id, port }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Ipv6Key {
    addr: Ipv6Addr,
    epc_id: i16,
    port: u16,
}

impl Ipv6Key {
    pub fn new(addr: Ipv6Addr, epc_id: i16, port: u16) -> Self {
        Self { addr, epc_id, port }
    }
}

trait ShardKey {
    fn fold(&self) -> u64;
}

impl ShardKey for Ipv4Key {
    fn fold(&self) -> u64 {
        (u32::from_le_bytes(self.addr.octets()) as u64) << 32
            | (self.port as u64) << 16
            | self.epc_id as u16 as u64
    }
}

impl ShardKey for Ipv6Key {
    fn fold(&self) -> u64 {
        let ip = u128::from(self.addr);
        (ip >> 64) as u64 ^ ip as u64 ^ ((self.epc_id as u16 as u64) << 16 | self.port as u64)
    }
}

impl Hash for Ipv4Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fold().hash(state);
    }
}

impl Hash for Ipv6Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.octets().hash(state);
        ((self.epc_id as u16 as u64) << 16 | self.port as u64).hash(state);
    }
}

// LRU bounded scores for one address family, split into independently locked shards
struct ScoreShards<K: Hash + Eq> {
    shards: Box<[Mutex<LruCache<K, u8>>]>,
}

impl<K: Hash + Eq + ShardKey> ScoreShards<K> {
    fn new(capacity: usize, n_shards: usize) -> Self {
        // power of two no larger than capacity
        let n_shards = n_shards.clamp(1, capacity.max(1));
        let n_shards = if n_shards.is_power_of_two() {
            n_shards
        } else {
            n_shards.next_power_of_two() >> 1
        };
        let per_shard = NonZeroUsize::new((capacity / n_shards).max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..n_shards)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<LruCache<K, u8>> {
        let index = jenkins64(key.fold()) as usize & (self.shards.len() - 1);
        &self.shards[index]
    }

    fn get(&self, key: &K) -> u8 {
        self.shard(key)
            .lock()
            .get(key)
            .copied()
            .unwrap_or(ServiceTable::MIN_SCORE)
    }

    fn put(&self, key: K, score: u8) {
        self.shard(&key).lock().put(key, score);
    }

    fn pop(&self, key: &K) {
        self.shard(key).lock().pop(key);
    }

    // read-modify-write under a single shard lock, a zero score drops the entry
    fn update<F: FnOnce(u8) -> u8>(&self, key: K, f: F) -> u8 {
        let mut cache = self.shard(&key).lock();
        let old = cache.get(&key).copied().unwrap_or(ServiceTable::MIN_SCORE);
        let new = f(old);
        if new == ServiceTable::MIN_SCORE {
            cache.pop(&key);
        } else if new != old {
            cache.put(key, new);
        }
        new
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// Per (epc, ip, port) server confidence shared by every flow.
///
/// Scores range from `MIN_SCORE` (no evidence, also the answer for unknown
/// keys) to `MAX_SCORE` (seen sending SYN|ACK). A packet's destination gains
/// one point for each flow it is the first-packet target of, its source loses
/// one. Only one shard lock is held at any time.
pub struct ServiceTable {
    ipv4: ScoreShards<Ipv4Key>,
    ipv6: ScoreShards<Ipv6Key>,
}

impl ServiceTable {
    pub const MIN_SCORE: u8 = 0;
    pub const MAX_SCORE: u8 = 0xff;
    pub const ACTIVE_SERVICE_SCORE: u8 = Self::SCORE_DIFF_THRESHOLD;
    const SCORE_DIFF_THRESHOLD: u8 = 8;
    const PORT_MSB: u16 = 1 << 15;
    const SHARDS: usize = 16;

    pub fn new(ipv4_capacity: usize, ipv6_capacity: usize) -> Self {
        Self {
            ipv4: ScoreShards::new(ipv4_capacity, Self::SHARDS),
            ipv6: ScoreShards::new(ipv6_capacity, Self::SHARDS),
        }
    }

    fn get(&self, key: &ServiceKey) -> u8 {
        match key {
            ServiceKey::V4(k) => self.ipv4.get(k),
            ServiceKey::V6(k) => self.ipv6.get(k),
        }
    }

    fn put(&self, key: ServiceKey, score: u8) {
        match key {
            ServiceKey::V4(k) => self.ipv4.put(k, score),
            ServiceKey::V6(k) => self.ipv6.put(k, score),
        }
    }

    fn pop(&self, key: &ServiceKey) {
        match key {
            ServiceKey::V4(k) => self.ipv4.pop(k),
            ServiceKey::V6(k) => self.ipv6.pop(k),
        }
    }

    fn update<F: FnOnce(u8) -> u8>(&self, key: ServiceKey, f: F) -> u8 {
        match key {
            ServiceKey::V4(k) => self.ipv4.update(k, f),
            ServiceKey::V6(k) => self.ipv6.update(k, f),
        }
    }

    fn increase(score: u8) -> u8 {
        if score < Self::MAX_SCORE - 1 {
            score + 1
        } else {
            score
        }
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_tcp_score(
        &self,
        is_first_packet: bool,
        tcp_flags: TcpFlags,
        src_key: ServiceKey,
        dst_key: ServiceKey,
    ) -> (u8, u8) {
        if tcp_flags.contains(TcpFlags::SYN_ACK) {
            // 一旦发送SYN|ACK，即被认为是服务端，其对侧被认为不可能是服务端
            self.put(src_key, Self::MAX_SCORE);
            self.pop(&dst_key);
            (Self::MAX_SCORE, Self::MIN_SCORE)
        } else if tcp_flags.contains(TcpFlags::SYN) {
            // the sender of a bare SYN is always the client
            self.pop(&src_key);
            let dst_score = if is_first_packet {
                self.update(dst_key, Self::increase)
            } else {
                self.get(&dst_key)
            };
            (Self::MIN_SCORE, dst_score)
        } else if is_first_packet {
            self.get_first_packet_score(src_key, dst_key)
        } else {
            self.get_other_score(src_key, dst_key)
        }
    }

    pub fn get_udp_score(
        &self,
        is_first_packet: bool,
        src_key: ServiceKey,
        dst_key: ServiceKey,
    ) -> (u8, u8) {
        if is_first_packet {
            return self.get_first_packet_score(src_key, dst_key);
        }
        self.get_other_score(src_key, dst_key)
    }

    // read only, what TCP and UDP learnt about these endpoints
    pub fn get_other_score(&self, src_key: ServiceKey, dst_key: ServiceKey) -> (u8, u8) {
        let (src_score, dst_score) = (self.get(&src_key), self.get(&dst_key));
        Self::adjust_score(src_key.port(), dst_key.port(), src_score, dst_score)
    }

    pub fn is_client_to_server(src_score: u8, dst_score: u8) -> bool {
        src_score <= dst_score // 分数相等也认为是C2S，避免reverse Flow
    }

    pub fn is_active_service(src_score: u8, dst_score: u8) -> bool {
        src_score.max(dst_score) >= Self::ACTIVE_SERVICE_SCORE
    }

    fn get_first_packet_score(&self, src_key: ServiceKey, dst_key: ServiceKey) -> (u8, u8) {
        let (src_score, dst_score) = (self.get(&src_key), self.get(&dst_key));
        if src_score == Self::MAX_SCORE || dst_score == Self::MAX_SCORE {
            // 一旦有一侧发送过SYN|ACK，无需更新
            return (src_score, dst_score);
        }

        let src_score = self.update(src_key, |s| match s {
            Self::MAX_SCORE => s,
            _ => s.saturating_sub(1),
        });
        let dst_score = self.update(dst_key, Self::increase);

        Self::adjust_score(src_key.port(), dst_key.port(), src_score, dst_score)
    }

    fn adjust_score(src_port: u16, dst_port: u16, src_score: u8, dst_score: u8) -> (u8, u8) {
        let diff_value = if src_score > dst_score {
            src_score - dst_score
        } else {
            dst_score - src_score
        };

        if diff_value < Self::SCORE_DIFF_THRESHOLD {
            // 两个端口一个小于32768，一个大于等于32768时进行校正
            // 参考：Many Linux kernels use the port range 32768–60999：https://en.wikipedia.org/wiki/Ephemeral_port
            if (src_port ^ dst_port) & Self::PORT_MSB != 0 {
                if src_port & Self::PORT_MSB > 0 {
                    return (0, 1);
                } else {
                    return (1, 0);
                }
            }
        }

        (src_score, dst_score)
    }
}
