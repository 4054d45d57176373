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

use std::collections::{HashMap, HashSet};
use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use arc_swap::ArcSwap;
use log::warn;
use parking_lot::Mutex;

use super::{
    flow_node::{FlowMapKey, FlowNode},
    flow_state::StateMachine,
    handler::{FlowHandler, HandlerContext, L4Handler},
    service_table::ServiceTable,
    FlowAccess, FlowConfig, COUNTER_FLOW_ID_MASK, QUEUE_BATCH_SIZE, THREAD_FLOW_ID_MASK,
    TIMER_FLOW_ID_MASK, TIME_MAX_INTERVAL, TIME_UNIT,
};
use crate::common::{
    endpoint::{EndpointData, EndpointInfo, EPC_FROM_INTERNET},
    enums::{IpProtocol, TcpFlags},
    flow::CloseType,
    MetaPacket, TaggedFlow, Timestamp,
};
use crate::platform::Enricher;
use crate::utils::{
    hasher::jenkins64,
    stats::{self, Counter, CounterType, CounterValue, Countable, RefCountable, StatsOption},
};
use public::queue::{self, Receiver, Sender};

// 每个分片同一时刻只被一个线程持有，一条流的所有操作在分片锁内串行
struct FlowMapShard {
    id: usize,
    node_map: HashMap<FlowMapKey, Vec<Box<FlowNode>>>,
    time_set: Vec<HashSet<FlowMapKey>>,
    start_time: Timestamp,    // 时间桶中的最早时间
    start_time_in_unit: u64, // 时间桶中的最早时间，以TIME_UNIT为单位
    total_flow: u64,
    flow_count: usize,

    output_buffer: Vec<Box<TaggedFlow>>,
    last_queue_flush: Timestamp,
}

impl FlowMapShard {
    fn new(id: usize, capacity: usize, time_window_size: usize) -> Self {
        Self {
            id,
            node_map: HashMap::with_capacity(capacity),
            time_set: vec![HashSet::with_capacity(capacity / time_window_size); time_window_size],
            start_time: Timestamp::ZERO,
            start_time_in_unit: 0,
            total_flow: 0,
            flow_count: 0,
            output_buffer: Vec::with_capacity(QUEUE_BATCH_SIZE),
            last_queue_flush: Timestamp::ZERO,
        }
    }

    fn bucket(&self, time_in_unit: u64) -> usize {
        time_in_unit as usize & (self.time_set.len() - 1)
    }

    // 给定key中最先超时的节点
    fn earliest_node<'a>(
        &self,
        keys: impl Iterator<Item = &'a FlowMapKey>,
    ) -> Option<(FlowMapKey, usize, Timestamp)> {
        keys.filter_map(|key| self.node_map.get(key).map(|nodes| (*key, nodes)))
            .flat_map(|(key, nodes)| {
                nodes
                    .iter()
                    .enumerate()
                    .map(move |(index, node)| (key, index, node.deadline()))
            })
            .min_by_key(|(_, _, deadline)| *deadline)
    }

    fn generate_flow_id(&mut self, timestamp: Timestamp) -> u64 {
        self.total_flow += 1;
        (timestamp.as_nanos() >> 30 & TIMER_FLOW_ID_MASK) << 32
            | (self.id as u64 & THREAD_FLOW_ID_MASK) << 24
            | self.total_flow & COUNTER_FLOW_ID_MASK
    }
}

pub struct FlowMap {
    shards: Box<[Mutex<FlowMapShard>]>,
    state_machine_master: StateMachine,
    state_machine_slave: StateMachine,
    service_table: Arc<ServiceTable>,
    enricher: Enricher,
    config: FlowAccess,
    output_queue: Sender<Box<TaggedFlow>>,
    latest_timestamp: AtomicU64,
    stats_counter: Arc<FlowMapCounter>,
}

impl FlowMap {
    pub fn new(
        config: FlowAccess,
        output_queue: Sender<Box<TaggedFlow>>,
        service_table: Arc<ServiceTable>,
        enricher: Enricher,
        stats_collector: &stats::Collector,
    ) -> Self {
        let config_guard = config.load();
        let n_shards = config_guard.shard_count();
        let time_window_size = {
            let max_timeout = config_guard.flow_timeout.max;
            let size = (config_guard.packet_delay + max_timeout + TIME_UNIT).as_secs();
            size.max(1).next_power_of_two() as usize
        };
        let shard_capacity = config_guard.shard_capacity();
        let stats_counter = Arc::new(FlowMapCounter::new(n_shards));
        stats_collector.register_countable(
            "flow-map",
            Countable::Ref(Arc::downgrade(&stats_counter) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("shards", n_shards.to_string())],
        );

        Self {
            shards: (0..n_shards)
                .map(|id| Mutex::new(FlowMapShard::new(id, shard_capacity, time_window_size)))
                .collect(),
            state_machine_master: StateMachine::new_master(),
            state_machine_slave: StateMachine::new_slave(),
            service_table,
            enricher,
            config,
            output_queue,
            latest_timestamp: AtomicU64::new(0),
            stats_counter,
        }
    }

    pub fn counter(&self) -> &Arc<FlowMapCounter> {
        &self.stats_counter
    }

    // 最近一个报文的时间，用于以报文时间驱动sweeper
    pub fn latest_timestamp(&self) -> Timestamp {
        Timestamp::from_nanos(self.latest_timestamp.load(Ordering::Relaxed))
    }

    fn shard_index(&self, key: &FlowMapKey) -> usize {
        jenkins64(key.fold()) as usize & (self.shards.len() - 1)
    }

    fn shard_capacity(&self, config: &FlowConfig) -> usize {
        (config.capacity as usize / self.shards.len()).max(1)
    }

    fn handler_context<'a>(&'a self, config: &'a FlowConfig) -> HandlerContext<'a> {
        HandlerContext {
            config,
            service_table: &self.service_table,
            state_machine_master: &self.state_machine_master,
            state_machine_slave: &self.state_machine_slave,
            enricher: &self.enricher,
        }
    }

    /// 推动所有分片的时间窗口，输出超时的流和到期的统计数据
    ///
    /// timestamp为零时使用系统时间。返回false表示有分片因时间早于窗口而未推动。
    pub fn inject_flush_ticker(&self, mut timestamp: Timestamp) -> bool {
        if timestamp.is_zero() {
            timestamp = Timestamp::now();
        }
        let config = self.config.load();
        let mut advanced = true;
        for shard in self.shards.iter() {
            advanced &= self.advance(&config, &mut shard.lock(), timestamp);
        }
        advanced
    }

    fn advance(&self, config: &FlowConfig, shard: &mut FlowMapShard, timestamp: Timestamp) -> bool {
        if timestamp < shard.start_time {
            self.stats_counter
                .drop_by_window
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // FlowMap 时间窗口无法推动
        if timestamp - config.packet_delay - TIME_UNIT < shard.start_time {
            return true;
        }

        // 根据包到达时间的容差调整
        let next_start_time_in_unit =
            (timestamp - config.packet_delay).as_nanos() / TIME_UNIT.as_nanos() as u64;
        shard.start_time = Timestamp::from_secs(next_start_time_in_unit);

        // 跨度超过时间轮大小时，每个桶只需要遍历一次
        let window = shard.time_set.len() as u64;
        let from = shard
            .start_time_in_unit
            .max(next_start_time_in_unit.saturating_sub(window));
        for time_in_unit in from..next_start_time_in_unit {
            let bucket = shard.bucket(time_in_unit);
            let time_hashset = mem::take(&mut shard.time_set[bucket]);
            for flow_key in time_hashset {
                let Some(nodes) = shard.node_map.get_mut(&flow_key) else {
                    continue;
                };
                loop {
                    let Some(index) = nodes
                        .iter()
                        .position(|node| node.timestamp_key <= time_in_unit) else {
                        break;
                    };
                    let mut node = nodes.swap_remove(index);

                    let deadline = node.deadline();
                    if timestamp >= deadline {
                        // 超时Flow将被删除然后把统计信息发送队列下游
                        self.stats_counter.closed.fetch_add(1, Ordering::Relaxed);
                        shard.flow_count -= 1;
                        self.node_removed_aftercare(
                            config,
                            &mut shard.output_buffer,
                            node,
                            deadline,
                            None,
                        );
                        continue;
                    }
                    // 未超时Flow的统计信息发送到队列下游
                    self.node_updated_aftercare(
                        config,
                        &mut shard.output_buffer,
                        &mut node,
                        timestamp,
                    );

                    // 若流统计信息已输出，将节点移动至最终超时的时间
                    let updated_time = deadline.min(timestamp + TIME_MAX_INTERVAL);
                    node.timestamp_key = updated_time.as_secs();
                    let moved = node.timestamp_key as usize & (window as usize - 1);
                    shard.time_set[moved].insert(flow_key);
                    nodes.push(node);
                }

                if nodes.is_empty() {
                    shard.node_map.remove(&flow_key);
                } else if nodes
                    .iter()
                    .any(|node| node.timestamp_key as usize & (window as usize - 1) == bucket)
                {
                    // 同一个桶里还有未到期的节点
                    shard.time_set[bucket].insert(flow_key);
                }
            }
        }
        self.update_stats_counter(shard, 0);

        shard.start_time_in_unit = next_start_time_in_unit;
        self.flush_queue(config, shard, timestamp);

        true
    }

    pub fn inject_meta_packet(&self, meta_packet: &mut MetaPacket) {
        let config = self.config.load();
        let pkt_key = FlowMapKey::new(&meta_packet.lookup_key);
        let pkt_timestamp = meta_packet.lookup_key.timestamp;
        self.latest_timestamp
            .fetch_max(pkt_timestamp.as_nanos(), Ordering::Relaxed);

        let mut guard = self.shards[self.shard_index(&pkt_key)].lock();
        let shard = &mut *guard;
        if !self.advance(&config, shard, pkt_timestamp) {
            return;
        }

        let ctx = self.handler_context(&config);
        let handler = FlowHandler::from(meta_packet.lookup_key.proto);
        let (max_depth, matched) = match shard.node_map.get_mut(&pkt_key) {
            Some(nodes) => (
                nodes.len(),
                nodes
                    .iter()
                    .position(|node| node.match_node(meta_packet))
                    .map(|index| nodes.swap_remove(index)),
            ),
            None => (0, None),
        };

        match matched {
            Some(mut node) => {
                // 1. 输出上一个统计周期的统计信息
                self.node_updated_aftercare(
                    &config,
                    &mut shard.output_buffer,
                    &mut node,
                    pkt_timestamp,
                );

                // 2. 更新Flow状态，判断是否已结束
                meta_packet.flow_id = node.tagged_flow.flow.flow_id;
                if handler.update_flow(&ctx, &mut node, meta_packet) {
                    self.stats_counter.closed.fetch_add(1, Ordering::Relaxed);
                    shard.flow_count -= 1;
                    self.node_removed_aftercare(
                        &config,
                        &mut shard.output_buffer,
                        node,
                        pkt_timestamp,
                        None,
                    );
                    if shard
                        .node_map
                        .get(&pkt_key)
                        .map(|nodes| nodes.is_empty())
                        .unwrap_or(false)
                    {
                        shard.node_map.remove(&pkt_key);
                    }
                } else {
                    shard.node_map.entry(pkt_key).or_default().push(node);
                }
                self.update_stats_counter(shard, max_depth as u64);
            }
            // 未找到匹配的 FlowNode，需要插入新的节点
            None => {
                if shard.flow_count >= self.shard_capacity(&config) {
                    self.evict_one(&config, shard);
                }
                let node = self.new_flow_node(&ctx, shard, &handler, meta_packet);
                let index = shard.bucket(node.timestamp_key);
                shard.time_set[index].insert(pkt_key);
                shard.node_map.entry(pkt_key).or_default().push(node);
                self.update_stats_counter(shard, 1 + max_depth as u64);
            }
        }
    }

    /// 关闭所有流并输出，用于停止时排空流表
    pub fn drain(&self, mut timestamp: Timestamp) {
        if timestamp.is_zero() {
            timestamp = Timestamp::now();
        }
        let config = self.config.load();
        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            let shard = &mut *guard;
            for (_, nodes) in shard.node_map.drain() {
                for node in nodes {
                    self.stats_counter.closed.fetch_add(1, Ordering::Relaxed);
                    let end_time = node.deadline().min(timestamp.max(node.recent_time));
                    self.node_removed_aftercare(
                        &config,
                        &mut shard.output_buffer,
                        node,
                        end_time,
                        None,
                    );
                }
            }
            shard.time_set.iter_mut().for_each(HashSet::clear);
            shard.flow_count = 0;
            self.send_output_buffer(&mut shard.output_buffer);
            shard.last_queue_flush = timestamp;
            self.update_stats_counter(shard, 0);
        }
    }

    fn new_flow_node(
        &self,
        ctx: &HandlerContext,
        shard: &mut FlowMapShard,
        handler: &FlowHandler,
        meta_packet: &mut MetaPacket,
    ) -> Box<FlowNode> {
        self.stats_counter.new.fetch_add(1, Ordering::Relaxed);
        let mut node = Box::new(FlowNode::default());
        handler.init_flow(ctx, &mut node, meta_packet);
        let flow_id = shard.generate_flow_id(meta_packet.lookup_key.timestamp);
        node.tagged_flow.flow.flow_id = flow_id;
        meta_packet.flow_id = flow_id;
        shard.flow_count += 1;
        self.stats_counter
            .concurrent
            .fetch_add(1, Ordering::Relaxed);
        node
    }

    // 从最早的时间桶中淘汰最先超时的流
    fn evict_one(&self, config: &FlowConfig, shard: &mut FlowMapShard) {
        let window = shard.time_set.len() as u64;
        let victim = (0..window)
            .map(|offset| shard.bucket(shard.start_time_in_unit + offset))
            .find_map(|bucket| shard.earliest_node(shard.time_set[bucket].iter()))
            .or_else(|| shard.earliest_node(shard.node_map.keys()));
        let Some((key, index, _)) = victim else {
            return;
        };
        let Some(nodes) = shard.node_map.get_mut(&key) else {
            return;
        };
        let node = nodes.swap_remove(index);
        if nodes.is_empty() {
            shard.node_map.remove(&key);
        }

        self.stats_counter.evicted.fetch_add(1, Ordering::Relaxed);
        shard.flow_count -= 1;
        let end_time = node.recent_time;
        self.node_removed_aftercare(
            config,
            &mut shard.output_buffer,
            node,
            end_time,
            Some(CloseType::Evicted),
        );
    }

    fn flush_queue(&self, config: &FlowConfig, shard: &mut FlowMapShard, now: Timestamp) {
        if now - shard.last_queue_flush > config.flush_interval {
            self.send_output_buffer(&mut shard.output_buffer);
            shard.last_queue_flush = now;
        }
    }

    fn send_output_buffer(&self, output_buffer: &mut Vec<Box<TaggedFlow>>) {
        if output_buffer.is_empty() {
            return;
        }
        let flows = mem::replace(output_buffer, Vec::with_capacity(QUEUE_BATCH_SIZE));
        if let Err(_) = self.output_queue.send_large(flows) {
            warn!("flow-map push tagged flows to queue failed because queue have terminated");
        }
    }

    fn push_to_flow_stats_queue(
        &self,
        output_buffer: &mut Vec<Box<TaggedFlow>>,
        tagged_flow: Box<TaggedFlow>,
    ) {
        output_buffer.push(tagged_flow);
        if output_buffer.len() >= QUEUE_BATCH_SIZE {
            self.send_output_buffer(output_buffer);
        }
    }

    fn node_removed_aftercare(
        &self,
        config: &FlowConfig,
        output_buffer: &mut Vec<Box<TaggedFlow>>,
        mut node: Box<FlowNode>,
        end_time: Timestamp,
        close_type: Option<CloseType>,
    ) {
        let flow = &mut node.tagged_flow.flow;
        match close_type {
            Some(close_type) => flow.close_type = close_type,
            None => flow.update_close_type(node.flow_state),
        }
        flow.end_time = end_time;
        flow.flow_stat_time = end_time.round_to(config.stat_interval.into());

        self.stats_counter
            .concurrent
            .fetch_sub(1, Ordering::Relaxed);
        self.push_to_flow_stats_queue(output_buffer, Box::new(node.tagged_flow));
    }

    fn node_updated_aftercare(
        &self,
        config: &FlowConfig,
        output_buffer: &mut Vec<Box<TaggedFlow>>,
        node: &mut FlowNode,
        timestamp: Timestamp,
    ) {
        let flow = &node.tagged_flow.flow;
        if node.packet_in_tick
            && (timestamp >= flow.flow_stat_time + config.stat_interval
                || timestamp < flow.flow_stat_time)
        {
            let mut tagged_flow = Box::new(node.tagged_flow.clone());
            tagged_flow.flow.close_type = CloseType::ForcedReport;
            self.stats_counter
                .tick_emitted
                .fetch_add(1, Ordering::Relaxed);
            self.push_to_flow_stats_queue(output_buffer, tagged_flow);
            node.reset_flow_stat_info();
        }
    }

    fn update_stats_counter(&self, shard: &FlowMapShard, max_depth: u64) {
        let c = &self.stats_counter;
        c.slots[shard.id].store(shard.node_map.len() as u64, Ordering::Relaxed);
        c.slot_max_depth.fetch_max(max_depth, Ordering::Relaxed);
    }
}

pub struct FlowMapCounter {
    new: AtomicU64,            // the number of created flow
    closed: AtomicU64,         // the number of closed flow
    evicted: AtomicU64,        // the number of flow closed by capacity
    drop_by_window: AtomicU64, // times of flush which drop by window
    concurrent: AtomicU64,     // current the number of FlowNode
    tick_emitted: AtomicU64,   // the number of ForcedReport records
    slot_max_depth: AtomicU64, // the max length of Vec<FlowNode>
    slots: Box<[AtomicU64]>,   // current the length of HashMap, per shard
}

impl FlowMapCounter {
    fn new(shards: usize) -> Self {
        Self {
            new: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            drop_by_window: AtomicU64::new(0),
            concurrent: AtomicU64::new(0),
            tick_emitted: AtomicU64::new(0),
            slot_max_depth: AtomicU64::new(0),
            slots: (0..shards).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn concurrent(&self) -> u64 {
        self.concurrent.load(Ordering::Relaxed)
    }
}

impl RefCountable for FlowMapCounter {
    fn get_counters(&self) -> Vec<Counter> {
        let concurrent = self.concurrent.load(Ordering::Relaxed);
        let slots = self
            .slots
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .sum::<u64>();
        let slots_avg_depth = concurrent.checked_div(slots).unwrap_or_default();

        vec![
            (
                "new",
                CounterType::Counted,
                CounterValue::Unsigned(self.new.swap(0, Ordering::Relaxed)),
            ),
            (
                "closed",
                CounterType::Counted,
                CounterValue::Unsigned(self.closed.swap(0, Ordering::Relaxed)),
            ),
            (
                "evicted",
                CounterType::Counted,
                CounterValue::Unsigned(self.evicted.swap(0, Ordering::Relaxed)),
            ),
            (
                "drop_by_window",
                CounterType::Counted,
                CounterValue::Unsigned(self.drop_by_window.swap(0, Ordering::Relaxed)),
            ),
            (
                "tick_emitted",
                CounterType::Counted,
                CounterValue::Unsigned(self.tick_emitted.swap(0, Ordering::Relaxed)),
            ),
            (
                "concurrent",
                CounterType::Gauged,
                CounterValue::Unsigned(concurrent),
            ),
            (
                "slot_max_depth",
                CounterType::Gauged,
                CounterValue::Unsigned(self.slot_max_depth.swap(0, Ordering::Relaxed)),
            ),
            (
                "slots_avg_depth",
                CounterType::Gauged,
                CounterValue::Unsigned(slots_avg_depth),
            ),
            ("slots", CounterType::Gauged, CounterValue::Unsigned(slots)),
        ]
    }
}

pub fn _reverse_meta_packet(packet: &mut MetaPacket) {
    packet.lookup_key.reverse();
    if let Some(endpoint_data) = packet.endpoint_data.as_ref() {
        packet.endpoint_data = Some(Arc::new(endpoint_data.reversed()));
    }
}

pub fn _new_flow_map_and_receiver(config: FlowConfig) -> (FlowMap, Receiver<Box<TaggedFlow>>) {
    let (output_queue_sender, output_queue_receiver, _) = queue::bounded(4096);
    let service_table = Arc::new(ServiceTable::new(
        config.service_table_ipv4_capacity,
        config.service_table_ipv6_capacity,
    ));
    let flow_map = FlowMap::new(
        Arc::new(ArcSwap::from_pointee(config)),
        output_queue_sender,
        service_table,
        Enricher::default(),
        &stats::Collector::new("127.0.0.1", TIME_UNIT),
    );
    (flow_map, output_queue_receiver)
}

pub fn _new_meta_packet() -> MetaPacket {
    let mut packet = MetaPacket::new(
        Timestamp::now(),
        (IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 12345),
        (IpAddr::V4(Ipv4Addr::new(114, 114, 114, 114)), 22),
        IpProtocol::Tcp,
        128,
    );
    packet.tcp_data.flags = TcpFlags::SYN;
    packet.endpoint_data = Some(Arc::new(EndpointData::new(
        EndpointInfo::with_epc(1),
        EndpointInfo::with_epc(EPC_FROM_INTERNET),
    )));
    packet
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::common::flow::PacketDirection;
    use crate::flow_generator::{FLOW_METRICS_PEER_DST, FLOW_METRICS_PEER_SRC};

    const A: (IpAddr, u16) = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 41234);
    const B: (IpAddr, u16) = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 53);

    fn packet(
        timestamp: Timestamp,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        proto: IpProtocol,
        len: u32,
    ) -> MetaPacket {
        let mut p = MetaPacket::new(timestamp, src, dst, proto, len);
        p.endpoint_data = Some(Arc::new(EndpointData::new(
            EndpointInfo::with_epc(1),
            EndpointInfo::with_epc(1),
        )));
        p
    }

    fn udp(secs: u64, src: (IpAddr, u16), dst: (IpAddr, u16), len: u32) -> MetaPacket {
        packet(Timestamp::from_secs(secs), src, dst, IpProtocol::Udp, len)
    }

    fn tcp(secs: u64, src: (IpAddr, u16), dst: (IpAddr, u16), flags: TcpFlags) -> MetaPacket {
        let mut p = packet(Timestamp::from_secs(secs), src, dst, IpProtocol::Tcp, 100);
        p.tcp_data.flags = flags;
        p
    }

    fn single_shard() -> FlowConfig {
        FlowConfig {
            shards: 1,
            ..Default::default()
        }
    }

    fn receive_all(receiver: &Receiver<Box<TaggedFlow>>) -> Vec<Box<TaggedFlow>> {
        let mut flows = vec![];
        while let Ok(f) = receiver.recv(Some(Duration::from_millis(10))) {
            flows.push(f);
        }
        flows
    }

    fn terminal(flows: Vec<Box<TaggedFlow>>) -> Vec<Box<TaggedFlow>> {
        flows
            .into_iter()
            .filter(|f| f.flow.close_type != CloseType::ForcedReport)
            .collect()
    }

    fn live_nodes(flow_map: &FlowMap) -> usize {
        flow_map
            .shards
            .iter()
            .map(|s| s.lock().node_map.values().map(Vec::len).sum::<usize>())
            .sum()
    }

    #[test]
    fn udp_first_packet_from_client() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        let mut p = udp(10, A, B, 100);
        flow_map.inject_meta_packet(&mut p);
        assert_eq!(p.direction, PacketDirection::ClientToServer);
        assert_ne!(p.flow_id, 0);

        flow_map.drain(Timestamp::from_secs(11));
        let flows = receive_all(&receiver);
        assert_eq!(flows.len(), 1);
        let flow = &flows[0].flow;
        assert_eq!(flow.flow_id, p.flow_id);
        assert!(!flow.reversed);
        assert_eq!(flow.flow_key.ip_src, A.0);
        assert_eq!(flow.close_type, CloseType::Timeout);
        let src = &flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC];
        assert_eq!(
            (src.total_packet_count, src.packet_count, src.tick_packet_count),
            (1, 1, 1)
        );
        assert_eq!(src.total_byte_count, 100);
    }

    #[test]
    fn udp_known_server_reverses_once() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        // 让B积累足够的服务端分数
        for port in 40000..40020 {
            let client = (IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)), port);
            flow_map.inject_meta_packet(&mut udp(10, client, B, 60));
        }
        flow_map.drain(Timestamp::from_secs(10));
        receive_all(&receiver);

        let c = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 42000);
        let mut first = udp(11, B, c, 200);
        flow_map.inject_meta_packet(&mut first);
        assert_eq!(first.direction, PacketDirection::ServerToClient);
        assert!(first.is_active_service);

        let mut reply = udp(11, c, B, 80);
        flow_map.inject_meta_packet(&mut reply);
        assert_eq!(reply.direction, PacketDirection::ClientToServer);
        assert_eq!(reply.flow_id, first.flow_id);

        flow_map.drain(Timestamp::from_secs(12));
        let flows = receive_all(&receiver);
        assert_eq!(flows.len(), 1);
        let flow = &flows[0].flow;
        assert!(flow.reversed);
        assert_eq!(flow.flow_key.ip_src, c.0);
        assert_eq!(flow.flow_key.port_dst, B.1);
        let peers = &flow.flow_metrics_peers;
        assert_eq!(peers[FLOW_METRICS_PEER_SRC].total_packet_count, 1);
        assert_eq!(peers[FLOW_METRICS_PEER_SRC].total_byte_count, 80);
        assert_eq!(peers[FLOW_METRICS_PEER_DST].total_packet_count, 1);
        assert_eq!(peers[FLOW_METRICS_PEER_DST].total_byte_count, 200);
    }

    #[test]
    fn reversal_keeps_counters() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        let a = (A.0, 40000);
        let b = (B.0, 40001);
        for _ in 0..5 {
            flow_map.inject_meta_packet(&mut tcp(10, a, b, TcpFlags::PSH_ACK));
        }
        for _ in 0..2 {
            flow_map.inject_meta_packet(&mut tcp(10, b, a, TcpFlags::ACK));
        }
        // A发送SYN|ACK后被认定为服务端
        let mut p = tcp(10, a, b, TcpFlags::SYN_ACK);
        flow_map.inject_meta_packet(&mut p);
        assert_eq!(p.direction, PacketDirection::ServerToClient);

        flow_map.drain(Timestamp::from_secs(10));
        let flows = receive_all(&receiver);
        assert_eq!(flows.len(), 1);
        let flow = &flows[0].flow;
        assert!(flow.reversed);
        assert_eq!(flow.flow_key.ip_src, b.0);
        let peers = &flow.flow_metrics_peers;
        assert_eq!(peers[FLOW_METRICS_PEER_SRC].total_packet_count, 2);
        assert_eq!(peers[FLOW_METRICS_PEER_SRC].total_byte_count, 200);
        assert_eq!(peers[FLOW_METRICS_PEER_DST].total_packet_count, 6);
        assert_eq!(peers[FLOW_METRICS_PEER_DST].total_byte_count, 600);
    }

    #[test]
    fn tick_resets_tick_counters() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        flow_map.inject_meta_packet(&mut udp(10, A, B, 100));
        flow_map.inject_meta_packet(&mut udp(10, B, A, 50));

        assert!(flow_map.inject_flush_ticker(Timestamp::from_secs(12)));
        let flows = receive_all(&receiver);
        assert_eq!(flows.len(), 1);
        let tick = &flows[0].flow;
        assert_eq!(tick.close_type, CloseType::ForcedReport);
        assert!(tick.is_new_flow);
        assert_eq!(tick.flow_metrics_peers[FLOW_METRICS_PEER_SRC].tick_packet_count, 1);
        assert_eq!(tick.flow_metrics_peers[FLOW_METRICS_PEER_DST].tick_byte_count, 50);

        let shard = flow_map.shards[0].lock();
        let node = &shard.node_map.values().next().unwrap()[0];
        assert!(!node.packet_in_tick);
        for peer in node.tagged_flow.flow.flow_metrics_peers.iter() {
            assert_eq!(peer.tick_packet_count, 0);
            assert_eq!(peer.tick_byte_count, 0);
            assert_eq!(peer.total_packet_count, 1);
        }
        assert_eq!(flow_map.stats_counter.tick_emitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn packet_crossing_stat_interval_emits_tick() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        flow_map.inject_meta_packet(&mut udp(10, A, B, 100));
        flow_map.inject_meta_packet(&mut udp(11, A, B, 100));
        flow_map.inject_flush_ticker(Timestamp::from_secs(13));
        let ticks = receive_all(&receiver);
        assert!(ticks
            .iter()
            .all(|f| f.flow.close_type == CloseType::ForcedReport));
        let tick_packets: u64 = ticks
            .iter()
            .map(|f| f.flow.flow_metrics_peers[FLOW_METRICS_PEER_SRC].tick_packet_count)
            .sum();
        assert_eq!(tick_packets, 2);
        assert_eq!(ticks[0].flow.flow_stat_time, Timestamp::from_secs(10));
    }

    #[test]
    fn concurrent_packets_share_one_flow() {
        const THREADS: u64 = 8;
        const PACKETS: u64 = 500;
        let (flow_map, receiver) = _new_flow_map_and_receiver(FlowConfig::default());
        let flow_map = Arc::new(flow_map);
        let handles = (0..THREADS)
            .map(|i| {
                let flow_map = flow_map.clone();
                thread::spawn(move || {
                    for _ in 0..PACKETS {
                        let mut p = if i % 2 == 0 {
                            udp(10, A, B, 10)
                        } else {
                            udp(10, B, A, 10)
                        };
                        flow_map.inject_meta_packet(&mut p);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(live_nodes(&flow_map), 1);

        flow_map.drain(Timestamp::from_secs(10));
        let flows = receive_all(&receiver);
        assert_eq!(flows.len(), 1);
        let total: u64 = flows[0]
            .flow
            .flow_metrics_peers
            .iter()
            .map(|p| p.total_packet_count)
            .sum();
        assert_eq!(total, THREADS * PACKETS);
    }

    #[test]
    fn tcp_fin_closes_flow() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        let client = (A.0, 50000);
        let server = (B.0, 80);
        let sequence = [
            (true, TcpFlags::SYN),
            (false, TcpFlags::SYN_ACK),
            (true, TcpFlags::ACK),
            (false, TcpFlags::PSH_ACK),
            (true, TcpFlags::FIN_ACK),
            (false, TcpFlags::FIN_ACK),
            (true, TcpFlags::ACK),
        ];
        for (c2s, flags) in sequence {
            let (src, dst) = if c2s { (client, server) } else { (server, client) };
            flow_map.inject_meta_packet(&mut tcp(10, src, dst, flags));
        }
        assert_eq!(live_nodes(&flow_map), 0);
        assert_eq!(flow_map.counter().concurrent(), 0);

        flow_map.inject_flush_ticker(Timestamp::from_secs(12));
        let flows = terminal(receive_all(&receiver));
        assert_eq!(flows.len(), 1);
        let flow = &flows[0].flow;
        assert_eq!(flow.close_type, CloseType::TcpFin);
        assert_eq!(flow.end_time, Timestamp::from_secs(10));
        assert!(flow.is_active_service);
    }

    #[test]
    fn idle_flow_times_out() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        flow_map.inject_meta_packet(&mut udp(10, A, B, 100));
        assert!(flow_map.inject_flush_ticker(Timestamp::from_secs(12)));
        assert_eq!(live_nodes(&flow_map), 1);

        assert!(flow_map.inject_flush_ticker(Timestamp::from_secs(20)));
        assert_eq!(live_nodes(&flow_map), 0);
        let flows = terminal(receive_all(&receiver));
        assert_eq!(flows.len(), 1);
        let flow = &flows[0].flow;
        assert_eq!(flow.close_type, CloseType::Timeout);
        // 超时流的结束时间为超时时刻
        assert_eq!(
            flow.end_time,
            Timestamp::from_secs(10) + FlowConfig::default().flow_timeout.opening
        );
    }

    #[test]
    fn full_shard_evicts_earliest() {
        let config = FlowConfig {
            capacity: 2,
            shards: 1,
            ..Default::default()
        };
        let (flow_map, receiver) = _new_flow_map_and_receiver(config);
        let clients = (1..=3)
            .map(|i| (IpAddr::V4(Ipv4Addr::new(10, 0, 2, i)), 40000))
            .collect::<Vec<_>>();
        // 三条流注册在同一个时间桶，第一条最先超时
        let later = Timestamp::from_nanos(10_500_000_000);
        let mut first = udp(10, clients[0], B, 100);
        flow_map.inject_meta_packet(&mut first);
        flow_map.inject_meta_packet(&mut packet(later, clients[1], B, IpProtocol::Udp, 100));
        flow_map.inject_meta_packet(&mut packet(later, clients[2], B, IpProtocol::Udp, 100));
        assert_eq!(live_nodes(&flow_map), 2);
        assert_eq!(flow_map.stats_counter.evicted.load(Ordering::Relaxed), 1);

        flow_map.drain(Timestamp::from_secs(12));
        let flows = terminal(receive_all(&receiver));
        assert_eq!(flows.len(), 3);
        let evicted = flows
            .iter()
            .filter(|f| f.flow.close_type == CloseType::Evicted)
            .collect::<Vec<_>>();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].flow.flow_id, first.flow_id);
    }

    #[test]
    fn capacity_smaller_than_shards() {
        let config = FlowConfig {
            capacity: 2,
            shards: 16,
            ..Default::default()
        };
        let (flow_map, receiver) = _new_flow_map_and_receiver(config);
        assert_eq!(flow_map.shards.len(), 2);
        for port in 40000..40064 {
            flow_map.inject_meta_packet(&mut udp(10, (A.0, port), B, 100));
            assert!(flow_map.counter().concurrent() <= 2);
        }
        assert_eq!(live_nodes(&flow_map) as u64, flow_map.counter().concurrent());
        assert!(flow_map.stats_counter.evicted.load(Ordering::Relaxed) >= 62);

        flow_map.drain(Timestamp::from_secs(11));
        assert_eq!(terminal(receive_all(&receiver)).len(), 64);
    }

    #[test]
    fn drain_emits_all() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(FlowConfig::default());
        for port in 40000..40100 {
            let client = (A.0, port);
            flow_map.inject_meta_packet(&mut udp(10, client, B, 100));
        }
        flow_map.inject_meta_packet(&mut tcp(10, A, (B.0, 80), TcpFlags::SYN));
        assert_eq!(flow_map.counter().concurrent(), 101);

        flow_map.drain(Timestamp::from_secs(11));
        assert_eq!(live_nodes(&flow_map), 0);
        assert_eq!(flow_map.counter().concurrent(), 0);
        let flows = receive_all(&receiver);
        assert_eq!(flows.len(), 101);
        assert!(flows.iter().all(|f| f.flow.close_type.is_terminal()));
    }

    #[test]
    fn packet_behind_window_is_dropped() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        flow_map.inject_meta_packet(&mut udp(100, A, B, 100));
        let mut late = udp(50, (A.0, 1000), B, 100);
        flow_map.inject_meta_packet(&mut late);
        assert_eq!(late.flow_id, 0);
        assert_eq!(live_nodes(&flow_map), 1);
        assert_eq!(flow_map.stats_counter.drop_by_window.load(Ordering::Relaxed), 1);

        assert!(!flow_map.inject_flush_ticker(Timestamp::from_secs(20)));
        assert_eq!(flow_map.stats_counter.drop_by_window.load(Ordering::Relaxed), 2);
        flow_map.drain(Timestamp::from_secs(100));
        assert_eq!(receive_all(&receiver).len(), 1);
    }

    #[test]
    fn terminated_queue_does_not_panic() {
        let (flow_map, receiver) = _new_flow_map_and_receiver(single_shard());
        drop(receiver);
        flow_map.inject_meta_packet(&mut udp(10, A, B, 100));
        flow_map.drain(Timestamp::from_secs(11));
        assert_eq!(live_nodes(&flow_map), 0);
    }

    #[test]
    fn reversed_helper_matches_same_flow() {
        let (flow_map, _receiver) = _new_flow_map_and_receiver(FlowConfig::default());
        let mut p = _new_meta_packet();
        flow_map.inject_meta_packet(&mut p);
        let mut r = _new_meta_packet();
        _reverse_meta_packet(&mut r);
        r.tcp_data.flags = TcpFlags::SYN_ACK;
        flow_map.inject_meta_packet(&mut r);
        assert_eq!(r.flow_id, p.flow_id);
        assert_eq!(live_nodes(&flow_map), 1);
    }

    #[test]
    fn counters_report_slots() {
        let (flow_map, _receiver) = _new_flow_map_and_receiver(FlowConfig::default());
        flow_map.inject_meta_packet(&mut udp(10, A, B, 100));
        flow_map.inject_meta_packet(&mut udp(10, (A.0, 1), B, 100));
        let counters = flow_map.counter().get_counters();
        let get = |name| {
            counters
                .iter()
                .find(|c| c.0 == name)
                .map(|c| c.2)
                .unwrap()
        };
        assert_eq!(get("new"), CounterValue::Unsigned(2));
        assert_eq!(get("concurrent"), CounterValue::Unsigned(2));
        assert_eq!(get("slots"), CounterValue::Unsigned(2));
    }
}
