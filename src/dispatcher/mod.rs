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

use std::io::BufRead;
use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::common::{
    endpoint::{EndpointData, EndpointInfo, EPC_FROM_INTERNET},
    enums::{IpProtocol, TcpFlags},
    MetaPacket, Timestamp,
};
use crate::flow_generator::{Error, FlowMap, FlowMapKey, Result};
use crate::utils::{
    hasher::jenkins64,
    stats::{self, Counter, CounterType, CounterValue, Countable, RefCountable, StatsOption},
};
use public::queue::{self, Receiver, Sender};

const QUEUE_BATCH_SIZE: usize = 1024;
const QUEUE_READ_TIMEOUT: Duration = Duration::from_millis(100);
const BACKPRESSURE_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordTimestamp {
    Nanos(u64),
    Seconds(f64),
}

/// One line of input, `{"timestamp": ..., "src_ip": ..., ...}`.
///
/// timestamp is either integer nanoseconds or float seconds since the epoch.
#[derive(Debug, Deserialize)]
pub struct PacketRecord {
    timestamp: RecordTimestamp,
    src_ip: String,
    dst_ip: String,
    #[serde(default)]
    src_port: u16,
    #[serde(default)]
    dst_port: u16,
    proto: u8,
    packet_len: u32,
    #[serde(default)]
    payload_len: u16,
    #[serde(default)]
    tcp_flags: u8,
    #[serde(default)]
    seq: u32,
    #[serde(default)]
    ack: u32,
    src_epc: Option<i32>,
    dst_epc: Option<i32>,
}

impl TryFrom<PacketRecord> for MetaPacket {
    type Error = Error;

    fn try_from(record: PacketRecord) -> Result<Self> {
        let timestamp = match record.timestamp {
            RecordTimestamp::Nanos(0) => return Err(Error::InvalidTimestamp("0".to_owned())),
            RecordTimestamp::Nanos(n) => Timestamp::from_nanos(n),
            RecordTimestamp::Seconds(s) if s.is_finite() && s > 0.0 => {
                Timestamp::from_nanos((s * 1e9) as u64)
            }
            RecordTimestamp::Seconds(s) => return Err(Error::InvalidTimestamp(s.to_string())),
        };
        let src_ip = record
            .src_ip
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidIp(record.src_ip.clone()))?;
        let dst_ip = record
            .dst_ip
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidIp(record.dst_ip.clone()))?;
        if src_ip.is_ipv4() != dst_ip.is_ipv4() {
            return Err(Error::MixedIpFamily(src_ip, dst_ip));
        }
        let proto = IpProtocol::try_from(record.proto)
            .map_err(|_| Error::InvalidIpProtocol(record.proto))?;
        if proto == IpProtocol::Unknown {
            return Err(Error::InvalidIpProtocol(record.proto));
        }
        if record.packet_len == 0 {
            return Err(Error::ZeroPacketLength);
        }

        let mut packet = MetaPacket::new(
            timestamp,
            (src_ip, record.src_port),
            (dst_ip, record.dst_port),
            proto,
            record.packet_len,
        );
        packet.payload_len = record.payload_len;
        if proto == IpProtocol::Tcp {
            packet.tcp_data.flags = TcpFlags::from_bits_truncate(record.tcp_flags);
            packet.tcp_data.seq = record.seq;
            packet.tcp_data.ack = record.ack;
        }
        packet.endpoint_data = Some(Arc::new(EndpointData::new(
            EndpointInfo::with_epc(record.src_epc.unwrap_or(EPC_FROM_INTERNET)),
            EndpointInfo::with_epc(record.dst_epc.unwrap_or(EPC_FROM_INTERNET)),
        )));
        Ok(packet)
    }
}

pub fn parse_record(line: &str) -> Result<MetaPacket> {
    let record: PacketRecord = serde_json::from_str(line)?;
    MetaPacket::try_from(record)
}

#[derive(Default)]
pub struct DispatcherCounter {
    rx: AtomicU64,
    invalid: AtomicU64,
    dispatched: AtomicU64,
    // 停止时已解析但未能投递的报文
    abandoned: AtomicU64,
}

impl RefCountable for DispatcherCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "invalid",
                CounterType::Counted,
                CounterValue::Unsigned(self.invalid.swap(0, Ordering::Relaxed)),
            ),
            (
                "dispatched",
                CounterType::Counted,
                CounterValue::Unsigned(self.dispatched.swap(0, Ordering::Relaxed)),
            ),
            (
                "abandoned",
                CounterType::Counted,
                CounterValue::Unsigned(self.abandoned.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

// 读取线程解析记录，按流分配给worker，同一条流的报文由同一个worker按序处理
pub struct Dispatcher {
    flow_map: Arc<FlowMap>,
    workers: usize,
    queue_size: usize,
    running: Arc<AtomicBool>,
    counter: Arc<DispatcherCounter>,
    reader: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    stats_collector: Arc<stats::Collector>,
}

impl Dispatcher {
    pub fn new(
        flow_map: Arc<FlowMap>,
        workers: usize,
        queue_size: usize,
        stats_collector: Arc<stats::Collector>,
    ) -> Self {
        let counter = Arc::new(DispatcherCounter::default());
        stats_collector.register_countable(
            "dispatcher",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
            vec![],
        );
        Self {
            flow_map,
            workers: workers.max(1),
            queue_size,
            running: Arc::new(AtomicBool::new(false)),
            counter,
            reader: Mutex::new(None),
            worker_handles: Mutex::new(vec![]),
            stats_collector,
        }
    }

    pub fn counter(&self) -> &Arc<DispatcherCounter> {
        &self.counter
    }

    pub fn start<R: BufRead + Send + 'static>(&self, input: R) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("dispatcher already started, do nothing.");
            return Ok(());
        }

        let mut senders = Vec::with_capacity(self.workers);
        let mut handles = self.worker_handles.lock();
        for id in 0..self.workers {
            let (sender, receiver, stats_handle) = queue::bounded(self.queue_size);
            self.stats_collector.register_countable(
                "queue",
                Countable::Owned(Box::new(stats_handle)),
                vec![
                    StatsOption::Tag("module", "dispatcher-to-flow-map".to_owned()),
                    StatsOption::Tag("index", id.to_string()),
                ],
            );
            senders.push(sender);

            let flow_map = self.flow_map.clone();
            let running = self.running.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("flow-worker-{}", id))
                    .spawn(move || Self::process(receiver, flow_map, running))?,
            );
        }

        let running = self.running.clone();
        let counter = self.counter.clone();
        *self.reader.lock() = Some(
            thread::Builder::new()
                .name("packet-reader".to_owned())
                .spawn(move || Self::read(input, senders, running, counter))?,
        );
        info!("dispatcher started with {} workers", self.workers);
        Ok(())
    }

    fn read<R: BufRead>(
        input: R,
        senders: Vec<Sender<MetaPacket>>,
        running: Arc<AtomicBool>,
        counter: Arc<DispatcherCounter>,
    ) {
        for line in input.lines() {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("read packet record failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            counter.rx.fetch_add(1, Ordering::Relaxed);

            let packet = match parse_record(&line) {
                Ok(packet) => packet,
                Err(e) => {
                    counter.invalid.fetch_add(1, Ordering::Relaxed);
                    debug!("drop packet record {}: {}", line, e);
                    continue;
                }
            };
            let key = FlowMapKey::new(&packet.lookup_key);
            let sender = &senders[jenkins64(key.fold()) as usize % senders.len()];
            // 文件输入比处理快，队列过半时等待worker，避免覆盖
            while sender.pending() >= sender.capacity() / 2 && running.load(Ordering::Relaxed) {
                thread::sleep(BACKPRESSURE_INTERVAL);
            }
            if !running.load(Ordering::Relaxed) {
                counter.abandoned.fetch_add(1, Ordering::Relaxed);
                break;
            }
            if sender.send(packet).is_err() {
                counter.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!("dispatcher push packet to queue failed because queue have terminated");
                break;
            }
            counter.dispatched.fetch_add(1, Ordering::Relaxed);
        }
        info!("packet reader finished");
    }

    fn process(receiver: Receiver<MetaPacket>, flow_map: Arc<FlowMap>, running: Arc<AtomicBool>) {
        let mut batch = Vec::with_capacity(QUEUE_BATCH_SIZE);
        while running.load(Ordering::Relaxed) {
            match receiver.recv_all(&mut batch, Some(QUEUE_READ_TIMEOUT)) {
                Ok(_) => {
                    for mut packet in batch.drain(..) {
                        flow_map.inject_meta_packet(&mut packet);
                    }
                }
                Err(queue::Error::Timeout) => continue,
                Err(queue::Error::Terminated(..)) => break,
                Err(queue::Error::BatchTooLarge(_)) => unreachable!(),
            }
        }
        // 停止后不再接收新报文，处理完队列中剩余的
        receiver.close();
        while receiver.recv_all(&mut batch, Some(Duration::ZERO)).is_ok() {
            for mut packet in batch.drain(..) {
                flow_map.inject_meta_packet(&mut packet);
            }
        }
    }

    // 输入读完并且所有报文都已处理
    pub fn is_finished(&self) -> bool {
        self.reader
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
            && self.worker_handles.lock().iter().all(|h| h.is_finished())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("dispatcher already stopped, do nothing.");
            return;
        }
        info!("stopping dispatcher");
        for handle in self.worker_handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("flow worker panicked");
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            // 阻塞在stdin上的读取线程无法唤醒，不等待
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        info!("stopped dispatcher");
    }
}
