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

use std::io::{BufWriter, Write};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::common::TaggedFlow;
use crate::utils::stats::{
    self, Counter, CounterType, CounterValue, Countable, RefCountable,
};
use public::queue::{self, Receiver};

const QUEUE_BATCH_SIZE: usize = 1024;
const QUEUE_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct SenderCounter {
    pub tx: AtomicU64,
    pub dropped: AtomicU64,
}

impl RefCountable for SenderCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "tx",
                CounterType::Counted,
                CounterValue::Unsigned(self.tx.swap(0, Ordering::Relaxed)),
            ),
            (
                "dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.dropped.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

struct Encoder {
    writer: BufWriter<Box<dyn Write + Send>>,
    counter: Arc<SenderCounter>,
}

impl Encoder {
    fn encode(&mut self, flow: &TaggedFlow) {
        let result = serde_json::to_writer(&mut self.writer, flow)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        match result {
            Ok(_) => {
                self.counter.tx.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counter.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("write flow {} failed: {}", flow.flow.flow_id, e);
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("flush flow output failed: {}", e);
        }
    }
}

/// 将流表输出的TaggedFlow按行写为JSON
pub struct FlowSender {
    output: Mutex<Option<(Receiver<Box<TaggedFlow>>, Box<dyn Write + Send>)>>,
    counter: Arc<SenderCounter>,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlowSender {
    pub fn new(
        receiver: Receiver<Box<TaggedFlow>>,
        writer: Box<dyn Write + Send>,
        stats_collector: &stats::Collector,
    ) -> Self {
        let counter = Arc::new(SenderCounter::default());
        stats_collector.register_countable(
            "flow-sender",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
            vec![],
        );
        Self {
            output: Mutex::new(Some((receiver, writer))),
            counter,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: Mutex::new(None),
        }
    }

    pub fn counter(&self) -> &Arc<SenderCounter> {
        &self.counter
    }

    fn process(receiver: Receiver<Box<TaggedFlow>>, mut encoder: Encoder, running: Arc<AtomicBool>) {
        let mut batch = Vec::with_capacity(QUEUE_BATCH_SIZE);
        loop {
            match receiver.recv_all(&mut batch, Some(QUEUE_READ_TIMEOUT)) {
                Ok(_) => {
                    for flow in batch.drain(..) {
                        encoder.encode(&flow);
                    }
                }
                Err(queue::Error::Timeout) => {
                    encoder.flush();
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(queue::Error::Terminated(..)) => {
                    encoder.flush();
                    break;
                }
                Err(queue::Error::BatchTooLarge(_)) => unreachable!(),
            }
        }
    }

    pub fn start(&self) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("flow sender already started, do nothing.");
            return Ok(());
        }
        let Some((receiver, writer)) = self.output.lock().take() else {
            warn!("flow sender can not restart after stopped");
            return Ok(());
        };
        let encoder = Encoder {
            writer: BufWriter::new(writer),
            counter: self.counter.clone(),
        };
        let running = self.running.clone();
        *self.thread_handle.lock() = Some(
            thread::Builder::new()
                .name("flow-sender".to_owned())
                .spawn(move || Self::process(receiver, encoder, running))?,
        );
        info!("flow sender started");
        Ok(())
    }

    // 停止后会先写完队列中剩余的流
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("flow sender already stopped, do nothing.");
            return;
        }
        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.join().is_err() {
                warn!("flow sender panicked");
            }
        }
        info!("flow sender stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::common::{enums::IpProtocol, flow::CloseType, Timestamp};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn tagged_flow(flow_id: u64) -> Box<TaggedFlow> {
        let mut tagged_flow = TaggedFlow::default();
        let flow = &mut tagged_flow.flow;
        flow.flow_id = flow_id;
        flow.flow_key.ip_src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        flow.flow_key.ip_dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        flow.flow_key.port_src = 41234;
        flow.flow_key.port_dst = 53;
        flow.flow_key.proto = IpProtocol::Udp;
        flow.flow_metrics_peers[0].total_packet_count = 5;
        flow.flow_metrics_peers[1].total_packet_count = 2;
        flow.start_time = Timestamp::from_secs(10);
        flow.end_time = Timestamp::from_nanos(12_500_000_000);
        flow.close_type = CloseType::Timeout;
        Box::new(tagged_flow)
    }

    #[test]
    fn writes_json_lines() {
        let (sender, receiver, _) = queue::bounded(16);
        let buffer = SharedBuffer::default();
        let collector = stats::Collector::new("127.0.0.1", Duration::from_secs(1));
        let flow_sender = FlowSender::new(receiver, Box::new(buffer.clone()), &collector);
        flow_sender.start().unwrap();

        sender.send_all(&mut vec![tagged_flow(1), tagged_flow(2)]).unwrap();
        drop(sender);
        flow_sender.stop();

        let output = String::from_utf8(buffer.0.lock().clone()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        let first = &lines[0];
        assert_eq!(first["flow_id"], 1);
        assert_eq!(first["ip_src"], "10.0.0.1");
        assert_eq!(first["port_dst"], 53);
        assert_eq!(first["protocol"], 17);
        assert_eq!(first["total_packet_tx"], 5);
        assert_eq!(first["total_packet_rx"], 2);
        assert_eq!(first["start_time"], 10_000_000);
        assert_eq!(first["end_time"], 12_500_000);
        assert_eq!(lines[1]["flow_id"], 2);
        assert_eq!(flow_sender.counter().tx.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn stop_without_producer_exits() {
        let (_sender, receiver, _) = queue::bounded::<Box<TaggedFlow>>(16);
        let collector = stats::Collector::new("127.0.0.1", Duration::from_secs(1));
        let flow_sender = FlowSender::new(receiver, Box::new(io::sink()), &collector);
        flow_sender.start().unwrap();
        flow_sender.stop();
        assert_eq!(flow_sender.counter().tx.load(Ordering::Relaxed), 0);
    }
}
