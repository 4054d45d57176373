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

use std::io::{BufRead, Write};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use humantime::format_duration;
use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::Timestamp;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::flow_generator::{Clock, FlowAccess, FlowConfig, FlowMap, ServiceTable};
use crate::platform::{
    CacheCounter, CachedResolver, Enricher, GeoResolver, PlatformDataResolver, StaticGeoTable,
    StaticPlatformTable,
};
use crate::sender::FlowSender;
use crate::utils::stats::{self, Countable, RefCountable, StatsOption};

const DEFAULT_HOSTNAME: &str = "flow-generator";

// 定期推动流表时间窗口，输出超时的流
struct Sweeper {
    flow_map: Arc<FlowMap>,
    config: FlowAccess,
    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    fn new(flow_map: Arc<FlowMap>, config: FlowAccess) -> Self {
        Self {
            flow_map,
            config,
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    fn now(flow_map: &FlowMap, clock: Clock) -> Timestamp {
        match clock {
            Clock::Packet => flow_map.latest_timestamp(),
            Clock::System => Timestamp::now(),
        }
    }

    fn start(&self) -> std::io::Result<()> {
        *self.running.0.lock() = true;
        let running = self.running.clone();
        let flow_map = self.flow_map.clone();
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("flow-sweeper".to_owned())
            .spawn(move || loop {
                let (interval, clock) = {
                    let config = config.load();
                    (config.flush_interval, config.clock)
                };
                {
                    let (running, timer) = &*running;
                    let mut running = running.lock();
                    if !*running {
                        break;
                    }
                    timer.wait_for(&mut running, interval);
                    if !*running {
                        break;
                    }
                }
                let now = Self::now(&flow_map, clock);
                // 还没有收到报文
                if now.is_zero() {
                    continue;
                }
                flow_map.inject_flush_ticker(now);
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        {
            let (running, timer) = &*self.running;
            *running.lock() = false;
            timer.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("flow sweeper panicked");
            }
        }
    }
}

pub struct Agent {
    flow_map: Arc<FlowMap>,
    flow_config: FlowAccess,
    dispatcher: Dispatcher,
    sweeper: Sweeper,
    sender: FlowSender,
    stats_collector: Arc<stats::Collector>,
}

impl Agent {
    /// 创建并启动所有组件，从input读取报文记录，输出流到output
    pub fn start<R: BufRead + Send + 'static>(
        config: Config,
        input: R,
        output: Box<dyn Write + Send>,
    ) -> Result<Agent> {
        info!("==================== Launching flow-generator ====================");
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| DEFAULT_HOSTNAME.to_owned());
        let mut stats_collector = stats::Collector::new(&hostname, config.stats_interval);
        if let Some(addr) = config.statsd_address.as_ref() {
            stats_collector = stats_collector
                .with_statsd(addr.as_str())
                .with_context(|| format!("failed creating statsd client for {}", addr))?;
        }
        let stats_collector = Arc::new(stats_collector);
        stats_collector
            .start()
            .context("failed starting stats collector")?;

        let flow_config = FlowConfig::from(&config.flow);
        info!(
            "flow map capacity {} in {} shards, packet delay {}, max timeout {}, clock {:?}",
            flow_config.capacity,
            flow_config.shards,
            format_duration(flow_config.packet_delay),
            format_duration(flow_config.flow_timeout.max),
            flow_config.clock,
        );
        let service_table = Arc::new(ServiceTable::new(
            flow_config.service_table_ipv4_capacity,
            flow_config.service_table_ipv6_capacity,
        ));
        let flow_access: FlowAccess = Arc::new(ArcSwap::from_pointee(flow_config));
        let enricher = Self::build_enricher(&config, &stats_collector);

        let (output_sender, output_receiver, output_stats) =
            public::queue::bounded(config.output_queue_size);
        stats_collector.register_countable(
            "queue",
            Countable::Owned(Box::new(output_stats)),
            vec![StatsOption::Tag("module", "flow-map-to-sender".to_owned())],
        );
        let flow_map = Arc::new(FlowMap::new(
            flow_access.clone(),
            output_sender,
            service_table,
            enricher,
            &stats_collector,
        ));

        let sender = FlowSender::new(output_receiver, output, &stats_collector);
        sender.start().context("failed starting flow sender")?;
        let sweeper = Sweeper::new(flow_map.clone(), flow_access.clone());
        sweeper.start().context("failed starting flow sweeper")?;
        let dispatcher = Dispatcher::new(
            flow_map.clone(),
            config.workers,
            config.input_queue_size,
            stats_collector.clone(),
        );
        dispatcher
            .start(input)
            .context("failed starting dispatcher")?;

        Ok(Agent {
            flow_map,
            flow_config: flow_access,
            dispatcher,
            sweeper,
            sender,
            stats_collector,
        })
    }

    fn build_enricher(config: &Config, stats_collector: &stats::Collector) -> Enricher {
        let cache_capacity = config.platform.cache_capacity;
        let register = |name: &'static str, counter: &Arc<CacheCounter>| {
            stats_collector.register_countable(
                "resolver-cache",
                Countable::Ref(Arc::downgrade(counter) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("resolver", name.to_owned())],
            );
        };

        let platform: Option<Arc<dyn PlatformDataResolver>> = if config.platform.entries.is_empty() {
            None
        } else {
            let table = StaticPlatformTable::new(&config.platform.entries);
            if cache_capacity == 0 {
                Some(Arc::new(table))
            } else {
                let cached = CachedResolver::new(table, cache_capacity);
                register("platform", cached.counter());
                Some(Arc::new(cached))
            }
        };
        let geo: Option<Arc<dyn GeoResolver>> = if config.geo.entries.is_empty() {
            None
        } else {
            let table = StaticGeoTable::new(&config.geo.entries);
            if cache_capacity == 0 {
                Some(Arc::new(table))
            } else {
                let cached = CachedResolver::new(table, cache_capacity);
                register("geo", cached.counter());
                Some(Arc::new(cached))
            }
        };
        Enricher::new(platform, geo)
    }

    pub fn flow_map(&self) -> &Arc<FlowMap> {
        &self.flow_map
    }

    pub fn stats_collector(&self) -> &Arc<stats::Collector> {
        &self.stats_collector
    }

    // 输入已读完且所有报文已注入流表
    pub fn input_exhausted(&self) -> bool {
        self.dispatcher.is_finished()
    }

    /// 依次停止输入、sweeper，排空流表后停止输出
    pub fn stop(self) {
        info!("Gracefully stopping");
        self.dispatcher.stop();
        self.sweeper.stop();
        let drain_time = match self.flow_config.load().clock {
            Clock::Packet => self.flow_map.latest_timestamp(),
            Clock::System => Timestamp::now(),
        };
        self.flow_map.drain(drain_time);
        // 释放流表持有的队列发送端，sender写完剩余的流后退出
        drop(self.flow_map);
        drop(self.sweeper);
        drop(self.dispatcher);
        self.sender.stop();
        self.stats_collector.stop();
        info!("flow-generator stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn replay_tcp_session() {
        let config = Config::load(
            r#"
workers: 2
stats-interval: 1h
flow:
  flush-interval: 10ms
platform:
  entries:
    - cidr: 10.0.0.0/8
      epc-id: 3
      region-id: 9
"#,
        )
        .unwrap();
        let records = [
            (0, "10.0.0.1", 40000, "10.0.0.2", 80, 2),
            (1, "10.0.0.2", 80, "10.0.0.1", 40000, 18),
            (2, "10.0.0.1", 40000, "10.0.0.2", 80, 16),
            (3, "10.0.0.1", 40000, "10.0.0.2", 80, 24),
            (4, "10.0.0.2", 80, "10.0.0.1", 40000, 17),
            (5, "10.0.0.1", 40000, "10.0.0.2", 80, 17),
            (6, "10.0.0.2", 80, "10.0.0.1", 40000, 16),
        ];
        let input: String = records
            .iter()
            .map(|(ms, src, sport, dst, dport, flags)| {
                format!(
                    "{{\"timestamp\": {}, \"src_ip\": \"{}\", \"src_port\": {}, \"dst_ip\": \"{}\", \"dst_port\": {}, \"proto\": 6, \"packet_len\": 64, \"tcp_flags\": {}, \"src_epc\": 3, \"dst_epc\": 3}}\n",
                    1_700_000_000_000_000_000u64 + ms * 1_000_000,
                    src,
                    sport,
                    dst,
                    dport,
                    flags
                )
            })
            .collect();

        let output = SharedBuffer::default();
        let agent = Agent::start(config, Cursor::new(input), Box::new(output.clone())).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !agent.input_exhausted() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(agent.input_exhausted());
        agent.stop();

        let output = String::from_utf8(output.0.lock().clone()).unwrap();
        let flows: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(flow["ip_src"], "10.0.0.1");
        assert_eq!(flow["port_dst"], 80);
        assert_eq!(flow["total_packet_tx"], 4);
        assert_eq!(flow["total_packet_rx"], 3);
        assert_eq!(flow["region_id_0"], 9);
        assert_eq!(flow["region_id_1"], 9);
    }
}
