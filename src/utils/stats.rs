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
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence::{Counted, Gauged, Metric, MetricBuilder, MetricResult, StatsdClient, UdpMetricSink};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

pub use public::counter::*;

const STATS_PREFIX: &'static str = "flow_generator";
const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub enum StatsOption {
    Tag(&'static str, String),
}

struct Source {
    module: &'static str,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        self.module == other.module && self.tags == other.tags
    }
}

impl Eq for Source {}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

// 周期性地收集各模块的计数器，配置了statsd地址时发送出去，否则打印到debug日志
pub struct Collector {
    hostname: String,
    interval: Duration,
    statsd_client: Option<Arc<StatsdClient>>,

    sources: Arc<Mutex<Vec<Source>>>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new<S: AsRef<str>>(hostname: S, interval: Duration) -> Self {
        Self {
            hostname: hostname.as_ref().to_owned(),
            interval: interval.max(MIN_INTERVAL),
            statsd_client: None,
            sources: Arc::new(Mutex::new(vec![])),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn with_statsd<A: ToSocketAddrs + fmt::Debug>(mut self, addr: A) -> MetricResult<Self> {
        self.statsd_client = Some(Arc::new(Self::new_statsd_client(addr)?));
        Ok(self)
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            countable,
            tags: vec![],
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                _ => warn!("ignored duplicated tag for module {}", source.module),
            }
        }
        let mut sources = self.sources.lock();
        sources.retain(|s| {
            let closed = s.countable.closed();
            let equals = s == &source;
            if !closed && equals {
                warn!(
                    "Found duplicated counter source {}, please check if the old one is correctly closed.",
                    source
                );
            }
            !closed && !equals
        });
        sources.push(source);
    }

    fn new_statsd_client<A: ToSocketAddrs + fmt::Debug>(addr: A) -> MetricResult<StatsdClient> {
        info!("stats client connect to {:?}", &addr);

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let sink = UdpMetricSink::from(addr, socket)?;
        Ok(StatsdClient::from_sink(STATS_PREFIX, sink))
    }

    fn send_metrics<'a, T: Metric + From<String>>(
        mut b: MetricBuilder<'a, '_, T>,
        host: &'a str,
        tags: &'a Vec<(&'static str, String)>,
    ) {
        let mut has_host = false;
        for (k, v) in tags {
            if *k == "host" {
                has_host = true;
            }
            b = b.with_tag(k, v);
        }
        if !has_host {
            b = b.with_tag("host", host);
        }
        b.send();
    }

    fn collect(
        sources: &Mutex<Vec<Source>>,
        client: Option<&StatsdClient>,
        host: &str,
    ) -> usize {
        let mut sources = sources.lock();
        sources.retain(|s| !s.countable.closed());
        let mut points_sent = 0;
        for source in sources.iter() {
            let points = source.countable.get_counters();
            points_sent += points.len();
            let Some(client) = client else {
                debug!("{}: {:?}", source, points);
                continue;
            };
            for (name, ty, value) in points {
                let key = format!("{}.{}", source.module, name);
                match ty {
                    CounterType::Counted => Self::send_metrics(
                        client.count_with_tags(&key, value),
                        host,
                        &source.tags,
                    ),
                    CounterType::Gauged => Self::send_metrics(
                        client.gauge_with_tags(&key, value),
                        host,
                        &source.tags,
                    ),
                }
            }
        }
        points_sent
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        let (running, timer) = &*self.running;
        *running.lock() = false;
        timer.notify_all();
        self.thread.lock().take()
    }

    pub fn stop(&self) {
        if let Some(handle) = self.notify_stop() {
            if handle.join().is_err() {
                warn!("stats collector thread panicked");
            }
        }
    }

    pub fn start(&self) -> io::Result<()> {
        {
            let mut started = self.running.0.lock();
            if *started {
                return Ok(());
            }
            *started = true;
        }

        let running = self.running.clone();
        let sources = self.sources.clone();
        let hostname = self.hostname.clone();
        let client = self.statsd_client.clone();
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("stats-collector".to_owned())
            .spawn(move || loop {
                Self::collect(&sources, client.as_deref(), &hostname);

                let (running, timer) = &*running;
                let mut running = running.lock();
                if !*running {
                    break;
                }
                timer.wait_for(&mut running, interval);
                if !*running {
                    // 退出前最后收集一次，避免丢失最后一个周期的统计
                    drop(running);
                    Self::collect(&sources, client.as_deref(), &hostname);
                    break;
                }
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Weak,
    };

    use super::*;

    #[derive(Default)]
    struct Hits(AtomicU64);

    impl RefCountable for Hits {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "hits",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.swap(0, Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn closed_sources_are_dropped() {
        let collector = Collector::new("test", Duration::from_secs(1));
        let hits = Arc::new(Hits::default());
        let weak: Weak<dyn RefCountable> = Arc::downgrade(&hits) as Weak<dyn RefCountable>;
        collector.register_countable("hits", Countable::Ref(weak), vec![]);
        hits.0.fetch_add(3, Ordering::Relaxed);
        assert_eq!(Collector::collect(&collector.sources, None, "test"), 1);
        assert_eq!(hits.0.load(Ordering::Relaxed), 0);

        drop(hits);
        assert_eq!(Collector::collect(&collector.sources, None, "test"), 0);
        assert!(collector.sources.lock().is_empty());
    }

    #[test]
    fn duplicated_source_replaces_old_one() {
        let collector = Collector::new("test", Duration::from_secs(1));
        let a = Arc::new(Hits::default());
        let b = Arc::new(Hits::default());
        for h in [&a, &b] {
            collector.register_countable(
                "hits",
                Countable::Ref(Arc::downgrade(h) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("index", "0".to_owned())],
            );
        }
        assert_eq!(collector.sources.lock().len(), 1);
    }

    #[test]
    fn send_to_statsd() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let collector = Collector::new("test", Duration::from_secs(1))
            .with_statsd(server.local_addr().unwrap())
            .unwrap();
        let hits = Arc::new(Hits::default());
        collector.register_countable(
            "hits",
            Countable::Ref(Arc::downgrade(&hits) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("index", "1".to_owned())],
        );
        hits.0.fetch_add(3, Ordering::Relaxed);
        let client = collector.statsd_client.clone();
        assert_eq!(
            Collector::collect(&collector.sources, client.as_deref(), "test"),
            1
        );

        let mut buf = [0u8; 512];
        let n = server.recv(&mut buf).unwrap();
        let datagram = String::from_utf8_lossy(&buf[..n]);
        assert!(datagram.starts_with("flow_generator.hits.hits:3|c"));
        assert!(datagram.contains("index:1"));
        assert!(datagram.contains("host:test"));
    }

    #[test]
    fn start_and_stop() {
        let collector = Collector::new("test", Duration::from_secs(60));
        collector.start().unwrap();
        collector.start().unwrap();
        let handle = collector.notify_stop().unwrap();
        handle.join().unwrap();
        assert!(collector.notify_stop().is_none());
    }
}
