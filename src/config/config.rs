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

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::flow_generator::{Clock, FlowConfig, FlowTimeout};
use crate::platform::{GeoEntry, PlatformEntry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("invalid value of {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde")]
    pub opening: Duration,
    #[serde(with = "humantime_serde")]
    pub established: Duration,
    #[serde(with = "humantime_serde")]
    pub closing: Duration,
    #[serde(with = "humantime_serde")]
    pub established_rst: Duration,
    #[serde(with = "humantime_serde")]
    pub exception: Duration,
    #[serde(with = "humantime_serde")]
    pub closed_fin: Duration,
    #[serde(with = "humantime_serde")]
    pub single_direction: Duration,
    #[serde(with = "humantime_serde")]
    pub opening_rst: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let t = FlowTimeout::default();
        Self {
            opening: t.opening,
            established: t.established,
            closing: t.closing,
            established_rst: t.established_rst,
            exception: t.exception,
            closed_fin: t.closed_fin,
            single_direction: t.single_direction,
            opening_rst: t.opening_rst,
        }
    }
}

impl From<&TimeoutConfig> for FlowTimeout {
    fn from(t: &TimeoutConfig) -> Self {
        let mut ft = FlowTimeout {
            opening: t.opening,
            established: t.established,
            closing: t.closing,
            established_rst: t.established_rst,
            exception: t.exception,
            closed_fin: t.closed_fin,
            single_direction: t.single_direction,
            opening_rst: t.opening_rst,
            ..Default::default()
        };
        ft.update_min_max();
        ft
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServiceTableConfig {
    pub ipv4_capacity: usize,
    pub ipv6_capacity: usize,
}

impl Default for ServiceTableConfig {
    fn default() -> Self {
        let c = FlowConfig::default();
        Self {
            ipv4_capacity: c.service_table_ipv4_capacity,
            ipv6_capacity: c.service_table_ipv6_capacity,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowGeneratorConfig {
    pub capacity: u32,
    pub shards: usize,
    #[serde(with = "humantime_serde")]
    pub packet_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    pub clock: Clock,
    pub timeouts: TimeoutConfig,
    pub service_table: ServiceTableConfig,
}

impl Default for FlowGeneratorConfig {
    fn default() -> Self {
        let c = FlowConfig::default();
        Self {
            capacity: c.capacity,
            shards: c.shards,
            packet_delay: c.packet_delay,
            flush_interval: c.flush_interval,
            stat_interval: c.stat_interval,
            report_interval: c.report_interval,
            clock: c.clock,
            timeouts: TimeoutConfig::default(),
            service_table: ServiceTableConfig::default(),
        }
    }
}

impl From<&FlowGeneratorConfig> for FlowConfig {
    fn from(conf: &FlowGeneratorConfig) -> Self {
        FlowConfig {
            capacity: conf.capacity,
            shards: conf.shards,
            packet_delay: conf.packet_delay,
            flush_interval: conf.flush_interval,
            stat_interval: conf.stat_interval,
            report_interval: conf.report_interval,
            clock: conf.clock,
            flow_timeout: FlowTimeout::from(&conf.timeouts),
            service_table_ipv4_capacity: conf.service_table.ipv4_capacity,
            service_table_ipv6_capacity: conf.service_table.ipv6_capacity,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PlatformConfig {
    pub entries: Vec<PlatformEntry>,
    // 为0时不缓存查询结果
    pub cache_capacity: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            entries: vec![],
            cache_capacity: 4096,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct GeoConfig {
    pub entries: Vec<GeoEntry>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_file: String,
    #[serde(with = "LevelDef")]
    pub log_level: log::Level,
    // 日志文件保留天数
    pub log_retention: usize,
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
    pub statsd_address: Option<String>,
    pub input_queue_size: usize,
    pub output_queue_size: usize,
    pub workers: usize,
    pub flow: FlowGeneratorConfig,
    pub platform: PlatformConfig,
    pub geo: GeoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: "/var/log/flow-generator/flow-generator.log".into(),
            log_level: log::Level::Info,
            log_retention: 30,
            stats_interval: Duration::from_secs(10),
            statsd_address: None,
            input_queue_size: 1 << 16,
            output_queue_size: 1 << 16,
            workers: 4,
            flow: FlowGeneratorConfig::default(),
            platform: PlatformConfig::default(),
            geo: GeoConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        let mut cfg = if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(contents)
                .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?
        };

        if !cfg.log_file.is_empty() && !Path::new(&cfg.log_file).is_absolute() {
            let Ok(mut pb) = std::env::current_dir() else {
                return Err(ConfigError::YamlConfigInvalid("get cwd failed".to_owned()));
            };
            pb.push(&cfg.log_file);
            match pb.to_str() {
                Some(s) => cfg.log_file = s.to_owned(),
                None => {
                    return Err(ConfigError::YamlConfigInvalid(format!(
                        "invalid log path {}",
                        cfg.log_file
                    )))
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let flow = &self.flow;
        if flow.shards == 0 || !flow.shards.is_power_of_two() {
            return Err(ConfigError::InvalidValue(
                "flow.shards",
                format!("{} is not a power of two", flow.shards),
            ));
        }
        let non_zero = [
            ("flow.capacity", flow.capacity as usize),
            (
                "flow.service-table.ipv4-capacity",
                flow.service_table.ipv4_capacity,
            ),
            (
                "flow.service-table.ipv6-capacity",
                flow.service_table.ipv6_capacity,
            ),
            ("input-queue-size", self.input_queue_size),
            ("output-queue-size", self.output_queue_size),
            ("workers", self.workers),
        ];
        if let Some((name, _)) = non_zero.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::InvalidValue(name, "must be positive".to_owned()));
        }

        if (flow.capacity as usize) < flow.shards {
            return Err(ConfigError::InvalidValue(
                "flow.capacity",
                format!("{} is less than shards {}", flow.capacity, flow.shards),
            ));
        }

        let t = &flow.timeouts;
        if t.opening > t.established_rst || t.established_rst > t.established {
            return Err(ConfigError::InvalidValue(
                "flow.timeouts",
                format!(
                    "opening {:?} <= established-rst {:?} <= established {:?} required",
                    t.opening, t.established_rst, t.established
                ),
            ));
        }
        if flow.stat_interval.is_zero() || flow.report_interval < flow.stat_interval {
            return Err(ConfigError::InvalidValue(
                "flow.report-interval",
                format!(
                    "{:?} is shorter than stat-interval {:?}",
                    flow.report_interval, flow.stat_interval
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(remote = "log::Level", rename_all = "kebab-case")]
enum LevelDef {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_config_is_default() {
        let c = Config::load("").expect("failed loading empty config");
        assert_eq!(c, Config::default());
        assert_eq!(FlowConfig::from(&c.flow), FlowConfig::default());
    }

    #[test]
    fn read_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
log-file: /tmp/flow-generator.log
log-level: debug
statsd-address: 127.0.0.1:8125
workers: 2
flow:
  capacity: 1024
  shards: 4
  packet-delay: 2s
  clock: system
  timeouts:
    opening: 3s
    established: 10m
    established-rst: 20s
  service-table:
    ipv4-capacity: 100
platform:
  cache-capacity: 16
  entries:
    - cidr: 10.0.0.0/8
      epc-id: 3
      region-id: 7
geo:
  entries:
    - cidr: 1.0.0.0/8
      country: AU
"#
        )
        .unwrap();

        let c = Config::load_from_file(file.path()).expect("failed loading config file");
        assert_eq!(c.log_level, log::Level::Debug);
        assert_eq!(c.statsd_address.as_deref(), Some("127.0.0.1:8125"));
        assert_eq!(c.workers, 2);
        assert_eq!(c.platform.entries.len(), 1);
        assert_eq!(c.platform.entries[0].region_id, 7);
        assert_eq!(c.geo.entries[0].country, "AU");

        let flow = FlowConfig::from(&c.flow);
        assert_eq!(flow.capacity, 1024);
        assert_eq!(flow.shards, 4);
        assert_eq!(flow.packet_delay, Duration::from_secs(2));
        assert_eq!(flow.clock, Clock::System);
        assert_eq!(flow.flow_timeout.opening, Duration::from_secs(3));
        assert_eq!(flow.flow_timeout.established, Duration::from_secs(600));
        assert_eq!(flow.flow_timeout.max, Duration::from_secs(600));
        assert_eq!(flow.service_table_ipv4_capacity, 100);
        assert_eq!(
            flow.service_table_ipv6_capacity,
            FlowConfig::default().service_table_ipv6_capacity
        );
    }

    #[test]
    fn sample_config() {
        let c = Config::load_from_file(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config/flow-generator.yaml"
        ))
        .unwrap();
        assert_eq!(c.flow.capacity, 65535);
        assert_eq!(c.platform.entries[0].subnet_id, 10);
        assert_eq!(c.geo.entries[0].country, "AU");
    }

    #[test]
    fn relative_log_file() {
        let c = Config::load("log-file: flow-generator.log").unwrap();
        assert!(Path::new(&c.log_file).is_absolute());
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(
            Config::load("flow:\n  shards: 3"),
            Err(ConfigError::InvalidValue("flow.shards", _))
        ));
        assert!(matches!(
            Config::load("flow:\n  capacity: 8\n  shards: 16"),
            Err(ConfigError::InvalidValue("flow.capacity", _))
        ));
        assert!(matches!(
            Config::load("workers: 0"),
            Err(ConfigError::InvalidValue("workers", _))
        ));
        assert!(matches!(
            Config::load("flow:\n  timeouts:\n    opening: 1h"),
            Err(ConfigError::InvalidValue("flow.timeouts", _))
        ));
        assert!(matches!(
            Config::load("flow:\n  capacity: -1"),
            Err(ConfigError::YamlConfigInvalid(_))
        ));
        assert!(matches!(
            Config::load_from_file("/nonexistent/flow-generator.yaml"),
            Err(ConfigError::YamlConfigInvalid(_))
        ));
    }
}
