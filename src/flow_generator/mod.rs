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

mod error;
mod flow_config;
mod flow_map;
mod flow_node;
mod flow_state;
mod handler;
mod service_table;

pub use error::{Error, Result};
pub use flow_config::{Clock, FlowAccess, FlowConfig, FlowTimeout, TimeoutKind};
pub use flow_map::{
    _new_flow_map_and_receiver, _new_meta_packet, _reverse_meta_packet, FlowMap, FlowMapCounter,
};
pub use flow_node::{FlowMapKey, FlowNode};
pub use flow_state::{FlowState, StateMachine, StateValue};
pub use service_table::{ServiceKey, ServiceTable};

use std::time::Duration;

const FLOW_METRICS_PEER_SRC: usize = 0;
const FLOW_METRICS_PEER_DST: usize = 1;
const TIME_UNIT: Duration = Duration::from_secs(1);
const TIME_MAX_INTERVAL: Duration = Duration::from_secs(5);
const QUEUE_BATCH_SIZE: usize = 1024;
const STATISTICAL_INTERVAL: Duration = Duration::from_secs(1);
const THREAD_FLOW_ID_MASK: u64 = 0xFF;
const TIMER_FLOW_ID_MASK: u64 = 0xFFFFFFFF;
const COUNTER_FLOW_ID_MASK: u64 = 0xFFFFFF;
// 暂定的Ipv4 ServiceTable LRU cache 容量
const SERVICE_TABLE_IPV4_CAPACITY: usize = 2048;
// 暂定的Ipv6 ServiceTable LRU cache 容量
const SERVICE_TABLE_IPV6_CAPACITY: usize = 256;
