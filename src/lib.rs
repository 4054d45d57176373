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

pub mod agent;
pub mod common;
pub mod config;
pub mod dispatcher;
pub mod flow_generator;
pub mod platform;
pub mod sender;
pub mod utils;

// for benchmarks
#[doc(hidden)]
pub use flow_generator::{
    _new_flow_map_and_receiver, _new_meta_packet, _reverse_meta_packet,
};
