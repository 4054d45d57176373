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

pub mod endpoint;
pub mod enums;
pub mod flow;
pub mod lookup_key;
pub mod meta_packet;
pub mod platform_data;
pub mod tagged_flow;
pub mod timestamp;

pub use meta_packet::MetaPacket;
pub use tagged_flow::TaggedFlow;
pub use timestamp::{timestamp_to_micros, Timestamp};
