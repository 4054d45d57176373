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

use serde::Serialize;

// topology context attached to one side of a flow
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformData {
    pub epc_id: i32,
    pub region_id: u32,
    pub subnet_id: u32,
    pub pod_id: u32,
    pub is_local: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GeoInfo {
    pub country: String,
    pub region: String,
    pub isp: String,
}
