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

pub const EPC_FROM_DEEPFLOW: i32 = -1;
pub const EPC_FROM_INTERNET: i32 = -2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    pub l3_epc_id: i32, // 负数表示特殊值
    pub l2_end: bool,
    pub l3_end: bool,
    pub is_device: bool,
    pub is_local_ip: bool,
}

impl EndpointInfo {
    pub fn with_epc(l3_epc_id: i32) -> Self {
        Self {
            l3_epc_id,
            ..Default::default()
        }
    }
}

impl Default for EndpointInfo {
    fn default() -> EndpointInfo {
        EndpointInfo {
            l3_epc_id: EPC_FROM_INTERNET,
            l2_end: false,
            l3_end: false,
            is_device: false,
            is_local_ip: false,
        }
    }
}

// resolved before the packet reaches the flow map, read only afterwards
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointData {
    pub src_info: EndpointInfo,
    pub dst_info: EndpointInfo,
}

impl EndpointData {
    pub fn new(src: EndpointInfo, dst: EndpointInfo) -> EndpointData {
        EndpointData {
            src_info: src,
            dst_info: dst,
        }
    }

    pub fn reversed(&self) -> EndpointData {
        EndpointData {
            src_info: self.dst_info,
            dst_info: self.src_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_endpoint_is_internet() {
        let info = EndpointInfo::default();
        assert_eq!(info.l3_epc_id, EPC_FROM_INTERNET);
        assert!(!info.is_device);
    }

    #[test]
    fn reversed_swaps_sides() {
        let data = EndpointData::new(EndpointInfo::with_epc(3), EndpointInfo::with_epc(7));
        let r = data.reversed();
        assert_eq!(r.src_info.l3_epc_id, 7);
        assert_eq!(r.dst_info.l3_epc_id, 3);
        assert_eq!(r.reversed(), data);
    }
}
