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

use std::cmp::Reverse;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Deserialize;

use super::{GeoResolver, PlatformDataResolver};
use crate::common::platform_data::{GeoInfo, PlatformData};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformEntry {
    pub cidr: IpNet,
    // 0表示匹配任意VPC
    #[serde(default)]
    pub epc_id: i32,
    #[serde(default)]
    pub region_id: u32,
    #[serde(default)]
    pub subnet_id: u32,
    #[serde(default)]
    pub pod_id: u32,
    #[serde(default)]
    pub is_local: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct GeoEntry {
    pub cidr: IpNet,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub isp: String,
}

// 最长前缀匹配，条目按掩码长度降序排列
pub struct StaticPlatformTable(Vec<PlatformEntry>);

impl StaticPlatformTable {
    pub fn new(entries: &[PlatformEntry]) -> Self {
        let mut entries = entries.to_vec();
        entries.sort_by_key(|e| Reverse(e.cidr.prefix_len()));
        Self(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PlatformDataResolver for StaticPlatformTable {
    fn lookup(&self, epc_id: i32, ip: IpAddr) -> Option<PlatformData> {
        self.0
            .iter()
            .find(|e| (e.epc_id == 0 || e.epc_id == epc_id) && e.cidr.contains(&ip))
            .map(|e| PlatformData {
                epc_id: e.epc_id,
                region_id: e.region_id,
                subnet_id: e.subnet_id,
                pod_id: e.pod_id,
                is_local: e.is_local,
            })
    }
}

pub struct StaticGeoTable(Vec<GeoEntry>);

impl StaticGeoTable {
    pub fn new(entries: &[GeoEntry]) -> Self {
        let mut entries = entries.to_vec();
        entries.sort_by_key(|e| Reverse(e.cidr.prefix_len()));
        Self(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl GeoResolver for StaticGeoTable {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        self.0
            .iter()
            .find(|e| e.cidr.contains(&ip))
            .map(|e| GeoInfo {
                country: e.country.clone(),
                region: e.region.clone(),
                isp: e.isp.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn platform(cidr: &str, epc_id: i32, subnet_id: u32) -> PlatformEntry {
        PlatformEntry {
            cidr: cidr.parse().unwrap(),
            epc_id,
            region_id: 1,
            subnet_id,
            pod_id: 0,
            is_local: false,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = StaticPlatformTable::new(&[
            platform("10.0.0.0/8", 0, 1),
            platform("10.1.0.0/16", 0, 2),
        ]);
        let ip: IpAddr = Ipv4Addr::new(10, 1, 2, 3).into();
        assert_eq!(table.lookup(5, ip).unwrap().subnet_id, 2);
        let ip: IpAddr = Ipv4Addr::new(10, 2, 2, 3).into();
        assert_eq!(table.lookup(5, ip).unwrap().subnet_id, 1);
        let ip: IpAddr = Ipv4Addr::new(11, 2, 2, 3).into();
        assert!(table.lookup(5, ip).is_none());
    }

    #[test]
    fn epc_filter() {
        let table = StaticPlatformTable::new(&[platform("192.168.0.0/16", 7, 9)]);
        let ip: IpAddr = Ipv4Addr::new(192, 168, 1, 1).into();
        assert!(table.lookup(7, ip).is_some());
        assert!(table.lookup(8, ip).is_none());
    }

    #[test]
    fn geo_v6() {
        let table = StaticGeoTable::new(&[GeoEntry {
            cidr: "2001:db8::/32".parse().unwrap(),
            country: "JPN".to_owned(),
            region: "Tokyo".to_owned(),
            isp: String::new(),
        }]);
        let ip: IpAddr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).into();
        assert_eq!(table.lookup(ip).unwrap().region, "Tokyo");
        assert!(table.lookup(Ipv4Addr::new(1, 1, 1, 1).into()).is_none());
    }
}
