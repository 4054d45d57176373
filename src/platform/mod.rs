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

mod cache;
mod static_table;

pub use cache::{CacheCounter, CachedResolver};
pub use static_table::{GeoEntry, PlatformEntry, StaticGeoTable, StaticPlatformTable};

use std::net::IpAddr;
use std::sync::Arc;

use crate::common::{
    flow::Flow,
    platform_data::{GeoInfo, PlatformData},
};

pub trait PlatformDataResolver: Send + Sync {
    fn lookup(&self, epc_id: i32, ip: IpAddr) -> Option<PlatformData>;
}

pub trait GeoResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// 流创建时为两端补充平台信息和地理信息，每条流只调用一次。
///
/// 查询不到平台信息的一端视为外网地址，再查询地理信息；查询失败保持默认值。
#[derive(Clone, Default)]
pub struct Enricher {
    platform: Option<Arc<dyn PlatformDataResolver>>,
    geo: Option<Arc<dyn GeoResolver>>,
}

impl Enricher {
    pub fn new(
        platform: Option<Arc<dyn PlatformDataResolver>>,
        geo: Option<Arc<dyn GeoResolver>>,
    ) -> Self {
        Self { platform, geo }
    }

    pub fn enrich(&self, flow: &mut Flow) {
        let ips = [flow.flow_key.ip_src, flow.flow_key.ip_dst];
        for (peer, ip) in flow.flow_metrics_peers.iter_mut().zip(ips) {
            let platform_data = self
                .platform
                .as_ref()
                .and_then(|p| p.lookup(peer.l3_epc_id, ip));
            match platform_data {
                Some(data) => peer.update_platform_data(&data),
                None => {
                    peer.geo = self
                        .geo
                        .as_ref()
                        .and_then(|g| g.lookup(ip))
                        .map(Arc::new)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::flow::FlowKey;

    struct OnlyTen;

    impl PlatformDataResolver for OnlyTen {
        fn lookup(&self, _: i32, ip: IpAddr) -> Option<PlatformData> {
            match ip {
                IpAddr::V4(v4) if v4.octets()[0] == 10 => Some(PlatformData {
                    epc_id: 1,
                    region_id: 3,
                    subnet_id: 4,
                    pod_id: 5,
                    is_local: true,
                }),
                _ => None,
            }
        }
    }

    struct Earth;

    impl GeoResolver for Earth {
        fn lookup(&self, _: IpAddr) -> Option<GeoInfo> {
            Some(GeoInfo {
                country: "CHN".to_owned(),
                region: "Beijing".to_owned(),
                isp: "unicom".to_owned(),
            })
        }
    }

    fn flow() -> Flow {
        Flow {
            flow_key: FlowKey {
                ip_src: Ipv4Addr::new(10, 1, 1, 1).into(),
                ip_dst: Ipv4Addr::new(8, 8, 8, 8).into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn platform_then_geo() {
        let enricher = Enricher::new(Some(Arc::new(OnlyTen)), Some(Arc::new(Earth)));
        let mut flow = flow();
        enricher.enrich(&mut flow);
        let (src, dst) = (&flow.flow_metrics_peers[0], &flow.flow_metrics_peers[1]);
        assert_eq!((src.region_id, src.subnet_id, src.pod_id), (3, 4, 5));
        assert!(src.is_device && src.is_local_ip);
        assert!(src.geo.is_none());
        assert_eq!(dst.region_id, 0);
        assert_eq!(dst.geo.as_ref().unwrap().country, "CHN");
    }

    #[test]
    fn no_resolvers_keep_defaults() {
        let mut flow = flow();
        Enricher::default().enrich(&mut flow);
        assert!(flow.flow_metrics_peers.iter().all(|p| p.geo.is_none()));
        assert!(flow.flow_metrics_peers.iter().all(|p| !p.is_device));
    }
}
