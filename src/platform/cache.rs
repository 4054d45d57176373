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

use std::hash::Hash;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use lru::LruCache;
use parking_lot::Mutex;

use super::{GeoResolver, PlatformDataResolver};
use crate::common::platform_data::{GeoInfo, PlatformData};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

#[derive(Default)]
pub struct CacheCounter {
    hit: AtomicU64,
    miss: AtomicU64,
}

impl RefCountable for CacheCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "hit",
                CounterType::Counted,
                CounterValue::Unsigned(self.hit.swap(0, Ordering::Relaxed)),
            ),
            (
                "miss",
                CounterType::Counted,
                CounterValue::Unsigned(self.miss.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

// 查询结果（包括查不到）缓存在LRU中，慢查询只影响第一次
pub struct CachedResolver<R, K: Hash + Eq, V> {
    inner: R,
    cache: Mutex<LruCache<K, Option<V>>>,
    counter: Arc<CacheCounter>,
}

impl<R, K: Hash + Eq, V: Clone> CachedResolver<R, K, V> {
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            counter: Arc::new(CacheCounter::default()),
        }
    }

    pub fn counter(&self) -> &Arc<CacheCounter> {
        &self.counter
    }

    fn get_or_lookup<F: FnOnce() -> Option<V>>(&self, key: K, lookup: F) -> Option<V> {
        if let Some(v) = self.cache.lock().get(&key) {
            self.counter.hit.fetch_add(1, Ordering::Relaxed);
            return v.clone();
        }
        self.counter.miss.fetch_add(1, Ordering::Relaxed);
        // 查询时不持有锁
        let v = lookup();
        self.cache.lock().put(key, v.clone());
        v
    }
}

impl<R: PlatformDataResolver> PlatformDataResolver
    for CachedResolver<R, (i32, IpAddr), PlatformData>
{
    fn lookup(&self, epc_id: i32, ip: IpAddr) -> Option<PlatformData> {
        self.get_or_lookup((epc_id, ip), || self.inner.lookup(epc_id, ip))
    }
}

impl<R: GeoResolver> GeoResolver for CachedResolver<R, IpAddr, GeoInfo> {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        self.get_or_lookup(ip, || self.inner.lookup(ip))
    }
}
