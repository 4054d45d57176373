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

// This module provides a 8B timestamp struct for memory-sensitive structs
// std::time::Duration is 16B

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serializer;

#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as u64)
    }
}

impl From<Timestamp> for Duration {
    fn from(t: Timestamp) -> Self {
        Self::from_nanos(t.as_nanos())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Duration::from(*self).fmt(f)
    }
}

impl Timestamp {
    const NANOS_IN_SECOND: u64 = Duration::from_secs(1).as_nanos() as u64;
    const NANOS_IN_MICROS: u64 = Duration::from_micros(1).as_nanos() as u64;

    pub const ZERO: Self = Self(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub const fn as_micros(&self) -> u64 {
        self.0 / Self::NANOS_IN_MICROS
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * Self::NANOS_IN_SECOND)
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / Self::NANOS_IN_SECOND
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn round_to(&self, rhs: Self) -> Self {
        if rhs.0 == 0 {
            return *self;
        }
        Self(self.0 / rhs.0 * rhs.0)
    }

    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from)
            .unwrap_or_default()
    }
}

impl PartialEq<Duration> for Timestamp {
    fn eq(&self, other: &Duration) -> bool {
        self.0.eq(&(other.as_nanos() as u64))
    }
}

impl PartialOrd<Duration> for Timestamp {
    fn partial_cmp(&self, other: &Duration) -> Option<Ordering> {
        Some(self.0.cmp(&(other.as_nanos() as u64)))
    }
}

impl Add for Timestamp {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self + Self::from(rhs)
    }
}

impl AddAssign for Timestamp {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

// packet timestamps are not ordered across workers, so subtraction clamps at zero
impl Sub for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        self - Self::from(rhs)
    }
}

pub fn timestamp_to_micros<S>(d: &Timestamp, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(d.as_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion() {
        let d = Duration::from_secs(123);
        assert_eq!(d, Duration::from(Timestamp::from(d)));
        assert_eq!(Timestamp::from_secs(3).as_micros(), 3_000_000);
    }

    #[test]
    fn comparison() {
        let t = Timestamp::from_secs(10);
        assert!(t > Duration::from_secs(9));
        assert!(t == Duration::from_secs(10));
        assert!(t < Duration::from_millis(10_001));
    }

    #[test]
    fn subtraction_clamps_at_zero() {
        let t = Timestamp::from_secs(1) - Timestamp::from_secs(2);
        assert!(t.is_zero());
        assert_eq!(
            Timestamp::from_secs(5) - Duration::from_secs(2),
            Timestamp::from_secs(3)
        );
    }

    #[test]
    fn round_to_second() {
        let t = Timestamp::from_nanos(1_700_000_001);
        assert_eq!(t.round_to(Timestamp::from_secs(1)), Timestamp::from_secs(1));
    }
}
