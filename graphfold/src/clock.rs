/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The clock allows us to control the behaviour of all time dependent
//! scheduling decisions, in both real and manually-driven time.

use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// A coarse monotonic time source.
///
/// Readings are offsets from an arbitrary fixed epoch; only differences
/// between readings are meaningful. Scheduling tolerates low precision:
/// periods are prescriptive lower bounds, not deadlines.
pub trait Clock: Send + Sync + 'static {
    /// The current time as an offset from the clock's epoch.
    fn now(&self) -> Duration;
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// The wall clock, for production use. Its epoch is the first reading
/// taken in the process.
#[derive(Debug, Clone, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Duration {
        EPOCH.elapsed()
    }
}

/// A clock that advances only when told to, for deterministic tests of
/// time-dependent behavior.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// A manual clock reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by the given amount.
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// Set the clock to an absolute offset from its epoch.
    pub fn set(&self, to: Duration) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}
