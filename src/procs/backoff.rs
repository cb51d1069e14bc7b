// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::{Duration, Instant};

/// Time a daemon must stay up before its restart attempts are forgotten
pub const DEFAULT_HEALTHY: Duration = Duration::from_secs(10);
/// Number of immediate restarts before backing off
pub const DEFAULT_MIN_ATTEMPTS: u32 = 3;
/// Upper bound on the wait between restarts
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Exponential backoff for restarting a daemon.
///
/// The first `min_attempts` restarts happen immediately, after that the wait doubles with each
/// attempt starting from one second, up to `max_wait`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub healthy: Duration,
    pub min_attempts: u32,
    pub max_wait: Duration,
}

impl Backoff {
    pub fn wait(&self, attempts: u32) -> Duration {
        if attempts <= self.min_attempts {
            return Duration::ZERO;
        }

        let exp = attempts - self.min_attempts;
        match 1_u64.checked_shl(exp) {
            Some(secs) => Duration::from_secs(secs).min(self.max_wait),
            None => self.max_wait,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            healthy: DEFAULT_HEALTHY,
            min_attempts: DEFAULT_MIN_ATTEMPTS,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Restart attempts made since the daemon was last considered healthy
#[derive(Debug)]
pub struct Attempts {
    backoff: Backoff,
    count: u32,
    deadline: Option<Instant>,
}

impl Attempts {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            count: 0,
            deadline: None,
        }
    }

    /// Record a new launch attempt at `now`, returning how long to wait before making it
    pub fn next(&mut self, now: Instant) -> Duration {
        // the previous launch outlived the healthy window
        if self.deadline.map_or(false, |deadline| now > deadline) {
            self.count = 0;
        }

        self.deadline = Some(now + self.backoff.healthy);
        self.count = self.count.saturating_add(1);

        self.backoff.wait(self.count)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
