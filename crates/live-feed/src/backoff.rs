// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reconnection backoff policy.
//!
//! Delays double with every attempt: `base * 2^(attempt - 1)`. The policy
//! carries the attempt ceiling; the connection stops retrying once it is
//! exceeded and reports the failure as terminal.

use std::time::Duration;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff with an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for attempt 1.
    pub base_delay: Duration,
    /// Highest attempt number that may be scheduled.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the given base delay and attempt ceiling.
    #[must_use]
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Attempt 0 is treated as attempt 1. The result saturates instead of
    /// overflowing for very large attempt numbers.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Whether `attempt` is still within the ceiling.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay for `attempt`, or `None` once the ceiling is exceeded.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        self.allows(attempt).then(|| self.next_delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), 5);
        for attempt in 1..=5u32 {
            let expected = Duration::from_millis(250) * 2u32.pow(attempt - 1);
            assert_eq!(policy.next_delay(attempt), expected);
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn test_no_sixth_attempt() {
        let policy = BackoffPolicy::default();
        assert!(policy.delay_for(5).is_some());
        assert!(policy.delay_for(6).is_none());
        assert!(!policy.allows(6));
    }

    #[test]
    fn test_large_attempt_saturates() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), u32::MAX);
        assert_eq!(policy.next_delay(200), Duration::from_secs(1).saturating_mul(u32::MAX));
    }
}
