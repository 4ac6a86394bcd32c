//! Redemption-attempt rate limiting.

use chrono::Duration;

/// Fixed-window failed-attempt limit per source identity.
///
/// This is an abuse deterrent, not a precise limiter: a source can burst up
/// to `2 * max_attempts - 1` failures across a window boundary. That
/// trade-off is accepted deliberately: the counter lives in the shared
/// store, costs one increment per failed attempt, and needs no sliding
/// bookkeeping. Successful redemptions never touch the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Failed attempts allowed inside one window.
    pub max_attempts: u32,
    /// Window length; the TTL is re-armed on every failure.
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }

    /// Is a source with `current` failures inside the window blocked?
    pub fn is_blocked(&self, current: u32) -> bool {
        current >= self.max_attempts
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::seconds(3600),
        }
    }
}
