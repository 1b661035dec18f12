use std::time::Duration;
use thiserror::Error;

/// A per-limiter throttling policy: how many requests each key may make
/// within one fixed window.
///
/// Note that a fixed-window counter resets at window boundaries rather than
/// continuously, so a client can burst up to `2 * max_requests` requests
/// around a boundary (the tail of one window plus the head of the next).
/// This is the accepted trade-off for O(1) memory per key; callers that
/// cannot tolerate boundary bursts should size `max_requests` accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    window: Duration,
    max_requests: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("throttle window must be non-zero")]
    ZeroWindow,
    #[error("throttle max_requests must be non-zero")]
    ZeroMaxRequests,
}

impl Quota {
    /// Create a quota of `max_requests` per `window`.
    ///
    /// Fails if either value is zero, so a limiter can never be built
    /// misconfigured.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self, QuotaError> {
        if window.is_zero() {
            return Err(QuotaError::ZeroWindow);
        }
        if max_requests == 0 {
            return Err(QuotaError::ZeroMaxRequests);
        }
        Ok(Self {
            window,
            max_requests,
        })
    }

    /// General traffic preset: 100 requests per 15 minutes.
    pub fn standard() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
        }
    }

    /// Authentication preset: 5 requests per 15 minutes.
    ///
    /// Intended to be paired with a composite key of client address plus the
    /// submitted credential identifier, so that credential stuffing is slowed
    /// both for one account hit from many addresses and for many accounts
    /// hit from one address.
    pub fn auth() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 5,
        }
    }

    /// High-value operation preset: 3 requests per hour.
    pub fn sensitive() -> Self {
        Self {
            window: Duration::from_secs(60 * 60),
            max_requests: 3,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}
