use crate::policy::Quota;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60 * 10;

/// Outcome of evaluating a request against its key's quota.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Admitted,
    Rejected,
}

impl Decision {
    pub fn from_admitted(admitted: bool) -> Self {
        if admitted {
            Self::Admitted
        } else {
            Self::Rejected
        }
    }

    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }

    pub fn is_rejected(self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Quota accounting for one evaluated request, used to annotate the
/// outgoing response regardless of the decision.
#[derive(Debug, Clone)]
pub struct QuotaStatus {
    /// Total number of requests permitted per key within one window.
    pub limit: u64,
    /// Requests left in the current window, floored at 0.
    pub remaining: u64,
    /// Time at which the current window ends and the count resets.
    pub reset: Instant,
}

impl QuotaStatus {
    /// Seconds until the window resets, rounded upwards so that waiting for
    /// the returned duration is guaranteed to land in a fresh window.
    pub fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }

    /// The window reset expressed as seconds since the Unix epoch.
    ///
    /// Derived from the wall clock at call time; a clock step between
    /// evaluation and annotation shifts this value accordingly.
    pub fn reset_epoch_seconds(&self) -> u64 {
        let until_reset = self.reset.saturating_duration_since(Instant::now());
        SystemTime::now()
            .checked_add(until_reset)
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|since_epoch| since_epoch.as_secs())
            .unwrap_or(0)
    }
}

struct ThrottleEntry {
    count: u64,
    window_reset_at: Instant,
}

/// Per-limiter request accounting: a map from throttle key to the count of
/// requests seen in that key's current window.
///
/// Cheaply cloneable; clones share the same underlying map, so a registry
/// built outside the actix `App` factory is shared across all workers. Each
/// read-modify-write runs under the map's per-shard entry guard, which
/// serializes concurrent evaluations of the same key.
///
/// A background sweep periodically drops entries whose window has already
/// ended. This bounds memory only: an expired entry that has not yet been
/// swept behaves identically to an absent one on its next evaluation. The
/// sweep task is aborted when the last handle to the registry drops.
#[derive(Clone)]
pub struct ThrottleRegistry {
    entries: Arc<DashMap<String, ThrottleEntry>>,
    sweeper: Option<Arc<Sweeper>>,
}

struct Sweeper(JoinHandle<()>);

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ThrottleRegistry {
    pub fn builder() -> ThrottleRegistryBuilder {
        ThrottleRegistryBuilder {
            sweep_interval: Some(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS)),
        }
    }

    fn sweeper(entries: Arc<DashMap<String, ThrottleEntry>>, interval: Duration) -> JoinHandle<()> {
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_k, entry| entry.window_reset_at > now);
                let removed = before.saturating_sub(entries.len());
                if removed > 0 {
                    log::debug!("throttle sweep removed {removed} expired entries");
                }
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }

    /// Count one request against `key` and decide whether to admit it.
    ///
    /// The first request from a key, or the first after its window has ended,
    /// starts a fresh window with a count of 1. Every later request within
    /// the window increments the count whether or not it is admitted; the
    /// request is rejected once the count exceeds the quota.
    pub fn evaluate(&self, key: &str, quota: Quota) -> (Decision, QuotaStatus) {
        let now = Instant::now();
        let mut count = 1;
        let mut reset = now
            .checked_add(quota.window())
            .expect("Throttle window unexpectedly large");
        self.entries
            .entry(key.to_owned())
            .and_modify(|entry| {
                if entry.window_reset_at > now {
                    // Window still open: count this request against it.
                    entry.count += 1;
                    count = entry.count;
                    reset = entry.window_reset_at;
                } else {
                    // Window ended: this request starts the next one.
                    entry.count = count;
                    entry.window_reset_at = reset;
                }
            })
            .or_insert_with(|| ThrottleEntry {
                count,
                window_reset_at: reset,
            });
        let decision = Decision::from_admitted(count <= quota.max_requests());
        let status = QuotaStatus {
            limit: quota.max_requests(),
            remaining: quota.max_requests().saturating_sub(count),
            reset,
        };
        (decision, status)
    }

    /// Un-count a previously evaluated request for `key`.
    ///
    /// Used to exclude requests after the fact, e.g. responses that failed
    /// with a server error. Saturates at zero and is a no-op for unknown
    /// keys.
    pub fn rollback(&self, key: &str) {
        self.entries.entry(key.to_owned()).and_modify(|entry| {
            entry.count = entry.count.saturating_sub(1);
        });
    }

    /// Drop the entry for `key`, resetting its quota immediately.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of keys currently tracked, including not-yet-swept expired
    /// entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct ThrottleRegistryBuilder {
    sweep_interval: Option<Duration>,
}

impl ThrottleRegistryBuilder {
    /// Override the default sweep interval.
    ///
    /// Set to `None` to disable the background sweep entirely; expired
    /// entries then linger until their key is next evaluated or removed.
    /// Disabling also makes the registry usable without an async runtime.
    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn build(self) -> ThrottleRegistry {
        let entries = Arc::new(DashMap::<String, ThrottleEntry>::new());
        let sweeper = self.sweep_interval.map(|interval| {
            assert!(
                interval.as_secs_f64() > 0f64,
                "Sweep interval must be non-zero"
            );
            Arc::new(Sweeper(ThrottleRegistry::sweeper(
                entries.clone(),
                interval,
            )))
        });
        ThrottleRegistry { entries, sweeper }
    }
}
