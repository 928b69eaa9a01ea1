//! Fixed-window rate limiting
//!
//! One bucket per `METHOD path` key. The window boundary is anchored to the
//! first request of the current window (read from the injected [`Clock`]), so
//! replaying the same request sequence against the same configuration always
//! yields the identical allow/deny sequence.
//!
//! A limit of exactly N allows exactly N requests in-window; the (N+1)th is
//! denied. Misconfiguration (a zero limit) surfaces as an internal error so
//! the orchestrator can apply the fail-closed policy.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::{Error, Result};

/// Endpoint class, resolved from configured path prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Invoice import endpoints (most expensive; tightest limit)
    Import,
    /// Heavy read endpoints (listings, offer queries)
    HeavyRead,
    /// Everything else
    Default,
}

impl EndpointClass {
    /// Lowercase name for logging.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::HeavyRead => "heavy_read",
            Self::Default => "default",
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request may proceed.
    Allowed {
        /// Permits left in the current window after this request.
        remaining: u32,
    },
    /// The request is over quota for the current window.
    Denied {
        /// Seconds until the window resets; at most `window + 1`.
        retry_after_seconds: u64,
    },
}

impl RateDecision {
    /// Whether the request was allowed.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Fixed-window rate limiter keyed by endpoint.
#[derive(Debug)]
pub struct RateLimitGuard {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl RateLimitGuard {
    /// Create a limiter from configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: DashMap::new(),
        }
    }

    /// Resolve the endpoint class from configured path prefixes.
    #[must_use]
    pub fn classify(&self, endpoint: &str) -> EndpointClass {
        if self
            .config
            .import_prefixes
            .iter()
            .any(|p| endpoint.starts_with(p.as_str()))
        {
            EndpointClass::Import
        } else if self
            .config
            .heavy_read_prefixes
            .iter()
            .any(|p| endpoint.starts_with(p.as_str()))
        {
            EndpointClass::HeavyRead
        } else {
            EndpointClass::Default
        }
    }

    /// Count this request against the endpoint's window and decide.
    ///
    /// Denied requests are still counted as attempts; the caller records the
    /// decision metric either way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the class limit is zero (missing
    /// configuration). The orchestrator turns this into a denial when
    /// `fail_closed` is set.
    pub fn check_request(&self, endpoint: &str, method: &str) -> Result<RateDecision> {
        let class = self.classify(endpoint);
        let limit = self.limit_for(class)?;

        let bucket = self.bucket(endpoint, method);
        let mut bucket = bucket.lock();
        let now = self.clock.now();

        if now.duration_since(bucket.window_start) >= self.config.window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.count += 1;

        if bucket.count > limit {
            debug!(
                endpoint,
                method,
                class = class.as_str(),
                count = bucket.count,
                limit,
                "Rate limit exceeded"
            );
            Ok(RateDecision::Denied {
                retry_after_seconds: self.seconds_until_reset(&bucket, now),
            })
        } else {
            Ok(RateDecision::Allowed {
                remaining: limit - bucket.count,
            })
        }
    }

    /// Seconds until the endpoint's current window resets.
    ///
    /// Zero when the endpoint has no bucket yet; never exceeds `window + 1`.
    #[must_use]
    pub fn retry_after(&self, endpoint: &str, method: &str) -> u64 {
        let key = Self::key(endpoint, method);
        self.buckets.get(&key).map_or(0, |bucket| {
            let bucket = bucket.lock();
            self.seconds_until_reset(&bucket, self.clock.now())
        })
    }

    /// Clear all windows (test/administrative use).
    pub fn reset(&self) {
        self.buckets.clear();
    }

    fn seconds_until_reset(&self, bucket: &Bucket, now: Instant) -> u64 {
        let elapsed = now.duration_since(bucket.window_start);
        let remaining = self.config.window.saturating_sub(elapsed);
        // Round up so callers never retry early; bounded by window + 1.
        let seconds = remaining.as_secs_f64().ceil();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let seconds = seconds as u64;
        seconds.min(self.config.window.as_secs() + 1)
    }

    fn limit_for(&self, class: EndpointClass) -> Result<u32> {
        let limit = match class {
            EndpointClass::Import => self.config.import_limit,
            EndpointClass::HeavyRead => self.config.heavy_read_limit,
            EndpointClass::Default => self.config.default_limit,
        };
        if limit == 0 {
            return Err(Error::Config(format!(
                "rate limit for class '{}' is zero",
                class.as_str()
            )));
        }
        Ok(limit)
    }

    fn bucket(&self, endpoint: &str, method: &str) -> Arc<Mutex<Bucket>> {
        let now = self.clock.now();
        self.buckets
            .entry(Self::key(endpoint, method))
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    window_start: now,
                    count: 0,
                }))
            })
            .clone()
    }

    fn key(endpoint: &str, method: &str) -> String {
        format!("{method} {endpoint}")
    }
}
