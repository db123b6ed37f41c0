//! Admission control for disruptive operations.
//!
//! A [`RequestLimiter`] wraps a token bucket (one token, refilled once per
//! interval) so a request handler never waits on the bucket for more than a
//! short grace period. If the token is not available within that period the
//! check is rejected with a "try again after" hint instead of blocking.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Longest a check waits for the bucket before rejecting.
pub const CHECK_GRACE_PERIOD: Duration = Duration::from_millis(5);

/// Message for an admitted request.
pub const OK_MESSAGE: &str = "OK";

/// Outcome of [`RequestLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    /// The request may proceed.
    Ok,
    /// The cluster root token was canceled.
    RootCanceled,
    /// The bucket wait was canceled before it completed.
    Canceled,
    /// The token is not available yet.
    Exceeded {
        /// Time left until the interval since the last request elapses,
        /// rounded down to milliseconds.
        retry_after: Duration,
    },
}

impl LimitDecision {
    /// True if the request may proceed.
    pub fn is_ok(&self) -> bool {
        matches!(self, LimitDecision::Ok)
    }

    /// Message shown to the caller.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LimitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitDecision::Ok => f.write_str(OK_MESSAGE),
            LimitDecision::RootCanceled => f.write_str("root context canceled"),
            LimitDecision::Canceled => f.write_str("context canceled"),
            LimitDecision::Exceeded { retry_after } => write!(
                f,
                "rate limit exceeded (try again after {})",
                format_duration(*retry_after)
            ),
        }
    }
}

/// Token bucket with a fractional token count.
///
/// Reservations may drive the count negative; the deficit is the time the
/// reservation has to wait. A canceled reservation gives its token back.
#[derive(Debug)]
struct TokenBucket {
    /// Tokens added per second.
    rate: f64,
    /// Bucket capacity.
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(interval: Duration, burst: u32) -> Self {
        Self {
            rate: rate_for(interval),
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token, returning how long the caller must wait for it.
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 || self.rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / self.rate)
    }

    fn cancel_reservation(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + 1.0).min(self.burst);
    }

    fn set_rate(&mut self, now: Instant, interval: Duration) {
        self.refill(now);
        self.rate = rate_for(interval);
    }
}

fn rate_for(interval: Duration) -> f64 {
    if interval.is_zero() {
        f64::INFINITY
    } else {
        1.0 / interval.as_secs_f64()
    }
}

#[derive(Debug)]
struct LimiterState {
    interval: Duration,
    bucket: TokenBucket,
    last_request: Option<Instant>,
}

/// Allows one guarded request per interval.
///
/// Safe to share between request handlers. Callers pair a successful
/// [`check`](RequestLimiter::check) with [`advance`](RequestLimiter::advance)
/// once the guarded action actually ran.
#[derive(Debug)]
pub struct RequestLimiter {
    root: CancellationToken,
    state: Mutex<LimiterState>,
}

impl RequestLimiter {
    /// Create a limiter scoped to `root` that admits one request per `interval`.
    pub fn new(root: CancellationToken, interval: Duration) -> Self {
        Self {
            root,
            state: Mutex::new(LimiterState {
                interval,
                bucket: TokenBucket::new(interval, 1),
                last_request: None,
            }),
        }
    }

    /// Decide whether a request may proceed, waiting at most
    /// [`CHECK_GRACE_PERIOD`].
    pub async fn check(&self) -> LimitDecision {
        if self.root.is_cancelled() {
            return LimitDecision::RootCanceled;
        }

        let reserved_at = Instant::now();
        let delay = self.state.lock().bucket.reserve(reserved_at);

        let wait_token = self.root.child_token();
        let wait = async {
            tokio::select! {
                _ = wait_token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        };

        let decision = tokio::select! {
            biased;
            _ = self.root.cancelled() => LimitDecision::RootCanceled,
            granted = wait => {
                if granted {
                    LimitDecision::Ok
                } else {
                    LimitDecision::Canceled
                }
            }
            _ = tokio::time::sleep(CHECK_GRACE_PERIOD) => {
                let state = self.state.lock();
                let since = state
                    .last_request
                    .map(|t| t.elapsed())
                    .unwrap_or(state.interval);
                // An admitted request that never advanced still holds the token.
                let deficit = (reserved_at + delay).saturating_duration_since(Instant::now());
                LimitDecision::Exceeded {
                    retry_after: round_down_millis(
                        state.interval.saturating_sub(since).max(deficit),
                    ),
                }
            }
        };

        wait_token.cancel();
        if !decision.is_ok() {
            self.state.lock().bucket.cancel_reservation(Instant::now());
        }
        decision
    }

    /// Record that the admitted request was performed.
    pub fn advance(&self) {
        self.state.lock().last_request = Some(Instant::now());
    }

    /// Change the interval between admitted requests.
    pub fn set_interval(&self, interval: Duration) {
        let mut state = self.state.lock();
        state.bucket.set_rate(Instant::now(), interval);
        state.interval = interval;
    }

    /// Current interval.
    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }
}

fn round_down_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Compact duration text ("1m30s", "2.5s", "300ms").
fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }
    if total_ms < 1000 {
        return format!("{}ms", total_ms);
    }

    let minutes = total_ms / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    let mut out = String::new();
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if millis == 0 {
        out.push_str(&format!("{}s", secs));
    } else {
        let frac = format!("{:03}", millis);
        out.push_str(&format!("{}.{}s", secs, frac.trim_end_matches('0')));
    }
    out
}
