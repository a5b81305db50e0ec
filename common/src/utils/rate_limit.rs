use std::{collections::VecDeque, future::Future, sync::Arc, sync::OnceLock, time::Duration};

use rand::Rng;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{info, warn};

use crate::error::AppError;

const WINDOW: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: usize = 5;
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const RETRY_HINT_MARGIN: f64 = 0.5;

fn retry_hint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Matches the wait suggestion the provider embeds in 429 messages.
        #[allow(clippy::unwrap_used)]
        Regex::new(r"Please try again in (\d+(?:\.\d+)?)s").unwrap()
    })
}

/// Parses the provider-suggested wait out of a rate-limit error message.
pub fn parse_retry_hint(message: &str) -> Option<f64> {
    retry_hint_pattern()
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Sliding-window request budget shared by every outbound provider call.
///
/// The timestamp deque is the only mutable state; it is guarded by an
/// async-aware mutex so concurrent request handlers serialize their
/// admission checks. The sleep happens while the lock is held, which is
/// what enforces the budget under contention.
pub struct RateLimiter {
    rpm_limit: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(rpm_limit: usize) -> Self {
        Self {
            rpm_limit: rpm_limit.max(1),
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn wait_if_needed(&self) {
        let mut window = self.timestamps.lock().await;
        let now = Instant::now();
        Self::prune(&mut window, now);

        if window.len() >= self.rpm_limit {
            if let Some(oldest) = window.front().copied() {
                let elapsed = now.duration_since(oldest);
                let jitter = rand::thread_rng().gen_range(0.1..0.5);
                let wait = WINDOW
                    .saturating_sub(elapsed)
                    .saturating_add(Duration::from_secs_f64(jitter));
                info!(wait_secs = wait.as_secs_f64(), "Rate limiting: sleeping");
                tokio::time::sleep(wait).await;
                Self::prune(&mut window, Instant::now());
            }
        }

        window.push_back(Instant::now());
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) < WINDOW {
                break;
            }
            window.pop_front();
        }
    }
}

/// Executes a provider call under the shared rate limiter with bounded
/// exponential-backoff retry. Rate-limit responses honour the provider's
/// suggested wait before consuming the next attempt.
pub async fn execute_rate_limited<T, F, Fut>(
    limiter: &Arc<RateLimiter>,
    op: F,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    // 1 s, 2 s, 4 s, ... capped at 60 s between attempts.
    let mut backoff = ExponentialBackoff::from_millis(2)
        .factor(500)
        .max_delay(BACKOFF_MAX);

    let mut last_error = None;
    for attempt in 1..=MAX_ATTEMPTS {
        limiter.wait_if_needed().await;

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_rate_limited() {
                    let wait = match parse_retry_hint(&err.to_string()) {
                        Some(hint) => Duration::from_secs_f64(hint + RETRY_HINT_MARGIN),
                        None => {
                            Duration::from_secs_f64(rand::thread_rng().gen_range(2.0..5.0))
                        }
                    };
                    warn!(
                        attempt,
                        wait_secs = wait.as_secs_f64(),
                        "Provider rate limit hit; sleeping before retry"
                    );
                    tokio::time::sleep(wait).await;
                } else {
                    warn!(attempt, error = %err, "Provider call failed");
                }

                last_error = Some(err);

                if attempt < MAX_ATTEMPTS {
                    if let Some(delay) = backoff.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| AppError::InternalError("retry loop exhausted without error".into())))
}
