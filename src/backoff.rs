//! Retry timing that stays inside the CA's rate limits.
//!
//! Let's Encrypt production allows five failed validations per account and hostname per hour,
//! refilling one every twelve minutes; staging is far more generous.

use std::{fmt, future::Future, time::Duration};

use rand::Rng as _;
use serde::Deserialize;

/// Which CA environment the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
        })
    }
}

const MINUTE: Duration = Duration::from_secs(60);

/// `attempt²` seconds plus up to a quarter of that again as jitter.
///
/// Spaces out the `badNonce` retries of signed requests.
pub fn jittered_backoff(attempt: i32) -> Duration {
    if attempt <= 0 {
        return Duration::ZERO;
    }

    let attempt = u64::from(attempt.unsigned_abs());
    let base = Duration::from_secs(attempt.saturating_mul(attempt));

    base + jitter(base / 4)
}

/// Wait before retry number `attempt` after a failed issuance.
///
/// Staging doubles from one minute up to thirty, with up to 20% jitter. Production follows a
/// fixed 2, 12, 15, 20, 30 minute schedule.
pub fn rate_limit_backoff(attempt: i32, env: Environment) -> Duration {
    if attempt <= 0 {
        return Duration::ZERO;
    }

    match env {
        Environment::Staging => {
            let exp = attempt.saturating_sub(1).min(5) as u32;
            let base = (MINUTE * 2u32.pow(exp)).min(MINUTE * 30);
            base + jitter(base / 5)
        }

        Environment::Production => match attempt {
            1 => MINUTE * 2,
            2 => MINUTE * 12,
            3 => MINUTE * 15,
            4 => MINUTE * 20,
            _ => MINUTE * 30,
        },
    }
}

/// Pause after the CA reports a rate limit.
pub fn rate_limit_cooloff(env: Environment) -> Duration {
    match env {
        Environment::Production => MINUTE * 60,
        Environment::Staging => MINUTE * 10,
    }
}

pub fn max_attempts(env: Environment) -> u32 {
    match env {
        Environment::Production => 5,
        Environment::Staging => 8,
    }
}

/// Whether an error message reads like a CA rate limit.
pub fn is_rate_limit_error<E: fmt::Display + ?Sized>(err: &E) -> bool {
    let text = format!("{err:#}").to_lowercase();

    ["rate limit", "too many certificates", "rate limited", "ratelimited"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Uniform in `[0, max)`.
fn jitter(max: Duration) -> Duration {
    let max = max.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }

    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

/// Runs `op` until it succeeds or the attempt budget for `env` is spent.
///
/// Rate-limit failures sleep the cool-off instead of the regular backoff and do not use up an
/// attempt; at most `max_attempts(env)` cool-offs are taken before they count like any other
/// failure.
pub async fn retry_with_rate_limit<T, F, Fut>(env: Environment, mut op: F) -> eyre::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    let max = max_attempts(env);
    let mut attempt = 1;
    let mut cooloffs = 0;

    loop {
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 || cooloffs > 0 {
                    log::info!("Succeeded on attempt {attempt} after {cooloffs} rate-limit pauses");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if is_rate_limit_error(&err) && cooloffs < max {
            cooloffs += 1;
            let wait = rate_limit_cooloff(env);
            log::warn!(
                "Rate limited by CA ({env}), pausing {}s ({cooloffs}/{max}): {err:#}",
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
            continue;
        }

        if attempt >= max {
            return Err(err.wrap_err(format!("giving up after {attempt} attempts")));
        }

        let wait = rate_limit_backoff(attempt as i32, env);
        log::warn!(
            "Attempt {attempt}/{max} failed, retrying in {}s: {err:#}",
            wait.as_secs()
        );
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}
