//! Bounded retry policies keyed on provider error codes.
//!
//! A [`RetryPolicy`] is (max attempts, retryable predicate, delay strategy,
//! optional side effect run before each retry). One policy is built per
//! operation; exhausting it returns the last error unchanged.

use crate::error::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const AUTHORIZATION_HEADER_MALFORMED: &str = "AuthorizationHeaderMalformed";
pub const NO_SUCH_BUCKET: &str = "NoSuchBucket";
pub const NO_SUCH_KEY: &str = "NoSuchKey";
pub const NO_SUCH_TAG_SET: &str = "NoSuchTagSet";
pub const ACCESS_DENIED: &str = "AccessDenied";
pub const NOT_FOUND: &str = "404";
pub const BUCKET_ALREADY_OWNED_BY_YOU: &str = "BucketAlreadyOwnedByYou";

/// Codes that mean "absent" when the last existence-check attempt sees them.
pub const ABSENT_CODES: &[&str] = &[NOT_FOUND, NO_SUCH_KEY, ACCESS_DENIED];

type Predicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type Hook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Wait between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    None,
    Fixed(Duration),
    /// `initial * 2^(attempt-1)`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Delay {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn after(&self, attempt: u32) -> Duration {
        match *self {
            Delay::None => Duration::ZERO,
            Delay::Fixed(delay) => delay,
            Delay::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    name: &'static str,
    max_attempts: u32,
    retryable: Predicate,
    delay: Delay,
    on_retry: Option<Hook>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new<P>(name: &'static str, max_attempts: u32, delay: Delay, retryable: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        Self {
            name,
            max_attempts: max_attempts.max(1),
            retryable: Arc::new(retryable),
            delay,
            on_retry: None,
        }
    }

    /// Retry when the service answered with one of `codes`.
    pub fn on_codes(name: &'static str, max_attempts: u32, delay: Delay, codes: &'static [&'static str]) -> Self {
        Self::new(name, max_attempts, delay, move |err| err.has_code(codes))
    }

    /// Run `hook` with the failing error before each retry.
    pub fn with_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Object GET: absorbs read-after-write lag on a fresh bucket or key.
    pub fn object_get(delay: Delay) -> Self {
        Self::on_codes("object-get", 4, delay, &[NO_SUCH_BUCKET, NO_SUCH_KEY])
    }

    /// Existence checks. The caller maps [`ABSENT_CODES`] on the final
    /// attempt to a negative answer.
    pub fn existence(delay: Delay) -> Self {
        Self::on_codes(
            "existence",
            2,
            delay,
            &[NO_SUCH_BUCKET, NOT_FOUND, NO_SUCH_KEY, ACCESS_DENIED],
        )
    }

    /// One page of a listing.
    pub fn listing_page(delay: Delay) -> Self {
        Self::on_codes("listing-page", 4, delay, &[NO_SUCH_BUCKET])
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt bound is reached. `operation` receives the 1-based
    /// attempt number.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && (self.retryable)(&err) => {
                    let delay = self.delay.after(attempt);
                    warn!(
                        policy = self.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        code = err.code().unwrap_or("-"),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error"
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(&err);
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
