//! Bounded exponential-backoff retry for store operations.
//!
//! Only transient, connection-level failures are retried. Classification
//! walks the `source()` chain looking for a known error code and falls back to
//! matching the message text.

use super::{CatalogStore, StoreError};
use crate::config::StorageConfig;
use crate::models::{Channel, IngestStats, LatestUpload, NewChannel, NewVideo, StoredVideo};
use async_trait::async_trait;
use std::borrow::Cow;
use std::error::Error;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::warn;

/// Codes treated as transient: socket-level failures plus Postgres-style
/// `admin_shutdown`.
const TRANSIENT_CODES: &[&str] = &["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED", "EPIPE", "57P01"];

const TRANSIENT_MESSAGES: &[&str] = &[
    "connection reset",
    "server closed the connection",
    "terminating connection",
];

// ── Policy ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            attempts: config.retry_attempts().max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Waits between attempts: base, 2×base, 4×base… capped at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let Self { attempts, base_delay, max_delay } = *self;
        (0..attempts.saturating_sub(1)).map(move |i| {
            base_delay
                .checked_mul(2u32.saturating_pow(i))
                .unwrap_or(max_delay)
                .min(max_delay)
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

/// Run `op`, retrying transient failures per `policy`. The last error is
/// returned once attempts run out; non-transient errors return immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut failures = 0u32;
    let attempts = policy.attempts;
    RetryIf::spawn(policy.delays(), op, |err: &StoreError| {
        failures += 1;
        let transient = is_transient(err);
        if transient && failures < attempts {
            warn!("{label}: transient store error (attempt {failures}/{attempts}): {err}");
        }
        transient
    })
    .await
}

// ── Classification ────────────────────────────────────────────────────────────

/// Deepest cause inspected when classifying.
const MAX_CAUSE_DEPTH: usize = 32;

/// One level down the cause chain. `None` at the bottom, or when an error
/// reports itself as its own source.
///
/// Address and vtable must both match: a wrapper and a source field stored
/// at offset zero share an address but not a type.
pub fn cause_of<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a (dyn Error + 'static)> {
    let next = err.source()?;
    if std::ptr::eq(next, err) { None } else { Some(next) }
}

/// Normalized error code, for the error types that carry one.
pub fn error_code(err: &(dyn Error + 'static)) -> Option<Cow<'static, str>> {
    if let Some(store) = err.downcast_ref::<StoreError>() {
        return match store {
            StoreError::Coded { code, .. } => Some(Cow::Owned(code.clone())),
            StoreError::Io(io) => io_code(io.kind()).map(Cow::Borrowed),
            _ => None,
        };
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return io_code(io.kind()).map(Cow::Borrowed);
    }
    None
}

fn io_code(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Some("ECONNRESET"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        _ => None,
    }
}

pub fn is_transient(err: &(dyn Error + 'static)) -> bool {
    let chain = || std::iter::successors(Some(err), |e| cause_of(*e)).take(MAX_CAUSE_DEPTH);

    if chain().any(|e| error_code(e).is_some_and(|code| TRANSIENT_CODES.contains(&code.as_ref()))) {
        return true;
    }
    chain().any(|e| {
        let message = e.to_string().to_lowercase();
        TRANSIENT_MESSAGES.iter().any(|m| message.contains(m))
    })
}

// ── Decorator ─────────────────────────────────────────────────────────────────

/// Wraps every operation of an inner store with [`with_retry`].
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: CatalogStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: CatalogStore> CatalogStore for RetryingStore<S> {
    async fn channel_by_url(&self, canonical_url: &str) -> Result<Option<Channel>, StoreError> {
        with_retry(&self.policy, "channel_by_url", || self.inner.channel_by_url(canonical_url)).await
    }

    async fn channel_by_handle(&self, handle: &str) -> Result<Option<Channel>, StoreError> {
        with_retry(&self.policy, "channel_by_handle", || self.inner.channel_by_handle(handle)).await
    }

    async fn channel_by_id(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        with_retry(&self.policy, "channel_by_id", || self.inner.channel_by_id(id)).await
    }

    async fn video_payloads(&self, channel_id: Option<i64>) -> Result<Vec<StoredVideo>, StoreError> {
        with_retry(&self.policy, "video_payloads", || self.inner.video_payloads(channel_id)).await
    }

    async fn latest_upload(&self, channel_id: Option<i64>) -> Result<LatestUpload, StoreError> {
        with_retry(&self.policy, "latest_upload", || self.inner.latest_upload(channel_id)).await
    }

    async fn upsert_channel(&self, channel: &NewChannel) -> Result<Channel, StoreError> {
        with_retry(&self.policy, "upsert_channel", || self.inner.upsert_channel(channel)).await
    }

    async fn insert_video(&self, video: &NewVideo) -> Result<bool, StoreError> {
        with_retry(&self.policy, "insert_video", || self.inner.insert_video(video)).await
    }

    async fn begin_run(&self, channel_url: &str) -> Result<i64, StoreError> {
        with_retry(&self.policy, "begin_run", || self.inner.begin_run(channel_url)).await
    }

    async fn finish_run(
        &self,
        run_id: i64,
        stats: &IngestStats,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        with_retry(&self.policy, "finish_run", || self.inner.finish_run(run_id, stats, error)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn coded(code: &str) -> StoreError {
        StoreError::Coded { code: code.into(), message: "boom".into() }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let delays: Vec<u128> = policy.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(fast_policy(1).delays().count(), 0);
    }

    #[test]
    fn classifies_codes_and_messages() {
        assert!(is_transient(&coded("57P01")));
        assert!(is_transient(&coded("ECONNRESET")));
        assert!(!is_transient(&coded("23505")));
        assert!(is_transient(&StoreError::Io(std::io::Error::from(ErrorKind::BrokenPipe))));
        assert!(is_transient(&StoreError::Io(std::io::Error::from(ErrorKind::TimedOut))));
        assert!(!is_transient(&StoreError::Io(std::io::Error::from(ErrorKind::NotFound))));
        assert!(is_transient(&StoreError::Blocking(
            "FATAL: terminating connection due to administrator command".into()
        )));
        assert!(is_transient(&StoreError::Blocking("Connection reset by peer".into())));
        assert!(!is_transient(&StoreError::MissingRow("channel upsert")));
    }

    #[derive(Debug)]
    struct Wrapper(std::io::Error);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("query failed")
        }
    }

    impl Error for Wrapper {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[derive(Debug)]
    struct SelfCaused;

    impl fmt::Display for SelfCaused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("loops forever")
        }
    }

    impl Error for SelfCaused {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(self)
        }
    }

    #[test]
    fn walks_nested_causes() {
        let nested = Wrapper(std::io::Error::from(ErrorKind::ConnectionRefused));
        assert!(is_transient(&nested));
        let permanent = Wrapper(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(!is_transient(&permanent));
    }

    /// Source stored after another field, so at a non-zero offset.
    #[derive(Debug)]
    struct Annotated {
        query: String,
        cause: std::io::Error,
    }

    impl fmt::Display for Annotated {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} failed", self.query)
        }
    }

    impl Error for Annotated {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.cause)
        }
    }

    #[test]
    fn wrapper_sharing_its_source_address_is_not_self_caused() {
        let front = Wrapper(std::io::Error::from(ErrorKind::ConnectionReset));
        assert!(std::ptr::addr_eq(&front as *const Wrapper, &front.0 as *const std::io::Error));
        assert!(cause_of(&front).is_some());
        assert!(is_transient(&front));

        let back = Annotated {
            query: "insert".into(),
            cause: std::io::Error::from(ErrorKind::ConnectionReset),
        };
        assert!(cause_of(&back).is_some());
        assert!(is_transient(&back));

        let twice = StoreError::Io(std::io::Error::other(Wrapper(std::io::Error::from(
            ErrorKind::ConnectionRefused,
        ))));
        assert!(is_transient(&twice));
    }

    #[test]
    fn self_referential_cause_terminates() {
        assert!(cause_of(&SelfCaused).is_none());
        assert!(!is_transient(&SelfCaused));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(4), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(coded("57P01")) } else { Ok(n) } }
        })
        .await;
        assert_eq!(assert_ok!(result), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(4), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(coded("23505")) }
        })
        .await;
        assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(StoreError::Coded { code: "ECONNRESET".into(), message: format!("try {n}") }) }
        })
        .await;
        match result {
            Err(StoreError::Coded { message, .. }) => assert_eq!(message, "try 3"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
