//! Sliding-window rate limiter.
//!
//! Each accepted request is one sorted-set member scored by its arrival time
//! in milliseconds. A check purges members older than the window, counts the
//! survivors, and tentatively records the current request in the same batch.
//! Denied requests are rolled back with a separate `ZREM`.
//!
//! Store failures never reach the caller: every public operation falls back
//! to allowing the request.

use crate::clock::{Clock, SystemClock};
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::key_generator::rate_limit_key;
use crate::rate_limit_config::RateLimitConfig;
use crate::response::{RateLimitResult, RateLimitUsage};
use crate::store::{PipelineResults, ScoredMember, Store, StoreReply};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Count this request against `identifier` and decide whether it may
    /// proceed.
    pub async fn check(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        endpoint: Option<&str>,
    ) -> RateLimitResult {
        let key = rate_limit_key(identifier, endpoint);
        let now = self.clock.now_ms();
        let window_ms = config.window_ms();
        let window_start = now.saturating_sub(window_ms);
        let fallback_reset = now.saturating_add(window_ms);
        let member = format!("{}-{}", now, Uuid::new_v4().simple());

        let mut pipe = self.store.pipeline();
        pipe.zremrangebyscore(&key, f64::NEG_INFINITY, window_start as f64)
            .zcard(&key)
            .zadd(&key, now as f64, &member)
            .expire(&key, config.window_secs_ceil())
            .zrange(&key, 0, 0, true);

        let replies = match pipe.exec().await.and_then(|r| collect_replies(r, 5)) {
            Ok(replies) => replies,
            Err(e) => {
                error!(key = %key, op = "pipeline", error = %e, "Rate limit check failed, allowing request");
                return RateLimitResult::allowed(config.max_requests, config.max_requests, fallback_reset);
            }
        };

        let decoded = decode_count(&replies[1]).and_then(|count| Ok((count, decode_oldest(&replies[4])?)));
        let (count_before_add, oldest) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(key = %key, op = "pipeline", error = %e, "Unexpected rate limit reply, allowing request");
                return RateLimitResult::allowed(config.max_requests, config.max_requests, fallback_reset);
            }
        };

        let request_count = count_before_add + 1;
        let reset_at = oldest.map_or(fallback_reset, |oldest| oldest.saturating_add(window_ms));

        if request_count > u64::from(config.max_requests) {
            if let Err(e) = self.store.zrem(&key, &member).await {
                warn!(key = %key, op = "zrem", error = %e, "Failed to roll back denied request");
            }
            let retry_after = reset_at.saturating_sub(now).div_ceil(1000);
            debug!(key = %key, count = count_before_add, retry_after, "Rate limit exceeded");
            return RateLimitResult::denied(config.max_requests, reset_at, retry_after);
        }

        let remaining = u64::from(config.max_requests).saturating_sub(request_count) as u32;
        debug!(key = %key, count = request_count, remaining, "Request allowed");
        RateLimitResult::allowed(config.max_requests, remaining, reset_at)
    }

    /// Report window occupancy without recording a request.
    pub async fn get_usage(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        endpoint: Option<&str>,
    ) -> RateLimitUsage {
        let key = rate_limit_key(identifier, endpoint);
        let now = self.clock.now_ms();
        let window_ms = config.window_ms();
        let limit = config.max_requests;
        let fallback_reset = now.saturating_add(window_ms);

        let mut pipe = self.store.pipeline();
        pipe.zremrangebyscore(&key, f64::NEG_INFINITY, now.saturating_sub(window_ms) as f64)
            .zcard(&key)
            .zrange(&key, 0, 0, true);

        let usage = pipe.exec().await.and_then(|r| collect_replies(r, 3)).and_then(|replies| {
            Ok((decode_count(&replies[1])?, decode_oldest(&replies[2])?))
        });

        match usage {
            Ok((used, oldest)) => {
                let used = used.min(u64::from(u32::MAX)) as u32;
                RateLimitUsage {
                    used,
                    limit,
                    remaining: limit.saturating_sub(used),
                    reset_at: oldest.map_or(fallback_reset, |oldest| oldest.saturating_add(window_ms)),
                }
            }
            Err(e) => {
                error!(key = %key, op = "pipeline", error = %e, "Failed to read rate limit usage");
                RateLimitUsage {
                    used: 0,
                    limit,
                    remaining: limit,
                    reset_at: fallback_reset,
                }
            }
        }
    }

    /// Forget every recorded request for the key. Best effort.
    pub async fn reset_rate_limit(&self, identifier: &str, endpoint: Option<&str>) {
        let key = rate_limit_key(identifier, endpoint);
        match self.store.del(&key).await {
            Ok(_) => debug!(key = %key, "Rate limit reset"),
            Err(e) => error!(key = %key, op = "del", error = %e, "Failed to reset rate limit"),
        }
    }
}

/// Any failed slot invalidates the whole batch.
fn collect_replies(results: PipelineResults, expected: usize) -> ThrottlerResult<Vec<StoreReply>> {
    let replies = results.into_iter().collect::<ThrottlerResult<Vec<_>>>()?;
    if replies.len() != expected {
        return Err(ThrottlerError::Store(format!(
            "expected {} replies, got {}",
            expected,
            replies.len()
        )));
    }
    Ok(replies)
}

fn decode_count(reply: &StoreReply) -> ThrottlerResult<u64> {
    reply.clone().into_integer().map(|n| n.max(0) as u64)
}

fn decode_oldest(reply: &StoreReply) -> ThrottlerResult<Option<u64>> {
    let members = reply.clone().into_members()?;
    match members.first() {
        Some(ScoredMember { score: Some(score), .. }) if *score >= 0.0 => Ok(Some(*score as u64)),
        Some(ScoredMember { score: Some(_), .. }) | None => Ok(None),
        Some(ScoredMember { member, score: None }) => Err(ThrottlerError::Store(format!(
            "missing score for window entry {}",
            member
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::{MemoryStore, StoreOp};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Store for FailingStore {
        async fn exec_batch(&self, _ops: Vec<StoreOp>) -> ThrottlerResult<PipelineResults> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ThrottlerError::Store("connection refused".to_string()))
        }

        async fn ping(&self) -> ThrottlerResult<()> {
            Err(ThrottlerError::Store("connection refused".to_string()))
        }

        async fn close(&self) {}
    }

    /// Fails only the operation at `slot` of each batch.
    struct PartialFailureStore {
        inner: MemoryStore,
        slot: usize,
    }

    #[async_trait]
    impl Store for PartialFailureStore {
        async fn exec_batch(&self, ops: Vec<StoreOp>) -> ThrottlerResult<PipelineResults> {
            let mut results = self.inner.exec_batch(ops).await?;
            if let Some(result) = results.get_mut(self.slot) {
                *result = Err(ThrottlerError::Store("READONLY".to_string()));
            }
            Ok(results)
        }

        async fn ping(&self) -> ThrottlerResult<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Rejects single `ZREM` batches, which is how a denied request is
    /// rolled back.
    struct RollbackFailureStore {
        inner: Arc<MemoryStore>,
        rollbacks: AtomicUsize,
    }

    #[async_trait]
    impl Store for RollbackFailureStore {
        async fn exec_batch(&self, ops: Vec<StoreOp>) -> ThrottlerResult<PipelineResults> {
            if matches!(ops.as_slice(), [StoreOp::ZRem { .. }]) {
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
                return Err(ThrottlerError::Store("connection reset by peer".to_string()));
            }
            self.inner.exec_batch(ops).await
        }

        async fn ping(&self) -> ThrottlerResult<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn setup() -> (SlidingWindowLimiter, Arc<MemoryStore>, TestClock) {
        let clock = TestClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = SlidingWindowLimiter::with_clock(store.clone(), Arc::new(clock.clone()));
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_with_decreasing_remaining() {
        let (limiter, _, clock) = setup();
        let config = RateLimitConfig::from_millis(1_000, 3).unwrap();

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let result = limiter.check("rl:test2", &config, None).await;
            assert!(result.allowed);
            assert_eq!(result.limit, 3);
            remaining.push(result.remaining);
            clock.advance(Duration::from_millis(10));
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check("rl:test2", &config, None).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_denied_request_is_rolled_back() {
        let (limiter, store, _) = setup();
        let config = RateLimitConfig::from_millis(60_000, 2).unwrap();

        for _ in 0..5 {
            limiter.check("ip:10.0.0.1", &config, None).await;
        }
        assert_eq!(store.zcard("ip:10.0.0.1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reset_at_tracks_oldest_entry() {
        let (limiter, _, clock) = setup();
        let config = RateLimitConfig::from_millis(10_000, 2).unwrap();
        let start = clock.now_ms();

        let first = limiter.check("ip:a", &config, None).await;
        assert_eq!(first.reset_at, start + 10_000);

        clock.advance(Duration::from_millis(4_000));
        let second = limiter.check("ip:a", &config, None).await;
        assert_eq!(second.reset_at, start + 10_000);

        let denied = limiter.check("ip:a", &config, None).await;
        assert_eq!(denied.reset_at, start + 10_000);
        assert_eq!(denied.retry_after, Some(6));
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (limiter, _, clock) = setup();
        let config = RateLimitConfig::from_millis(1_000, 2).unwrap();

        assert!(limiter.check("ip:b", &config, None).await.allowed);
        clock.advance(Duration::from_millis(600));
        assert!(limiter.check("ip:b", &config, None).await.allowed);
        assert!(!limiter.check("ip:b", &config, None).await.allowed);

        // The first entry has aged out; the second still counts.
        clock.advance(Duration::from_millis(500));
        let result = limiter.check("ip:b", &config, None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_allowed_again_after_window() {
        let (limiter, _, clock) = setup();
        let config = RateLimitConfig::from_millis(1_000, 3).unwrap();

        for _ in 0..4 {
            limiter.check("email:guest@example.com", &config, None).await;
        }
        clock.advance(Duration::from_millis(1_001));

        let result = limiter.check("email:guest@example.com", &config, None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_endpoint_scopes_window() {
        let (limiter, _, _) = setup();
        let config = RateLimitConfig::from_millis(60_000, 1).unwrap();

        assert!(limiter.check("api_key:pk_1", &config, Some("/v1/a")).await.allowed);
        assert!(!limiter.check("api_key:pk_1", &config, Some("/v1/a")).await.allowed);
        assert!(limiter.check("api_key:pk_1", &config, Some("/v1/b")).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_then_check_starts_fresh() {
        let (limiter, _, _) = setup();
        let config = RateLimitConfig::from_millis(60_000, 5).unwrap();

        for _ in 0..7 {
            limiter.check("ip:c", &config, None).await;
        }
        limiter.reset_rate_limit("ip:c", None).await;

        let result = limiter.check("ip:c", &config, None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_get_usage_is_idempotent() {
        let (limiter, _, _) = setup();
        let config = RateLimitConfig::from_millis(60_000, 10).unwrap();

        for _ in 0..4 {
            limiter.check("ip:d", &config, None).await;
        }
        let first = limiter.get_usage("ip:d", &config, None).await;
        let second = limiter.get_usage("ip:d", &config, None).await;

        assert_eq!(first.used, 4);
        assert_eq!(first.remaining, 6);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_get_usage_unknown_key() {
        let (limiter, _, clock) = setup();
        let config = RateLimitConfig::from_millis(60_000, 10).unwrap();

        let usage = limiter.get_usage("ip:never-seen", &config, None).await;
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, 10);
        assert_eq!(usage.reset_at, clock.now_ms() + 60_000);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let store = Arc::new(FailingStore { calls: AtomicUsize::new(0) });
        let limiter = SlidingWindowLimiter::new(store.clone());
        let config = RateLimitConfig::from_millis(1_000, 3).unwrap();

        for _ in 0..10 {
            let result = limiter.check("ip:e", &config, None).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, 3);
        }

        let usage = limiter.get_usage("ip:e", &config, None).await;
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, 3);

        limiter.reset_rate_limit("ip:e", None).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        let (limiter, _, _) = setup();
        let config = RateLimitConfig::new(Duration::from_secs(u64::MAX), 1).unwrap();

        let allowed = limiter.check("ip:10.0.0.3", &config, None).await;
        assert!(allowed.allowed);
        assert_eq!(allowed.reset_at, u64::MAX);

        let denied = limiter.check("ip:10.0.0.3", &config, None).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, u64::MAX);

        let usage = limiter.get_usage("ip:10.0.0.3", &config, None).await;
        assert_eq!(usage.used, 1);
    }

    #[tokio::test]
    async fn test_failed_rollback_still_denies() {
        let clock = TestClock::default();
        let inner = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let store = Arc::new(RollbackFailureStore {
            inner: inner.clone(),
            rollbacks: AtomicUsize::new(0),
        });
        let limiter = SlidingWindowLimiter::with_clock(store.clone(), Arc::new(clock.clone()));
        let config = RateLimitConfig::from_millis(60_000, 2).unwrap();

        assert!(limiter.check("ip:10.0.0.2", &config, None).await.allowed);
        assert!(limiter.check("ip:10.0.0.2", &config, None).await.allowed);

        let denied = limiter.check("ip:10.0.0.2", &config, None).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(60));
        assert_eq!(store.rollbacks.load(Ordering::SeqCst), 1);

        // The entry that could not be rolled back stays counted until it ages out.
        assert_eq!(inner.zcard("ip:10.0.0.2").await.unwrap(), 3);
        assert!(!limiter.check("ip:10.0.0.2", &config, None).await.allowed);

        clock.advance(Duration::from_millis(60_001));
        assert!(limiter.check("ip:10.0.0.2", &config, None).await.allowed);
    }

    #[tokio::test]
    async fn test_partial_failure_fails_open() {
        let clock = TestClock::default();
        let store = Arc::new(PartialFailureStore {
            inner: MemoryStore::with_clock(Arc::new(clock.clone())),
            slot: 1,
        });
        let limiter = SlidingWindowLimiter::with_clock(store, Arc::new(clock));
        let config = RateLimitConfig::from_millis(1_000, 1).unwrap();

        for _ in 0..3 {
            let result = limiter.check("ip:f", &config, None).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, 1);
        }
    }
}
