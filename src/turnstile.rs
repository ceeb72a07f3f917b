use crate::abuse::{AbuseConfig, AbuseTracker, SweepHandle};
use crate::clock::{Clock, SystemClock};
use crate::error::ThrottlerResult;
use crate::rate_limiter::SlidingWindowLimiter;
use crate::store::{RedisStore, RedisStoreConfig, Store};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Admission service: owns the store, the limiter, the abuse tracker and the
/// sweep task. Build one per process and share it behind an `Arc`.
pub struct Turnstile {
    store: Arc<dyn Store>,
    limiter: SlidingWindowLimiter,
    abuse: Arc<AbuseTracker>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl Turnstile {
    pub fn builder() -> TurnstileBuilder {
        TurnstileBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn abuse(&self) -> &Arc<AbuseTracker> {
        &self.abuse
    }

    /// Start the periodic block sweep. Calling it again is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_none() {
            *sweeper = Some(self.abuse.start_sweeper());
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(SweepHandle::is_running)
    }

    /// Stop the sweep task and release the store connection.
    pub async fn shutdown(&self) {
        let handle = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = handle {
            handle.cancel();
        }
        self.store.close().await;
        info!("Turnstile shut down");
    }
}

#[derive(Default)]
pub struct TurnstileBuilder {
    store: Option<Arc<dyn Store>>,
    redis: Option<RedisStoreConfig>,
    clock: Option<Arc<dyn Clock>>,
    abuse: AbuseConfig,
}

impl TurnstileBuilder {
    /// Use an existing store instead of connecting to Redis.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn redis(mut self, config: RedisStoreConfig) -> Self {
        self.redis = Some(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn abuse_config(mut self, config: AbuseConfig) -> Self {
        self.abuse = config;
        self
    }

    /// Falls back to a lazily connected Redis store when none was injected.
    pub fn build(self) -> ThrottlerResult<Turnstile> {
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => {
                let config = self.redis.unwrap_or_default();
                info!(host = %config.host, port = config.port, db = config.db, "Using Redis store");
                Arc::new(RedisStore::new(&config)?)
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(Turnstile {
            limiter: SlidingWindowLimiter::with_clock(store.clone(), clock.clone()),
            abuse: Arc::new(AbuseTracker::with_clock(store.clone(), clock, self.abuse)),
            store,
            sweeper: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::rate_limit_config::RateLimitConfig;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_components_share_store() {
        let clock = TestClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let turnstile = Turnstile::builder()
            .store(store.clone())
            .clock(Arc::new(clock))
            .build()
            .unwrap();

        let config = RateLimitConfig::from_millis(60_000, 5).unwrap();
        turnstile.limiter().check("ip:1.1.1.1", &config, None).await;
        turnstile.abuse().record_violation("1.1.1.1", None).await;
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let turnstile = Turnstile::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        assert!(!turnstile.is_running());

        turnstile.start();
        turnstile.start();
        assert!(turnstile.is_running());

        turnstile.shutdown().await;
        assert!(!turnstile.is_running());
    }

    #[test]
    fn test_defaults_to_lazy_redis() {
        let turnstile = Turnstile::builder()
            .redis(RedisStoreConfig {
                port: 1,
                ..Default::default()
            })
            .build();
        assert!(turnstile.is_ok());
    }
}
