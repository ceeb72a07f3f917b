//! Escalation from repeated rate-limit violations to a temporary IP block.
//!
//! Violations are counted per IP in the store under `abuse:<ip>`, with a TTL
//! set on the first increment so the count resets after the abuse window.
//! Crossing the threshold records a block in a process-local table. The
//! table is not shared between service instances.

use crate::clock::{Clock, SystemClock};
use crate::key_generator::abuse_key;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// Violations within `window` that trigger a block.
    pub threshold: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(with = "humantime_serde")]
    pub block_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            window: Duration::from_secs(300),
            block_duration: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A currently blocked client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedIp {
    pub ip: String,
    pub blocked_until: u64,
}

pub struct AbuseTracker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: AbuseConfig,
    blocked: RwLock<HashMap<String, u64>>,
}

impl AbuseTracker {
    pub fn new(store: Arc<dyn Store>, config: AbuseConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: AbuseConfig) -> Self {
        Self {
            store,
            clock,
            config,
            blocked: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AbuseConfig {
        &self.config
    }

    /// Count one violation for `ip`, blocking it once the threshold is hit.
    /// Store failures are logged and ignored.
    pub async fn record_violation(&self, ip: &str, context: Option<&str>) {
        let key = abuse_key(ip);
        let count = match self.store.incr(&key).await {
            Ok(count) => count,
            Err(e) => {
                error!(key = %key, op = "incr", error = %e, "Failed to record rate limit violation");
                return;
            }
        };

        if count == 1 {
            if let Err(e) = self.store.expire(&key, self.config.window.as_secs().max(1)).await {
                error!(key = %key, op = "expire", error = %e, "Failed to set abuse window");
            }
        }

        debug!(ip = %ip, context = context.unwrap_or("-"), count, "Rate limit violation recorded");

        if count >= i64::from(self.config.threshold) {
            self.block(ip, self.config.block_duration);
            warn!(
                ip = %ip,
                context = context.unwrap_or("-"),
                violations = count,
                block_secs = self.config.block_duration.as_secs(),
                "Blocking IP after repeated rate limit violations"
            );
            if let Err(e) = self.store.del(&key).await {
                error!(key = %key, op = "del", error = %e, "Failed to clear abuse counter");
            }
        }
    }

    pub fn block(&self, ip: &str, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let until = self.clock.now_ms().saturating_add(millis);
        self.table_mut().insert(ip.to_string(), until);
    }

    pub fn unblock(&self, ip: &str) -> bool {
        self.table_mut().remove(ip).is_some()
    }

    /// Block expiry for `ip`, dropping the entry if it has lapsed.
    pub fn blocked_until(&self, ip: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        let until = self.table().get(ip).copied()?;
        if until > now {
            return Some(until);
        }

        let mut table = self.table_mut();
        // Re-check under the write lock; a fresh block may have landed.
        if table.get(ip).is_some_and(|&u| u <= now) {
            table.remove(ip);
        }
        None
    }

    /// Time left on the block for `ip`, if any.
    pub fn remaining_block(&self, ip: &str) -> Option<Duration> {
        let until = self.blocked_until(ip)?;
        Some(Duration::from_millis(until.saturating_sub(self.clock.now_ms())))
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_until(ip).is_some()
    }

    pub fn blocked_ips(&self) -> Vec<BlockedIp> {
        let now = self.clock.now_ms();
        let mut blocked: Vec<BlockedIp> = self
            .table()
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(ip, &blocked_until)| BlockedIp {
                ip: ip.clone(),
                blocked_until,
            })
            .collect();
        blocked.sort_by(|a, b| a.ip.cmp(&b.ip));
        blocked
    }

    /// Number of entries in the table, expired or not.
    pub fn blocked_count(&self) -> usize {
        self.table().len()
    }

    /// Drop every lapsed block. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut table = self.table_mut();
        let before = table.len();
        table.retain(|_, &mut until| until > now);
        before - table.len()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the returned
    /// handle is cancelled or dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> SweepHandle {
        let tracker = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = tracker.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired IP blocks");
                }
            }
        });
        info!(interval_secs = period.as_secs(), "Started IP block sweeper");
        SweepHandle {
            handle: Some(handle),
        }
    }

    fn table(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, u64>> {
        self.blocked.read().unwrap_or_else(|e| e.into_inner())
    }

    fn table_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, u64>> {
        self.blocked.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the background sweep task.
#[derive(Debug)]
pub struct SweepHandle {
    handle: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Stopped IP block sweeper");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
