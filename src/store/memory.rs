//! In-process store.
//!
//! Mirrors the subset of Redis semantics the limiter relies on: empty sorted
//! sets disappear, `INCR` keeps an existing TTL, `EXPIRE` on a missing key
//! returns 0, and a key past its TTL behaves as if it never existed.
//!
//! Expired keys are dropped when next touched, and by a full sweep that runs
//! from `exec_batch` at most once per [`PURGE_INTERVAL`], so keys that are
//! never touched again do not accumulate.

use super::{PipelineResults, ScoredMember, Store, StoreOp, StoreReply};
use crate::clock::{Clock, SystemClock};
use crate::error::{ThrottlerError, ThrottlerResult};
use async_trait::async_trait;
use tracing::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Minimum time between full sweeps of expired keys.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
enum Value {
    /// Kept sorted by (score, member).
    SortedSet(Vec<(f64, String)>),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    next_purge_at: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            next_purge_at: AtomicU64::new(0),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.lock().values().filter(|e| !is_expired(e, now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        Self::purge(&mut self.lock(), now)
    }

    fn purge(entries: &mut HashMap<String, Entry>, now: u64) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| !is_expired(entry, now));
        before - entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True when a full sweep is due, claiming it for this caller.
    fn purge_due(&self, now: u64) -> bool {
        let due_at = self.next_purge_at.load(Ordering::Relaxed);
        now >= due_at
            && self
                .next_purge_at
                .compare_exchange(
                    due_at,
                    now.saturating_add(PURGE_INTERVAL.as_millis() as u64),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    fn apply(entries: &mut HashMap<String, Entry>, op: StoreOp, now: u64) -> ThrottlerResult<StoreReply> {
        if entries.get(op.key()).is_some_and(|e| is_expired(e, now)) {
            entries.remove(op.key());
        }

        match op {
            StoreOp::ZAdd { key, score, member } => {
                let entry = entries.entry(key).or_insert_with(|| Entry {
                    value: Value::SortedSet(Vec::new()),
                    expires_at: None,
                });
                let set = sorted_set_mut(entry)?;
                let added = match set.iter().position(|(_, m)| *m == member) {
                    Some(idx) => {
                        set.remove(idx);
                        0
                    }
                    None => 1,
                };
                let at = set.partition_point(|(s, m)| (*s, m.as_str()) < (score, member.as_str()));
                set.insert(at, (score, member));
                Ok(StoreReply::Integer(added))
            }
            StoreOp::ZCard { key } => match entries.get(&key) {
                Some(entry) => Ok(StoreReply::Integer(sorted_set(entry)?.len() as i64)),
                None => Ok(StoreReply::Integer(0)),
            },
            StoreOp::ZRemRangeByScore { key, min, max } => {
                let Some(entry) = entries.get_mut(&key) else {
                    return Ok(StoreReply::Integer(0));
                };
                let set = sorted_set_mut(entry)?;
                let before = set.len();
                set.retain(|(score, _)| *score < min || *score > max);
                let removed = (before - set.len()) as i64;
                if set.is_empty() {
                    entries.remove(&key);
                }
                Ok(StoreReply::Integer(removed))
            }
            StoreOp::ZRange { key, start, stop, with_scores } => {
                let Some(entry) = entries.get(&key) else {
                    return Ok(StoreReply::Members(Vec::new()));
                };
                let set = sorted_set(entry)?;
                let members = match resolve_range(set.len(), start, stop) {
                    Some((from, to)) => set[from..=to]
                        .iter()
                        .map(|(score, member)| ScoredMember {
                            member: member.clone(),
                            score: with_scores.then_some(*score),
                        })
                        .collect(),
                    None => Vec::new(),
                };
                Ok(StoreReply::Members(members))
            }
            StoreOp::ZRem { key, member } => {
                let Some(entry) = entries.get_mut(&key) else {
                    return Ok(StoreReply::Integer(0));
                };
                let set = sorted_set_mut(entry)?;
                let before = set.len();
                set.retain(|(_, m)| *m != member);
                let removed = (before - set.len()) as i64;
                if set.is_empty() {
                    entries.remove(&key);
                }
                Ok(StoreReply::Integer(removed))
            }
            StoreOp::Incr { key } => {
                let entry = entries.entry(key).or_insert_with(|| Entry {
                    value: Value::Counter(0),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::Counter(n) => {
                        *n += 1;
                        Ok(StoreReply::Integer(*n))
                    }
                    Value::SortedSet(_) => Err(wrong_type()),
                }
            }
            StoreOp::Expire { key, seconds } => match entries.get_mut(&key) {
                Some(entry) => {
                    entry.expires_at = Some(now.saturating_add(seconds.saturating_mul(1000)));
                    Ok(StoreReply::Integer(1))
                }
                None => Ok(StoreReply::Integer(0)),
            },
            StoreOp::Del { key } => Ok(StoreReply::Integer(entries.remove(&key).map_or(0, |_| 1))),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exec_batch(&self, ops: Vec<StoreOp>) -> ThrottlerResult<PipelineResults> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().map_err(|_| {
            ThrottlerError::Internal("Failed to acquire lock on memory store".into())
        })?;

        if self.purge_due(now) {
            let removed = Self::purge(&mut entries, now);
            if removed > 0 {
                debug!(removed, "Purged expired keys from memory store");
            }
        }

        Ok(ops
            .into_iter()
            .map(|op| Self::apply(&mut entries, op, now))
            .collect())
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

fn is_expired(entry: &Entry, now: u64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn wrong_type() -> ThrottlerError {
    ThrottlerError::Store(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn sorted_set(entry: &Entry) -> ThrottlerResult<&Vec<(f64, String)>> {
    match &entry.value {
        Value::SortedSet(set) => Ok(set),
        Value::Counter(_) => Err(wrong_type()),
    }
}

fn sorted_set_mut(entry: &mut Entry) -> ThrottlerResult<&mut Vec<(f64, String)>> {
    match &mut entry.value {
        Value::SortedSet(set) => Ok(set),
        Value::Counter(_) => Err(wrong_type()),
    }
}

/// Resolve Redis-style inclusive indices (negative counts from the end).
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}
