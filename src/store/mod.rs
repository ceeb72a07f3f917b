//! Storage backends for window entries and abuse counters.
//!
//! A [`Store`] exposes the small set of sorted-set and counter primitives the
//! limiter and abuse tracker need. Backends only implement batch execution;
//! the single-command methods are thin wrappers that run a one-operation
//! batch. Operations in a batch run in the order they were queued and their
//! results come back in the same order.
//!
//! The Redis backend gets ordering for free from the server. The in-memory
//! backend holds its lock for the whole batch, so one batch is never
//! interleaved with another, but two separate batches for the same key can
//! still interleave between each other.

pub mod memory;
pub mod redis;

use crate::error::{ThrottlerError, ThrottlerResult};
use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

/// A sorted-set member, optionally with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: Option<f64>,
}

/// One queued store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    ZAdd { key: String, score: f64, member: String },
    ZCard { key: String },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    ZRange { key: String, start: isize, stop: isize, with_scores: bool },
    ZRem { key: String, member: String },
    Incr { key: String },
    Expire { key: String, seconds: u64 },
    Del { key: String },
}

impl StoreOp {
    pub fn key(&self) -> &str {
        match self {
            StoreOp::ZAdd { key, .. }
            | StoreOp::ZCard { key }
            | StoreOp::ZRemRangeByScore { key, .. }
            | StoreOp::ZRange { key, .. }
            | StoreOp::ZRem { key, .. }
            | StoreOp::Incr { key }
            | StoreOp::Expire { key, .. }
            | StoreOp::Del { key } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::ZAdd { .. } => "zadd",
            StoreOp::ZCard { .. } => "zcard",
            StoreOp::ZRemRangeByScore { .. } => "zremrangebyscore",
            StoreOp::ZRange { .. } => "zrange",
            StoreOp::ZRem { .. } => "zrem",
            StoreOp::Incr { .. } => "incr",
            StoreOp::Expire { .. } => "expire",
            StoreOp::Del { .. } => "del",
        }
    }
}

/// Result of a single operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    Integer(i64),
    Members(Vec<ScoredMember>),
}

impl StoreReply {
    pub fn into_integer(self) -> ThrottlerResult<i64> {
        match self {
            StoreReply::Integer(n) => Ok(n),
            StoreReply::Members(_) => Err(ThrottlerError::Store(
                "expected integer reply, got members".to_string(),
            )),
        }
    }

    pub fn into_members(self) -> ThrottlerResult<Vec<ScoredMember>> {
        match self {
            StoreReply::Members(members) => Ok(members),
            StoreReply::Integer(_) => Err(ThrottlerError::Store(
                "expected member list reply, got integer".to_string(),
            )),
        }
    }
}

/// Ordered per-operation results of a batch.
pub type PipelineResults = Vec<ThrottlerResult<StoreReply>>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Execute `ops` in order as one batch.
    ///
    /// The outer error means the batch could not be run at all. Individual
    /// operations may still fail on their own, which is reported in the
    /// corresponding slot.
    async fn exec_batch(&self, ops: Vec<StoreOp>) -> ThrottlerResult<PipelineResults>;

    async fn ping(&self) -> ThrottlerResult<()>;

    /// Release any held connection. Later calls may reconnect.
    async fn close(&self);

    async fn zadd(&self, key: &str, score: f64, member: &str) -> ThrottlerResult<i64> {
        self.exec_one(StoreOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        })
        .await?
        .into_integer()
    }

    async fn zcard(&self, key: &str) -> ThrottlerResult<i64> {
        self.exec_one(StoreOp::ZCard { key: key.to_string() })
            .await?
            .into_integer()
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> ThrottlerResult<i64> {
        self.exec_one(StoreOp::ZRemRangeByScore {
            key: key.to_string(),
            min,
            max,
        })
        .await?
        .into_integer()
    }

    async fn zrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        with_scores: bool,
    ) -> ThrottlerResult<Vec<ScoredMember>> {
        self.exec_one(StoreOp::ZRange {
            key: key.to_string(),
            start,
            stop,
            with_scores,
        })
        .await?
        .into_members()
    }

    async fn zrem(&self, key: &str, member: &str) -> ThrottlerResult<i64> {
        self.exec_one(StoreOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        })
        .await?
        .into_integer()
    }

    async fn incr(&self, key: &str) -> ThrottlerResult<i64> {
        self.exec_one(StoreOp::Incr { key: key.to_string() })
            .await?
            .into_integer()
    }

    async fn expire(&self, key: &str, seconds: u64) -> ThrottlerResult<i64> {
        self.exec_one(StoreOp::Expire {
            key: key.to_string(),
            seconds,
        })
        .await?
        .into_integer()
    }

    async fn del(&self, key: &str) -> ThrottlerResult<i64> {
        self.exec_one(StoreOp::Del { key: key.to_string() })
            .await?
            .into_integer()
    }

    async fn exec_one(&self, op: StoreOp) -> ThrottlerResult<StoreReply> {
        self.exec_batch(vec![op])
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(ThrottlerError::Store("empty batch reply".to_string())))
    }
}

impl dyn Store {
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }
}

/// Fluent batch builder.
pub struct Pipeline<'a> {
    store: &'a dyn Store,
    ops: Vec<StoreOp>,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            ops: Vec::new(),
        }
    }

    pub fn zadd(&mut self, key: &str, score: f64, member: &str) -> &mut Self {
        self.ops.push(StoreOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        });
        self
    }

    pub fn zcard(&mut self, key: &str) -> &mut Self {
        self.ops.push(StoreOp::ZCard { key: key.to_string() });
        self
    }

    pub fn zremrangebyscore(&mut self, key: &str, min: f64, max: f64) -> &mut Self {
        self.ops.push(StoreOp::ZRemRangeByScore {
            key: key.to_string(),
            min,
            max,
        });
        self
    }

    pub fn zrange(&mut self, key: &str, start: isize, stop: isize, with_scores: bool) -> &mut Self {
        self.ops.push(StoreOp::ZRange {
            key: key.to_string(),
            start,
            stop,
            with_scores,
        });
        self
    }

    pub fn zrem(&mut self, key: &str, member: &str) -> &mut Self {
        self.ops.push(StoreOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn incr(&mut self, key: &str) -> &mut Self {
        self.ops.push(StoreOp::Incr { key: key.to_string() });
        self
    }

    pub fn expire(&mut self, key: &str, seconds: u64) -> &mut Self {
        self.ops.push(StoreOp::Expire {
            key: key.to_string(),
            seconds,
        });
        self
    }

    pub fn del(&mut self, key: &str) -> &mut Self {
        self.ops.push(StoreOp::Del { key: key.to_string() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub async fn exec(self) -> ThrottlerResult<PipelineResults> {
        if self.ops.is_empty() {
            return Ok(Vec::new());
        }
        self.store.exec_batch(self.ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pipeline_preserves_order() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut pipe = store.pipeline();
        pipe.zadd("k", 1.0, "a")
            .zadd("k", 2.0, "b")
            .zcard("k")
            .zrange("k", 0, 0, true)
            .del("k");
        assert_eq!(pipe.len(), 5);

        let results = pipe.exec().await.unwrap();
        let replies: Vec<StoreReply> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(replies[0], StoreReply::Integer(1));
        assert_eq!(replies[1], StoreReply::Integer(1));
        assert_eq!(replies[2], StoreReply::Integer(2));
        assert_eq!(
            replies[3],
            StoreReply::Members(vec![ScoredMember {
                member: "a".to_string(),
                score: Some(1.0),
            }])
        );
        assert_eq!(replies[4], StoreReply::Integer(1));
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_noop() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let results = store.pipeline().exec().await.unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_reply_type_mismatch() {
        assert!(StoreReply::Integer(3).into_members().is_err());
        assert!(StoreReply::Members(vec![]).into_integer().is_err());
    }
}
