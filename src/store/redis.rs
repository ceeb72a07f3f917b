use super::{PipelineResults, ScoredMember, Store, StoreOp, StoreReply};
use crate::error::{ThrottlerError, ThrottlerResult};
use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Pipeline, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Connection settings for the Redis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    /// Prepended verbatim to every key.
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub db: i64,
    /// Deadline for connecting and for each command round trip.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_millis(1000)
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            key_prefix: None,
            db: 0,
            timeout: default_timeout(),
        }
    }
}

impl RedisStoreConfig {
    pub fn url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Redis-backed store.
///
/// The client is created up front but the connection is only opened on first
/// use, so an unreachable server shows up as an ordinary per-call error.
pub struct RedisStore {
    client: Client,
    key_prefix: String,
    timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    pub fn new(config: &RedisStoreConfig) -> ThrottlerResult<Self> {
        let client = Client::open(config.url()).map_err(|e| {
            ThrottlerError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
            timeout: config.timeout,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> ThrottlerResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .deadline("connect", self.client.get_multiplexed_tokio_connection())
            .await?
            .map_err(|e| ThrottlerError::Store(format!("Failed to connect to Redis: {}", e)))?;
        info!("Connected to Redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Bound `fut` by the configured timeout. Elapsing is a store error.
    async fn deadline<F: Future>(&self, what: &str, fut: F) -> ThrottlerResult<F::Output> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            ThrottlerError::Store(format!(
                "Redis {} timed out after {}ms",
                what,
                self.timeout.as_millis()
            ))
        })
    }

    /// Forget the cached connection so the next call reconnects.
    async fn invalidate(&self) {
        self.connection.lock().await.take();
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn queue(&self, pipe: &mut Pipeline, op: &StoreOp) {
        let key = self.prefixed(op.key());
        match op {
            StoreOp::ZAdd { score, member, .. } => {
                pipe.cmd("ZADD").arg(&key).arg(score_arg(*score)).arg(member);
            }
            StoreOp::ZCard { .. } => {
                pipe.cmd("ZCARD").arg(&key);
            }
            StoreOp::ZRemRangeByScore { min, max, .. } => {
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(&key)
                    .arg(score_arg(*min))
                    .arg(score_arg(*max));
            }
            StoreOp::ZRange { start, stop, with_scores, .. } => {
                pipe.cmd("ZRANGE").arg(&key).arg(*start).arg(*stop);
                if *with_scores {
                    pipe.arg("WITHSCORES");
                }
            }
            StoreOp::ZRem { member, .. } => {
                pipe.cmd("ZREM").arg(&key).arg(member);
            }
            StoreOp::Incr { .. } => {
                pipe.cmd("INCR").arg(&key);
            }
            StoreOp::Expire { seconds, .. } => {
                pipe.cmd("EXPIRE").arg(&key).arg(*seconds);
            }
            StoreOp::Del { .. } => {
                pipe.cmd("DEL").arg(&key);
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn exec_batch(&self, ops: Vec<StoreOp>) -> ThrottlerResult<PipelineResults> {
        let mut pipe = ::redis::pipe();
        for op in &ops {
            self.queue(&mut pipe, op);
        }

        let mut conn = self.connection().await?;
        let reply: ThrottlerResult<::redis::RedisResult<Vec<Value>>> =
            self.deadline("pipeline", pipe.query_async(&mut conn)).await;
        let values = match reply {
            Ok(Ok(values)) => values,
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    self.invalidate().await;
                }
                return Err(ThrottlerError::Store(format!("Pipeline failed: {}", e)));
            }
            Err(e) => {
                // A stalled connection may never recover; reconnect next time.
                self.invalidate().await;
                return Err(e);
            }
        };

        if values.len() != ops.len() {
            return Err(ThrottlerError::Store(format!(
                "Pipeline returned {} replies for {} commands",
                values.len(),
                ops.len()
            )));
        }

        debug!(commands = ops.len(), "Executed Redis pipeline");
        Ok(ops
            .iter()
            .zip(values)
            .map(|(op, value)| convert_reply(op, value))
            .collect())
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        let mut conn = self.connection().await?;
        let cmd = ::redis::cmd("PING");
        let pong: String = self
            .deadline("ping", cmd.query_async(&mut conn))
            .await?
            .map_err(|e| ThrottlerError::Store(format!("Ping failed: {}", e)))?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }

    async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            info!("Released Redis connection");
        }
    }
}

/// Redis accepts `-inf`/`+inf` as score bounds.
fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

fn convert_reply(op: &StoreOp, value: Value) -> ThrottlerResult<StoreReply> {
    match op {
        StoreOp::ZRange { with_scores: true, .. } => {
            let pairs: Vec<(String, f64)> = ::redis::from_redis_value(&value)?;
            Ok(StoreReply::Members(
                pairs
                    .into_iter()
                    .map(|(member, score)| ScoredMember {
                        member,
                        score: Some(score),
                    })
                    .collect(),
            ))
        }
        StoreOp::ZRange { with_scores: false, .. } => {
            let members: Vec<String> = ::redis::from_redis_value(&value)?;
            Ok(StoreReply::Members(
                members
                    .into_iter()
                    .map(|member| ScoredMember { member, score: None })
                    .collect(),
            ))
        }
        _ => Ok(StoreReply::Integer(::redis::from_redis_value(&value)?)),
    }
}
