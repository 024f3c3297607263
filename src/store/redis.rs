use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use super::{align, bucket_key, latch_key, probes_key, ramp_key, window_epochs, Store};
use crate::error::StoreError;
use crate::state::State;

/// Store backed by a Redis-compatible service.
///
/// All clones share one multiplexed connection; each operation clones the
/// handle, which is how the `redis` crate interleaves concurrent commands.
/// Bucket updates ride an atomic `HINCRBY` + `EXPIRE` pipeline and window
/// reads issue one pipelined batch of `HMGET`s, so a decision or report
/// costs a single round trip per store call.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connects to `url`, e.g. `redis://localhost:6379`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            Client::open(url).map_err(|err| StoreError::with_source("invalid redis url", err))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| StoreError::with_source("redis connection failed", err))?;
        Ok(Self { conn })
    }

    /// Wraps an already established connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::with_source("redis command failed", err)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn record(
        &self,
        key: &str,
        success: bool,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let slot = bucket_key(key, align(now, bucket));
        let field = if success { "s" } else { "f" };
        let lifetime = (window.as_secs() + bucket.as_secs()) as i64;

        redis::pipe()
            .atomic()
            .hincr(&slot, field, 1)
            .expire(&slot, lifetime)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_window(
        &self,
        key: &str,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(u64, u64), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for epoch in window_epochs(now, window, bucket) {
            pipe.hget(bucket_key(key, epoch), &["s", "f"]);
        }

        let rows: Vec<(Option<u64>, Option<u64>)> = pipe.query_async(&mut conn).await?;
        let (mut successes, mut failures) = (0, 0);
        for (s, f) in rows {
            successes += s.unwrap_or(0);
            failures += f.unwrap_or(0);
        }
        Ok((successes, failures))
    }

    async fn read_latch(&self, key: &str) -> Result<Option<State>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(latch_key(key)).await?;
        match raw {
            None => Ok(None),
            Some(name) => name
                .parse::<State>()
                .map(Some)
                .map_err(|err| StoreError::with_source("invalid latch value", err)),
        }
    }

    async fn set_latch(
        &self,
        key: &str,
        state: State,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let latch = latch_key(key);
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(&latch, state.as_str(), ttl.as_secs())
                    .await?
            }
            None => conn.set::<_, _, ()>(&latch, state.as_str()).await?,
        }
        Ok(())
    }

    async fn try_acquire_probe(
        &self,
        key: &str,
        max_probes: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let probes = probes_key(key);

        let outstanding: i64 = conn.incr(&probes, 1).await?;
        if outstanding == 1 {
            conn.expire::<_, ()>(&probes, ttl.as_secs() as i64).await?;
        }
        if outstanding > i64::from(max_probes) {
            conn.decr::<_, _, ()>(&probes, 1).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn release_probe(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.decr::<_, _, ()>(probes_key(key), 1).await?;
        Ok(())
    }

    async fn read_ramp(&self, key: &str) -> Result<Option<u8>, StoreError> {
        let mut conn = self.conn.clone();
        let percent: Option<u8> = conn.get(ramp_key(key)).await?;
        Ok(percent)
    }

    async fn set_ramp(&self, key: &str, percent: u8, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(ramp_key(key), percent, ttl.as_secs())
            .await?;
        Ok(())
    }
}
