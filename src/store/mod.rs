//! Thin adapter to the shared Redis-compatible store: connection handling,
//! script registration, and evaluation with automatic re-registration on a
//! cache miss. Safe for concurrent callers — the underlying connection is
//! multiplexed.

use crate::error::StoreError;
use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use tokio::sync::Mutex;

pub struct RateLimitStore {
    conn: MultiplexedConnection,
    /// SHA1 of the registered script, behind a lock only to coordinate the
    /// rare re-registration path — reads of the connection itself never
    /// contend on this.
    script_sha: Mutex<String>,
}

impl RateLimitStore {
    /// Connect to the store and register the decision-engine script. Any
    /// failure here is fatal at startup.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(StoreError::Redis)?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(StoreError::Redis)?;

        let sha = register_script(&mut conn).await?;
        tracing::info!("store: connected, script_sha={}", sha);

        Ok(Self {
            conn,
            script_sha: Mutex::new(sha),
        })
    }

    /// Evaluate the decision-engine script against `keys`/`args`. On an
    /// "unknown script" reply the script is re-uploaded and the call retried
    /// exactly once; any other error propagates untouched.
    pub async fn eval<T: FromRedisValue>(&self, keys: &[String], args: &[String]) -> Result<T, StoreError> {
        let sha = self.script_sha.lock().await.clone();
        let mut conn = self.conn.clone();

        match invoke(&mut conn, &sha, keys, args).await {
            Ok(v) => Ok(v),
            Err(e) if is_noscript(&e) => {
                tracing::warn!("store: script cache miss, re-registering");
                let new_sha = register_script(&mut conn).await?;
                *self.script_sha.lock().await = new_sha.clone();
                invoke(&mut conn, &new_sha, keys, args).await
            }
            Err(e) => Err(StoreError::Redis(e)),
        }
    }

    /// Release the connection. Dropping the struct alone would do the same;
    /// an explicit call keeps shutdown ordering visible in logs even while
    /// the store is still shared via `Arc`.
    pub async fn close(&self) {
        tracing::info!("store: closed");
    }
}

async fn invoke<T: FromRedisValue>(
    conn: &mut MultiplexedConnection,
    sha: &str,
    keys: &[String],
    args: &[String],
) -> Result<T, redis::RedisError> {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(sha).arg(keys.len());
    for k in keys {
        cmd.arg(k);
    }
    for a in args {
        cmd.arg(a);
    }
    cmd.query_async(conn).await
}

async fn register_script(conn: &mut MultiplexedConnection) -> Result<String, StoreError> {
    let sha: String = redis::cmd("SCRIPT")
        .arg("LOAD")
        .arg(crate::ratelimit::SCRIPT)
        .query_async(conn)
        .await
        .map_err(StoreError::Redis)?;
    Ok(sha)
}

fn is_noscript(err: &redis::RedisError) -> bool {
    err.code() == Some("NOSCRIPT")
}
