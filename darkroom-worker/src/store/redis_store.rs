//! Redis-backed record store
//!
//! Records live in the `job_statuses` hash, pending ids in one list per job
//! type. Compare-and-swap runs as a Lua script so the read, the comparison,
//! the write and the optional re-queue happen in one atomic step.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, RedisError, Script};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CasOutcome, RecordStore, STATUS_HASH};
use crate::error::StoreError;

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if not current then
    return 0
end
if current ~= ARGV[2] then
    return 1
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
if KEYS[2] ~= '' then
    redis.call('RPUSH', KEYS[2], ARGV[1])
end
return 2
"#;

/// Whether a connection is still usable after `err`
///
/// Server replies such as WRONGTYPE leave the connection intact; transport
/// failures do not.
fn connection_survives(err: &RedisError) -> bool {
    !(err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout())
}

/// Record store backed by Redis
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    cas: Script,

    /// Connections reserved for blocking pops
    ///
    /// BLPOP holds its connection for the whole wait, so it never runs on
    /// the shared manager.
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connects to Redis at `url`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!("Connected to record store at {}", url);

        Ok(Self {
            client,
            conn,
            cas: Script::new(CAS_SCRIPT),
            blocking: Mutex::new(Vec::new()),
        })
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let cached = self.blocking.lock().unwrap().pop();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        debug!("Opening a new blocking connection");
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn release_blocking_connection(&self, conn: MultiplexedConnection) {
        self.blocking.lock().unwrap().push(conn);
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn insert_and_push(
        &self,
        job_id: &str,
        record: &str,
        queue: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(STATUS_HASH, job_id, record)
            .ignore()
            .rpush(queue, job_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let record: Option<String> = conn.hget(STATUS_HASH, job_id).await?;
        Ok(record)
    }

    async fn all(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let records: Vec<String> = conn.hvals(STATUS_HASH).await?;
        Ok(records)
    }

    async fn compare_and_swap(
        &self,
        job_id: &str,
        expected: &str,
        new: &str,
        requeue: Option<&str>,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn.clone();

        let mut invocation = self.cas.prepare_invoke();
        invocation
            .key(STATUS_HASH)
            .key(requeue.unwrap_or(""))
            .arg(job_id)
            .arg(expected)
            .arg(new);

        let code: i64 = invocation.invoke_async(&mut conn).await?;

        match code {
            0 => Ok(CasOutcome::Missing),
            1 => Ok(CasOutcome::Conflict),
            2 => Ok(CasOutcome::Swapped),
            other => Err(StoreError::UnexpectedReply(format!(
                "compare-and-swap returned {}",
                other
            ))),
        }
    }

    async fn remove(&self, job_id: &str, queues: &[&str]) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().hdel(STATUS_HASH, job_id);
        for queue in queues {
            pipe.lrem(*queue, 0, job_id).ignore();
        }

        let (deleted,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.blocking_connection().await?;

        // BLPOP treats 0 as "wait forever"
        let seconds = timeout.as_secs_f64().max(0.01);
        let popped: Result<Option<(String, String)>, RedisError> =
            conn.blpop(queue, seconds).await;

        match popped {
            Ok(popped) => {
                self.release_blocking_connection(conn);
                Ok(popped.map(|(_, job_id)| job_id))
            }
            Err(e) => {
                if connection_survives(&e) {
                    self.release_blocking_connection(conn);
                } else {
                    warn!(queue, "Dropping blocking connection: {}", e);
                }
                Err(e.into())
            }
        }
    }

    async fn len(&self, queue: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    async fn clear(&self, queues: &[&str]) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().hlen(STATUS_HASH).del(STATUS_HASH).ignore();
        for queue in queues {
            pipe.del(*queue).ignore();
        }

        let (removed,): (usize,) = pipe.query_async(&mut conn).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn test_reply_errors_keep_the_connection() {
        let wrong_type = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        assert!(connection_survives(&wrong_type));

        let script = RedisError::from((ErrorKind::ResponseError, "ERR unknown command"));
        assert!(connection_survives(&script));
    }

    #[test]
    fn test_transport_errors_drop_the_connection() {
        let reset = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(!connection_survives(&reset));

        let refused = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(!connection_survives(&refused));
    }
}
