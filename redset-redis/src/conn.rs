use async_trait::async_trait;
use redis::aio::Connection;
use redis::{Cmd, FromRedisValue, Pipeline, Value};
use redset_store::{
    Member,
    ReadOp,
    Reply,
    ReplyKind,
    ScanPage,
    SetConnection,
    TxnOp,
    WriteOp,
    DEFAULT_SCAN_COUNT,
};

use crate::RedisStoreError;

/// A single dedicated connection to Redis.
pub struct RedisConnection {
    conn: Connection,
    poisoned: bool,
}

impl RedisConnection {
    pub(crate) fn new(conn: Connection) -> Self {
        Self {
            conn,
            poisoned: false,
        }
    }

    async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Result<T, RedisStoreError> {
        let res = cmd.query_async(&mut self.conn).await;
        self.check(res)
    }

    async fn query_pipeline<T: FromRedisValue>(
        &mut self,
        pipe: &Pipeline,
    ) -> Result<T, RedisStoreError> {
        let res = pipe.query_async(&mut self.conn).await;
        self.check(res)
    }

    fn check<T>(&mut self, res: redis::RedisResult<T>) -> Result<T, RedisStoreError> {
        if let Err(e) = res.as_ref() {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                warn!(error = ?e, "Redis connection failed and will not be reused.");
                self.poisoned = true;
            }
        }

        res.map_err(RedisStoreError::from)
    }
}

fn members_cmd(name: &str, key: &str, members: &[Member]) -> Cmd {
    let mut cmd = redis::cmd(name);
    cmd.arg(key);
    for member in members {
        cmd.arg(member.as_bytes());
    }
    cmd
}

fn into_members(raw: Vec<Vec<u8>>) -> Vec<Member> {
    raw.into_iter().map(Member::from).collect()
}

fn decode_reply(kind: ReplyKind, value: &Value) -> Result<Reply, RedisStoreError> {
    let reply = match kind {
        ReplyKind::Count => Reply::Count(redis::from_redis_value(value)?),
        ReplyKind::Bool => Reply::Bool(redis::from_redis_value(value)?),
        ReplyKind::Members => Reply::Members(into_members(redis::from_redis_value(value)?)),
    };

    Ok(reply)
}

fn queue_op(pipe: &mut Pipeline, key: &str, op: &TxnOp) -> Result<(), RedisStoreError> {
    match op {
        TxnOp::Write(WriteOp::Add(members)) | TxnOp::Write(WriteOp::Remove(members))
            if members.is_empty() =>
        {
            return Err(RedisStoreError::EmptyWrite);
        },
        TxnOp::Write(WriteOp::Add(members)) => {
            pipe.cmd("SADD").arg(key);
            for member in members {
                pipe.arg(member.as_bytes());
            }
        },
        TxnOp::Write(WriteOp::Remove(members)) => {
            pipe.cmd("SREM").arg(key);
            for member in members {
                pipe.arg(member.as_bytes());
            }
        },
        TxnOp::Read(ReadOp::Cardinality) => {
            pipe.cmd("SCARD").arg(key);
        },
        TxnOp::Read(ReadOp::Contains(member)) => {
            pipe.cmd("SISMEMBER").arg(key).arg(member.as_bytes());
        },
        TxnOp::Read(ReadOp::Members) => {
            pipe.cmd("SMEMBERS").arg(key);
        },
    }

    Ok(())
}

#[async_trait]
impl SetConnection for RedisConnection {
    type Error = RedisStoreError;

    async fn sadd(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error> {
        if members.is_empty() {
            return Ok(0);
        }

        self.query(&members_cmd("SADD", key, members)).await
    }

    async fn srem(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error> {
        if members.is_empty() {
            return Ok(0);
        }

        self.query(&members_cmd("SREM", key, members)).await
    }

    async fn spop(&mut self, key: &str, count: usize) -> Result<Vec<Member>, Self::Error> {
        let mut cmd = redis::cmd("SPOP");
        cmd.arg(key).arg(count);
        let raw: Vec<Vec<u8>> = self.query(&cmd).await?;
        Ok(into_members(raw))
    }

    async fn sismember(&mut self, key: &str, member: &Member) -> Result<bool, Self::Error> {
        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(key).arg(member.as_bytes());
        self.query(&cmd).await
    }

    async fn scard(&mut self, key: &str) -> Result<u64, Self::Error> {
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<Member>, Self::Error> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        let raw: Vec<Vec<u8>> = self.query(&cmd).await?;
        Ok(into_members(raw))
    }

    async fn sscan(
        &mut self,
        key: &str,
        cursor: u64,
        count: usize,
        pattern: &str,
    ) -> Result<ScanPage, Self::Error> {
        let count = if count == 0 { DEFAULT_SCAN_COUNT } else { count };

        let mut cmd = redis::cmd("SSCAN");
        cmd.arg(key)
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);
        let (cursor, raw): (u64, Vec<Vec<u8>>) = self.query(&cmd).await?;

        Ok(ScanPage {
            cursor,
            members: into_members(raw),
        })
    }

    async fn sinter(&mut self, keys: &[String]) -> Result<Vec<Member>, Self::Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("SINTER");
        cmd.arg(keys);
        let raw: Vec<Vec<u8>> = self.query(&cmd).await?;
        Ok(into_members(raw))
    }

    async fn expire(&mut self, key: &str, seconds: u64) -> Result<bool, Self::Error> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(seconds);
        self.query(&cmd).await
    }

    async fn del(&mut self, key: &str) -> Result<bool, Self::Error> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: u64 = self.query(&cmd).await?;
        Ok(removed > 0)
    }

    async fn watch(&mut self, key: &str) -> Result<(), Self::Error> {
        let mut cmd = redis::cmd("WATCH");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn unwatch(&mut self) -> Result<(), Self::Error> {
        self.query(&redis::cmd("UNWATCH")).await
    }

    async fn exec(
        &mut self,
        key: &str,
        ops: &[TxnOp],
    ) -> Result<Option<Vec<Reply>>, Self::Error> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            queue_op(&mut pipe, key, op)?;
        }

        // A nil reply to `EXEC` means a watched key changed and nothing was applied.
        let values: Option<Vec<Value>> = self.query_pipeline(&pipe).await?;
        let values = match values {
            Some(values) => values,
            None => {
                debug!(key = key, "Redis discarded transaction due to a modified watched key.");
                return Ok(None);
            },
        };

        if values.len() != ops.len() {
            return Err(RedisStoreError::UnexpectedReply(format!(
                "expected {} replies to the transaction, got {}",
                ops.len(),
                values.len(),
            )));
        }

        ops.iter()
            .zip(values.iter())
            .map(|(op, value)| decode_reply(op.reply_kind(), value))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    fn is_reusable(&self) -> bool {
        !self.poisoned
    }
}
