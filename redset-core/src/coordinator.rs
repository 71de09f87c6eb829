//! The optimistic read-after-write coordinator.
//!
//! A write and a read are queued into a single atomic block which only commits
//! if the set key was left untouched since the watch on it was registered. A
//! committed block therefore reports a read which reflects exactly the state the
//! write produced, without any other writer's changes mixed in.

use std::time::{Duration, Instant};

use redset_store::{
    ConnectionGuard,
    ConnectionSource,
    ReadOp,
    Reply,
    SetConnection,
    SetStore,
    StoreError,
    TxnOp,
    WriteOp,
};

use crate::cancel::CancelToken;
use crate::error::SetError;
use crate::retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A write paired with the read which should observe its result.
pub struct ReadAfterWrite {
    pub write: WriteOp,
    pub read: ReadOp,
}

impl ReadAfterWrite {
    pub fn new(write: WriteOp, read: ReadOp) -> Self {
        Self { write, read }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The replies of a committed [ReadAfterWrite].
pub struct Committed {
    /// The reply to the write operation.
    pub write: Reply,
    /// The reply to the read operation, observed atomically with the write.
    pub read: Reply,
    /// The number of attempts it took to commit, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
/// Runs [ReadAfterWrite] operations, retrying them according to its [RetryPolicy]
/// whenever a concurrent writer invalidates the watch.
pub struct Coordinator {
    policy: RetryPolicy,
}

impl Coordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[inline]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes the operation against `key` until it commits.
    ///
    /// Every attempt holds its own connection from the source for the duration
    /// of the attempt only. Conflicts are never surfaced directly, the call only
    /// fails once the retry policy gives up, the token is cancelled, or the store
    /// returns an error. Store errors are not retried.
    ///
    /// Waiting for a connection counts against the deadline and is interrupted by
    /// the token, no transaction has been started at that point.
    pub async fn execute<S: SetStore>(
        &self,
        source: &ConnectionSource<S>,
        key: &str,
        op: ReadAfterWrite,
        cancel: Option<&CancelToken>,
    ) -> Result<Committed, SetError<StoreError<S>>> {
        let ops = [TxnOp::Write(op.write), TxnOp::Read(op.read)];
        let start = Instant::now();
        let deadline = self.policy.deadline().and_then(|d| start.checked_add(d));
        let mut attempts = 0;

        loop {
            if is_cancelled(cancel) {
                debug!(key = key, attempts = attempts, "Operation cancelled before attempt.");
                return Err(SetError::Cancelled);
            }

            attempts += 1;
            let guard = acquire(source, key, cancel, deadline, start).await?;
            if let Some(replies) = attempt(guard, key, &ops).await? {
                return committed(replies, attempts);
            }

            debug!(
                key = key,
                attempt = attempts,
                "Transaction aborted by a concurrent modification of the set.",
            );

            let delay = match self.policy.after_conflict(attempts, start.elapsed()) {
                RetryDecision::Retry { delay } => delay,
                RetryDecision::Exhausted => {
                    warn!(
                        key = key,
                        attempts = attempts,
                        "Giving up on operation, retry budget exhausted.",
                    );
                    return Err(SetError::RetryExhausted { attempts });
                },
                RetryDecision::DeadlineExceeded => {
                    let elapsed = start.elapsed();
                    warn!(
                        key = key,
                        attempts = attempts,
                        elapsed = ?elapsed,
                        "Giving up on operation, retry deadline exceeded.",
                    );
                    return Err(SetError::Timeout { elapsed });
                },
            };

            if !delay.is_zero() && !wait(delay, cancel).await {
                debug!(key = key, attempts = attempts, "Operation cancelled during backoff.");
                return Err(SetError::Cancelled);
            }
        }
    }
}

/// Waits for a connection, giving up once the token is cancelled or the deadline passes.
async fn acquire<S: SetStore>(
    source: &ConnectionSource<S>,
    key: &str,
    cancel: Option<&CancelToken>,
    deadline: Option<Instant>,
    start: Instant,
) -> Result<ConnectionGuard<S>, SetError<StoreError<S>>> {
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => futures::future::pending().await,
        }
    };
    let timed_out = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at.into()).await,
            None => futures::future::pending().await,
        }
    };

    tokio::select! {
        biased;

        res = source.acquire() => res.map_err(SetError::Store),
        _ = cancelled => {
            debug!(key = key, "Operation cancelled while waiting for a connection.");
            Err(SetError::Cancelled)
        },
        _ = timed_out => {
            let elapsed = start.elapsed();
            warn!(
                key = key,
                elapsed = ?elapsed,
                "Giving up on operation, deadline passed while waiting for a connection.",
            );
            Err(SetError::Timeout { elapsed })
        },
    }
}

/// Runs a single watch and commit round on the acquired connection.
async fn attempt<S: SetStore>(
    mut guard: ConnectionGuard<S>,
    key: &str,
    ops: &[TxnOp],
) -> Result<Option<Vec<Reply>>, SetError<StoreError<S>>> {
    let res = watch_and_exec(guard.connection(), key, ops).await;
    if let Err(e) = res.as_ref() {
        // The connection may still be holding a watch or be mid transaction.
        if let Err(unwatch_err) = guard.connection().unwatch().await {
            debug!(key = key, error = ?unwatch_err, "Failed to clear watch after error.");
        }
        warn!(key = key, error = ?e, "Transaction attempt failed.");
        guard.mark_broken();
    }

    res.map_err(SetError::Store)
}

async fn watch_and_exec<C: SetConnection>(
    conn: &mut C,
    key: &str,
    ops: &[TxnOp],
) -> Result<Option<Vec<Reply>>, C::Error> {
    conn.watch(key).await?;
    conn.exec(key, ops).await
}

fn committed<E>(replies: Vec<Reply>, attempts: u32) -> Result<Committed, SetError<E>>
where
    E: std::fmt::Display + std::fmt::Debug,
{
    let received = replies.len();
    let mut replies = replies.into_iter();
    match (replies.next(), replies.next()) {
        (Some(write), Some(read)) => Ok(Committed {
            write,
            read,
            attempts,
        }),
        _ => Err(SetError::UnexpectedReply(format!(
            "expected 2 replies from the atomic block, got {received}"
        ))),
    }
}

fn is_cancelled(cancel: Option<&CancelToken>) -> bool {
    cancel.map(CancelToken::is_cancelled).unwrap_or(false)
}

/// Waits out the delay, returning `false` if the token was cancelled first.
async fn wait(delay: Duration, cancel: Option<&CancelToken>) -> bool {
    match cancel {
        None => {
            tokio::time::sleep(delay).await;
            true
        },
        Some(token) => {
            tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = token.cancelled() => false,
            }
        },
    }
}
