use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, Stream, TryStreamExt};
use redset_store::{
    ConnectionConfig,
    ConnectionGuard,
    ConnectionSource,
    Member,
    ReadOp,
    ScanPage,
    SetConnection,
    SetStore,
    StoreError,
    WriteOp,
    SCAN_START,
};

use crate::cancel::CancelToken;
use crate::coordinator::{Committed, Coordinator, ReadAfterWrite};
use crate::error::SetError;
use crate::members::IntoMembers;
use crate::retry::RetryPolicy;

/// The result type of every operation on a [RemoteSet] backed by the store `S`.
pub type SetResult<T, S> = Result<T, SetError<StoreError<S>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Behaviour applied to every write made through a [RemoteSet].
pub struct SetOptions {
    /// When set, the time to live of the set is refreshed after every add.
    pub expire: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A reference to another set, either by its raw name or through a handle.
pub struct SetRef(String);

impl SetRef {
    #[inline]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SetRef {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for SetRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&String> for SetRef {
    fn from(name: &String) -> Self {
        Self(name.clone())
    }
}

impl<S: SetStore> From<&RemoteSet<S>> for SetRef {
    fn from(set: &RemoteSet<S>) -> Self {
        Self(set.name().to_string())
    }
}

/// Configures a [RemoteSet] before connecting it to a store.
///
/// The store type is usually inferred from the config passed to
/// [RemoteSetBuilder::connect].
pub struct RemoteSetBuilder<S: SetStore> {
    name: String,
    options: SetOptions,
    retry_policy: RetryPolicy,
    _store: PhantomData<fn() -> S>,
}

impl<S: SetStore> RemoteSetBuilder<S> {
    /// Create a new builder for the set with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: SetOptions::default(),
            retry_policy: RetryPolicy::default(),
            _store: PhantomData,
        }
    }

    /// Refresh the set's time to live after every add.
    ///
    /// The store works in whole seconds, sub-second durations are rounded up.
    /// A zero duration disables the refresh.
    pub fn with_expiry(mut self, expire: Duration) -> Self {
        self.options.expire = (!expire.is_zero()).then_some(expire);
        self
    }

    /// Set the policy used when an optimistic operation conflicts with other writers.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validates the configuration and binds the set to the store.
    ///
    /// When given a store directly, a single dedicated connection is opened
    /// straight away and shared by every clone of the handle.
    pub async fn connect(self, config: ConnectionConfig<S>) -> SetResult<RemoteSet<S>, S> {
        if self.name.is_empty() {
            return Err(SetError::InvalidName);
        }

        if let ConnectionConfig::Pool(pool) = &config {
            if pool.max_size() == 0 {
                return Err(SetError::InvalidConnectionConfig(
                    "A connection pool must allow at least one connection.".to_string(),
                ));
            }
        }

        let source = ConnectionSource::from_config(config)
            .await
            .map_err(SetError::Store)?;

        info!(
            name = %self.name,
            pooled = source.is_pooled(),
            expire = ?self.options.expire,
            "Created remote set handle.",
        );

        Ok(RemoteSet {
            inner: Arc::new(SetInner {
                name: self.name,
                source,
                options: self.options,
                coordinator: Coordinator::new(self.retry_policy),
            }),
        })
    }
}

/// A handle to a single set held by a remote store.
///
/// The handle only holds the name of the set and a source of connections, all
/// data lives in the store. Cloning the handle is cheap and clones share the
/// same connection source.
pub struct RemoteSet<S: SetStore> {
    inner: Arc<SetInner<S>>,
}

struct SetInner<S: SetStore> {
    name: String,
    source: ConnectionSource<S>,
    options: SetOptions,
    coordinator: Coordinator,
}

impl<S: SetStore> Clone for RemoteSet<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SetStore> Debug for RemoteSet<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSet")
            .field("name", &self.inner.name)
            .field("pooled", &self.inner.source.is_pooled())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<S: SetStore> RemoteSet<S> {
    /// Creates a handle with the default options.
    pub async fn new(name: impl Into<String>, config: ConnectionConfig<S>) -> SetResult<Self, S> {
        RemoteSetBuilder::new(name).connect(config).await
    }

    pub fn builder(name: impl Into<String>) -> RemoteSetBuilder<S> {
        RemoteSetBuilder::new(name)
    }

    #[inline]
    /// The key of the set within the store.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn options(&self) -> &SetOptions {
        &self.inner.options
    }

    #[inline]
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.inner.coordinator.policy()
    }

    /// Adds the members to the set, returning how many were not already present.
    ///
    /// The input is flattened into a single call, an empty batch does not touch
    /// the store at all. A failure to refresh the expiry afterwards is only logged,
    /// the add itself has already been applied.
    pub async fn add(&self, members: impl IntoMembers) -> SetResult<u64, S> {
        let members = members.into_members();
        if members.is_empty() {
            return Ok(0);
        }

        let mut guard = self.acquire().await?;
        let res = guard.connection().sadd(self.name(), &members).await;
        let added = self.release(guard, res)?;

        self.refresh_expiry().await;
        Ok(added)
    }

    /// Removes the members from the set, returning how many were present.
    pub async fn remove(&self, members: impl IntoMembers) -> SetResult<u64, S> {
        let members = members.into_members();
        if members.is_empty() {
            return Ok(0);
        }

        let mut guard = self.acquire().await?;
        let res = guard.connection().srem(self.name(), &members).await;
        self.release(guard, res)
    }

    /// Removes and returns a random member, if the set has any.
    pub async fn pop(&self) -> SetResult<Vec<Member>, S> {
        self.pop_many(1).await
    }

    /// Removes and returns up to `count` random members.
    pub async fn pop_many(&self, count: usize) -> SetResult<Vec<Member>, S> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut guard = self.acquire().await?;
        let res = guard.connection().spop(self.name(), count).await;
        self.release(guard, res)
    }

    pub async fn contains(&self, member: impl Into<Member>) -> SetResult<bool, S> {
        let member = member.into();
        let mut guard = self.acquire().await?;
        let res = guard.connection().sismember(self.name(), &member).await;
        self.release(guard, res)
    }

    /// The number of members in the set.
    pub async fn size(&self) -> SetResult<u64, S> {
        let mut guard = self.acquire().await?;
        let res = guard.connection().scard(self.name()).await;
        self.release(guard, res)
    }

    /// Every member of the set, in no particular order.
    pub async fn all(&self) -> SetResult<Vec<Member>, S> {
        let mut guard = self.acquire().await?;
        let res = guard.connection().smembers(self.name()).await;
        self.release(guard, res)
    }

    /// Deletes the set.
    ///
    /// Always returns an empty vector, the removed members are not read back.
    pub async fn clear(&self) -> SetResult<Vec<Member>, S> {
        let mut guard = self.acquire().await?;
        let res = guard.connection().del(self.name()).await;
        self.release(guard, res)?;
        Ok(Vec::new())
    }

    /// Sets the time to live of the set, rounded up to whole seconds.
    ///
    /// Returns `false` if the set does not exist. A zero duration deletes the set.
    pub async fn expire(&self, ttl: Duration) -> SetResult<bool, S> {
        let mut guard = self.acquire().await?;
        let res = guard.connection().expire(self.name(), ttl_seconds(ttl)).await;
        self.release(guard, res)
    }

    /// The members present in this set and in every one of the others.
    ///
    /// Other sets can be given by name or as handles, handles are resolved to
    /// their names and the intersection is computed by the store.
    pub async fn intersection<I, R>(&self, others: I) -> SetResult<Vec<Member>, S>
    where
        I: IntoIterator<Item = R>,
        R: Into<SetRef>,
    {
        let keys = std::iter::once(self.name().to_string())
            .chain(others.into_iter().map(|other| other.into().0))
            .collect::<Vec<_>>();

        let mut guard = self.acquire().await?;
        let res = guard.connection().sinter(&keys).await;
        self.release(guard, res)
    }

    /// Fetches a single page of a scan over the set.
    ///
    /// A scan starts at cursor `0` and is complete once the returned cursor is
    /// `0` again. `page_size` is only a hint to the store, and `pattern` filters
    /// members after they were read so pages may come back empty even though the
    /// scan is not complete.
    pub async fn scan(&self, cursor: u64, page_size: usize, pattern: &str) -> SetResult<ScanPage, S> {
        let mut guard = self.acquire().await?;
        let res = guard
            .connection()
            .sscan(self.name(), cursor, page_size, pattern)
            .await;
        self.release(guard, res)
    }

    /// A lazy stream over every member of the set, fetched one page at a time.
    ///
    /// The stream is forward only and cannot be restarted. Members added or
    /// removed while it runs may or may not be yielded, but members present for
    /// the whole scan are yielded at least once as every store's
    /// [SetConnection::sscan] guarantees.
    pub fn enumerator(&self, page_size: usize) -> impl Stream<Item = SetResult<Member, S>> {
        let set = self.clone();
        stream::try_unfold(Some(SCAN_START), move |cursor| {
            Self::next_page(set.clone(), cursor, page_size)
        })
        .map_ok(|members| stream::iter(members.into_iter().map(Ok::<_, SetError<StoreError<S>>>)))
        .try_flatten()
    }

    async fn next_page(
        self,
        cursor: Option<u64>,
        page_size: usize,
    ) -> SetResult<Option<(Vec<Member>, Option<u64>)>, S> {
        let cursor = match cursor {
            Some(cursor) => cursor,
            None => return Ok(None),
        };

        let page = self.scan(cursor, page_size, "*").await?;
        let next = if page.is_last() { None } else { Some(page.cursor) };
        Ok(Some((page.members, next)))
    }

    /// Adds the member and returns the size of the set right after it was added.
    ///
    /// The size is read atomically with the add, so it never includes changes made
    /// by other writers after the add. Concurrent modifications of the set cause the
    /// operation to be retried according to the handle's [RetryPolicy].
    ///
    /// Once the add has committed its count is returned, even if refreshing the
    /// expiry afterwards fails.
    pub async fn add_with_count(&self, member: impl Into<Member>) -> SetResult<u64, S> {
        self.add_with_count_inner(member.into(), None).await
    }

    /// Same as [RemoteSet::add_with_count], giving up with [SetError::Cancelled]
    /// once the token is cancelled.
    pub async fn add_with_count_cancellable(
        &self,
        member: impl Into<Member>,
        cancel: &CancelToken,
    ) -> SetResult<u64, S> {
        self.add_with_count_inner(member.into(), Some(cancel)).await
    }

    /// Removes the member and returns the size of the set right after it was removed.
    pub async fn remove_with_count(&self, member: impl Into<Member>) -> SetResult<u64, S> {
        let op = ReadAfterWrite::new(WriteOp::Remove(vec![member.into()]), ReadOp::Cardinality);
        let committed = self.read_after_write(op, None).await?;
        expect_count(committed)
    }

    /// Adds the member and checks if `other` is part of the set right after the add.
    pub async fn add_and_contains(
        &self,
        member: impl Into<Member>,
        other: impl Into<Member>,
    ) -> SetResult<bool, S> {
        let op = ReadAfterWrite::new(
            WriteOp::Add(vec![member.into()]),
            ReadOp::Contains(other.into()),
        );
        let committed = self.read_after_write(op, None).await?;
        self.refresh_expiry().await;

        committed.read.as_bool().ok_or_else(|| {
            SetError::UnexpectedReply(format!("expected a boolean, got {:?}", committed.read))
        })
    }

    /// Alias of [RemoteSet::add].
    pub async fn push(&self, members: impl IntoMembers) -> SetResult<u64, S> {
        self.add(members).await
    }

    /// Alias of [RemoteSet::add_with_count].
    pub async fn push_with_count(&self, member: impl Into<Member>) -> SetResult<u64, S> {
        self.add_with_count(member).await
    }

    /// Alias of [RemoteSet::size].
    pub async fn count(&self) -> SetResult<u64, S> {
        self.size().await
    }

    /// Alias of [RemoteSet::clear].
    pub async fn flush(&self) -> SetResult<Vec<Member>, S> {
        self.clear().await
    }

    /// Alias of [RemoteSet::contains].
    pub async fn include(&self, member: impl Into<Member>) -> SetResult<bool, S> {
        self.contains(member).await
    }

    async fn add_with_count_inner(
        &self,
        member: Member,
        cancel: Option<&CancelToken>,
    ) -> SetResult<u64, S> {
        let op = ReadAfterWrite::new(WriteOp::Add(vec![member]), ReadOp::Cardinality);
        let committed = self.read_after_write(op, cancel).await?;
        self.refresh_expiry().await;
        expect_count(committed)
    }

    async fn read_after_write(
        &self,
        op: ReadAfterWrite,
        cancel: Option<&CancelToken>,
    ) -> SetResult<Committed, S> {
        let committed = self
            .inner
            .coordinator
            .execute(&self.inner.source, self.name(), op, cancel)
            .await?;

        if committed.attempts > 1 {
            debug!(
                name = %self.name(),
                attempts = committed.attempts,
                "Operation committed after retrying.",
            );
        }

        Ok(committed)
    }

    /// Refreshes the time to live after an add has been applied.
    ///
    /// Failures are logged rather than returned, the caller's write has already
    /// committed and its result must not be lost.
    async fn refresh_expiry(&self) {
        let ttl = match self.inner.options.expire {
            Some(ttl) => ttl,
            None => return,
        };

        let res = match self.acquire().await {
            Ok(mut guard) => {
                let res = guard.connection().expire(self.name(), ttl_seconds(ttl)).await;
                self.release(guard, res)
            },
            Err(e) => Err(e),
        };

        if let Err(e) = res {
            warn!(
                name = %self.name(),
                error = ?e,
                "Failed to refresh the expiry of the set after an add.",
            );
        }
    }

    async fn acquire(&self) -> SetResult<ConnectionGuard<S>, S> {
        self.inner.source.acquire().await.map_err(SetError::Store)
    }

    /// Hands the connection back, discarding it if the command failed.
    fn release<T>(
        &self,
        mut guard: ConnectionGuard<S>,
        res: Result<T, StoreError<S>>,
    ) -> SetResult<T, S> {
        if let Err(e) = res.as_ref() {
            warn!(name = %self.name(), error = ?e, "Set operation failed.");
            guard.mark_broken();
        }

        res.map_err(SetError::Store)
    }
}

fn expect_count<E>(committed: Committed) -> Result<u64, SetError<E>>
where
    E: std::fmt::Display + std::fmt::Debug,
{
    committed.read.as_count().ok_or_else(|| {
        SetError::UnexpectedReply(format!("expected a count, got {:?}", committed.read))
    })
}

/// The store's time to live resolution is whole seconds.
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(ttl_seconds(Duration::ZERO), 0);
        assert_eq!(ttl_seconds(Duration::from_millis(1)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(5)), 5);
        assert_eq!(ttl_seconds(Duration::from_millis(5_500)), 6);
    }

    #[test]
    fn test_set_refs() {
        assert_eq!(SetRef::from("a").name(), "a");
        assert_eq!(SetRef::from(String::from("b")).name(), "b");
    }
}
