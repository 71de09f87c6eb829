use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::storage::{SetConnection, SetStore, StoreError};

/// A bounded pool of connections to a [SetStore].
///
/// At most `max_size` connections are checked out at any one time, callers wait
/// for a connection to be returned once the limit is reached. Connections are
/// opened lazily and kept around once returned.
pub struct Pool<S: SetStore> {
    inner: Arc<PoolInner<S>>,
}

struct PoolInner<S: SetStore> {
    store: S,
    idle: Mutex<Vec<S::Connection>>,
    permits: Arc<Semaphore>,
    max_size: usize,
}

impl<S: SetStore> Clone for Pool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SetStore> Debug for Pool<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_size", &self.inner.max_size)
            .field("in_use", &self.in_use())
            .field("idle", &self.idle_connections())
            .finish()
    }
}

impl<S: SetStore> Pool<S> {
    /// Creates a new pool which opens up to `max_size` connections to the store.
    pub fn new(store: S, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                idle: Mutex::new(Vec::with_capacity(max_size)),
                permits: Arc::new(Semaphore::new(max_size)),
                max_size,
            }),
        }
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    #[inline]
    /// The store connections are opened against.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The number of connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.max_size - self.inner.permits.available_permits()
    }

    /// The number of opened connections waiting to be reused.
    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Checks out a connection, waiting for one to become available if the pool is at capacity.
    ///
    /// The connection is handed back to the pool once the returned guard is dropped.
    pub async fn get(&self) -> Result<PooledConnection<S>, StoreError<S>> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");

        let reused = self.inner.idle.lock().pop();
        let conn = match reused {
            Some(conn) => {
                trace!(in_use = self.in_use(), "Reusing idle pool connection.");
                conn
            },
            None => {
                trace!(in_use = self.in_use(), "Opening new pool connection.");
                self.inner.store.connect().await?
            },
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            broken: false,
            _permit: permit,
        })
    }
}

/// A connection checked out of a [Pool].
///
/// Dropping the guard returns the connection to the pool unless it has been
/// marked as broken, in which case it is closed instead.
pub struct PooledConnection<S: SetStore> {
    conn: Option<S::Connection>,
    pool: Arc<PoolInner<S>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<S: SetStore> PooledConnection<S> {
    /// Prevents the connection from being reused once it is dropped.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<S: SetStore> Deref for PooledConnection<S> {
    type Target = S::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is only taken on drop")
    }
}

impl<S: SetStore> DerefMut for PooledConnection<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is only taken on drop")
    }
}

impl<S: SetStore> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken || !conn.is_reusable() {
                trace!("Discarding broken pool connection.");
                return;
            }

            trace!("Returning connection to pool.");
            self.pool.idle.lock().push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemStore;

    #[tokio::test]
    async fn test_pool_reuses_connections() {
        let store = MemStore::default();
        let pool = Pool::new(store.clone(), 2);

        {
            let mut conn = pool.get().await.expect("Get connection.");
            conn.scard("key").await.expect("Run command.");
            assert_eq!(pool.in_use(), 1);
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_connections(), 1);

        let _conn = pool.get().await.expect("Get connection.");
        assert_eq!(store.stats().connections_opened, 1, "Idle connection should be reused.");
    }

    #[tokio::test]
    async fn test_pool_respects_capacity() {
        let pool = Pool::new(MemStore::default(), 1);

        let first = pool.get().await.expect("Get connection.");
        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), pool.get()).await;
        assert!(pending.is_err(), "Second checkout should wait for the first to be returned.");

        drop(first);
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), pool.get()).await;
        assert!(second.is_ok(), "Checkout should succeed once a connection is returned.");
    }

    #[tokio::test]
    async fn test_broken_connections_are_discarded() {
        let store = MemStore::default();
        let pool = Pool::new(store.clone(), 1);

        let mut conn = pool.get().await.expect("Get connection.");
        conn.mark_broken();
        drop(conn);

        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.in_use(), 0);

        let _conn = pool.get().await.expect("Get connection.");
        assert_eq!(store.stats().connections_opened, 2);
    }
}
