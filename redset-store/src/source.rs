use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::pool::{Pool, PooledConnection};
use crate::storage::{SetStore, StoreError};

/// The ways a set handle can be given access to a store.
pub enum ConnectionConfig<S: SetStore> {
    /// Open a single dedicated connection from the store.
    Store(S),
    /// Use an already opened connection.
    Connection(S::Connection),
    /// Check out a connection from the pool for every operation.
    Pool(Pool<S>),
}

impl<S: SetStore> From<Pool<S>> for ConnectionConfig<S> {
    fn from(pool: Pool<S>) -> Self {
        Self::Pool(pool)
    }
}

impl<S: SetStore> Debug for ConnectionConfig<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionConfig::Store(_) => f.write_str("ConnectionConfig::Store"),
            ConnectionConfig::Connection(_) => f.write_str("ConnectionConfig::Connection"),
            ConnectionConfig::Pool(pool) => {
                f.debug_tuple("ConnectionConfig::Pool").field(pool).finish()
            },
        }
    }
}

/// A resolved source of connections.
///
/// Every operation acquires a [ConnectionGuard] for its duration, which gives it
/// exclusive use of the connection, and releases it on every exit path.
pub enum ConnectionSource<S: SetStore> {
    Dedicated(Arc<Mutex<S::Connection>>),
    Pooled(Pool<S>),
}

impl<S: SetStore> Clone for ConnectionSource<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Dedicated(conn) => Self::Dedicated(conn.clone()),
            Self::Pooled(pool) => Self::Pooled(pool.clone()),
        }
    }
}

impl<S: SetStore> ConnectionSource<S> {
    /// Resolves the config into a source, opening a connection if required.
    pub async fn from_config(config: ConnectionConfig<S>) -> Result<Self, StoreError<S>> {
        let source = match config {
            ConnectionConfig::Store(store) => {
                let conn = store.connect().await?;
                Self::Dedicated(Arc::new(Mutex::new(conn)))
            },
            ConnectionConfig::Connection(conn) => Self::Dedicated(Arc::new(Mutex::new(conn))),
            ConnectionConfig::Pool(pool) => Self::Pooled(pool),
        };

        Ok(source)
    }

    #[inline]
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }

    /// Acquires exclusive use of a connection until the guard is dropped.
    pub async fn acquire(&self) -> Result<ConnectionGuard<S>, StoreError<S>> {
        match self {
            Self::Dedicated(conn) => {
                Ok(ConnectionGuard::Dedicated(conn.clone().lock_owned().await))
            },
            Self::Pooled(pool) => pool.get().await.map(ConnectionGuard::Pooled),
        }
    }
}

/// Scoped access to a single connection.
pub enum ConnectionGuard<S: SetStore> {
    Dedicated(OwnedMutexGuard<S::Connection>),
    Pooled(PooledConnection<S>),
}

impl<S: SetStore> ConnectionGuard<S> {
    /// Prevents a pooled connection from being reused.
    ///
    /// Dedicated connections have nothing to fall back to and are kept.
    pub fn mark_broken(&mut self) {
        if let Self::Pooled(conn) = self {
            conn.mark_broken();
        }
    }

    #[inline]
    pub fn connection(&mut self) -> &mut S::Connection {
        &mut **self
    }
}

impl<S: SetStore> Deref for ConnectionGuard<S> {
    type Target = S::Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Dedicated(conn) => &**conn,
            Self::Pooled(conn) => &**conn,
        }
    }
}

impl<S: SetStore> DerefMut for ConnectionGuard<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Dedicated(conn) => &mut **conn,
            Self::Pooled(conn) => &mut **conn,
        }
    }
}
