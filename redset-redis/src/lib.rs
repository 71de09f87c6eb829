//! # Redset Redis
//! A [SetStore] implementation backed by a Redis server.
//!
//! Every [RedisConnection] is a dedicated connection, which is required for
//! `WATCH` to behave, watches are tied to the connection which registered them.

#[macro_use]
extern crate tracing;

mod conn;

use async_trait::async_trait;
use redis::{Client, IntoConnectionInfo};
use redset_store::SetStore;

pub use conn::RedisConnection;

#[derive(Debug, thiserror::Error)]
pub enum RedisStoreError {
    #[error("{0}")]
    /// An error was returned by Redis or the connection to it.
    Redis(#[from] redis::RedisError),

    #[error("Redis replied with an unexpected value: {0}")]
    UnexpectedReply(String),

    #[error("A write queued in a transaction must contain at least one member.")]
    EmptyWrite,
}

#[derive(Clone)]
/// A [SetStore] which opens connections to a Redis server.
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// Creates a store for the server at the given address.
    ///
    /// No connection is made until [SetStore::connect] is called.
    ///
    /// ```rust
    /// use redset_redis::RedisStore;
    ///
    /// let store = RedisStore::open("redis://127.0.0.1:6379/").expect("Parse URL.");
    /// # drop(store);
    /// ```
    pub fn open<T: IntoConnectionInfo>(info: T) -> Result<Self, RedisStoreError> {
        let client = Client::open(info)?;
        Ok(Self { client })
    }

    /// Creates a store from an already configured client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    #[inline]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SetStore for RedisStore {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<Self::Connection, RedisStoreError> {
        let conn = self.client.get_async_connection().await?;
        debug!(addr = ?self.client.get_connection_info().addr, "Opened Redis connection.");
        Ok(RedisConnection::new(conn))
    }
}
