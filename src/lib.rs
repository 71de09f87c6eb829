//! # Redset
//! Client side handles to sets held by a remote key-value store, with an
//! optimistic "add and count" primitive which stays correct under concurrent writers.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Redset:
//!
//! ### Features
//! - `redset_store` - The transactional store contract, connection pooling and the in-memory test store.
//! - `redset_core` - The `RemoteSet` handle and the retrying read-after-write coordinator.
//! - `redset_redis` - A implementation of the `redset_store::SetStore` trait using Redis.

#[cfg(feature = "redset-store")]
pub use redset_store as store;
#[cfg(feature = "redset-core")]
pub use redset_core as set;
#[cfg(feature = "redset-redis")]
pub use redset_redis as redis;
