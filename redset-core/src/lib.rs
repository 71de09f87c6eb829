//! # Redset Core
//! Handles to sets held by a remote store, with an optimistic read-after-write
//! primitive on top of the store's watch and transaction support.
//!
//! ```rust
//! use redset_core::{members, ConnectionConfig, RemoteSet};
//! use redset_store::test_utils::MemStore;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = MemStore::default();
//! let set = RemoteSet::new("visitors", ConnectionConfig::Store(store)).await?;
//!
//! set.add(members!(["alice", "bob"], "carol")).await?;
//! assert_eq!(set.size().await?, 3);
//!
//! // The count is read atomically with the add, even with other writers around.
//! assert_eq!(set.add_with_count("dave").await?, 4);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod cancel;
pub mod coordinator;
mod error;
mod members;
mod retry;
mod set;

pub use cancel::CancelToken;
pub use coordinator::{Committed, Coordinator, ReadAfterWrite};
pub use error::SetError;
pub use members::{IntoMembers, MemberBatch};
pub use redset_store::{ConnectionConfig, Member, Pool, ScanPage, SetStore, SCAN_START};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use set::{RemoteSet, RemoteSetBuilder, SetOptions, SetRef, SetResult};
