//! # Redset Store
//! The transactional store contract which redset's set handles are built on top of.
//!
//! A backend only needs to implement two async traits:
//!
//! - [SetStore] which opens connections.
//! - [SetConnection] which runs the basic set commands, registers watches and
//!   executes atomic blocks of [TxnOp]s.
//!
//! On top of these the crate provides a bounded connection [Pool] and a
//! [ConnectionSource] which resolves a [ConnectionConfig] into scoped connection
//! access once, rather than on every call.
//!
//! ## Testing
//! With the `test-utils` feature enabled an in-memory `MemStore` is available along
//! with a `test_suite` which any backend can be run against.
#![cfg_attr(
    feature = "test-utils",
    doc = r#"
```rust
use redset_store::{Member, SetConnection, SetStore};
use redset_store::test_utils::MemStore;

# #[tokio::main]
# async fn main() {
let store = MemStore::default();
let mut conn = store.connect().await.expect("Connect to store.");

conn.sadd("my-set", &[Member::from("a"), Member::from("b")])
    .await
    .expect("Add members.");
assert_eq!(conn.scard("my-set").await.expect("Get cardinality."), 2);
# }
```
"#
)]

#[macro_use]
extern crate tracing;

#[cfg(any(test, feature = "test-utils"))]
mod glob;
mod member;
mod ops;
mod pool;
mod source;
mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use member::Member;
pub use ops::{
    ReadOp,
    Reply,
    ReplyKind,
    ScanPage,
    TxnOp,
    WriteOp,
    DEFAULT_SCAN_COUNT,
    SCAN_START,
};
pub use pool::{Pool, PooledConnection};
pub use source::{ConnectionConfig, ConnectionGuard, ConnectionSource};
#[cfg(any(test, feature = "test-utils"))]
pub use storage::test_suite;
pub use storage::{SetConnection, SetStore, StoreError};
