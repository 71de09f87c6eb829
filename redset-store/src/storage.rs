use std::error::Error;

use async_trait::async_trait;

use crate::{Member, Reply, ScanPage, TxnOp};

/// The error type produced by a given [SetStore]'s connections.
pub type StoreError<S> = <<S as SetStore>::Connection as SetConnection>::Error;

#[async_trait]
/// A factory for connections to a remote set store.
///
/// Implementations are expected to be cheap to share, the store is held for the
/// lifetime of any pool or set handle built on top of it.
pub trait SetStore: Send + Sync + 'static {
    type Connection: SetConnection;

    /// Opens a new connection to the store.
    async fn connect(&self) -> Result<Self::Connection, StoreError<Self>>;
}

#[async_trait]
/// A single connection to a remote set store.
///
/// Every method maps to exactly one round trip to the store. Watches are scoped
/// to the connection which registered them, so a connection must not be shared
/// while a watch is outstanding.
pub trait SetConnection: Send + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Adds the given members to the set, returning how many were not already present.
    ///
    /// If the set does not exist it should be created.
    async fn sadd(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error>;

    /// Removes the given members from the set, returning how many were present.
    ///
    /// Removing from a set which does not exist is a no-op.
    async fn srem(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error>;

    /// Removes and returns up to `count` arbitrary members of the set.
    async fn spop(&mut self, key: &str, count: usize) -> Result<Vec<Member>, Self::Error>;

    /// Checks if the member exists within the set.
    async fn sismember(&mut self, key: &str, member: &Member) -> Result<bool, Self::Error>;

    /// The number of members in the set, `0` if the set does not exist.
    async fn scard(&mut self, key: &str) -> Result<u64, Self::Error>;

    /// All members of the set in no particular order.
    async fn smembers(&mut self, key: &str) -> Result<Vec<Member>, Self::Error>;

    /// Produces a single page of a cursor based scan over the set.
    ///
    /// `count` is a hint for how many members to look at, `pattern` is a glob
    /// which filters the page after the members have been retrieved.
    ///
    /// Members which are part of the set for the whole duration of a scan must be
    /// returned at least once, even if other members are added or removed in between.
    async fn sscan(
        &mut self,
        key: &str,
        cursor: u64,
        count: usize,
        pattern: &str,
    ) -> Result<ScanPage, Self::Error>;

    /// The members which exist in every one of the given sets.
    async fn sinter(&mut self, keys: &[String]) -> Result<Vec<Member>, Self::Error>;

    /// Sets the time to live of the key in seconds.
    ///
    /// Returns `false` if the key does not exist.
    async fn expire(&mut self, key: &str, seconds: u64) -> Result<bool, Self::Error>;

    /// Deletes the key, returning if it existed.
    async fn del(&mut self, key: &str) -> Result<bool, Self::Error>;

    /// Starts watching the key for modifications.
    ///
    /// The next [SetConnection::exec] on this connection is aborted if the key is
    /// modified by anyone after this call returns.
    async fn watch(&mut self, key: &str) -> Result<(), Self::Error>;

    /// Drops every watch registered on this connection.
    async fn unwatch(&mut self) -> Result<(), Self::Error>;

    /// Executes the operations against `key` as a single atomic block.
    ///
    /// Returns `None` when a watched key was modified and the block was discarded,
    /// otherwise one [Reply] per operation, in order. All watches are cleared either way.
    async fn exec(
        &mut self,
        key: &str,
        ops: &[TxnOp],
    ) -> Result<Option<Vec<Reply>>, Self::Error>;

    /// Returns if the connection can be handed back to a pool for reuse.
    fn is_reusable(&self) -> bool {
        true
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_suite {
    use std::any::type_name;
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use rand::Rng;
    use tracing::instrument;

    use crate::storage::{SetConnection, SetStore};
    use crate::{Member, ReadOp, Reply, ScanPage, TxnOp, WriteOp, SCAN_START};

    /// Wraps a connection and logs every call made to it.
    pub struct InstrumentedConnection<C: SetConnection>(pub C);

    #[async_trait]
    impl<C: SetConnection> SetConnection for InstrumentedConnection<C> {
        type Error = C::Error;

        async fn sadd(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error> {
            info!(key = key, members = ?members, "sadd");
            self.0.sadd(key, members).await
        }

        async fn srem(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error> {
            info!(key = key, members = ?members, "srem");
            self.0.srem(key, members).await
        }

        async fn spop(&mut self, key: &str, count: usize) -> Result<Vec<Member>, Self::Error> {
            info!(key = key, count = count, "spop");
            self.0.spop(key, count).await
        }

        async fn sismember(&mut self, key: &str, member: &Member) -> Result<bool, Self::Error> {
            info!(key = key, member = ?member, "sismember");
            self.0.sismember(key, member).await
        }

        async fn scard(&mut self, key: &str) -> Result<u64, Self::Error> {
            info!(key = key, "scard");
            self.0.scard(key).await
        }

        async fn smembers(&mut self, key: &str) -> Result<Vec<Member>, Self::Error> {
            info!(key = key, "smembers");
            self.0.smembers(key).await
        }

        async fn sscan(
            &mut self,
            key: &str,
            cursor: u64,
            count: usize,
            pattern: &str,
        ) -> Result<ScanPage, Self::Error> {
            info!(key = key, cursor = cursor, count = count, pattern = pattern, "sscan");
            self.0.sscan(key, cursor, count, pattern).await
        }

        async fn sinter(&mut self, keys: &[String]) -> Result<Vec<Member>, Self::Error> {
            info!(keys = ?keys, "sinter");
            self.0.sinter(keys).await
        }

        async fn expire(&mut self, key: &str, seconds: u64) -> Result<bool, Self::Error> {
            info!(key = key, seconds = seconds, "expire");
            self.0.expire(key, seconds).await
        }

        async fn del(&mut self, key: &str) -> Result<bool, Self::Error> {
            info!(key = key, "del");
            self.0.del(key).await
        }

        async fn watch(&mut self, key: &str) -> Result<(), Self::Error> {
            info!(key = key, "watch");
            self.0.watch(key).await
        }

        async fn unwatch(&mut self) -> Result<(), Self::Error> {
            info!("unwatch");
            self.0.unwatch().await
        }

        async fn exec(
            &mut self,
            key: &str,
            ops: &[TxnOp],
        ) -> Result<Option<Vec<Reply>>, Self::Error> {
            info!(key = key, ops = ?ops, "exec");
            self.0.exec(key, ops).await
        }

        fn is_reusable(&self) -> bool {
            self.0.is_reusable()
        }
    }

    /// Runs the conformance suite every [SetStore] backend is expected to pass.
    ///
    /// Keys are namespaced with a random suffix so the suite can run against a
    /// shared server without clobbering existing data.
    pub async fn run_test_suite<S: SetStore>(store: S) {
        info!("Starting test suite for store: {}", type_name::<S>());
        let namespace = format!("redset-suite-{:08x}", rand::thread_rng().gen::<u32>());

        let conn = connect(&store).await;
        let mut conn = InstrumentedConnection(conn);

        test_basic_membership(&mut conn, &namespace).await;
        info!("test_basic_membership OK");

        test_pop_semantics(&mut conn, &namespace).await;
        info!("test_pop_semantics OK");

        test_scan_semantics(&mut conn, &namespace).await;
        info!("test_scan_semantics OK");

        test_intersection_semantics(&mut conn, &namespace).await;
        info!("test_intersection_semantics OK");

        test_expiry_semantics(&mut conn, &namespace).await;
        info!("test_expiry_semantics OK");

        let other = connect(&store).await;
        let mut other = InstrumentedConnection(other);
        test_transaction_semantics(&mut conn, &mut other, &namespace).await;
        info!("test_transaction_semantics OK");
    }

    async fn connect<S: SetStore>(store: &S) -> S::Connection {
        match store.connect().await {
            Ok(conn) => conn,
            Err(e) => panic!("Connecting to the store should not error. Got {:?}", e),
        }
    }

    #[instrument(name = "test_basic_membership", skip(conn))]
    async fn test_basic_membership<C: SetConnection>(conn: &mut C, namespace: &str) {
        info!("Starting test");
        let key = format!("{namespace}:basic");

        let size = conn.scard(&key).await.expect("Get cardinality.");
        assert_eq!(size, 0, "A missing set should have a cardinality of 0.");

        let added = conn
            .sadd(&key, &members(["a", "b", "c"]))
            .await
            .expect("Add members.");
        assert_eq!(added, 3, "All members should be newly added.");

        let added = conn
            .sadd(&key, &members(["c", "d"]))
            .await
            .expect("Add members.");
        assert_eq!(added, 1, "Only `d` should be newly added.");

        assert!(conn.sismember(&key, &Member::from("a")).await.expect("Check member."));
        assert!(!conn.sismember(&key, &Member::from("z")).await.expect("Check member."));

        let all = to_set(conn.smembers(&key).await.expect("Get members."));
        assert_eq!(all, to_set(members(["a", "b", "c", "d"])));

        let removed = conn
            .srem(&key, &members(["b", "z"]))
            .await
            .expect("Remove members.");
        assert_eq!(removed, 1, "Only `b` should be removed.");
        assert_eq!(conn.scard(&key).await.expect("Get cardinality."), 3);

        assert!(conn.del(&key).await.expect("Delete key."), "Key should have existed.");
        assert!(!conn.del(&key).await.expect("Delete key."), "Key should be gone.");
        assert_eq!(conn.scard(&key).await.expect("Get cardinality."), 0);
    }

    #[instrument(name = "test_pop_semantics", skip(conn))]
    async fn test_pop_semantics<C: SetConnection>(conn: &mut C, namespace: &str) {
        info!("Starting test");
        let key = format!("{namespace}:pop");

        let popped = conn.spop(&key, 1).await.expect("Pop from missing set.");
        assert!(popped.is_empty(), "Popping a missing set should return nothing.");

        conn.sadd(&key, &members(["a", "b", "c"]))
            .await
            .expect("Add members.");

        let popped = conn.spop(&key, 2).await.expect("Pop members.");
        assert_eq!(popped.len(), 2);
        let remaining = conn.smembers(&key).await.expect("Get members.");
        assert_eq!(remaining.len(), 1);

        let mut seen = to_set(popped);
        seen.extend(remaining);
        assert_eq!(seen, to_set(members(["a", "b", "c"])), "Popped members must come from the set.");

        let popped = conn.spop(&key, 10).await.expect("Pop members.");
        assert_eq!(popped.len(), 1, "Only the remaining member should be popped.");
        assert_eq!(conn.scard(&key).await.expect("Get cardinality."), 0);
    }

    #[instrument(name = "test_scan_semantics", skip(conn))]
    async fn test_scan_semantics<C: SetConnection>(conn: &mut C, namespace: &str) {
        info!("Starting test");
        let key = format!("{namespace}:scan");

        let page = conn
            .sscan(&key, SCAN_START, 10, "*")
            .await
            .expect("Scan missing set.");
        assert!(page.is_last(), "Scanning a missing set should finish immediately.");
        assert!(page.members.is_empty());

        let expected = (0..57).map(|i| format!("member-{i}")).collect::<Vec<_>>();
        conn.sadd(&key, &members(expected.iter().map(String::as_str)))
            .await
            .expect("Add members.");

        let mut cursor = SCAN_START;
        let mut seen = BTreeSet::new();
        let mut pages = 0;
        loop {
            let page = conn.sscan(&key, cursor, 5, "*").await.expect("Scan page.");
            seen.extend(page.members);
            cursor = page.cursor;
            pages += 1;
            assert!(pages < 1_000, "Scan should terminate.");
            if cursor == SCAN_START {
                break;
            }
        }
        assert_eq!(seen, to_set(members(expected.iter().map(String::as_str))));

        let mut cursor = SCAN_START;
        let mut matched = BTreeSet::new();
        loop {
            let page = conn
                .sscan(&key, cursor, 100, "member-1?")
                .await
                .expect("Scan page.");
            matched.extend(page.members);
            cursor = page.cursor;
            if cursor == SCAN_START {
                break;
            }
        }
        let expected_matches = (10..20).map(|i| format!("member-{i}")).collect::<Vec<_>>();
        assert_eq!(matched, to_set(members(expected_matches.iter().map(String::as_str))));

        let removed = (0..10).map(|i| format!("member-{i}")).collect::<Vec<_>>();
        let mut cursor = SCAN_START;
        let mut seen = BTreeSet::new();
        let mut pages = 0;
        loop {
            let page = conn.sscan(&key, cursor, 5, "*").await.expect("Scan page.");
            seen.extend(page.members);
            cursor = page.cursor;
            pages += 1;
            if pages == 1 {
                conn.srem(&key, &members(removed.iter().map(String::as_str)))
                    .await
                    .expect("Remove members mid scan.");
            }
            assert!(pages < 1_000, "Scan should terminate.");
            if cursor == SCAN_START {
                break;
            }
        }
        let kept = to_set(members(expected[10..].iter().map(String::as_str)));
        assert!(
            kept.is_subset(&seen),
            "Members present for the whole scan must be returned.",
        );

        conn.del(&key).await.expect("Delete key.");
    }

    #[instrument(name = "test_intersection_semantics", skip(conn))]
    async fn test_intersection_semantics<C: SetConnection>(conn: &mut C, namespace: &str) {
        info!("Starting test");
        let a = format!("{namespace}:inter-a");
        let b = format!("{namespace}:inter-b");
        let c = format!("{namespace}:inter-c");

        conn.sadd(&a, &members(["a", "b", "c", "d"])).await.expect("Add members.");
        conn.sadd(&b, &members(["b", "c", "d"])).await.expect("Add members.");
        conn.sadd(&c, &members(["b", "c"])).await.expect("Add members.");

        let inter = conn
            .sinter(&[a.clone(), b.clone(), c.clone()])
            .await
            .expect("Intersect sets.");
        assert_eq!(to_set(inter), to_set(members(["b", "c"])));

        let missing = format!("{namespace}:inter-missing");
        let inter = conn
            .sinter(&[a.clone(), missing])
            .await
            .expect("Intersect sets.");
        assert!(inter.is_empty(), "Intersecting with a missing set should be empty.");

        for key in [a, b, c] {
            conn.del(&key).await.expect("Delete key.");
        }
    }

    #[instrument(name = "test_expiry_semantics", skip(conn))]
    async fn test_expiry_semantics<C: SetConnection>(conn: &mut C, namespace: &str) {
        info!("Starting test");
        let key = format!("{namespace}:expire");

        let res = conn.expire(&key, 10).await.expect("Expire missing key.");
        assert!(!res, "Expiring a missing key should return false.");

        conn.sadd(&key, &members(["a"])).await.expect("Add members.");
        let res = conn.expire(&key, 60).await.expect("Expire key.");
        assert!(res, "Expiring an existing key should return true.");
        assert_eq!(conn.scard(&key).await.expect("Get cardinality."), 1);

        conn.del(&key).await.expect("Delete key.");
    }

    #[instrument(name = "test_transaction_semantics", skip(conn, other))]
    async fn test_transaction_semantics<C: SetConnection>(
        conn: &mut C,
        other: &mut C,
        namespace: &str,
    ) {
        info!("Starting test");
        let key = format!("{namespace}:txn");
        let ops = [
            TxnOp::Write(WriteOp::Add(members(["a"]))),
            TxnOp::Read(ReadOp::Cardinality),
            TxnOp::Read(ReadOp::Contains(Member::from("a"))),
        ];

        conn.watch(&key).await.expect("Watch key.");
        let replies = conn.exec(&key, &ops).await.expect("Exec block.");
        assert_eq!(
            replies,
            Some(vec![Reply::Count(1), Reply::Count(1), Reply::Bool(true)]),
            "An untouched watch should commit.",
        );

        conn.watch(&key).await.expect("Watch key.");
        other.sadd(&key, &members(["b"])).await.expect("Concurrent add.");
        let replies = conn
            .exec(&key, &[TxnOp::Write(WriteOp::Add(members(["c"])))])
            .await
            .expect("Exec block.");
        assert_eq!(replies, None, "A modified watch should abort the block.");
        assert!(
            !conn.sismember(&key, &Member::from("c")).await.expect("Check member."),
            "An aborted block must not apply its writes.",
        );

        let replies = conn
            .exec(&key, &[TxnOp::Read(ReadOp::Cardinality)])
            .await
            .expect("Exec block.");
        assert_eq!(
            replies,
            Some(vec![Reply::Count(2)]),
            "Watches should be cleared by the previous exec.",
        );

        conn.watch(&key).await.expect("Watch key.");
        conn.unwatch().await.expect("Unwatch key.");
        other.srem(&key, &members(["b"])).await.expect("Concurrent remove.");
        let replies = conn
            .exec(&key, &[TxnOp::Read(ReadOp::Members)])
            .await
            .expect("Exec block.");
        assert_eq!(
            replies,
            Some(vec![Reply::Members(members(["a"]))]),
            "Unwatched keys should not abort the block.",
        );

        conn.del(&key).await.expect("Delete key.");
    }

    fn members<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<Member> {
        values.into_iter().map(Member::from).collect()
    }

    fn to_set(values: impl IntoIterator<Item = Member>) -> BTreeSet<Member> {
        values.into_iter().collect()
    }
}
