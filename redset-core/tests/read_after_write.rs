use std::collections::BTreeSet;
use std::time::Duration;

use redset_core::{Backoff, CancelToken, ConnectionConfig, Pool, RemoteSet, RetryPolicy, SetError};
use redset_store::test_utils::MemStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_with_count_returns_distinct_counts() -> anyhow::Result<()> {
    test_helper::init_tracing();

    const WRITERS: u64 = 24;

    let store = MemStore::default();
    let mut tasks = Vec::new();
    for i in 0..WRITERS {
        // Every writer is its own client with its own connection.
        let set = RemoteSet::new("counted", ConnectionConfig::Store(store.clone())).await?;
        tasks.push(tokio::spawn(async move {
            set.add_with_count(format!("member-{i}")).await
        }));
    }

    let mut counts = BTreeSet::new();
    for task in tasks {
        let count = task.await??;
        assert!(counts.insert(count), "Count {count} was reported twice.");
    }

    assert_eq!(counts, (1..=WRITERS).collect::<BTreeSet<_>>());
    assert_eq!(store.with_state(|state| state.cardinality("counted")), WRITERS);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_with_count_over_a_pool() -> anyhow::Result<()> {
    test_helper::init_tracing();

    const WRITERS: u64 = 16;

    let store = MemStore::default();
    let set = RemoteSet::new("counted-pool", Pool::new(store.clone(), 4).into()).await?;

    let mut tasks = Vec::new();
    for i in 0..WRITERS {
        let set = set.clone();
        tasks.push(tokio::spawn(async move {
            set.push_with_count(format!("member-{i}")).await
        }));
    }

    let mut counts = BTreeSet::new();
    for task in tasks {
        counts.insert(task.await??);
    }

    assert_eq!(counts, (1..=WRITERS).collect::<BTreeSet<_>>());

    Ok(())
}

#[tokio::test]
async fn test_interleaved_write_causes_retry_with_fresh_count() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = RemoteSet::new("interleaved", ConnectionConfig::Store(store.clone())).await?;
    set.add(["a", "b"]).await?;

    // Another client adds a member between our watch and commit.
    store.interleave(|state| {
        state.sadd("interleaved", ["other"]);
    });

    let count = set.add_with_count("c").await?;
    assert_eq!(count, 4, "The count must include the concurrent write, not a stale view.");
    assert_eq!(store.stats().exec_aborted, 1);
    assert_eq!(store.stats().exec_committed, 1);

    Ok(())
}

#[tokio::test]
async fn test_remove_with_count_and_add_and_contains() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = RemoteSet::new("variants", ConnectionConfig::Store(store.clone())).await?;
    set.add(["a", "b", "c"]).await?;

    assert_eq!(set.remove_with_count("b").await?, 2);
    assert_eq!(set.remove_with_count("missing").await?, 2);

    store.interleave(|state| {
        state.sadd("variants", ["watched"]);
    });
    assert!(
        set.add_and_contains("d", "watched").await?,
        "The retried read should observe the concurrent add.",
    );
    assert!(!set.add_and_contains("e", "nope").await?);

    Ok(())
}

#[tokio::test]
async fn test_aborted_attempts_leave_no_effects() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let policy = RetryPolicy::unbounded().with_max_attempts(3);
    let set = RemoteSet::builder("budget")
        .with_retry_policy(policy.clone())
        .connect(ConnectionConfig::Store(store.clone()))
        .await?;
    assert_eq!(set.retry_policy(), &policy);

    store.conflict_forever();
    let err = set
        .add_with_count("a")
        .await
        .expect_err("Operation should exhaust its retries.");
    assert!(matches!(err, SetError::RetryExhausted { attempts: 3 }), "Got {err:?}");
    assert_eq!(store.stats().exec_aborted, 3);

    store.clear_faults();
    assert_eq!(set.size().await?, 0, "Aborted attempts must not apply their write.");
    assert_eq!(set.add_with_count("a").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_retry_deadline() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let policy = RetryPolicy::unbounded()
        .with_deadline(Duration::from_millis(40))
        .with_backoff(Backoff::exponential(Duration::from_millis(1), Duration::from_millis(10)));
    let set = RemoteSet::builder("deadline")
        .with_retry_policy(policy)
        .connect(ConnectionConfig::Store(store.clone()))
        .await?;

    store.conflict_forever();
    let err = set
        .add_with_count("a")
        .await
        .expect_err("Operation should time out.");
    match err {
        SetError::Timeout { elapsed } => assert!(elapsed >= Duration::from_millis(40)),
        other => panic!("Expected a timeout, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_cancel_token() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = RemoteSet::new("cancel", ConnectionConfig::Store(store.clone())).await?;

    let token = CancelToken::new();
    token.cancel();
    let err = set
        .add_with_count_cancellable("a", &token)
        .await
        .expect_err("A cancelled token should stop the operation.");
    assert!(matches!(err, SetError::Cancelled), "Got {err:?}");
    assert_eq!(store.stats().exec_committed + store.stats().exec_aborted, 0);

    let token = CancelToken::new();
    assert_eq!(set.add_with_count_cancellable("a", &token).await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_cancel_while_waiting_for_pooled_connection() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let pool = Pool::new(store.clone(), 1);
    let set = RemoteSet::new("saturated", pool.clone().into()).await?;
    let held = pool.get().await?;

    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };

    let err = tokio::time::timeout(
        Duration::from_millis(500),
        set.add_with_count_cancellable("a", &token),
    )
    .await
    .expect("Cancellation should interrupt the wait for a connection.")
    .expect_err("Operation should be cancelled.");
    assert!(matches!(err, SetError::Cancelled), "Got {err:?}");
    canceller.await?;

    drop(held);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(set.size().await?, 0, "A cancelled wait must not apply the write.");
    assert_eq!(set.add_with_count("a").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_store_errors_are_not_retried() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = RemoteSet::new("errors", ConnectionConfig::Store(store.clone())).await?;

    store.set_unavailable(true);
    let err = set
        .add_with_count("a")
        .await
        .expect_err("Store errors should be surfaced.");
    assert!(err.is_store_error(), "Got {err:?}");

    store.set_unavailable(false);
    assert_eq!(set.add_with_count("a").await?, 1);

    Ok(())
}
