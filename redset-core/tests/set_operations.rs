use std::collections::BTreeSet;
use std::time::Duration;

use futures::TryStreamExt;
use redset_core::{members, ConnectionConfig, Member, Pool, RemoteSet, SetError};
use redset_store::test_utils::MemStore;

fn names(members: impl IntoIterator<Item = Member>) -> BTreeSet<String> {
    members
        .into_iter()
        .map(|m| m.to_string_lossy().into_owned())
        .collect()
}

fn expected(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

async fn new_set(store: &MemStore, name: &str) -> anyhow::Result<RemoteSet<MemStore>> {
    let set = RemoteSet::new(name, ConnectionConfig::Store(store.clone())).await?;
    Ok(set)
}

#[tokio::test]
async fn test_new_set_is_empty() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "empty").await?;

    assert_eq!(set.name(), "empty");
    assert_eq!(set.size().await?, 0);
    assert!(set.all().await?.is_empty());
    assert!(!set.contains("a").await?);
    assert!(set.pop().await?.is_empty(), "Popping an empty set should return nothing.");

    Ok(())
}

#[tokio::test]
async fn test_add_and_read_back() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "basic").await?;

    assert_eq!(set.add("a").await?, 1);
    assert_eq!(set.add("b").await?, 1);
    assert_eq!(set.add("b").await?, 0, "Re-adding a member should not count.");

    assert_eq!(names(set.all().await?), expected(&["a", "b"]));
    assert_eq!(set.size().await?, 2);
    assert!(set.contains("a").await?);
    assert!(set.include("b").await?);
    assert_eq!(set.count().await?, 2);

    Ok(())
}

#[tokio::test]
async fn test_add_flattens_mixed_input() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "flatten").await?;

    let added = set.add(members!(["a", "b", "c"], "d", ["e", "f"], "g")).await?;
    assert_eq!(added, 7);
    assert_eq!(
        names(set.all().await?),
        expected(&["a", "b", "c", "d", "e", "f", "g"]),
    );

    let added = set.push(vec!["h".to_string(), "i".to_string()]).await?;
    assert_eq!(added, 2);
    assert_eq!(set.size().await?, 9);

    Ok(())
}

#[tokio::test]
async fn test_empty_batches_skip_the_store() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "empty-batch").await?;
    let before = store.stats().commands;

    assert_eq!(set.add(Vec::<Member>::new()).await?, 0);
    assert_eq!(set.remove(members!()).await?, 0);
    assert!(set.pop_many(0).await?.is_empty());

    assert_eq!(store.stats().commands, before, "Empty batches must not reach the store.");

    Ok(())
}

#[tokio::test]
async fn test_remove_flattens_mixed_input() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "remove").await?;

    set.add(["a", "b", "c"]).await?;
    assert_eq!(set.remove(("b", "c")).await?, 2);
    assert_eq!(names(set.all().await?), expected(&["a"]));

    set.add(["b", "c", "d", "e"]).await?;
    assert_eq!(set.remove(members!(["b", "c"], "d")).await?, 3);
    assert_eq!(names(set.all().await?), expected(&["a", "e"]));

    assert_eq!(set.remove("missing").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_pop_removes_members() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "pop").await?;
    set.add(["a", "b", "c", "d"]).await?;

    let popped = set.pop().await?;
    assert_eq!(popped.len(), 1);
    assert!(!set.contains(&popped[0]).await?, "Popped member should be gone.");

    let popped_many = set.pop_many(2).await?;
    assert_eq!(popped_many.len(), 2);
    assert_eq!(set.size().await?, 1);

    let rest = set.pop_many(10).await?;
    assert_eq!(rest.len(), 1, "Only the remaining member should be popped.");

    let mut seen = names(popped);
    seen.extend(names(popped_many));
    seen.extend(names(rest));
    assert_eq!(seen, expected(&["a", "b", "c", "d"]));

    Ok(())
}

#[tokio::test]
async fn test_intersection_by_name_and_handle() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let a = new_set(&store, "inter-a").await?;
    let b = new_set(&store, "inter-b").await?;
    let c = new_set(&store, "inter-c").await?;

    a.add(["a", "b", "c", "d"]).await?;
    b.add(["b", "c", "d"]).await?;
    c.add(["b", "c"]).await?;

    let by_name = a.intersection(["inter-b", "inter-c"]).await?;
    assert_eq!(names(by_name), expected(&["b", "c"]));

    let by_handle = a.intersection([&b, &c]).await?;
    assert_eq!(names(by_handle), expected(&["b", "c"]));

    let with_missing = a.intersection(["inter-missing"]).await?;
    assert!(with_missing.is_empty());

    let alone = a.intersection(Vec::<String>::new()).await?;
    assert_eq!(names(alone), expected(&["a", "b", "c", "d"]));

    Ok(())
}

#[tokio::test]
async fn test_enumerator_yields_every_member_once() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "enumerate").await?;
    let values = (0..57).map(|i| format!("member-{i}")).collect::<Vec<_>>();
    set.add(values.clone()).await?;

    let yielded = set.enumerator(5).try_collect::<Vec<_>>().await?;
    assert_eq!(yielded.len(), values.len(), "Every member should be yielded exactly once.");
    assert_eq!(
        names(yielded),
        values.iter().cloned().collect::<BTreeSet<_>>(),
    );

    Ok(())
}

#[tokio::test]
async fn test_enumerator_small_and_empty_sets() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "enumerate-small").await?;

    let yielded = set.enumerator(10).try_collect::<Vec<_>>().await?;
    assert!(yielded.is_empty());

    // A single page both starts and ends on cursor 0.
    set.add(["a", "b", "c"]).await?;
    let yielded = set.enumerator(10).try_collect::<Vec<_>>().await?;
    assert_eq!(names(yielded), expected(&["a", "b", "c"]));

    Ok(())
}

#[tokio::test]
async fn test_scan_pages_with_pattern() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "scan").await?;
    set.add(["apple", "avocado", "banana", "apricot"]).await?;

    let mut cursor = 0;
    let mut matched = BTreeSet::new();
    loop {
        let page = set.scan(cursor, 2, "a*").await?;
        matched.extend(names(page.members));
        cursor = page.cursor;
        if cursor == 0 {
            break;
        }
    }
    assert_eq!(matched, expected(&["apple", "avocado", "apricot"]));

    Ok(())
}

#[tokio::test]
async fn test_clear_returns_empty() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "clear").await?;
    set.add(["a", "b"]).await?;

    assert!(set.clear().await?.is_empty());
    assert_eq!(set.size().await?, 0);

    set.add("c").await?;
    assert!(set.flush().await?.is_empty());
    assert_eq!(set.size().await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_expire() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = new_set(&store, "expire").await?;

    assert!(!set.expire(Duration::from_secs(30)).await?, "Missing set cannot expire.");

    set.add("a").await?;
    assert!(set.expire(Duration::from_millis(1_500)).await?);
    let ttl = store
        .with_state(|state| state.ttl("expire"))
        .expect("Set should have a time to live.");
    assert!(ttl <= Duration::from_secs(2) && ttl > Duration::from_secs(1), "Got {ttl:?}");

    Ok(())
}

#[tokio::test]
async fn test_expiry_option_refreshes_ttl_after_adds() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = RemoteSet::builder("refresh")
        .with_expiry(Duration::from_secs(60))
        .connect(ConnectionConfig::Store(store.clone()))
        .await?;
    assert_eq!(set.options().expire, Some(Duration::from_secs(60)));

    set.add("a").await?;
    let ttl = store.with_state(|state| state.ttl("refresh"));
    assert!(ttl.is_some(), "Adding should set the time to live.");

    assert!(store.with_state(|state| state.del("refresh")));
    assert_eq!(set.add_with_count("b").await?, 1);
    let ttl = store
        .with_state(|state| state.ttl("refresh"))
        .expect("Counted adds should refresh the time to live.");
    assert!(ttl > Duration::from_secs(59), "Got {ttl:?}");

    let plain = new_set(&store, "no-refresh").await?;
    plain.add("a").await?;
    assert_eq!(store.with_state(|state| state.ttl("no-refresh")), None);

    Ok(())
}

#[tokio::test]
async fn test_failed_expiry_refresh_keeps_committed_result() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let set = RemoteSet::builder("refresh-fails")
        .with_expiry(Duration::from_secs(60))
        .connect(ConnectionConfig::Store(store.clone()))
        .await?;

    // Watch and exec go through, the expiry refresh which follows does not.
    store.fail_after(2);
    assert_eq!(set.add_with_count("a").await?, 1);
    assert_eq!(store.with_state(|state| state.ttl("refresh-fails")), None);
    store.clear_faults();

    // A plain add is a single command before the refresh.
    store.fail_after(1);
    assert_eq!(set.add(["b", "c"]).await?, 2);
    store.clear_faults();

    store.fail_after(2);
    assert!(set.add_and_contains("d", "a").await?);
    store.clear_faults();

    assert_eq!(set.size().await?, 4);
    assert_eq!(store.with_state(|state| state.ttl("refresh-fails")), None);

    Ok(())
}

#[tokio::test]
async fn test_invalid_construction() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let err = RemoteSet::new("", ConnectionConfig::Store(store.clone()))
        .await
        .expect_err("An empty name should be rejected.");
    assert!(matches!(err, SetError::InvalidName), "Got {err:?}");

    let err = RemoteSet::new("name", ConnectionConfig::Pool(Pool::new(store.clone(), 0)))
        .await
        .expect_err("An empty pool should be rejected.");
    assert!(matches!(err, SetError::InvalidConnectionConfig(_)), "Got {err:?}");

    store.set_unavailable(true);
    let err = RemoteSet::new("name", ConnectionConfig::Store(store.clone()))
        .await
        .expect_err("An unreachable store should be reported.");
    assert!(err.is_store_error(), "Got {err:?}");

    Ok(())
}

#[tokio::test]
async fn test_existing_connection_config() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let conn = redset_store::SetStore::connect(&store).await?;
    let set = RemoteSet::new("existing", ConnectionConfig::<MemStore>::Connection(conn)).await?;

    set.add(["a", "b"]).await?;
    assert_eq!(set.size().await?, 2);
    assert_eq!(store.stats().connections_opened, 1, "The given connection should be used.");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pooled_handles_respect_pool_bounds() -> anyhow::Result<()> {
    test_helper::init_tracing();

    let store = MemStore::default();
    let pool = Pool::new(store.clone(), 2);
    let set = RemoteSet::new("pooled", pool.clone().into()).await?;

    let mut tasks = Vec::new();
    for i in 0..32 {
        let set = set.clone();
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            assert!(pool.in_use() <= 2, "Pool handed out too many connections.");
            set.add(format!("member-{i}")).await
        }));
    }

    for task in tasks {
        task.await??;
    }

    assert_eq!(set.size().await?, 32);
    assert!(store.stats().connections_opened <= 2, "Got {:?}", store.stats());
    assert_eq!(pool.in_use(), 0);

    store.set_unavailable(true);
    assert!(set.size().await.is_err());
    assert_eq!(pool.in_use(), 0, "Connections must be released after errors.");
    store.set_unavailable(false);
    assert_eq!(set.size().await?, 32);

    Ok(())
}
