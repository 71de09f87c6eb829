//! An in-memory [SetStore] which mimics the store's watch and transaction semantics.
//!
//! The [MemStore] is primarily intended for testing, it can inject conflicts and
//! concurrent mutations just before a transaction commits, along with outages.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use crate::glob::glob_match;
use crate::{
    Member,
    ReadOp,
    Reply,
    ScanPage,
    SetConnection,
    SetStore,
    TxnOp,
    WriteOp,
    DEFAULT_SCAN_COUNT,
    SCAN_START,
};

type Interleaved = Box<dyn FnOnce(&mut MemState) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum MemStoreError {
    #[error("The store is currently unavailable.")]
    /// The store has been marked as unavailable via [MemStore::set_unavailable].
    Unavailable,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
/// Counters describing how the store has been used.
pub struct MemStoreStats {
    pub connections_opened: u64,
    pub commands: u64,
    pub exec_committed: u64,
    pub exec_aborted: u64,
}

#[derive(Clone, Default)]
/// An in-memory set store.
///
/// Clones share the same underlying data, so a clone can be used to play the
/// role of another client mutating the same keys.
pub struct MemStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<MemState>,
    faults: Mutex<Faults>,
    connections_opened: AtomicU64,
    commands: AtomicU64,
    exec_committed: AtomicU64,
    exec_aborted: AtomicU64,
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    fail_after: Option<u64>,
    forced_conflicts: ForcedConflicts,
    interleaved: VecDeque<Interleaved>,
}

#[derive(Default)]
enum ForcedConflicts {
    #[default]
    None,
    Remaining(usize),
    Forever,
}

impl ForcedConflicts {
    fn take(&mut self) -> bool {
        match self {
            ForcedConflicts::None => false,
            ForcedConflicts::Remaining(n) => {
                *n -= 1;
                if *n == 0 {
                    *self = ForcedConflicts::None;
                }
                true
            },
            ForcedConflicts::Forever => true,
        }
    }
}

impl MemStore {
    /// Aborts the next `n` transactions as if their watched keys had been modified.
    pub fn inject_conflicts(&self, n: usize) {
        let mut faults = self.shared.faults.lock();
        faults.forced_conflicts = if n == 0 {
            ForcedConflicts::None
        } else {
            ForcedConflicts::Remaining(n)
        };
    }

    /// Aborts every transaction until [MemStore::clear_faults] is called.
    pub fn conflict_forever(&self) {
        self.shared.faults.lock().forced_conflicts = ForcedConflicts::Forever;
    }

    /// Runs the mutation just before the next transaction checks its watches.
    ///
    /// This plays the role of another client modifying the store between a watch
    /// being registered and the transaction committing.
    pub fn interleave<F>(&self, mutation: F)
    where
        F: FnOnce(&mut MemState) + Send + 'static,
    {
        self.shared.faults.lock().interleaved.push_back(Box::new(mutation));
    }

    /// Makes every command and connection attempt fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.faults.lock().unavailable = unavailable;
    }

    /// Lets the next `commands` commands through and then marks the store as unavailable.
    ///
    /// Useful to fail the command which follows a committed transaction.
    pub fn fail_after(&self, commands: u64) {
        self.shared.faults.lock().fail_after = Some(commands);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *self.shared.faults.lock() = Faults::default();
    }

    /// Gives direct access to the stored data, bypassing any faults.
    pub fn with_state<T>(&self, cb: impl FnOnce(&mut MemState) -> T) -> T {
        let mut state = self.shared.state.lock();
        cb(&mut *state)
    }

    pub fn stats(&self) -> MemStoreStats {
        MemStoreStats {
            connections_opened: self.shared.connections_opened.load(Ordering::Relaxed),
            commands: self.shared.commands.load(Ordering::Relaxed),
            exec_committed: self.shared.exec_committed.load(Ordering::Relaxed),
            exec_aborted: self.shared.exec_aborted.load(Ordering::Relaxed),
        }
    }

    fn is_unavailable(&self) -> bool {
        self.shared.faults.lock().unavailable
    }

    /// Checks if a command may run, counting it against any pending `fail_after`.
    fn admit_command(&self) -> bool {
        let mut faults = self.shared.faults.lock();
        match faults.fail_after {
            Some(0) => {
                faults.fail_after = None;
                faults.unavailable = true;
            },
            Some(n) if !faults.unavailable => faults.fail_after = Some(n - 1),
            _ => {},
        }
        !faults.unavailable
    }
}

#[async_trait]
impl SetStore for MemStore {
    type Connection = MemConnection;

    async fn connect(&self) -> Result<Self::Connection, MemStoreError> {
        if self.is_unavailable() {
            return Err(MemStoreError::Unavailable);
        }

        self.shared.connections_opened.fetch_add(1, Ordering::Relaxed);
        Ok(MemConnection {
            store: self.clone(),
            watched: HashMap::new(),
        })
    }
}

/// A set along with the scan position of each member.
///
/// Positions are handed out in insertion order and never reused, so a scan
/// cursor stays valid when other members are removed.
struct StoredSet {
    members: BTreeMap<Member, u64>,
    positions: BTreeMap<u64, Member>,
    next_position: u64,
    expires_at: Option<Instant>,
}

impl StoredSet {
    fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            positions: BTreeMap::new(),
            next_position: 1,
            expires_at: None,
        }
    }

    fn insert(&mut self, member: Member) -> bool {
        if self.members.contains_key(&member) {
            return false;
        }

        let position = self.next_position;
        self.next_position += 1;
        self.positions.insert(position, member.clone());
        self.members.insert(member, position);
        true
    }

    fn remove(&mut self, member: &Member) -> bool {
        match self.members.remove(member) {
            Some(position) => {
                self.positions.remove(&position);
                true
            },
            None => false,
        }
    }

    fn contains(&self, member: &Member) -> bool {
        self.members.contains_key(member)
    }

    fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.keys()
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Default)]
/// The data held by a [MemStore].
///
/// Every mutation bumps the version of the key it touches, which is what
/// watches are validated against.
pub struct MemState {
    sets: HashMap<String, StoredSet>,
    versions: HashMap<String, u64>,
    clock: u64,
}

impl MemState {
    /// Adds members to the set, returning how many were newly inserted.
    pub fn sadd<M: Into<Member>>(&mut self, key: &str, members: impl IntoIterator<Item = M>) -> u64 {
        self.purge_if_expired(key);
        let set = self
            .sets
            .entry(key.to_string())
            .or_insert_with(StoredSet::new);

        let mut added = 0;
        for member in members {
            if set.insert(member.into()) {
                added += 1;
            }
        }

        if set.is_empty() {
            self.sets.remove(key);
        }

        if added > 0 {
            self.touch(key);
        }
        added
    }

    /// Removes members from the set, returning how many were present.
    pub fn srem<M: Into<Member>>(&mut self, key: &str, members: impl IntoIterator<Item = M>) -> u64 {
        self.purge_if_expired(key);
        let Some(set) = self.sets.get_mut(key) else {
            return 0;
        };

        let mut removed = 0;
        for member in members {
            if set.remove(&member.into()) {
                removed += 1;
            }
        }

        if set.is_empty() {
            self.sets.remove(key);
        }

        if removed > 0 {
            self.touch(key);
        }
        removed
    }

    /// Deletes the key, returning if it existed.
    pub fn del(&mut self, key: &str) -> bool {
        self.purge_if_expired(key);
        let existed = self.sets.remove(key).is_some();
        if existed {
            self.touch(key);
        }
        existed
    }

    /// The members of the set in sorted order.
    pub fn members(&mut self, key: &str) -> Vec<Member> {
        self.purge_if_expired(key);
        self.sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cardinality(&mut self, key: &str) -> u64 {
        self.purge_if_expired(key);
        self.sets.get(key).map(|set| set.len() as u64).unwrap_or(0)
    }

    pub fn contains(&mut self, key: &str, member: &Member) -> bool {
        self.purge_if_expired(key);
        self.sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false)
    }

    /// The remaining time to live of the key, if it has one.
    pub fn ttl(&mut self, key: &str) -> Option<Duration> {
        self.purge_if_expired(key);
        let expires_at = self.sets.get(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// The current version of the key, `0` if it has never been modified.
    pub fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn pop(&mut self, key: &str, count: usize) -> Vec<Member> {
        self.purge_if_expired(key);
        let Some(set) = self.sets.get_mut(key) else {
            return Vec::new();
        };

        let popped = set
            .iter()
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), count);
        for member in popped.iter() {
            set.remove(member);
        }

        if set.is_empty() {
            self.sets.remove(key);
        }

        if !popped.is_empty() {
            self.touch(key);
        }
        popped
    }

    fn scan(&mut self, key: &str, cursor: u64, count: usize, pattern: &str) -> ScanPage {
        self.purge_if_expired(key);
        let Some(set) = self.sets.get(key) else {
            return ScanPage::default();
        };

        // The cursor is the first position which has not been visited yet.
        let count = if count == 0 { DEFAULT_SCAN_COUNT } else { count };
        let mut page = set.positions.range(cursor.max(1)..);

        let mut members = Vec::new();
        let mut last = None;
        for (position, member) in page.by_ref().take(count) {
            last = Some(*position);
            if glob_match(pattern.as_bytes(), member.as_bytes()) {
                members.push(member.clone());
            }
        }

        let cursor = match (last, page.next()) {
            (Some(last), Some(_)) => last + 1,
            _ => SCAN_START,
        };

        ScanPage { cursor, members }
    }

    fn intersection(&mut self, keys: &[String]) -> Vec<Member> {
        for key in keys {
            self.purge_if_expired(key);
        }

        let Some((first, rest)) = keys.split_first() else {
            return Vec::new();
        };
        let Some(first) = self.sets.get(first) else {
            return Vec::new();
        };

        first
            .iter()
            .filter(|member| {
                rest.iter().all(|key| {
                    self.sets
                        .get(key)
                        .map(|set| set.contains(member))
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect()
    }

    fn expire(&mut self, key: &str, seconds: u64) -> bool {
        self.purge_if_expired(key);
        if !self.sets.contains_key(key) {
            return false;
        }

        if seconds == 0 {
            self.sets.remove(key);
        } else if let Some(set) = self.sets.get_mut(key) {
            set.expires_at = Instant::now().checked_add(Duration::from_secs(seconds));
        }

        self.touch(key);
        true
    }

    fn apply(&mut self, key: &str, op: &TxnOp) -> Reply {
        match op {
            TxnOp::Write(WriteOp::Add(members)) => Reply::Count(self.sadd(key, members)),
            TxnOp::Write(WriteOp::Remove(members)) => Reply::Count(self.srem(key, members)),
            TxnOp::Read(ReadOp::Cardinality) => Reply::Count(self.cardinality(key)),
            TxnOp::Read(ReadOp::Contains(member)) => Reply::Bool(self.contains(key, member)),
            TxnOp::Read(ReadOp::Members) => Reply::Members(self.members(key)),
        }
    }

    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .sets
            .get(key)
            .and_then(|set| set.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);

        if expired {
            self.sets.remove(key);
            self.touch(key);
        }
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }
}

/// A connection to a [MemStore].
///
/// Like a real store connection, watches belong to the connection and any
/// modification of a watched key, including by this connection, aborts the
/// next transaction.
pub struct MemConnection {
    store: MemStore,
    watched: HashMap<String, u64>,
}

impl MemConnection {
    /// Simulates a round trip to the store, giving other tasks a chance to run.
    async fn round_trip(&self) -> Result<(), MemStoreError> {
        tokio::task::yield_now().await;

        if !self.store.admit_command() {
            return Err(MemStoreError::Unavailable);
        }

        self.store.shared.commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn with_state<T>(&self, cb: impl FnOnce(&mut MemState) -> T) -> T {
        self.store.with_state(cb)
    }
}

#[async_trait]
impl SetConnection for MemConnection {
    type Error = MemStoreError;

    async fn sadd(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.sadd(key, members)))
    }

    async fn srem(&mut self, key: &str, members: &[Member]) -> Result<u64, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.srem(key, members)))
    }

    async fn spop(&mut self, key: &str, count: usize) -> Result<Vec<Member>, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.pop(key, count)))
    }

    async fn sismember(&mut self, key: &str, member: &Member) -> Result<bool, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.contains(key, member)))
    }

    async fn scard(&mut self, key: &str) -> Result<u64, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.cardinality(key)))
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<Member>, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.members(key)))
    }

    async fn sscan(
        &mut self,
        key: &str,
        cursor: u64,
        count: usize,
        pattern: &str,
    ) -> Result<ScanPage, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.scan(key, cursor, count, pattern)))
    }

    async fn sinter(&mut self, keys: &[String]) -> Result<Vec<Member>, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.intersection(keys)))
    }

    async fn expire(&mut self, key: &str, seconds: u64) -> Result<bool, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.expire(key, seconds)))
    }

    async fn del(&mut self, key: &str) -> Result<bool, Self::Error> {
        self.round_trip().await?;
        Ok(self.with_state(|state| state.del(key)))
    }

    async fn watch(&mut self, key: &str) -> Result<(), Self::Error> {
        self.round_trip().await?;
        let version = self.with_state(|state| {
            state.purge_if_expired(key);
            state.version(key)
        });
        self.watched.insert(key.to_string(), version);
        Ok(())
    }

    async fn unwatch(&mut self) -> Result<(), Self::Error> {
        self.round_trip().await?;
        self.watched.clear();
        Ok(())
    }

    async fn exec(
        &mut self,
        key: &str,
        ops: &[TxnOp],
    ) -> Result<Option<Vec<Reply>>, Self::Error> {
        self.round_trip().await?;
        let watched = std::mem::take(&mut self.watched);

        let (interleaved, forced_conflict) = {
            let mut faults = self.store.shared.faults.lock();
            let interleaved = faults.interleaved.drain(..).collect::<Vec<_>>();
            (interleaved, faults.forced_conflicts.take())
        };

        let replies = self.with_state(|state| {
            for mutation in interleaved {
                mutation(&mut *state);
            }

            for key in watched.keys() {
                state.purge_if_expired(key);
            }

            let untouched = watched
                .iter()
                .all(|(key, version)| state.version(key) == *version);
            if forced_conflict || !untouched {
                return None;
            }

            Some(ops.iter().map(|op| state.apply(key, op)).collect::<Vec<_>>())
        });

        match replies {
            Some(replies) => {
                self.store.shared.exec_committed.fetch_add(1, Ordering::Relaxed);
                Ok(Some(replies))
            },
            None => {
                debug!(key = key, "Transaction aborted due to a modified watched key.");
                self.store.shared.exec_aborted.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            },
        }
    }
}
