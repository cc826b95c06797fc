//! Optimistic claim of due entries from a time-scored set.
//!
//! Every consumer polls the same set, so an entry is only taken once the
//! removal commits against an unmodified watched key. A conflicting commit
//! means another consumer won; the claim restarts from the watch step.

use async_trait::async_trait;

use crate::TaskError;

/// Store supporting watch / read / compare-and-commit removal
#[async_trait]
pub trait ClaimStore: Send {
    /// Start watching `key` for concurrent modification
    async fn watch(&mut self, key: &str) -> Result<(), TaskError>;

    /// Lowest-scored member with score <= `now`
    async fn first_due(&mut self, key: &str, now: i64) -> Result<Option<Vec<u8>>, TaskError>;

    /// Remove `member` if `key` is unmodified since `watch`; returns false
    /// on conflict.
    async fn commit_remove(&mut self, key: &str, member: &[u8]) -> Result<bool, TaskError>;

    /// Drop the watch without committing
    async fn unwatch(&mut self) -> Result<(), TaskError>;
}

/// Claim the earliest due member of `key`, retrying on conflict.
///
/// Returns `None` when nothing is due.
pub async fn claim_due<S, F>(store: &mut S, key: &str, now: F) -> Result<Option<Vec<u8>>, TaskError>
where
    S: ClaimStore + ?Sized,
    F: Fn() -> i64 + Send,
{
    loop {
        store.watch(key).await?;

        let member = match store.first_due(key, now()).await? {
            Some(member) => member,
            None => {
                store.unwatch().await?;
                return Ok(None);
            }
        };

        if store.commit_remove(key, &member).await? {
            return Ok(Some(member));
        }

        tracing::trace!(key, "Due entry claimed by another consumer, retrying");
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl ClaimStore for deadpool_redis::Connection {
    async fn watch(&mut self, key: &str) -> Result<(), TaskError> {
        redis::cmd("WATCH").arg(key).query_async::<()>(self).await?;
        Ok(())
    }

    async fn first_due(&mut self, key: &str, now: i64) -> Result<Option<Vec<u8>>, TaskError> {
        use redis::AsyncCommands;

        let mut due: Vec<Vec<u8>> = self.zrangebyscore_limit(key, 0, now, 0, 1).await?;
        Ok(due.pop())
    }

    async fn commit_remove(&mut self, key: &str, member: &[u8]) -> Result<bool, TaskError> {
        // EXEC replies nil when the watched key changed
        let committed: Option<(i64,)> = redis::pipe()
            .atomic()
            .zrem(key, member)
            .query_async(self)
            .await?;
        Ok(committed.is_some())
    }

    async fn unwatch(&mut self) -> Result<(), TaskError> {
        redis::cmd("UNWATCH").query_async::<()>(self).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::Arc;

    /// Versioned sorted set: any committed write bumps the version
    #[derive(Default)]
    struct SharedSet {
        version: u64,
        entries: BTreeSet<(i64, Vec<u8>)>,
    }

    struct MemoryStore {
        shared: Arc<Mutex<SharedSet>>,
        watched: Option<u64>,
        commits: usize,
        conflicts: usize,
    }

    impl MemoryStore {
        fn new(shared: Arc<Mutex<SharedSet>>) -> Self {
            Self {
                shared,
                watched: None,
                commits: 0,
                conflicts: 0,
            }
        }
    }

    #[async_trait]
    impl ClaimStore for MemoryStore {
        async fn watch(&mut self, _key: &str) -> Result<(), TaskError> {
            self.watched = Some(self.shared.lock().version);
            Ok(())
        }

        async fn first_due(&mut self, _key: &str, now: i64) -> Result<Option<Vec<u8>>, TaskError> {
            let due = self
                .shared
                .lock()
                .entries
                .iter()
                .find(|(score, _)| *score <= now)
                .map(|(_, member)| member.clone());
            // Let other claimers interleave between read and commit
            tokio::task::yield_now().await;
            Ok(due)
        }

        async fn commit_remove(&mut self, _key: &str, member: &[u8]) -> Result<bool, TaskError> {
            let watched = self.watched.take();
            let mut shared = self.shared.lock();
            if watched != Some(shared.version) {
                self.conflicts += 1;
                return Ok(false);
            }
            shared.entries.retain(|(_, m)| m.as_slice() != member);
            shared.version += 1;
            self.commits += 1;
            Ok(true)
        }

        async fn unwatch(&mut self) -> Result<(), TaskError> {
            self.watched = None;
            Ok(())
        }
    }

    fn shared_with(entries: &[(i64, &str)]) -> Arc<Mutex<SharedSet>> {
        let set = SharedSet {
            version: 0,
            entries: entries
                .iter()
                .map(|(score, m)| (*score, m.as_bytes().to_vec()))
                .collect(),
        };
        Arc::new(Mutex::new(set))
    }

    #[tokio::test]
    async fn test_claims_earliest_due() {
        let shared = shared_with(&[(30, "c"), (10, "a"), (20, "b"), (100, "later")]);
        let mut store = MemoryStore::new(shared.clone());

        let claimed = claim_due(&mut store, "delayed", || 50).await.unwrap();
        assert_eq!(claimed.as_deref(), Some(b"a".as_slice()));
        assert_eq!(shared.lock().entries.len(), 3);
    }

    #[tokio::test]
    async fn test_nothing_due() {
        let shared = shared_with(&[(100, "later")]);
        let mut store = MemoryStore::new(shared.clone());

        assert_eq!(claim_due(&mut store, "delayed", || 50).await.unwrap(), None);
        assert!(store.watched.is_none());
        assert_eq!(shared.lock().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_loses_and_retries() {
        let shared = shared_with(&[(1, "only")]);
        let mut a = MemoryStore::new(shared.clone());
        let mut b = MemoryStore::new(shared.clone());

        // Both read the same candidate under their own watch
        a.watch("delayed").await.unwrap();
        b.watch("delayed").await.unwrap();
        let seen_a = a.first_due("delayed", 5).await.unwrap().unwrap();
        let seen_b = b.first_due("delayed", 5).await.unwrap().unwrap();
        assert_eq!(seen_a, seen_b);

        assert!(a.commit_remove("delayed", &seen_a).await.unwrap());
        assert!(!b.commit_remove("delayed", &seen_b).await.unwrap());

        // Loser's retry finds nothing left
        assert_eq!(claim_due(&mut b, "delayed", || 5).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let members: Vec<String> = (0..50).map(|i| format!("task-{}", i)).collect();
        let entries: Vec<(i64, &str)> = members
            .iter()
            .enumerate()
            .map(|(i, m)| (i as i64, m.as_str()))
            .collect();
        let shared = shared_with(&entries);

        let mut claimers = Vec::new();
        for _ in 0..4 {
            let shared = shared.clone();
            claimers.push(tokio::spawn(async move {
                let mut store = MemoryStore::new(shared);
                let mut claimed = Vec::new();
                while let Some(member) = claim_due(&mut store, "delayed", || 1_000).await.unwrap() {
                    claimed.push(member);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for claimer in claimers {
            all.extend(claimer.await.unwrap());
        }

        let unique: HashSet<&Vec<u8>> = all.iter().collect();
        assert_eq!(all.len(), 50, "every entry is delivered");
        assert_eq!(unique.len(), 50, "no entry is delivered twice");
        assert!(shared.lock().entries.is_empty());
    }
}
