use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::CacheKey;

/// Observable state of one key. Absent keys are `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    InProgress,
    Available,
}

/// Outcome of the atomic check-and-set performed before an upstream fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTicket {
    /// The caller owns the fetch; the key is now `InProgress`.
    Fetch,
    /// Another fetch is streaming this key.
    Wait,
    /// The blob is on disk.
    Ready,
}

#[derive(Debug)]
enum Slot {
    InProgress(Arc<Notify>),
    Available,
}

/// Process-wide key -> state map. The lock only guards map operations and is
/// never held across an await.
#[derive(Debug)]
pub struct CacheIndex {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    poll_interval: Duration,
}

impl CacheIndex {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    pub fn state(&self, key: &CacheKey) -> EntryState {
        match self.slots.lock().get(key) {
            None => EntryState::Empty,
            Some(Slot::InProgress(_)) => EntryState::InProgress,
            Some(Slot::Available) => EntryState::Available,
        }
    }

    pub fn try_begin_fetch(&self, key: &CacheKey) -> FetchTicket {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Available) => FetchTicket::Ready,
            Some(Slot::InProgress(_)) => FetchTicket::Wait,
            None => {
                slots.insert(key.clone(), Slot::InProgress(Arc::new(Notify::new())));
                FetchTicket::Fetch
            }
        }
    }

    /// Idempotent. Wakes every task blocked in [`CacheIndex::wait_available`].
    pub fn mark_available(&self, key: &CacheKey) {
        let previous = self.slots.lock().insert(key.clone(), Slot::Available);
        if let Some(Slot::InProgress(notify)) = previous {
            notify.notify_waiters();
        }
    }

    /// Blocks until `key` is `Available`. Waiters are woken by
    /// `mark_available` and additionally re-check once per poll interval, so
    /// a missed wakeup costs at most one interval.
    pub async fn wait_available(&self, key: &CacheKey) {
        loop {
            let notify = match self.slots.lock().get(key) {
                Some(Slot::InProgress(notify)) => notify.clone(),
                Some(Slot::Available) => return,
                // Keys never move back to Empty; nothing to wait for.
                None => return,
            };

            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();
            if self.state(key) == EntryState::Available {
                return;
            }

            trace!(key = %key, "waiting for in-flight blob fetch");
            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }
    }

    /// Seeds the index from blobs found on disk at startup.
    pub(super) fn insert_available(&self, keys: impl IntoIterator<Item = CacheKey>) {
        let mut slots = self.slots.lock();
        for key in keys {
            slots.insert(key, Slot::Available);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: &str) -> CacheKey {
        CacheKey::parse(value).expect("valid key")
    }

    fn index() -> Arc<CacheIndex> {
        Arc::new(CacheIndex::new(Duration::from_secs(2)))
    }

    #[test]
    fn first_fetch_claims_key() {
        let index = index();
        let k = key("aaa");
        assert_eq!(index.state(&k), EntryState::Empty);
        assert_eq!(index.try_begin_fetch(&k), FetchTicket::Fetch);
        assert_eq!(index.state(&k), EntryState::InProgress);
        assert_eq!(index.try_begin_fetch(&k), FetchTicket::Wait);
    }

    #[test]
    fn available_key_is_ready() {
        let index = index();
        let k = key("bbb");
        index.try_begin_fetch(&k);
        index.mark_available(&k);
        assert_eq!(index.try_begin_fetch(&k), FetchTicket::Ready);
        assert_eq!(index.state(&k), EntryState::Available);
    }

    #[test]
    fn mark_available_is_idempotent() {
        let index = index();
        let k = key("ccc");
        index.try_begin_fetch(&k);
        index.mark_available(&k);
        index.mark_available(&k);
        assert_eq!(index.state(&k), EntryState::Available);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn waiter_wakes_on_mark_available() {
        let index = index();
        let k = key("ddd");
        assert_eq!(index.try_begin_fetch(&k), FetchTicket::Fetch);

        let waiter = {
            let index = index.clone();
            let k = k.clone();
            tokio::spawn(async move { index.wait_available(&k).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        index.mark_available(&k);
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should wake well before the poll interval")
            .expect("waiter task");
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_keeps_polling_while_in_progress() {
        let index = index();
        let k = key("eee");
        index.try_begin_fetch(&k);

        let wait = index.wait_available(&k);
        let outcome = tokio::time::timeout(Duration::from_secs(7), wait).await;
        assert!(outcome.is_err(), "in-progress key must keep the waiter blocked");
        assert_eq!(index.state(&k), EntryState::InProgress);
    }

    #[tokio::test]
    async fn wait_returns_immediately_for_available_key() {
        let index = index();
        let k = key("fff");
        index.insert_available([k.clone()]);
        tokio::time::timeout(Duration::from_millis(50), index.wait_available(&k))
            .await
            .expect("available key should not block");
    }

    #[tokio::test]
    async fn many_waiters_are_released_together() {
        let index = index();
        let k = key("ggg");
        index.try_begin_fetch(&k);

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let index = index.clone();
                let k = k.clone();
                tokio::spawn(async move { index.wait_available(&k).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        index.mark_available(&k);

        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(500), waiter)
                .await
                .expect("waiter released")
                .expect("waiter task");
        }
    }
}
