//! The dispatchable unit and the bot-poll queueing discipline.
//!
//! A [`TaskToRun`] with a queue number is reapable; clearing the queue
//! number is the logical delete used by reap, expire, cancel and dedupe.
//! The record itself is never removed.
//!
//! [`DispatchQueue`] walks the persisted queue-number index lazily, filters
//! candidates by the bot's dimensions, and consults a process-local
//! negative-lookup cache so freshly claimed keys are skipped without another
//! store read. The cache is advisory: a miss costs one read, a false
//! positive is corrected by the reap transaction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::keys::{TaskId, ToRunKey};
use crate::request::{Dimensions, TaskRequest};
use crate::store::{StoreError, TaskStore};

/// Bits of the queue number holding the enqueue timestamp.
const TIMESTAMP_BITS: u32 = 48;

/// Dispatch ordering key: priority in the high bits (lower value wins),
/// milliseconds since epoch in the low 48. Ascending order is
/// highest-priority-oldest-first, and the whole value fits in 63 bits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct QueueNumber(i64);

impl QueueNumber {
    pub fn generate(priority: u8, now: DateTime<Utc>) -> Self {
        let millis = (now.timestamp_millis().max(0) as u64) & ((1 << TIMESTAMP_BITS) - 1);
        QueueNumber((u64::from(priority) << TIMESTAMP_BITS | millis) as i64)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

/// The dispatchable marker for a task. One per request, `try_number`
/// tracking which attempt a reap would start (1, or 2 after a retry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskToRun {
    pub key: ToRunKey,
    pub queue_number: Option<QueueNumber>,
    pub try_number: u8,
    pub expiration_ts: DateTime<Utc>,
}

impl TaskToRun {
    pub fn new(request: &TaskRequest, now: DateTime<Utc>) -> Self {
        TaskToRun {
            key: request.id.to_run_key(),
            queue_number: Some(QueueNumber::generate(request.priority, now)),
            try_number: 1,
            expiration_ts: request.expiration_ts,
        }
    }

    pub fn is_reapable(&self) -> bool {
        self.queue_number.is_some()
    }
}

/// Process-local hint cache of recently non-reapable to-run keys.
pub(crate) struct NegativeCache {
    entries: DashMap<ToRunKey, Instant>,
    ttl: Duration,
}

impl NegativeCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        NegativeCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Record whether `key` is reapable. `false` installs a hint that
    /// expires after the TTL; `true` drops any hint.
    pub(crate) fn set(&self, key: ToRunKey, reapable: bool) {
        if reapable {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, Instant::now() + self.ttl);
        }
    }

    /// True when a live hint says the key is not worth reading.
    pub(crate) fn contains(&self, key: &ToRunKey) -> bool {
        if let Some(entry) = self.entries.get(key) {
            if *entry.value() > Instant::now() {
                return true;
            }
        }
        self.entries.remove(key);
        false
    }
}

/// Lazy view over the dispatchable queue.
pub struct DispatchQueue {
    store: Arc<dyn TaskStore>,
    cache: NegativeCache,
    page_size: usize,
}

impl DispatchQueue {
    pub fn new(store: Arc<dyn TaskStore>, cache_ttl: Duration, page_size: usize) -> Self {
        DispatchQueue {
            store,
            cache: NegativeCache::new(cache_ttl),
            page_size: page_size.max(1),
        }
    }

    /// Candidates matching the bot's dimensions, in dispatch order.
    pub fn next_available<'a>(&'a self, bot_dimensions: &'a Dimensions) -> DispatchScan<'a> {
        DispatchScan {
            queue: self,
            bot_dimensions,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    /// Record a reapability hint for a key.
    pub fn set_lookup_cache(&self, key: ToRunKey, reapable: bool) {
        self.cache.set(key, reapable);
    }

    /// Queued to-runs whose expiration has passed, in dispatch order.
    pub async fn expired_page(
        &self,
        now: DateTime<Utc>,
        after: Option<(QueueNumber, TaskId)>,
    ) -> Result<Vec<(TaskRequest, TaskToRun)>, StoreError> {
        self.store.expired_page(now, after, self.page_size).await
    }
}

/// Cursor over dispatchable (request, to-run) pairs for one bot poll.
pub struct DispatchScan<'a> {
    queue: &'a DispatchQueue,
    bot_dimensions: &'a Dimensions,
    buffer: VecDeque<(TaskRequest, TaskToRun)>,
    cursor: Option<(QueueNumber, TaskId)>,
    exhausted: bool,
}

impl DispatchScan<'_> {
    pub async fn next(&mut self) -> Result<Option<(TaskRequest, TaskToRun)>, StoreError> {
        loop {
            while let Some((request, to_run)) = self.buffer.pop_front() {
                if self.queue.cache.contains(&to_run.key) {
                    continue;
                }
                if !request
                    .properties
                    .dimensions_subset_of(self.bot_dimensions)
                {
                    continue;
                }
                return Ok(Some((request, to_run)));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self
                .queue
                .store
                .dispatch_page(self.cursor, self.queue.page_size)
                .await?;
            if page.len() < self.queue.page_size {
                self.exhausted = true;
            }
            if let Some((request, to_run)) = page.last() {
                if let Some(queue_number) = to_run.queue_number {
                    self.cursor = Some((queue_number, request.id));
                }
            }
            self.buffer.extend(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn queue_number_orders_by_priority_then_age() {
        let urgent_old = QueueNumber::generate(0, at(1_000));
        let urgent_new = QueueNumber::generate(0, at(2_000));
        let relaxed_old = QueueNumber::generate(200, at(1_000));

        assert!(urgent_old < urgent_new);
        assert!(urgent_new < relaxed_old);
    }

    #[test]
    fn queue_number_stays_positive() {
        let worst = QueueNumber::generate(255, at(i64::MAX & ((1 << 48) - 1)));
        assert!(worst.value() > 0, "must fit 63 bits");
    }

    #[test]
    fn negative_cache_hints_expire() {
        let cache = NegativeCache::new(Duration::from_millis(0));
        let key = TaskId::from_raw(7).to_run_key();
        cache.set(key, false);
        // Zero TTL: the hint is already stale.
        assert!(!cache.contains(&key));
    }

    #[test]
    fn negative_cache_set_reapable_clears_hint() {
        let cache = NegativeCache::new(Duration::from_secs(60));
        let key = TaskId::from_raw(7).to_run_key();
        cache.set(key, false);
        assert!(cache.contains(&key));
        cache.set(key, true);
        assert!(!cache.contains(&key));
    }
}
