//! Shared source-group work queue.
//!
//! Groups wait in a priority queue keyed by the earliest time any
//! account may join them again. A worker pops an entry, owns the group
//! exclusively while scraping it, and pushes it back when it stops
//! early, so two accounts never work the same group at once.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::store::Group;

/// A source group waiting for (or between) scrape passes.
#[derive(Debug, Clone)]
pub struct QueuedGroup {
    pub group: Group,
    pub next_allowed_at: DateTime<Utc>,
    /// Accounts that hit a permanent access error on this group.
    failed_accounts: HashSet<i64>,
}

impl QueuedGroup {
    fn new(group: Group, next_allowed_at: DateTime<Utc>) -> Self {
        Self {
            group,
            next_allowed_at,
            failed_accounts: HashSet::new(),
        }
    }

    /// Records a permanent access failure and reports how many distinct
    /// accounts have failed on this group so far.
    pub fn record_failed_account(&mut self, account_id: i64) -> usize {
        self.failed_accounts.insert(account_id);
        self.failed_accounts.len()
    }

    #[must_use]
    pub fn has_failed_for(&self, account_id: i64) -> bool {
        self.failed_accounts.contains(&account_id)
    }
}

#[derive(Debug)]
struct HeapEntry(QueuedGroup);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reversing yields earliest-first.
        Reverse(self.0.next_allowed_at)
            .cmp(&Reverse(other.0.next_allowed_at))
            .then_with(|| Reverse(self.0.group.id).cmp(&Reverse(other.0.group.id)))
    }
}

#[derive(Debug, Default)]
pub struct GroupQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
}

impl GroupQueue {
    #[must_use]
    pub fn new(groups: Vec<Group>, now: DateTime<Utc>) -> Self {
        let heap = groups
            .into_iter()
            .map(|group| HeapEntry(QueuedGroup::new(group, now)))
            .collect();
        Self {
            heap: Mutex::new(heap),
        }
    }

    /// Pops the group with the earliest allowed join time. The caller
    /// owns the entry until it is requeued or dropped for good.
    pub fn pop(&self) -> Option<QueuedGroup> {
        match self.heap.lock() {
            Ok(mut heap) => heap.pop().map(|entry| entry.0),
            Err(_) => None,
        }
    }

    pub fn requeue(&self, entry: QueuedGroup) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.push(HeapEntry(entry));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().map(|heap| heap.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
