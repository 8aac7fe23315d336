//! Context completion queues: a lock-free bounded primary queue drained by
//! trigger, spilling to a mutex-protected backfill queue on overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use log::warn;

use crate::addr::Address;
use crate::bulk::BulkOp;
use crate::error::Result;
use crate::handle::Handle;
use std::sync::Arc;

pub(crate) const COMPLETION_QUEUE_SIZE: usize = 1024;

/// Callback invoked when an address lookup completes.
pub type LookupCallback = Box<dyn FnOnce(Result<Arc<Address>>) + Send>;

pub(crate) struct LookupEntry {
    pub result: Result<Arc<Address>>,
    pub callback: LookupCallback,
}

/// Queued completion. Carries the reference that keeps the underlying object
/// alive until trigger releases it; the object's own reference count remains
/// the lifecycle authority.
pub(crate) enum CompletionEntry {
    Rpc(Arc<Handle>),
    Bulk(Arc<BulkOp>),
    Lookup(LookupEntry),
}

pub(crate) struct CompletionQueue {
    primary: ArrayQueue<CompletionEntry>,
    backfill: Mutex<VecDeque<CompletionEntry>>,
    backfill_count: AtomicI32,
    cond: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            primary: ArrayQueue::new(COMPLETION_QUEUE_SIZE),
            backfill: Mutex::new(VecDeque::new()),
            backfill_count: AtomicI32::new(0),
            cond: Condvar::new(),
        }
    }

    /// Queues a completion and wakes anyone waiting in trigger.
    pub fn push(&self, entry: CompletionEntry) {
        if let Err(entry) = self.primary.push(entry) {
            warn!("atomic completion queue is full, pushing to backfill queue");
            let mut backfill = self.backfill.lock().unwrap();
            backfill.push_back(entry);
            self.backfill_count.fetch_add(1, Ordering::Release);
        }

        let _guard = self.backfill.lock().unwrap();
        self.cond.notify_one();
    }

    /// Pops one entry, primary queue first.
    pub fn pop(&self) -> Option<CompletionEntry> {
        if let Some(entry) = self.primary.pop() {
            return Some(entry);
        }
        if self.backfill_count.load(Ordering::Acquire) > 0 {
            let mut backfill = self.backfill.lock().unwrap();
            let entry = backfill.pop_front();
            if entry.is_some() {
                self.backfill_count.fetch_sub(1, Ordering::Release);
            }
            return entry;
        }
        None
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.backfill_count.load(Ordering::Acquire) == 0
    }

    /// Blocks until an entry may be available or the timeout elapses.
    /// Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.backfill.lock().unwrap();
        if !self.is_empty() {
            return true;
        }
        let (_guard, res) = self
            .cond
            .wait_timeout_while(guard, timeout, |_| self.is_empty())
            .unwrap();
        !res.timed_out() || !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_entry() -> CompletionEntry {
        CompletionEntry::Lookup(LookupEntry {
            result: Err(crate::error::Error::Timeout),
            callback: Box::new(|_| {}),
        })
    }

    #[test]
    fn overflow_spills_to_backfill() {
        let q = CompletionQueue::new();
        for _ in 0..COMPLETION_QUEUE_SIZE + 3 {
            q.push(lookup_entry());
        }
        assert_eq!(q.backfill_count.load(Ordering::Acquire), 3);

        let mut n = 0;
        while q.pop().is_some() {
            n += 1;
        }
        assert_eq!(n, COMPLETION_QUEUE_SIZE + 3);
        assert!(q.is_empty());
        assert_eq!(q.backfill_count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn wait_times_out_when_empty() {
        let q = CompletionQueue::new();
        assert!(!q.wait(Duration::from_millis(10)));
        q.push(lookup_entry());
        assert!(q.wait(Duration::from_millis(10)));
    }
}
