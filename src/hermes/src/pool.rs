//! Pool of pre-allocated, reusable RPC handles. Listening pools post an
//! unexpected receive per handle (unless multi-recv mode owns the receive
//! buffers) and grow by `incr_count` batches when drained; concurrent growth
//! attempts collapse into a single extension.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::sync::Arc;

use log::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleFlags};

/// Pool diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles created by the pool over its lifetime.
    pub count: u32,
    /// Handles currently pending (pooled, awaiting a message).
    pub pending: usize,
    /// Number of extension events performed.
    pub extensions: u32,
}

pub(crate) struct HandlePool {
    slot: usize,
    flags: HandleFlags,
    pending: spin::Mutex<VecDeque<Arc<Handle>>>,
    extending: Mutex<bool>,
    extend_cv: Condvar,
    count: AtomicU32,
    incr_count: u32,
    extensions: AtomicU32,
}

impl HandlePool {
    pub fn create(
        context: &Arc<Context>,
        slot: usize,
        flags: HandleFlags,
        init_count: u32,
        incr_count: u32,
    ) -> Result<Arc<HandlePool>> {
        debug!("creating pool of handles (init_count={init_count}, incr_count={incr_count})");
        let pool = Arc::new(HandlePool {
            slot,
            flags,
            pending: spin::Mutex::new(VecDeque::with_capacity(init_count as usize)),
            extending: Mutex::new(false),
            extend_cv: Condvar::new(),
            count: AtomicU32::new(init_count),
            incr_count,
            extensions: AtomicU32::new(0),
        });

        for _ in 0..init_count {
            if let Err(e) = pool.insert(context) {
                pool.destroy();
                return Err(e);
            }
        }
        Ok(pool)
    }

    /// Creates one handle, adds it to the pending list and posts its
    /// receive (unless the pool runs in multi-recv mode).
    pub fn insert(&self, context: &Arc<Context>) -> Result<()> {
        let handle = Handle::alloc(context, self.slot, self.flags)?;
        handle.clear_status();
        handle.set_reuse(true);

        self.pending.lock().push_back(Arc::clone(&handle));

        // Handles are pre-posted only when multi-recv is off.
        if !self.flags.contains(HandleFlags::MULTI_RECV) {
            if let Err(e) = handle.post() {
                self.remove_pending(&handle);
                handle.set_reuse(false);
                let _ = handle.destroy();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes and returns a ready-to-use handle, extending the pool when it
    /// runs dry.
    pub fn get(&self, context: &Arc<Context>) -> Result<Arc<Handle>> {
        loop {
            if let Some(handle) = self.pending.lock().pop_front() {
                return Ok(handle);
            }
            if self.incr_count == 0 {
                return Err(Error::Busy("handle pool exhausted"));
            }
            self.extend(context)?;
        }
    }

    /// Grows the pool by `incr_count` handles. Only one thread extends; the
    /// others wait for that extension to finish and re-check the pool.
    pub fn extend(&self, context: &Arc<Context>) -> Result<()> {
        {
            let mut extending = self.extending.lock().unwrap();
            if *extending {
                let _guard = self
                    .extend_cv
                    .wait_while(extending, |extending| *extending)
                    .unwrap();
                return Ok(());
            }
            *extending = true;
        }

        let mut result = Ok(());
        for _ in 0..self.incr_count {
            result = self.insert(context);
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            self.count.fetch_add(self.incr_count, Ordering::AcqRel);
            self.extensions.fetch_add(1, Ordering::AcqRel);
        }

        let mut extending = self.extending.lock().unwrap();
        *extending = false;
        self.extend_cv.notify_all();
        drop(extending);

        result
    }

    pub fn push_pending(&self, handle: Arc<Handle>) {
        self.pending.lock().push_front(handle);
    }

    pub fn remove_pending(&self, handle: &Arc<Handle>) -> bool {
        let mut pending = self.pending.lock();
        if let Some(pos) = pending.iter().position(|h| Arc::ptr_eq(h, handle)) {
            pending.remove(pos);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    #[inline]
    pub fn can_grow(&self) -> bool {
        self.incr_count > 0
    }

    #[inline]
    pub fn incr_count(&self) -> u32 {
        self.incr_count
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            count: self.count.load(Ordering::Acquire),
            pending: self.pending.lock().len(),
            extensions: self.extensions.load(Ordering::Acquire),
        }
    }

    /// Cancels every posted handle; the canceled receives drain through the
    /// regular completion path and destroy their handles.
    pub fn unpost(&self, context: &Arc<Context>) -> Result<()> {
        if self.flags.contains(HandleFlags::MULTI_RECV) {
            return Ok(()); // Nothing was posted per handle.
        }

        let snapshot: Vec<Arc<Handle>> = self.pending.lock().iter().cloned().collect();
        for handle in &snapshot {
            handle.cancel()?;
        }

        // Wait (bounded) for the canceled operations to flow back.
        context.drain_while(|| !self.empty())
    }

    /// Destroys all still-pending handles.
    pub fn destroy(&self) {
        debug!("freeing handle pool");
        let drained: Vec<Arc<Handle>> = self.pending.lock().drain(..).collect();
        for handle in drained {
            handle.set_reuse(false);
            let _ = handle.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{Class, ClassOptions};
    use crate::context::Context;
    use hermes_na::mem::MemFabric;
    use std::sync::Barrier;

    #[test]
    fn concurrent_get_extends_exactly_once() {
        let fabric = MemFabric::new();
        let t = fabric.transport("pool-extend").unwrap();
        let class = Class::new(t, ClassOptions::default()).unwrap();
        let context = Context::create(&class, 0).unwrap();

        // Multi-recv pools own no receive buffers, so nothing is posted and
        // the pool can be exercised in isolation.
        let pool = HandlePool::create(
            &context,
            0,
            HandleFlags::LISTEN | HandleFlags::MULTI_RECV,
            0,
            8,
        )
        .unwrap();
        assert!(pool.empty());

        const THREADS: usize = 4;
        let barrier = Arc::new(Barrier::new(THREADS));
        let mut joins = Vec::new();
        for _ in 0..THREADS {
            let pool = Arc::clone(&pool);
            let context = Arc::clone(&context);
            let barrier = Arc::clone(&barrier);
            joins.push(std::thread::spawn(move || {
                barrier.wait();
                pool.get(&context).unwrap()
            }));
        }
        let handles: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();

        // All concurrent getters collapsed into a single extension event.
        let stats = pool.stats();
        assert_eq!(stats.extensions, 1);
        assert_eq!(stats.count, 8);
        assert_eq!(stats.pending, 8 - THREADS);

        // Every getter got a distinct handle.
        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                assert!(!Arc::ptr_eq(a, b));
            }
        }

        for handle in handles {
            handle.set_reuse(false);
            handle.destroy().unwrap();
        }
        pool.destroy();
        context.destroy().unwrap();
    }

    #[test]
    fn exhausted_fixed_pool_reports_busy() {
        let fabric = MemFabric::new();
        let t = fabric.transport("pool-fixed").unwrap();
        let class = Class::new(t, ClassOptions::default()).unwrap();
        let context = Context::create(&class, 0).unwrap();

        let pool = HandlePool::create(
            &context,
            0,
            HandleFlags::LISTEN | HandleFlags::MULTI_RECV,
            1,
            0,
        )
        .unwrap();

        let handle = pool.get(&context).unwrap();
        assert!(matches!(pool.get(&context), Err(Error::Busy(_))));

        handle.set_reuse(false);
        handle.destroy().unwrap();
        pool.destroy();
        context.destroy().unwrap();
    }
}
