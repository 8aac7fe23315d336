//! Context: one polling/execution domain. Owns the handle pools, multi-recv
//! buffers, completion queues and the bulk op-id pool, and drives the
//! transport through progress/trigger.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use smallvec::SmallVec;

use hermes_na::{Endpoint, NaError};

use crate::bulk::BulkOpPool;
use crate::class::Class;
use crate::error::{Error, Result};
use crate::handle::HandleFlags;
use crate::multirecv::MultiRecvSet;
use crate::pool::{HandlePool, PoolStats};
use crate::queue::{CompletionEntry, CompletionQueue, LookupCallback};

/// Bound on teardown drain loops, in milliseconds.
pub(crate) const CLEANUP_TIMEOUT_MS: u32 = 5000;

/// Completions retrieved per transport trigger call.
const MAX_TRIGGER_COUNT: u32 = 1;

const TOKEN_LOOPBACK: Token = Token(0);

struct PollSet {
    poll: Poll,
    events: Events,
}

struct LoopbackNotify {
    waker: Option<Waker>,
    must_notify: AtomicBool,
    lock: Mutex<()>,
}

pub struct Context {
    class: Arc<Class>,
    id: u8,
    endpoints: SmallVec<[Box<dyn Endpoint>; 2]>,
    completion: CompletionQueue,
    loopback: LoopbackNotify,
    poll: Option<Mutex<PollSet>>,
    pools: spin::RwLock<SmallVec<[Option<Arc<HandlePool>>; 2]>>,
    multi_recv: spin::RwLock<Option<Arc<MultiRecvSet>>>,
    pub(crate) bulk_op_pool: BulkOpPool,
    n_handles: AtomicI32,
    multi_recv_count: AtomicI32,
    finalizing: AtomicBool,
}

#[inline]
fn io_err(e: std::io::Error) -> Error {
    Error::Na(NaError::Fault(e.to_string()))
}

impl Context {
    /// Creates a context with the given id, opening one transport endpoint
    /// per class slot and wiring pollable endpoints into a poll set.
    pub fn create(class: &Arc<Class>, id: u8) -> Result<Arc<Context>> {
        let mut endpoints: SmallVec<[Box<dyn Endpoint>; 2]> = SmallVec::new();
        for slot in class.slots() {
            endpoints.push(slot.transport.open(id)?);
        }

        let fds: Vec<(usize, std::os::unix::io::RawFd)> = endpoints
            .iter()
            .enumerate()
            .filter_map(|(i, ep)| ep.poll_fd().map(|fd| (i, fd)))
            .collect();

        let mut waker = None;
        let poll = if fds.is_empty() {
            None
        } else {
            let poll = Poll::new().map_err(io_err)?;
            for (slot, fd) in &fds {
                poll.registry()
                    .register(&mut SourceFd(fd), Token(1 + slot), Interest::READABLE)
                    .map_err(io_err)?;
            }
            if class.opts().loopback {
                // Completion-queue notifications for blocking waiters.
                waker = Some(Waker::new(poll.registry(), TOKEN_LOOPBACK).map_err(io_err)?);
            }
            Some(Mutex::new(PollSet {
                poll,
                events: Events::with_capacity(8),
            }))
        };

        let mut pools = SmallVec::new();
        for _ in class.slots() {
            pools.push(None);
        }

        let context = Arc::new(Context {
            class: Arc::clone(class),
            id,
            endpoints,
            completion: CompletionQueue::new(),
            loopback: LoopbackNotify {
                waker,
                must_notify: AtomicBool::new(false),
                lock: Mutex::new(()),
            },
            poll,
            pools: spin::RwLock::new(pools),
            multi_recv: spin::RwLock::new(None),
            bulk_op_pool: BulkOpPool::new(),
            n_handles: AtomicI32::new(0),
            multi_recv_count: AtomicI32::new(0),
            finalizing: AtomicBool::new(false),
        });
        class.context_created();
        Ok(context)
    }

    #[inline]
    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    pub(crate) fn endpoint(&self, slot: usize) -> &dyn Endpoint {
        self.endpoints[slot].as_ref()
    }

    #[inline]
    pub(crate) fn pool(&self, slot: usize) -> Option<Arc<HandlePool>> {
        self.pools.read().get(slot).and_then(|p| p.clone())
    }

    /// Diagnostics for the primary-slot handle pool.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool(0).map(|p| p.stats())
    }

    #[inline]
    pub(crate) fn finalizing(&self) -> bool {
        self.finalizing.load(Ordering::Acquire)
    }

    pub(crate) fn handle_created(&self) {
        self.n_handles.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn handle_dropped(&self) {
        self.n_handles.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn multi_recv_reset(&self, n: i32) {
        self.multi_recv_count.store(n, Ordering::Release);
    }

    pub(crate) fn multi_recv_dec(&self) -> i32 {
        self.multi_recv_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn multi_recv_inc(&self) {
        self.multi_recv_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Starts listening: creates the handle pools (and multi-recv buffers)
    /// for incoming requests.
    pub fn post(self: &Arc<Self>) -> Result<()> {
        let opts = self.class.opts().clone();
        if !opts.listen {
            return Err(Error::OpNotSupported(
                "cannot post handles on non-listening class",
            ));
        }

        let multi_recv_set = if opts.multi_recv {
            Some(Arc::new(MultiRecvSet::alloc(self)?))
        } else {
            None
        };

        for slot in 0..self.endpoints.len() {
            let mut flags = HandleFlags::LISTEN;
            // Multi-recv owns the receive buffers on the primary slot only.
            if opts.multi_recv && slot == 0 {
                flags |= HandleFlags::MULTI_RECV;
            }
            let pool = HandlePool::create(
                self,
                slot,
                flags,
                opts.request_post_init,
                opts.request_post_incr,
            )?;
            self.pools.write()[slot] = Some(pool);
        }

        // Only post multi-recv once the pool of handles exists.
        if let Some(set) = multi_recv_set {
            set.post(self)?;
            *self.multi_recv.write() = Some(set);
        }
        Ok(())
    }

    /// Cancels pending receives and drains them, bounded by the cleanup
    /// timeout.
    pub fn unpost(self: &Arc<Self>) -> Result<()> {
        if !self.class.opts().listen {
            return Ok(());
        }

        let multi_recv = self.multi_recv.write().take();
        if let Some(set) = &multi_recv {
            set.unpost(self)?;
            self.drain_while(|| self.multi_recv_count.load(Ordering::Acquire) > 0)?;
        }

        let pools: Vec<Arc<HandlePool>> = {
            let mut guard = self.pools.write();
            guard.iter_mut().filter_map(|p| p.take()).collect()
        };
        for pool in &pools {
            pool.unpost(self)?;
            pool.destroy();
        }

        // Wait for any remaining in-flight handles to drain.
        self.drain_while(|| self.n_handles.load(Ordering::Acquire) > 0)?;

        if let Some(set) = multi_recv {
            set.check_released();
        }
        Ok(())
    }

    /// Progress/trigger loop bounded by the cleanup timeout, running while
    /// `cond` holds.
    pub(crate) fn drain_while(self: &Arc<Self>, cond: impl Fn() -> bool) -> Result<()> {
        let deadline =
            minstant::Instant::now() + Duration::from_millis(CLEANUP_TIMEOUT_MS as u64);
        loop {
            loop {
                match self.trigger(0, 1) {
                    Ok(n) if n > 0 => continue,
                    Ok(_) | Err(Error::Timeout) => break,
                    Err(e) => return Err(e),
                }
            }

            if !cond() {
                break;
            }

            let now = minstant::Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = (deadline - now).as_millis() as u32;
            match self.progress(remaining.min(100)) {
                Ok(()) | Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Destroys the context after unposting all pending operations and
    /// draining its completion queues. Fails `Busy` while handles remain.
    pub fn destroy(self: &Arc<Self>) -> Result<()> {
        self.finalizing.store(true, Ordering::Release);

        let result = (|| -> Result<()> {
            self.unpost()?;

            let n_handles = self.n_handles.load(Ordering::Acquire);
            if n_handles != 0 {
                error!("handles must be freed before destroying context ({n_handles} remaining)");
                return Err(Error::Busy("handles are still in use"));
            }
            if !self.completion.is_empty() {
                return Err(Error::Busy("completion queue should be empty"));
            }
            self.bulk_op_pool.clear();
            Ok(())
        })();

        if result.is_err() {
            self.finalizing.store(false, Ordering::Release);
        }
        result
    }

    // ---------------------------------------------------------------------
    // Completion plumbing
    // ---------------------------------------------------------------------

    /// Queues a completion entry. `loopback_notify` wakes a blocked progress
    /// call for completions no transport event will signal.
    pub(crate) fn completion_add(&self, entry: CompletionEntry, loopback_notify: bool) {
        if matches!(entry, CompletionEntry::Bulk(_)) {
            self.class
                .counters
                .bulk_count
                .fetch_add(1, Ordering::Relaxed);
        }
        self.completion.push(entry);

        if loopback_notify {
            if let Some(waker) = &self.loopback.waker {
                let _guard = self.loopback.lock.lock().unwrap();
                // Skip the syscall when nobody is blocked waiting.
                if self.loopback.must_notify.load(Ordering::Acquire) {
                    if let Err(e) = waker.wake() {
                        error!("could not signal completion queue: {e}");
                    }
                }
            }
        }
    }

    /// Looks up `name` asynchronously; the callback fires from trigger.
    pub fn addr_lookup(self: &Arc<Self>, name: &str, cb: LookupCallback) {
        let result = self.class.addr_lookup(name);
        self.completion_add(
            CompletionEntry::Lookup(crate::queue::LookupEntry {
                result,
                callback: cb,
            }),
            true,
        );
    }

    // ---------------------------------------------------------------------
    // Progress
    // ---------------------------------------------------------------------

    /// True when nothing is queued anywhere and every transport agrees it is
    /// safe to block.
    fn poll_try_wait(&self) -> bool {
        if !self.completion.is_empty() {
            return false;
        }
        self.endpoints.iter().all(|ep| ep.try_wait())
    }

    /// Makes progress on the transports for up to `timeout_ms`. Returns
    /// `Ok` as soon as anything progressed or a completion queue became
    /// non-empty, `Err(Timeout)` otherwise.
    pub fn progress(&self, timeout_ms: u32) -> Result<()> {
        let deadline = minstant::Instant::now() + Duration::from_millis(timeout_ms as u64);

        loop {
            let mut safe_wait = false;
            let mut poll_timeout = 0u32;
            let now = minstant::Instant::now();
            let remaining = if now >= deadline {
                0
            } else {
                (deadline - now).as_millis() as u32
            };

            // Bypass notifications entirely when timeout is 0 to avoid
            // system calls on the fast path.
            if timeout_ms != 0 {
                if self.poll.is_some() {
                    let _guard = self.loopback.lock.lock().unwrap();
                    if self.poll_try_wait() {
                        safe_wait = true;
                        poll_timeout = remaining;
                        // We need to be woken for loopback completions while
                        // blocked.
                        self.loopback.must_notify.store(true, Ordering::Release);
                    }
                } else if !self.class.opts().loopback && self.poll_try_wait() {
                    // Transports without a pollable descriptor can block
                    // internally, unless loopback completions could be missed.
                    poll_timeout = remaining;
                }
            }

            let progressed = if safe_wait {
                let progressed = self.poll_wait(poll_timeout);
                self.loopback.must_notify.store(false, Ordering::Release);
                progressed?
            } else {
                let mut progressed = false;
                let n = self.endpoints.len();
                for slot in 0..n {
                    // Only the last transport polled gets the full timeout.
                    let t = if slot + 1 == n { poll_timeout } else { 0 };
                    progressed |= self.progress_endpoint(slot, t)?;
                }
                progressed
            };

            if progressed || !self.completion.is_empty() {
                return Ok(());
            }
            if minstant::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Blocking wait on the poll set covering transport descriptors and the
    /// loopback notification.
    fn poll_wait(&self, timeout_ms: u32) -> Result<bool> {
        let mut guard = self
            .poll
            .as_ref()
            .expect("poll_wait requires a poll set")
            .lock()
            .unwrap();
        let ps = &mut *guard;
        match ps
            .poll
            .poll(&mut ps.events, Some(Duration::from_millis(timeout_ms as u64)))
        {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(io_err(e)),
        }

        let mut progressed = false;
        let tokens: SmallVec<[Token; 4]> = ps.events.iter().map(|ev| ev.token()).collect();
        drop(guard);

        for token in tokens {
            if token == TOKEN_LOOPBACK {
                // The completion was already queued; waking was the point.
                progressed = true;
            } else {
                progressed |= self.progress_endpoint(token.0 - 1, 0)?;
            }
        }
        Ok(progressed)
    }

    /// Triggers and progresses one transport endpoint until something
    /// completed or the timeout expired.
    fn progress_endpoint(&self, slot: usize, timeout_ms: u32) -> Result<bool> {
        let ep = self.endpoint(slot);
        let deadline = minstant::Instant::now() + Duration::from_millis(timeout_ms as u64);

        loop {
            // Trigger everything we can; completions move to this context's
            // completion queue through their callbacks.
            let mut completed = 0;
            loop {
                let n = ep.trigger(MAX_TRIGGER_COUNT)?;
                completed += n;
                if n == 0 {
                    break;
                }
            }
            if completed > 0 {
                return Ok(true);
            }

            let now = minstant::Instant::now();
            if timeout_ms != 0 && now >= deadline {
                return Ok(false);
            }
            let remaining = if timeout_ms == 0 || now >= deadline {
                0
            } else {
                (deadline - now).as_millis() as u32
            };
            match ep.progress(remaining) {
                Ok(()) => {}
                Err(NaError::Timeout) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Trigger
    // ---------------------------------------------------------------------

    /// Pops up to `max_count` completions and dispatches their callbacks,
    /// waiting up to `timeout_ms` for the first one. Returns how many fired,
    /// or `Err(Timeout)` when none did.
    pub fn trigger(self: &Arc<Self>, timeout_ms: u32, max_count: u32) -> Result<u32> {
        let deadline = minstant::Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut count = 0;

        while count < max_count {
            match self.completion.pop() {
                Some(entry) => {
                    self.dispatch(entry)?;
                    count += 1;
                }
                None => {
                    // If something was already processed, leave.
                    if count > 0 {
                        break;
                    }
                    let now = minstant::Instant::now();
                    if timeout_ms == 0 || now >= deadline {
                        return Err(Error::Timeout);
                    }
                    if !self.completion.wait(deadline - now) {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
        Ok(count)
    }

    fn dispatch(self: &Arc<Self>, entry: CompletionEntry) -> Result<()> {
        match entry {
            CompletionEntry::Rpc(handle) => handle.trigger_entry(),
            CompletionEntry::Bulk(op) => crate::bulk::trigger_entry(&op),
            CompletionEntry::Lookup(lookup) => {
                (lookup.callback)(lookup.result);
                Ok(())
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.finalizing.load(Ordering::Acquire) {
            warn!("context dropped without being destroyed");
        }
        self.class.context_dropped();
    }
}
