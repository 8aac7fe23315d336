//! Multi-recv manager: a small fixed set of large shared receive buffers,
//! each posted once and sliced into per-message handles as messages arrive.
//! A buffer is reposted only when its handle reference count reaches zero
//! and the transport marked it fully consumed.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};

use hermes_na::{MultiRecvEvent, NaError, NaResult, OpToken};

use crate::addr::Address;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::Handle;

pub(crate) const MULTI_RECV_OP_MAX: usize = 4;

// Owned allocation shared by aliasing handles; accessed through raw pointers
// only while posted, so no reference to the whole buffer ever exists
// concurrently with transport writes.
struct RawBuffer {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl RawBuffer {
    fn alloc(len: usize) -> RawBuffer {
        let mut buf = vec![0u8; len];
        let ptr = buf.as_mut_ptr();
        std::mem::forget(buf);
        RawBuffer { ptr, len }
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        // Safety: allocated in `alloc` with capacity == len, never resized.
        unsafe {
            drop(Vec::from_raw_parts(self.ptr, self.len, self.len));
        }
    }
}

pub(crate) struct MultiRecvOp {
    id: usize,
    buf: RawBuffer,
    op: spin::Mutex<Option<OpToken>>,
    /// Buffer fully consumed, pending repost.
    last: AtomicBool,
    /// Handles currently aliasing slices of the buffer.
    ref_count: AtomicI32,
    /// Messages delivered out of the current posting.
    op_count: AtomicI32,
}

pub(crate) struct MultiRecvSet {
    ops: Vec<Arc<MultiRecvOp>>,
}

impl MultiRecvSet {
    /// Allocates the buffers: each sized for `request_post_init` max-size
    /// unexpected messages.
    pub fn alloc(context: &Arc<Context>) -> Result<MultiRecvSet> {
        let class = context.class();
        let unexpected_msg_size = class.slots()[0].transport.max_unexpected_size();
        if unexpected_msg_size == 0 {
            return Err(Error::InvalidArg("invalid unexpected message size"));
        }
        let buf_size = class.opts().request_post_init as usize * unexpected_msg_size;

        let ops = (0..MULTI_RECV_OP_MAX)
            .map(|id| {
                Arc::new(MultiRecvOp {
                    id,
                    buf: RawBuffer::alloc(buf_size),
                    op: spin::Mutex::new(None),
                    last: AtomicBool::new(false),
                    ref_count: AtomicI32::new(0),
                    op_count: AtomicI32::new(0),
                })
            })
            .collect();
        Ok(MultiRecvSet { ops })
    }

    /// Posts every buffer. Enough buffers are kept in flight that handles can
    /// keep being assigned slices while a consumed buffer drains and reposts.
    pub fn post(&self, context: &Arc<Context>) -> Result<()> {
        for op in &self.ops {
            op.post(context)?;
        }
        context.multi_recv_reset(MULTI_RECV_OP_MAX as i32);
        Ok(())
    }

    /// Cancels every posted buffer; cancellations drain through progress.
    pub fn unpost(&self, context: &Arc<Context>) -> Result<()> {
        for op in &self.ops {
            let token = op.op.lock().take();
            if let Some(token) = token {
                context.endpoint(0).cancel(token)?;
            }
        }
        Ok(())
    }

    pub fn check_released(&self) {
        for op in &self.ops {
            let refs = op.ref_count.load(Ordering::Acquire);
            if refs != 0 {
                warn!(
                    "freeing multi-recv operation {} that is still referenced ({refs})",
                    op.id
                );
            }
        }
    }
}

impl MultiRecvOp {
    /// (Re)posts the buffer as one multi-receive operation.
    pub fn post(self: &Arc<Self>, context: &Arc<Context>) -> Result<()> {
        self.last.store(false, Ordering::Release);
        self.ref_count.store(0, Ordering::Release);
        self.op_count.store(0, Ordering::Release);

        let op = Arc::clone(self);
        let ctx = Arc::clone(context);
        // Safety: the buffer allocation lives inside this op, which the
        // callback keeps alive; slices handed to handles are protected by
        // the ref_count/last repost protocol.
        let token = unsafe {
            context.endpoint(0).multi_recv(
                self.buf.ptr,
                self.buf.len,
                Box::new(move |ev| op.input_cb(&ctx, ev)),
            )?
        };
        *self.op.lock() = Some(token);
        debug!("posted multi-recv buffer {} ({} bytes)", self.id, self.buf.len);
        Ok(())
    }

    /// One message arrived in this buffer: take a handle from the pool,
    /// alias the slice into it and run input processing.
    fn input_cb(self: &Arc<Self>, context: &Arc<Context>, ev: NaResult<MultiRecvEvent>) {
        let ev = match ev {
            Ok(ev) => ev,
            Err(NaError::Canceled) => {
                debug!("canceled event on multi-recv op {}", self.id);
                context.multi_recv_dec();
                return;
            }
            Err(e) => {
                error!("transport callback returned error: {e}");
                context.multi_recv_dec();
                return;
            }
        };

        let pool = match context.pool(0) {
            Some(pool) => pool,
            None => {
                error!("no handle pool for multi-recv message");
                return;
            }
        };
        let handle = match pool.get(context) {
            Ok(handle) => handle,
            Err(e) => {
                error!("could not get handle from pool: {e}");
                return;
            }
        };

        self.op_count.fetch_add(1, Ordering::AcqRel);
        if ev.last {
            debug!(
                "multi-recv buffer {} has been consumed ({} operations completed)",
                self.id,
                self.op_count.load(Ordering::Acquire)
            );
            self.last.store(true, Ordering::Release);
            if context.multi_recv_dec() == 0 {
                warn!(
                    "all multi-recv buffers have been consumed, consider increasing \
                     request_post_init to increase buffer sizes"
                );
            }
        }

        // Prevent the buffer from reposting until this handle is done.
        self.ref_count.fetch_add(1, Ordering::AcqRel);

        let addr = Address::from_slot_na(Arc::clone(context.class()), 0, ev.source);
        // Safety: offset/len come from the transport and lie within the
        // posted buffer.
        let slice_ptr = unsafe { self.buf.ptr.add(ev.offset) as *const u8 };
        handle.attach_multi_recv(Arc::clone(self), addr, ev.tag, slice_ptr, ev.len);

        debug!(
            "processing input for handle {:p}, tag={}, buf_size={}",
            Arc::as_ptr(&handle),
            ev.tag,
            ev.len
        );
        match handle.process_input() {
            Ok(()) => handle.complete_op(),
            Err(e) => handle.fail_input(&e),
        }
    }

    /// Drops one handle reference; the observing thread that sees the count
    /// hit zero on a consumed buffer reposts it.
    pub fn release(self: &Arc<Self>, context: &Arc<Context>) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1 == 0
            && self.last.load(Ordering::Acquire)
        {
            debug!("reposting multi-recv buffer {}", self.id);
            match self.post(context) {
                Ok(()) => {
                    context.multi_recv_inc();
                }
                Err(e) => error!("cannot repost multi-recv operation {}: {e}", self.id),
            }
        }
    }
}
