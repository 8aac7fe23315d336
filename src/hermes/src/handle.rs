//! Per-call RPC handle: pooling/reuse, request/response framing and the
//! forward/respond/no-respond state machine with distinct network and
//! loopback paths.
//!
//! Completion accounting: every sub-operation (send, receive, ack,
//! supplemental-data acquisition) bumps the completed count; the handle is
//! queued for trigger exactly once, when it reaches the expected count. The
//! expected count grows incrementally as conditional sub-operations are
//! scheduled.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, error, warn};

use hermes_na::{Completion, NaError, NaResult, OpToken, Tag};

use crate::addr::Address;
use crate::class::IoDir;
use crate::context::Context;
use crate::error::{Error, Result, RetCode};
use crate::header::{MsgFlags, RequestHeader, ResponseHeader};
use crate::multirecv::MultiRecvOp;
use crate::queue::CompletionEntry;
use crate::registry::RpcId;

bitflags! {
    /// Handle creation flags.
    pub(crate) struct HandleFlags: u32 {
        /// Listener handle (receives requests, sends responses).
        const LISTEN = 1 << 1;
        /// Input buffer is a slice of a shared multi-recv buffer.
        const MULTI_RECV = 1 << 2;
    }
}

/// Atomic status bits.
pub(crate) mod status {
    pub const COMPLETED: u32 = 1 << 0;
    pub const CANCELED: u32 = 1 << 1;
    pub const POSTED: u32 = 1 << 2;
    pub const ERRORED: u32 = 1 << 3;
    pub const QUEUED: u32 = 1 << 4;
    pub const MULTI_RECV: u32 = 1 << 5;
}

/// Operation type pending trigger, stored as an atomic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpType {
    Process = 0,
    Forward = 1,
    Respond = 2,
    NoRespond = 3,
    ForwardSelf = 4,
    RespondSelf = 5,
}

impl OpType {
    fn from_u8(v: u8) -> OpType {
        match v {
            1 => OpType::Forward,
            2 => OpType::Respond,
            3 => OpType::NoRespond,
            4 => OpType::ForwardSelf,
            5 => OpType::RespondSelf,
            _ => OpType::Process,
        }
    }
}

/// Callback invoked once per forward with the final call result.
pub type ForwardCallback = Box<dyn FnOnce(&Arc<Handle>, Result<()>) + Send>;
/// Callback invoked once per respond.
pub type RespondCallback = Box<dyn FnOnce(&Arc<Handle>, Result<()>) + Send>;

// Raw view into a shared multi-recv buffer; valid until the handle releases
// its reference on the owning buffer.
struct RawSlice {
    ptr: *const u8,
    len: usize,
}
unsafe impl Send for RawSlice {}

enum InBuf {
    /// No input buffer attached (multi-recv handle between messages).
    Unset,
    Owned(Box<[u8]>),
    Slice(RawSlice),
}

impl InBuf {
    fn capacity(&self) -> usize {
        match self {
            InBuf::Unset => 0,
            InBuf::Owned(b) => b.len(),
            InBuf::Slice(s) => s.len,
        }
    }

    /// # Safety
    ///
    /// For `Slice`, the backing multi-recv buffer must still be alive.
    unsafe fn as_slice(&self, len: usize) -> &[u8] {
        match self {
            InBuf::Unset => &[],
            InBuf::Owned(b) => &b[..len],
            InBuf::Slice(s) => std::slice::from_raw_parts(s.ptr, len.min(s.len)),
        }
    }
}

pub(crate) struct CallState {
    pub addr: Option<Arc<Address>>,
    pub id: RpcId,
    in_buf: InBuf,
    out_buf: Box<[u8]>,
    ack_buf: Option<Box<[u8]>>,
    pub in_used: usize,
    pub out_used: usize,
    pub tag: Tag,
    pub cookie: u8,
    /// Remote context the next send is routed to.
    pub target_context_id: u8,
    pub no_response: bool,
    pub is_self: bool,
    request_cb: Option<ForwardCallback>,
    response_cb: Option<RespondCallback>,
    send_op: Option<OpToken>,
    recv_op: Option<OpToken>,
    ack_op: Option<OpToken>,
    pub multi_recv_op: Option<Arc<MultiRecvOp>>,
}

pub struct Handle {
    context: Arc<Context>,
    slot: usize,
    status: AtomicU32,
    /// First non-success result, as a wire return code. Later errors on other
    /// sub-operations do not overwrite it.
    ret_status: AtomicI32,
    ref_count: AtomicI32,
    op_expected: AtomicU32,
    op_completed: AtomicU32,
    op_type: AtomicU8,
    reuse: AtomicBool,
    pub(crate) state: spin::Mutex<CallState>,
}

impl Handle {
    /// Allocates a handle with its message buffers.
    pub(crate) fn alloc(
        context: &Arc<Context>,
        slot: usize,
        flags: HandleFlags,
    ) -> Result<Arc<Handle>> {
        let transport = &context.class().slots()[slot].transport;
        let in_buf = if flags.contains(HandleFlags::MULTI_RECV) {
            InBuf::Unset
        } else {
            InBuf::Owned(vec![0u8; transport.max_unexpected_size()].into_boxed_slice())
        };
        let out_buf = vec![0u8; transport.max_expected_size()].into_boxed_slice();

        let handle = Arc::new(Handle {
            context: Arc::clone(context),
            slot,
            status: AtomicU32::new(status::COMPLETED),
            ret_status: AtomicI32::new(0),
            ref_count: AtomicI32::new(1),
            op_expected: AtomicU32::new(1),
            op_completed: AtomicU32::new(0),
            op_type: AtomicU8::new(OpType::Process as u8),
            reuse: AtomicBool::new(false),
            state: spin::Mutex::new(CallState {
                addr: None,
                id: 0,
                in_buf,
                out_buf,
                ack_buf: None,
                in_used: 0,
                out_used: 0,
                tag: 0,
                cookie: 0,
                target_context_id: 0,
                no_response: false,
                is_self: false,
                request_cb: None,
                response_cb: None,
                send_op: None,
                recv_op: None,
                ack_op: None,
                multi_recv_op: None,
            }),
        });
        context.handle_created();
        debug!("created new handle {:p}", Arc::as_ptr(&handle));
        Ok(handle)
    }

    /// Creates a handle bound to `addr` and RPC `id`.
    pub fn create(context: &Arc<Context>, addr: Arc<Address>, id: RpcId) -> Result<Arc<Handle>> {
        let slot = addr.best_slot()?;
        let handle = Handle::alloc(context, slot, HandleFlags::empty())?;
        if let Err(e) = handle.set_target(Some(addr), Some(id)) {
            let _ = handle.destroy();
            return Err(e);
        }
        Ok(handle)
    }

    #[inline]
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    #[inline]
    pub(crate) fn set_reuse(&self, reuse: bool) {
        self.reuse.store(reuse, Ordering::Release);
    }

    /// Marks a pooled handle as awaiting a message rather than completed.
    pub(crate) fn clear_status(&self) {
        self.status.store(0, Ordering::Release);
        self.ret_status.store(0, Ordering::Release);
    }

    /// RPC id the handle is currently bound to.
    pub fn rpc_id(&self) -> RpcId {
        self.state.lock().id
    }

    /// Peer address (target for an originating handle, source for a
    /// listening one).
    pub fn addr(&self) -> Option<Arc<Address>> {
        self.state.lock().addr.clone()
    }

    /// Context id of the request originator (the response route).
    pub fn origin_context_id(&self) -> u8 {
        self.state.lock().cookie
    }

    /// Routes sends to the given context id on the target.
    pub fn set_target_id(&self, id: u8) {
        self.state.lock().target_context_id = id;
    }

    #[inline]
    fn checksum(&self) -> bool {
        self.context.class().opts().checksum
    }

    /// Bytes reserved for the request header at the front of the input
    /// buffer.
    pub fn request_header_size(&self) -> usize {
        RequestHeader::size(self.checksum())
    }

    pub fn response_header_size(&self) -> usize {
        ResponseHeader::size(self.checksum())
    }

    pub fn request_payload_capacity(&self) -> usize {
        let st = self.state.lock();
        st.in_buf.capacity().saturating_sub(self.request_header_size())
    }

    pub fn response_payload_capacity(&self) -> usize {
        let st = self.state.lock();
        st.out_buf.len().saturating_sub(self.response_header_size())
    }

    /// Read access to the request payload (received or about to be sent).
    pub fn with_request_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let hdr = self.request_header_size();
        let st = self.state.lock();
        let used = st.in_used.max(hdr);
        // Safety: a multi-recv slice stays valid while the handle holds its
        // reference on the owning buffer.
        let buf = unsafe { st.in_buf.as_slice(used) };
        f(&buf[hdr.min(buf.len())..])
    }

    /// Write access to the request payload staging area, before forward.
    pub fn with_request_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let hdr = self.request_header_size();
        let mut st = self.state.lock();
        match &mut st.in_buf {
            InBuf::Owned(b) => Ok(f(&mut b[hdr..])),
            _ => Err(Error::InvalidArg("handle does not own its input buffer")),
        }
    }

    /// Read access to the response payload after the call completed.
    pub fn with_response_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let hdr = self.response_header_size();
        let st = self.state.lock();
        let used = st.out_used.max(hdr);
        f(&st.out_buf[hdr..used])
    }

    /// Write access to the response payload staging area, before respond.
    pub fn with_response_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let hdr = self.response_header_size();
        let mut st = self.state.lock();
        f(&mut st.out_buf[hdr..])
    }

    /// Binds target address and RPC id. Either may be `None` to keep the
    /// current value (pooled handles are created unbound).
    pub(crate) fn set_target(&self, addr: Option<Arc<Address>>, id: Option<RpcId>) -> Result<()> {
        let class = self.context.class();
        let mut st = self.state.lock();
        if let Some(addr) = addr {
            st.is_self = class.opts().loopback && addr.is_self();
            st.addr = Some(addr);
        }
        if let Some(id) = id {
            if id != st.id {
                if class.rpc_lookup(id).is_none() {
                    return Err(Error::NoEntry(format!("RPC id {id} is not registered")));
                }
                st.id = id;
            }
        }
        Ok(())
    }

    /// Resets a completed, non-queued handle for reuse, optionally rebinding
    /// address and RPC id. No residue of the previous call survives.
    pub fn reset(self: &Arc<Self>, addr: Option<Arc<Address>>, id: Option<RpcId>) -> Result<()> {
        let st = self.status.load(Ordering::Acquire);
        if st & status::COMPLETED == 0 || st & status::QUEUED != 0 {
            return Err(Error::Busy("cannot reset handle that is in use"));
        }
        self.reset_call_state();
        self.set_target(addr, id)
    }

    /// Clears per-call fields back to their defaults.
    fn reset_call_state(self: &Arc<Self>) {
        // The upper layer may have attached extra payload state.
        let release = self
            .context
            .class()
            .more_data
            .read()
            .as_ref()
            .map(|c| Arc::clone(&c.release));
        if let Some(release) = release {
            (*release)(self);
        }

        let mut st = self.state.lock();
        st.request_cb = None;
        st.response_cb = None;
        st.tag = 0;
        st.cookie = 0;
        st.target_context_id = 0;
        st.in_used = 0;
        st.out_used = 0;
        st.no_response = false;
        st.send_op = None;
        st.recv_op = None;
        st.ack_op = None;
        drop(st);

        self.op_type.store(OpType::Process as u8, Ordering::Release);
        self.op_expected.store(1, Ordering::Release);
        self.op_completed.store(0, Ordering::Release);
        self.ret_status.store(0, Ordering::Release);
    }

    #[inline]
    pub fn ref_incr(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference. At zero the handle either returns to its pool
    /// (listening handles) or is freed.
    pub fn destroy(self: &Arc<Self>) -> Result<()> {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
            return Ok(());
        }

        if self.reuse.load(Ordering::Acquire) && !self.context.finalizing() {
            debug!("re-using handle {:p}", Arc::as_ptr(self));
            self.reset_post()
        } else {
            debug!("freeing handle {:p}", Arc::as_ptr(self));
            self.free();
            Ok(())
        }
    }

    fn free(self: &Arc<Self>) {
        let release = self
            .context
            .class()
            .more_data
            .read()
            .as_ref()
            .map(|c| Arc::clone(&c.release));
        if let Some(release) = release {
            (*release)(self);
        }
        self.release_input();
        self.context.handle_dropped();
    }

    /// Posts an unexpected receive for this handle's input buffer.
    pub(crate) fn post(self: &Arc<Self>) -> Result<()> {
        let h = Arc::clone(self);
        let mut st = self.state.lock();
        let (ptr, len) = match &mut st.in_buf {
            InBuf::Owned(b) => (b.as_mut_ptr(), b.len()),
            _ => return Err(Error::InvalidArg("no input buffer to post")),
        };
        // Safety: the buffer lives inside this handle, which the callback
        // keeps alive until completion.
        let token = unsafe {
            self.context
                .endpoint(self.slot)
                .recv_unexpected(ptr, len, Box::new(move |res| h.recv_input_cb(res)))?
        };
        st.recv_op = Some(token);
        debug!("posted handle {:p}", Arc::as_ptr(self));
        Ok(())
    }

    /// Resets and returns a reusable handle to its pool, reposting a receive
    /// (or releasing its multi-recv slice).
    fn reset_post(self: &Arc<Self>) -> Result<()> {
        let use_multi_recv = self.status.load(Ordering::Acquire) & status::MULTI_RECV != 0;

        // Detach the multi-recv slice before the handle becomes grabbable
        // again; the release itself happens after the pool insert.
        let multi_recv_op = {
            let mut st = self.state.lock();
            st.addr = None;
            st.id = 0;
            if use_multi_recv {
                st.in_buf = InBuf::Unset;
                st.in_used = 0;
                st.multi_recv_op.take()
            } else {
                None
            }
        };
        self.reset_call_state();
        self.ref_count.store(1, Ordering::Release);
        self.status.store(0, Ordering::Release);

        let pool = self
            .context
            .pool(self.slot)
            .ok_or(Error::Busy("handle pool is gone"))?;
        pool.push_pending(Arc::clone(self));

        if use_multi_recv {
            if let Some(op) = multi_recv_op {
                op.release(&self.context);
            }
        } else {
            self.post()?;
        }
        Ok(())
    }

    /// Detaches the handle from its multi-recv buffer, reposting the buffer
    /// when this was the last reference on a fully consumed one.
    pub(crate) fn release_input(&self) {
        let op = {
            let mut st = self.state.lock();
            if st.multi_recv_op.is_none() {
                return;
            }
            st.in_buf = InBuf::Unset;
            st.in_used = 0;
            st.multi_recv_op.take()
        };
        if let Some(op) = op {
            op.release(&self.context);
        }
    }

    /// Attaches a slice of a multi-recv buffer as this handle's input.
    pub(crate) fn attach_multi_recv(
        &self,
        op: Arc<MultiRecvOp>,
        addr: Arc<Address>,
        tag: Tag,
        ptr: *const u8,
        len: usize,
    ) {
        self.status.fetch_or(status::MULTI_RECV, Ordering::AcqRel);
        let mut st = self.state.lock();
        st.addr = Some(addr);
        st.tag = tag;
        st.in_buf = InBuf::Slice(RawSlice { ptr, len });
        st.in_used = len;
        st.multi_recv_op = Some(op);
    }

    // ---------------------------------------------------------------------
    // Forward / respond / no-respond triad
    // ---------------------------------------------------------------------

    /// Sends the request. The callback fires exactly once, from trigger,
    /// with the final result of the call (including the response arrival
    /// unless `NO_RESPONSE` is set).
    pub fn forward(
        self: &Arc<Self>,
        flags: MsgFlags,
        payload_len: usize,
        cb: ForwardCallback,
    ) -> Result<()> {
        let st = self.status.load(Ordering::Acquire);
        if st & status::COMPLETED == 0 || st & status::QUEUED != 0 {
            return Err(Error::Busy("attempting to use handle that was not completed"));
        }

        // Allow destroy to be called pre-emptively while the op is in flight.
        self.ref_incr();

        self.op_expected.store(1, Ordering::Release);
        self.op_completed.store(0, Ordering::Release);
        self.ret_status.store(0, Ordering::Release);
        self.status.store(0, Ordering::Release);

        match self.forward_inner(flags, payload_len, cb) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Handle is no longer in use.
                self.status.fetch_or(status::COMPLETED, Ordering::AcqRel);
                self.ref_count.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn forward_inner(
        self: &Arc<Self>,
        flags: MsgFlags,
        payload_len: usize,
        cb: ForwardCallback,
    ) -> Result<()> {
        let checksum = self.checksum();
        let header_size = RequestHeader::size(checksum);
        let is_self;
        {
            let mut st = self.state.lock();
            if st.addr.is_none() || st.id == 0 {
                return Err(Error::InvalidArg("handle has no target address or RPC id"));
            }
            st.in_used = header_size + payload_len;
            if st.in_used > st.in_buf.capacity() {
                return Err(Error::MsgSize("exceeding input buffer size"));
            }

            st.no_response = flags.contains(MsgFlags::NO_RESPONSE);
            let mut wire_flags = flags & (MsgFlags::NO_RESPONSE | MsgFlags::MORE_DATA);
            if st.is_self {
                wire_flags |= MsgFlags::SELF_FORWARD;
            }

            // Request and response callbacks stay separate so they do not
            // overwrite each other when forwarding to ourself.
            st.request_cb = Some(cb);

            // The cookie routes the response back to the origin context.
            let header = RequestHeader {
                id: st.id,
                flags: wire_flags,
                cookie: self.context.id(),
            };
            let buf = match &mut st.in_buf {
                InBuf::Owned(b) => b,
                _ => return Err(Error::InvalidArg("handle does not own its input buffer")),
            };
            header.encode(buf, checksum)?;
            is_self = st.is_self;
        }

        self.context
            .class()
            .counters
            .req_sent
            .fetch_add(1, Ordering::Relaxed);

        if is_self {
            self.forward_self()
        } else {
            self.forward_na()
        }
    }

    fn forward_self(self: &Arc<Self>) -> Result<()> {
        self.op_type
            .store(OpType::ForwardSelf as u8, Ordering::Release);
        self.process_self()
    }

    fn forward_na(self: &Arc<Self>) -> Result<()> {
        self.op_type.store(OpType::Forward as u8, Ordering::Release);

        let ep = self.context.endpoint(self.slot);
        let mut st = self.state.lock();
        st.tag = self.context.class().gen_tag();
        let addr = Arc::clone(st.addr.as_ref().expect("checked in forward_inner"));
        let na_addr = Arc::clone(
            addr.slot_addr(self.slot)
                .ok_or(Error::InvalidArg("address missing for transport slot"))?,
        );

        // Pre-post the response receive before sending the request, so a
        // fast responder cannot race the receive posting.
        if !st.no_response {
            let h = Arc::clone(self);
            // Safety: out_buf lives inside the handle, kept alive by the
            // callback until the receive resolves.
            let token = unsafe {
                ep.recv_expected(
                    st.out_buf.as_mut_ptr(),
                    st.out_buf.len(),
                    &na_addr,
                    self.context.id(),
                    st.tag,
                    Box::new(move |res| h.recv_output_cb(res)),
                )?
            };
            st.recv_op = Some(token);
            self.op_expected.fetch_add(1, Ordering::AcqRel);
        }

        self.status.fetch_or(status::POSTED, Ordering::AcqRel);

        let h = Arc::clone(self);
        let (in_ptr, in_used) = match &st.in_buf {
            InBuf::Owned(b) => (b.as_ptr(), st.in_used),
            _ => unreachable!("forward_inner validated the input buffer"),
        };
        // Safety: same lifetime argument as above.
        let sent = unsafe {
            ep.send_unexpected(
                in_ptr,
                in_used,
                &na_addr,
                st.target_context_id,
                st.tag,
                Box::new(move |res| h.send_input_cb(res)),
            )
        };
        match sent {
            Ok(token) => {
                st.send_op = Some(token);
                Ok(())
            }
            Err(e) => {
                self.status.fetch_and(!status::POSTED, Ordering::AcqRel);
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);

                if st.no_response {
                    // No receive was posted.
                    return Err(e.into());
                }
                self.op_expected.fetch_sub(1, Ordering::AcqRel);

                // Keep the send error for the return status, cancel the
                // pre-posted receive and let the callback report canceled.
                let err: Error = e.into();
                self.latch_ret(RetCode::from(&err));
                self.status.fetch_or(status::CANCELED, Ordering::AcqRel);
                if let Some(recv_op) = st.recv_op {
                    if let Err(e) = ep.cancel(recv_op) {
                        error!("could not cancel receive operation: {e}");
                    }
                }
                Ok(())
            }
        }
    }

    /// Sends the response. Fails with `OpNotSupported` if the request was
    /// forwarded with `NO_RESPONSE`.
    pub fn respond(
        self: &Arc<Self>,
        flags: MsgFlags,
        payload_len: usize,
        ret_code: RetCode,
        cb: RespondCallback,
    ) -> Result<()> {
        if self.state.lock().no_response {
            return Err(Error::OpNotSupported(
                "sending response was disabled on that RPC",
            ));
        }

        self.status.fetch_and(!status::COMPLETED, Ordering::AcqRel);
        self.ret_status.store(0, Ordering::Release);

        match self.respond_inner(flags, payload_len, ret_code, cb) {
            Ok(()) => {
                self.context
                    .class()
                    .counters
                    .resp_sent
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // Handle is no longer in use; the caller keeps its reference.
                self.status.fetch_or(status::COMPLETED, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn respond_inner(
        self: &Arc<Self>,
        flags: MsgFlags,
        payload_len: usize,
        ret_code: RetCode,
        cb: RespondCallback,
    ) -> Result<()> {
        let checksum = self.checksum();
        let header_size = ResponseHeader::size(checksum);
        let is_self;
        let more_data;
        {
            let mut st = self.state.lock();
            st.out_used = header_size + payload_len;
            if st.out_used > st.out_buf.len() {
                return Err(Error::MsgSize("exceeding output buffer size"));
            }
            st.response_cb = Some(cb);

            let wire_flags = flags & MsgFlags::MORE_DATA;
            let header = ResponseHeader {
                ret_code,
                flags: wire_flags,
                cookie: st.cookie as u16,
            };
            header.encode(&mut st.out_buf, checksum)?;
            is_self = st.is_self;
            more_data = wire_flags.contains(MsgFlags::MORE_DATA);
        }

        if is_self {
            self.respond_self()
        } else {
            self.respond_na(more_data)
        }
    }

    fn respond_self(self: &Arc<Self>) -> Result<()> {
        self.op_type
            .store(OpType::RespondSelf as u8, Ordering::Release);
        self.op_expected.fetch_add(1, Ordering::AcqRel);
        self.complete_op();
        Ok(())
    }

    fn respond_na(self: &Arc<Self>, more_data: bool) -> Result<()> {
        self.op_expected.fetch_add(1, Ordering::AcqRel);
        self.op_type.store(OpType::Respond as u8, Ordering::Release);

        let ep = self.context.endpoint(self.slot);
        let mut st = self.state.lock();
        let addr = Arc::clone(st.addr.as_ref().ok_or(Error::InvalidArg("no peer address"))?);
        let na_addr = Arc::clone(
            addr.slot_addr(self.slot)
                .ok_or(Error::InvalidArg("address missing for transport slot"))?,
        );

        let mut ack_recv_posted = false;
        let result = (|| -> Result<()> {
            // Extra output data requires an ack confirming the requester has
            // pulled it, before resources can be released.
            if more_data {
                warn!(
                    "allocating ack buffer to send extra output data for handle {:p}",
                    self as *const _
                );
                if st.ack_buf.is_none() {
                    st.ack_buf = Some(vec![0u8; 1].into_boxed_slice());
                }
                self.op_expected.fetch_add(1, Ordering::AcqRel);

                let h = Arc::clone(self);
                let ack_buf = st.ack_buf.as_mut().expect("just set");
                // Safety: ack_buf lives inside the handle until completion.
                let token = unsafe {
                    ep.recv_expected(
                        ack_buf.as_mut_ptr(),
                        ack_buf.len(),
                        &na_addr,
                        st.cookie,
                        st.tag,
                        Box::new(move |res| h.ack_cb(res)),
                    )?
                };
                st.ack_op = Some(token);
                ack_recv_posted = true;
            }

            self.status.fetch_or(status::POSTED, Ordering::AcqRel);

            let h = Arc::clone(self);
            // Safety: out_buf lives inside the handle until completion.
            let token = unsafe {
                ep.send_expected(
                    st.out_buf.as_ptr(),
                    st.out_used,
                    &na_addr,
                    st.cookie,
                    st.tag,
                    Box::new(move |res| h.send_output_cb(res)),
                )?
            };
            st.send_op = Some(token);
            Ok(())
        })();

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.status.fetch_and(!status::POSTED, Ordering::AcqRel);
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);

                if ack_recv_posted {
                    self.op_expected.fetch_sub(1, Ordering::AcqRel);
                    self.latch_ret(RetCode::from(&e));
                    self.status.fetch_or(status::CANCELED, Ordering::AcqRel);
                    if let Some(ack_op) = st.ack_op {
                        if let Err(e) = ep.cancel(ack_op) {
                            error!("could not cancel ack operation: {e}");
                        }
                    }
                    // The callback will report canceled.
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Completes the call without transmitting anything (target side of a
    /// `NO_RESPONSE` request).
    pub(crate) fn no_respond(self: &Arc<Self>) -> Result<()> {
        let is_self = self.state.lock().is_self;
        if is_self {
            // The same handle carries both roles over loopback; the forward
            // callback still fires.
            self.op_type
                .store(OpType::ForwardSelf as u8, Ordering::Release);
        } else {
            self.op_type
                .store(OpType::NoRespond as u8, Ordering::Release);
        }
        self.op_expected.fetch_add(1, Ordering::AcqRel);
        self.complete_op();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Transport completion callbacks
    // ---------------------------------------------------------------------

    fn latch_ret(&self, code: RetCode) {
        let _ = self.ret_status.compare_exchange(
            0,
            code.0 as i32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn send_input_cb(self: Arc<Self>, res: NaResult<Completion>) {
        match res {
            Ok(_) => {}
            Err(NaError::Canceled) => {
                debug!("canceled event on handle {:p}", Arc::as_ptr(&self));
                self.latch_ret(RetCode::CANCELED);
            }
            Err(e) => {
                let prev = self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
                let err: Error = e.into();
                error!("transport callback returned error: {err}");
                self.latch_ret(RetCode::from(&err));

                let no_response = self.state.lock().no_response;
                if prev & status::CANCELED == 0 && !no_response {
                    self.status.fetch_or(status::CANCELED, Ordering::AcqRel);
                    // Cancel the pre-posted receive for the response.
                    let recv_op = self.state.lock().recv_op;
                    if let Some(op) = recv_op {
                        if let Err(e) = self.context.endpoint(self.slot).cancel(op) {
                            error!("could not cancel receive operation: {e}");
                        }
                    }
                }
            }
        }
        self.complete_op();
    }

    pub(crate) fn recv_input_cb(self: Arc<Self>, res: NaResult<Completion>) {
        let pool = self.context.pool(self.slot);
        if let Some(pool) = &pool {
            pool.remove_pending(&self);
        }

        match res {
            Ok(Completion::RecvUnexpected { source, tag, len }) => {
                // Extend the pool if all pre-posted handles are being used.
                if let Some(pool) = &pool {
                    if pool.can_grow() && !self.context.finalizing() && pool.empty() {
                        warn!(
                            "pre-posted handles have all been consumed, posting {} more",
                            pool.incr_count()
                        );
                        if let Err(e) = pool.extend(&self.context) {
                            error!("could not extend handle pool: {e}");
                            self.fail_input(&e);
                            return;
                        }
                    }
                }

                let result = (|| -> Result<()> {
                    {
                        let mut st = self.state.lock();
                        if len > st.in_buf.capacity() {
                            return Err(Error::MsgSize(
                                "actual transfer size is too large for unexpected recv",
                            ));
                        }
                        st.addr = Some(Address::from_slot_na(
                            Arc::clone(self.context.class()),
                            self.slot,
                            source,
                        ));
                        st.tag = tag;
                        st.in_used = len;
                    }
                    debug!(
                        "processing input for handle {:p}, tag={}",
                        Arc::as_ptr(&self),
                        self.state.lock().tag
                    );
                    self.process_input()
                })();

                match result {
                    Ok(()) => self.complete_op(),
                    Err(e) => self.fail_input(&e),
                }
            }
            Err(NaError::Canceled) => {
                debug!("canceled event on handle {:p}", Arc::as_ptr(&self));
                // Prevent re-initialization, then clean up.
                self.set_reuse(false);
                let _ = self.destroy();
            }
            Ok(_) | Err(_) => {
                if let Err(e) = &res {
                    error!("transport callback returned error: {e}");
                }
                self.set_reuse(false);
                let _ = self.destroy();
            }
        }
    }

    /// Marks the handle errored and pushes it through the completion path.
    pub(crate) fn fail_input(self: &Arc<Self>, e: &Error) {
        self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
        self.latch_ret(RetCode::from(e));
        self.complete_op();
    }

    fn send_output_cb(self: Arc<Self>, res: NaResult<Completion>) {
        match res {
            Ok(_) => {}
            Err(NaError::Canceled) => {
                debug!("canceled event on handle {:p}", Arc::as_ptr(&self));
                self.latch_ret(RetCode::CANCELED);
            }
            Err(e) => {
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
                let err: Error = e.into();
                error!("transport callback returned error: {err}");
                self.latch_ret(RetCode::from(&err));
            }
        }
        self.complete_op();
    }

    fn recv_output_cb(self: Arc<Self>, res: NaResult<Completion>) {
        match res {
            Ok(completion) => {
                if let Completion::RecvExpected { len } = completion {
                    self.state.lock().out_used = len;
                }
                debug!("processing output for handle {:p}", Arc::as_ptr(&self));
                if let Err(e) = self.process_output(Handle::send_ack) {
                    self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
                    self.latch_ret(RetCode::from(&e));
                }
            }
            Err(NaError::Canceled) => {
                debug!("canceled event on handle {:p}", Arc::as_ptr(&self));
                self.latch_ret(RetCode::CANCELED);
            }
            Err(e) => {
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
                let err: Error = e.into();
                error!("transport callback returned error: {err}");
                self.latch_ret(RetCode::from(&err));
            }
        }
        self.complete_op();
    }

    fn ack_cb(self: Arc<Self>, res: NaResult<Completion>) {
        match res {
            Ok(_) => {}
            Err(NaError::Canceled) => {
                debug!("canceled event on handle {:p}", Arc::as_ptr(&self));
                self.latch_ret(RetCode::CANCELED);
            }
            Err(e) => {
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
                let err: Error = e.into();
                error!("transport callback returned error: {err}");
                self.latch_ret(RetCode::from(&err));
            }
        }
        self.complete_op();
    }

    // ---------------------------------------------------------------------
    // Input / output processing
    // ---------------------------------------------------------------------

    /// Decodes and validates the request header, scheduling the
    /// supplemental-data acquisition when the request carries `MORE_DATA`.
    pub(crate) fn process_input(self: &Arc<Self>) -> Result<()> {
        let class = self.context.class();
        class.counters.req_recv.fetch_add(1, Ordering::Relaxed);

        let checksum = self.checksum();
        let more_data = {
            let mut st = self.state.lock();
            // Safety: multi-recv slices stay valid while referenced.
            let header = {
                let buf = unsafe { st.in_buf.as_slice(st.in_used) };
                RequestHeader::decode(buf, checksum)?
            };
            st.id = header.id;
            st.cookie = header.cookie;
            // Route the response to the origin context.
            st.target_context_id = header.cookie;
            st.no_response = header.flags.contains(MsgFlags::NO_RESPONSE);
            debug!(
                "processed input for handle {:p}, id={}, cookie={}, no_response={}",
                Arc::as_ptr(self),
                header.id,
                header.cookie,
                st.no_response
            );
            header.flags.contains(MsgFlags::MORE_DATA)
        };

        if more_data {
            let acquire = class
                .more_data
                .read()
                .as_ref()
                .map(|c| Arc::clone(&c.acquire))
                .ok_or(Error::OpNotSupported(
                    "no callback defined for acquiring more data",
                ))?;

            warn!(
                "must recv extra input data payload for handle {:p}",
                Arc::as_ptr(self)
            );
            self.op_expected.fetch_add(1, Ordering::AcqRel);
            class.counters.req_extra.fetch_add(1, Ordering::Relaxed);

            (*acquire)(
                self,
                IoDir::Input,
                Box::new(|h, res| h.more_data_complete(res)),
            )?;
        }
        Ok(())
    }

    /// Decodes the response header, scheduling the supplemental-data
    /// acquisition when the response carries `MORE_DATA`; `done` runs once
    /// that data has been pulled.
    fn process_output(self: &Arc<Self>, done: fn(&Arc<Handle>, Result<()>)) -> Result<()> {
        let class = self.context.class();
        class.counters.resp_recv.fetch_add(1, Ordering::Relaxed);

        let checksum = self.checksum();
        let more_data = {
            let st = self.state.lock();
            let header = ResponseHeader::decode(&st.out_buf, checksum)?;
            // The response return code becomes the call result.
            self.ret_status
                .store(header.ret_code.0 as i32, Ordering::Release);
            debug!(
                "processed output for handle {:p}, ret={}",
                Arc::as_ptr(self),
                header.ret_code.0
            );
            header.flags.contains(MsgFlags::MORE_DATA)
        };

        if more_data {
            let acquire = class
                .more_data
                .read()
                .as_ref()
                .map(|c| Arc::clone(&c.acquire))
                .ok_or(Error::OpNotSupported(
                    "no callback defined for acquiring more data",
                ))?;

            warn!(
                "must recv extra output data payload for handle {:p}",
                Arc::as_ptr(self)
            );
            self.op_expected.fetch_add(1, Ordering::AcqRel);
            class.counters.resp_extra.fetch_add(1, Ordering::Relaxed);

            (*acquire)(self, IoDir::Output, Box::new(move |h, res| done(h, res)))?;
        }
        Ok(())
    }

    fn more_data_complete(self: &Arc<Self>, res: Result<()>) {
        if let Err(e) = res {
            if !matches!(e, Error::Canceled) {
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
            }
            self.latch_ret(RetCode::from(&e));
        }
        self.complete_op();
    }

    /// Confirms to the responder that supplemental output data has been
    /// pulled, releasing its resources.
    fn send_ack(self: &Arc<Self>, res: Result<()>) {
        if let Err(e) = res {
            error!("aborting ack send: {e}");
            if !matches!(e, Error::Canceled) {
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
            }
            self.latch_ret(RetCode::from(&e));
            self.complete_op();
            return;
        }

        let result = (|| -> Result<()> {
            let ep = self.context.endpoint(self.slot);
            let mut st = self.state.lock();
            let addr = Arc::clone(st.addr.as_ref().ok_or(Error::InvalidArg("no peer address"))?);
            let na_addr = Arc::clone(
                addr.slot_addr(self.slot)
                    .ok_or(Error::InvalidArg("address missing for transport slot"))?,
            );
            if st.ack_buf.is_none() {
                st.ack_buf = Some(vec![0u8; 1].into_boxed_slice());
            }
            let h = Arc::clone(self);
            let target_id = st.target_context_id;
            let tag = st.tag;
            let ack_buf = st.ack_buf.as_ref().expect("just set");
            // Safety: ack_buf lives inside the handle until completion.
            let token = unsafe {
                ep.send_expected(
                    ack_buf.as_ptr(),
                    ack_buf.len(),
                    &na_addr,
                    target_id,
                    tag,
                    Box::new(move |res| h.ack_cb(res)),
                )?
            };
            st.ack_op = Some(token);
            Ok(())
        })();

        if let Err(e) = result {
            if !matches!(e, Error::Canceled) {
                self.status.fetch_or(status::ERRORED, Ordering::AcqRel);
            }
            self.latch_ret(RetCode::from(&e));
            self.complete_op();
        }
    }

    // ---------------------------------------------------------------------
    // Self (loopback) path
    // ---------------------------------------------------------------------

    /// Processes a self-addressed request synchronously and queues its
    /// completion.
    fn process_self(self: &Arc<Self>) -> Result<()> {
        self.op_type.store(OpType::Process as u8, Ordering::Release);
        if let Err(e) = self.process_input() {
            self.latch_ret(RetCode::from(&e));
        }
        self.complete_op();
        Ok(())
    }

    /// Runs after the responder-side respond callback over loopback: hands
    /// the handle back to the requester role and processes the response.
    fn self_cb(self: &Arc<Self>) {
        self.op_expected.fetch_add(1, Ordering::AcqRel);

        let cb = self.state.lock().response_cb.take();
        if let Some(cb) = cb {
            cb(self, Ok(()));
        }

        // Hand the forward callback back to the completion path.
        self.op_type
            .store(OpType::ForwardSelf as u8, Ordering::Release);
        self.ref_incr();

        if let Err(e) = self.process_output(Handle::more_data_complete) {
            self.latch_ret(RetCode::from(&e));
        }
        self.complete_op();
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    /// One sub-operation resolved; queues the handle once all expected
    /// sub-operations have.
    pub(crate) fn complete_op(self: &Arc<Self>) {
        let completed = self.op_completed.fetch_add(1, Ordering::AcqRel) + 1;
        let expected = self.op_expected.load(Ordering::Acquire);
        debug!(
            "completed {completed}/{expected} operations for handle {:p}",
            Arc::as_ptr(self)
        );
        if completed == expected {
            self.complete();
        }
    }

    /// Marks the handle completed and queued, and pushes it to the
    /// completion queue.
    fn complete(self: &Arc<Self>) {
        self.status
            .fetch_or(status::COMPLETED | status::QUEUED, Ordering::AcqRel);
        let is_self = self.state.lock().is_self;
        self.context
            .completion_add(CompletionEntry::Rpc(Arc::clone(self)), is_self);
    }

    /// The first latched non-success result, as the call outcome.
    fn latched_result(&self) -> Result<()> {
        match RetCode(self.ret_status.load(Ordering::Acquire) as i8).to_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs the registered RPC callback for the decoded id.
    fn process(self: &Arc<Self>) -> Result<()> {
        let info = {
            let st = self.state.lock();
            match self.context.class().rpc_lookup(st.id) {
                Some(info) => info,
                None => {
                    warn!("could not find RPC id {} in map", st.id);
                    return Err(Error::NoEntry(format!("RPC id {}", st.id)));
                }
            }
        };

        // The handler receives its own reference, released by its destroy
        // call once it is done with the handle. A handler that returns an
        // error must not destroy; the reference is reclaimed here.
        self.ref_incr();
        let r = (*info.handler)(self);
        if r.is_err() {
            self.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
        r
    }

    /// Dispatches one queued completion: runs the RPC callback for inbound
    /// requests, or the user forward/respond callback, then releases or
    /// reuses the handle.
    pub(crate) fn trigger_entry(self: &Arc<Self>) -> Result<()> {
        self.status.fetch_and(!status::QUEUED, Ordering::AcqRel);

        let op_type = OpType::from_u8(self.op_type.load(Ordering::Acquire));
        match op_type {
            OpType::Process => {
                // Simply exit if an error occurred on the receive path.
                if self.latched_result().is_ok() {
                    // Keep the handle alive until the response is sent.
                    self.ref_incr();

                    let no_response = self.state.lock().no_response;
                    match self.process() {
                        Ok(()) => {}
                        Err(e) if !no_response => {
                            // Respond with the error code.
                            if let Err(e) =
                                self.respond(MsgFlags::empty(), 0, RetCode::from(&e), Box::new(|_, _| {}))
                            {
                                error!("could not respond: {e}");
                                let _ = self.destroy();
                            }
                        }
                        Err(e) => {
                            debug!("handler failed on no-response request: {e}");
                        }
                    }
                    if no_response {
                        self.no_respond()?;
                    }
                }
            }
            OpType::Forward | OpType::ForwardSelf => {
                let cb = self.state.lock().request_cb.take();
                if let Some(cb) = cb {
                    cb(self, self.latched_result());
                }
            }
            OpType::Respond => {
                let cb = self.state.lock().response_cb.take();
                if let Some(cb) = cb {
                    cb(self, self.latched_result());
                }
            }
            OpType::RespondSelf => self.self_cb(),
            OpType::NoRespond => {}
        }

        // Reuse the handle if we were listening, otherwise let it go.
        self.destroy()
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    /// Requests cancellation of the in-flight operation. Only the thread
    /// that first sets the cancel bit issues the transport cancels; an
    /// already-completed or errored operation is a successful no-op.
    pub fn cancel(&self) -> Result<()> {
        if self.state.lock().is_self {
            return Err(Error::OpNotSupported("local cancellation"));
        }

        let st = self.status.load(Ordering::Acquire);
        if st & (status::COMPLETED | status::ERRORED | status::CANCELED) != 0 {
            return Ok(());
        }

        if self.status.fetch_or(status::CANCELED, Ordering::AcqRel) & status::CANCELED != 0 {
            return Ok(());
        }

        let (send_op, recv_op, ack_op) = {
            let st = self.state.lock();
            (st.send_op, st.recv_op, st.ack_op)
        };
        let ep = self.context.endpoint(self.slot);
        for op in [recv_op, send_op, ack_op].into_iter().flatten() {
            ep.cancel(op)?;
        }
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        debug_assert!(
            self.ref_count.load(Ordering::Acquire) <= 1,
            "handle dropped while lifecycle references remain"
        );
    }
}
