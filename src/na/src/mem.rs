//! In-process transport: named nodes exchanging messages over a shared
//! fabric. Used by tests and single-node deployments; exercises the full
//! posting/completion model without touching a NIC.
//!
//! Completion callbacks only fire from [`Endpoint::trigger`], matching the
//! contract real transports provide.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use fnv::FnvHashMap;
use log::trace;

use crate::{
    Addr, Completion, Endpoint, MemAccess, MemHandle, MemRegion, MultiRecvCallback,
    MultiRecvEvent, NaError, NaResult, OpCallback, OpToken, Segment, Tag, Transport,
    TransportAddr,
};

const MAX_UNEXPECTED_SIZE: usize = 4096;
const MAX_EXPECTED_SIZE: usize = 4096;
const MAX_TAG: Tag = i32::MAX as Tag;
const MAX_SEGMENTS: usize = 16;

/// Shared registry of in-process nodes, addressable by name.
pub struct MemFabric {
    nodes: spin::Mutex<FnvHashMap<String, Arc<Node>>>,
}

impl MemFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: spin::Mutex::new(FnvHashMap::default()),
        })
    }

    /// Creates a new transport attached to this fabric under `name`.
    pub fn transport(self: &Arc<Self>, name: &str) -> NaResult<Arc<MemTransport>> {
        let node = Arc::new(Node {
            name: name.to_string(),
            fabric: Arc::downgrade(self),
            inner: Mutex::new(NodeInner::default()),
            cv: Condvar::new(),
            next_token: AtomicU64::new(1),
        });

        let mut nodes = self.nodes.lock();
        if nodes.contains_key(name) {
            return Err(NaError::Protocol(format!("node {name} already exists")));
        }
        nodes.insert(name.to_string(), Arc::clone(&node));

        Ok(Arc::new(MemTransport { node }))
    }

    fn find(&self, name: &str) -> NaResult<Arc<Node>> {
        self.nodes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| NaError::NoEntry(name.to_string()))
    }
}

// Raw buffer pointers cross the posting/completion boundary; validity until
// completion is the poster's contract (see crate-level safety notes).
struct RawBufMut(*mut u8);
unsafe impl Send for RawBufMut {}

struct PostedRecv {
    token: u64,
    buf: RawBufMut,
    len: usize,
    cb: OpCallback,
}

struct PostedExpected {
    token: u64,
    buf: RawBufMut,
    len: usize,
    tag: Tag,
    cb: OpCallback,
}

struct PostedMulti {
    token: u64,
    buf: RawBufMut,
    len: usize,
    used: usize,
    cb: Arc<spin::Mutex<MultiRecvCallback>>,
}

struct PendingMsg {
    source: Addr,
    tag: Tag,
    data: Vec<u8>,
}

enum Ready {
    Single {
        cb: OpCallback,
        result: NaResult<Completion>,
    },
    Multi {
        cb: Arc<spin::Mutex<MultiRecvCallback>>,
        event: NaResult<MultiRecvEvent>,
    },
}

#[derive(Default)]
struct EndpointQueues {
    opened: bool,
    unexpected: VecDeque<PostedRecv>,
    multi: VecDeque<PostedMulti>,
    expected: Vec<PostedExpected>,
    pending_unexpected: VecDeque<PendingMsg>,
    pending_expected: Vec<PendingMsg>,
    ready: VecDeque<Ready>,
}

#[derive(Default)]
struct NodeInner {
    endpoints: FnvHashMap<u8, EndpointQueues>,
}

struct Node {
    name: String,
    fabric: Weak<MemFabric>,
    inner: Mutex<NodeInner>,
    cv: Condvar,
    next_token: AtomicU64,
}

impl Node {
    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Delivers an unexpected message to `target_id`, with the node lock held.
    fn deliver_unexpected(
        inner: &mut NodeInner,
        target_id: u8,
        source: Addr,
        tag: Tag,
        data: &[u8],
    ) {
        let q = inner.endpoints.entry(target_id).or_default();

        if let Some(m) = q.multi.front_mut() {
            // Slice the message out of the shared multi-recv buffer.
            let offset = m.used;
            debug_assert!(offset + data.len() <= m.len);
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), m.buf.0.add(offset), data.len());
            }
            m.used += data.len();
            let last = m.len - m.used < MAX_UNEXPECTED_SIZE;
            let cb = Arc::clone(&m.cb);
            if last {
                q.multi.pop_front();
            }
            q.ready.push_back(Ready::Multi {
                cb,
                event: Ok(MultiRecvEvent {
                    source,
                    tag,
                    offset,
                    len: data.len(),
                    last,
                }),
            });
        } else if let Some(r) = q.unexpected.pop_front() {
            let result = if data.len() > r.len {
                Err(NaError::Overflow)
            } else {
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), r.buf.0, data.len());
                }
                Ok(Completion::RecvUnexpected {
                    source,
                    tag,
                    len: data.len(),
                })
            };
            q.ready.push_back(Ready::Single { cb: r.cb, result });
        } else {
            trace!("no receive posted on {target_id}, queueing message");
            q.pending_unexpected.push_back(PendingMsg {
                source,
                tag,
                data: data.to_vec(),
            });
        }
    }

    /// Delivers an expected message to `target_id`, with the node lock held.
    fn deliver_expected(inner: &mut NodeInner, target_id: u8, source: Addr, tag: Tag, data: &[u8]) {
        let q = inner.endpoints.entry(target_id).or_default();

        if let Some(pos) = q.expected.iter().position(|r| r.tag == tag) {
            let r = q.expected.swap_remove(pos);
            let result = if data.len() > r.len {
                Err(NaError::Overflow)
            } else {
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), r.buf.0, data.len());
                }
                Ok(Completion::RecvExpected { len: data.len() })
            };
            q.ready.push_back(Ready::Single { cb: r.cb, result });
        } else {
            q.pending_expected.push(PendingMsg {
                source,
                tag,
                data: data.to_vec(),
            });
        }
    }
}

/// The in-process transport class.
pub struct MemTransport {
    node: Arc<Node>,
}

impl MemTransport {
    fn fabric(&self) -> NaResult<Arc<MemFabric>> {
        self.node
            .fabric
            .upgrade()
            .ok_or_else(|| NaError::Fault("fabric is gone".to_string()))
    }
}

impl Transport for MemTransport {
    fn open(&self, id: u8) -> NaResult<Box<dyn Endpoint>> {
        let mut inner = self.node.inner.lock().unwrap();
        let q = inner.endpoints.entry(id).or_default();
        if q.opened {
            return Err(NaError::Protocol(format!("endpoint {id} already open")));
        }
        q.opened = true;
        drop(inner);

        Ok(Box::new(MemEndpoint {
            node: Arc::clone(&self.node),
            id,
        }))
    }

    fn addr_self(&self) -> NaResult<Addr> {
        Ok(Arc::new(MemAddr {
            node: Arc::clone(&self.node),
            local: true,
        }))
    }

    fn addr_lookup(&self, name: &str) -> NaResult<Addr> {
        let node = self.fabric()?.find(name)?;
        let local = Arc::ptr_eq(&node, &self.node);
        Ok(Arc::new(MemAddr { node, local }))
    }

    fn addr_deserialize(&self, buf: &[u8]) -> NaResult<Addr> {
        if buf.len() < 2 {
            return Err(NaError::Overflow);
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + len {
            return Err(NaError::Overflow);
        }
        let name = std::str::from_utf8(&buf[2..2 + len])
            .map_err(|_| NaError::Protocol("malformed address string".to_string()))?;
        self.addr_lookup(name)
    }

    fn max_unexpected_size(&self) -> usize {
        MAX_UNEXPECTED_SIZE
    }

    fn max_expected_size(&self) -> usize {
        MAX_EXPECTED_SIZE
    }

    fn max_tag(&self) -> Tag {
        MAX_TAG
    }

    fn max_segments(&self) -> usize {
        MAX_SEGMENTS
    }

    fn mem_register(&self, segments: &[Segment], access: MemAccess) -> NaResult<MemHandle> {
        if segments.is_empty() || segments.len() > MAX_SEGMENTS {
            return Err(NaError::OpNotSupported);
        }
        let total = segments.iter().map(|s| s.len).sum();
        Ok(Arc::new(MemMr {
            segments: segments.to_vec(),
            access,
            total,
        }))
    }

    fn mem_deserialize(&self, buf: &[u8]) -> NaResult<MemHandle> {
        MemMr::deserialize(buf).map(|mr| Arc::new(mr) as MemHandle)
    }
}

/// Address of a fabric node.
struct MemAddr {
    node: Arc<Node>,
    local: bool,
}

impl fmt::Debug for MemAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem://{}", self.node.name)
    }
}

impl TransportAddr for MemAddr {
    fn is_self(&self) -> bool {
        self.local
    }

    fn serialized_len(&self) -> usize {
        2 + self.node.name.len()
    }

    fn serialize(&self, buf: &mut [u8]) -> NaResult<usize> {
        let name = self.node.name.as_bytes();
        if buf.len() < 2 + name.len() {
            return Err(NaError::Overflow);
        }
        buf[..2].copy_from_slice(&(name.len() as u16).to_be_bytes());
        buf[2..2 + name.len()].copy_from_slice(name);
        Ok(2 + name.len())
    }

    fn same(&self, other: &dyn TransportAddr) -> bool {
        other
            .as_any()
            .downcast_ref::<MemAddr>()
            .map(|o| Arc::ptr_eq(&o.node, &self.node))
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An in-process memory registration: raw segment list, valid for the life of
/// the memory it describes (same process, so serialized registrations carry
/// the segment addresses themselves).
struct MemMr {
    segments: Vec<Segment>,
    access: MemAccess,
    total: usize,
}

impl MemMr {
    fn deserialize(buf: &[u8]) -> NaResult<MemMr> {
        if buf.len() < 5 {
            return Err(NaError::Overflow);
        }
        let access = match buf[0] {
            1 => MemAccess::ReadOnly,
            2 => MemAccess::WriteOnly,
            3 => MemAccess::ReadWrite,
            _ => return Err(NaError::Protocol("bad access byte".to_string())),
        };
        let count = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
        if buf.len() < 5 + count * 16 {
            return Err(NaError::Overflow);
        }
        let mut segments = Vec::with_capacity(count);
        let mut off = 5;
        for _ in 0..count {
            let base = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()) as usize;
            let len = u64::from_be_bytes(buf[off + 8..off + 16].try_into().unwrap()) as usize;
            segments.push(Segment { base, len });
            off += 16;
        }
        let total = segments.iter().map(|s| s.len).sum();
        Ok(MemMr {
            segments,
            access,
            total,
        })
    }

    /// Copies `len` bytes starting at linear `offset` into `out`.
    ///
    /// # Safety
    ///
    /// The registered segments must still reference live memory.
    unsafe fn read(&self, mut offset: usize, out: &mut [u8]) {
        let mut copied = 0;
        for seg in &self.segments {
            if offset >= seg.len {
                offset -= seg.len;
                continue;
            }
            let n = (seg.len - offset).min(out.len() - copied);
            std::ptr::copy_nonoverlapping(
                (seg.base + offset) as *const u8,
                out[copied..].as_mut_ptr(),
                n,
            );
            copied += n;
            offset = 0;
            if copied == out.len() {
                break;
            }
        }
        debug_assert_eq!(copied, out.len());
    }

    /// Stores `data` starting at linear `offset`.
    ///
    /// # Safety
    ///
    /// The registered segments must still reference live memory.
    unsafe fn write(&self, mut offset: usize, data: &[u8]) {
        let mut copied = 0;
        for seg in &self.segments {
            if offset >= seg.len {
                offset -= seg.len;
                continue;
            }
            let n = (seg.len - offset).min(data.len() - copied);
            std::ptr::copy_nonoverlapping(
                data[copied..].as_ptr(),
                (seg.base + offset) as *mut u8,
                n,
            );
            copied += n;
            offset = 0;
            if copied == data.len() {
                break;
            }
        }
        debug_assert_eq!(copied, data.len());
    }
}

impl MemRegion for MemMr {
    fn serialized_len(&self) -> usize {
        5 + self.segments.len() * 16
    }

    fn serialize(&self, buf: &mut [u8]) -> NaResult<usize> {
        let need = self.serialized_len();
        if buf.len() < need {
            return Err(NaError::Overflow);
        }
        buf[0] = match self.access {
            MemAccess::ReadOnly => 1,
            MemAccess::WriteOnly => 2,
            MemAccess::ReadWrite => 3,
        };
        buf[1..5].copy_from_slice(&(self.segments.len() as u32).to_be_bytes());
        let mut off = 5;
        for seg in &self.segments {
            buf[off..off + 8].copy_from_slice(&(seg.base as u64).to_be_bytes());
            buf[off + 8..off + 16].copy_from_slice(&(seg.len as u64).to_be_bytes());
            off += 16;
        }
        Ok(need)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MemEndpoint {
    node: Arc<Node>,
    id: u8,
}

impl MemEndpoint {
    fn dest_node<'a>(&self, dest: &'a Addr) -> NaResult<&'a Arc<Node>> {
        dest.as_any()
            .downcast_ref::<MemAddr>()
            .map(|a| &a.node)
            .ok_or_else(|| NaError::Protocol("foreign address".to_string()))
    }

    fn complete_send(&self, cb: OpCallback) {
        let mut inner = self.node.inner.lock().unwrap();
        inner
            .endpoints
            .entry(self.id)
            .or_default()
            .ready
            .push_back(Ready::Single {
                cb,
                result: Ok(Completion::Send),
            });
        drop(inner);
        self.node.cv.notify_all();
    }

    fn rma(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        cb: OpCallback,
        is_put: bool,
    ) -> NaResult<OpToken> {
        let local = local
            .as_any()
            .downcast_ref::<MemMr>()
            .ok_or(NaError::OpNotSupported)?;
        let remote = remote
            .as_any()
            .downcast_ref::<MemMr>()
            .ok_or(NaError::OpNotSupported)?;
        if local_offset + len > local.total || remote_offset + len > remote.total {
            return Err(NaError::Overflow);
        }

        // Bounce through a staging buffer; the two regions may overlap.
        let mut tmp = vec![0u8; len];
        unsafe {
            if is_put {
                local.read(local_offset, &mut tmp);
                remote.write(remote_offset, &tmp);
            } else {
                remote.read(remote_offset, &mut tmp);
                local.write(local_offset, &tmp);
            }
        }

        let token = self.node.token();
        let mut inner = self.node.inner.lock().unwrap();
        inner
            .endpoints
            .entry(self.id)
            .or_default()
            .ready
            .push_back(Ready::Single {
                cb,
                result: Ok(Completion::Rma),
            });
        drop(inner);
        self.node.cv.notify_all();

        Ok(OpToken(token))
    }
}

impl Endpoint for MemEndpoint {
    unsafe fn send_unexpected(
        &self,
        buf: *const u8,
        len: usize,
        dest: &Addr,
        target_id: u8,
        tag: Tag,
        cb: OpCallback,
    ) -> NaResult<OpToken> {
        if len > MAX_UNEXPECTED_SIZE {
            return Err(NaError::MsgSize);
        }
        let dest_node = Arc::clone(self.dest_node(dest)?);
        let data = std::slice::from_raw_parts(buf, len);
        let source: Addr = Arc::new(MemAddr {
            node: Arc::clone(&self.node),
            local: Arc::ptr_eq(&dest_node, &self.node),
        });

        {
            let mut inner = dest_node.inner.lock().unwrap();
            Node::deliver_unexpected(&mut inner, target_id, source, tag, data);
        }
        dest_node.cv.notify_all();

        let token = self.node.token();
        self.complete_send(cb);
        Ok(OpToken(token))
    }

    unsafe fn recv_unexpected(
        &self,
        buf: *mut u8,
        len: usize,
        cb: OpCallback,
    ) -> NaResult<OpToken> {
        let token = self.node.token();
        let mut inner = self.node.inner.lock().unwrap();
        let q = inner.endpoints.entry(self.id).or_default();

        if let Some(msg) = q.pending_unexpected.pop_front() {
            let result = if msg.data.len() > len {
                Err(NaError::Overflow)
            } else {
                std::ptr::copy_nonoverlapping(msg.data.as_ptr(), buf, msg.data.len());
                Ok(Completion::RecvUnexpected {
                    source: msg.source,
                    tag: msg.tag,
                    len: msg.data.len(),
                })
            };
            q.ready.push_back(Ready::Single { cb, result });
            drop(inner);
            self.node.cv.notify_all();
        } else {
            q.unexpected.push_back(PostedRecv {
                token,
                buf: RawBufMut(buf),
                len,
                cb,
            });
        }
        Ok(OpToken(token))
    }

    unsafe fn multi_recv(
        &self,
        buf: *mut u8,
        len: usize,
        cb: MultiRecvCallback,
    ) -> NaResult<OpToken> {
        if len < MAX_UNEXPECTED_SIZE {
            return Err(NaError::MsgSize);
        }
        let token = self.node.token();
        let cb = Arc::new(spin::Mutex::new(cb));
        let mut inner = self.node.inner.lock().unwrap();
        inner
            .endpoints
            .entry(self.id)
            .or_default()
            .multi
            .push_back(PostedMulti {
                token,
                buf: RawBufMut(buf),
                len,
                used: 0,
                cb,
            });

        // Drain messages that arrived before the buffer was posted.
        let mut notified = false;
        loop {
            let msg = inner
                .endpoints
                .entry(self.id)
                .or_default()
                .pending_unexpected
                .pop_front();
            match msg {
                Some(msg) => {
                    Node::deliver_unexpected(&mut inner, self.id, msg.source, msg.tag, &msg.data);
                    notified = true;
                }
                None => break,
            }
        }
        drop(inner);
        if notified {
            self.node.cv.notify_all();
        }
        Ok(OpToken(token))
    }

    unsafe fn send_expected(
        &self,
        buf: *const u8,
        len: usize,
        dest: &Addr,
        target_id: u8,
        tag: Tag,
        cb: OpCallback,
    ) -> NaResult<OpToken> {
        if len > MAX_EXPECTED_SIZE {
            return Err(NaError::MsgSize);
        }
        let dest_node = Arc::clone(self.dest_node(dest)?);
        let data = std::slice::from_raw_parts(buf, len);
        let source: Addr = Arc::new(MemAddr {
            node: Arc::clone(&self.node),
            local: Arc::ptr_eq(&dest_node, &self.node),
        });

        {
            let mut inner = dest_node.inner.lock().unwrap();
            Node::deliver_expected(&mut inner, target_id, source, tag, data);
        }
        dest_node.cv.notify_all();

        let token = self.node.token();
        self.complete_send(cb);
        Ok(OpToken(token))
    }

    unsafe fn recv_expected(
        &self,
        buf: *mut u8,
        len: usize,
        _source: &Addr,
        _target_id: u8,
        tag: Tag,
        cb: OpCallback,
    ) -> NaResult<OpToken> {
        let token = self.node.token();
        let mut inner = self.node.inner.lock().unwrap();
        let q = inner.endpoints.entry(self.id).or_default();

        if let Some(pos) = q.pending_expected.iter().position(|m| m.tag == tag) {
            let msg = q.pending_expected.swap_remove(pos);
            let result = if msg.data.len() > len {
                Err(NaError::Overflow)
            } else {
                std::ptr::copy_nonoverlapping(msg.data.as_ptr(), buf, msg.data.len());
                Ok(Completion::RecvExpected {
                    len: msg.data.len(),
                })
            };
            q.ready.push_back(Ready::Single { cb, result });
            drop(inner);
            self.node.cv.notify_all();
        } else {
            q.expected.push(PostedExpected {
                token,
                buf: RawBufMut(buf),
                len,
                tag,
                cb,
            });
        }
        Ok(OpToken(token))
    }

    fn put(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        _dest: &Addr,
        _remote_id: u8,
        cb: OpCallback,
    ) -> NaResult<OpToken> {
        self.rma(local, local_offset, remote, remote_offset, len, cb, true)
    }

    fn get(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        _dest: &Addr,
        _remote_id: u8,
        cb: OpCallback,
    ) -> NaResult<OpToken> {
        self.rma(local, local_offset, remote, remote_offset, len, cb, false)
    }

    fn cancel(&self, op: OpToken) -> NaResult<()> {
        let mut inner = self.node.inner.lock().unwrap();
        let q = inner.endpoints.entry(self.id).or_default();

        if let Some(pos) = q.unexpected.iter().position(|r| r.token == op.0) {
            let r = q.unexpected.remove(pos).unwrap();
            q.ready.push_back(Ready::Single {
                cb: r.cb,
                result: Err(NaError::Canceled),
            });
        } else if let Some(pos) = q.expected.iter().position(|r| r.token == op.0) {
            let r = q.expected.swap_remove(pos);
            q.ready.push_back(Ready::Single {
                cb: r.cb,
                result: Err(NaError::Canceled),
            });
        } else if let Some(pos) = q.multi.iter().position(|r| r.token == op.0) {
            let r = q.multi.remove(pos).unwrap();
            q.ready.push_back(Ready::Multi {
                cb: r.cb,
                event: Err(NaError::Canceled),
            });
        }
        // Completed or unknown tokens: nothing left to cancel.
        drop(inner);
        self.node.cv.notify_all();
        Ok(())
    }

    fn progress(&self, timeout_ms: u32) -> NaResult<()> {
        let mut inner = self.node.inner.lock().unwrap();
        let has_work =
            |inner: &NodeInner| inner.endpoints.get(&self.id).is_some_and(|q| !q.ready.is_empty());
        if has_work(&inner) {
            return Ok(());
        }
        if timeout_ms == 0 {
            return Err(NaError::Timeout);
        }
        let (guard, timed_out) = self
            .node
            .cv
            .wait_timeout_while(inner, Duration::from_millis(timeout_ms as u64), |inner| {
                !has_work(inner)
            })
            .unwrap();
        inner = guard;
        if timed_out.timed_out() && !has_work(&inner) {
            return Err(NaError::Timeout);
        }
        Ok(())
    }

    fn trigger(&self, max: u32) -> NaResult<u32> {
        let mut batch = Vec::new();
        {
            let mut inner = self.node.inner.lock().unwrap();
            let q = inner.endpoints.entry(self.id).or_default();
            while batch.len() < max as usize {
                match q.ready.pop_front() {
                    Some(r) => batch.push(r),
                    None => break,
                }
            }
        }
        let count = batch.len() as u32;
        for r in batch {
            match r {
                Ready::Single { cb, result } => cb(result),
                Ready::Multi { cb, event } => {
                    let mut cb = cb.lock();
                    (*cb)(event);
                }
            }
        }
        Ok(count)
    }

    fn try_wait(&self) -> bool {
        let inner = self.node.inner.lock().unwrap();
        inner
            .endpoints
            .get(&self.id)
            .map_or(true, |q| q.ready.is_empty())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn pair() -> (Arc<MemTransport>, Arc<MemTransport>) {
        let fabric = MemFabric::new();
        let a = fabric.transport("a").unwrap();
        let b = fabric.transport("b").unwrap();
        (a, b)
    }

    #[test]
    fn unexpected_roundtrip() {
        let (a, b) = pair();
        let ea = a.open(0).unwrap();
        let eb = b.open(0).unwrap();

        let mut rbuf = vec![0u8; MAX_UNEXPECTED_SIZE];
        let got = Arc::new(AtomicBool::new(false));
        let got2 = Arc::clone(&got);
        unsafe {
            eb.recv_unexpected(
                rbuf.as_mut_ptr(),
                rbuf.len(),
                Box::new(move |res| {
                    match res.unwrap() {
                        Completion::RecvUnexpected { tag, len, .. } => {
                            assert_eq!(tag, 7);
                            assert_eq!(len, 5);
                        }
                        other => panic!("unexpected completion: {other:?}"),
                    }
                    got2.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }

        let baddr = a.addr_lookup("b").unwrap();
        let msg = *b"hello";
        unsafe {
            ea.send_unexpected(msg.as_ptr(), 5, &baddr, 0, 7, Box::new(|r| assert!(r.is_ok())))
                .unwrap();
        }

        assert_eq!(eb.trigger(16).unwrap(), 1);
        assert!(got.load(Ordering::SeqCst));
        assert_eq!(&rbuf[..5], b"hello");
        assert_eq!(ea.trigger(16).unwrap(), 1);
    }

    #[test]
    fn expected_matches_tag() {
        let (a, b) = pair();
        let ea = a.open(0).unwrap();
        let eb = b.open(0).unwrap();
        let aaddr = b.addr_lookup("a").unwrap();
        let baddr = a.addr_lookup("b").unwrap();

        let mut rbuf = vec![0u8; 64];
        unsafe {
            ea.recv_expected(
                rbuf.as_mut_ptr(),
                rbuf.len(),
                &baddr,
                0,
                42,
                Box::new(|res| assert!(matches!(res.unwrap(), Completion::RecvExpected { len: 3 }))),
            )
            .unwrap();
            eb.send_expected(b"abc".as_ptr(), 3, &aaddr, 0, 42, Box::new(|r| assert!(r.is_ok())))
                .unwrap();
        }
        assert_eq!(ea.trigger(16).unwrap(), 1);
        assert_eq!(&rbuf[..3], b"abc");
    }

    #[test]
    fn cancel_completes_with_canceled() {
        let (a, _b) = pair();
        let ea = a.open(0).unwrap();
        let mut rbuf = vec![0u8; MAX_UNEXPECTED_SIZE];
        let token = unsafe {
            ea.recv_unexpected(
                rbuf.as_mut_ptr(),
                rbuf.len(),
                Box::new(|res| assert!(matches!(res, Err(NaError::Canceled)))),
            )
            .unwrap()
        };
        ea.cancel(token).unwrap();
        // Canceling twice is a no-op.
        ea.cancel(token).unwrap();
        assert_eq!(ea.trigger(16).unwrap(), 1);
    }

    #[test]
    fn rma_put_get() {
        let (a, _b) = pair();
        let ea = a.open(0).unwrap();
        let aaddr = a.addr_self().unwrap();

        let src = vec![9u8; 100];
        let mut dst = vec![0u8; 100];
        let lmr = a
            .mem_register(
                &[Segment { base: src.as_ptr() as usize, len: 100 }],
                MemAccess::ReadWrite,
            )
            .unwrap();
        let rmr = a
            .mem_register(
                &[Segment { base: dst.as_mut_ptr() as usize, len: 100 }],
                MemAccess::ReadWrite,
            )
            .unwrap();

        ea.put(&lmr, 10, &rmr, 20, 30, &aaddr, 0, Box::new(|r| assert!(r.is_ok())))
            .unwrap();
        assert_eq!(ea.trigger(16).unwrap(), 1);
        assert!(dst[20..50].iter().all(|&b| b == 9));
        assert!(dst[..20].iter().all(|&b| b == 0));
    }

    #[test]
    fn multi_recv_slices_and_marks_last() {
        let (a, b) = pair();
        let ea = a.open(0).unwrap();
        let eb = b.open(0).unwrap();
        let baddr = a.addr_lookup("b").unwrap();

        // Room for one max-size message plus a few bytes.
        let mut big = vec![0u8; MAX_UNEXPECTED_SIZE + 8];
        let events = Arc::new(spin::Mutex::new(Vec::new()));
        let events2 = Arc::clone(&events);
        unsafe {
            eb.multi_recv(
                big.as_mut_ptr(),
                big.len(),
                Box::new(move |res| {
                    let ev = res.unwrap();
                    events2.lock().push((ev.offset, ev.len, ev.last));
                }),
            )
            .unwrap();
            ea.send_unexpected(b"first".as_ptr(), 5, &baddr, 0, 1, Box::new(|_| {}))
                .unwrap();
            ea.send_unexpected(b"second!".as_ptr(), 7, &baddr, 0, 2, Box::new(|_| {}))
                .unwrap();
        }
        assert_eq!(eb.trigger(16).unwrap(), 2);
        let events = events.lock();
        assert_eq!(events[0], (0, 5, false));
        // Second message leaves less than a max-size message of room.
        assert_eq!(events[1], (5, 7, true));
        assert_eq!(&big[..5], b"first");
        assert_eq!(&big[5..12], b"second!");
    }
}
