//! Network abstraction consumed by the hermes RPC core.
//!
//! A transport plugin provides unexpected/expected messaging, one-sided RMA
//! between registered memory regions, address management and a
//! progress/trigger completion model. The core drives it from caller threads;
//! the abstraction spawns no threads of its own.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use thiserror::Error;

pub mod mem;

/// Transport-level correlation number pairing a request with its response.
pub type Tag = u32;

/// One contiguous memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: usize,
    pub len: usize,
}

/// Access mode requested for a memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemAccess {
    #[inline]
    pub fn readable(self) -> bool {
        !matches!(self, MemAccess::WriteOnly)
    }

    #[inline]
    pub fn writable(self) -> bool {
        !matches!(self, MemAccess::ReadOnly)
    }
}

#[derive(Debug, Error)]
pub enum NaError {
    #[error("operation canceled")]
    Canceled,
    #[error("operation reached timeout")]
    Timeout,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("no such entry: {0}")]
    NoEntry(String),
    #[error("message size too long for transport")]
    MsgSize,
    #[error("buffer too small")]
    Overflow,
    #[error("operation not supported by transport")]
    OpNotSupported,
    #[error("permission denied")]
    Access,
    #[error("transport protocol error: {0}")]
    Protocol(String),
    #[error("transport failure: {0}")]
    Fault(String),
}

pub type NaResult<T> = Result<T, NaError>;

/// Identifies a posted operation for cancellation. Tokens are only meaningful
/// on the endpoint that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpToken(pub u64);

/// Completion information delivered to an operation callback.
#[derive(Debug)]
pub enum Completion {
    Send,
    RecvUnexpected { source: Addr, tag: Tag, len: usize },
    RecvExpected { len: usize },
    Rma,
}

/// One message slice delivered out of a multi-recv buffer. `offset`/`len`
/// locate the message within the posted buffer; `last` marks the slice after
/// which the buffer will not be used again until reposted.
#[derive(Debug)]
pub struct MultiRecvEvent {
    pub source: Addr,
    pub tag: Tag,
    pub offset: usize,
    pub len: usize,
    pub last: bool,
}

/// Completion callback for a single posted operation. Invoked exactly once,
/// from `Endpoint::trigger` context, with `Err(NaError::Canceled)` when the
/// operation was canceled.
pub type OpCallback = Box<dyn FnOnce(NaResult<Completion>) + Send>;

/// Completion callback for a multi-recv operation; fires once per message
/// slice and once with `Err(NaError::Canceled)` if the posting is canceled.
pub type MultiRecvCallback = Box<dyn FnMut(NaResult<MultiRecvEvent>) + Send>;

/// An opaque peer address.
pub trait TransportAddr: fmt::Debug + Send + Sync {
    /// True when the address designates the process that created it.
    fn is_self(&self) -> bool;

    fn serialized_len(&self) -> usize;

    /// Writes the address into `buf`, returning the number of bytes used.
    fn serialize(&self, buf: &mut [u8]) -> NaResult<usize>;

    fn same(&self, other: &dyn TransportAddr) -> bool;

    fn as_any(&self) -> &dyn Any;
}

pub type Addr = Arc<dyn TransportAddr>;

/// A registered memory region (single- or multi-segment). Deregistration
/// happens when the last reference drops.
pub trait MemRegion: Send + Sync {
    fn serialized_len(&self) -> usize;

    /// Writes the registration descriptor into `buf`, returning the number of
    /// bytes used.
    fn serialize(&self, buf: &mut [u8]) -> NaResult<usize>;

    fn as_any(&self) -> &dyn Any;
}

pub type MemHandle = Arc<dyn MemRegion>;

/// Class-level transport operations shared by all endpoints.
pub trait Transport: Send + Sync {
    /// Creates a new endpoint (one polling/execution domain) with the given
    /// context id.
    fn open(&self, id: u8) -> NaResult<Box<dyn Endpoint>>;

    fn addr_self(&self) -> NaResult<Addr>;

    fn addr_lookup(&self, name: &str) -> NaResult<Addr>;

    fn addr_deserialize(&self, buf: &[u8]) -> NaResult<Addr>;

    fn max_unexpected_size(&self) -> usize;

    fn max_expected_size(&self) -> usize;

    fn max_tag(&self) -> Tag;

    /// Maximum number of segments for one combined registration; 1 when
    /// multi-segment registration is unsupported.
    fn max_segments(&self) -> usize;

    fn mem_register(&self, segments: &[Segment], access: MemAccess) -> NaResult<MemHandle>;

    fn mem_deserialize(&self, buf: &[u8]) -> NaResult<MemHandle>;
}

/// Per-context transport operations.
///
/// # Safety
///
/// For every posting method taking a raw buffer, the memory must stay valid
/// and must not be reused until the matching completion callback has fired
/// (retrieved through `trigger`), or `cancel` has completed it with
/// `NaError::Canceled`.
pub trait Endpoint: Send + Sync {
    unsafe fn send_unexpected(
        &self,
        buf: *const u8,
        len: usize,
        dest: &Addr,
        target_id: u8,
        tag: Tag,
        cb: OpCallback,
    ) -> NaResult<OpToken>;

    unsafe fn recv_unexpected(&self, buf: *mut u8, len: usize, cb: OpCallback)
        -> NaResult<OpToken>;

    unsafe fn multi_recv(&self, buf: *mut u8, len: usize, cb: MultiRecvCallback)
        -> NaResult<OpToken>;

    unsafe fn send_expected(
        &self,
        buf: *const u8,
        len: usize,
        dest: &Addr,
        target_id: u8,
        tag: Tag,
        cb: OpCallback,
    ) -> NaResult<OpToken>;

    unsafe fn recv_expected(
        &self,
        buf: *mut u8,
        len: usize,
        source: &Addr,
        target_id: u8,
        tag: Tag,
        cb: OpCallback,
    ) -> NaResult<OpToken>;

    /// One-sided write: `len` bytes at `local_offset` within the local region
    /// are stored at `remote_offset` within the remote region. Offsets are
    /// linear across the segments the registration covers.
    fn put(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        dest: &Addr,
        remote_id: u8,
        cb: OpCallback,
    ) -> NaResult<OpToken>;

    /// One-sided read, the symmetric inverse of [`Endpoint::put`].
    fn get(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        dest: &Addr,
        remote_id: u8,
        cb: OpCallback,
    ) -> NaResult<OpToken>;

    /// Requests cancellation of a posted operation. Canceling an operation
    /// that already completed is a successful no-op; a canceled operation
    /// still flows through `trigger` with `NaError::Canceled`.
    fn cancel(&self, op: OpToken) -> NaResult<()>;

    /// Waits for transport activity up to `timeout_ms`. Returns
    /// `Err(NaError::Timeout)` when nothing progressed.
    fn progress(&self, timeout_ms: u32) -> NaResult<()>;

    /// Invokes up to `max` completion callbacks, returning how many fired.
    fn trigger(&self, max: u32) -> NaResult<u32>;

    /// True when it is safe to block waiting on this endpoint (no completion
    /// is already pending).
    fn try_wait(&self) -> bool;

    /// A pollable descriptor signaled on transport activity, when the
    /// transport exposes one.
    fn poll_fd(&self) -> Option<RawFd>;
}
