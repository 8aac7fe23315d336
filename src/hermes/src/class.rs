//! Process-wide registry scope: RPC map, init options, tag generation and
//! lifetime accounting for contexts, addresses and bulk handles.

use std::any::Any;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use hermes_na::{Tag, Transport};

use crate::addr::Address;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::registry::{RpcHandler, RpcId, RpcInfo, RpcRegistry};

/// Class initialization options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassOptions {
    /// Handles pre-posted per listening pool (also sizes multi-recv buffers).
    pub request_post_init: u32,
    /// Handles added per pool extension; 0 disables growth.
    pub request_post_incr: u32,
    /// Carry a 16-bit checksum on message headers.
    pub checksum: bool,
    /// Service self-addressed operations over the loopback path.
    pub loopback: bool,
    /// Post a small set of large shared receive buffers instead of one
    /// receive per pooled handle.
    pub multi_recv: bool,
    /// Listen for incoming RPC requests.
    pub listen: bool,
}

impl Default for ClassOptions {
    fn default() -> Self {
        ClassOptions {
            request_post_init: 256,
            request_post_incr: 256,
            checksum: false,
            loopback: true,
            multi_recv: false,
            listen: false,
        }
    }
}

impl ClassOptions {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Protocol(format!("bad class options: {e}")))
    }
}

/// Which role a transport slot plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Primary,
    /// Optional secondary transport preferred for same-host peers.
    SharedMemory,
}

pub struct TransportSlot {
    pub transport: Arc<dyn Transport>,
    pub kind: SlotKind,
}

/// Direction of the payload a more-data exchange acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Input,
    Output,
}

/// Invoked by the more-data acquire callback once the supplemental payload
/// has been pulled (or failed).
pub type MoreDataDone = Box<dyn FnOnce(&Arc<Handle>, Result<()>) + Send>;

/// Callbacks letting an upper layer acquire/release supplemental payloads
/// flagged with `MsgFlags::MORE_DATA`.
#[derive(Clone)]
pub struct MoreDataCb {
    pub acquire: Arc<dyn Fn(&Arc<Handle>, IoDir, MoreDataDone) -> Result<()> + Send + Sync>,
    pub release: Arc<dyn Fn(&Arc<Handle>) + Send + Sync>,
}

/// Diagnostic counters.
#[derive(Default)]
pub(crate) struct Counters {
    pub req_sent: AtomicU64,
    pub req_recv: AtomicU64,
    pub resp_sent: AtomicU64,
    pub resp_recv: AtomicU64,
    pub req_extra: AtomicU64,
    pub resp_extra: AtomicU64,
    pub bulk_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub req_sent: u64,
    pub req_recv: u64,
    pub resp_sent: u64,
    pub resp_recv: u64,
    pub req_extra: u64,
    pub resp_extra: u64,
    pub bulk_count: u64,
}

pub struct Class {
    opts: ClassOptions,
    slots: SmallVec<[TransportSlot; 2]>,
    pub(crate) registry: RpcRegistry,
    pub(crate) more_data: spin::RwLock<Option<MoreDataCb>>,
    pub(crate) counters: Counters,
    request_tag: AtomicU32,
    request_max_tag: Tag,
    n_contexts: AtomicI32,
    n_addrs: AtomicI32,
    n_bulks: AtomicI32,
}

impl Class {
    pub fn new(transport: Arc<dyn Transport>, opts: ClassOptions) -> Result<Arc<Class>> {
        Self::init(
            SmallVec::from_iter([TransportSlot {
                transport,
                kind: SlotKind::Primary,
            }]),
            opts,
        )
    }

    /// A class with a primary transport plus a shared-memory secondary,
    /// preferred for peers that resolve on both.
    pub fn with_shared_memory(
        primary: Arc<dyn Transport>,
        shared_memory: Arc<dyn Transport>,
        opts: ClassOptions,
    ) -> Result<Arc<Class>> {
        Self::init(
            SmallVec::from_iter([
                TransportSlot {
                    transport: primary,
                    kind: SlotKind::Primary,
                },
                TransportSlot {
                    transport: shared_memory,
                    kind: SlotKind::SharedMemory,
                },
            ]),
            opts,
        )
    }

    fn init(slots: SmallVec<[TransportSlot; 2]>, opts: ClassOptions) -> Result<Arc<Class>> {
        if opts.request_post_init == 0 {
            return Err(Error::InvalidArg("request_post_init must be non-zero"));
        }
        let request_max_tag = slots
            .iter()
            .map(|s| s.transport.max_tag())
            .min()
            .ok_or(Error::InvalidArg("no transport"))?;
        if request_max_tag == 0 {
            return Err(Error::InvalidArg("transport advertises zero max tag"));
        }

        Ok(Arc::new(Class {
            opts,
            slots,
            registry: RpcRegistry::new(),
            more_data: spin::RwLock::new(None),
            counters: Counters::default(),
            request_tag: AtomicU32::new(0),
            request_max_tag,
            n_contexts: AtomicI32::new(0),
            n_addrs: AtomicI32::new(0),
            n_bulks: AtomicI32::new(0),
        }))
    }

    #[inline]
    pub(crate) fn opts(&self) -> &ClassOptions {
        &self.opts
    }

    #[inline]
    pub(crate) fn slots(&self) -> &[TransportSlot] {
        &self.slots
    }

    /// Registers `handler` under `id`, replacing any previous registration.
    pub fn register(&self, id: RpcId, handler: RpcHandler) {
        self.registry.insert(id, handler, None);
    }

    /// Like [`Class::register`], attaching user data kept until the id is
    /// deregistered.
    pub fn register_with_data(
        &self,
        id: RpcId,
        handler: RpcHandler,
        data: Box<dyn Any + Send + Sync>,
    ) {
        self.registry.insert(id, handler, Some(data));
    }

    pub fn deregister(&self, id: RpcId) -> Result<()> {
        self.registry.remove(id)
    }

    #[inline]
    pub fn registered(&self, id: RpcId) -> bool {
        self.registry.contains(id)
    }

    pub(crate) fn rpc_lookup(&self, id: RpcId) -> Option<Arc<RpcInfo>> {
        self.registry.lookup(id)
    }

    pub fn set_more_data_callback(&self, cb: Option<MoreDataCb>) {
        *self.more_data.write() = cb;
    }

    /// Monotonic request tag, wrapping at the transport's max tag.
    pub(crate) fn gen_tag(&self) -> Tag {
        if self
            .request_tag
            .compare_exchange(
                self.request_max_tag,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            0
        } else {
            self.request_tag.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
        }
    }

    pub fn addr_self(self: &Arc<Self>) -> Result<Arc<Address>> {
        let mut addrs: SmallVec<[Option<hermes_na::Addr>; 2]> = SmallVec::new();
        for slot in &self.slots {
            addrs.push(Some(slot.transport.addr_self()?));
        }
        Ok(Address::from_na(Arc::clone(self), addrs))
    }

    /// Resolves `name` on every slot; the secondary slot is optional (peers
    /// not reachable over it simply resolve on the primary alone).
    pub fn addr_lookup(self: &Arc<Self>, name: &str) -> Result<Arc<Address>> {
        let mut addrs: SmallVec<[Option<hermes_na::Addr>; 2]> = SmallVec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            match slot.transport.addr_lookup(name) {
                Ok(addr) => addrs.push(Some(addr)),
                Err(hermes_na::NaError::NoEntry(_)) if i > 0 => addrs.push(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Address::from_na(Arc::clone(self), addrs))
    }

    pub fn addr_deserialize(self: &Arc<Self>, buf: &[u8]) -> Result<Arc<Address>> {
        Address::deserialize(self, buf).map(|(addr, _)| addr)
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            req_sent: c.req_sent.load(Ordering::Relaxed),
            req_recv: c.req_recv.load(Ordering::Relaxed),
            resp_sent: c.resp_sent.load(Ordering::Relaxed),
            resp_recv: c.resp_recv.load(Ordering::Relaxed),
            req_extra: c.req_extra.load(Ordering::Relaxed),
            resp_extra: c.resp_extra.load(Ordering::Relaxed),
            bulk_count: c.bulk_count.load(Ordering::Relaxed),
        }
    }

    /// Verifies nothing still references the class. Contexts, addresses and
    /// bulk handles must all be released first.
    pub fn finalize(&self) -> Result<()> {
        if self.n_contexts.load(Ordering::Acquire) != 0 {
            return Err(Error::Busy("contexts remain on class"));
        }
        if self.n_addrs.load(Ordering::Acquire) != 0 {
            return Err(Error::Busy("addresses remain on class"));
        }
        if self.n_bulks.load(Ordering::Acquire) != 0 {
            return Err(Error::Busy("bulk handles remain on class"));
        }
        Ok(())
    }

    pub(crate) fn context_created(&self) {
        self.n_contexts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn context_dropped(&self) {
        self.n_contexts.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn addr_created(&self) {
        self.n_addrs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn addr_dropped(&self) {
        self.n_addrs.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn bulk_created(&self) {
        self.n_bulks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bulk_dropped(&self) {
        self.n_bulks.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_na::mem::MemFabric;

    #[test]
    fn options_from_toml() {
        let opts = ClassOptions::from_toml(
            r#"
            request_post_init = 8
            listen = true
            multi_recv = true
            "#,
        )
        .unwrap();
        assert_eq!(opts.request_post_init, 8);
        assert!(opts.listen);
        assert!(opts.multi_recv);
        // Unset fields keep their defaults.
        assert!(opts.loopback);
        assert!(!opts.checksum);
    }

    #[test]
    fn tag_wraps_at_max() {
        let fabric = MemFabric::new();
        let t = fabric.transport("tags").unwrap();
        let class = Class::new(t, ClassOptions::default()).unwrap();

        let first = class.gen_tag();
        assert_eq!(first, 1);
        class
            .request_tag
            .store(class.request_max_tag, Ordering::Release);
        assert_eq!(class.gen_tag(), 0);
        assert_eq!(class.gen_tag(), 1);
    }

    #[test]
    fn finalize_flags_leaked_addrs() {
        let fabric = MemFabric::new();
        let t = fabric.transport("leak").unwrap();
        let class = Class::new(t, ClassOptions::default()).unwrap();
        let addr = class.addr_self().unwrap();
        assert!(matches!(class.finalize(), Err(Error::Busy(_))));
        drop(addr);
        class.finalize().unwrap();
    }
}
