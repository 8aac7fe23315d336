//! Address wrapper: one transport address per class slot, with a loopback
//! ("is self") flag and cached serialization size.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::class::Class;
use crate::error::{Error, Result};

pub struct Address {
    class: Arc<Class>,
    addrs: SmallVec<[Option<hermes_na::Addr>; 2]>,
    is_self: bool,
    // Cached total serialization size, 0 until first computed.
    serialize_len: AtomicUsize,
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("addrs", &self.addrs)
            .field("is_self", &self.is_self)
            .finish()
    }
}

impl Address {
    pub(crate) fn from_na(
        class: Arc<Class>,
        addrs: SmallVec<[Option<hermes_na::Addr>; 2]>,
    ) -> Arc<Address> {
        debug_assert_eq!(addrs.len(), class.slots().len());
        let present = addrs.iter().flatten().count();
        let is_self = present > 0 && addrs.iter().flatten().all(|a| a.is_self());
        class.addr_created();
        Arc::new(Address {
            class,
            addrs,
            is_self,
            serialize_len: AtomicUsize::new(0),
        })
    }

    /// Wraps a single-slot transport address.
    pub(crate) fn from_slot_na(
        class: Arc<Class>,
        slot: usize,
        addr: hermes_na::Addr,
    ) -> Arc<Address> {
        let mut addrs: SmallVec<[Option<hermes_na::Addr>; 2]> =
            SmallVec::from_iter(class.slots().iter().map(|_| None));
        addrs[slot] = Some(addr);
        Self::from_na(class, addrs)
    }

    #[inline]
    pub fn is_self(&self) -> bool {
        self.is_self
    }

    pub(crate) fn slot_addr(&self, slot: usize) -> Option<&hermes_na::Addr> {
        self.addrs.get(slot).and_then(|a| a.as_ref())
    }

    /// The preferred transport slot for this address: the highest-index slot
    /// holding an address (secondary/shared-memory over primary).
    pub(crate) fn best_slot(&self) -> Result<usize> {
        self.addrs
            .iter()
            .rposition(|a| a.is_some())
            .ok_or(Error::InvalidArg("address holds no transport address"))
    }

    pub fn same(&self, other: &Address) -> bool {
        if self.addrs.len() != other.addrs.len() {
            return false;
        }
        self.addrs
            .iter()
            .zip(other.addrs.iter())
            .all(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => a.same(b.as_ref()),
                (None, None) => true,
                _ => false,
            })
    }

    /// Serialized size: one length-prefixed block per class slot.
    pub fn serialized_len(&self) -> usize {
        let cached = self.serialize_len.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        let len: usize = self
            .addrs
            .iter()
            .map(|a| 8 + a.as_ref().map_or(0, |a| a.serialized_len()))
            .sum();
        self.serialize_len.store(len, Ordering::Relaxed);
        len
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let mut off = 0;
        for addr in &self.addrs {
            match addr {
                Some(addr) => {
                    let len = addr.serialized_len();
                    if buf.len() < off + 8 + len {
                        return Err(Error::Overflow("address serialize buffer"));
                    }
                    buf[off..off + 8].copy_from_slice(&(len as u64).to_be_bytes());
                    off += 8;
                    off += addr.serialize(&mut buf[off..off + len])?;
                }
                None => {
                    if buf.len() < off + 8 {
                        return Err(Error::Overflow("address serialize buffer"));
                    }
                    buf[off..off + 8].copy_from_slice(&0u64.to_be_bytes());
                    off += 8;
                }
            }
        }
        Ok(off)
    }

    pub fn deserialize(class: &Arc<Class>, buf: &[u8]) -> Result<(Arc<Address>, usize)> {
        let mut addrs: SmallVec<[Option<hermes_na::Addr>; 2]> = SmallVec::new();
        let mut off = 0;
        for slot in class.slots() {
            if buf.len() < off + 8 {
                return Err(Error::Overflow("address deserialize buffer"));
            }
            let len = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()) as usize;
            off += 8;
            if len == 0 {
                addrs.push(None);
                continue;
            }
            if buf.len() < off + len {
                return Err(Error::Overflow("address deserialize buffer"));
            }
            let addr = slot.transport.addr_deserialize(&buf[off..off + len])?;
            off += len;
            addrs.push(Some(addr));
        }
        Ok((Address::from_na(Arc::clone(class), addrs), off))
    }
}

impl Drop for Address {
    fn drop(&mut self) {
        self.class.addr_dropped();
    }
}
