//! Bulk descriptor: one or more memory segments exposed for remote access,
//! with per-segment or combined transport registrations.

use std::sync::Arc;

use bitflags::bitflags;
use smallvec::SmallVec;

use hermes_na::{MemAccess, MemHandle, Segment};

use crate::addr::Address;
use crate::class::Class;
use crate::context::Context;
use crate::error::{Error, Result};

bitflags! {
    /// Wire/descriptor flags. The access bits travel verbatim; the rest are
    /// recomputed on each serialization or decode.
    pub(crate) struct DescFlags: u8 {
        const READ_ONLY  = 0x01;
        const WRITE_ONLY = 0x02;
        /// Memory is owned by the descriptor.
        const ALLOC = 0x04;
        /// Payload is inlined in the serialized descriptor.
        const EAGER = 0x08;
        /// A secondary-transport registration block is present.
        const SM = 0x10;
        /// A bound-address block is present.
        const BIND = 0x20;
    }
}

/// Access permission for the exposed memory, exactly one of the three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BulkAccess {
    #[inline]
    pub fn readable(self) -> bool {
        !matches!(self, BulkAccess::WriteOnly)
    }

    #[inline]
    pub fn writable(self) -> bool {
        !matches!(self, BulkAccess::ReadOnly)
    }

    pub(crate) fn bits(self) -> DescFlags {
        match self {
            BulkAccess::ReadOnly => DescFlags::READ_ONLY,
            BulkAccess::WriteOnly => DescFlags::WRITE_ONLY,
            BulkAccess::ReadWrite => DescFlags::READ_ONLY | DescFlags::WRITE_ONLY,
        }
    }

    pub(crate) fn from_bits(flags: DescFlags) -> Result<BulkAccess> {
        match (
            flags.contains(DescFlags::READ_ONLY),
            flags.contains(DescFlags::WRITE_ONLY),
        ) {
            (true, false) => Ok(BulkAccess::ReadOnly),
            (false, true) => Ok(BulkAccess::WriteOnly),
            (true, true) => Ok(BulkAccess::ReadWrite),
            (false, false) => Err(Error::InvalidArg("unrecognized bulk access flag")),
        }
    }

    fn mem_access(self) -> MemAccess {
        match self {
            BulkAccess::ReadOnly => MemAccess::ReadOnly,
            BulkAccess::WriteOnly => MemAccess::WriteOnly,
            BulkAccess::ReadWrite => MemAccess::ReadWrite,
        }
    }
}

/// Registrations held for one transport slot: either one combined
/// multi-segment registration or one per non-empty segment.
pub(crate) struct SlotRegs {
    pub combined: bool,
    pub handles: SmallVec<[Option<MemHandle>; 4]>,
}

pub(crate) struct BoundInfo {
    pub addr: Arc<Address>,
    pub context_id: u8,
}

pub struct BulkHandle {
    class: Arc<Class>,
    pub(crate) segments: SmallVec<[Segment; 4]>,
    /// Backing allocations for managed/eager descriptors; segment bases
    /// point into these.
    storage: Vec<Box<[u8]>>,
    pub(crate) regs: SmallVec<[Option<SlotRegs>; 2]>,
    pub(crate) total: usize,
    pub(crate) access: BulkAccess,
    pub(crate) eager: bool,
    /// Deserialized without data: segment bases are peer pointers, not
    /// dereferenceable here.
    pub(crate) virt: bool,
    pub(crate) bound: spin::Mutex<Option<BoundInfo>>,
}

impl BulkHandle {
    /// Creates a descriptor over internally allocated (zeroed) storage, one
    /// region per requested length.
    pub fn create(
        class: &Arc<Class>,
        lengths: &[usize],
        access: BulkAccess,
    ) -> Result<Arc<BulkHandle>> {
        if lengths.is_empty() {
            return Err(Error::InvalidArg("invalid number of segments"));
        }

        let mut storage = Vec::with_capacity(lengths.len());
        let mut segments: SmallVec<[Segment; 4]> = SmallVec::with_capacity(lengths.len());
        for &len in lengths {
            if len == 0 {
                segments.push(Segment { base: 0, len: 0 });
                continue;
            }
            let mut buf = vec![0u8; len].into_boxed_slice();
            segments.push(Segment {
                base: buf.as_mut_ptr() as usize,
                len,
            });
            storage.push(buf);
        }

        Self::build(class, segments, storage, access)
    }

    /// Creates a descriptor over caller-owned regions.
    ///
    /// # Safety
    ///
    /// Every segment must reference memory that stays valid (and unmoved)
    /// for the life of the returned handle.
    pub unsafe fn create_from_segments(
        class: &Arc<Class>,
        segments: &[Segment],
        access: BulkAccess,
    ) -> Result<Arc<BulkHandle>> {
        if segments.is_empty() {
            return Err(Error::InvalidArg("invalid number of segments"));
        }
        Self::build(class, SmallVec::from_slice(segments), Vec::new(), access)
    }

    /// Builds a descriptor over local memory, registering the segments on
    /// every transport slot.
    pub(crate) fn build(
        class: &Arc<Class>,
        segments: SmallVec<[Segment; 4]>,
        storage: Vec<Box<[u8]>>,
        access: BulkAccess,
    ) -> Result<Arc<BulkHandle>> {
        let mut regs: SmallVec<[Option<SlotRegs>; 2]> = SmallVec::new();
        for slot in class.slots() {
            regs.push(Some(Self::register(
                &*slot.transport,
                &segments,
                access.mem_access(),
            )?));
        }
        Ok(Self::build_with_regs(
            class, segments, storage, regs, access, false, false,
        ))
    }

    /// Builds a descriptor with pre-existing registrations (deserialization
    /// path; registrations came over the wire, or none for eager data).
    pub(crate) fn build_with_regs(
        class: &Arc<Class>,
        segments: SmallVec<[Segment; 4]>,
        storage: Vec<Box<[u8]>>,
        regs: SmallVec<[Option<SlotRegs>; 2]>,
        access: BulkAccess,
        eager: bool,
        virt: bool,
    ) -> Arc<BulkHandle> {
        let total = segments.iter().map(|s| s.len).sum();
        class.bulk_created();
        Arc::new(BulkHandle {
            class: Arc::clone(class),
            segments,
            storage,
            regs,
            total,
            access,
            eager,
            virt,
            bound: spin::Mutex::new(None),
        })
    }

    /// Registers the segments on one transport: combined when the transport
    /// can take them as one multi-segment descriptor, individually
    /// otherwise.
    fn register(
        transport: &dyn hermes_na::Transport,
        segments: &[Segment],
        access: MemAccess,
    ) -> Result<SlotRegs> {
        let use_combined = segments.len() > 1 && transport.max_segments() >= segments.len();

        let mut handles: SmallVec<[Option<MemHandle>; 4]> = SmallVec::new();
        if use_combined {
            handles.push(Some(transport.mem_register(segments, access)?));
        } else {
            for seg in segments {
                if seg.len == 0 {
                    handles.push(None);
                    continue;
                }
                handles.push(Some(
                    transport.mem_register(std::slice::from_ref(seg), access)?,
                ));
            }
        }
        Ok(SlotRegs {
            combined: use_combined,
            handles,
        })
    }

    #[inline]
    pub(crate) fn class(&self) -> &Arc<Class> {
        &self.class
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn access_flags(&self) -> BulkAccess {
        self.access
    }

    #[inline]
    pub fn is_eager(&self) -> bool {
        self.eager
    }

    /// True when the descriptor was deserialized without inlined data.
    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.virt
    }

    pub(crate) fn slot_regs(&self, slot: usize) -> Option<&SlotRegs> {
        self.regs.get(slot).and_then(|r| r.as_ref())
    }

    /// Attaches this process's address and `context`'s id so a remote peer
    /// can target an origin-initiated transfer without being sent the
    /// address explicitly. Fails if already bound.
    pub fn bind(&self, context: &Arc<Context>) -> Result<()> {
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err(Error::InvalidArg(
                "handle is already bound to existing address",
            ));
        }
        *bound = Some(BoundInfo {
            addr: self.class.addr_self()?,
            context_id: context.id(),
        });
        Ok(())
    }

    /// The bound origin address, if any.
    pub fn bound_addr(&self) -> Option<Arc<Address>> {
        self.bound.lock().as_ref().map(|b| Arc::clone(&b.addr))
    }

    pub fn bound_context_id(&self) -> Option<u8> {
        self.bound.lock().as_ref().map(|b| b.context_id)
    }

    /// Maps a linear offset to (starting segment index, intra-segment
    /// offset).
    pub(crate) fn offset_translate(&self, offset: usize) -> (usize, usize) {
        let mut remaining = offset;
        for (i, seg) in self.segments.iter().enumerate() {
            if remaining < seg.len {
                return (i, remaining);
            }
            remaining -= seg.len;
        }
        (self.segments.len(), 0)
    }

    /// Resolves `(offset, size)` into up to `max_count` contiguous segment
    /// runs.
    pub fn access(&self, offset: usize, size: usize, max_count: usize) -> SmallVec<[Segment; 4]> {
        let mut out = SmallVec::new();
        if size == 0 || max_count == 0 {
            return out;
        }
        let (mut index, mut seg_off) = self.offset_translate(offset);
        let mut remaining = size;
        while remaining > 0 && out.len() < max_count && index < self.segments.len() {
            let seg = &self.segments[index];
            let run = (seg.len - seg_off).min(remaining);
            out.push(Segment {
                base: seg.base + seg_off,
                len: run,
            });
            remaining -= run;
            index += 1;
            seg_off = 0;
        }
        out
    }

    /// Copies `data` into the exposed memory at the linear `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if self.virt {
            return Err(Error::InvalidArg("descriptor memory is not local"));
        }
        if offset + data.len() > self.total {
            return Err(Error::InvalidArg("write exceeds exposed memory"));
        }
        let runs = self.access(offset, data.len(), usize::MAX);
        let mut copied = 0;
        for run in runs {
            // Safety: segments reference live memory (managed storage, or the
            // caller's guarantee from create_from_segments).
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[copied..].as_ptr(),
                    run.base as *mut u8,
                    run.len,
                );
            }
            copied += run.len;
        }
        Ok(())
    }

    /// Copies `out.len()` bytes from the exposed memory at the linear
    /// `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        if self.virt {
            return Err(Error::InvalidArg("descriptor memory is not local"));
        }
        if offset + out.len() > self.total {
            return Err(Error::InvalidArg("read exceeds exposed memory"));
        }
        let runs = self.access(offset, out.len(), usize::MAX);
        let mut copied = 0;
        for run in runs {
            // Safety: as in `write`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    run.base as *const u8,
                    out[copied..].as_mut_ptr(),
                    run.len,
                );
            }
            copied += run.len;
        }
        Ok(())
    }

    pub(crate) fn has_storage(&self) -> bool {
        !self.storage.is_empty()
    }
}

impl Drop for BulkHandle {
    fn drop(&mut self) {
        self.class.bulk_dropped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassOptions;
    use hermes_na::mem::MemFabric;

    fn test_class() -> Arc<Class> {
        let fabric = MemFabric::new();
        let t = fabric.transport("bulk-desc").unwrap();
        Class::new(t, ClassOptions::default()).unwrap()
    }

    #[test]
    fn create_managed_and_rw() {
        let class = test_class();
        let bulk = BulkHandle::create(&class, &[100, 50, 25], BulkAccess::ReadWrite).unwrap();
        assert_eq!(bulk.total_size(), 175);
        assert_eq!(bulk.segment_count(), 3);

        let data: Vec<u8> = (0..175).map(|i| i as u8).collect();
        bulk.write(0, &data).unwrap();
        let mut back = vec![0u8; 60];
        // Straddles the first and second segments.
        bulk.read(90, &mut back).unwrap();
        assert_eq!(&back[..], &data[90..150]);
    }

    #[test]
    fn offset_translation_walks_segments() {
        let class = test_class();
        let bulk = BulkHandle::create(&class, &[10, 20, 30], BulkAccess::ReadOnly).unwrap();
        assert_eq!(bulk.offset_translate(0), (0, 0));
        assert_eq!(bulk.offset_translate(9), (0, 9));
        assert_eq!(bulk.offset_translate(10), (1, 0));
        assert_eq!(bulk.offset_translate(29), (1, 19));
        assert_eq!(bulk.offset_translate(30), (2, 0));
        assert_eq!(bulk.offset_translate(59), (2, 29));
    }

    #[test]
    fn access_returns_min_runs() {
        let class = test_class();
        let bulk = BulkHandle::create(&class, &[10, 20, 30], BulkAccess::ReadOnly).unwrap();
        let runs = bulk.access(5, 30, 8);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].len, 5);
        assert_eq!(runs[1].len, 20);
        assert_eq!(runs[2].len, 5);

        // max_count truncates the walk.
        let runs = bulk.access(5, 30, 2);
        assert_eq!(runs.len(), 2);
    }

    #[test]
    fn bind_twice_fails() {
        let class = test_class();
        let context = Context::create(&class, 0).unwrap();
        let bulk = BulkHandle::create(&class, &[8], BulkAccess::ReadOnly).unwrap();
        bulk.bind(&context).unwrap();
        assert!(matches!(bulk.bind(&context), Err(Error::InvalidArg(_))));
        assert_eq!(bulk.bound_context_id(), Some(0));
        assert!(bulk.bound_addr().unwrap().is_self());
        drop(bulk);
        context.destroy().unwrap();
    }

    #[test]
    fn empty_segment_list_rejected() {
        let class = test_class();
        assert!(matches!(
            BulkHandle::create(&class, &[], BulkAccess::ReadOnly),
            Err(Error::InvalidArg(_))
        ));
    }
}
