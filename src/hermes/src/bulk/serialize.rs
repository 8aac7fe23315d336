//! Flat wire encoding of bulk descriptors.
//!
//! Layout: descriptor info (segment count + flags, transient bits
//! recomputed) → raw segment base/length array → registration block(s) →
//! optional secondary-transport registration block → optional bound-address
//! block → optional inlined eager payload. Decode mirrors encode exactly and
//! reconstructs virtual semantics whenever no payload was inlined.

use std::sync::Arc;

use log::warn;
use smallvec::SmallVec;

use hermes_na::{MemHandle, Segment};

use crate::addr::Address;
use crate::class::Class;
use crate::error::{Error, Result};

use super::descriptor::{BoundInfo, BulkAccess, BulkHandle, DescFlags, SlotRegs};

struct Encoder<'a> {
    buf: &'a mut [u8],
    off: usize,
}

impl<'a> Encoder<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Encoder { buf, off: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() < self.off + bytes.len() {
            return Err(Error::Overflow("bulk serialize buffer too small"));
        }
        self.buf[self.off..self.off + bytes.len()].copy_from_slice(bytes);
        self.off += bytes.len();
        Ok(())
    }

    fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_be_bytes())
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.off + n {
            return Err(Error::Overflow("bulk deserialize buffer too small"));
        }
        let out = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }
}

fn regs_block_size(regs: &SlotRegs) -> usize {
    4 + regs
        .handles
        .iter()
        .map(|h| 8 + h.as_ref().map_or(0, |h| h.serialized_len()))
        .sum::<usize>()
}

fn encode_regs(enc: &mut Encoder<'_>, regs: &SlotRegs) -> Result<()> {
    enc.put_u32(regs.handles.len() as u32)?;
    for handle in &regs.handles {
        match handle {
            Some(handle) => {
                let len = handle.serialized_len();
                enc.put_u64(len as u64)?;
                if enc.buf.len() < enc.off + len {
                    return Err(Error::Overflow("bulk serialize buffer too small"));
                }
                let n = handle.serialize(&mut enc.buf[enc.off..enc.off + len])?;
                enc.off += n;
            }
            None => enc.put_u64(0)?,
        }
    }
    Ok(())
}

fn decode_regs(
    dec: &mut Decoder<'_>,
    transport: Option<&dyn hermes_na::Transport>,
    segment_count: usize,
) -> Result<Option<SlotRegs>> {
    let count = dec.get_u32()? as usize;
    let mut handles: SmallVec<[Option<MemHandle>; 4]> = SmallVec::new();
    for _ in 0..count {
        let len = dec.get_u64()? as usize;
        if len == 0 {
            handles.push(None);
            continue;
        }
        let bytes = dec.take(len)?;
        match transport {
            Some(t) => handles.push(Some(t.mem_deserialize(bytes)?)),
            None => handles.push(None),
        }
    }
    if transport.is_none() {
        return Ok(None);
    }
    Ok(Some(SlotRegs {
        combined: count == 1 && segment_count > 1,
        handles,
    }))
}

impl BulkHandle {
    fn eager_now(&self, request_eager: bool) -> bool {
        // Eager mode is only legal when the data is exposed read-only and
        // actually present locally.
        request_eager && self.access == BulkAccess::ReadOnly && !self.virt
    }

    fn secondary_regs(&self) -> Option<&SlotRegs> {
        self.slot_regs(1)
            .filter(|r| r.handles.iter().any(|h| h.is_some()))
    }

    /// Bytes needed by [`BulkHandle::serialize`] with the same flags.
    pub fn serialize_size(&self, request_eager: bool) -> usize {
        let mut size = 4 + 1 + self.segments.len() * 16;

        if let Some(regs) = self.slot_regs(0) {
            size += regs_block_size(regs);
        } else {
            size += 4;
        }
        if let Some(regs) = self.secondary_regs() {
            size += regs_block_size(regs);
        }
        if let Some(bound) = self.bound.lock().as_ref() {
            size += 8 + bound.addr.serialized_len() + 1;
        }
        if self.eager_now(request_eager) {
            size += self.total;
        }
        size
    }

    /// Encodes the descriptor for wire transmission. With `request_eager`,
    /// the payload itself is inlined (read-only descriptors only) so the
    /// peer needs no further transfer.
    pub fn serialize(&self, buf: &mut [u8], request_eager: bool) -> Result<usize> {
        let eager = self.eager_now(request_eager);
        let bound = self.bound.lock();

        let mut flags = self.access.bits();
        if self.has_storage() {
            flags |= DescFlags::ALLOC;
        }
        if eager {
            flags |= DescFlags::EAGER;
        }
        if self.secondary_regs().is_some() {
            flags |= DescFlags::SM;
        }
        if bound.is_some() {
            flags |= DescFlags::BIND;
        }

        let mut enc = Encoder::new(buf);
        enc.put_u32(self.segments.len() as u32)?;
        enc.put_u8(flags.bits())?;

        for seg in &self.segments {
            enc.put_u64(seg.base as u64)?;
            enc.put_u64(seg.len as u64)?;
        }

        match self.slot_regs(0) {
            Some(regs) => encode_regs(&mut enc, regs)?,
            None => enc.put_u32(0)?,
        }
        if let Some(regs) = self.secondary_regs() {
            encode_regs(&mut enc, regs)?;
        }

        if let Some(bound) = bound.as_ref() {
            let addr_len = bound.addr.serialized_len();
            enc.put_u64(addr_len as u64)?;
            if enc.buf.len() < enc.off + addr_len {
                return Err(Error::Overflow("bulk serialize buffer too small"));
            }
            let n = bound.addr.serialize(&mut enc.buf[enc.off..enc.off + addr_len])?;
            enc.off += n;
            enc.put_u8(bound.context_id)?;
        }

        if eager {
            for seg in &self.segments {
                if seg.len == 0 {
                    continue;
                }
                if enc.buf.len() < enc.off + seg.len {
                    return Err(Error::Overflow("bulk serialize buffer too small"));
                }
                // Safety: non-virtual descriptor, segments reference live
                // memory.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        seg.base as *const u8,
                        enc.buf[enc.off..].as_mut_ptr(),
                        seg.len,
                    );
                }
                enc.off += seg.len;
            }
        }

        Ok(enc.off)
    }

    /// Decodes a descriptor serialized by a peer. Without inlined eager
    /// data the result is virtual: segment bases describe the peer's
    /// memory and must only be used as transfer targets.
    pub fn deserialize(class: &Arc<Class>, buf: &[u8]) -> Result<Arc<BulkHandle>> {
        let mut dec = Decoder::new(buf);

        let segment_count = dec.get_u32()? as usize;
        let flags = DescFlags::from_bits_truncate(dec.get_u8()?);
        let access = BulkAccess::from_bits(flags)?;

        let mut segments: SmallVec<[Segment; 4]> = SmallVec::with_capacity(segment_count);
        for _ in 0..segment_count {
            let base = dec.get_u64()? as usize;
            let len = dec.get_u64()? as usize;
            segments.push(Segment { base, len });
        }

        let primary = decode_regs(
            &mut dec,
            Some(&*class.slots()[0].transport),
            segment_count,
        )?;
        let secondary = if flags.contains(DescFlags::SM) {
            decode_regs(
                &mut dec,
                class.slots().get(1).map(|s| &*s.transport),
                segment_count,
            )?
        } else {
            None
        };

        let bound = if flags.contains(DescFlags::BIND) {
            let addr_len = dec.get_u64()? as usize;
            let addr_bytes = dec.take(addr_len)?;
            let (addr, _) = Address::deserialize(class, addr_bytes)?;
            let context_id = dec.get_u8()?;
            Some(BoundInfo { addr, context_id })
        } else {
            None
        };

        let eager = flags.contains(DescFlags::EAGER);
        let mut storage = Vec::new();
        if eager {
            // Materialize the inlined payload into owned storage; segment
            // bases are rewritten to the local copies.
            for seg in segments.iter_mut() {
                if seg.len == 0 {
                    seg.base = 0;
                    continue;
                }
                let bytes = dec.take(seg.len)?;
                let mut copy = bytes.to_vec().into_boxed_slice();
                seg.base = copy.as_mut_ptr() as usize;
                storage.push(copy);
            }
        }

        if dec.remaining() > 0 {
            warn!(
                "{} unconsumed byte(s) after bulk descriptor decode",
                dec.remaining()
            );
        }

        // Registrations from the wire describe the peer's memory; an eager
        // descriptor holds local data instead and needs none.
        let mut regs: SmallVec<[Option<SlotRegs>; 2]> =
            class.slots().iter().map(|_| None).collect();
        if !eager {
            regs[0] = primary;
            if regs.len() > 1 {
                regs[1] = secondary;
            }
        }

        let handle =
            BulkHandle::build_with_regs(class, segments, storage, regs, access, eager, !eager);
        *handle.bound.lock() = bound;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassOptions;
    use crate::context::Context;
    use hermes_na::mem::MemFabric;

    fn test_class(name: &str) -> Arc<Class> {
        let fabric = MemFabric::new();
        let t = fabric.transport(name).unwrap();
        let class = Class::new(t, ClassOptions::default()).unwrap();
        // Nodes hold only a `Weak` to the fabric, so a real application keeps the
        // fabric Arc alive for the lifetime of its transports. Tests have no such
        // owner, so keep it alive for the duration of the process; otherwise
        // address resolution (e.g. deserializing a bound address) fails with
        // "fabric is gone".
        std::mem::forget(fabric);
        class
    }

    #[test]
    fn roundtrip_without_eager_is_virtual() {
        let class = test_class("ser-virt");
        let bulk = BulkHandle::create(&class, &[16, 32, 8], BulkAccess::ReadWrite).unwrap();

        let mut buf = vec![0u8; bulk.serialize_size(false)];
        let n = bulk.serialize(&mut buf, false).unwrap();
        assert_eq!(n, buf.len());

        let back = BulkHandle::deserialize(&class, &buf).unwrap();
        assert!(back.is_virtual());
        assert!(!back.is_eager());
        assert_eq!(back.segment_count(), 3);
        assert_eq!(back.total_size(), 56);
        assert_eq!(back.access_flags(), BulkAccess::ReadWrite);
        // The peer's registrations came over the wire.
        assert!(back.slot_regs(0).is_some());
        // Virtual memory must not be touched locally.
        assert!(back.read(0, &mut [0u8; 4]).is_err());
    }

    #[test]
    fn roundtrip_eager_carries_payload() {
        let class = test_class("ser-eager");
        let bulk = BulkHandle::create(&class, &[20, 30], BulkAccess::ReadOnly).unwrap();
        let data: Vec<u8> = (0..50u8).collect();
        bulk.write(0, &data).unwrap();

        let mut buf = vec![0u8; bulk.serialize_size(true)];
        bulk.serialize(&mut buf, true).unwrap();

        let back = BulkHandle::deserialize(&class, &buf).unwrap();
        assert!(back.is_eager());
        assert!(!back.is_virtual());
        assert_eq!(back.segment_count(), 2);
        let mut out = vec![0u8; 50];
        back.read(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn eager_request_ignored_unless_read_only() {
        let class = test_class("ser-eager-rw");
        let bulk = BulkHandle::create(&class, &[10], BulkAccess::ReadWrite).unwrap();
        let mut buf = vec![0u8; bulk.serialize_size(true)];
        bulk.serialize(&mut buf, true).unwrap();
        let back = BulkHandle::deserialize(&class, &buf).unwrap();
        assert!(!back.is_eager());
        assert!(back.is_virtual());
    }

    #[test]
    fn roundtrip_bound_address() {
        let class = test_class("ser-bound");
        let context = Context::create(&class, 3).unwrap();
        let bulk = BulkHandle::create(&class, &[64], BulkAccess::ReadOnly).unwrap();
        bulk.bind(&context).unwrap();

        let mut buf = vec![0u8; bulk.serialize_size(false)];
        bulk.serialize(&mut buf, false).unwrap();
        let back = BulkHandle::deserialize(&class, &buf).unwrap();
        assert_eq!(back.bound_context_id(), Some(3));
        assert!(back.bound_addr().unwrap().is_self());

        drop((bulk, back));
        context.destroy().unwrap();
    }

    #[test]
    fn short_buffer_fails_with_overflow() {
        let class = test_class("ser-short");
        let bulk = BulkHandle::create(&class, &[16], BulkAccess::ReadOnly).unwrap();
        let mut buf = vec![0u8; bulk.serialize_size(false)];
        bulk.serialize(&mut buf, false).unwrap();

        for cut in [0, 3, 7, buf.len() - 1] {
            assert!(matches!(
                BulkHandle::deserialize(&class, &buf[..cut]),
                Err(Error::Overflow(_))
            ));
        }
        // Short output buffer on encode as well.
        let mut small = vec![0u8; 4];
        assert!(matches!(
            bulk.serialize(&mut small, false),
            Err(Error::Overflow(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let class = test_class("ser-trailing");
        let bulk = BulkHandle::create(&class, &[16], BulkAccess::ReadOnly).unwrap();
        let mut buf = vec![0u8; bulk.serialize_size(false) + 13];
        bulk.serialize(&mut buf, false).unwrap();
        let back = BulkHandle::deserialize(&class, &buf).unwrap();
        assert_eq!(back.total_size(), 16);
    }
}
