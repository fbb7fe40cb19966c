// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Split-virtqueue primitives for shared-memory virtio backends.
//!
//! A [`Virtqueue`] owns the per-queue state the device side needs to consume
//! a driver's split virtqueue: the driver-programmed ring addresses, the
//! last-seen available index and the used-index snapshot taken for interrupt
//! suppression. Descriptor chains are flattened into caller-provided
//! [`ChainBuffer`] spans; buffer addresses are validated through an
//! [`AccessPlatform`] before they are handed out.

pub mod defs;

use std::fmt::Debug;
use std::mem::size_of;
use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use log::error;
use thiserror::Error;
use vm_memory::{Address, ByteValued, Bytes, GuestAddress, GuestMemory};

use crate::defs::{
    VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_RING_INDIRECT_DESC,
    VIRTQ_AVAIL_ELEMENT_SIZE, VIRTQ_AVAIL_RING_HEADER_SIZE, VIRTQ_DESCRIPTOR_SIZE,
    VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE, VIRTQ_MSI_NO_VECTOR,
    VIRTQ_USED_ELEMENT_SIZE, VIRTQ_USED_RING_HEADER_SIZE, VQ_MAX_DESCRIPTORS,
    VRING_AVAIL_F_NO_INTERRUPT,
};

/// Trait for validating and translating guest addresses before the device
/// dereferences them.
pub trait AccessPlatform: Send + Sync + Debug {
    /// Provide a way to translate address ranges.
    fn translate(&self, base: u64, size: u64) -> std::result::Result<u64, std::io::Error>;
}

/// Virtqueue related errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to access guest memory.
    #[error("error accessing guest memory")]
    GuestMemory(#[source] vm_memory::GuestMemoryError),
    /// The driver advertised more descriptors than the ring can hold.
    #[error("available descriptor count {0} out of range for queue size {1}")]
    AvailCountOutOfRange(u16, u16),
    /// A descriptor index points outside its table.
    #[error("descriptor index {0} out of range")]
    InvalidDescriptorIndex(u16),
    /// An indirect descriptor was used without the feature being negotiated.
    #[error("descriptor has forbidden INDIRECT flag")]
    UnexpectedIndirectDescriptor,
    /// An entry of an indirect table is itself marked indirect.
    #[error("indirect descriptor table entry has INDIRECT flag")]
    NestedIndirectDescriptor,
    /// The byte length of an indirect table is zero or not a multiple of the
    /// descriptor size.
    #[error("invalid indirect table length {0:#x}")]
    InvalidIndirectLen(u32),
    /// More than [`VQ_MAX_DESCRIPTORS`] descriptors were walked; the table
    /// most likely contains a cycle.
    #[error("descriptor chain longer than {VQ_MAX_DESCRIPTORS} entries")]
    ChainTooLong,
    /// A guest address failed validation against the mapped region.
    #[error("failed to translate guest address {0:#x}")]
    TranslationFault(u64),
    /// The queue is not enabled or its ring addresses are not resolved.
    #[error("virtqueue is not ready")]
    QueueNotReady,
    /// The driver programmed a zero or non-power-of-two queue size.
    #[error("invalid queue size {0}")]
    InvalidQueueSize(u16),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A virtio split-ring descriptor with C representation.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[allow(clippy::len_without_is_empty)]
impl Descriptor {
    /// Creates a new descriptor.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new(addr: u64, len: u32, flags: u16, next: u16) -> Self {
        Descriptor {
            addr,
            len,
            flags,
            next,
        }
    }

    /// Return the guest physical address of the descriptor buffer.
    pub fn addr(&self) -> GuestAddress {
        GuestAddress(self.addr)
    }

    /// Return the length of the descriptor buffer.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Return the raw flags, including next, write and indirect bits.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Return the value stored in the `next` field of the descriptor.
    pub fn next(&self) -> u16 {
        self.next
    }

    /// Check whether this is an indirect descriptor.
    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }

    /// Check whether the `VIRTQ_DESC_F_NEXT` flag is set.
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

// SAFETY: Descriptor is a POD type with no implicit padding.
unsafe impl ByteValued for Descriptor {}

/// One flattened buffer span produced while walking a descriptor chain.
///
/// The address has already been validated through the queue's
/// [`AccessPlatform`]; the raw descriptor flags are carried along so callers
/// can tell read buffers from write buffers.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainBuffer {
    /// Validated buffer address.
    pub addr: GuestAddress,
    /// Buffer length in bytes.
    pub len: u32,
    /// Raw descriptor flags.
    pub flags: u16,
}

impl ChainBuffer {
    /// Checks if the driver designated this as a write only buffer.
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// Result of a successful [`Virtqueue::pop_chain`] call.
#[derive(Clone, Copy, Debug)]
pub struct PoppedChain {
    /// Index of the chain's head descriptor, to be handed back through
    /// [`Virtqueue::add_used`].
    pub head_index: u16,
    /// Total number of real (non-indirect) descriptors in the chain. This
    /// keeps counting past the capacity of the span buffer, so it may exceed
    /// the number of spans actually stored.
    pub num_bufs: usize,
}

impl PoppedChain {
    /// Whether the chain did not fit in the span buffer supplied to
    /// [`Virtqueue::pop_chain`].
    pub fn overflowed(&self, capacity: usize) -> bool {
        self.num_bufs > capacity
    }
}

/// Represents one element of the used virtqueue ring.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VirtqUsedElem {
    id: u32,
    len: u32,
}

impl VirtqUsedElem {
    /// Create a new `VirtqUsedElem` instance.
    pub fn new(id: u16, len: u32) -> Self {
        VirtqUsedElem {
            id: u32::from(id),
            len,
        }
    }

    /// Descriptor-chain head index recorded in this element.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of bytes written into the chain.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether no bytes were written into the chain.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// SAFETY: VirtqUsedElem is a POD type with no implicit padding.
unsafe impl ByteValued for VirtqUsedElem {}

/// State of one device-side virtqueue.
#[derive(Debug)]
pub struct Virtqueue {
    index: u16,
    max_size: u16,
    size: u16,
    ready: bool,
    allocated: bool,
    desc_gpa: [u32; 2],
    avail_gpa: [u32; 2],
    used_gpa: [u32; 2],
    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,
    next_avail: Wrapping<u16>,
    save_used: Wrapping<u16>,
    vector: u16,
}

impl Virtqueue {
    /// Construct a disabled virtqueue with the given index and maximum size.
    pub fn new(index: u16, max_size: u16) -> Self {
        Virtqueue {
            index,
            max_size,
            size: max_size,
            ready: false,
            allocated: false,
            desc_gpa: [0; 2],
            avail_gpa: [0; 2],
            used_gpa: [0; 2],
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            save_used: Wrapping(0),
            vector: VIRTQ_MSI_NO_VECTOR,
        }
    }

    /// Queue index within the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// The maximum size in elements offered by the device.
    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// The queue size in elements the driver selected.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Configure the queue size for the virtqueue.
    pub fn set_size(&mut self, size: u16) {
        self.size = size;
    }

    /// Whether the queue has been enabled and its ring addresses resolved.
    pub fn ready(&self) -> bool {
        self.ready && self.allocated
    }

    /// Interrupt vector assigned to the queue.
    pub fn vector(&self) -> u16 {
        self.vector
    }

    /// Assign the queue's interrupt vector.
    pub fn set_vector(&mut self, vector: u16) {
        self.vector = vector;
    }

    /// Set descriptor table address halves for the queue.
    pub fn set_desc_table_address(&mut self, low: Option<u32>, high: Option<u32>) {
        if let Some(low) = low {
            self.desc_gpa[0] = low;
        }
        if let Some(high) = high {
            self.desc_gpa[1] = high;
        }
    }

    /// Set available ring address halves for the queue.
    pub fn set_avail_ring_address(&mut self, low: Option<u32>, high: Option<u32>) {
        if let Some(low) = low {
            self.avail_gpa[0] = low;
        }
        if let Some(high) = high {
            self.avail_gpa[1] = high;
        }
    }

    /// Set used ring address halves for the queue.
    pub fn set_used_ring_address(&mut self, low: Option<u32>, high: Option<u32>) {
        if let Some(low) = low {
            self.used_gpa[0] = low;
        }
        if let Some(high) = high {
            self.used_gpa[1] = high;
        }
    }

    /// Guest address halves of the descriptor table, as programmed.
    pub fn desc_table_halves(&self) -> [u32; 2] {
        self.desc_gpa
    }

    /// Guest address halves of the available ring, as programmed.
    pub fn avail_ring_halves(&self) -> [u32; 2] {
        self.avail_gpa
    }

    /// Guest address halves of the used ring, as programmed.
    pub fn used_ring_halves(&self) -> [u32; 2] {
        self.used_gpa
    }

    /// Snapshot of the used index taken by the last interrupt decision.
    pub fn save_used(&self) -> u16 {
        self.save_used.0
    }

    /// Overwrite the used-index snapshot.
    pub fn set_save_used(&mut self, value: u16) {
        self.save_used = Wrapping(value);
    }

    /// The next available-ring slot to be consumed.
    pub fn next_avail(&self) -> u16 {
        self.next_avail.0
    }

    /// Resolve the driver-programmed ring addresses and mark the queue
    /// consumable.
    ///
    /// All three ring addresses are validated with their exact byte sizes.
    /// On any validation failure the queue reverts to the disabled state:
    /// enable never succeeds with unresolved ring pointers.
    pub fn enable(&mut self, translator: &dyn AccessPlatform) -> Result<()> {
        match self.translate_rings(translator) {
            Ok((desc, avail, used)) => {
                self.desc_table = GuestAddress(desc);
                self.avail_ring = GuestAddress(avail);
                self.used_ring = GuestAddress(used);
                // Start at 0 when we use it.
                self.next_avail = Wrapping(0);
                self.save_used = Wrapping(0);
                self.ready = true;
                // The rings must be resolved before the queue is visibly
                // consumable.
                fence(Ordering::SeqCst);
                self.allocated = true;
                Ok(())
            }
            Err(e) => {
                self.ready = false;
                self.allocated = false;
                self.desc_table = GuestAddress(0);
                self.avail_ring = GuestAddress(0);
                self.used_ring = GuestAddress(0);
                error!("queue {} enable failed: {}", self.index, e);
                Err(e)
            }
        }
    }

    fn translate_rings(&self, translator: &dyn AccessPlatform) -> Result<(u64, u64, u64)> {
        if self.size == 0 || self.size & (self.size - 1) != 0 || self.size > self.max_size {
            return Err(Error::InvalidQueueSize(self.size));
        }

        let qsz = u64::from(self.size);
        let desc_gpa = (u64::from(self.desc_gpa[1]) << 32) | u64::from(self.desc_gpa[0]);
        let desc = translator
            .translate(desc_gpa, qsz * VIRTQ_DESCRIPTOR_SIZE as u64)
            .map_err(|_| Error::TranslationFault(desc_gpa))?;

        let avail_gpa = (u64::from(self.avail_gpa[1]) << 32) | u64::from(self.avail_gpa[0]);
        let avail = translator
            .translate(
                avail_gpa,
                VIRTQ_AVAIL_RING_HEADER_SIZE + VIRTQ_AVAIL_ELEMENT_SIZE * (qsz + 1),
            )
            .map_err(|_| Error::TranslationFault(avail_gpa))?;

        let used_gpa = (u64::from(self.used_gpa[1]) << 32) | u64::from(self.used_gpa[0]);
        let used = translator
            .translate(
                used_gpa,
                VIRTQ_USED_RING_HEADER_SIZE + 2 + VIRTQ_USED_ELEMENT_SIZE * qsz,
            )
            .map_err(|_| Error::TranslationFault(used_gpa))?;

        Ok((desc, avail, used))
    }

    /// Reset the queue to its initial, disabled state.
    ///
    /// The driver-selected size is kept; everything else, including the
    /// programmed ring addresses and the interrupt vector, is cleared.
    pub fn reset(&mut self) {
        self.ready = false;
        self.allocated = false;
        self.desc_gpa = [0; 2];
        self.avail_gpa = [0; 2];
        self.used_gpa = [0; 2];
        self.desc_table = GuestAddress(0);
        self.avail_ring = GuestAddress(0);
        self.used_ring = GuestAddress(0);
        self.next_avail = Wrapping(0);
        self.save_used = Wrapping(0);
        self.vector = VIRTQ_MSI_NO_VECTOR;
    }

    /// Read the `idx` field from the available ring.
    pub fn avail_idx<M: GuestMemory>(&self, mem: &M, order: Ordering) -> Result<Wrapping<u16>> {
        let addr = self.avail_ring.unchecked_add(2);

        mem.load(addr, order).map(Wrapping).map_err(Error::GuestMemory)
    }

    /// Read the `idx` field from the used ring.
    pub fn used_idx<M: GuestMemory>(&self, mem: &M, order: Ordering) -> Result<Wrapping<u16>> {
        let addr = self.used_ring.unchecked_add(2);

        mem.load(addr, order).map(Wrapping).map_err(Error::GuestMemory)
    }

    // Value of the used_event field the driver maintains past the available
    // ring.
    fn used_event<M: GuestMemory>(&self, mem: &M, order: Ordering) -> Result<Wrapping<u16>> {
        let offset =
            VIRTQ_AVAIL_RING_HEADER_SIZE + u64::from(self.size) * VIRTQ_AVAIL_ELEMENT_SIZE;
        let addr = self.avail_ring.unchecked_add(offset);

        mem.load(addr, order).map(Wrapping).map_err(Error::GuestMemory)
    }

    /// Whether the driver has made descriptors available that we have not
    /// consumed yet.
    pub fn has_pending<M: GuestMemory>(&self, mem: &M) -> Result<bool> {
        if !self.ready() {
            return Ok(false);
        }
        Ok(self.avail_idx(mem, Ordering::Acquire)? != self.next_avail)
    }

    /// Pop the next available descriptor chain and flatten it into `bufs`.
    ///
    /// Returns `Ok(None)` when the driver has made nothing available. On
    /// success the available index has already been advanced, so the chain
    /// is considered consumed unless it is handed back with
    /// [`Virtqueue::return_chain`].
    ///
    /// Spans beyond the capacity of `bufs` are counted but not stored;
    /// compare [`PoppedChain::num_bufs`] against the capacity to detect the
    /// truncation. The walk fails once [`VQ_MAX_DESCRIPTORS`] descriptors
    /// have been visited, which bounds it even for a cyclic table.
    pub fn pop_chain<M: GuestMemory>(
        &mut self,
        mem: &M,
        translator: &dyn AccessPlatform,
        features: u64,
        bufs: &mut [ChainBuffer],
    ) -> Result<Option<PoppedChain>> {
        if !self.ready() {
            return Err(Error::QueueNotReady);
        }

        // The driver promises not to move avail->idx until the descriptors
        // behind it are fully written, so the unsigned 16-bit difference is
        // the number of chains it has published since we last looked.
        let ndesc = (self.avail_idx(mem, Ordering::Acquire)? - self.next_avail).0;
        if ndesc == 0 {
            return Ok(None);
        }
        if ndesc > self.size {
            return Err(Error::AvailCountOutOfRange(ndesc, self.size));
        }

        let slot = self.next_avail.0 % self.size;
        let head_addr = self
            .avail_ring
            .unchecked_add(VIRTQ_AVAIL_RING_HEADER_SIZE + u64::from(slot) * VIRTQ_AVAIL_ELEMENT_SIZE);
        let head: u16 = mem.load(head_addr, Ordering::Acquire).map_err(Error::GuestMemory)?;
        // Consume the slot up front so the chain can still be handed back
        // before any descriptor is followed.
        self.next_avail += Wrapping(1);

        let mut count: usize = 0;
        let mut next = head;
        loop {
            if count >= VQ_MAX_DESCRIPTORS {
                return Err(Error::ChainTooLong);
            }
            if next >= self.size {
                return Err(Error::InvalidDescriptorIndex(next));
            }
            let desc: Descriptor = mem
                .read_obj(
                    self.desc_table
                        .unchecked_add(u64::from(next) * size_of::<Descriptor>() as u64),
                )
                .map_err(Error::GuestMemory)?;

            if !desc.is_indirect() {
                Self::record(translator, bufs, &mut count, &desc)?;
            } else if features & (1u64 << VIRTIO_F_RING_INDIRECT_DESC) == 0 {
                return Err(Error::UnexpectedIndirectDescriptor);
            } else {
                self.walk_indirect(mem, translator, bufs, &mut count, &desc)?;
            }

            if !desc.has_next() {
                return Ok(Some(PoppedChain {
                    head_index: head,
                    num_bufs: count,
                }));
            }
            next = desc.next();
        }
    }

    // Expand one indirect descriptor table. Entries follow their own `next`
    // links starting at index 0; none of them may be indirect themselves.
    fn walk_indirect<M: GuestMemory>(
        &self,
        mem: &M,
        translator: &dyn AccessPlatform,
        bufs: &mut [ChainBuffer],
        count: &mut usize,
        desc: &Descriptor,
    ) -> Result<()> {
        let n_indir = desc.len() / VIRTQ_DESCRIPTOR_SIZE as u32;
        if desc.len() & 0xf != 0 || n_indir == 0 {
            return Err(Error::InvalidIndirectLen(desc.len()));
        }
        let table = translator
            .translate(desc.addr().raw_value(), u64::from(desc.len()))
            .map_err(|_| Error::TranslationFault(desc.addr().raw_value()))?;
        let table = GuestAddress(table);

        let mut next: u16 = 0;
        loop {
            let entry: Descriptor = mem
                .read_obj(table.unchecked_add(u64::from(next) * size_of::<Descriptor>() as u64))
                .map_err(Error::GuestMemory)?;
            if entry.is_indirect() {
                return Err(Error::NestedIndirectDescriptor);
            }
            Self::record(translator, bufs, count, &entry)?;
            if *count > VQ_MAX_DESCRIPTORS {
                return Err(Error::ChainTooLong);
            }
            if !entry.has_next() {
                return Ok(());
            }
            next = entry.next();
            if u32::from(next) >= n_indir {
                return Err(Error::InvalidDescriptorIndex(next));
            }
        }
    }

    // Record one real descriptor: validate its buffer and store the span if
    // there is room left. The count advances either way.
    fn record(
        translator: &dyn AccessPlatform,
        bufs: &mut [ChainBuffer],
        count: &mut usize,
        desc: &Descriptor,
    ) -> Result<()> {
        let addr = translator
            .translate(desc.addr().raw_value(), u64::from(desc.len()))
            .map_err(|_| Error::TranslationFault(desc.addr().raw_value()))?;
        if let Some(buf) = bufs.get_mut(*count) {
            *buf = ChainBuffer {
                addr: GuestAddress(addr),
                len: desc.len(),
                flags: desc.flags(),
            };
        }
        *count += 1;
        Ok(())
    }

    /// Hand the most recently popped chain back to the available ring.
    ///
    /// Only a single level of undo is supported; this is a decrement of the
    /// consumed-slot position, not a stack.
    pub fn return_chain(&mut self) {
        self.next_avail -= Wrapping(1);
    }

    /// Publish a completed chain to the used ring.
    ///
    /// Writes `{id: head_index, len}` at the current producer slot and
    /// advances the in-memory used index. Signalling is a separate decision,
    /// see [`Virtqueue::needs_signal`].
    pub fn add_used<M: GuestMemory>(&mut self, mem: &M, head_index: u16, len: u32) -> Result<()> {
        if head_index >= self.size {
            error!(
                "attempted to add out of bounds descriptor to used ring: {}",
                head_index
            );
            return Err(Error::InvalidDescriptorIndex(head_index));
        }

        let used_idx: u16 = mem
            .load(self.used_ring.unchecked_add(2), Ordering::Acquire)
            .map_err(Error::GuestMemory)?;
        let slot = used_idx % self.size;
        let addr = self
            .used_ring
            .unchecked_add(VIRTQ_USED_RING_HEADER_SIZE + u64::from(slot) * VIRTQ_USED_ELEMENT_SIZE);
        mem.write_obj(VirtqUsedElem::new(head_index, len), addr)
            .map_err(Error::GuestMemory)?;

        mem.store(
            used_idx.wrapping_add(1),
            self.used_ring.unchecked_add(2),
            Ordering::Release,
        )
        .map_err(Error::GuestMemory)
    }

    /// Decide whether the driver should be interrupted after a batch of
    /// [`Virtqueue::add_used`] calls.
    ///
    /// `used_all_avail` is the caller's snapshot of whether it drained the
    /// available ring. The decision follows the split-ring rules: always
    /// signal on a drained ring when NOTIFY_ON_EMPTY was negotiated, apply
    /// the used_event window test when EVENT_IDX was negotiated, otherwise
    /// signal when the used index moved and the driver did not set
    /// NO_INTERRUPT.
    pub fn needs_signal<M: GuestMemory>(
        &mut self,
        mem: &M,
        features: u64,
        used_all_avail: bool,
    ) -> Result<bool> {
        if !self.ready() {
            return Ok(false);
        }

        // The used-ring writes must be visible before the indices are read,
        // so the driver never observes an interrupt ahead of its data.
        fence(Ordering::SeqCst);

        let old_idx = self.save_used;
        let new_idx = self.used_idx(mem, Ordering::Acquire)?;
        self.save_used = new_idx;

        if used_all_avail && features & (1u64 << VIRTIO_F_NOTIFY_ON_EMPTY) != 0 {
            return Ok(true);
        }
        if features & (1u64 << VIRTIO_F_RING_EVENT_IDX) != 0 {
            let event_idx = self.used_event(mem, Ordering::Acquire)?;
            return Ok((new_idx - event_idx - Wrapping(1)).0 < (new_idx - old_idx).0);
        }

        let flags: u16 = mem
            .load(self.avail_ring, Ordering::Acquire)
            .map_err(Error::GuestMemory)?;
        Ok(new_idx != old_idx && flags & VRING_AVAIL_F_NO_INTERRUPT == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::VIRTIO_F_VERSION_1;
    use vm_memory::GuestMemoryMmap;

    const DESC_TABLE: u64 = 0x1000;
    const AVAIL_RING: u64 = 0x2000;
    const USED_RING: u64 = 0x3000;
    const BUFFERS: u64 = 0x8000;
    const MEM_SIZE: u64 = 0x10000;

    #[derive(Debug)]
    struct LinearTranslator(u64);

    impl AccessPlatform for LinearTranslator {
        fn translate(&self, base: u64, size: u64) -> std::result::Result<u64, std::io::Error> {
            match base.checked_add(size) {
                Some(end) if end <= self.0 => Ok(base),
                _ => Err(std::io::Error::from(std::io::ErrorKind::InvalidInput)),
            }
        }
    }

    fn test_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), MEM_SIZE as usize)]).unwrap()
    }

    fn enabled_queue(size: u16) -> Virtqueue {
        let mut vq = Virtqueue::new(0, size);
        vq.set_size(size);
        vq.set_desc_table_address(Some(DESC_TABLE as u32), Some(0));
        vq.set_avail_ring_address(Some(AVAIL_RING as u32), Some(0));
        vq.set_used_ring_address(Some(USED_RING as u32), Some(0));
        vq.enable(&LinearTranslator(MEM_SIZE)).unwrap();
        vq
    }

    fn write_desc(mem: &GuestMemoryMmap, index: u64, desc: Descriptor) {
        mem.write_obj(desc, GuestAddress(DESC_TABLE + index * 16))
            .unwrap();
    }

    fn set_avail(mem: &GuestMemoryMmap, size: u16, idx: u16, heads: &[(u16, u16)]) {
        for &(slot, head) in heads {
            mem.write_obj(
                head,
                GuestAddress(AVAIL_RING + 4 + 2 * u64::from(slot % size)),
            )
            .unwrap();
        }
        mem.write_obj(idx, GuestAddress(AVAIL_RING + 2)).unwrap();
    }

    fn set_used_event(mem: &GuestMemoryMmap, size: u16, value: u16) {
        mem.write_obj(value, GuestAddress(AVAIL_RING + 4 + 2 * u64::from(size)))
            .unwrap();
    }

    fn used_idx(mem: &GuestMemoryMmap) -> u16 {
        mem.read_obj(GuestAddress(USED_RING + 2)).unwrap()
    }

    #[test]
    fn pop_empty_queue() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];

        assert!(vq
            .pop_chain(&mem, &LinearTranslator(MEM_SIZE), 0, &mut bufs)
            .unwrap()
            .is_none());
    }

    #[test]
    fn avail_index_wraparound() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];
        let translator = LinearTranslator(MEM_SIZE);

        // Three single-descriptor chains published across the 16-bit wrap.
        for i in 0..3u64 {
            write_desc(&mem, i, Descriptor::new(BUFFERS + i * 0x100, 0x100, 0, 0));
        }
        vq.next_avail = Wrapping(0xfffe);
        set_avail(&mem, 8, 1, &[(0xfffe, 0), (0xffff, 1), (0, 2)]);

        for _ in 0..3 {
            let chain = vq
                .pop_chain(&mem, &translator, 0, &mut bufs)
                .unwrap()
                .unwrap();
            assert_eq!(chain.num_bufs, 1);
        }
        assert!(vq.pop_chain(&mem, &translator, 0, &mut bufs).unwrap().is_none());
    }

    #[test]
    fn avail_count_out_of_range() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];

        set_avail(&mem, 8, 9, &[]);
        assert!(matches!(
            vq.pop_chain(&mem, &LinearTranslator(MEM_SIZE), 0, &mut bufs),
            Err(Error::AvailCountOutOfRange(9, 8))
        ));
    }

    #[test]
    fn cyclic_chain_terminates() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];

        // 0 -> 1 -> 0 -> ... never clears the NEXT flag.
        write_desc(
            &mem,
            0,
            Descriptor::new(BUFFERS, 0x10, VIRTQ_DESC_F_NEXT, 1),
        );
        write_desc(
            &mem,
            1,
            Descriptor::new(BUFFERS, 0x10, VIRTQ_DESC_F_NEXT, 0),
        );
        set_avail(&mem, 8, 1, &[(0, 0)]);

        assert!(matches!(
            vq.pop_chain(&mem, &LinearTranslator(MEM_SIZE), 0, &mut bufs),
            Err(Error::ChainTooLong)
        ));
    }

    #[test]
    fn indirect_without_negotiation() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];

        write_desc(
            &mem,
            0,
            Descriptor::new(BUFFERS, 16, VIRTQ_DESC_F_INDIRECT, 0),
        );
        set_avail(&mem, 8, 1, &[(0, 0)]);

        assert!(matches!(
            vq.pop_chain(&mem, &LinearTranslator(MEM_SIZE), 0, &mut bufs),
            Err(Error::UnexpectedIndirectDescriptor)
        ));
    }

    #[test]
    fn indirect_bad_length_not_dereferenced() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];
        let features = 1u64 << VIRTIO_F_RING_INDIRECT_DESC;

        // Table address is out of the mapped region on purpose: a bad length
        // must fail before the table is ever read.
        for bad_len in [24u32, 0u32] {
            write_desc(
                &mem,
                0,
                Descriptor::new(MEM_SIZE + 0x1000, bad_len, VIRTQ_DESC_F_INDIRECT, 0),
            );
            set_avail(&mem, 8, 1, &[(0, 0)]);
            vq.next_avail = Wrapping(0);

            assert!(matches!(
                vq.pop_chain(&mem, &LinearTranslator(MEM_SIZE), features, &mut bufs),
                Err(Error::InvalidIndirectLen(l)) if l == bad_len
            ));
        }
    }

    #[test]
    fn indirect_expansion() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];
        let features = 1u64 << VIRTIO_F_RING_INDIRECT_DESC;
        let table = 0x5000u64;

        for i in 0..3u64 {
            let flags = if i < 2 { VIRTQ_DESC_F_NEXT } else { VIRTQ_DESC_F_WRITE };
            mem.write_obj(
                Descriptor::new(BUFFERS + i * 0x100, 0x100, flags, i as u16 + 1),
                GuestAddress(table + i * 16),
            )
            .unwrap();
        }
        write_desc(
            &mem,
            0,
            Descriptor::new(table, 3 * 16, VIRTQ_DESC_F_INDIRECT, 0),
        );
        set_avail(&mem, 8, 1, &[(0, 0)]);

        let chain = vq
            .pop_chain(&mem, &LinearTranslator(MEM_SIZE), features, &mut bufs)
            .unwrap()
            .unwrap();
        assert_eq!(chain.num_bufs, 3);
        assert_eq!(bufs[0].addr, GuestAddress(BUFFERS));
        assert_eq!(bufs[2].len, 0x100);
        assert!(bufs[2].is_write_only());
    }

    #[test]
    fn nested_indirect_rejected() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];
        let features = 1u64 << VIRTIO_F_RING_INDIRECT_DESC;
        let table = 0x5000u64;

        mem.write_obj(
            Descriptor::new(BUFFERS, 0x100, VIRTQ_DESC_F_INDIRECT, 0),
            GuestAddress(table),
        )
        .unwrap();
        write_desc(
            &mem,
            0,
            Descriptor::new(table, 16, VIRTQ_DESC_F_INDIRECT, 0),
        );
        set_avail(&mem, 8, 1, &[(0, 0)]);

        assert!(matches!(
            vq.pop_chain(&mem, &LinearTranslator(MEM_SIZE), features, &mut bufs),
            Err(Error::NestedIndirectDescriptor)
        ));
    }

    #[test]
    fn buffer_translation_fault() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];

        write_desc(&mem, 0, Descriptor::new(MEM_SIZE, 0x100, 0, 0));
        set_avail(&mem, 8, 1, &[(0, 0)]);

        assert!(matches!(
            vq.pop_chain(&mem, &LinearTranslator(MEM_SIZE), 0, &mut bufs),
            Err(Error::TranslationFault(a)) if a == MEM_SIZE
        ));
    }

    #[test]
    fn capacity_overflow_keeps_counting() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 2];

        for i in 0..3u64 {
            let flags = if i < 2 { VIRTQ_DESC_F_NEXT } else { 0 };
            write_desc(
                &mem,
                i,
                Descriptor::new(BUFFERS + i * 0x100, 0x100, flags, i as u16 + 1),
            );
        }
        set_avail(&mem, 8, 1, &[(0, 0)]);

        let chain = vq
            .pop_chain(&mem, &LinearTranslator(MEM_SIZE), 0, &mut bufs)
            .unwrap()
            .unwrap();
        assert_eq!(chain.num_bufs, 3);
        assert!(chain.overflowed(bufs.len()));
        assert_eq!(bufs[0].addr, GuestAddress(BUFFERS));
        assert_eq!(bufs[1].addr, GuestAddress(BUFFERS + 0x100));
    }

    #[test]
    fn return_chain_rewinds_one_slot() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let mut bufs = [ChainBuffer::default(); 4];
        let translator = LinearTranslator(MEM_SIZE);

        write_desc(&mem, 3, Descriptor::new(BUFFERS, 0x40, 0, 0));
        set_avail(&mem, 8, 1, &[(0, 3)]);

        let first = vq
            .pop_chain(&mem, &translator, 0, &mut bufs)
            .unwrap()
            .unwrap();
        vq.return_chain();
        let second = vq
            .pop_chain(&mem, &translator, 0, &mut bufs)
            .unwrap()
            .unwrap();
        assert_eq!(first.head_index, second.head_index);
    }

    #[test]
    fn used_ring_round_trip() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);

        vq.add_used(&mem, 2, 100).unwrap();

        assert_eq!(used_idx(&mem), 1);
        let elem: VirtqUsedElem = mem.read_obj(GuestAddress(USED_RING + 4)).unwrap();
        assert_eq!(elem.id(), 2);
        assert_eq!(elem.len(), 100);

        // Default path: used index advanced, NO_INTERRUPT unset.
        assert!(vq.needs_signal(&mem, 0, true).unwrap());
        // A second decision without further completions stays quiet.
        assert!(!vq.needs_signal(&mem, 0, true).unwrap());
    }

    #[test]
    fn no_interrupt_flag_suppresses() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);

        mem.write_obj(VRING_AVAIL_F_NO_INTERRUPT, GuestAddress(AVAIL_RING))
            .unwrap();
        vq.add_used(&mem, 1, 8).unwrap();

        assert!(!vq.needs_signal(&mem, 0, true).unwrap());
    }

    #[test]
    fn notify_on_empty_overrides() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let features = 1u64 << VIRTIO_F_NOTIFY_ON_EMPTY;

        // Even with nothing new in the used ring, a drained available ring
        // must signal when NOTIFY_ON_EMPTY is on.
        assert!(vq.needs_signal(&mem, features, true).unwrap());
        assert!(!vq.needs_signal(&mem, features, false).unwrap());
    }

    #[test]
    fn event_idx_suppression() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let features = 1u64 << VIRTIO_F_RING_EVENT_IDX;

        mem.write_obj(6u16, GuestAddress(USED_RING + 2)).unwrap();

        // old = 5, new = 6, used_event = 6: suppressed.
        vq.set_save_used(5);
        set_used_event(&mem, 8, 6);
        assert!(!vq.needs_signal(&mem, features, true).unwrap());

        // old = 5, new = 6, used_event = 5: signalled.
        vq.set_save_used(5);
        set_used_event(&mem, 8, 5);
        assert!(vq.needs_signal(&mem, features, true).unwrap());
    }

    #[test]
    fn event_idx_batched_completions() {
        let mem = test_mem();
        let mut vq = enabled_queue(8);
        let features = (1u64 << VIRTIO_F_RING_EVENT_IDX) | (1u64 << VIRTIO_F_VERSION_1);

        // Three descriptors consumed across two publications; the driver
        // asked to be woken once the third lands.
        set_used_event(&mem, 8, 2);
        vq.add_used(&mem, 0, 0x10).unwrap();
        vq.add_used(&mem, 1, 0x10).unwrap();
        assert!(!vq.needs_signal(&mem, features, false).unwrap());
        vq.add_used(&mem, 2, 0x10).unwrap();
        assert!(vq.needs_signal(&mem, features, true).unwrap());
    }

    #[test]
    fn enable_rejects_out_of_range_rings() {
        let mut vq = Virtqueue::new(0, 8);
        vq.set_size(8);
        vq.set_desc_table_address(Some(DESC_TABLE as u32), Some(0));
        vq.set_avail_ring_address(Some(AVAIL_RING as u32), Some(0));
        vq.set_used_ring_address(Some((MEM_SIZE - 8) as u32), Some(0));

        assert!(matches!(
            vq.enable(&LinearTranslator(MEM_SIZE)),
            Err(Error::TranslationFault(_))
        ));
        assert!(!vq.ready());
    }

    #[test]
    fn enable_rejects_bad_size() {
        let mut vq = Virtqueue::new(0, 8);
        vq.set_size(6);
        assert!(matches!(
            vq.enable(&LinearTranslator(MEM_SIZE)),
            Err(Error::InvalidQueueSize(6))
        ));
    }

    #[test]
    fn reset_clears_state() {
        let mut vq = enabled_queue(8);
        vq.set_vector(3);

        vq.reset();

        assert!(!vq.ready());
        assert_eq!(vq.vector(), VIRTQ_MSI_NO_VECTOR);
        assert_eq!(vq.desc_table_halves(), [0; 2]);
        assert_eq!(vq.next_avail(), 0);
        assert_eq!(vq.save_used(), 0);
    }
}
