// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Typed accessors over the shared-memory wire header.
//!
//! Both peers agree on this little-endian layout at the start of the region:
//!
//! ```text
//! 0x00  le32 revision
//! 0x04  le32 size                  header plus device config blob
//! 0x08  le32 device_id
//! 0x0c  le32 vendor_id
//! 0x10  le32 write_transaction    (alias: le16 write_offset, le16 write_size)
//! 0x14  u8   config_event
//! 0x15  u8   queue_event
//! 0x16  u8[2] reserved
//! 0x18  le32 frontend_status      (alias: le16 flags, le16 id)
//! 0x1c  le32 backend_status       (alias: le16 flags, le16 id)
//! 0x20  common configuration registers (0x38 bytes)
//! 0x58  device-specific config blob
//! ```
//!
//! The overlapping interpretations of the 32-bit fields are expressed as
//! paired accessors instead of unions; every access is bounds checked
//! against the mapped region.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use vm_memory::{Bytes, GuestAddress, GuestMemoryError};

use crate::GuestMemoryMmap;

/// Size of the fixed part of the header.
pub const HEADER_SIZE: u64 = 0x58;
/// Offset of the embedded common configuration register block.
pub const COMMON_CONFIG_OFFSET: u64 = 0x20;
/// Offset of the device-specific config blob.
pub const DEVICE_CONFIG_OFFSET: u64 = 0x58;

/// Flag a peer sets in its status word to announce itself.
pub const PEER_FLAG_PRESENT: u16 = 0x0001;

const REVISION: u64 = 0x00;
const SIZE: u64 = 0x04;
const DEVICE_ID: u64 = 0x08;
const VENDOR_ID: u64 = 0x0c;
const WRITE_TRANSACTION: u64 = 0x10;
const WRITE_OFFSET: u64 = 0x10;
const WRITE_SIZE: u64 = 0x12;
const CONFIG_EVENT: u64 = 0x14;
const QUEUE_EVENT: u64 = 0x15;
const FRONTEND_FLAGS: u64 = 0x18;
const FRONTEND_ID: u64 = 0x1a;
const BACKEND_STATUS: u64 = 0x1c;

type Result<T> = std::result::Result<T, GuestMemoryError>;

/// Accessor over the header at the start of the shared region.
pub struct ShmemHeader {
    mem: Arc<GuestMemoryMmap>,
}

impl ShmemHeader {
    pub fn new(mem: Arc<GuestMemoryMmap>) -> Self {
        ShmemHeader { mem }
    }

    /// Zero the fixed part of the header.
    pub fn zero(&self) -> Result<()> {
        self.mem
            .write_slice(&[0u8; HEADER_SIZE as usize], GuestAddress(0))
    }

    pub fn set_revision(&self, revision: u32) -> Result<()> {
        self.mem
            .store(revision, GuestAddress(REVISION), Ordering::Release)
    }

    pub fn set_size(&self, size: u32) -> Result<()> {
        self.mem.store(size, GuestAddress(SIZE), Ordering::Release)
    }

    pub fn set_device_id(&self, device_id: u32) -> Result<()> {
        self.mem
            .store(device_id, GuestAddress(DEVICE_ID), Ordering::Release)
    }

    pub fn set_vendor_id(&self, vendor_id: u32) -> Result<()> {
        self.mem
            .store(vendor_id, GuestAddress(VENDOR_ID), Ordering::Release)
    }

    /// The register-write mailbox as a single word; non-zero means a write
    /// is pending.
    pub fn write_transaction(&self) -> Result<u32> {
        self.mem
            .load(GuestAddress(WRITE_TRANSACTION), Ordering::Acquire)
    }

    /// The mailbox interpreted as target offset and access size.
    pub fn write_offset_size(&self) -> Result<(u16, u16)> {
        let offset = self.mem.load(GuestAddress(WRITE_OFFSET), Ordering::Acquire)?;
        let size = self.mem.load(GuestAddress(WRITE_SIZE), Ordering::Acquire)?;
        Ok((offset, size))
    }

    /// Release the mailbox back to the frontend.
    pub fn clear_write_transaction(&self) -> Result<()> {
        self.mem
            .store(0u32, GuestAddress(WRITE_TRANSACTION), Ordering::Release)
    }

    /// Read the value the frontend staged at `offset` in the header, with
    /// the access width it announced. Unsupported widths read as all-ones.
    pub fn read_value(&self, offset: u16, size: u16) -> Result<u32> {
        let addr = GuestAddress(u64::from(offset));
        match size {
            1 => Ok(u32::from(self.mem.load::<u8>(addr, Ordering::Acquire)?)),
            2 => Ok(u32::from(self.mem.load::<u16>(addr, Ordering::Acquire)?)),
            4 => self.mem.load::<u32>(addr, Ordering::Acquire),
            _ => Ok(0xffff_ffff),
        }
    }

    pub fn set_config_event(&self, value: u8) -> Result<()> {
        self.mem
            .store(value, GuestAddress(CONFIG_EVENT), Ordering::Release)
    }

    pub fn set_queue_event(&self, value: u8) -> Result<()> {
        self.mem
            .store(value, GuestAddress(QUEUE_EVENT), Ordering::Release)
    }

    /// The frontend's announcement word as (flags, id).
    pub fn frontend_status(&self) -> Result<(u16, u16)> {
        let flags = self
            .mem
            .load(GuestAddress(FRONTEND_FLAGS), Ordering::Acquire)?;
        let id = self.mem.load(GuestAddress(FRONTEND_ID), Ordering::Acquire)?;
        Ok((flags, id))
    }

    /// Publish this peer's identity word.
    pub fn set_backend_status(&self, flags: u16, id: u16) -> Result<()> {
        let status = (u32::from(id) << 16) | u32::from(flags);
        self.mem
            .store(status, GuestAddress(BACKEND_STATUS), Ordering::Release)
    }

    /// Mirror a 16-bit common configuration register into the header.
    pub fn set_common_config_u16(&self, reg: u16, value: u16) -> Result<()> {
        self.mem.store(
            value,
            GuestAddress(COMMON_CONFIG_OFFSET + u64::from(reg)),
            Ordering::Release,
        )
    }

    /// Mirror a 32-bit common configuration register into the header.
    pub fn set_common_config_u32(&self, reg: u16, value: u32) -> Result<()> {
        self.mem.store(
            value,
            GuestAddress(COMMON_CONFIG_OFFSET + u64::from(reg)),
            Ordering::Release,
        )
    }

    /// Copy the device-specific config blob behind the fixed header.
    pub fn write_device_config(&self, blob: &[u8]) -> Result<()> {
        self.mem
            .write_slice(blob, GuestAddress(DEVICE_CONFIG_OFFSET))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> (Arc<GuestMemoryMmap>, ShmemHeader) {
        let mem =
            Arc::new(GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap());
        (mem.clone(), ShmemHeader::new(mem))
    }

    #[test]
    fn wire_layout() {
        let (mem, hdr) = header();

        hdr.set_revision(1).unwrap();
        hdr.set_size(0x60).unwrap();
        hdr.set_device_id(0x1044).unwrap();
        hdr.set_vendor_id(0x1af4).unwrap();
        hdr.set_backend_status(PEER_FLAG_PRESENT, 3).unwrap();

        assert_eq!(mem.read_obj::<u32>(GuestAddress(0x00)).unwrap(), 1);
        assert_eq!(mem.read_obj::<u32>(GuestAddress(0x04)).unwrap(), 0x60);
        assert_eq!(mem.read_obj::<u32>(GuestAddress(0x08)).unwrap(), 0x1044);
        assert_eq!(mem.read_obj::<u32>(GuestAddress(0x0c)).unwrap(), 0x1af4);
        assert_eq!(
            mem.read_obj::<u32>(GuestAddress(0x1c)).unwrap(),
            (3 << 16) | 1
        );
    }

    #[test]
    fn mailbox_aliases() {
        let (mem, hdr) = header();

        // Writing the two halves is the same word the packed view reads.
        mem.write_obj(0x36u16, GuestAddress(0x10)).unwrap();
        mem.write_obj(0x2u16, GuestAddress(0x12)).unwrap();

        assert_eq!(hdr.write_transaction().unwrap(), 0x0002_0036);
        assert_eq!(hdr.write_offset_size().unwrap(), (0x36, 2));

        hdr.clear_write_transaction().unwrap();
        assert_eq!(hdr.write_transaction().unwrap(), 0);
    }

    #[test]
    fn staged_value_widths() {
        let (mem, hdr) = header();

        mem.write_obj(0xa1b2_c3d4u32, GuestAddress(0x40)).unwrap();

        assert_eq!(hdr.read_value(0x40, 1).unwrap(), 0xd4);
        assert_eq!(hdr.read_value(0x40, 2).unwrap(), 0xc3d4);
        assert_eq!(hdr.read_value(0x40, 4).unwrap(), 0xa1b2_c3d4);
        assert_eq!(hdr.read_value(0x40, 3).unwrap(), 0xffff_ffff);
    }

    #[test]
    fn frontend_announcement() {
        let (mem, hdr) = header();

        assert_eq!(hdr.frontend_status().unwrap(), (0, 0));
        mem.write_obj((7u32 << 16) | 1, GuestAddress(0x18)).unwrap();
        assert_eq!(hdr.frontend_status().unwrap(), (1, 7));
    }
}
