// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory region drivers.
//!
//! A driver owns the mechanics of one kind of shared-memory device: mapping
//! the region, binding eventfds to interrupt vectors, discovering this
//! peer's id and ringing the peer's doorbell. The transport is driver
//! agnostic and only sees the [`ShmemRegion`] a driver hands back.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use thiserror::Error;
use vm_memory::{FileOffset, GuestAddress};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ref};

use crate::GuestMemoryMmap;

/// Ceiling on interrupt vectors a driver will bind.
pub const MAX_VECTORS: usize = 8;

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("cannot open shared memory device {0}")]
    OpenDevice(String, #[source] std::io::Error),
    #[error("cannot query the shared memory region size")]
    RegionSize(#[source] std::io::Error),
    #[error("cannot map the shared memory region")]
    Mmap(#[source] vm_memory::Error),
    #[error("cannot map the register window")]
    MmapRegisters(#[source] std::io::Error),
    #[error("cannot bind interrupt vector {0}")]
    BindVector(u16, #[source] std::io::Error),
}

/// What a driver reports back from a successful open.
pub struct ShmemRegion {
    /// The whole shared region, mapped at offset zero.
    pub mem: GuestMemoryMmap,
    /// Size of the mapping in bytes.
    pub mem_size: u64,
    /// This peer's id on the shared-memory link.
    pub this_id: u16,
    /// Number of eventfds actually bound to interrupt vectors.
    pub nr_vecs: usize,
}

/// Contract between the transport and a shared-memory device driver.
pub trait ShmemDriver: Send {
    /// Driver name, for diagnostics and CLI selection.
    fn name(&self) -> &'static str;

    /// Map the region behind `path` and bind `evt_fds` to interrupt
    /// vectors 0..n.
    fn open(&mut self, path: &Path, evt_fds: &[EventFd]) -> Result<ShmemRegion, ShmemError>;

    /// Ring the peer's doorbell for the given vector.
    fn notify_peer(&self, peer_id: u16, vector: u16);

    /// Release driver-private resources. The region mapping itself is owned
    /// by the transport and unmapped when it drops.
    fn close(&mut self);
}

/// Pick a driver from the device path, the way backends are usually started
/// against a `/dev/ivshm*` node.
pub fn infer_driver(path: &Path) -> Option<Box<dyn ShmemDriver>> {
    if path.to_string_lossy().starts_with("/dev/ivshm") {
        Some(Box::new(IvshmemDriver::new()))
    } else {
        None
    }
}

// ivshmem register window, one 32-bit register each.
const IVSHMEM_BAR0_SIZE: usize = 256;
const IVSHMEM_IVPOS: isize = 2;
const IVSHMEM_DOORBELL: isize = 3;

const IVSHM_IOC_MAGIC: u32 = b'u' as u32;

#[repr(C)]
struct IvshmListenerData {
    vector: i32,
    evt_fd: i32,
}

ioctl_iow_nr!(IVSHM_ADD_LISTENER, IVSHM_IOC_MAGIC, 100, IvshmListenerData);
ioctl_ior_nr!(IVSHM_GET_MMIO_SZ, IVSHM_IOC_MAGIC, 101, u64);

struct MmioMapping {
    base: *mut u32,
}

// SAFETY: the mapping is private to the driver and only touched through
// volatile accesses.
unsafe impl Send for MmioMapping {}

impl Drop for MmioMapping {
    fn drop(&mut self) {
        // SAFETY: base was returned by a successful mmap of this length.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, IVSHMEM_BAR0_SIZE);
        }
    }
}

/// Driver for uio-style ivshmem devices.
///
/// The region node is named `<registers>.<section>`; the register window is
/// found by stripping the suffix. Interrupt vectors are bound with the
/// `IVSHM_ADD_LISTENER` ioctl and the peer is notified through the doorbell
/// register.
pub struct IvshmemDriver {
    mmio: Option<MmioMapping>,
}

impl IvshmemDriver {
    pub fn new() -> Self {
        IvshmemDriver { mmio: None }
    }
}

impl Default for IvshmemDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmemDriver for IvshmemDriver {
    fn name(&self) -> &'static str {
        "ivshmem"
    }

    fn open(&mut self, path: &Path, evt_fds: &[EventFd]) -> Result<ShmemRegion, ShmemError> {
        let region_path = path.to_string_lossy();
        let reg_path = region_path
            .split_once('.')
            .map(|(prefix, _)| prefix)
            .unwrap_or(region_path.as_ref());

        let registers = OpenOptions::new()
            .read(true)
            .write(true)
            .open(reg_path)
            .map_err(|e| ShmemError::OpenDevice(reg_path.to_string(), e))?;
        let region = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ShmemError::OpenDevice(region_path.to_string(), e))?;

        // SAFETY: mapping a fresh region over the register fd; the result is
        // checked against MAP_FAILED before use.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                IVSHMEM_BAR0_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                registers.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ShmemError::MmapRegisters(std::io::Error::last_os_error()));
        }
        let mmio = MmioMapping {
            base: base as *mut u32,
        };

        let mut mem_size = 0u64;
        // SAFETY: the ioctl writes a u64, matching the request definition.
        let ret = unsafe { ioctl_with_mut_ref(&region, IVSHM_GET_MMIO_SZ(), &mut mem_size) };
        if ret < 0 {
            return Err(ShmemError::RegionSize(std::io::Error::last_os_error()));
        }

        let nr_vecs = evt_fds.len().min(MAX_VECTORS);
        for (i, evt) in evt_fds.iter().take(nr_vecs).enumerate() {
            let data = IvshmListenerData {
                vector: i as i32,
                evt_fd: evt.as_raw_fd(),
            };
            // SAFETY: the ioctl reads an IvshmListenerData, matching the
            // request definition.
            let ret = unsafe { ioctl_with_ref(&region, IVSHM_ADD_LISTENER(), &data) };
            if ret < 0 {
                return Err(ShmemError::BindVector(
                    i as u16,
                    std::io::Error::last_os_error(),
                ));
            }
        }

        // SAFETY: ivpos lies within the mapped register window.
        let this_id = unsafe { std::ptr::read_volatile(mmio.base.offset(IVSHMEM_IVPOS)) } as u16;

        let mem = GuestMemoryMmap::from_ranges_with_files(&[(
            GuestAddress(0),
            mem_size as usize,
            Some(FileOffset::new(region, 0)),
        )])
        .map_err(ShmemError::Mmap)?;

        self.mmio = Some(mmio);

        Ok(ShmemRegion {
            mem,
            mem_size,
            this_id,
            nr_vecs,
        })
    }

    fn notify_peer(&self, peer_id: u16, vector: u16) {
        if let Some(mmio) = &self.mmio {
            // SAFETY: the doorbell lies within the mapped register window.
            unsafe {
                std::ptr::write_volatile(
                    mmio.base.offset(IVSHMEM_DOORBELL),
                    (u32::from(peer_id) << 16) | u32::from(vector),
                );
            }
        }
    }

    fn close(&mut self) {
        self.mmio = None;
    }
}

/// Driver for a plain file or tmpfs-backed region.
///
/// There is no doorbell and no interrupt binding behind a regular file, so
/// peer notifications are dropped with a debug log. Useful for loopback
/// development against a frontend polling the same file.
pub struct MmapDriver {
    this_id: u16,
}

impl MmapDriver {
    pub fn new(this_id: u16) -> Self {
        MmapDriver { this_id }
    }
}

impl ShmemDriver for MmapDriver {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn open(&mut self, path: &Path, evt_fds: &[EventFd]) -> Result<ShmemRegion, ShmemError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ShmemError::OpenDevice(path.display().to_string(), e))?;
        let mem_size = file.metadata().map_err(ShmemError::RegionSize)?.len();
        let mem = GuestMemoryMmap::from_ranges_with_files(&[(
            GuestAddress(0),
            mem_size as usize,
            Some(FileOffset::new(file, 0)),
        )])
        .map_err(ShmemError::Mmap)?;

        Ok(ShmemRegion {
            mem,
            mem_size,
            this_id: self.this_id,
            nr_vecs: evt_fds.len().min(MAX_VECTORS),
        })
    }

    fn notify_peer(&self, peer_id: u16, vector: u16) {
        debug!("no doorbell behind a file mapping, dropping notification for peer {peer_id} vector {vector}");
    }

    fn close(&mut self) {}
}
