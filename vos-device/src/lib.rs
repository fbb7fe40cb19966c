// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Virtio-over-shared-memory backend building blocks: the device adapter
//! contract, shared-memory region drivers and the transport that bridges a
//! frontend's register writes and queue kicks to a device implementation.

#[macro_use]
extern crate log;
#[macro_use]
extern crate vmm_sys_util;

pub mod device;
pub mod epoll_helper;
pub mod rng;
pub mod shmem;
pub mod transport;

pub use self::device::*;
pub use self::epoll_helper::*;
pub use self::shmem::*;
pub use self::transport::*;

/// Guest memory view over the shared region, mapped at offset zero.
pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;

/// Device status bits written by the driver into the status register.
pub const DEVICE_ACKNOWLEDGE: u8 = 0x01;
pub const DEVICE_DRIVER: u8 = 0x02;
pub const DEVICE_DRIVER_OK: u8 = 0x04;
pub const DEVICE_FEATURES_OK: u8 = 0x08;
pub const DEVICE_FAILED: u8 = 0x80;
