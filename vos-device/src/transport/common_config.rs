// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! The common configuration register machine.
//!
//! Register layout, at the conventional byte offsets:
//!
//! ```text
//! le32 device_feature_select;     // 0x00 // read-write
//! le32 device_feature;            // 0x04 // read-only for driver
//! le32 driver_feature_select;     // 0x08 // read-write
//! le32 driver_feature;            // 0x0C // read-write
//! le16 msix_config;               // 0x10 // read-write
//! le16 num_queues;                // 0x12 // read-only for driver
//! u8 device_status;               // 0x14 // read-write
//! u8 config_generation;           // 0x15 // read-only for driver
//! le16 queue_select;              // 0x16 // read-write
//! le16 queue_size;                // 0x18 // read-write, power of 2, or 0
//! le16 queue_msix_vector;         // 0x1A // read-write
//! le16 queue_enable;              // 0x1C // read-write (Ready)
//! le16 queue_notify_off;          // 0x1E // read-only for driver
//! le64 queue_desc;                // 0x20 // read-write
//! le64 queue_avail;               // 0x28 // read-write
//! le64 queue_used;                // 0x30 // read-write
//! ```
//!
//! Reads of unknown or mis-sized registers return an all-ones poison value;
//! writes to them, to read-only registers, or through an out-of-range queue
//! selector are rejected with a typed error the caller logs and drops.
//! Access never faults the transport.

use thiserror::Error;
use vos_queue::defs::VIRTQ_MSI_NO_VECTOR;
use vos_queue::{AccessPlatform, Virtqueue};

use crate::device::VosDevice;
use crate::DEVICE_DRIVER_OK;

pub const VIRTIO_PCI_COMMON_DFSELECT: u16 = 0x00;
pub const VIRTIO_PCI_COMMON_DF: u16 = 0x04;
pub const VIRTIO_PCI_COMMON_GFSELECT: u16 = 0x08;
pub const VIRTIO_PCI_COMMON_GF: u16 = 0x0c;
pub const VIRTIO_PCI_COMMON_MSIX: u16 = 0x10;
pub const VIRTIO_PCI_COMMON_NUMQ: u16 = 0x12;
pub const VIRTIO_PCI_COMMON_STATUS: u16 = 0x14;
pub const VIRTIO_PCI_COMMON_CFGGENERATION: u16 = 0x15;
pub const VIRTIO_PCI_COMMON_Q_SELECT: u16 = 0x16;
pub const VIRTIO_PCI_COMMON_Q_SIZE: u16 = 0x18;
pub const VIRTIO_PCI_COMMON_Q_MSIX: u16 = 0x1a;
pub const VIRTIO_PCI_COMMON_Q_ENABLE: u16 = 0x1c;
pub const VIRTIO_PCI_COMMON_Q_NOFF: u16 = 0x1e;
pub const VIRTIO_PCI_COMMON_Q_DESCLO: u16 = 0x20;
pub const VIRTIO_PCI_COMMON_Q_DESCHI: u16 = 0x24;
pub const VIRTIO_PCI_COMMON_Q_AVAILLO: u16 = 0x28;
pub const VIRTIO_PCI_COMMON_Q_AVAILHI: u16 = 0x2c;
pub const VIRTIO_PCI_COMMON_Q_USEDLO: u16 = 0x30;
pub const VIRTIO_PCI_COMMON_Q_USEDHI: u16 = 0x34;

struct ConfigReg {
    offset: u16,
    size: u8,
    ro: bool,
    name: &'static str,
}

// Note: these are in sorted order to make for a fast search.
static MODERN_CONFIG_REGS: &[ConfigReg] = &[
    ConfigReg { offset: VIRTIO_PCI_COMMON_DFSELECT, size: 4, ro: false, name: "DFSELECT" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_DF, size: 4, ro: true, name: "DF" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_GFSELECT, size: 4, ro: false, name: "GFSELECT" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_GF, size: 4, ro: false, name: "GF" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_MSIX, size: 2, ro: false, name: "MSIX" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_NUMQ, size: 2, ro: true, name: "NUMQ" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_STATUS, size: 1, ro: false, name: "STATUS" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_CFGGENERATION, size: 1, ro: true, name: "CFGGENERATION" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_SELECT, size: 2, ro: false, name: "Q_SELECT" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_SIZE, size: 2, ro: false, name: "Q_SIZE" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_MSIX, size: 2, ro: false, name: "Q_MSIX" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_ENABLE, size: 2, ro: false, name: "Q_ENABLE" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_NOFF, size: 2, ro: true, name: "Q_NOFF" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_DESCLO, size: 4, ro: false, name: "Q_DESCLO" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_DESCHI, size: 4, ro: false, name: "Q_DESCHI" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_AVAILLO, size: 4, ro: false, name: "Q_AVAILLO" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_AVAILHI, size: 4, ro: false, name: "Q_AVAILHI" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_USEDLO, size: 4, ro: false, name: "Q_USEDLO" },
    ConfigReg { offset: VIRTIO_PCI_COMMON_Q_USEDHI, size: 4, ro: false, name: "Q_USEDHI" },
];

fn find_reg(offset: u16) -> Option<&'static ConfigReg> {
    MODERN_CONFIG_REGS
        .binary_search_by_key(&offset, |reg| reg.offset)
        .ok()
        .map(|i| &MODERN_CONFIG_REGS[i])
}

/// Why a register write was dropped.
#[derive(Debug, Error)]
pub enum RegAccessError {
    #[error("access to bad register offset/size {offset:#x}/{size}")]
    UnknownRegister { offset: u16, size: u8 },
    #[error("bad access size {size} for register {name}")]
    SizeMismatch { name: &'static str, size: u8 },
    #[error("write to read-only register {0}")]
    ReadOnly(&'static str),
    #[error("selected queue {0} out of range")]
    QueueOutOfRange(u16),
}

/// State behind the common configuration registers.
///
/// Per-queue registers operate on the queue picked by `queue_select`; an
/// out-of-range selector makes them read as zero (or no-vector) and rejects
/// writes.
pub struct CommonConfig {
    pub device_feature_select: u32,
    pub driver_feature_select: u32,
    pub negotiated_features: u64,
    pub msix_config: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
}

impl CommonConfig {
    pub fn new() -> Self {
        CommonConfig {
            device_feature_select: 0,
            driver_feature_select: 0,
            negotiated_features: 0,
            msix_config: VIRTQ_MSI_NO_VECTOR,
            device_status: 0,
            config_generation: 0,
            queue_select: 0,
        }
    }

    fn selected_queue<'a>(&self, queues: &'a [Virtqueue]) -> Option<&'a Virtqueue> {
        queues.get(usize::from(self.queue_select))
    }

    fn selected_queue_mut<'a>(
        &self,
        queues: &'a mut [Virtqueue],
    ) -> Result<&'a mut Virtqueue, RegAccessError> {
        queues
            .get_mut(usize::from(self.queue_select))
            .ok_or(RegAccessError::QueueOutOfRange(self.queue_select))
    }

    /// Read a register. Unknown offsets and mis-sized accesses read as an
    /// all-ones value of the requested width.
    pub fn read(&self, offset: u16, size: u8, queues: &[Virtqueue], device: &dyn VosDevice) -> u32 {
        let poison = match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        };

        let reg = match find_reg(offset) {
            Some(reg) => reg,
            None => {
                warn!("read from bad register offset/size {offset:#x}/{size}");
                return poison;
            }
        };
        if reg.size != size {
            warn!("read from {}: bad size {}", reg.name, size);
            return poison;
        }

        let value = match offset {
            VIRTIO_PCI_COMMON_DFSELECT => self.device_feature_select,
            VIRTIO_PCI_COMMON_DF => {
                // Only 64 bits of features are defined; any further window
                // reads as 0.
                match self.device_feature_select {
                    0 => device.features() as u32,
                    1 => (device.features() >> 32) as u32,
                    _ => 0,
                }
            }
            VIRTIO_PCI_COMMON_GFSELECT => self.driver_feature_select,
            VIRTIO_PCI_COMMON_GF => match self.driver_feature_select {
                0 => self.negotiated_features as u32,
                1 => (self.negotiated_features >> 32) as u32,
                _ => 0,
            },
            VIRTIO_PCI_COMMON_MSIX => u32::from(self.msix_config),
            VIRTIO_PCI_COMMON_NUMQ => queues.len() as u32,
            VIRTIO_PCI_COMMON_STATUS => u32::from(self.device_status),
            VIRTIO_PCI_COMMON_CFGGENERATION => u32::from(self.config_generation),
            VIRTIO_PCI_COMMON_Q_SELECT => u32::from(self.queue_select),
            VIRTIO_PCI_COMMON_Q_SIZE => self
                .selected_queue(queues)
                .map(|q| u32::from(q.size()))
                .unwrap_or(0),
            VIRTIO_PCI_COMMON_Q_MSIX => self
                .selected_queue(queues)
                .map(|q| u32::from(q.vector()))
                .unwrap_or_else(|| u32::from(VIRTQ_MSI_NO_VECTOR)),
            VIRTIO_PCI_COMMON_Q_ENABLE => self
                .selected_queue(queues)
                .map(|q| u32::from(q.ready()))
                .unwrap_or(0),
            VIRTIO_PCI_COMMON_Q_NOFF => u32::from(self.queue_select),
            VIRTIO_PCI_COMMON_Q_DESCLO => self
                .selected_queue(queues)
                .map(|q| q.desc_table_halves()[0])
                .unwrap_or(0),
            VIRTIO_PCI_COMMON_Q_DESCHI => self
                .selected_queue(queues)
                .map(|q| q.desc_table_halves()[1])
                .unwrap_or(0),
            VIRTIO_PCI_COMMON_Q_AVAILLO => self
                .selected_queue(queues)
                .map(|q| q.avail_ring_halves()[0])
                .unwrap_or(0),
            VIRTIO_PCI_COMMON_Q_AVAILHI => self
                .selected_queue(queues)
                .map(|q| q.avail_ring_halves()[1])
                .unwrap_or(0),
            VIRTIO_PCI_COMMON_Q_USEDLO => self
                .selected_queue(queues)
                .map(|q| q.used_ring_halves()[0])
                .unwrap_or(0),
            VIRTIO_PCI_COMMON_Q_USEDHI => self
                .selected_queue(queues)
                .map(|q| q.used_ring_halves()[1])
                .unwrap_or(0),
            _ => poison,
        };

        debug!("read {}: {:#x}", reg.name, value);
        value
    }

    /// Write a register and run its side effects.
    pub fn write(
        &mut self,
        offset: u16,
        size: u8,
        value: u32,
        queues: &mut [Virtqueue],
        device: &mut dyn VosDevice,
        translator: &dyn AccessPlatform,
    ) -> Result<(), RegAccessError> {
        let reg = find_reg(offset).ok_or(RegAccessError::UnknownRegister { offset, size })?;
        if reg.size != size {
            return Err(RegAccessError::SizeMismatch {
                name: reg.name,
                size,
            });
        }
        if reg.ro {
            return Err(RegAccessError::ReadOnly(reg.name));
        }

        debug!("write {}: {:#x}", reg.name, value);

        match offset {
            VIRTIO_PCI_COMMON_DFSELECT => self.device_feature_select = value,
            VIRTIO_PCI_COMMON_GFSELECT => self.driver_feature_select = value,
            VIRTIO_PCI_COMMON_GF => {
                // Feature negotiation closes once the driver declares
                // itself ready.
                if self.device_status & DEVICE_DRIVER_OK != 0 {
                    return Ok(());
                }
                if self.driver_feature_select < 2 {
                    let features = if self.driver_feature_select == 0 {
                        self.negotiated_features &= !0xffff_ffff;
                        device.features() & u64::from(value)
                    } else {
                        self.negotiated_features &= 0xffff_ffff;
                        (u64::from(value) << 32) & device.features()
                    };
                    self.negotiated_features |= features;
                    device.ack_features(self.negotiated_features);
                }
            }
            VIRTIO_PCI_COMMON_MSIX => self.msix_config = value as u16,
            VIRTIO_PCI_COMMON_STATUS => {
                self.device_status = value as u8;
                device.set_status(value as u8);
                if value as u8 == 0 {
                    self.reset(queues, device);
                }
            }
            VIRTIO_PCI_COMMON_Q_SELECT => {
                // The driver is allowed to select an invalid queue; the
                // per-queue registers read as zero until it moves on.
                self.queue_select = value as u16;
            }
            VIRTIO_PCI_COMMON_Q_SIZE => {
                self.selected_queue_mut(queues)?.set_size(value as u16);
            }
            VIRTIO_PCI_COMMON_Q_MSIX => {
                self.selected_queue_mut(queues)?.set_vector(value as u16);
            }
            VIRTIO_PCI_COMMON_Q_ENABLE => {
                let queue = self.selected_queue_mut(queues)?;
                if value & 1 != 0 {
                    // A failed enable leaves the queue disabled; the queue
                    // logs the reason.
                    let _ = queue.enable(translator);
                } else {
                    debug!("ignoring queue_enable write of 0");
                }
            }
            VIRTIO_PCI_COMMON_Q_DESCLO => {
                self.selected_queue_mut(queues)?
                    .set_desc_table_address(Some(value), None);
            }
            VIRTIO_PCI_COMMON_Q_DESCHI => {
                self.selected_queue_mut(queues)?
                    .set_desc_table_address(None, Some(value));
            }
            VIRTIO_PCI_COMMON_Q_AVAILLO => {
                self.selected_queue_mut(queues)?
                    .set_avail_ring_address(Some(value), None);
            }
            VIRTIO_PCI_COMMON_Q_AVAILHI => {
                self.selected_queue_mut(queues)?
                    .set_avail_ring_address(None, Some(value));
            }
            VIRTIO_PCI_COMMON_Q_USEDLO => {
                self.selected_queue_mut(queues)?
                    .set_used_ring_address(Some(value), None);
            }
            VIRTIO_PCI_COMMON_Q_USEDHI => {
                self.selected_queue_mut(queues)?
                    .set_used_ring_address(None, Some(value));
            }
            _ => {}
        }

        Ok(())
    }

    /// Device-wide reset: every queue back to its initial state, negotiated
    /// features and selectors cleared, vectors parked.
    pub fn reset(&mut self, queues: &mut [Virtqueue], device: &mut dyn VosDevice) {
        for queue in queues.iter_mut() {
            queue.reset();
        }
        self.device_feature_select = 0;
        self.driver_feature_select = 0;
        self.negotiated_features = 0;
        self.msix_config = VIRTQ_MSI_NO_VECTOR;
        self.device_status = 0;
        self.config_generation = 0;
        self.queue_select = 0;
        device.reset();
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self::new()
    }
}
