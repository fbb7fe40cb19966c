// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use thiserror::Error;
use vos_queue::{AccessPlatform, Virtqueue};

use crate::GuestMemoryMmap;

/// Type of interrupt the transport raises toward the frontend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtioInterruptType {
    /// The device-specific configuration changed.
    Config,
    /// A used ring advanced on the given queue.
    Queue(u16),
}

/// Errors a device implementation may surface from its queue handler.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A virtqueue operation failed.
    #[error("virtqueue error")]
    Queue(#[from] vos_queue::Error),
    /// Device-specific I/O failed.
    #[error("device I/O error")]
    Io(#[from] std::io::Error),
}

/// Contract a concrete virtio device implements to be driven by the
/// shared-memory transport.
///
/// The transport owns the virtqueues and all register state; the device owns
/// every device-specific semantic. Device-specific configuration bytes are
/// never interpreted by the transport, they are passed through
/// [`VosDevice::read_config`] and [`VosDevice::write_config`] verbatim.
pub trait VosDevice: Send {
    /// The virtio device type.
    fn device_type(&self) -> u32;

    /// The maximum size of each queue that this device supports.
    fn queue_max_sizes(&self) -> &[u16];

    /// The set of feature bits that this device offers.
    fn features(&self) -> u64 {
        0
    }

    /// Called with the full negotiated feature set each time the driver
    /// completes a feature word write. Later calls replace, not extend, the
    /// set seen by earlier ones.
    fn ack_features(&mut self, _negotiated: u64) {}

    /// Size in bytes of the device-specific configuration blob.
    fn config_size(&self) -> usize {
        0
    }

    /// Reads this device configuration space at `offset`.
    fn read_config(&self, _offset: u64, _data: &mut [u8]) {
        warn!(
            "no readable configuration fields for device type {}",
            self.device_type()
        );
    }

    /// Writes to this device configuration space at `offset`.
    fn write_config(&mut self, _offset: u64, _data: &[u8]) {
        warn!(
            "no writable configuration fields for device type {}",
            self.device_type()
        );
    }

    /// Observe a device-status byte written by the driver.
    fn set_status(&mut self, _status: u8) {}

    /// Device-specific reset, invoked when the driver writes status zero.
    fn reset(&mut self) {}

    /// Consume pending descriptor chains on `queue`.
    ///
    /// Returns whether the work published to the used ring asks for a queue
    /// interrupt; the transport raises it. The queue must only be touched
    /// from the transport's dispatch thread.
    fn queue_notify(
        &mut self,
        mem: &GuestMemoryMmap,
        translator: &dyn AccessPlatform,
        queue: &mut Virtqueue,
    ) -> Result<bool, DeviceError>;
}
