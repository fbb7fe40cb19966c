// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! The shared-memory transport: the wire header, the common configuration
//! register machine and the backend object driving both.

pub mod common_config;
pub mod header;
pub mod shmem_device;

pub use common_config::{CommonConfig, RegAccessError};
pub use header::ShmemHeader;
pub use shmem_device::{LinearTranslator, ShmemTransport, TransportError};
