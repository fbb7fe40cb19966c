// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io;
use std::io::Read;

use vm_memory::Bytes;
use vos_queue::defs::VIRTIO_F_VERSION_1;
use vos_queue::{AccessPlatform, ChainBuffer, Virtqueue};

use crate::device::{DeviceError, VosDevice};
use crate::GuestMemoryMmap;

const QUEUE_SIZE: u16 = 256;
const QUEUE_SIZES: &[u16] = &[QUEUE_SIZE];
const VIRTIO_ID_RNG: u32 = 4;

/// Virtio device exposing entropy to the frontend.
pub struct Rng {
    random_file: File,
    acked_features: u64,
}

impl Rng {
    /// Create a new virtio rng device that gets random data from `path`,
    /// usually /dev/urandom.
    pub fn new(path: &str) -> io::Result<Rng> {
        let random_file = File::open(path)?;
        Ok(Rng {
            random_file,
            acked_features: 0,
        })
    }
}

impl VosDevice for Rng {
    fn device_type(&self) -> u32 {
        VIRTIO_ID_RNG
    }

    fn queue_max_sizes(&self) -> &[u16] {
        QUEUE_SIZES
    }

    fn features(&self) -> u64 {
        1u64 << VIRTIO_F_VERSION_1
    }

    fn ack_features(&mut self, negotiated: u64) {
        self.acked_features = negotiated;
    }

    fn queue_notify(
        &mut self,
        mem: &GuestMemoryMmap,
        translator: &dyn AccessPlatform,
        queue: &mut Virtqueue,
    ) -> Result<bool, DeviceError> {
        let mut bufs = vec![ChainBuffer::default(); usize::from(queue.size())];
        let mut used_any = false;

        while let Some(chain) =
            queue.pop_chain(mem, translator, self.acked_features, &mut bufs)?
        {
            let mut len = 0;

            for buf in bufs.iter().take(chain.num_bufs.min(bufs.len())) {
                // Drivers can only read from the random device.
                if !buf.is_write_only() {
                    continue;
                }
                let mut data = vec![0u8; buf.len as usize];
                self.random_file.read_exact(&mut data)?;
                mem.write_slice(&data, buf.addr)
                    .map_err(vos_queue::Error::GuestMemory)?;
                len += buf.len;
            }

            queue.add_used(mem, chain.head_index, len)?;
            used_any = true;
        }

        if used_any {
            Ok(queue.needs_signal(mem, self.acked_features, true)?)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestAddress;
    use vos_queue::defs::VIRTQ_DESC_F_WRITE;
    use vos_queue::Descriptor;

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

    #[test]
    fn fills_write_only_buffers() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), MEM_SIZE as usize)]).unwrap();
        let translator = LinearTranslator(MEM_SIZE);
        let mut queue = Virtqueue::new(0, 4);
        queue.set_size(4);
        queue.set_desc_table_address(Some(0x1000), Some(0));
        queue.set_avail_ring_address(Some(0x2000), Some(0));
        queue.set_used_ring_address(Some(0x3000), Some(0));
        queue.enable(&translator).unwrap();

        for i in 0..2u64 {
            mem.write_obj(
                Descriptor::new(0x8000 + i * 0x100, 0x20, VIRTQ_DESC_F_WRITE, 0),
                GuestAddress(0x1000 + i * 16),
            )
            .unwrap();
            mem.write_obj(i as u16, GuestAddress(0x2004 + i * 2)).unwrap();
        }
        mem.write_obj(2u16, GuestAddress(0x2002)).unwrap();

        let mut rng = Rng::new("/dev/urandom").unwrap();
        let signal = rng.queue_notify(&mem, &translator, &mut queue).unwrap();

        assert!(signal);
        let used_idx: u16 = mem.read_obj(GuestAddress(0x3002)).unwrap();
        assert_eq!(used_idx, 2);
        let first: vos_queue::VirtqUsedElem = mem.read_obj(GuestAddress(0x3004)).unwrap();
        assert_eq!(first.id(), 0);
        assert_eq!(first.len(), 0x20);
    }
}
