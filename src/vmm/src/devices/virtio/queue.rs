// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device side of a split virtqueue.
//!
//! The ring memory belongs to the guest and every value read from it is
//! untrusted. Indices are free running `u16` counters, ring slots are taken
//! modulo the queue size.

use crate::vstate::memory::GuestMemoryMmap;
use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};
use vm_memory::{Bytes, GuestAddress, GuestMemory};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

const DESC_SIZE: u64 = 16;
const USED_ELEM_SIZE: u64 = 8;
// flags and idx in front of the avail and used rings.
const RING_HEADER_SIZE: u64 = 4;

#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum QueueError {
    /// Virtqueue is not ready
    NotReady,
    /// Virtqueue is ready and cannot be reconfigured
    AlreadyReady,
    /// Invalid virtqueue size {0}
    InvalidSize(u16),
    /// Virtqueue area at 0x{0:x} is misaligned or outside guest memory
    InvalidArea(u64),
    /// Available index {avail} is more than a ring ahead of {next}
    AvailIndexOutOfRange { avail: u16, next: u16 },
    /// Descriptor head {0} is out of range
    InvalidHead(u16),
    /// Guest memory access at 0x{0:x} failed
    Memory(u64),
    /// Malformed descriptor chain starting at {0}
    MalformedChain(u16),
    /// Indirect descriptors are not supported
    IndirectNotSupported,
}

/// A descriptor as laid out in the descriptor table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VirtqDesc {
    addr: U64,
    len: U32,
    flags: U16,
    next: U16,
}

impl VirtqDesc {
    pub fn new(addr: u64, len: u32, flags: u16, next: u16) -> Self {
        VirtqDesc {
            addr: U64::new(addr),
            len: U32::new(len),
            flags: U16::new(flags),
            next: U16::new(next),
        }
    }

    /// Guest physical address of the buffer.
    pub fn addr(&self) -> GuestAddress {
        GuestAddress(self.addr.get())
    }

    pub fn len(&self) -> u32 {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn next(&self) -> u16 {
        self.next.get()
    }

    pub fn has_next(&self) -> bool {
        self.flags() & VIRTQ_DESC_F_NEXT != 0
    }

    /// The device writes this buffer, the driver reads it.
    pub fn is_write_only(&self) -> bool {
        self.flags() & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags() & VIRTQ_DESC_F_INDIRECT != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct VirtqUsedElem {
    id: U32,
    len: U32,
}

/// A virtio queue's parameters
#[derive(Clone, Debug)]
pub struct Queue {
    /// The maximal size in elements offered by the device
    max_size: u16,

    /// The queue size in elements the driver selected
    pub size: u16,

    ready: bool,

    /// Guest physical address of descriptor table
    pub desc_table: GuestAddress,

    /// Guest physical address of the available ring
    pub avail_ring: GuestAddress,

    /// Guest physical address of the used ring
    pub used_ring: GuestAddress,

    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
}

impl Queue {
    /// Constructs an empty virtio queue with the given `max_size`
    pub fn new(max_size: u16) -> Queue {
        Queue {
            max_size,
            size: max_size,
            ready: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn next_avail(&self) -> u16 {
        self.next_avail.0
    }

    pub fn next_used(&self) -> u16 {
        self.next_used.0
    }

    fn check_size(&self) -> Result<(), QueueError> {
        let size = self.size;
        if size == 0 || size > self.max_size || !size.is_power_of_two() {
            return Err(QueueError::InvalidSize(size));
        }
        Ok(())
    }

    /// Sets size and ring addresses in one go.
    pub fn configure(
        &mut self,
        size: u16,
        desc_table: GuestAddress,
        avail_ring: GuestAddress,
        used_ring: GuestAddress,
    ) -> Result<(), QueueError> {
        if self.ready {
            return Err(QueueError::AlreadyReady);
        }
        if size == 0 || size > self.max_size || !size.is_power_of_two() {
            return Err(QueueError::InvalidSize(size));
        }
        self.size = size;
        self.desc_table = desc_table;
        self.avail_ring = avail_ring;
        self.used_ring = used_ring;
        Ok(())
    }

    /// Marking the queue ready checks its areas against `mem`. Marking it not
    /// ready drops all progress.
    pub fn set_ready(&mut self, ready: bool, mem: &GuestMemoryMmap) -> Result<(), QueueError> {
        if !ready {
            self.ready = false;
            self.next_avail = Wrapping(0);
            self.next_used = Wrapping(0);
            return Ok(());
        }

        self.check_size()?;
        let size = u64::from(self.size);
        let areas = [
            (self.desc_table, DESC_SIZE * size, 16),
            (self.avail_ring, RING_HEADER_SIZE + 2 * size + 2, 2),
            (self.used_ring, RING_HEADER_SIZE + USED_ELEM_SIZE * size + 2, 4),
        ];
        for (addr, len, align) in areas {
            if addr.0 % align != 0 || !mem.check_range(addr, len as usize) {
                return Err(QueueError::InvalidArea(addr.0));
            }
        }
        self.ready = true;
        Ok(())
    }

    /// Back to the state of a freshly created queue.
    pub fn reset(&mut self) {
        *self = Queue::new(self.max_size);
    }

    fn read_u16(&self, mem: &GuestMemoryMmap, addr: GuestAddress) -> Result<u16, QueueError> {
        mem.read_obj::<u16>(addr)
            .map(u16::from_le)
            .map_err(|_| QueueError::Memory(addr.0))
    }

    /// Pops the next descriptor head published by the driver.
    pub fn poll_available(&mut self, mem: &GuestMemoryMmap) -> Result<Option<u16>, QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        let avail_idx = self.read_u16(mem, GuestAddress(self.avail_ring.0 + 2))?;
        // Ring entries are read after the index that published them.
        fence(Ordering::Acquire);

        let pending = Wrapping(avail_idx) - self.next_avail;
        if pending.0 == 0 {
            return Ok(None);
        }
        if pending.0 > self.size {
            return Err(QueueError::AvailIndexOutOfRange {
                avail: avail_idx,
                next: self.next_avail.0,
            });
        }

        let slot = u64::from(self.next_avail.0 % self.size);
        let head = self.read_u16(
            mem,
            GuestAddress(self.avail_ring.0 + RING_HEADER_SIZE + slot * 2),
        )?;
        self.next_avail += Wrapping(1);
        if head >= self.size {
            return Err(QueueError::InvalidHead(head));
        }
        Ok(Some(head))
    }

    fn read_descriptor(&self, mem: &GuestMemoryMmap, index: u16) -> Result<VirtqDesc, QueueError> {
        let addr = GuestAddress(self.desc_table.0 + u64::from(index) * DESC_SIZE);
        let mut desc = VirtqDesc::default();
        mem.read_slice(desc.as_mut_bytes(), addr)
            .map_err(|_| QueueError::Memory(addr.0))?;
        Ok(desc)
    }

    /// Snapshot of the chain starting at `head`.
    ///
    /// A chain never visits a descriptor twice, so it is at most `size` long.
    pub fn follow_chain(
        &self,
        mem: &GuestMemoryMmap,
        head: u16,
    ) -> Result<Vec<VirtqDesc>, QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        if head >= self.size {
            return Err(QueueError::InvalidHead(head));
        }

        let mut visited = vec![false; usize::from(self.size)];
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            if visited[usize::from(index)] {
                return Err(QueueError::MalformedChain(head));
            }
            visited[usize::from(index)] = true;

            let desc = self.read_descriptor(mem, index)?;
            if desc.is_indirect() {
                return Err(QueueError::IndirectNotSupported);
            }
            chain.push(desc);
            if !desc.has_next() {
                return Ok(chain);
            }
            if desc.next() >= self.size {
                return Err(QueueError::MalformedChain(head));
            }
            index = desc.next();
        }
    }

    /// Returns a chain to the driver with `len` bytes written into it.
    pub fn complete(&mut self, mem: &GuestMemoryMmap, head: u16, len: u32) -> Result<(), QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        if head >= self.size {
            return Err(QueueError::InvalidHead(head));
        }

        let slot = u64::from(self.next_used.0 % self.size);
        let elem_addr =
            GuestAddress(self.used_ring.0 + RING_HEADER_SIZE + slot * USED_ELEM_SIZE);
        let elem = VirtqUsedElem {
            id: U32::new(u32::from(head)),
            len: U32::new(len),
        };
        mem.write_slice(elem.as_bytes(), elem_addr)
            .map_err(|_| QueueError::Memory(elem_addr.0))?;

        self.next_used += Wrapping(1);
        // The element must be visible before the index that publishes it.
        fence(Ordering::Release);
        let idx_addr = GuestAddress(self.used_ring.0 + 2);
        mem.write_obj(self.next_used.0.to_le(), idx_addr)
            .map_err(|_| QueueError::Memory(idx_addr.0))
    }
}
