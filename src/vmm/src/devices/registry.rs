// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Routes guest MMIO accesses to the device owning the address.

use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A device reachable through a window of guest physical addresses.
///
/// Offsets are relative to the base the device was registered at. The width
/// of the access is the length of `data`.
pub trait MmioDevice: Send {
    fn read(&mut self, offset: u64, data: &mut [u8]);

    fn write(&mut self, offset: u64, data: &[u8]);

    /// Returns the device to its power-on state.
    fn reset(&mut self);

    /// Hands host console input to the device. Returns false when the device
    /// does not take input.
    fn enqueue_input(&mut self, data: &[u8]) -> bool {
        let _ = data;
        false
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Device ranges can't be empty.
    #[error("Cannot register a zero sized range at 0x{0:x}")]
    ZeroSizedRange(u64),
    /// The range wraps around the address space.
    #[error("Range 0x{base:x}+0x{size:x} overflows the address space")]
    Overflow { base: u64, size: u64 },
    /// The new range intersects a registered one.
    #[error("Range 0x{base:x}+0x{size:x} overlaps an existing device")]
    Overlap { base: u64, size: u64 },
}

struct Entry {
    size: u64,
    device: Arc<Mutex<dyn MmioDevice>>,
}

/// Set of non overlapping `[base, base + size)` ranges and their owners.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u64, Entry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    pub fn register(
        &mut self,
        base: u64,
        size: u64,
        device: Arc<Mutex<dyn MmioDevice>>,
    ) -> Result<(), RegistryError> {
        if size == 0 {
            return Err(RegistryError::ZeroSizedRange(base));
        }
        let end = base
            .checked_add(size)
            .ok_or(RegistryError::Overflow { base, size })?;

        // Only the closest range below and the first one above can intersect.
        let below = self.devices.range(..=base).next_back();
        let above = self.devices.range(base..).next();
        let overlaps = below.map_or(false, |(b, e)| base < b + e.size)
            || above.map_or(false, |(b, _)| *b < end);
        if overlaps {
            return Err(RegistryError::Overlap { base, size });
        }

        self.devices.insert(base, Entry { size, device });
        Ok(())
    }

    /// Owner of `addr` and the offset of `addr` inside its range.
    fn lookup(&self, addr: u64) -> Option<(u64, &Entry)> {
        let (base, entry) = self.devices.range(..=addr).next_back()?;
        let offset = addr - base;
        if offset < entry.size {
            Some((offset, entry))
        } else {
            None
        }
    }

    pub fn device_at(&self, addr: u64) -> Option<Arc<Mutex<dyn MmioDevice>>> {
        self.lookup(addr).map(|(_, entry)| entry.device.clone())
    }

    /// Forwards an access to its owner. Returns false when no device covers
    /// every byte of `addr..addr + data.len()`.
    pub fn dispatch(&self, addr: u64, is_write: bool, data: &mut [u8]) -> bool {
        let (offset, entry) = match self.lookup(addr) {
            Some(found) => found,
            None => return false,
        };
        if offset + data.len() as u64 > entry.size {
            debug!(
                "mmio access 0x{:x}+{} crosses the end of its device range",
                addr,
                data.len()
            );
            return false;
        }

        let mut device = entry
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if is_write {
            device.write(offset, data);
        } else {
            device.read(offset, data);
        }
        true
    }

    pub fn reset_all(&self) {
        for entry in self.devices.values() {
            entry
                .device
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset();
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
