// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest physical memory: host-backed regions registered as kernel memory
//! slots, with address translation and bounds-checked access.

use crate::arch;
use crate::vstate::hypervisor::{Hypervisor, HypervisorError};
use log::{debug, info, warn};
use std::sync::Arc;
use vm_memory::mmap::{MmapRegionBuilder, MmapRegionError};
use vm_memory::{Bytes, GuestAddress};

pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;
pub type GuestRegionMmap = vm_memory::GuestRegionMmap<()>;

/// Errors associated with guest memory management.
#[derive(Debug, thiserror::Error)]
pub enum MemoryManagerError {
    /// Base or size of a region is not page aligned, or the size is zero.
    #[error("Region at 0x{addr:x} of size 0x{size:x} is not page aligned or empty")]
    Alignment { addr: u64, size: u64 },
    /// The region ends past the guest physical address space.
    #[error("Region at 0x{addr:x} of size 0x{size:x} overflows the address space")]
    OutOfRange { addr: u64, size: u64 },
    /// The region intersects an existing one.
    #[error("Region at 0x{addr:x} of size 0x{size:x} overlaps an existing region")]
    Overlap { addr: u64, size: u64 },
    /// The number of configured slots is bigger than maximum reported by the kernel.
    #[error("the number of configured slots is bigger than maximum reported by KVM")]
    NotEnoughMemorySlots,
    /// Cannot allocate the host backing of a region.
    #[error("Cannot allocate guest memory: {0}")]
    Allocate(MmapRegionError),
    /// Cannot build the guest memory collection.
    #[error("Invalid guest memory layout: {0}")]
    Layout(vm_memory::mmap::Error),
    /// Cannot set memory region.
    #[error("Cannot set memory region: {0}")]
    SetUserMemoryRegion(HypervisorError),
    /// The guest address belongs to no region.
    #[error("Guest address 0x{0:x} is not mapped")]
    NotMapped(u64),
    /// Part of the range belongs to no region.
    #[error("Guest range 0x{addr:x}+0x{len:x} is not fully mapped")]
    UnmappedAddress { addr: u64, len: usize },
    /// Guest memory was already released.
    #[error("Guest memory was already torn down")]
    AlreadyTornDown,
}

/// A registered region of guest physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub guest_base: u64,
    pub size: u64,
    pub host_base: u64,
    pub slot: u32,
}

impl MemoryRegion {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_base && addr - self.guest_base < self.size
    }

    fn overlaps(&self, addr: u64, size: u64) -> bool {
        addr < self.guest_base + self.size && self.guest_base < addr + size
    }
}

pub struct GuestMemoryManager {
    hypervisor: Arc<dyn Hypervisor>,
    guest_memory: GuestMemoryMmap,
    regions: Vec<MemoryRegion>,
    torn_down: bool,
}

impl GuestMemoryManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        GuestMemoryManager {
            hypervisor,
            guest_memory: GuestMemoryMmap::default(),
            regions: Vec::new(),
            torn_down: false,
        }
    }

    /// Allocates `size` bytes of anonymous host memory and maps it at
    /// `guest_addr`. On failure nothing changes.
    pub fn add_region(
        &mut self,
        guest_addr: u64,
        size: u64,
    ) -> Result<MemoryRegion, MemoryManagerError> {
        use MemoryManagerError::*;

        if self.torn_down {
            return Err(AlreadyTornDown);
        }
        if size == 0 || !arch::is_page_aligned(guest_addr) || !arch::is_page_aligned(size) {
            return Err(Alignment {
                addr: guest_addr,
                size,
            });
        }
        if guest_addr.checked_add(size).is_none() {
            return Err(OutOfRange {
                addr: guest_addr,
                size,
            });
        }
        if self.regions.iter().any(|r| r.overlaps(guest_addr, size)) {
            return Err(Overlap {
                addr: guest_addr,
                size,
            });
        }
        if self.regions.len() >= self.hypervisor.max_memory_slots() {
            return Err(NotEnoughMemorySlots);
        }

        let mapping = MmapRegionBuilder::new(size as usize)
            .with_mmap_prot(libc::PROT_READ | libc::PROT_WRITE)
            .with_mmap_flags(libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE)
            .build()
            .map_err(Allocate)?;
        let region = GuestRegionMmap::new(mapping, GuestAddress(guest_addr)).map_err(Layout)?;
        let host_base = region.as_ptr() as u64;
        let guest_memory = self
            .guest_memory
            .insert_region(Arc::new(region))
            .map_err(Layout)?;

        let slot = self.regions.len() as u32;
        // SAFETY: the mapping is kept alive by `guest_memory` until the slot
        // is removed in `teardown`.
        unsafe {
            self.hypervisor
                .set_user_memory_region(slot, guest_addr, size, host_base)
        }
        .map_err(SetUserMemoryRegion)?;

        let region = MemoryRegion {
            guest_base: guest_addr,
            size,
            host_base,
            slot,
        };
        debug!(
            "guest memory slot {}: 0x{:x}+0x{:x} at host 0x{:x}",
            slot, guest_addr, size, host_base
        );
        self.guest_memory = guest_memory;
        self.regions.push(region);
        Ok(region)
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// View handed to devices. Regions added later are not visible through
    /// clones taken before.
    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.guest_memory
    }

    pub fn translate(&self, guest_addr: u64) -> Result<u64, MemoryManagerError> {
        self.regions
            .iter()
            .find(|r| r.contains(guest_addr))
            .map(|r| r.host_base + (guest_addr - r.guest_base))
            .ok_or(MemoryManagerError::NotMapped(guest_addr))
    }

    /// Fails unless every byte of `guest_addr..guest_addr + len` is mapped.
    fn check_range(&self, guest_addr: u64, len: usize) -> Result<(), MemoryManagerError> {
        let unmapped = || MemoryManagerError::UnmappedAddress {
            addr: guest_addr,
            len,
        };
        let end = guest_addr
            .checked_add(len as u64)
            .ok_or_else(unmapped)?;
        let mut cursor = guest_addr;
        // Ranges may span adjacent regions.
        while cursor < end {
            let region = self
                .regions
                .iter()
                .find(|r| r.contains(cursor))
                .ok_or_else(unmapped)?;
            cursor = std::cmp::min(end, region.guest_base + region.size);
        }
        Ok(())
    }

    pub fn read(&self, guest_addr: u64, len: usize) -> Result<Vec<u8>, MemoryManagerError> {
        self.check_range(guest_addr, len)?;
        let mut buf = vec![0u8; len];
        self.guest_memory
            .read_slice(&mut buf, GuestAddress(guest_addr))
            .map_err(|_| MemoryManagerError::UnmappedAddress {
                addr: guest_addr,
                len,
            })?;
        Ok(buf)
    }

    pub fn write(&self, guest_addr: u64, data: &[u8]) -> Result<(), MemoryManagerError> {
        self.check_range(guest_addr, data.len())?;
        self.guest_memory
            .write_slice(data, GuestAddress(guest_addr))
            .map_err(|_| MemoryManagerError::UnmappedAddress {
                addr: guest_addr,
                len: data.len(),
            })
    }

    /// Copies a guest image into memory.
    pub fn load_blob(&self, guest_addr: u64, data: &[u8]) -> Result<(), MemoryManagerError> {
        self.write(guest_addr, data)?;
        info!(
            "loaded {} bytes at guest address 0x{:x}",
            data.len(),
            guest_addr
        );
        Ok(())
    }

    /// Removes every slot and releases the host memory. Calling it twice is
    /// an error.
    pub fn teardown(&mut self) -> Result<(), MemoryManagerError> {
        if self.torn_down {
            return Err(MemoryManagerError::AlreadyTornDown);
        }
        self.torn_down = true;

        let mut result = Ok(());
        for region in self.regions.drain(..) {
            // SAFETY: a zero size removes the slot, no memory is mapped.
            let removed = unsafe {
                self.hypervisor
                    .set_user_memory_region(region.slot, region.guest_base, 0, region.host_base)
            };
            if let Err(e) = removed {
                warn!("failed to remove guest memory slot {}: {}", region.slot, e);
                if result.is_ok() {
                    result = Err(MemoryManagerError::SetUserMemoryRegion(e));
                }
            }
        }
        // Devices may still hold clones; the mappings go away with the last one.
        self.guest_memory = GuestMemoryMmap::default();
        result
    }
}

impl Drop for GuestMemoryManager {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(e) = self.teardown() {
                warn!("guest memory teardown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::test_utils::MockHypervisor;

    pub(crate) fn setup_manager() -> (MockHypervisor, GuestMemoryManager) {
        let hv = MockHypervisor::new();
        let manager = GuestMemoryManager::new(Arc::new(hv.clone()));
        (hv, manager)
    }

    #[test]
    fn test_add_region() {
        let (hv, mut mm) = setup_manager();
        let region = mm.add_region(0x4000_0000, 1 << 20).unwrap();
        assert_eq!(region.guest_base, 0x4000_0000);
        assert_eq!(region.size, 1 << 20);
        assert_eq!(region.slot, 0);
        assert_ne!(region.host_base, 0);

        let slots = hv.memory_slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[&0].guest_addr, 0x4000_0000);
        assert_eq!(slots[&0].host_addr, region.host_base);
    }

    #[test]
    fn test_add_region_alignment() {
        let (hv, mut mm) = setup_manager();
        for (addr, size) in [(0x4000_0010, 0x1000), (0x4000_0000, 0x1001), (0x4000_0000, 0)] {
            match mm.add_region(addr, size) {
                Err(MemoryManagerError::Alignment { .. }) => (),
                _ => unreachable!(),
            }
        }
        match mm.add_region(u64::MAX - 0xfff, 0x2000) {
            Err(MemoryManagerError::OutOfRange { .. }) => (),
            _ => unreachable!(),
        }
        assert!(mm.regions().is_empty());
        assert!(hv.memory_slots().is_empty());
    }

    #[test]
    fn test_add_region_overlap() {
        let (hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x10000).unwrap();
        for (addr, size) in [
            (0x4000_0000, 0x1000),
            (0x3fff_f000, 0x2000),
            (0x4000_f000, 0x1000),
            (0x3000_0000, 0x2000_0000),
        ] {
            match mm.add_region(addr, size) {
                Err(MemoryManagerError::Overlap { .. }) => (),
                _ => unreachable!(),
            }
        }
        assert_eq!(mm.regions().len(), 1);
        assert_eq!(hv.memory_slots().len(), 1);

        // Adjacent regions do not overlap.
        mm.add_region(0x4001_0000, 0x1000).unwrap();
        mm.add_region(0x3fff_f000, 0x1000).unwrap();
        let regions = mm.regions();
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(!a.overlaps(b.guest_base, b.size));
            }
        }
    }

    #[test]
    fn test_add_region_registration_failure() {
        let (hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        hv.fail_slot_registration(true);
        match mm.add_region(0x5000_0000, 0x1000) {
            Err(MemoryManagerError::SetUserMemoryRegion(_)) => (),
            _ => unreachable!(),
        }
        assert_eq!(mm.regions().len(), 1);
        match mm.translate(0x5000_0000) {
            Err(MemoryManagerError::NotMapped(0x5000_0000)) => (),
            _ => unreachable!(),
        }
        hv.fail_slot_registration(false);
        assert_eq!(mm.add_region(0x5000_0000, 0x1000).unwrap().slot, 1);
    }

    #[test]
    fn test_not_enough_slots() {
        let (hv, mut mm) = setup_manager();
        hv.set_max_memory_slots(1);
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        match mm.add_region(0x5000_0000, 0x1000) {
            Err(MemoryManagerError::NotEnoughMemorySlots) => (),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_translate() {
        let (_hv, mut mm) = setup_manager();
        let low = mm.add_region(0x4000_0000, 0x2000).unwrap();
        let high = mm.add_region(0x8000_0000, 0x1000).unwrap();

        assert_eq!(mm.translate(0x4000_0000).unwrap(), low.host_base);
        assert_eq!(mm.translate(0x4000_1fff).unwrap(), low.host_base + 0x1fff);
        assert_eq!(mm.translate(0x8000_0010).unwrap(), high.host_base + 0x10);
        for addr in [0, 0x3fff_ffff, 0x4000_2000, 0x8000_1000] {
            match mm.translate(addr) {
                Err(MemoryManagerError::NotMapped(a)) => assert_eq!(a, addr),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_read_write_round_trip() {
        let (_hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x2000).unwrap();
        let pattern: Vec<u8> = (0..0x2000).map(|i| (i % 251) as u8).collect();
        mm.write(0x4000_0000, &pattern).unwrap();
        assert_eq!(mm.read(0x4000_0000, pattern.len()).unwrap(), pattern);

        mm.write(0x4000_1ffc, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mm.read(0x4000_1ffc, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(mm.read(0x4000_0000, 0).unwrap().is_empty());
    }

    #[test]
    fn test_access_spanning_adjacent_regions() {
        let (_hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        mm.add_region(0x4000_1000, 0x1000).unwrap();
        mm.write(0x4000_0ffe, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
        assert_eq!(
            mm.read(0x4000_0ffe, 4).unwrap(),
            vec![0xaa, 0xbb, 0xcc, 0xdd]
        );
    }

    #[test]
    fn test_unmapped_access() {
        let (_hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        mm.write(0x4000_0ff0, &[0x11; 16]).unwrap();
        // Crossing the end of the region must not be truncated.
        match mm.write(0x4000_0ffe, &[0x22; 4]) {
            Err(MemoryManagerError::UnmappedAddress {
                addr: 0x4000_0ffe,
                len: 4,
            }) => (),
            _ => unreachable!(),
        }
        assert_eq!(mm.read(0x4000_0ffe, 2).unwrap(), vec![0x11, 0x11]);
        match mm.read(0x4000_0ffe, 4) {
            Err(MemoryManagerError::UnmappedAddress { .. }) => (),
            _ => unreachable!(),
        }
        match mm.read(u64::MAX, 2) {
            Err(MemoryManagerError::UnmappedAddress { .. }) => (),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_load_blob() {
        let (_hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        mm.load_blob(0x4000_0100, b"\x00\x00\x00\x14").unwrap();
        assert_eq!(mm.read(0x4000_0100, 4).unwrap(), b"\x00\x00\x00\x14");
        assert!(mm.load_blob(0x4000_0ffc, &[0; 8]).is_err());
    }

    #[test]
    fn test_guest_memory_view() {
        let (_hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        mm.write(0x4000_0000, &0xdead_beefu32.to_le_bytes()).unwrap();
        let view = mm.guest_memory().clone();
        assert_eq!(
            view.read_obj::<u32>(GuestAddress(0x4000_0000)).unwrap(),
            0xdead_beef
        );
    }

    #[test]
    fn test_teardown() {
        let (hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        mm.add_region(0x5000_0000, 0x1000).unwrap();
        assert_eq!(hv.memory_slots().len(), 2);

        mm.teardown().unwrap();
        assert!(hv.memory_slots().is_empty());
        assert!(mm.regions().is_empty());
        match mm.teardown() {
            Err(MemoryManagerError::AlreadyTornDown) => (),
            _ => unreachable!(),
        }
        match mm.add_region(0x4000_0000, 0x1000) {
            Err(MemoryManagerError::AlreadyTornDown) => (),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_drop_removes_slots() {
        let (hv, mut mm) = setup_manager();
        mm.add_region(0x4000_0000, 0x1000).unwrap();
        drop(mm);
        assert!(hv.memory_slots().is_empty());
    }
}
