// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed view over the `kvm_run` structure shared between a vcpu and the kernel.

use crate::utils::memory::{self, MemoryError};
use vm_memory::{ByteValued, Bytes, MmapRegion, VolatileMemory};

// Byte offsets inside `struct kvm_run`.
const EXIT_REASON: usize = 8;
const EXIT_PAYLOAD: usize = 32;

// KVM_EXIT_MMIO payload.
const MMIO_PHYS_ADDR: usize = EXIT_PAYLOAD;
const MMIO_DATA: usize = EXIT_PAYLOAD + 8;
const MMIO_LEN: usize = EXIT_PAYLOAD + 16;
const MMIO_IS_WRITE: usize = EXIT_PAYLOAD + 20;

// KVM_EXIT_SYSTEM_EVENT payload.
const SYSTEM_EVENT_TYPE: usize = EXIT_PAYLOAD;

// KVM_EXIT_FAIL_ENTRY payload.
const FAIL_ENTRY_REASON: usize = EXIT_PAYLOAD;
const FAIL_ENTRY_CPU: usize = EXIT_PAYLOAD + 8;

// KVM_EXIT_INTERNAL_ERROR payload.
const INTERNAL_SUBERROR: usize = EXIT_PAYLOAD;

/// Size of the data buffer of an mmio exit.
pub const MMIO_DATA_LEN: usize = 8;

/// Smallest mapping able to hold every field accessed here.
pub const RUN_AREA_MIN_SIZE: usize = 4096;

/// Raw fields of an mmio exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    pub phys_addr: u64,
    pub data: [u8; MMIO_DATA_LEN],
    pub len: u32,
    pub is_write: bool,
}

/// Owner of a vcpu's `kvm_run` mapping.
///
/// Every field is read and written at a fixed offset through bounds-checked
/// volatile accessors; the mapping itself is never handed out. A malformed
/// offset reads as zero and a failed write is dropped, which can only happen
/// when the mapping is smaller than [`RUN_AREA_MIN_SIZE`], rejected at
/// construction.
pub struct RunArea {
    region: MmapRegion,
}

impl RunArea {
    /// View over the `kvm_run` mapping a vcpu fd already holds.
    ///
    /// # Safety
    ///
    /// `ptr` must be the start of that mapping, `size` bytes long, and the
    /// vcpu fd owning it must outlive the area.
    pub unsafe fn from_kvm_run(ptr: *mut u8, size: usize) -> Result<Self, MemoryError> {
        let area = RunArea {
            region: memory::borrow_mapping(ptr, size)?,
        };
        area.check_size()?;
        Ok(area)
    }

    /// Anonymous area, used by backends that do not get one from the kernel.
    pub fn anonymous() -> Result<Self, MemoryError> {
        let region =
            MmapRegion::new(RUN_AREA_MIN_SIZE).map_err(MemoryError::BuildMmapRegion)?;
        Ok(RunArea { region })
    }

    fn check_size(&self) -> Result<(), MemoryError> {
        if self.region.size() < RUN_AREA_MIN_SIZE {
            return Err(MemoryError::Os(std::io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        Ok(())
    }

    fn read<T: ByteValued + Default>(&self, offset: usize) -> T {
        self.region
            .as_volatile_slice()
            .read_obj(offset)
            .unwrap_or_default()
    }

    fn write<T: ByteValued>(&self, offset: usize, value: T) {
        let _ = self.region.as_volatile_slice().write_obj(value, offset);
    }

    pub fn exit_reason(&self) -> u32 {
        self.read(EXIT_REASON)
    }

    pub fn set_exit_reason(&self, reason: u32) {
        self.write(EXIT_REASON, reason)
    }

    pub fn mmio(&self) -> MmioAccess {
        MmioAccess {
            phys_addr: self.read(MMIO_PHYS_ADDR),
            data: self.read(MMIO_DATA),
            len: self.read(MMIO_LEN),
            is_write: self.read::<u8>(MMIO_IS_WRITE) != 0,
        }
    }

    pub fn set_mmio(&self, access: &MmioAccess) {
        self.write(MMIO_PHYS_ADDR, access.phys_addr);
        self.write(MMIO_DATA, access.data);
        self.write(MMIO_LEN, access.len);
        self.write(MMIO_IS_WRITE, access.is_write as u8);
    }

    /// Overwrites the head of the mmio data buffer, leaving the other fields alone.
    pub fn set_mmio_data(&self, data: &[u8]) {
        let mut buf: [u8; MMIO_DATA_LEN] = self.read(MMIO_DATA);
        let len = std::cmp::min(data.len(), MMIO_DATA_LEN);
        buf[..len].copy_from_slice(&data[..len]);
        self.write(MMIO_DATA, buf);
    }

    pub fn system_event_type(&self) -> u32 {
        self.read(SYSTEM_EVENT_TYPE)
    }

    pub fn set_system_event_type(&self, event: u32) {
        self.write(SYSTEM_EVENT_TYPE, event)
    }

    /// Hardware failure reason and cpu of a failed entry.
    pub fn fail_entry(&self) -> (u64, u32) {
        (self.read(FAIL_ENTRY_REASON), self.read(FAIL_ENTRY_CPU))
    }

    pub fn set_fail_entry(&self, reason: u64, cpu: u32) {
        self.write(FAIL_ENTRY_REASON, reason);
        self.write(FAIL_ENTRY_CPU, cpu);
    }

    pub fn internal_suberror(&self) -> u32 {
        self.read(INTERNAL_SUBERROR)
    }

    pub fn set_internal_suberror(&self, suberror: u32) {
        self.write(INTERNAL_SUBERROR, suberror)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmio_fields() {
        let area = RunArea::anonymous().unwrap();
        let access = MmioAccess {
            phys_addr: 0x0a00_0050,
            data: [1, 0, 0, 0, 0, 0, 0, 0],
            len: 4,
            is_write: true,
        };
        area.set_exit_reason(kvm_bindings::KVM_EXIT_MMIO);
        area.set_mmio(&access);
        assert_eq!(area.exit_reason(), kvm_bindings::KVM_EXIT_MMIO);
        assert_eq!(area.mmio(), access);
    }

    #[test]
    fn test_set_mmio_data_keeps_header() {
        let area = RunArea::anonymous().unwrap();
        area.set_mmio(&MmioAccess {
            phys_addr: 0x0900_0000,
            data: [0; MMIO_DATA_LEN],
            len: 4,
            is_write: false,
        });
        area.set_mmio_data(&[0xef, 0xbe, 0xad, 0xde]);
        let access = area.mmio();
        assert_eq!(access.phys_addr, 0x0900_0000);
        assert_eq!(access.len, 4);
        assert_eq!(&access.data[..4], &[0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_payload_union_overlaps() {
        let area = RunArea::anonymous().unwrap();
        area.set_fail_entry(0x1234, 3);
        assert_eq!(area.fail_entry(), (0x1234, 3));
        // The system event type lives where the failure reason starts.
        assert_eq!(area.system_event_type(), 0x1234);
        area.set_internal_suberror(1);
        assert_eq!(area.internal_suberror(), 1);
    }

    #[test]
    fn test_from_kvm_run() {
        let owner = RunArea::anonymous().unwrap();
        owner.set_exit_reason(kvm_bindings::KVM_EXIT_HLT);
        // SAFETY: `owner` outlives the view.
        let view =
            unsafe { RunArea::from_kvm_run(owner.region.as_ptr(), RUN_AREA_MIN_SIZE) }.unwrap();
        assert_eq!(view.exit_reason(), kvm_bindings::KVM_EXIT_HLT);
        drop(view);
        assert_eq!(owner.exit_reason(), kvm_bindings::KVM_EXIT_HLT);

        // SAFETY: too small, rejected before use.
        match unsafe { RunArea::from_kvm_run(owner.region.as_ptr(), 64) } {
            Err(MemoryError::Os(_)) => (),
            _ => unreachable!(),
        }
    }
}
