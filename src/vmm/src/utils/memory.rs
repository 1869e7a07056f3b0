// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::result::Result;

use vm_memory::{mmap::MmapRegionError, MmapRegion};

/// Errors associated with operations on memory.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Genral error on I/O operation.
    #[error("General error on I/O operation: {0}")]
    Os(#[from] std::io::Error),
    /// Memory region for vm build error.
    #[error("Memory region for vm build error: {0}")]
    BuildMmapRegion(MmapRegionError),
}

/// Region over a mapping owned by someone else, such as the `kvm_run`
/// structure a vcpu fd maps for itself. Dropping the region leaves the
/// mapping in place.
///
/// # Safety
///
/// `ptr` must point to a shared read-write mapping of at least `size` bytes
/// that outlives the returned region.
pub(crate) unsafe fn borrow_mapping(ptr: *mut u8, size: usize) -> Result<MmapRegion, MemoryError> {
    if ptr.is_null() {
        return Err(MemoryError::Os(std::io::Error::from_raw_os_error(
            libc::EINVAL,
        )));
    }
    MmapRegion::build_raw(ptr, size, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED)
        .map_err(MemoryError::BuildMmapRegion)
}
