// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest physical address map.
//!
//! Platform devices sit below 1 GiB, followed by a run of fixed-size
//! virtio-mmio windows, and guest RAM starts at the 1 GiB mark. The layout
//! must stay stable: guests discover devices at these addresses.

pub mod aarch64;

pub use aarch64::regs;

use vm_memory::GuestAddress;

pub const PAGE_SIZE: u64 = 4096;

/// GICv3 distributor.
pub const GIC_DIST_BASE: u64 = 0x0800_0000;
pub const GIC_DIST_SIZE: u64 = 0x1_0000;
/// GICv3 redistributors, one 128 KiB frame per vcpu.
pub const GIC_REDIST_BASE: u64 = 0x080A_0000;
pub const GIC_REDIST_SIZE: u64 = 0x2_0000;
/// Number of interrupt lines handled by the GIC, private ones included.
pub const GIC_NR_IRQS: u32 = 128;

pub const SERIAL_MMIO_BASE: u64 = 0x0900_0000;
pub const SERIAL_MMIO_SIZE: u64 = 0x1000;
/// Shared peripheral interrupt of the serial port.
pub const SERIAL_IRQ: u32 = 1;

/// First virtio-mmio window.
pub const MMIO_MEM_START: u64 = 0x0A00_0000;
/// Size of one virtio-mmio window.
pub const MMIO_LEN: u64 = 0x1000;
pub const MMIO_SLOTS: u32 = 32;
/// Shared peripheral interrupt of the first virtio-mmio window.
pub const IRQ_BASE: u32 = 16;
pub const IRQ_MAX: u32 = IRQ_BASE + MMIO_SLOTS - 1;

/// Guest RAM base.
pub const DRAM_MEM_START: u64 = 0x4000_0000;
pub const DRAM_MEM_MAX_SIZE: u64 = 0x40_0000_0000;

pub fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// RAM regions for a guest with `size` bytes of memory.
pub fn arch_memory_regions(size: usize) -> Vec<(GuestAddress, usize)> {
    let size = std::cmp::min(size as u64, DRAM_MEM_MAX_SIZE);
    vec![(GuestAddress(DRAM_MEM_START), size as usize)]
}
