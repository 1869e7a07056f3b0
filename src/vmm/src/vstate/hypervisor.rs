// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The kernel virtualization interface, as consumed by the rest of the vmm.
//!
//! Only a handful of primitives are used: capability queries, memory slot
//! registration, vcpu creation, register access, the blocking run call and
//! interrupt line control. Interrupt controller setup is reduced to "create
//! before the vcpus, finalize after them".

use crate::vstate::vcpu::run_area::RunArea;
use utils::errno;

/// Kernel features the vmm cannot work without.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// User memory regions can be registered.
    UserMemory,
    /// An in-kernel interrupt controller is available.
    Irqchip,
    /// Guests can request power-off and reset (PSCI 0.2 on arm64).
    PowerStateControl,
    /// Single registers can be read and written.
    OneReg,
}

pub const REQUIRED_CAPABILITIES: [Capability; 4] = [
    Capability::UserMemory,
    Capability::Irqchip,
    Capability::PowerStateControl,
    Capability::OneReg,
];

/// Failure of a kernel primitive.
#[derive(Debug, thiserror::Error)]
#[error("{op} failed: {source}")]
pub struct HypervisorError {
    /// Name of the failed operation.
    pub op: &'static str,
    #[source]
    pub source: errno::Error,
}

impl HypervisorError {
    pub fn new(op: &'static str, source: errno::Error) -> Self {
        HypervisorError { op, source }
    }

    pub fn errno(&self) -> i32 {
        self.source.errno()
    }

    /// Interrupted calls that must be retried rather than reported.
    pub fn is_transient(&self) -> bool {
        matches!(self.errno(), libc::EINTR | libc::EAGAIN)
    }
}

/// One kernel-created cpu context.
pub trait VcpuBackend: Send {
    /// Platform initialization, done once right after creation.
    fn init(&mut self) -> Result<(), HypervisorError>;

    fn get_register(&self, id: u64) -> Result<u64, HypervisorError>;

    fn set_register(&mut self, id: u64, value: u64) -> Result<(), HypervisorError>;

    /// Enters the guest and blocks until it exits. The exit is described by
    /// the run area.
    fn run(&mut self) -> Result<(), HypervisorError>;

    fn run_area(&self) -> &RunArea;
}

/// A virtual machine object of the kernel virtualization interface.
pub trait Hypervisor: Send + Sync {
    fn check_capability(&self, cap: Capability) -> bool;

    /// Number of memory slots the kernel accepts.
    fn max_memory_slots(&self) -> usize;

    /// Maps `size` bytes at `host_addr` into the guest at `guest_addr`.
    /// A zero `size` removes the slot.
    ///
    /// # Safety
    ///
    /// `host_addr..host_addr + size` must stay mapped until the slot is
    /// removed.
    unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<(), HypervisorError>;

    fn create_vcpu(&self, id: u32) -> Result<Box<dyn VcpuBackend>, HypervisorError>;

    /// Creates the interrupt controller. Must precede vcpu creation.
    fn create_irqchip(&self, vcpu_count: u32) -> Result<(), HypervisorError>;

    /// Initializes the interrupt controller once every vcpu exists.
    fn finalize_irqchip(&self) -> Result<(), HypervisorError>;

    /// Drives the shared peripheral interrupt `irq` to `level`.
    fn set_irq_line(&self, irq: u32, level: bool) -> Result<(), HypervisorError>;
}

/// First required capability the hypervisor lacks, if any.
pub fn missing_capability(hypervisor: &dyn Hypervisor) -> Option<Capability> {
    REQUIRED_CAPABILITIES
        .iter()
        .copied()
        .find(|cap| !hypervisor.check_capability(*cap))
}
