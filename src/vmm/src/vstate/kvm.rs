// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! [`Hypervisor`] on top of `/dev/kvm` for arm64 hosts.

use crate::arch;
use crate::vstate::hypervisor::{Capability, Hypervisor, HypervisorError, VcpuBackend};
use crate::vstate::vcpu::run_area::RunArea;
use kvm_bindings::{
    kvm_create_device, kvm_device_attr, kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V3,
    kvm_userspace_memory_region, kvm_vcpu_init, KVM_ARM_VCPU_PSCI_0_2, KVM_DEV_ARM_VGIC_CTRL_INIT,
    KVM_DEV_ARM_VGIC_GRP_ADDR, KVM_DEV_ARM_VGIC_GRP_CTRL, KVM_DEV_ARM_VGIC_GRP_NR_IRQS,
    KVM_VGIC_V3_ADDR_TYPE_DIST, KVM_VGIC_V3_ADDR_TYPE_REDIST,
};
use kvm_ioctls::{Cap, DeviceFd, Kvm, VcpuFd, VmFd};
use std::sync::OnceLock;
use utils::errno;

const KVM_ARM_IRQ_TYPE_SHIFT: u32 = 24;
const KVM_ARM_IRQ_TYPE_SPI: u32 = 1;
// SPIs start after the 32 private interrupts.
const SPI_BASE: u32 = 32;

/// `irq` field of `KVM_IRQ_LINE` for shared peripheral interrupt `spi`.
fn spi_line(spi: u32) -> u32 {
    (KVM_ARM_IRQ_TYPE_SPI << KVM_ARM_IRQ_TYPE_SHIFT) | (spi + SPI_BASE)
}

pub struct KvmHypervisor {
    kvm: Kvm,
    vm: VmFd,
    max_memslots: usize,
    run_size: usize,
    gic: OnceLock<DeviceFd>,
}

impl KvmHypervisor {
    pub fn new() -> Result<Self, HypervisorError> {
        let kvm = Kvm::new().map_err(|e| HypervisorError::new("open /dev/kvm", e))?;
        let max_memslots = kvm.get_nr_memslots();
        let run_size = kvm
            .get_vcpu_mmap_size()
            .map_err(|e| HypervisorError::new("KVM_GET_VCPU_MMAP_SIZE", e))?;
        let vm = kvm
            .create_vm()
            .map_err(|e| HypervisorError::new("KVM_CREATE_VM", e))?;
        Ok(KvmHypervisor {
            kvm,
            vm,
            max_memslots,
            run_size,
            gic: OnceLock::new(),
        })
    }

    fn set_gic_attr(gic: &DeviceFd, group: u32, attr: u64, addr: u64) -> Result<(), HypervisorError> {
        let attr = kvm_device_attr {
            group,
            attr,
            addr,
            flags: 0,
        };
        gic.set_device_attr(&attr)
            .map_err(|e| HypervisorError::new("KVM_SET_DEVICE_ATTR", e))
    }
}

impl Hypervisor for KvmHypervisor {
    fn check_capability(&self, cap: Capability) -> bool {
        let cap = match cap {
            Capability::UserMemory => Cap::UserMemory,
            Capability::Irqchip => Cap::Irqchip,
            Capability::PowerStateControl => Cap::ArmPsci02,
            Capability::OneReg => Cap::OneReg,
        };
        self.kvm.check_extension(cap)
    }

    fn max_memory_slots(&self) -> usize {
        self.max_memslots
    }

    unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<(), HypervisorError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size: size,
            userspace_addr: host_addr,
            flags: 0,
        };
        self.vm
            .set_user_memory_region(region)
            .map_err(|e| HypervisorError::new("KVM_SET_USER_MEMORY_REGION", e))
    }

    fn create_vcpu(&self, id: u32) -> Result<Box<dyn VcpuBackend>, HypervisorError> {
        let mut fd = self
            .vm
            .create_vcpu(u64::from(id))
            .map_err(|e| HypervisorError::new("KVM_CREATE_VCPU", e))?;
        let mut kvi = kvm_vcpu_init::default();
        self.vm
            .get_preferred_target(&mut kvi)
            .map_err(|e| HypervisorError::new("KVM_ARM_PREFERRED_TARGET", e))?;
        // Without PSCI the guest has no way to power off or reset.
        kvi.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;
        let kvm_run = fd.get_kvm_run() as *mut kvm_bindings::kvm_run as *mut u8;
        // SAFETY: `kvm_run` is the start of the fd's own mapping of `run_size`
        // bytes, and the fd is kept next to the area in `KvmVcpu`.
        let run_area = unsafe { RunArea::from_kvm_run(kvm_run, self.run_size) }.map_err(|e| {
            HypervisorError::new("map kvm_run", errno::Error::new(raw_os_error(&e)))
        })?;
        Ok(Box::new(KvmVcpu { run_area, fd, kvi }))
    }

    fn create_irqchip(&self, vcpu_count: u32) -> Result<(), HypervisorError> {
        let mut device = kvm_create_device {
            type_: kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V3,
            fd: 0,
            flags: 0,
        };
        let gic = self
            .vm
            .create_device(&mut device)
            .map_err(|e| HypervisorError::new("KVM_CREATE_DEVICE", e))?;

        let dist_addr: u64 = arch::GIC_DIST_BASE;
        let redist_addr: u64 = arch::GIC_REDIST_BASE;
        debug_assert!(
            redist_addr + arch::GIC_REDIST_SIZE * u64::from(vcpu_count) <= arch::SERIAL_MMIO_BASE
        );
        Self::set_gic_attr(
            &gic,
            KVM_DEV_ARM_VGIC_GRP_ADDR,
            u64::from(KVM_VGIC_V3_ADDR_TYPE_DIST),
            &dist_addr as *const u64 as u64,
        )?;
        Self::set_gic_attr(
            &gic,
            KVM_DEV_ARM_VGIC_GRP_ADDR,
            u64::from(KVM_VGIC_V3_ADDR_TYPE_REDIST),
            &redist_addr as *const u64 as u64,
        )?;
        let nr_irqs: u32 = arch::GIC_NR_IRQS;
        Self::set_gic_attr(
            &gic,
            KVM_DEV_ARM_VGIC_GRP_NR_IRQS,
            0,
            &nr_irqs as *const u32 as u64,
        )?;
        self.gic
            .set(gic)
            .map_err(|_| HypervisorError::new("KVM_CREATE_DEVICE", errno::Error::new(libc::EEXIST)))
    }

    fn finalize_irqchip(&self) -> Result<(), HypervisorError> {
        let gic = self.gic.get().ok_or_else(|| {
            HypervisorError::new("KVM_DEV_ARM_VGIC_CTRL_INIT", errno::Error::new(libc::ENODEV))
        })?;
        Self::set_gic_attr(
            gic,
            KVM_DEV_ARM_VGIC_GRP_CTRL,
            u64::from(KVM_DEV_ARM_VGIC_CTRL_INIT),
            0,
        )
    }

    fn set_irq_line(&self, irq: u32, level: bool) -> Result<(), HypervisorError> {
        self.vm
            .set_irq_line(spi_line(irq), level)
            .map_err(|e| HypervisorError::new("KVM_IRQ_LINE", e))
    }
}

fn raw_os_error(e: &crate::utils::memory::MemoryError) -> i32 {
    match e {
        crate::utils::memory::MemoryError::Os(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
        _ => libc::EINVAL,
    }
}

struct KvmVcpu {
    // Views the mapping owned by `fd`, so it goes first.
    run_area: RunArea,
    fd: VcpuFd,
    kvi: kvm_vcpu_init,
}

impl VcpuBackend for KvmVcpu {
    fn init(&mut self) -> Result<(), HypervisorError> {
        self.fd
            .vcpu_init(&self.kvi)
            .map_err(|e| HypervisorError::new("KVM_ARM_VCPU_INIT", e))
    }

    fn get_register(&self, id: u64) -> Result<u64, HypervisorError> {
        let mut data = [0u8; 8];
        self.fd
            .get_one_reg(id, &mut data)
            .map_err(|e| HypervisorError::new("KVM_GET_ONE_REG", e))?;
        Ok(u64::from_le_bytes(data))
    }

    fn set_register(&mut self, id: u64, value: u64) -> Result<(), HypervisorError> {
        self.fd
            .set_one_reg(id, &value.to_le_bytes())
            .map(|_| ())
            .map_err(|e| HypervisorError::new("KVM_SET_ONE_REG", e))
    }

    fn run(&mut self) -> Result<(), HypervisorError> {
        // The exit is decoded from the run area.
        self.fd
            .run()
            .map(|_| ())
            .map_err(|e| HypervisorError::new("KVM_RUN", e))
    }

    fn run_area(&self) -> &RunArea {
        &self.run_area
    }
}
