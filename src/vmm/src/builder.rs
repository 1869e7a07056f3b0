// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    arch::{self, regs},
    device_manager::mmio::{MmioDeviceError, MmioDeviceManager},
    devices::{
        epoll::{EpollContext, EpollContextError, InputSource},
        legacy::SharedWriter,
        virtio::{
            block::{Block, BlockError},
            console::Console,
        },
    },
    resources::VmResources,
    vmm_config::{console::ConsoleDevice, drive::DriveError},
    vstate::{
        hypervisor::{missing_capability, Capability, Hypervisor, HypervisorError},
        memory::{GuestMemoryManager, MemoryManagerError},
        vcpu::{Vcpu, VcpuError},
    },
    Vmm,
};
use log::info;
use std::io::Write;
use std::sync::Arc;

/// Errors associated with starting the instance.
#[derive(Debug, thiserror::Error)]
pub enum StartVmError {
    /// The hypervisor lacks a required feature.
    #[error("Missing hypervisor capability: {0:?}")]
    MissingCapability(Capability),
    /// Cannot set up guest memory.
    #[error("Cannot set up guest memory: {0}")]
    Memory(MemoryManagerError),
    /// Cannot start the VM because the boot-source was not configured.
    #[error("Cannot start vm without boot-source")]
    MissingBootSource,
    /// The image does not fit in guest memory at its load offset.
    #[error("Guest image of {size} bytes does not fit at offset 0x{offset:x} of guest memory")]
    ImageTooLarge { size: usize, offset: u64 },
    /// Cannot load the guest image.
    #[error("Cannot load the guest image: {0}")]
    LoadImage(MemoryManagerError),
    /// Interrupt controller setup failed.
    #[error("Cannot set up the interrupt controller: {0}")]
    Irqchip(HypervisorError),
    /// Vcpu create error.
    #[error("Error creating the vcpu: {0}")]
    VcpuCreate(VcpuError),
    /// Vcpu configuration error.
    #[error("Error configuring the vcpu for boot: {0}")]
    VcpuConfigure(VcpuError),
    /// Cannot open the block device backing file.
    #[error("Cannot open the block device backing file: {0}")]
    OpenBlockDevice(DriveError),
    /// Could not create a block device.
    #[error("Could not create a block device: {0}")]
    CreateBlockDevice(BlockError),
    /// Cannot add a device to the mmio address space.
    #[error("Cannot register a mmio device: {0}")]
    RegisterMmioDevice(MmioDeviceError),
    #[error("Cannot initialize the epoll context for host input: {0}")]
    EpollCtx(EpollContextError),
}

fn setup_memory(
    vm_resources: &VmResources,
    hypervisor: Arc<dyn Hypervisor>,
) -> Result<GuestMemoryManager, StartVmError> {
    let mut memory = GuestMemoryManager::new(hypervisor);
    for (addr, size) in arch::arch_memory_regions(vm_resources.vm_config.mem_size()) {
        memory
            .add_region(addr.0, size as u64)
            .map_err(StartVmError::Memory)?;
    }
    Ok(memory)
}

/// Copies the guest image into RAM and returns its guest address.
fn load_image(
    vm_resources: &VmResources,
    memory: &GuestMemoryManager,
) -> Result<u64, StartVmError> {
    let boot_config = vm_resources
        .boot_config()
        .ok_or(StartVmError::MissingBootSource)?;
    let size = boot_config.image.len();
    let offset = boot_config.load_offset;
    let mem_size = vm_resources.vm_config.mem_size() as u64;
    let fits = offset
        .checked_add(size as u64)
        .map_or(false, |end| end <= mem_size);
    if !fits {
        return Err(StartVmError::ImageTooLarge { size, offset });
    }

    let load_addr = arch::DRAM_MEM_START + offset;
    memory
        .load_blob(load_addr, &boot_config.image)
        .map_err(StartVmError::LoadImage)?;
    Ok(load_addr)
}

fn attach_devices(
    vm_resources: &VmResources,
    dm: &mut MmioDeviceManager,
    out: SharedWriter,
) -> Result<(), StartVmError> {
    for drive in vm_resources.block.devices.iter() {
        let file = drive.open().map_err(StartVmError::OpenBlockDevice)?;
        let block = Block::new(file, drive.is_read_only).map_err(StartVmError::CreateBlockDevice)?;
        dm.register_virtio(Box::new(block))
            .map_err(StartVmError::RegisterMmioDevice)?;
    }

    let (_, serial) = dm
        .register_serial(out.clone())
        .map_err(StartVmError::RegisterMmioDevice)?;
    let console = match vm_resources.console.device {
        ConsoleDevice::Serial => serial,
        ConsoleDevice::Virtio => {
            let (_, console) = dm
                .register_virtio(Box::new(Console::new(Box::new(out))))
                .map_err(StartVmError::RegisterMmioDevice)?;
            console
        }
    };
    dm.set_console(console);
    Ok(())
}

/// Builds a vm ready to run from its resources.
///
/// The guest console writes to `output`, and bytes read from `input`, when
/// given, are delivered to it.
pub fn build_vmm(
    vm_resources: &VmResources,
    hypervisor: Arc<dyn Hypervisor>,
    output: Box<dyn Write + Send>,
    input: Option<Box<dyn InputSource>>,
) -> Result<Vmm, StartVmError> {
    if let Some(cap) = missing_capability(hypervisor.as_ref()) {
        return Err(StartVmError::MissingCapability(cap));
    }

    let memory = setup_memory(vm_resources, hypervisor.clone())?;
    let entry = load_image(vm_resources, &memory)?;

    // The interrupt controller is created before the vcpu and finalized after.
    hypervisor
        .create_irqchip(u32::from(vm_resources.vm_config.vcpu_count))
        .map_err(StartVmError::Irqchip)?;
    let mut vcpu = Vcpu::create(hypervisor.as_ref(), 0).map_err(StartVmError::VcpuCreate)?;
    hypervisor
        .finalize_irqchip()
        .map_err(StartVmError::Irqchip)?;

    let mut dm = MmioDeviceManager::new(hypervisor.clone(), memory.guest_memory().clone());
    attach_devices(vm_resources, &mut dm, SharedWriter::new(output))?;

    let stack_top = arch::DRAM_MEM_START + vm_resources.vm_config.mem_size() as u64;
    regs::setup_boot_regs(&mut vcpu, entry, stack_top, 0).map_err(StartVmError::VcpuConfigure)?;

    let epoll_context = match input {
        Some(input) => {
            let mut ctx = EpollContext::new().map_err(StartVmError::EpollCtx)?;
            ctx.add_input(input).map_err(StartVmError::EpollCtx)?;
            Some(ctx)
        }
        None => None,
    };

    info!(
        "vm built: {} MiB of memory, entry 0x{:x}, {} devices",
        vm_resources.vm_config.mem_size_mib,
        entry,
        dm.devices().len()
    );
    Ok(Vmm::new(
        hypervisor,
        vcpu,
        dm,
        epoll_context,
        memory,
        vm_resources.vm_config.unhandled_mmio,
    ))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::utils::test_utils::MockHypervisor;
    use crate::vmm_config::{
        boot_source::{BootConfig, BootSourceConfig},
        console::ConsoleConfig,
        drive::{BlockDeviceBuilder, BlockDeviceConfig},
    };
    use ::utils::tempfile::TempFile;

    pub(crate) fn default_resources(image: &[u8]) -> VmResources {
        let mut resources = VmResources::default();
        resources.vm_config.mem_size_mib = 16;
        resources.boot_source.config = BootSourceConfig {
            image_path: String::from("guest.bin"),
            load_offset: 0,
        };
        resources.boot_source.builder = Some(BootConfig {
            image: image.to_vec(),
            load_offset: 0,
        });
        resources
    }

    #[test]
    fn test_build_vmm() {
        let hv = MockHypervisor::new();
        let image = [0x1f, 0x20, 0x03, 0xd5];
        let resources = default_resources(&image);

        let vmm = build_vmm(&resources, Arc::new(hv.clone()), Box::new(std::io::sink()), None)
            .unwrap();

        // One ram slot, loaded with the image.
        let slots = hv.memory_slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[&0].guest_addr, arch::DRAM_MEM_START);
        assert_eq!(slots[&0].size, 16 << 20);
        assert_eq!(vmm.guest_memory().read(arch::DRAM_MEM_START, 4).unwrap(), image);

        assert_eq!(hv.irqchip_state(), (true, true));
        assert_eq!(hv.vcpu_count(), 1);
        assert_eq!(hv.register(regs::PC), Some(arch::DRAM_MEM_START));
        assert_eq!(hv.register(regs::PSTATE), Some(regs::BOOT_PSTATE));
        assert_eq!(
            hv.register(regs::SP_EL1),
            Some(arch::DRAM_MEM_START + (16 << 20))
        );

        // Only the serial port.
        let devices = vmm.mmio_device_manager().devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].addr, arch::SERIAL_MMIO_BASE);
    }

    #[test]
    fn test_build_vmm_with_devices() {
        let hv = MockHypervisor::new();
        let drive = TempFile::new().unwrap();
        drive.as_file().set_len(0x1000).unwrap();
        let mut resources = default_resources(&[0u8; 4]);
        resources.block = BlockDeviceBuilder {
            devices: vec![BlockDeviceConfig {
                path_on_host: drive.as_path().to_str().unwrap().to_string(),
                is_read_only: true,
            }],
        };
        resources.console = ConsoleConfig {
            device: ConsoleDevice::Virtio,
        };

        let vmm = build_vmm(&resources, Arc::new(hv), Box::new(std::io::sink()), None).unwrap();
        let devices = vmm.mmio_device_manager().devices();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].addr, arch::MMIO_MEM_START);
        assert_eq!(devices[0].device_type, Some(crate::devices::virtio::types::BLOCK_DEVICE));
        assert_eq!(devices[1].addr, arch::SERIAL_MMIO_BASE);
        assert_eq!(devices[2].addr, arch::MMIO_MEM_START + arch::MMIO_LEN);
        assert_eq!(devices[2].device_type, Some(crate::devices::virtio::types::CONSOLE));
    }

    #[test]
    fn test_build_vmm_errors() {
        let hv = MockHypervisor::new();
        hv.remove_capability(Capability::Irqchip);
        match build_vmm(
            &default_resources(&[0u8; 4]),
            Arc::new(hv),
            Box::new(std::io::sink()),
            None,
        ) {
            Err(StartVmError::MissingCapability(Capability::Irqchip)) => (),
            _ => unreachable!(),
        }

        let mut resources = default_resources(&[0u8; 4]);
        resources.boot_source.builder = None;
        match build_vmm(
            &resources,
            Arc::new(MockHypervisor::new()),
            Box::new(std::io::sink()),
            None,
        ) {
            Err(StartVmError::MissingBootSource) => (),
            _ => unreachable!(),
        }

        let mut resources = default_resources(&[0u8; 8]);
        if let Some(boot_config) = resources.boot_source.builder.as_mut() {
            boot_config.load_offset = (16 << 20) - 4;
        }
        match build_vmm(
            &resources,
            Arc::new(MockHypervisor::new()),
            Box::new(std::io::sink()),
            None,
        ) {
            Err(StartVmError::ImageTooLarge { size: 8, .. }) => (),
            _ => unreachable!(),
        }
    }
}
