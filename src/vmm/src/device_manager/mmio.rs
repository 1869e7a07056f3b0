// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    arch,
    devices::{
        irq::{IrqLine, VirtioInterrupt},
        legacy::{SerialDevice, SharedWriter},
        registry::{DeviceRegistry, MmioDevice, RegistryError},
        virtio::{mmio::MmioTransport, virtio_device::VirtioDevice},
    },
    vstate::{hypervisor::Hypervisor, memory::GuestMemoryMmap},
};
use log::info;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum MmioDeviceError {
    /// Failed to insert the device in the registry.
    #[error("Failed to register the device: {0}")]
    Registry(RegistryError),
    /// No more IRQs are available.
    #[error("No more irqs are available")]
    IrqsExhausted,
    /// All virtio-mmio windows are in use.
    #[error("No more mmio windows are available")]
    WindowsExhausted,
}

/// Where a device was placed in the guest physical address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioDeviceInfo {
    pub addr: u64,
    pub len: u64,
    pub irq: u32,
    /// Virtio device id, `None` for platform devices.
    pub device_type: Option<u32>,
}

/// Hands out mmio windows and interrupt lines, and keeps the registry the
/// vcpu loop dispatches through.
pub struct MmioDeviceManager {
    hypervisor: Arc<dyn Hypervisor>,
    guest_mem: GuestMemoryMmap,
    registry: DeviceRegistry,
    devices: Vec<MmioDeviceInfo>,
    console: Option<Arc<Mutex<dyn MmioDevice>>>,
    mmio_base: u64,
    irq: u32,
}

impl MmioDeviceManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, guest_mem: GuestMemoryMmap) -> MmioDeviceManager {
        MmioDeviceManager {
            hypervisor,
            guest_mem,
            registry: DeviceRegistry::new(),
            devices: Vec::new(),
            console: None,
            mmio_base: arch::MMIO_MEM_START,
            irq: arch::IRQ_BASE,
        }
    }

    /// Wraps `device` in a virtio-mmio transport placed in the next free
    /// window.
    pub fn register_virtio(
        &mut self,
        device: Box<dyn VirtioDevice>,
    ) -> Result<(MmioDeviceInfo, Arc<Mutex<dyn MmioDevice>>), MmioDeviceError> {
        if self.irq > arch::IRQ_MAX {
            return Err(MmioDeviceError::IrqsExhausted);
        }
        if self.mmio_base >= arch::MMIO_MEM_START + arch::MMIO_LEN * u64::from(arch::MMIO_SLOTS) {
            return Err(MmioDeviceError::WindowsExhausted);
        }

        let device_type = device.device_type();
        let interrupt = VirtioInterrupt::new(IrqLine::new(self.hypervisor.clone(), self.irq));
        let transport: Arc<Mutex<dyn MmioDevice>> = Arc::new(Mutex::new(MmioTransport::new(
            self.guest_mem.clone(),
            device,
            interrupt,
        )));
        self.registry
            .register(self.mmio_base, arch::MMIO_LEN, transport.clone())
            .map_err(MmioDeviceError::Registry)?;

        let info = MmioDeviceInfo {
            addr: self.mmio_base,
            len: arch::MMIO_LEN,
            irq: self.irq,
            device_type: Some(device_type),
        };
        info!(
            "virtio device type {} at virtio_mmio.device=4K@0x{:08x}:{}",
            device_type, info.addr, info.irq
        );
        self.devices.push(info);
        self.mmio_base += arch::MMIO_LEN;
        self.irq += 1;
        Ok((info, transport))
    }

    /// Places the UART at its fixed address and interrupt.
    pub fn register_serial(
        &mut self,
        out: SharedWriter,
    ) -> Result<(MmioDeviceInfo, Arc<Mutex<dyn MmioDevice>>), MmioDeviceError> {
        let line = IrqLine::new(self.hypervisor.clone(), arch::SERIAL_IRQ);
        let serial: Arc<Mutex<dyn MmioDevice>> = Arc::new(Mutex::new(SerialDevice::new(line, out)));
        self.registry
            .register(arch::SERIAL_MMIO_BASE, arch::SERIAL_MMIO_SIZE, serial.clone())
            .map_err(MmioDeviceError::Registry)?;

        let info = MmioDeviceInfo {
            addr: arch::SERIAL_MMIO_BASE,
            len: arch::SERIAL_MMIO_SIZE,
            irq: arch::SERIAL_IRQ,
            device_type: None,
        };
        info!("serial at 0x{:08x}, irq {}", info.addr, info.irq);
        self.devices.push(info);
        Ok((info, serial))
    }

    /// Selects the device receiving host console input.
    pub fn set_console(&mut self, device: Arc<Mutex<dyn MmioDevice>>) {
        self.console = Some(device);
    }

    /// Forwards host input to the console device. Returns false when there
    /// is no console or it does not take input.
    pub fn enqueue_console_input(&self, data: &[u8]) -> bool {
        match self.console.as_ref() {
            Some(console) => console
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .enqueue_input(data),
            None => false,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn devices(&self) -> &[MmioDeviceInfo] {
        &self.devices
    }
}
