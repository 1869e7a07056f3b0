// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};
use vm_memory::GuestAddress;

use crate::devices::{
    irq::VirtioInterrupt,
    registry::MmioDevice,
    virtio::{queue::Queue, status, virtio_device::VirtioDevice},
};
use crate::vstate::memory::GuestMemoryMmap;

/// Offset from the base MMIO address of a virtio device used by the guest
/// to notify the device of queue events
pub const NOTIFY_REG_OFFSET: u64 = 0x50;

/// Offset of the device specific configuration space.
pub const CONFIG_SPACE_OFFSET: u64 = 0x100;

const VENDOR_ID: u32 = 0x0;
const MMIO_MAGIC_VALUE: u32 = 0x74726976;
const MMIO_VERSION: u32 = 0x2;

/// Implements the
/// [MMIO](http://docs.oasis-open.org/virtio/virtio/v1.0/cs04/virtio-v1.0-cs04.html#x1-1090002)
/// transport for virtio devices.
///
/// Register accesses are 32 bits wide, except in the configuration space.
/// The device is activated when the driver sets `DRIVER_OK`, and the
/// interrupt line follows the interrupt status register.
pub struct MmioTransport {
    device: Box<dyn VirtioDevice>,
    device_activated: bool,

    features_select: u32,
    acked_features_select: u32,
    acked_features: u64,
    queue_select: u32,
    driver_status: u32,
    config_generation: u32,

    interrupt: VirtioInterrupt,
    queues: Vec<Queue>,
    mem: GuestMemoryMmap,
}

impl MmioTransport {
    pub fn new(
        mem: GuestMemoryMmap,
        device: Box<dyn VirtioDevice>,
        interrupt: VirtioInterrupt,
    ) -> Self {
        let queues = device
            .queue_max_sizes()
            .iter()
            .map(|&s| Queue::new(s))
            .collect();
        MmioTransport {
            device,
            device_activated: false,
            features_select: 0,
            acked_features_select: 0,
            acked_features: 0,
            queue_select: 0,
            driver_status: 0,
            config_generation: 0,
            interrupt,
            queues,
            mem,
        }
    }

    pub fn device_status(&self) -> u32 {
        self.driver_status
    }

    pub fn is_activated(&self) -> bool {
        self.device_activated
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    fn check_device_status(&self, set: u32, clr: u32) -> bool {
        self.driver_status & (set | clr) == set
    }

    fn offered_features(&self) -> u64 {
        u64::from(self.device.features(0)) | (u64::from(self.device.features(1)) << 32)
    }

    fn with_queue<U, F>(&self, d: U, f: F) -> U
    where
        F: FnOnce(&Queue) -> U,
    {
        match self.queues.get(self.queue_select as usize) {
            Some(queue) => f(queue),
            None => d,
        }
    }

    /// Queue configuration is only accepted after feature negotiation, before
    /// the driver is done, on a queue that is not live yet.
    fn with_queue_mut<F: FnOnce(&mut Queue)>(&mut self, f: F) {
        if !self.check_device_status(status::FEATURES_OK, status::DRIVER_OK | status::FAILED) {
            warn!(
                "virtio queue setup with device status 0x{:x}",
                self.driver_status
            );
            return;
        }
        match self.queues.get_mut(self.queue_select as usize) {
            Some(queue) if !queue.ready() => f(queue),
            Some(_) => warn!("virtio queue {} changed while ready", self.queue_select),
            None => warn!("virtio queue {} does not exist", self.queue_select),
        }
    }

    fn set_queue_ready(&mut self, ready: bool) {
        if !self.check_device_status(status::FEATURES_OK, status::DRIVER_OK | status::FAILED) {
            warn!(
                "virtio queue ready with device status 0x{:x}",
                self.driver_status
            );
            return;
        }
        let mem = &self.mem;
        if let Some(queue) = self.queues.get_mut(self.queue_select as usize) {
            if let Err(e) = queue.set_ready(ready, mem) {
                warn!("cannot enable virtio queue {}: {}", self.queue_select, e);
            }
        }
    }

    fn ack_features(&mut self, value: u32) {
        if !self.check_device_status(status::DRIVER, status::FEATURES_OK | status::FAILED) {
            warn!(
                "virtio features acked with device status 0x{:x}",
                self.driver_status
            );
            return;
        }
        match self.acked_features_select {
            0 => self.acked_features |= u64::from(value),
            1 => self.acked_features |= u64::from(value) << 32,
            page => {
                warn!("virtio features acked on unknown page {}", page);
                return;
            }
        }
        self.device.ack_features(self.acked_features_select, value);
    }

    fn set_status(&mut self, value: u32) {
        if value == 0 {
            self.reset_device();
            return;
        }
        if value & status::FAILED != 0 {
            warn!("virtio driver failed, device status 0x{:x}", value);
            self.driver_status |= status::FAILED;
            return;
        }
        if value == self.driver_status {
            return;
        }
        if status::next_in_handshake(self.driver_status) != Some(value) {
            warn!(
                "invalid virtio device status transition 0x{:x} -> 0x{:x}",
                self.driver_status, value
            );
            return;
        }

        if value & !self.driver_status == status::FEATURES_OK {
            let unoffered = self.acked_features & !self.offered_features();
            if unoffered != 0 {
                warn!("driver acked features 0x{:x} which were not offered", unoffered);
                return;
            }
        }
        self.driver_status = value;

        if value & status::DRIVER_OK != 0 {
            self.activate();
        }
    }

    fn activate(&mut self) {
        match self.device.activate(
            self.mem.clone(),
            self.interrupt.clone(),
            self.queues.clone(),
        ) {
            Ok(()) => {
                info!("virtio device type {} activated", self.device.device_type());
                self.device_activated = true;
            }
            Err(e) => {
                error!("failed to activate virtio device: {}", e);
                self.driver_status |= status::DEVICE_NEEDS_RESET;
            }
        }
    }

    fn reset_device(&mut self) {
        debug!("virtio device type {} reset", self.device.device_type());
        self.device.reset();
        self.device_activated = false;
        self.features_select = 0;
        self.acked_features_select = 0;
        self.acked_features = 0;
        self.queue_select = 0;
        self.driver_status = 0;
        for queue in self.queues.iter_mut() {
            queue.reset();
        }
        if let Err(e) = self.interrupt.reset() {
            warn!("cannot deassert virtio interrupt: {}", e);
        }
    }
}

impl MmioDevice for MmioTransport {
    // OASIS: MMIO Device Register Layout
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        match offset {
            0x00..=0xff if data.len() == 4 => {
                let v = match offset {
                    0x0 => MMIO_MAGIC_VALUE,
                    0x04 => MMIO_VERSION,
                    0x08 => self.device.device_type(),
                    0x0c => VENDOR_ID,
                    0x10 => self.device.features(self.features_select),
                    0x34 => self.with_queue(0, |q| u32::from(q.max_size())),
                    0x44 => self.with_queue(0, |q| u32::from(q.ready())),
                    0x60 => self.interrupt.status(),
                    0x70 => self.driver_status,
                    0xfc => self.config_generation,
                    _ => {
                        debug!("unknown virtio mmio register read: 0x{:x}", offset);
                        0
                    }
                };
                LittleEndian::write_u32(data, v);
            }
            0x100..=0xfff => self.device.read_config(offset - CONFIG_SPACE_OFFSET, data),
            _ => {
                warn!(
                    "invalid virtio mmio read: 0x{:x}:0x{:x}",
                    offset,
                    data.len()
                );
                data.fill(0);
            }
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        fn hi(v: &mut GuestAddress, x: u32) {
            *v = GuestAddress((v.0 & 0xffff_ffff) | (u64::from(x) << 32))
        }

        fn lo(v: &mut GuestAddress, x: u32) {
            *v = GuestAddress((v.0 & !0xffff_ffff) | u64::from(x))
        }

        match offset {
            0x00..=0xff if data.len() == 4 => {
                let v = LittleEndian::read_u32(data);
                match offset {
                    0x14 => self.features_select = v,
                    0x20 => self.ack_features(v),
                    0x24 => self.acked_features_select = v,
                    0x30 => self.queue_select = v,
                    0x38 => self.with_queue_mut(|q| q.size = v as u16),
                    0x44 => self.set_queue_ready(v == 1),
                    0x50 => {
                        if self.device_activated {
                            self.device.queue_notify(v);
                        } else {
                            warn!("virtio queue {} notified before activation", v);
                        }
                    }
                    0x64 => {
                        if let Err(e) = self.interrupt.ack(v) {
                            warn!("cannot deassert virtio interrupt: {}", e);
                        }
                    }
                    0x70 => self.set_status(v),
                    0x80 => self.with_queue_mut(|q| lo(&mut q.desc_table, v)),
                    0x84 => self.with_queue_mut(|q| hi(&mut q.desc_table, v)),
                    0x90 => self.with_queue_mut(|q| lo(&mut q.avail_ring, v)),
                    0x94 => self.with_queue_mut(|q| hi(&mut q.avail_ring, v)),
                    0xa0 => self.with_queue_mut(|q| lo(&mut q.used_ring, v)),
                    0xa4 => self.with_queue_mut(|q| hi(&mut q.used_ring, v)),
                    _ => debug!("unknown virtio mmio register write: 0x{:x}", offset),
                }
            }
            0x100..=0xfff => {
                if self.check_device_status(status::DRIVER, status::FAILED) {
                    self.device.write_config(offset - CONFIG_SPACE_OFFSET, data)
                } else {
                    warn!("virtio config space write before the driver is loaded");
                }
            }
            _ => {
                warn!(
                    "invalid virtio mmio write: 0x{:x}:0x{:x}",
                    offset,
                    data.len()
                );
            }
        }
    }

    fn reset(&mut self) {
        self.reset_device();
    }

    fn enqueue_input(&mut self, data: &[u8]) -> bool {
        self.device.receive_input(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::devices::irq::tests::setup_line;
    use crate::devices::irq::{VirtioInterrupt, INTERRUPT_STATUS_USED_RING};
    use crate::devices::virtio::queue::tests::{create_guest_memory, GuestQueue, MEM_BASE};
    use crate::devices::virtio::virtio_device::ActivateError;
    use crate::utils::test_utils::MockHypervisor;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub(crate) struct DummyState {
        pub activations: usize,
        pub resets: usize,
        pub notified: Vec<u32>,
        pub acked: Vec<(u32, u32)>,
        pub interrupt: Option<VirtioInterrupt>,
        pub queues: Vec<Queue>,
    }

    pub(crate) struct DummyDevice {
        state: Arc<Mutex<DummyState>>,
        config: [u8; 8],
    }

    impl DummyDevice {
        pub(crate) fn new() -> (Self, Arc<Mutex<DummyState>>) {
            let state = Arc::new(Mutex::new(DummyState::default()));
            let device = DummyDevice {
                state: state.clone(),
                config: [0x10, 0x20, 0x30, 0x40, 0, 0, 0, 0],
            };
            (device, state)
        }
    }

    impl VirtioDevice for DummyDevice {
        fn device_type(&self) -> u32 {
            0x2a
        }

        fn queue_max_sizes(&self) -> &[u16] {
            &[16, 8]
        }

        fn features(&self, page: u32) -> u32 {
            match page {
                0 => 0x1,
                1 => 0x1,
                _ => 0,
            }
        }

        fn ack_features(&mut self, page: u32, value: u32) {
            self.state.lock().unwrap().acked.push((page, value));
        }

        fn read_config(&self, offset: u64, data: &mut [u8]) {
            let start = offset as usize;
            data.copy_from_slice(&self.config[start..start + data.len()]);
        }

        fn write_config(&mut self, offset: u64, data: &[u8]) {
            let start = offset as usize;
            self.config[start..start + data.len()].copy_from_slice(data);
        }

        fn activate(
            &mut self,
            _mem: GuestMemoryMmap,
            interrupt: VirtioInterrupt,
            queues: Vec<Queue>,
        ) -> Result<(), ActivateError> {
            let mut state = self.state.lock().unwrap();
            state.activations += 1;
            state.interrupt = Some(interrupt);
            state.queues = queues;
            Ok(())
        }

        fn queue_notify(&mut self, index: u32) {
            self.state.lock().unwrap().notified.push(index);
        }

        fn reset(&mut self) {
            self.state.lock().unwrap().resets += 1;
        }
    }

    pub(crate) fn read_reg(transport: &mut MmioTransport, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        transport.read(offset, &mut data);
        LittleEndian::read_u32(&data)
    }

    pub(crate) fn write_reg(transport: &mut MmioTransport, offset: u64, value: u32) {
        let mut data = [0u8; 4];
        LittleEndian::write_u32(&mut data, value);
        transport.write(offset, &data);
    }

    /// Programs queue `index` with the layout of `guest` and marks it ready.
    pub(crate) fn setup_queue(transport: &mut MmioTransport, index: u32, guest: &GuestQueue) {
        write_reg(transport, 0x30, index);
        write_reg(transport, 0x38, u32::from(guest.size));
        write_reg(transport, 0x80, guest.desc_table.0 as u32);
        write_reg(transport, 0x84, (guest.desc_table.0 >> 32) as u32);
        write_reg(transport, 0x90, guest.avail_ring.0 as u32);
        write_reg(transport, 0x94, (guest.avail_ring.0 >> 32) as u32);
        write_reg(transport, 0xa0, guest.used_ring.0 as u32);
        write_reg(transport, 0xa4, (guest.used_ring.0 >> 32) as u32);
        write_reg(transport, 0x44, 1);
    }

    /// ACKNOWLEDGE, DRIVER, features 0 and 1, FEATURES_OK.
    pub(crate) fn negotiate(transport: &mut MmioTransport) {
        write_reg(transport, 0x70, status::ACKNOWLEDGE);
        write_reg(transport, 0x70, status::ACKNOWLEDGE | status::DRIVER);
        for page in 0..2 {
            write_reg(transport, 0x14, page);
            let offered = read_reg(transport, 0x10);
            write_reg(transport, 0x24, page);
            write_reg(transport, 0x20, offered);
        }
        write_reg(
            transport,
            0x70,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK,
        );
    }

    pub(crate) fn driver_ok(transport: &mut MmioTransport) {
        write_reg(
            transport,
            0x70,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );
    }

    fn setup_transport() -> (
        MockHypervisor,
        GuestMemoryMmap,
        MmioTransport,
        Arc<Mutex<DummyState>>,
    ) {
        let (hv, line) = setup_line(48);
        let mem = create_guest_memory();
        let (device, state) = DummyDevice::new();
        let transport = MmioTransport::new(
            mem.clone(),
            Box::new(device),
            VirtioInterrupt::new(line),
        );
        (hv, mem, transport, state)
    }

    #[test]
    fn test_identification_registers() {
        let (_hv, _mem, mut transport, _state) = setup_transport();
        assert_eq!(read_reg(&mut transport, 0x0), 0x7472_6976);
        assert_eq!(read_reg(&mut transport, 0x04), 2);
        assert_eq!(read_reg(&mut transport, 0x08), 0x2a);
        assert_eq!(read_reg(&mut transport, 0x0c), 0);
        assert_eq!(read_reg(&mut transport, 0x34), 16);
        write_reg(&mut transport, 0x30, 1);
        assert_eq!(read_reg(&mut transport, 0x34), 8);
        write_reg(&mut transport, 0x30, 2);
        assert_eq!(read_reg(&mut transport, 0x34), 0);

        // Narrow register reads come back zeroed at the requested width.
        let mut data = [0xffu8; 2];
        transport.read(0x0, &mut data);
        assert_eq!(data, [0, 0]);
        let mut data = [0xffu8; 1];
        transport.read(0x70, &mut data);
        assert_eq!(data, [0]);
    }

    #[test]
    fn test_config_space() {
        let (_hv, _mem, mut transport, _state) = setup_transport();
        let mut data = [0u8; 2];
        transport.read(0x101, &mut data);
        assert_eq!(data, [0x20, 0x30]);

        // Ignored until the driver is loaded.
        transport.write(0x100, &[0xaa]);
        transport.read(0x100, &mut data);
        assert_eq!(data, [0x10, 0x20]);

        write_reg(&mut transport, 0x70, status::ACKNOWLEDGE);
        write_reg(&mut transport, 0x70, status::ACKNOWLEDGE | status::DRIVER);
        transport.write(0x100, &[0xaa]);
        transport.read(0x100, &mut data);
        assert_eq!(data, [0xaa, 0x20]);
    }

    #[test]
    fn test_status_handshake() {
        let (_hv, mem, mut transport, state) = setup_transport();
        let guest = GuestQueue::new(&mem, MEM_BASE, 8);

        // Out of order transitions are ignored.
        write_reg(&mut transport, 0x70, status::DRIVER);
        assert_eq!(read_reg(&mut transport, 0x70), 0);
        write_reg(&mut transport, 0x70, status::ACKNOWLEDGE);
        write_reg(
            &mut transport,
            0x70,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK,
        );
        assert_eq!(read_reg(&mut transport, 0x70), status::ACKNOWLEDGE);

        write_reg(&mut transport, 0x70, 0);
        negotiate(&mut transport);
        assert_eq!(
            read_reg(&mut transport, 0x70),
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK
        );
        assert_eq!(state.lock().unwrap().acked, vec![(0, 1), (1, 1)]);

        setup_queue(&mut transport, 0, &guest);
        assert_eq!(read_reg(&mut transport, 0x44), 1);
        assert!(transport.queues()[0].ready());
        assert!(!transport.is_activated());

        driver_ok(&mut transport);
        assert!(transport.is_activated());
        let state = state.lock().unwrap();
        assert_eq!(state.activations, 1);
        assert_eq!(state.queues.len(), 2);
        assert_eq!(state.queues[0].desc_table, guest.desc_table);
        assert_eq!(state.queues[0].size, 8);
        assert!(!state.queues[1].ready());
    }

    #[test]
    fn test_unoffered_features_refused() {
        let (_hv, _mem, mut transport, _state) = setup_transport();
        write_reg(&mut transport, 0x70, status::ACKNOWLEDGE);
        write_reg(&mut transport, 0x70, status::ACKNOWLEDGE | status::DRIVER);
        write_reg(&mut transport, 0x24, 0);
        write_reg(&mut transport, 0x20, 0x3);
        write_reg(
            &mut transport,
            0x70,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK,
        );
        assert_eq!(
            read_reg(&mut transport, 0x70),
            status::ACKNOWLEDGE | status::DRIVER
        );
    }

    #[test]
    fn test_queue_setup_requires_features_ok() {
        let (_hv, mem, mut transport, _state) = setup_transport();
        let guest = GuestQueue::new(&mem, MEM_BASE, 8);
        setup_queue(&mut transport, 0, &guest);
        assert!(!transport.queues()[0].ready());
        assert_eq!(transport.queues()[0].desc_table, GuestAddress(0));

        negotiate(&mut transport);
        setup_queue(&mut transport, 0, &guest);
        assert!(transport.queues()[0].ready());
        // Ready queues cannot be moved.
        write_reg(&mut transport, 0x80, 0x1234_0000);
        assert_eq!(transport.queues()[0].desc_table, guest.desc_table);

        // Invalid size is refused when marking ready.
        write_reg(&mut transport, 0x30, 1);
        write_reg(&mut transport, 0x38, 16);
        write_reg(&mut transport, 0x44, 1);
        assert!(!transport.queues()[1].ready());
    }

    #[test]
    fn test_failed_status() {
        let (_hv, _mem, mut transport, state) = setup_transport();
        negotiate(&mut transport);
        write_reg(&mut transport, 0x70, status::FAILED);
        assert_ne!(read_reg(&mut transport, 0x70) & status::FAILED, 0);
        driver_ok(&mut transport);
        assert!(!transport.is_activated());
        assert_eq!(state.lock().unwrap().activations, 0);
    }

    #[test]
    fn test_notify() {
        let (_hv, mem, mut transport, state) = setup_transport();
        let guest = GuestQueue::new(&mem, MEM_BASE, 8);
        write_reg(&mut transport, 0x50, 0);
        negotiate(&mut transport);
        setup_queue(&mut transport, 0, &guest);
        write_reg(&mut transport, 0x50, 0);
        assert!(state.lock().unwrap().notified.is_empty());

        driver_ok(&mut transport);
        write_reg(&mut transport, 0x50, 0);
        assert_eq!(state.lock().unwrap().notified, vec![0]);
    }

    #[test]
    fn test_interrupt_ack() {
        let (hv, mem, mut transport, state) = setup_transport();
        let guest = GuestQueue::new(&mem, MEM_BASE, 8);
        negotiate(&mut transport);
        setup_queue(&mut transport, 0, &guest);
        driver_ok(&mut transport);

        let interrupt = state.lock().unwrap().interrupt.clone().unwrap();
        interrupt.trigger(INTERRUPT_STATUS_USED_RING).unwrap();
        assert_eq!(read_reg(&mut transport, 0x60), INTERRUPT_STATUS_USED_RING);
        assert!(hv.irq_level(48));

        write_reg(&mut transport, 0x64, INTERRUPT_STATUS_USED_RING);
        assert_eq!(read_reg(&mut transport, 0x60), 0);
        assert!(!hv.irq_level(48));
    }

    #[test]
    fn test_reset() {
        let (hv, mem, mut transport, state) = setup_transport();
        let guest = GuestQueue::new(&mem, MEM_BASE, 8);
        negotiate(&mut transport);
        setup_queue(&mut transport, 0, &guest);
        driver_ok(&mut transport);
        let interrupt = state.lock().unwrap().interrupt.clone().unwrap();
        interrupt.trigger(INTERRUPT_STATUS_USED_RING).unwrap();

        write_reg(&mut transport, 0x70, 0);
        assert_eq!(read_reg(&mut transport, 0x70), 0);
        assert_eq!(read_reg(&mut transport, 0x60), 0);
        assert!(!hv.irq_level(48));
        assert!(!transport.is_activated());
        assert!(!transport.queues()[0].ready());
        assert_eq!(state.lock().unwrap().resets, 1);

        // The registry level reset does the same.
        negotiate(&mut transport);
        MmioDevice::reset(&mut transport);
        assert_eq!(read_reg(&mut transport, 0x70), 0);
        assert_eq!(state.lock().unwrap().resets, 2);
    }
}
