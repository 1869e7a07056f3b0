// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::vstate::hypervisor::{Hypervisor, HypervisorError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use vm_superio::Trigger;

/// Interrupt status bit: the device placed buffers in a used ring.
pub const INTERRUPT_STATUS_USED_RING: u32 = 0x1;
/// Interrupt status bit: the device configuration changed.
pub const INTERRUPT_STATUS_CONFIG_CHANGED: u32 = 0x2;

/// An interrupt line of the in-kernel interrupt controller.
#[derive(Clone)]
pub struct IrqLine {
    hypervisor: Arc<dyn Hypervisor>,
    irq: u32,
}

impl IrqLine {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, irq: u32) -> Self {
        IrqLine { hypervisor, irq }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn assert(&self) -> Result<(), HypervisorError> {
        self.hypervisor.set_irq_line(self.irq, true)
    }

    pub fn deassert(&self) -> Result<(), HypervisorError> {
        self.hypervisor.set_irq_line(self.irq, false)
    }

    /// Edge: raise then drop the line.
    pub fn pulse(&self) -> Result<(), HypervisorError> {
        self.assert()?;
        self.deassert()
    }
}

impl Trigger for IrqLine {
    type E = HypervisorError;

    fn trigger(&self) -> Result<(), HypervisorError> {
        self.pulse()
    }
}

/// Interrupt status register of a virtio-mmio device and the line behind it.
///
/// The line stays asserted while any status bit is pending, and drops once
/// the guest acknowledged all of them.
#[derive(Clone)]
pub struct VirtioInterrupt {
    status: Arc<AtomicU32>,
    line: IrqLine,
}

impl VirtioInterrupt {
    pub fn new(line: IrqLine) -> Self {
        VirtioInterrupt {
            status: Arc::new(AtomicU32::new(0)),
            line,
        }
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn trigger(&self, bits: u32) -> Result<(), HypervisorError> {
        self.status.fetch_or(bits, Ordering::SeqCst);
        self.line.assert()
    }

    pub fn ack(&self, bits: u32) -> Result<(), HypervisorError> {
        let previous = self.status.fetch_and(!bits, Ordering::SeqCst);
        if previous != 0 && previous & !bits == 0 {
            self.line.deassert()?;
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<(), HypervisorError> {
        if self.status.swap(0, Ordering::SeqCst) != 0 {
            self.line.deassert()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::test_utils::MockHypervisor;

    pub(crate) fn setup_line(irq: u32) -> (MockHypervisor, IrqLine) {
        let hv = MockHypervisor::new();
        hv.create_irqchip(1).unwrap();
        let line = IrqLine::new(Arc::new(hv.clone()), irq);
        (hv, line)
    }

    #[test]
    fn test_irq_line() {
        let (hv, line) = setup_line(33);
        assert_eq!(line.irq(), 33);
        line.assert().unwrap();
        assert!(hv.irq_level(33));
        line.deassert().unwrap();
        assert!(!hv.irq_level(33));
        line.trigger().unwrap();
        assert!(!hv.irq_level(33));
        assert_eq!(
            hv.irq_events(),
            vec![(33, true), (33, false), (33, true), (33, false)]
        );
    }

    #[test]
    fn test_irq_line_without_irqchip() {
        let hv = MockHypervisor::new();
        let line = IrqLine::new(Arc::new(hv), 1);
        assert!(line.assert().is_err());
    }

    #[test]
    fn test_virtio_interrupt_ack() {
        let (hv, line) = setup_line(48);
        let interrupt = VirtioInterrupt::new(line);

        interrupt.trigger(INTERRUPT_STATUS_USED_RING).unwrap();
        interrupt
            .trigger(INTERRUPT_STATUS_CONFIG_CHANGED)
            .unwrap();
        assert_eq!(interrupt.status(), 0x3);
        assert!(hv.irq_level(48));

        // Partial ack keeps the line up.
        interrupt.ack(INTERRUPT_STATUS_USED_RING).unwrap();
        assert_eq!(interrupt.status(), INTERRUPT_STATUS_CONFIG_CHANGED);
        assert!(hv.irq_level(48));

        interrupt.ack(INTERRUPT_STATUS_CONFIG_CHANGED).unwrap();
        assert_eq!(interrupt.status(), 0);
        assert!(!hv.irq_level(48));

        // Nothing pending, nothing to drop.
        let events = hv.irq_events().len();
        interrupt.ack(INTERRUPT_STATUS_USED_RING).unwrap();
        assert_eq!(hv.irq_events().len(), events);
    }

    #[test]
    fn test_virtio_interrupt_reset() {
        let (hv, line) = setup_line(48);
        let interrupt = VirtioInterrupt::new(line);
        interrupt.trigger(INTERRUPT_STATUS_USED_RING).unwrap();
        let shared = interrupt.clone();
        shared.reset().unwrap();
        assert_eq!(interrupt.status(), 0);
        assert!(!hv.irq_level(48));
    }
}
