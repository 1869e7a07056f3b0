// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process [`Hypervisor`] that replays scripted exits, for tests that
//! cannot rely on `/dev/kvm`.

use crate::arch::regs;
use crate::devices::registry::MmioDevice;
use crate::vstate::hypervisor::{Capability, Hypervisor, HypervisorError, VcpuBackend};
use crate::vstate::vcpu::run_area::{MmioAccess, RunArea, MMIO_DATA_LEN};
use kvm_bindings::{
    KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN,
    KVM_EXIT_SYSTEM_EVENT,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use utils::errno;

/// One scripted outcome of `run()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockExit {
    MmioRead { addr: u64, len: u32 },
    MmioWrite { addr: u64, data: Vec<u8> },
    Hlt,
    SystemEvent(u32),
    Shutdown,
    FailEntry { reason: u64, cpu: u32 },
    InternalError { suberror: u32 },
    /// Arbitrary exit reason with an empty payload.
    Raw(u32),
    /// The run call fails with EINTR.
    Interrupted,
    /// Input shows up while the guest runs: the flag given to
    /// [`MockHypervisor::set_kick_flag`] is raised and the run fails with EINTR.
    Kicked,
    /// The run call fails with EAGAIN.
    Again,
    /// The run call fails with the given errno.
    Error(i32),
}

/// A registered memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSlot {
    pub guest_addr: u64,
    pub size: u64,
    pub host_addr: u64,
}

#[derive(Debug)]
struct MockState {
    missing_capabilities: Vec<Capability>,
    max_slots: usize,
    slots: BTreeMap<u32, MockSlot>,
    fail_slot_registration: bool,
    exits: VecDeque<MockExit>,
    registers: HashMap<u64, u64>,
    irq_events: Vec<(u32, bool)>,
    mmio_responses: Vec<Vec<u8>>,
    irqchip_created: bool,
    irqchip_finalized: bool,
    vcpus: u32,
    runs: usize,
    kick: Option<Arc<AtomicBool>>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            missing_capabilities: Vec::new(),
            max_slots: 32,
            slots: BTreeMap::new(),
            fail_slot_registration: false,
            exits: VecDeque::new(),
            registers: HashMap::new(),
            irq_events: Vec::new(),
            mmio_responses: Vec::new(),
            irqchip_created: false,
            irqchip_finalized: false,
            vcpus: 0,
            runs: 0,
            kick: None,
        }
    }
}

/// Clones share the same state, so a test can keep a handle while the vmm
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MockHypervisor {
    state: Arc<Mutex<MockState>>,
}

fn err(op: &'static str, errno: i32) -> HypervisorError {
    HypervisorError::new(op, errno::Error::new(errno))
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_exit(&self, exit: MockExit) {
        self.state().exits.push_back(exit);
    }

    pub fn push_exits<I: IntoIterator<Item = MockExit>>(&self, exits: I) {
        self.state().exits.extend(exits);
    }

    pub fn remove_capability(&self, cap: Capability) {
        self.state().missing_capabilities.push(cap);
    }

    pub fn set_max_memory_slots(&self, max: usize) {
        self.state().max_slots = max;
    }

    pub fn set_kick_flag(&self, flag: Arc<AtomicBool>) {
        self.state().kick = Some(flag);
    }

    /// Makes every following slot registration fail with EFAULT.
    pub fn fail_slot_registration(&self, fail: bool) {
        self.state().fail_slot_registration = fail;
    }

    pub fn memory_slots(&self) -> BTreeMap<u32, MockSlot> {
        self.state().slots.clone()
    }

    pub fn register(&self, id: u64) -> Option<u64> {
        self.state().registers.get(&id).copied()
    }

    /// Every `set_irq_line` call, in order.
    pub fn irq_events(&self) -> Vec<(u32, bool)> {
        self.state().irq_events.clone()
    }

    /// Current level of `irq`.
    pub fn irq_level(&self, irq: u32) -> bool {
        self.state()
            .irq_events
            .iter()
            .rev()
            .find(|(line, _)| *line == irq)
            .map_or(false, |(_, level)| *level)
    }

    /// Data the guest received for each answered mmio read, in order.
    pub fn mmio_responses(&self) -> Vec<Vec<u8>> {
        self.state().mmio_responses.clone()
    }

    pub fn irqchip_state(&self) -> (bool, bool) {
        let state = self.state();
        (state.irqchip_created, state.irqchip_finalized)
    }

    pub fn vcpu_count(&self) -> u32 {
        self.state().vcpus
    }

    /// Number of run calls, interrupted ones included.
    pub fn run_count(&self) -> usize {
        self.state().runs
    }

    pub fn pending_exits(&self) -> usize {
        self.state().exits.len()
    }
}

impl Hypervisor for MockHypervisor {
    fn check_capability(&self, cap: Capability) -> bool {
        !self.state().missing_capabilities.contains(&cap)
    }

    fn max_memory_slots(&self) -> usize {
        self.state().max_slots
    }

    unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<(), HypervisorError> {
        const OP: &str = "KVM_SET_USER_MEMORY_REGION";
        let mut state = self.state();
        if state.fail_slot_registration {
            return Err(err(OP, libc::EFAULT));
        }
        if size == 0 {
            state.slots.remove(&slot);
            return Ok(());
        }
        if slot as usize >= state.max_slots {
            return Err(err(OP, libc::EINVAL));
        }
        let overlaps = state.slots.iter().any(|(s, r)| {
            *s != slot && guest_addr < r.guest_addr + r.size && r.guest_addr < guest_addr + size
        });
        if overlaps {
            return Err(err(OP, libc::EEXIST));
        }
        state.slots.insert(
            slot,
            MockSlot {
                guest_addr,
                size,
                host_addr,
            },
        );
        Ok(())
    }

    fn create_vcpu(&self, _id: u32) -> Result<Box<dyn VcpuBackend>, HypervisorError> {
        let run_area =
            RunArea::anonymous().map_err(|_| err("mmap kvm_run", libc::ENOMEM))?;
        self.state().vcpus += 1;
        Ok(Box::new(MockVcpu {
            state: self.state.clone(),
            run_area,
            last_read: None,
        }))
    }

    fn create_irqchip(&self, _vcpu_count: u32) -> Result<(), HypervisorError> {
        let mut state = self.state();
        if state.irqchip_created {
            return Err(err("KVM_CREATE_DEVICE", libc::EEXIST));
        }
        if state.vcpus != 0 {
            return Err(err("KVM_CREATE_DEVICE", libc::EBUSY));
        }
        state.irqchip_created = true;
        Ok(())
    }

    fn finalize_irqchip(&self) -> Result<(), HypervisorError> {
        let mut state = self.state();
        if !state.irqchip_created {
            return Err(err("KVM_DEV_ARM_VGIC_CTRL_INIT", libc::ENODEV));
        }
        state.irqchip_finalized = true;
        Ok(())
    }

    fn set_irq_line(&self, irq: u32, level: bool) -> Result<(), HypervisorError> {
        let mut state = self.state();
        if !state.irqchip_created {
            return Err(err("KVM_IRQ_LINE", libc::ENXIO));
        }
        state.irq_events.push((irq, level));
        Ok(())
    }
}

struct MockVcpu {
    state: Arc<Mutex<MockState>>,
    run_area: RunArea,
    /// Width of the mmio read exit last delivered.
    last_read: Option<usize>,
}

impl MockVcpu {
    fn write_exit(&self, exit: &MockExit) {
        let run = &self.run_area;
        match exit {
            MockExit::MmioRead { addr, len } => {
                run.set_exit_reason(KVM_EXIT_MMIO);
                run.set_mmio(&MmioAccess {
                    phys_addr: *addr,
                    data: [0; MMIO_DATA_LEN],
                    len: *len,
                    is_write: false,
                });
            }
            MockExit::MmioWrite { addr, data } => {
                let mut buf = [0u8; MMIO_DATA_LEN];
                let len = std::cmp::min(data.len(), MMIO_DATA_LEN);
                buf[..len].copy_from_slice(&data[..len]);
                run.set_exit_reason(KVM_EXIT_MMIO);
                run.set_mmio(&MmioAccess {
                    phys_addr: *addr,
                    data: buf,
                    len: len as u32,
                    is_write: true,
                });
            }
            MockExit::Hlt => run.set_exit_reason(KVM_EXIT_HLT),
            MockExit::SystemEvent(event) => {
                run.set_exit_reason(KVM_EXIT_SYSTEM_EVENT);
                run.set_system_event_type(*event);
            }
            MockExit::Shutdown => run.set_exit_reason(KVM_EXIT_SHUTDOWN),
            MockExit::FailEntry { reason, cpu } => {
                run.set_exit_reason(KVM_EXIT_FAIL_ENTRY);
                run.set_fail_entry(*reason, *cpu);
            }
            MockExit::InternalError { suberror } => {
                run.set_exit_reason(KVM_EXIT_INTERNAL_ERROR);
                run.set_internal_suberror(*suberror);
            }
            MockExit::Raw(reason) => run.set_exit_reason(*reason),
            MockExit::Interrupted | MockExit::Kicked | MockExit::Again | MockExit::Error(_) => (),
        }
    }
}

impl VcpuBackend for MockVcpu {
    fn init(&mut self) -> Result<(), HypervisorError> {
        Ok(())
    }

    fn get_register(&self, id: u64) -> Result<u64, HypervisorError> {
        if !regs::is_core_reg(id) {
            return Err(err("KVM_GET_ONE_REG", libc::ENOENT));
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.registers.get(&id).copied().unwrap_or(0))
    }

    fn set_register(&mut self, id: u64, value: u64) -> Result<(), HypervisorError> {
        if !regs::is_core_reg(id) {
            return Err(err("KVM_SET_ONE_REG", libc::ENOENT));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.registers.insert(id, value);
        Ok(())
    }

    fn run(&mut self) -> Result<(), HypervisorError> {
        // The guest consumes the response to its previous read on entry.
        if let Some(len) = self.last_read.take() {
            let data = self.run_area.mmio().data;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.mmio_responses.push(data[..len].to_vec());
        }

        let (exit, kick) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.runs += 1;
            (state.exits.pop_front(), state.kick.clone())
        };
        match exit {
            // An exhausted script behaves like a vcpu whose guest went away.
            None => Err(err("KVM_RUN", libc::ENOEXEC)),
            Some(MockExit::Interrupted) => Err(err("KVM_RUN", libc::EINTR)),
            Some(MockExit::Kicked) => {
                if let Some(kick) = kick {
                    kick.store(true, Ordering::SeqCst);
                }
                Err(err("KVM_RUN", libc::EINTR))
            }
            Some(MockExit::Again) => Err(err("KVM_RUN", libc::EAGAIN)),
            Some(MockExit::Error(errno)) => Err(err("KVM_RUN", errno)),
            Some(exit) => {
                self.write_exit(&exit);
                if let MockExit::MmioRead { len, .. } = exit {
                    self.last_read = Some(std::cmp::min(len as usize, MMIO_DATA_LEN));
                }
                Ok(())
            }
        }
    }

    fn run_area(&self) -> &RunArea {
        &self.run_area
    }
}

/// Access seen by a [`RecordingDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAccess {
    Read { offset: u64, len: usize },
    Write { offset: u64, data: Vec<u8> },
}

/// Device that logs every access and answers reads with a fixed byte.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub accesses: Vec<DeviceAccess>,
    pub resets: usize,
    pub input: Vec<u8>,
    pub read_value: u8,
}

impl RecordingDevice {
    pub fn new(read_value: u8) -> Self {
        RecordingDevice {
            read_value,
            ..Default::default()
        }
    }
}

impl MmioDevice for RecordingDevice {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        self.accesses.push(DeviceAccess::Read {
            offset,
            len: data.len(),
        });
        data.fill(self.read_value);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        self.accesses.push(DeviceAccess::Write {
            offset,
            data: data.to_vec(),
        });
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn enqueue_input(&mut self, data: &[u8]) -> bool {
        self.input.extend_from_slice(data);
        true
    }
}
