// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

pub mod arch;
pub mod builder;
pub mod device_manager;
pub mod devices;
pub mod resources;
pub mod utils;
pub mod vmm_config;
pub mod vstate;

use crate::{
    device_manager::mmio::MmioDeviceManager,
    devices::epoll::{EpollContext, EpollContextError, InputWatcher},
    vmm_config::machine_config::UnhandledMmioPolicy,
    vstate::{
        hypervisor::Hypervisor,
        memory::GuestMemoryManager,
        vcpu::{ExitRecord, SystemEvent, Vcpu, VcpuError},
    },
};
use log::{debug, error, info, warn};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Errors associated with the VMM internal logic.
#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    /// Vcpu run or register error.
    #[error("Vcpu error: {0}")]
    Vcpu(VcpuError),
    /// No device claims the access and the policy is fatal.
    #[error("Unhandled mmio access at 0x{addr:x} (write: {is_write})")]
    UnhandledMmio { addr: u64, is_write: bool },
    /// The kernel could not enter the guest.
    #[error("Failed to enter the guest: hardware reason 0x{reason:x} on cpu {cpu}")]
    FailEntry { reason: u64, cpu: u32 },
    /// The kernel reported an internal error.
    #[error("Internal hypervisor error, suberror {suberror}")]
    InternalError { suberror: u32 },
    /// Exit reason the loop does not know.
    #[error("Unexpected vcpu exit reason {0}")]
    UnexpectedExit(u32),
    /// System event the loop does not know.
    #[error("Unexpected system event {0}")]
    UnexpectedSystemEvent(u32),
    /// Host input could not be polled.
    #[error("Host input error: {0}")]
    Input(EpollContextError),
}

/// How a guest run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExitStatus {
    /// The guest powered off.
    Shutdown,
    /// The guest requested a reset. Devices were reset.
    Reset,
    /// The guest reported a crash.
    Crashed,
    Halted,
    /// The configured number of exits was handled.
    ExitLimitReached,
}

pub struct Vmm {
    // Dropped in declaration order: the vcpu and devices go before memory.
    vcpu: Vcpu,
    mmio_device_manager: MmioDeviceManager,
    epoll_context: Option<EpollContext>,
    guest_memory: GuestMemoryManager,
    hypervisor: Arc<dyn Hypervisor>,
    unhandled_mmio: UnhandledMmioPolicy,
    exits: u64,
}

impl Vmm {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        vcpu: Vcpu,
        mmio_device_manager: MmioDeviceManager,
        epoll_context: Option<EpollContext>,
        guest_memory: GuestMemoryManager,
        unhandled_mmio: UnhandledMmioPolicy,
    ) -> Self {
        Vmm {
            vcpu,
            mmio_device_manager,
            epoll_context,
            guest_memory,
            hypervisor,
            unhandled_mmio,
            exits: 0,
        }
    }

    pub fn guest_memory(&self) -> &GuestMemoryManager {
        &self.guest_memory
    }

    pub fn mmio_device_manager(&self) -> &MmioDeviceManager {
        &self.mmio_device_manager
    }

    pub fn vcpu(&self) -> &Vcpu {
        &self.vcpu
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Exits handled over the lifetime of the vm.
    pub fn exit_count(&self) -> u64 {
        self.exits
    }

    /// Runs the guest until it stops, fails, or `exit_limit` exits were
    /// handled by this call.
    ///
    /// Host input that becomes readable while the guest runs pulls the vcpu
    /// out of the guest, so it is delivered even to a guest that never exits
    /// on its own.
    pub fn run(&mut self, exit_limit: Option<u64>) -> Result<VmExitStatus, VmmError> {
        let mut watcher = self.watch_input()?;
        let no_input = AtomicBool::new(false);
        let mut handled: u64 = 0;
        loop {
            if exit_limit.map_or(false, |limit| handled >= limit) {
                info!("exit limit of {} reached", handled);
                return Ok(VmExitStatus::ExitLimitReached);
            }
            self.process_input()?;
            if watcher.is_some() && !self.has_input() {
                watcher = None;
            }

            let kick = watcher.as_ref().map_or(&no_input, |w| w.pending());
            let exit = match self.vcpu.run_until_kicked(kick).map_err(VmmError::Vcpu)? {
                Some(exit) => exit,
                None => continue,
            };
            handled += 1;
            self.exits += 1;
            if let Some(status) = self.handle_exit(exit)? {
                info!("vm stopped: {:?} after {} exits", status, self.exits);
                return Ok(status);
            }
        }
    }

    /// Services one exit. Returns the final status once the guest stopped.
    fn handle_exit(&mut self, exit: ExitRecord) -> Result<Option<VmExitStatus>, VmmError> {
        match exit {
            ExitRecord::MmioRead { addr, len } => {
                let mut buf = [0u8; 8];
                let data = &mut buf[..len];
                if !self
                    .mmio_device_manager
                    .registry()
                    .dispatch(addr, false, data)
                {
                    self.unhandled_mmio(addr, false, len)?;
                    data.fill(0);
                }
                self.vcpu
                    .set_exit_response(data)
                    .map_err(VmmError::Vcpu)?;
                Ok(None)
            }
            ExitRecord::MmioWrite { addr, data } => {
                let mut buf = [0u8; 8];
                let len = data.as_slice().len();
                buf[..len].copy_from_slice(data.as_slice());
                if !self
                    .mmio_device_manager
                    .registry()
                    .dispatch(addr, true, &mut buf[..len])
                {
                    self.unhandled_mmio(addr, true, len)?;
                }
                Ok(None)
            }
            ExitRecord::SystemEvent(SystemEvent::Shutdown) => Ok(Some(VmExitStatus::Shutdown)),
            ExitRecord::SystemEvent(SystemEvent::Reset) => {
                self.mmio_device_manager.registry().reset_all();
                Ok(Some(VmExitStatus::Reset))
            }
            ExitRecord::SystemEvent(SystemEvent::Crash) => Ok(Some(VmExitStatus::Crashed)),
            ExitRecord::SystemEvent(SystemEvent::Other(event)) => {
                Err(VmmError::UnexpectedSystemEvent(event))
            }
            ExitRecord::Hlt => Ok(Some(VmExitStatus::Halted)),
            ExitRecord::Shutdown => Ok(Some(VmExitStatus::Shutdown)),
            ExitRecord::FailEntry { reason, cpu } => {
                error!("vcpu failed to enter the guest: reason 0x{:x}", reason);
                Err(VmmError::FailEntry { reason, cpu })
            }
            ExitRecord::InternalError { suberror } => {
                error!("internal hypervisor error, suberror {}", suberror);
                Err(VmmError::InternalError { suberror })
            }
            ExitRecord::Unknown(reason) => Err(VmmError::UnexpectedExit(reason)),
        }
    }

    fn unhandled_mmio(&self, addr: u64, is_write: bool, len: usize) -> Result<(), VmmError> {
        match self.unhandled_mmio {
            UnhandledMmioPolicy::Ignore => {
                debug!(
                    "unhandled mmio {} at 0x{:x}:{}",
                    if is_write { "write" } else { "read" },
                    addr,
                    len
                );
                Ok(())
            }
            UnhandledMmioPolicy::Fatal => {
                warn!("unhandled mmio access at 0x{:x}:{}", addr, len);
                Err(VmmError::UnhandledMmio { addr, is_write })
            }
        }
    }

    fn watch_input(&self) -> Result<Option<InputWatcher>, VmmError> {
        match self.epoll_context.as_ref() {
            Some(ctx) => ctx.watch_input().map_err(VmmError::Input),
            None => Ok(None),
        }
    }

    fn has_input(&self) -> bool {
        self.epoll_context
            .as_ref()
            .map_or(false, EpollContext::has_input)
    }

    /// Delivers whatever host input is ready without blocking.
    fn process_input(&mut self) -> Result<(), VmmError> {
        let ctx = match self.epoll_context.as_mut() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        let data = ctx.poll_input().map_err(VmmError::Input)?;
        if !data.is_empty() && !self.mmio_device_manager.enqueue_console_input(&data) {
            debug!("no console takes input, dropped {} bytes", data.len());
        }
        Ok(())
    }
}
