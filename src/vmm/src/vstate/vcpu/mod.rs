// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

pub mod run_area;

use crate::vstate::hypervisor::{Hypervisor, HypervisorError, VcpuBackend};
use kvm_bindings::{
    KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN,
    KVM_EXIT_SYSTEM_EVENT, KVM_SYSTEM_EVENT_CRASH, KVM_SYSTEM_EVENT_RESET,
    KVM_SYSTEM_EVENT_SHUTDOWN,
};
use log::{debug, info, warn};
use run_area::MMIO_DATA_LEN;
use std::sync::atomic::{AtomicBool, Ordering};

/// Errors associated with actions on vcpu.
#[derive(Debug, thiserror::Error)]
pub enum VcpuError {
    /// Cannot create the vcpu.
    #[error("Failed to create vcpu: {0}")]
    Create(HypervisorError),
    /// Platform initialization failed.
    #[error("Failed to initialize vcpu: {0}")]
    Init(HypervisorError),
    /// Register id rejected by the kernel, or access failed.
    #[error("Failed to access register 0x{id:x}: {source}")]
    RegisterAccess {
        id: u64,
        #[source]
        source: HypervisorError,
    },
    /// Failed to trigger the running of the current vcpu.
    #[error("Failed to run vcpu: {0}")]
    Run(HypervisorError),
    /// The operation is not allowed in the current state.
    #[error("Operation not allowed while vcpu is {0:?}")]
    InvalidState(VcpuState),
    /// A read response was staged while no mmio read was pending.
    #[error("No mmio read is pending")]
    NoPendingRead,
    /// The read response does not match the width of the access.
    #[error("Mmio read response of {got} bytes for a {expected} byte access")]
    ResponseLength { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Created,
    Initialized,
    Running,
    Trapped,
    Terminated,
}

/// Bytes of an mmio access, at most eight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioData {
    bytes: [u8; MMIO_DATA_LEN],
    len: usize,
}

impl MmioData {
    pub fn new(data: &[u8]) -> Self {
        let len = std::cmp::min(data.len(), MMIO_DATA_LEN);
        let mut bytes = [0u8; MMIO_DATA_LEN];
        bytes[..len].copy_from_slice(&data[..len]);
        MmioData { bytes, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Shutdown,
    Reset,
    Crash,
    Other(u32),
}

impl From<u32> for SystemEvent {
    fn from(event: u32) -> Self {
        match event {
            KVM_SYSTEM_EVENT_SHUTDOWN => SystemEvent::Shutdown,
            KVM_SYSTEM_EVENT_RESET => SystemEvent::Reset,
            KVM_SYSTEM_EVENT_CRASH => SystemEvent::Crash,
            other => SystemEvent::Other(other),
        }
    }
}

/// Decoded reason of a vcpu exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRecord {
    MmioRead { addr: u64, len: usize },
    MmioWrite { addr: u64, data: MmioData },
    Hlt,
    SystemEvent(SystemEvent),
    Shutdown,
    FailEntry { reason: u64, cpu: u32 },
    InternalError { suberror: u32 },
    Unknown(u32),
}

impl ExitRecord {
    /// Exits after which the vcpu cannot be resumed.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExitRecord::MmioRead { .. } | ExitRecord::MmioWrite { .. } | ExitRecord::Unknown(_)
        )
    }
}

pub struct Vcpu {
    id: u32,
    backend: Box<dyn VcpuBackend>,
    state: VcpuState,
    /// Width of the mmio read waiting for a response.
    pending_read: Option<usize>,
}

impl Vcpu {
    /// Creates vcpu `id` and performs its platform initialization.
    pub fn create(hypervisor: &dyn Hypervisor, id: u32) -> Result<Self, VcpuError> {
        let backend = hypervisor.create_vcpu(id).map_err(VcpuError::Create)?;
        let mut vcpu = Vcpu {
            id,
            backend,
            state: VcpuState::Created,
            pending_read: None,
        };
        vcpu.init()?;
        Ok(vcpu)
    }

    fn init(&mut self) -> Result<(), VcpuError> {
        if self.state != VcpuState::Created {
            return Err(VcpuError::InvalidState(self.state));
        }
        self.backend.init().map_err(VcpuError::Init)?;
        self.state = VcpuState::Initialized;
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn get_register(&self, id: u64) -> Result<u64, VcpuError> {
        self.backend
            .get_register(id)
            .map_err(|source| VcpuError::RegisterAccess { id, source })
    }

    pub fn set_register(&mut self, id: u64, value: u64) -> Result<(), VcpuError> {
        self.backend
            .set_register(id, value)
            .map_err(|source| VcpuError::RegisterAccess { id, source })
    }

    /// Runs the guest until its next exit.
    ///
    /// Interrupted runs are retried here and never reported. Any other kernel
    /// failure terminates the vcpu.
    pub fn run(&mut self) -> Result<ExitRecord, VcpuError> {
        let never = AtomicBool::new(false);
        loop {
            if let Some(exit) = self.run_until_kicked(&never)? {
                return Ok(exit);
            }
        }
    }

    /// Like [`Vcpu::run`], but gives control back with `None` when `kick` is
    /// raised, either before the guest is entered or when an interrupted run
    /// finds it raised. `kick` is lowered on the way out.
    pub fn run_until_kicked(&mut self, kick: &AtomicBool) -> Result<Option<ExitRecord>, VcpuError> {
        match self.state {
            VcpuState::Created | VcpuState::Terminated => {
                return Err(VcpuError::InvalidState(self.state))
            }
            _ => (),
        }
        if kick.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(len) = self.pending_read.take() {
            debug!(
                "vcpu{}: resuming without a response to a {} byte mmio read",
                self.id, len
            );
        }

        let resumed_from = self.state;
        self.state = VcpuState::Running;
        loop {
            match self.backend.run() {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    if kick.swap(false, Ordering::SeqCst) {
                        debug!("vcpu{}: kicked out of the guest", self.id);
                        self.state = resumed_from;
                        return Ok(None);
                    }
                    debug!("vcpu{}: run interrupted ({}), retrying", self.id, e);
                    continue;
                }
                Err(e) => {
                    self.state = VcpuState::Terminated;
                    return Err(VcpuError::Run(e));
                }
            }
        }

        let exit = self.decode_exit();
        if exit.is_terminal() {
            info!("vcpu{}: terminal exit {:?}", self.id, exit);
            self.state = VcpuState::Terminated;
        } else {
            self.state = VcpuState::Trapped;
        }
        if let ExitRecord::MmioRead { len, .. } = exit {
            self.pending_read = Some(len);
        }
        Ok(Some(exit))
    }

    fn decode_exit(&self) -> ExitRecord {
        let run = self.backend.run_area();
        match run.exit_reason() {
            KVM_EXIT_MMIO => {
                let access = run.mmio();
                let len = std::cmp::min(access.len as usize, MMIO_DATA_LEN);
                if access.is_write {
                    ExitRecord::MmioWrite {
                        addr: access.phys_addr,
                        data: MmioData::new(&access.data[..len]),
                    }
                } else {
                    ExitRecord::MmioRead {
                        addr: access.phys_addr,
                        len,
                    }
                }
            }
            KVM_EXIT_HLT => ExitRecord::Hlt,
            KVM_EXIT_SHUTDOWN => ExitRecord::Shutdown,
            KVM_EXIT_SYSTEM_EVENT => ExitRecord::SystemEvent(run.system_event_type().into()),
            KVM_EXIT_FAIL_ENTRY => {
                let (reason, cpu) = run.fail_entry();
                ExitRecord::FailEntry { reason, cpu }
            }
            KVM_EXIT_INTERNAL_ERROR => ExitRecord::InternalError {
                suberror: run.internal_suberror(),
            },
            reason => {
                warn!("vcpu{}: unknown exit reason {}", self.id, reason);
                ExitRecord::Unknown(reason)
            }
        }
    }

    /// Stages the value returned to the guest for the pending mmio read.
    pub fn set_exit_response(&mut self, data: &[u8]) -> Result<(), VcpuError> {
        let expected = self.pending_read.ok_or(VcpuError::NoPendingRead)?;
        if data.len() != expected {
            return Err(VcpuError::ResponseLength {
                expected,
                got: data.len(),
            });
        }
        self.backend.run_area().set_mmio_data(data);
        self.pending_read = None;
        Ok(())
    }
}
