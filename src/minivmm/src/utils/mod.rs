// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use log::{info, warn};
use std::fs::File;
use std::io::{self, IsTerminal};
use std::os::fd::AsFd;
use std::sync::Arc;
use ::utils::terminal::Terminal;
use vmm::builder::{build_vmm, StartVmError};
use vmm::resources::VmResources;
use vmm::vstate::hypervisor::{Hypervisor, HypervisorError};
use vmm::{VmExitStatus, VmmError};

#[derive(Debug, thiserror::Error)]
pub enum UtilsError {
    /// Failed to create VmResources.
    #[error("Failed to create VmResources: {0}")]
    CreateVmResources(#[from] vmm::resources::ResourcesError),
    /// The hypervisor cannot be opened.
    #[error("Failed to open the hypervisor: {0}")]
    Hypervisor(HypervisorError),
    /// Only arm64 hosts can run guests.
    #[error("Guests can only run on aarch64 hosts")]
    UnsupportedHost,
    /// Failed to build Vm.
    #[error("Failed to build virtual machine: {0}")]
    BuildVm(StartVmError),
    /// Stdin cannot be duplicated for the guest console.
    #[error("Failed to set up the console input: {0}")]
    Stdin(io::Error),
    /// The guest stopped with an error.
    #[error("Failed to run virtual machine: {0}")]
    RunVm(VmmError),
}

#[cfg(target_arch = "aarch64")]
fn create_hypervisor() -> Result<Arc<dyn Hypervisor>, UtilsError> {
    let kvm = vmm::vstate::kvm::KvmHypervisor::new().map_err(UtilsError::Hypervisor)?;
    Ok(Arc::new(kvm))
}

#[cfg(not(target_arch = "aarch64"))]
fn create_hypervisor() -> Result<Arc<dyn Hypervisor>, UtilsError> {
    Err(UtilsError::UnsupportedHost)
}

/// Builds the vm described by `config` and runs it with the terminal as
/// its console.
pub fn run_vm_from_config(config: &str) -> Result<VmExitStatus, UtilsError> {
    // Prepare resources from the given configuration file.
    let vm_resources = VmResources::from_json(config)?;
    let hypervisor = create_hypervisor()?;

    // Unbuffered handle, so readiness on the fd matches what is left to read.
    let stdin = io::stdin();
    let input = File::from(
        stdin
            .as_fd()
            .try_clone_to_owned()
            .map_err(UtilsError::Stdin)?,
    );
    let mut vmm = build_vmm(
        &vm_resources,
        hypervisor,
        Box::new(io::stdout()),
        Some(Box::new(input)),
    )
    .map_err(UtilsError::BuildVm)?;

    let interactive = stdin.is_terminal();
    if interactive {
        if let Err(e) = stdin.lock().set_raw_mode() {
            warn!("cannot set terminal raw mode: {:?}", e);
        }
    }
    defer! {{
        if interactive {
            if let Err(e) = io::stdin().lock().set_canon_mode() {
                warn!("cannot set canon mode for stdin: {:?}", e);
            }
        }
    }};

    let status = vmm
        .run(vm_resources.vm_config.exit_limit)
        .map_err(UtilsError::RunVm)?;
    info!("guest exited: {:?}", status);
    Ok(status)
}
