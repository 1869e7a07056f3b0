// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

pub const DEFAULT_MEM_SIZE_MIB: usize = 128;

/// Errors associated with actions on `VmConfigError`.
#[derive(Debug, thiserror::Error)]
pub enum VmConfigError {
    /// The memory size is invalid. The memory can only be an unsigned integer.
    #[error("The memory size (MiB) is invalid.")]
    InvalidMemorySize,
    /// The vcpu number is invalid.
    #[error("The vcpu count is invalid, only a single vcpu is supported.")]
    InvalidVcpuCount,
    /// An exit limit of zero would never run the guest.
    #[error("The exit limit must be greater than zero.")]
    InvalidExitLimit,
}

/// What the vcpu loop does with an access no device claims.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnhandledMmioPolicy {
    /// Log it, read as zeros, drop writes.
    #[default]
    Ignore,
    /// Stop the vm with an error.
    Fatal,
}

/// This represents part of the guest's configuration file in json format.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    /// Number of vcpus from configuration file.
    pub vcpu_count: u8,
    /// The memory size in MiB from configuration file.
    pub mem_size_mib: usize,
    /// Stop the vm after this many exits.
    #[serde(default)]
    pub exit_limit: Option<u64>,
    #[serde(default)]
    pub unhandled_mmio: UnhandledMmioPolicy,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            vcpu_count: 1,
            mem_size_mib: DEFAULT_MEM_SIZE_MIB,
            exit_limit: None,
            unhandled_mmio: UnhandledMmioPolicy::Ignore,
        }
    }
}

/// Configuration of the vm.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmConfig {
    /// Number of vcpu on vm.
    pub vcpu_count: u8,
    /// The memory size in MiB on vm.
    pub mem_size_mib: usize,
    pub exit_limit: Option<u64>,
    pub unhandled_mmio: UnhandledMmioPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            vcpu_count: 1,
            mem_size_mib: DEFAULT_MEM_SIZE_MIB,
            exit_limit: None,
            unhandled_mmio: UnhandledMmioPolicy::Ignore,
        }
    }
}

impl VmConfig {
    /// Guest RAM size in bytes.
    pub fn mem_size(&self) -> usize {
        self.mem_size_mib << 20
    }
}

impl TryFrom<MachineConfig> for VmConfig {
    type Error = VmConfigError;

    fn try_from(machine_config: MachineConfig) -> Result<Self, Self::Error> {
        if machine_config.vcpu_count != 1 {
            return Err(VmConfigError::InvalidVcpuCount);
        }
        if machine_config.mem_size_mib == 0 {
            return Err(VmConfigError::InvalidMemorySize);
        }
        // Anything above the RAM window cannot be mapped.
        let max_mib = (crate::arch::DRAM_MEM_MAX_SIZE >> 20) as usize;
        if machine_config.mem_size_mib > max_mib {
            return Err(VmConfigError::InvalidMemorySize);
        }
        if machine_config.exit_limit == Some(0) {
            return Err(VmConfigError::InvalidExitLimit);
        }
        Ok(VmConfig {
            vcpu_count: machine_config.vcpu_count,
            mem_size_mib: machine_config.mem_size_mib,
            exit_limit: machine_config.exit_limit,
            unhandled_mmio: machine_config.unhandled_mmio,
        })
    }
}
