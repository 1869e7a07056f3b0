// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::vmm_config::boot_source::{
    BootConfig, BootSource, BootSourceConfig, BootSourceConfigError,
};
use crate::vmm_config::console::ConsoleConfig;
use crate::vmm_config::drive::{BlockDeviceBuilder, BlockDeviceConfig, DriveError};
use crate::vmm_config::machine_config::{MachineConfig, VmConfig, VmConfigError};

/// Errors associated with actions on configuring VM resources.
#[derive(Debug, thiserror::Error, derive_more::From)]
pub enum ResourcesError {
    /// Block device configuration error.
    #[error("Block device error: {0}")]
    BlockDevice(DriveError),
    /// Boot source configuration error.
    #[error("Boot source error: {0}")]
    BootSource(BootSourceConfigError),
    /// JSON is invalid.
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),
    /// Vm vcpus or memory configuration error.
    #[error("VM config error: {0}")]
    VmConfig(VmConfigError),
}

/// Used for configuring a vmm from json.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmmConfig {
    #[serde(rename = "boot-source")]
    boot_source: BootSourceConfig,
    #[serde(rename = "drives", default)]
    block_devices: Vec<BlockDeviceConfig>,
    #[serde(rename = "machine-config", default)]
    machine_config: MachineConfig,
    #[serde(rename = "console", default)]
    console: ConsoleConfig,
}

/// A data structure that encapsulates the device configurations held in the Vmm.
#[derive(Debug, Default)]
pub struct VmResources {
    pub vm_config: VmConfig,
    pub boot_source: BootSource,
    pub block: BlockDeviceBuilder,
    pub console: ConsoleConfig,
}

impl VmResources {
    pub fn from_json(config_json: &str) -> std::result::Result<Self, ResourcesError> {
        let vmm_config: VmmConfig = serde_json::from_str::<VmmConfig>(config_json)?;
        let mut resources: Self = Default::default();

        resources.build_vm_config(vmm_config.machine_config)?;
        resources.build_boot_source(vmm_config.boot_source)?;
        resources.set_block_device_builder(vmm_config.block_devices)?;
        resources.console = vmm_config.console;
        Ok(resources)
    }

    pub fn boot_source_config(&self) -> &BootSourceConfig {
        &self.boot_source.config
    }

    /// Construct the vm config.
    pub fn build_vm_config(&mut self, machine_config: MachineConfig) -> Result<(), VmConfigError> {
        self.vm_config = VmConfig::try_from(machine_config)?;
        Ok(())
    }

    /// Construct the boot source.
    pub fn build_boot_source(
        &mut self,
        boot_source_cfg: BootSourceConfig,
    ) -> Result<(), BootSourceConfigError> {
        self.set_boot_source_config(boot_source_cfg);
        self.boot_source.builder = Some(BootConfig::new(self.boot_source_config())?);
        Ok(())
    }

    /// Set the boot source configuration.
    pub fn set_boot_source_config(&mut self, boot_source_cfg: BootSourceConfig) {
        self.boot_source.config = boot_source_cfg
    }

    /// Set the block devices builder.
    pub fn set_block_device_builder(
        &mut self,
        devices: Vec<BlockDeviceConfig>,
    ) -> Result<(), DriveError> {
        self.block = BlockDeviceBuilder::from(devices)?;
        Ok(())
    }

    /// The loaded guest image, if a boot source was built.
    pub fn boot_config(&self) -> Option<&BootConfig> {
        self.boot_source.builder.as_ref()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::vmm_config::{console::ConsoleDevice, machine_config::UnhandledMmioPolicy};
    use ::utils::tempfile::TempFile;
    use std::io::Write;

    fn image_file() -> TempFile {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(&[0u8; 16]).unwrap();
        file
    }

    #[test]
    fn test_from_json() {
        let image = image_file();
        let rootfs_file = TempFile::new().unwrap();

        // Invalid JSON string must yield a `serde_json` error.
        match VmResources::from_json(r#"}"#) {
            Err(ResourcesError::InvalidJson(_)) => (),
            _ => unreachable!(),
        }

        // A boot source is mandatory.
        match VmResources::from_json(r#"{}"#) {
            Err(ResourcesError::InvalidJson(_)) => (),
            _ => unreachable!(),
        }

        // Invalid JSON string that has invalid image_path.
        let mut json = format!(
            r#"{{
                "boot-source": {{
                    "image_path": "/invalid/path"
                }},
                "drives": [
                    {{
                        "path_on_host": "{}",
                        "is_read_only": false
                    }}
                ],
                "machine-config": {{
                    "vcpu_count": 1,
                    "mem_size_mib": 128
                }}
            }}"#,
            rootfs_file.as_path().to_str().unwrap()
        );

        match VmResources::from_json(json.as_str()) {
            Err(ResourcesError::BootSource(BootSourceConfigError::InvalidImagePath(_))) => (),
            _ => unreachable!(),
        }

        // Invalid JSON string that has invalid rootfs path.
        json = format!(
            r#"{{
                "boot-source": {{
                    "image_path": "{}"
                }},
                "drives": [
                    {{
                        "path_on_host": "/invalid/path",
                        "is_read_only": false
                    }}
                ],
                "machine-config": {{
                    "vcpu_count": 1,
                    "mem_size_mib": 128
                }}
            }}"#,
            image.as_path().to_str().unwrap()
        );

        match VmResources::from_json(json.as_str()) {
            Err(ResourcesError::BlockDevice(DriveError::InvalidBlockDevicePath(_))) => (),
            _ => unreachable!(),
        }

        // Invalid vcpu count.
        json = format!(
            r#"{{
                "boot-source": {{
                    "image_path": "{}"
                }},
                "machine-config": {{
                    "vcpu_count": 2,
                    "mem_size_mib": 128
                }}
            }}"#,
            image.as_path().to_str().unwrap()
        );

        match VmResources::from_json(json.as_str()) {
            Err(ResourcesError::VmConfig(VmConfigError::InvalidVcpuCount)) => (),
            _ => unreachable!(),
        }

        // Unknown keys are rejected.
        json = format!(
            r#"{{
                "boot-source": {{
                    "image_path": "{}",
                    "boot_args": "console=ttyS0"
                }}
            }}"#,
            image.as_path().to_str().unwrap()
        );

        match VmResources::from_json(json.as_str()) {
            Err(ResourcesError::InvalidJson(_)) => (),
            _ => unreachable!(),
        }

        // Valid JSON string.
        json = format!(
            r#"{{
                "boot-source": {{
                    "image_path": "{}",
                    "load_offset": 4096
                }},
                "drives": [
                    {{
                        "path_on_host": "{}",
                        "is_read_only": true
                    }}
                ],
                "machine-config": {{
                    "vcpu_count": 1,
                    "mem_size_mib": 64,
                    "exit_limit": 1000,
                    "unhandled_mmio": "fatal"
                }},
                "console": {{
                    "device": "virtio"
                }}
            }}"#,
            image.as_path().to_str().unwrap(),
            rootfs_file.as_path().to_str().unwrap()
        );

        let resources = VmResources::from_json(json.as_str()).unwrap();
        assert_eq!(resources.vm_config.mem_size_mib, 64);
        assert_eq!(resources.vm_config.exit_limit, Some(1000));
        assert_eq!(resources.vm_config.unhandled_mmio, UnhandledMmioPolicy::Fatal);
        assert_eq!(resources.console.device, ConsoleDevice::Virtio);
        assert_eq!(resources.block.devices.len(), 1);
        assert!(resources.block.devices[0].is_read_only);
        let boot_config = resources.boot_config().unwrap();
        assert_eq!(boot_config.image.len(), 16);
        assert_eq!(boot_config.load_offset, 4096);
    }

    #[test]
    fn test_from_json_defaults() {
        let image = image_file();
        let json = format!(
            r#"{{ "boot-source": {{ "image_path": "{}" }} }}"#,
            image.as_path().to_str().unwrap()
        );
        let resources = VmResources::from_json(json.as_str()).unwrap();
        assert_eq!(resources.vm_config, VmConfig::default());
        assert_eq!(resources.console.device, ConsoleDevice::Serial);
        assert!(resources.block.devices.is_empty());
    }
}
