// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};

/// Errors associated with actions on `BlockDeviceConfig`
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    /// The block device path is invalid.
    #[error("Invalid block device path: {0}")]
    InvalidBlockDevicePath(std::io::Error),
}

/// This represents part of the guest's configuration file in json format.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockDeviceConfig {
    /// Path of the drive.
    pub path_on_host: String,
    /// If set true, the guest cannot write to the drive.
    #[serde(default)]
    pub is_read_only: bool,
}

impl BlockDeviceConfig {
    /// Opens the backing file with the access the drive needs.
    pub fn open(&self) -> Result<File, DriveError> {
        OpenOptions::new()
            .read(true)
            .write(!self.is_read_only)
            .open(self.path_on_host.as_str())
            .map_err(DriveError::InvalidBlockDevicePath)
    }
}

/// Wrapper for the block device collections.
///
/// Only the configurations are kept: backing files are opened again when
/// the devices are built.
#[derive(Debug, Default)]
pub struct BlockDeviceBuilder {
    /// The collections of block device.
    pub devices: Vec<BlockDeviceConfig>,
}

impl BlockDeviceBuilder {
    pub fn from(devices: Vec<BlockDeviceConfig>) -> Result<Self, DriveError> {
        for dev in devices.iter() {
            // Only try to open device file on host for input validation.
            dev.open()?;
        }
        Ok(BlockDeviceBuilder { devices })
    }
}
