// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;

/// This represents part of the guest's configuration file in json format.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootSourceConfig {
    /// Path of the raw guest image.
    pub image_path: String,
    /// Where the image lands, relative to the start of guest RAM.
    #[serde(default)]
    pub load_offset: u64,
}

/// Errors associated with actions on `BootSourceConfig`.
#[derive(Debug, thiserror::Error)]
pub enum BootSourceConfigError {
    /// The image file cannot be opened.
    #[error("The guest image cannot be opened: {0}")]
    InvalidImagePath(std::io::Error),
    /// The image file cannot be read.
    #[error("The guest image cannot be read: {0}")]
    ReadImage(std::io::Error),
    /// Nothing to run.
    #[error("The guest image is empty")]
    EmptyImage,
}

/// The guest image, read from the configured file.
#[derive(Debug, Default)]
pub struct BootConfig {
    pub image: Vec<u8>,
    pub load_offset: u64,
}

impl BootConfig {
    /// Reads the image named by the configuration.
    pub fn new(cfg: &BootSourceConfig) -> std::result::Result<Self, BootSourceConfigError> {
        let mut file = File::open(&cfg.image_path).map_err(BootSourceConfigError::InvalidImagePath)?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)
            .map_err(BootSourceConfigError::ReadImage)?;
        if image.is_empty() {
            return Err(BootSourceConfigError::EmptyImage);
        }
        Ok(BootConfig {
            image,
            load_offset: cfg.load_offset,
        })
    }
}

/// The guest's builder from boot configuration.
#[derive(Debug, Default)]
pub struct BootSource {
    /// The boot source configuration.
    pub config: BootSourceConfig,
    /// The loaded image.
    pub builder: Option<BootConfig>,
}
