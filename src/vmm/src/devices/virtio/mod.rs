// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod block;
pub mod console;
pub mod mmio;
pub mod queue;
pub mod status;
pub mod types;
pub mod virtio_device;

/// Feature bit for devices compliant with virtio 1.0 and later.
pub const VIRTIO_F_VERSION_1: u32 = 32;
