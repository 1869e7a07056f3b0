// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::devices::irq::VirtioInterrupt;
use crate::devices::virtio::queue::Queue;
use crate::vstate::memory::GuestMemoryMmap;

#[derive(Debug, thiserror::Error)]
pub enum ActivateError {
    /// Unsupported number of virtio queues detected.
    #[error("Unsupported number of virtio queues detected, expected {expected}, got {got}")]
    UnsupportedNumOfVirtioQueue { expected: usize, got: usize },
    /// The device was activated twice without a reset.
    #[error("Virtio device is already activated")]
    AlreadyActivated,
}

/// Trait for virtio devices to be driven by a virtio transport.
///
/// The lifecycle of a virtio device is to be moved to a virtio transport, which will then query the
/// device. Once the guest driver has configured the device, `VirtioDevice::activate` will be called
/// and the memory, queues and interrupt for device operation will be moved into the device.
/// `reset` hands nothing back: the transport keeps its own copy of the queue configuration.
pub trait VirtioDevice: Send {
    /// The virtio device type.
    fn device_type(&self) -> u32;

    /// The maximum size of each queue that this device supports.
    fn queue_max_sizes(&self) -> &[u16];

    /// This set of feature bits shifted by `page * 32`.
    fn features(&self, page: u32) -> u32 {
        let _ = page;
        0
    }

    /// Acknowledges that this set of features should be enabled.
    fn ack_features(&mut self, page: u32, value: u32) {
        let _ = page;
        let _ = value;
    }

    /// Reads this device configuration space at `offset`
    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let _ = offset;
        let _ = data;
    }

    /// Writes to this device configuration space at `offset`
    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let _ = offset;
        let _ = data;
    }

    /// Activates this device for real usage.
    fn activate(
        &mut self,
        mem: GuestMemoryMmap,
        interrupt: VirtioInterrupt,
        queues: Vec<Queue>,
    ) -> Result<(), ActivateError>;

    /// The driver made buffers available in queue `index`.
    fn queue_notify(&mut self, index: u32);

    /// Host input for devices acting as a console. Returns false when the
    /// device does not take input.
    fn receive_input(&mut self, data: &[u8]) -> bool {
        let _ = data;
        false
    }

    /// Drops the activation state.
    fn reset(&mut self);
}
