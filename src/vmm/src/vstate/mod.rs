// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod hypervisor;
#[cfg(target_arch = "aarch64")]
pub mod kvm;
pub mod memory;
pub mod vcpu;
