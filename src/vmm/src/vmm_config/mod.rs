// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Wrapper for configuring the vm boot source.
pub mod boot_source;
/// Wrapper for configuring the guest console.
pub mod console;
/// Wrapper for configuring the block devices.
pub mod drive;
/// Wrapper for configuring the machine config.
pub mod machine_config;
