// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod serial;

pub use serial::{SerialDevice, SharedWriter};
