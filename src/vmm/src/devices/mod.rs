// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod epoll;
pub mod irq;
pub mod legacy;
pub mod registry;
pub mod virtio;
