// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

// [Device Type](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-2160005)
pub const BLOCK_DEVICE: u32 = 0x02;
pub const CONSOLE: u32 = 0x03;
