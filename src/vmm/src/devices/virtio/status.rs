// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

// [Device Status Field](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-110001)
pub const ACKNOWLEDGE: u32 = 0x01;
pub const DRIVER: u32 = 0x02;
pub const FAILED: u32 = 0x80; // 128
pub const FEATURES_OK: u32 = 0x08;
pub const DRIVER_OK: u32 = 0x04;
pub const DEVICE_NEEDS_RESET: u32 = 0x40; // 64

/// Status the driver may set next, given the current one. Bits are only ever
/// added in handshake order.
pub fn next_in_handshake(current: u32) -> Option<u32> {
    match current {
        0 => Some(ACKNOWLEDGE),
        ACKNOWLEDGE => Some(ACKNOWLEDGE | DRIVER),
        s if s == ACKNOWLEDGE | DRIVER => Some(s | FEATURES_OK),
        s if s == ACKNOWLEDGE | DRIVER | FEATURES_OK => Some(s | DRIVER_OK),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_in_handshake() {
        let mut status = 0;
        for bit in [ACKNOWLEDGE, DRIVER, FEATURES_OK, DRIVER_OK] {
            let next = next_in_handshake(status).unwrap();
            assert_eq!(next, status | bit);
            status = next;
        }
        assert_eq!(next_in_handshake(status), None);
        assert_eq!(next_in_handshake(DRIVER), None);
    }
}
