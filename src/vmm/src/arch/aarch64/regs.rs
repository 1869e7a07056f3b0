// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identifiers of the arm64 core registers as understood by `KVM_{GET,SET}_ONE_REG`.
//!
//! A core register id is `KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE`
//! ORed with the register's offset inside `struct kvm_regs`, counted in
//! 32-bit words.

use crate::vstate::vcpu::{Vcpu, VcpuError};

pub const KVM_REG_ARM64: u64 = 0x6000_0000_0000_0000;
pub const KVM_REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
pub const KVM_REG_ARM_CORE: u64 = 0x0010 << 16;

// Byte offsets inside `struct kvm_regs`.
const SP_OFFSET: u64 = 31 * 8;
const PC_OFFSET: u64 = 32 * 8;
const PSTATE_OFFSET: u64 = 33 * 8;
const SP_EL1_OFFSET: u64 = 34 * 8;
const ELR_EL1_OFFSET: u64 = 35 * 8;

const fn core_reg(offset: u64) -> u64 {
    KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | (offset / 4)
}

/// General purpose register `xN`, `n` in `0..=30`.
pub const fn x(n: u64) -> u64 {
    core_reg(n * 8)
}

pub const SP: u64 = core_reg(SP_OFFSET);
pub const PC: u64 = core_reg(PC_OFFSET);
pub const PSTATE: u64 = core_reg(PSTATE_OFFSET);
pub const SP_EL1: u64 = core_reg(SP_EL1_OFFSET);
pub const ELR_EL1: u64 = core_reg(ELR_EL1_OFFSET);

/// Every 64-bit core register id.
pub const CORE_REGS: [u64; 36] = {
    let mut regs = [0u64; 36];
    let mut n = 0;
    while n < 31 {
        regs[n] = x(n as u64);
        n += 1;
    }
    regs[31] = SP;
    regs[32] = PC;
    regs[33] = PSTATE;
    regs[34] = SP_EL1;
    regs[35] = ELR_EL1;
    regs
};

pub fn is_core_reg(id: u64) -> bool {
    CORE_REGS.contains(&id)
}

// PSTATE fields.
pub const PSR_MODE_EL1H: u64 = 0x0000_0005;
pub const PSR_F_BIT: u64 = 0x0000_0040;
pub const PSR_I_BIT: u64 = 0x0000_0080;
pub const PSR_A_BIT: u64 = 0x0000_0100;
pub const PSR_D_BIT: u64 = 0x0000_0200;

/// EL1 using SP_EL1, with debug, SError, IRQ and FIQ masked.
pub const BOOT_PSTATE: u64 = PSR_D_BIT | PSR_A_BIT | PSR_I_BIT | PSR_F_BIT | PSR_MODE_EL1H;

/// Puts the boot vcpu at `entry` in EL1h, with `x0` holding `arg0` and the
/// EL1 stack pointer at `stack_top`.
pub fn setup_boot_regs(
    vcpu: &mut Vcpu,
    entry: u64,
    stack_top: u64,
    arg0: u64,
) -> Result<(), VcpuError> {
    vcpu.set_register(PSTATE, BOOT_PSTATE)?;
    vcpu.set_register(PC, entry)?;
    vcpu.set_register(SP_EL1, stack_top)?;
    vcpu.set_register(x(0), arg0)?;
    // x1-x3 are reserved by the arm64 boot protocol and must be zero.
    for n in 1..4 {
        vcpu.set_register(x(n), 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_reg_ids() {
        assert_eq!(x(0), 0x6030_0000_0010_0000);
        assert_eq!(x(1), 0x6030_0000_0010_0002);
        assert_eq!(SP, 0x6030_0000_0010_003e);
        assert_eq!(PC, 0x6030_0000_0010_0040);
        assert_eq!(PSTATE, 0x6030_0000_0010_0042);
    }

    #[test]
    fn test_is_core_reg() {
        assert!(is_core_reg(x(30)));
        assert!(is_core_reg(PC));
        assert!(!is_core_reg(x(31) + 1));
        assert!(!is_core_reg(0));
    }

    #[test]
    fn test_boot_pstate() {
        assert_eq!(BOOT_PSTATE, 0x3c5);
        assert_eq!(BOOT_PSTATE & 0xf, PSR_MODE_EL1H);
    }
}
