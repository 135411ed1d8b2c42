extern crate strum;
#[macro_use]
extern crate strum_macros;

use strum::IntoEnumIterator;

use common::Flags;

/// ALU operation, selected by the 4-bit L4..L1 control lines. Select
/// value 0 keeps the ALU off the bus; 13..=15 are unwired.
#[derive(Clone, Copy, Display, Debug, PartialEq, Eq)]
#[derive(EnumCount, EnumIter)]
pub enum AluOp {
    Add = 1,
    Sub = 2,
    Inc = 3,
    Dec = 4,
    And = 5,
    Or = 6,
    Not = 7,
    Rsh = 8,
    Lsh = 9,
    Multl = 10,
    Multh = 11,
    Xor = 12,
}

impl AluOp {
    pub fn from_select(select: u8) -> Option<AluOp> {
        AluOp::iter().find(|op| *op as u8 == select)
    }
}

/// Combinational result of one op. `carry` is `None` for ops that leave
/// the carry flag untouched.
pub fn eval(op: AluOp, a: u8, b: u8) -> (u8, Option<bool>) {
    match op {
        AluOp::Add => {
            let sum = a as u16 + b as u16;
            (sum as u8, Some(sum > 0xFF))
        }
        // A + !B + 1: carry out means no borrow.
        AluOp::Sub => {
            let sum = a as u16 + (!b) as u16 + 1;
            (sum as u8, Some(sum > 0xFF))
        }
        AluOp::Inc => (a.wrapping_add(1), Some(a == 0xFF)),
        // carry records the borrow here
        AluOp::Dec => (a.wrapping_sub(1), Some(a == 0)),
        AluOp::And => (a & b, None),
        AluOp::Or => (a | b, None),
        AluOp::Not => (!a, None),
        AluOp::Rsh => (a >> 1, None),
        AluOp::Lsh => (a << 1, Some(a & 0x80 != 0)),
        // carry out of the upper partial sum = bit 8 of the product
        AluOp::Multl => {
            let product = a as u16 * b as u16;
            (product as u8, Some(product & 0x100 != 0))
        }
        AluOp::Multh => ((a as u16 * b as u16 >> 8) as u8, None),
        AluOp::Xor => (a ^ b, None),
    }
}

/// Run one ALU cycle against the data bus. Any non-zero select updates
/// ZERO and SIGN from whatever ends up on the bus; CARRY only moves for
/// the ops that define it. Select 0 leaves bus and flags alone.
pub fn exec(select: u8, a: u8, b: u8, bus: &mut u8, flags: &mut Flags) {
    if select == 0 {
        return;
    }
    if let Some(op) = AluOp::from_select(select) {
        let (result, carry) = eval(op, a, b);
        *bus = result;
        if let Some(carry) = carry {
            flags.set(Flags::CARRY, carry);
        }
    }
    flags.set(Flags::ZERO, *bus == 0);
    flags.set(Flags::SIGN, *bus & 0x80 != 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(select: u8, a: u8, b: u8) -> (u8, Flags) {
        let mut bus = 0u8;
        let mut flags = Flags::empty();
        exec(select, a, b, &mut bus, &mut flags);
        (bus, flags)
    }

    #[test]
    fn zero_select_is_inert() {
        let mut bus = 0x5a;
        let mut flags = Flags::CARRY | Flags::SIGN;
        exec(0, 0xff, 0xff, &mut bus, &mut flags);
        assert_eq!(0x5a, bus);
        assert_eq!(Flags::CARRY | Flags::SIGN, flags);
    }

    #[test]
    fn zero_and_sign_follow_every_result() {
        for op in AluOp::iter() {
            for &(a, b) in &[(0u8, 0u8), (1, 2), (0x7f, 1), (0x80, 0x80), (0xff, 0xff), (12, 250)] {
                let (result, flags) = run(op as u8, a, b);
                assert_eq!(result == 0, flags.contains(Flags::ZERO), "{} {} {}", op, a, b);
                assert_eq!(result & 0x80 != 0, flags.contains(Flags::SIGN), "{} {} {}", op, a, b);
            }
        }
    }

    #[test]
    fn add_carry() {
        assert_eq!((12, Flags::empty()), run(AluOp::Add as u8, 7, 5));
        let (result, flags) = run(AluOp::Add as u8, 200, 100);
        assert_eq!(44, result);
        assert!(flags.contains(Flags::CARRY));
    }

    #[test]
    fn sub_carry_means_no_borrow() {
        let (result, flags) = run(AluOp::Sub as u8, 9, 4);
        assert_eq!(5, result);
        assert!(flags.contains(Flags::CARRY));

        let (result, flags) = run(AluOp::Sub as u8, 4, 9);
        assert_eq!(251, result);
        assert!(!flags.contains(Flags::CARRY));
        assert!(flags.contains(Flags::SIGN));

        let (result, flags) = run(AluOp::Sub as u8, 7, 7);
        assert_eq!(0, result);
        assert!(flags.contains(Flags::CARRY));
        assert!(flags.contains(Flags::ZERO));
    }

    #[test]
    fn inc_dec_edges() {
        assert_eq!((1, Some(false)), eval(AluOp::Inc, 0, 0));
        let (result, flags) = run(AluOp::Inc as u8, 0xff, 0);
        assert_eq!(0, result);
        assert!(flags.contains(Flags::CARRY));
        assert!(flags.contains(Flags::ZERO));

        let (result, flags) = run(AluOp::Dec as u8, 0, 0);
        assert_eq!(0xff, result);
        assert!(flags.contains(Flags::CARRY));

        let (_, flags) = run(AluOp::Dec as u8, 5, 0);
        assert!(!flags.contains(Flags::CARRY));
    }

    #[test]
    fn shifts() {
        assert_eq!(0x2d, run(AluOp::Rsh as u8, 0x5a, 0).0);
        let (result, flags) = run(AluOp::Lsh as u8, 0x81, 0);
        assert_eq!(0x02, result);
        assert!(flags.contains(Flags::CARRY));
        let (_, flags) = run(AluOp::Lsh as u8, 0x41, 0);
        assert!(!flags.contains(Flags::CARRY));
        // carry untouched by rsh
        let mut bus = 0;
        let mut flags = Flags::CARRY;
        exec(AluOp::Rsh as u8, 2, 0, &mut bus, &mut flags);
        assert!(flags.contains(Flags::CARRY));
    }

    #[test]
    fn logic_ops_leave_carry() {
        for op in [AluOp::And, AluOp::Or, AluOp::Not, AluOp::Xor] {
            let mut bus = 0;
            let mut flags = Flags::CARRY;
            exec(op as u8, 0x3c, 0x0f, &mut bus, &mut flags);
            assert!(flags.contains(Flags::CARRY), "{}", op);
        }
        assert_eq!(0x0c, run(AluOp::And as u8, 0x3c, 0x0f).0);
        assert_eq!(0x3f, run(AluOp::Or as u8, 0x3c, 0x0f).0);
        assert_eq!(0xc3, run(AluOp::Not as u8, 0x3c, 0x0f).0);
        assert_eq!(0x33, run(AluOp::Xor as u8, 0x3c, 0x0f).0);
    }

    #[test]
    fn multiply_exhaustive() {
        for a in 0u16..=0xff {
            for b in 0u16..=0xff {
                let product = a * b;
                let (lo, lo_flags) = run(AluOp::Multl as u8, a as u8, b as u8);
                let (hi, _) = run(AluOp::Multh as u8, a as u8, b as u8);
                assert_eq!((product & 0xff) as u8, lo);
                assert_eq!((product >> 8) as u8, hi);
                assert_eq!(product & 0x100 != 0, lo_flags.contains(Flags::CARRY));
            }
        }
    }

    #[test]
    fn unwired_selects_only_touch_zero_and_sign() {
        let mut bus = 0x90;
        let mut flags = Flags::empty();
        exec(13, 1, 2, &mut bus, &mut flags);
        assert_eq!(0x90, bus);
        assert!(flags.contains(Flags::SIGN));
        assert!(!flags.contains(Flags::ZERO));
    }
}
