extern crate strum;
#[macro_use]
extern crate strum_macros;

#[macro_use]
extern crate bitflags;

use std::fmt;

use strum::IntoEnumIterator;

/// Main memory size. All addresses are 12 bits wide.
pub const RAM_SIZE: usize = 1 << 12;

/// Character display window: 32x8 cells mirrored at RAM 0x400..0x500.
pub const SCREEN_BASE: usize = 0x400;
pub const SCREEN_COLS: usize = 32;
pub const SCREEN_ROWS: usize = 8;
pub const SCREEN_CELLS: usize = SCREEN_COLS * SCREEN_ROWS;

bitflags! {
    pub struct Flags: u8 {
        const CARRY = 0b001;
        const ZERO = 0b010;
        const SIGN = 0b100;
    }
}

bitflags! {
    /// One cycle's worth of control lines. Bit indices are the wiring
    /// order and double as the column order of the ROM text format.
    pub struct Ctrl: u32 {
        const MI = 1 << 0;  // mem address register in
        const RI = 1 << 1;  // ram data in
        const RO = 1 << 2;  // ram data out
        const II = 1 << 3;  // instruction register in
        const IO = 1 << 4;  // instruction register out
        const CO = 1 << 5;  // program counter register out
        const JP = 1 << 6;  // program counter register in
        const CE = 1 << 7;  // program counter increment enable
        const AI = 1 << 8;  // A register in
        const AO = 1 << 9;  // A register out
        const L1 = 1 << 10; // ALU signal 1
        const L2 = 1 << 11; // ALU signal 2
        const L3 = 1 << 12; // ALU signal 3
        const L4 = 1 << 13; // ALU signal 4
        const HT = 1 << 14; // halt signal enable
        const BI = 1 << 15; // B register in
        const BO = 1 << 16; // B register out
        const OI = 1 << 17; // output register in
        const XI = 1 << 18; // extended instruction content in
        const SI = 1 << 19; // stack in (increments)
        const SO = 1 << 20; // stack out (decrements)
        const SA = 1 << 21; // stack address (bus if clear, mbus if set)
        const RF = 1 << 22; // refresh signal
        const PI = 1 << 23; // screen pointer in
    }
}

pub const CTRL_LINES: u32 = 24;

impl Ctrl {
    /// 4-bit ALU op select, L4..L1 from high to low.
    pub fn alu_select(self) -> u8 {
        (self.contains(Ctrl::L1) as u8)
            | (self.contains(Ctrl::L2) as u8) << 1
            | (self.contains(Ctrl::L3) as u8) << 2
            | (self.contains(Ctrl::L4) as u8) << 3
    }
}

/// 12-bit address word used by the program counter, MAR and call stack.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Word(u16);

impl Word {
    pub const MAX: u16 = (RAM_SIZE - 1) as u16;

    pub fn new(value: u16) -> Word {
        Word(value & Word::MAX)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn wrapping_inc(self) -> Word {
        Word::new(self.0.wrapping_add(1))
    }

    pub fn bit(self, i: u8) -> bool {
        (self.0 >> i) & 1 != 0
    }

    pub fn low(self) -> u8 {
        self.0 as u8
    }

    pub fn high(self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl From<u16> for Word {
    fn from(value: u16) -> Word {
        Word::new(value)
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03x}", self.0)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operand shape of an opcode, decided by its byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// 0x00..=0xDF: one 12-bit address operand, 2 bytes. The high 4
    /// address bits live in the opcode byte's low nibble.
    Addressed,
    /// 0xE0..=0xEF: one immediate byte operand, 2 bytes.
    Immediate,
    /// 0xF0..=0xFF: no operand, 1 byte.
    Nullary,
}

#[derive(Clone, Copy, Display, Debug, PartialEq, Eq)]
#[derive(EnumCount, EnumIter, EnumString)]
pub enum Opcode {
    #[strum(serialize = "lda")]
    Lda = 0x00,
    #[strum(serialize = "add")]
    Add = 0x10,
    #[strum(serialize = "sub")]
    Sub = 0x20,
    #[strum(serialize = "sta")]
    Sta = 0x30,
    #[strum(serialize = "jsr")]
    Jsr = 0x40,
    #[strum(serialize = "jump")]
    Jump = 0x50,
    #[strum(serialize = "jmpc")]
    Jmpc = 0x60,
    #[strum(serialize = "jmpz")]
    Jmpz = 0x70,
    #[strum(serialize = "jmpn")]
    Jmpn = 0x80,
    #[strum(serialize = "and")]
    And = 0x90,
    #[strum(serialize = "or")]
    Or = 0xA0,
    #[strum(serialize = "ldax")]
    Ldax = 0xB0,
    #[strum(serialize = "multl")]
    Multl = 0xC0,
    #[strum(serialize = "multh")]
    Multh = 0xD0,

    #[strum(serialize = "ldi")]
    Ldi = 0xE0,
    #[strum(serialize = "add#")]
    AddImm = 0xE1,
    #[strum(serialize = "sub#")]
    SubImm = 0xE2,
    #[strum(serialize = "and#")]
    AndImm = 0xE3,
    #[strum(serialize = "or#")]
    OrImm = 0xE4,
    #[strum(serialize = "ldib")]
    Ldib = 0xE5,
    #[strum(serialize = "multl#")]
    MultlImm = 0xE6,
    #[strum(serialize = "multh#")]
    MulthImm = 0xE7,
    #[strum(serialize = "push#")]
    PushImm = 0xE8,
    #[strum(serialize = "xor#")]
    XorImm = 0xE9,
    #[strum(serialize = "ret#")]
    RetImm = 0xEA,
    #[strum(serialize = "scp")]
    Scp = 0xEB,
    #[strum(serialize = "halt#")]
    HaltImm = 0xEF,

    #[strum(serialize = "noop")]
    Noop = 0xF0,
    #[strum(serialize = "out")]
    Out = 0xF1,
    #[strum(serialize = "inc")]
    Inc = 0xF2,
    #[strum(serialize = "dec")]
    Dec = 0xF3,
    #[strum(serialize = "rsh")]
    Rsh = 0xF4,
    #[strum(serialize = "lsh")]
    Lsh = 0xF5,
    #[strum(serialize = "take")]
    Take = 0xF6,
    #[strum(serialize = "pusha")]
    Pusha = 0xF7,
    #[strum(serialize = "popa")]
    Popa = 0xF8,
    #[strum(serialize = "move")]
    Move = 0xF9,
    #[strum(serialize = "ret")]
    Ret = 0xFA,
    #[strum(serialize = "hlta")]
    Hlta = 0xFB,
    #[strum(serialize = "not")]
    Not = 0xFC,
    #[strum(serialize = "refresh")]
    Refresh = 0xFD,
    #[strum(serialize = "incb")]
    Incb = 0xFE,
    #[strum(serialize = "halt")]
    Halt = 0xFF,
}

impl Opcode {
    pub fn class(self) -> OpClass {
        match self as u8 {
            0x00..=0xDF => OpClass::Addressed,
            0xE0..=0xEF => OpClass::Immediate,
            _ => OpClass::Nullary,
        }
    }

    /// Encoded size in bytes.
    pub fn size(self) -> u16 {
        match self.class() {
            OpClass::Nullary => 1,
            _ => 2,
        }
    }

    /// True for the halt family; a program containing none of these
    /// runs until the host's tick cap.
    pub fn halts(self) -> bool {
        matches!(self, Opcode::Halt | Opcode::Hlta | Opcode::HaltImm)
    }

    /// Decode an instruction-register byte back to its opcode. For
    /// addressed instructions the low nibble holds address bits and is
    /// masked off first.
    pub fn decode(ir: u8) -> Option<Opcode> {
        let key = if ir < 0xE0 { ir & 0xF0 } else { ir };
        Opcode::iter().find(|o| *o as u8 == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn word_wraps_mod_4096() {
        assert_eq!(0, Word::new(4096).get());
        assert_eq!(1, Word::new(4097).get());
        assert_eq!(0, Word::new(Word::MAX).wrapping_inc().get());
        assert_eq!(0x3e, Word::new(0xa3e).low());
        assert_eq!(0x0a, Word::new(0xa3e).high());
    }

    #[test]
    fn control_lines_match_wiring_order() {
        let expected = [
            (Ctrl::MI, 0),
            (Ctrl::RI, 1),
            (Ctrl::RO, 2),
            (Ctrl::II, 3),
            (Ctrl::IO, 4),
            (Ctrl::CO, 5),
            (Ctrl::JP, 6),
            (Ctrl::CE, 7),
            (Ctrl::AI, 8),
            (Ctrl::AO, 9),
            (Ctrl::L1, 10),
            (Ctrl::L2, 11),
            (Ctrl::L3, 12),
            (Ctrl::L4, 13),
            (Ctrl::HT, 14),
            (Ctrl::BI, 15),
            (Ctrl::BO, 16),
            (Ctrl::OI, 17),
            (Ctrl::XI, 18),
            (Ctrl::SI, 19),
            (Ctrl::SO, 20),
            (Ctrl::SA, 21),
            (Ctrl::RF, 22),
            (Ctrl::PI, 23),
        ];
        assert_eq!(CTRL_LINES as usize, expected.len());
        for (line, bit) in expected {
            assert_eq!(1u32 << bit, line.bits());
        }
    }

    #[test]
    fn alu_select_reads_l_lines() {
        assert_eq!(0, Ctrl::empty().alu_select());
        assert_eq!(0b0001, Ctrl::L1.alu_select());
        assert_eq!(0b0110, (Ctrl::L2 | Ctrl::L3).alu_select());
        assert_eq!(0b1011, (Ctrl::L1 | Ctrl::L2 | Ctrl::L4).alu_select());
    }

    #[test]
    fn opcode_classes_follow_byte_ranges() {
        for op in Opcode::iter() {
            let byte = op as u8;
            let expected = match byte {
                0x00..=0xDF => OpClass::Addressed,
                0xE0..=0xEF => OpClass::Immediate,
                _ => OpClass::Nullary,
            };
            assert_eq!(expected, op.class(), "{}", op);
            assert_eq!(if byte >= 0xF0 { 1 } else { 2 }, op.size());
        }
    }

    #[test]
    fn mnemonics_round_trip() {
        for op in Opcode::iter() {
            assert_eq!(Ok(op), Opcode::from_str(&op.to_string()));
        }
        assert_eq!(Ok(Opcode::AddImm), Opcode::from_str("add#"));
        assert!(Opcode::from_str("LDA").is_err());
        assert!(Opcode::from_str("tba").is_err());
    }

    #[test]
    fn decode_masks_embedded_address_bits() {
        assert_eq!(Some(Opcode::Sta), Opcode::decode(0x3A));
        assert_eq!(Some(Opcode::Jump), Opcode::decode(0x5F));
        assert_eq!(Some(Opcode::Ldi), Opcode::decode(0xE0));
        assert_eq!(Some(Opcode::Halt), Opcode::decode(0xFF));
        assert_eq!(None, Opcode::decode(0xEC));
    }
}
