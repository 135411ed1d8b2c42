extern crate packed_struct;
extern crate packed_struct_codegen;
use packed_struct::prelude::*;

use std::io::{self, BufRead, BufReader, Read, Write};

use common::{Ctrl, Flags};

use lazy_static::lazy_static;
lazy_static! {
    /// The generated control ROM, shared by the control unit and tests.
    pub static ref UCODE: Vec<u32> = ucode(false);
}

/// 2^14 entries: 3 bits micro-step, 4 bits opcode family, 4 bits
/// instruction low nibble, 3 bits flags.
pub const ROM_WORDS: usize = 1 << 14;

/// Micro-step frame per {instruction, flags} slot.
pub const STEPS_PER_OP: usize = 8;

/// Address layout of the control ROM. The instruction register byte
/// splits into its family (high nibble) and its embedded low nibble,
/// which carries the top address bits for addressed opcodes and the
/// sub-op selector for the 0xE/0xF families.
#[derive(Debug, PackedStruct)]
#[packed_struct(size_bytes = "2", endian = "lsb", bit_numbering = "lsb0")]
pub struct RomIndex {
    #[packed_field(bits = "0..=2")]
    pub step: Integer<u8, packed_bits::Bits<3>>,
    #[packed_field(bits = "3..=6")]
    pub family: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "7..=10")]
    pub low: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "11..=13")]
    pub flags: Integer<u8, packed_bits::Bits<3>>,
}

impl RomIndex {
    pub fn new(ir: u8, step: u8, flags: Flags) -> RomIndex {
        RomIndex {
            step: (step & 7).into(),
            family: (ir >> 4).into(),
            low: (ir & 0xF).into(),
            flags: flags.bits().into(),
        }
    }

    pub fn to_index(&self) -> usize {
        let bytes = self.pack().unwrap();
        u16::from_le_bytes([bytes[1], bytes[0]]) as usize
    }
}

/// ROM slot for one cycle of one instruction under one flag state.
pub fn rom_index(ir: u8, step: u8, flags: Flags) -> usize {
    RomIndex::new(ir, step, flags).to_index()
}

/// The two micro-steps every instruction starts with: PC into MAR, then
/// RAM into IR while the PC advances past the opcode byte.
pub fn fetch() -> [Ctrl; 2] {
    [Ctrl::CO | Ctrl::MI, Ctrl::RO | Ctrl::II | Ctrl::CE]
}

fn jump_taken() -> Vec<Ctrl> {
    vec![Ctrl::CO | Ctrl::MI, Ctrl::RO | Ctrl::XI, Ctrl::IO | Ctrl::JP]
}

/// Micro-steps following fetch for one {family, low nibble, flags} slot.
///
/// Addressed families ignore `low` (at run time it carries address bits
/// that flow through IO instead); the 0xE and 0xF families use it to
/// select the sub-op. Conditional jumps expand inline by flag state.
fn micro_steps(family: u8, low: u8, flags: Flags) -> Vec<Ctrl> {
    match family {
        // lda: A from address
        0x0 => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::AI,
        ],
        // add: A + mem -> A
        0x1 => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::BI,
            Ctrl::L1 | Ctrl::AI,
        ],
        // sub: A - mem -> A
        0x2 => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::BI,
            Ctrl::L2 | Ctrl::AI,
        ],
        // sta: A to address
        0x3 => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::AO | Ctrl::RI,
        ],
        // jsr: push PC (12-bit), jump to address
        0x4 => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::SI | Ctrl::CO | Ctrl::SA,
            Ctrl::IO | Ctrl::JP,
        ],
        // jump
        0x5 => jump_taken(),
        // jmpc
        0x6 => {
            if flags.contains(Flags::CARRY) {
                jump_taken()
            } else {
                vec![Ctrl::CE]
            }
        }
        // jmpz
        0x7 => {
            if flags.contains(Flags::ZERO) {
                jump_taken()
            } else {
                vec![Ctrl::CE]
            }
        }
        // jmpn
        0x8 => {
            if flags.contains(Flags::SIGN) {
                jump_taken()
            } else {
                vec![Ctrl::CE]
            }
        }
        // and
        0x9 => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::BI,
            Ctrl::L1 | Ctrl::L3 | Ctrl::AI,
        ],
        // or
        0xA => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::BI,
            Ctrl::L2 | Ctrl::L3 | Ctrl::AI,
        ],
        // ldax: A from (address + B); the ALU sum re-enters IR2 to form
        // the effective address
        0xB => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::AI | Ctrl::CE,
            Ctrl::L1 | Ctrl::XI,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::AI,
        ],
        // multl
        0xC => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::BI,
            Ctrl::L2 | Ctrl::L4 | Ctrl::AI,
        ],
        // multh
        0xD => vec![
            Ctrl::CO | Ctrl::MI,
            Ctrl::RO | Ctrl::XI | Ctrl::CE,
            Ctrl::IO | Ctrl::MI,
            Ctrl::RO | Ctrl::BI,
            Ctrl::L1 | Ctrl::L2 | Ctrl::L4 | Ctrl::AI,
        ],
        // immediate family: operand byte read at PC
        0xE => match low {
            // ldi
            0x0 => vec![Ctrl::CO | Ctrl::MI, Ctrl::RO | Ctrl::AI | Ctrl::CE],
            // add#
            0x1 => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::BI | Ctrl::CE,
                Ctrl::L1 | Ctrl::AI,
            ],
            // sub#
            0x2 => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::BI | Ctrl::CE,
                Ctrl::L2 | Ctrl::AI,
            ],
            // and#
            0x3 => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::BI | Ctrl::CE,
                Ctrl::L1 | Ctrl::L3 | Ctrl::AI,
            ],
            // or#
            0x4 => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::BI | Ctrl::CE,
                Ctrl::L2 | Ctrl::L3 | Ctrl::AI,
            ],
            // ldib
            0x5 => vec![Ctrl::CO | Ctrl::MI, Ctrl::RO | Ctrl::BI | Ctrl::CE],
            // multl#
            0x6 => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::BI | Ctrl::CE,
                Ctrl::L2 | Ctrl::L4 | Ctrl::AI,
            ],
            // multh#
            0x7 => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::BI | Ctrl::CE,
                Ctrl::L1 | Ctrl::L2 | Ctrl::L4 | Ctrl::AI,
            ],
            // push#
            0x8 => vec![Ctrl::CO | Ctrl::MI, Ctrl::RO | Ctrl::SI | Ctrl::CE],
            // xor#
            0x9 => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::BI | Ctrl::CE,
                Ctrl::L3 | Ctrl::L4 | Ctrl::AI,
            ],
            // ret#: pop 12-bit return address into PC, operand into A
            0xA => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::AI | Ctrl::SO | Ctrl::JP | Ctrl::SA,
            ],
            // scp: screen pointer from operand, refresh
            0xB => vec![Ctrl::CO | Ctrl::MI, Ctrl::RO | Ctrl::PI | Ctrl::RF | Ctrl::CE],
            // halt#: operand to OUT, halt
            0xF => vec![
                Ctrl::CO | Ctrl::MI,
                Ctrl::RO | Ctrl::OI | Ctrl::CE,
                Ctrl::HT,
            ],
            _ => vec![],
        },
        // nullary family
        _ => match low {
            // noop
            0x0 => vec![],
            // out
            0x1 => vec![Ctrl::AO | Ctrl::OI],
            // inc
            0x2 => vec![Ctrl::L1 | Ctrl::L2 | Ctrl::AI],
            // dec
            0x3 => vec![Ctrl::L3 | Ctrl::AI],
            // rsh
            0x4 => vec![Ctrl::L4 | Ctrl::AI],
            // lsh
            0x5 => vec![Ctrl::L1 | Ctrl::L4 | Ctrl::AI],
            // take: B -> A
            0x6 => vec![Ctrl::BO | Ctrl::AI],
            // pusha
            0x7 => vec![Ctrl::AO | Ctrl::SI],
            // popa
            0x8 => vec![Ctrl::SO | Ctrl::AI],
            // move: A -> B
            0x9 => vec![Ctrl::AO | Ctrl::BI],
            // ret: pop 12-bit into PC
            0xA => vec![Ctrl::SO | Ctrl::JP | Ctrl::SA],
            // hlta: A to OUT, halt
            0xB => vec![Ctrl::AO | Ctrl::OI, Ctrl::HT],
            // not
            0xC => vec![Ctrl::L1 | Ctrl::L2 | Ctrl::L3 | Ctrl::AI],
            // refresh
            0xD => vec![Ctrl::RF],
            // incb
            0xE => vec![Ctrl::L1 | Ctrl::L2 | Ctrl::BI],
            // halt
            _ => vec![Ctrl::HT],
        },
    }
}

/// Build the whole control ROM. The emit order walks flags, then the
/// instruction low nibble, then the family, then the 8-step frame, which
/// lines up with `rom_index` by construction. Deterministic: two calls
/// produce identical contents.
pub fn ucode(print: bool) -> Vec<u32> {
    let mut rom = Vec::with_capacity(ROM_WORDS);
    for flag_bits in 0u8..8 {
        let flags = Flags::from_bits_truncate(flag_bits);
        for low in 0u8..16 {
            for family in 0u8..16 {
                let steps = micro_steps(family, low, flags);
                assert!(steps.len() <= STEPS_PER_OP - 2, "micro-program overflow");

                let mut frame = fetch().to_vec();
                frame.extend(steps);
                frame.resize(STEPS_PER_OP, Ctrl::empty());

                let ir = family << 4 | low;
                for (step, word) in frame.iter().enumerate() {
                    debug_assert_eq!(rom.len(), rom_index(ir, step as u8, flags));
                    if print && !word.is_empty() {
                        println!(
                            "# addr:{:04x} ir:{:02x} step:{} {:?}",
                            rom.len(),
                            ir,
                            step,
                            word
                        );
                    }
                    rom.push(word.bits());
                }
            }
        }
    }
    assert_eq!(ROM_WORDS, rom.len());
    rom
}

/// One 24-bit binary string per line, most significant bit first, so
/// column 23 of the text is control line 0.
pub fn write_rom<W: Write>(w: &mut W, rom: &[u32]) -> io::Result<()> {
    for word in rom {
        writeln!(w, "{:024b}", word)?;
    }
    Ok(())
}

pub fn read_rom<R: Read>(r: R) -> io::Result<Vec<u32>> {
    let reader = BufReader::new(r);
    let mut rom = Vec::with_capacity(ROM_WORDS);
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let word = u32::from_str_radix(line, 2)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        rom.push(word);
    }
    if rom.len() != ROM_WORDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} rom entries, found {}", ROM_WORDS, rom.len()),
        ));
    }
    Ok(rom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_layout() {
        assert_eq!(0, rom_index(0x00, 0, Flags::empty()));
        for ir in 0u16..=0xFF {
            let ir = ir as u8;
            for step in 0u8..8 {
                for bits in 0u8..8 {
                    let flags = Flags::from_bits_truncate(bits);
                    let expected = step as usize
                        | ((ir >> 4) as usize) << 3
                        | ((ir & 0xF) as usize) << 7
                        | (bits as usize) << 11;
                    assert_eq!(expected, rom_index(ir, step, flags));
                }
            }
        }
    }

    #[test]
    fn regeneration_is_identical() {
        assert_eq!(ucode(false), ucode(false));
        assert_eq!(ROM_WORDS, UCODE.len());
    }

    #[test]
    fn every_slot_starts_with_fetch() {
        let [fetch1, fetch2] = fetch();
        for ir in 0u16..=0xFF {
            let ir = ir as u8;
            for bits in 0u8..8 {
                let flags = Flags::from_bits_truncate(bits);
                assert_eq!(fetch1.bits(), UCODE[rom_index(ir, 0, flags)]);
                assert_eq!(fetch2.bits(), UCODE[rom_index(ir, 1, flags)]);
            }
        }
    }

    #[test]
    fn frames_terminate_and_stay_contiguous() {
        for ir in 0u16..=0xFF {
            let ir = ir as u8;
            for bits in 0u8..8 {
                let flags = Flags::from_bits_truncate(bits);
                assert_eq!(0, UCODE[rom_index(ir, 7, flags)], "ir {:02x}", ir);
                let mut ended = false;
                for step in 2u8..8 {
                    let word = UCODE[rom_index(ir, step, flags)];
                    if word == 0 {
                        ended = true;
                    } else {
                        assert!(!ended, "hole in frame for ir {:02x} step {}", ir, step);
                    }
                }
            }
        }
    }

    #[test]
    fn conditional_jumps_expand_by_flag() {
        let cases = [
            (0x60u8, Flags::CARRY),
            (0x70, Flags::ZERO),
            (0x80, Flags::SIGN),
        ];
        for (family_byte, flag) in cases {
            for hi in 0u8..16 {
                let ir = family_byte | hi;
                let taken = flag;
                assert_eq!(
                    (Ctrl::CO | Ctrl::MI).bits(),
                    UCODE[rom_index(ir, 2, taken)]
                );
                assert_eq!((Ctrl::RO | Ctrl::XI).bits(), UCODE[rom_index(ir, 3, taken)]);
                assert_eq!((Ctrl::IO | Ctrl::JP).bits(), UCODE[rom_index(ir, 4, taken)]);

                let untaken = Flags::empty();
                assert_eq!(Ctrl::CE.bits(), UCODE[rom_index(ir, 2, untaken)]);
                assert_eq!(0, UCODE[rom_index(ir, 3, untaken)]);
            }
        }
        // unconditional jump ignores flags entirely
        for bits in 0u8..8 {
            let flags = Flags::from_bits_truncate(bits);
            assert_eq!((Ctrl::IO | Ctrl::JP).bits(), UCODE[rom_index(0x50, 4, flags)]);
        }
    }

    #[test]
    fn halt_family_raises_ht() {
        let flags = Flags::empty();
        // halt
        assert_eq!(Ctrl::HT.bits(), UCODE[rom_index(0xFF, 2, flags)]);
        // hlta: OUT first, then halt
        assert_eq!((Ctrl::AO | Ctrl::OI).bits(), UCODE[rom_index(0xFB, 2, flags)]);
        assert_eq!(Ctrl::HT.bits(), UCODE[rom_index(0xFB, 3, flags)]);
        // halt#: operand to OUT, then halt
        assert_eq!(
            (Ctrl::RO | Ctrl::OI | Ctrl::CE).bits(),
            UCODE[rom_index(0xEF, 3, flags)]
        );
        assert_eq!(Ctrl::HT.bits(), UCODE[rom_index(0xEF, 4, flags)]);
    }

    #[test]
    fn unassigned_immediates_are_empty_frames() {
        for low in [0xC, 0xD, 0xE] {
            let ir = 0xE0 | low;
            assert_eq!(0, UCODE[rom_index(ir, 2, Flags::empty())]);
        }
    }

    #[test]
    fn rom_file_round_trip() {
        let mut text = Vec::new();
        write_rom(&mut text, &UCODE).unwrap();
        let lines: Vec<&str> = std::str::from_utf8(&text).unwrap().lines().collect();
        assert_eq!(ROM_WORDS, lines.len());
        assert!(lines.iter().all(|l| l.len() == 24));

        let reread = read_rom(&text[..]).unwrap();
        assert_eq!(*UCODE, reread);
    }

    #[test]
    fn rom_file_rejects_junk() {
        assert!(read_rom(&b"not binary\n"[..]).is_err());
        assert!(read_rom(&b"000000000000000000000000\n"[..]).is_err());
    }
}
