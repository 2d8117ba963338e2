//! RISC-V control-flow instruction classification.
//!
//! The walker only needs to know how an instruction can move the PC;
//! everything that is not a jump, branch, or trap collapses into
//! [`InstType::Scalar`]. Disassembly text for display purposes comes
//! from the program image, not from here.

use bitmatch::bitmatch;

/// Control-flow class of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstType {
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    CJ,
    CJal,
    CJr,
    CJalr,
    CBeqz,
    CBnez,
    Ebreak,
    CEbreak,
    Ecall,
    Mret,
    Sret,
    Uret,
    /// Anything that advances the PC by its own size.
    Scalar,
    /// Not decodable (wider than 32 bits, or a reserved encoding).
    Unknown,
}

impl InstType {
    /// Conditional branch: outcome comes from a history bit or a
    /// taken/not-taken run length.
    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            InstType::Beq
                | InstType::Bne
                | InstType::Blt
                | InstType::Bge
                | InstType::Bltu
                | InstType::Bgeu
                | InstType::CBeqz
                | InstType::CBnez
        )
    }

    /// Unconditional jump whose target is computable from the opcode.
    pub fn is_direct_jump(self) -> bool {
        matches!(self, InstType::Jal | InstType::CJ | InstType::CJal)
    }

    /// Register-indirect jump; the target must come from the trace.
    pub fn is_indirect(self) -> bool {
        matches!(self, InstType::Jalr | InstType::CJr | InstType::CJalr)
    }

    pub fn is_trap(self) -> bool {
        matches!(self, InstType::Ecall | InstType::Ebreak | InstType::CEbreak)
    }

    pub fn is_trap_return(self) -> bool {
        matches!(self, InstType::Mret | InstType::Sret | InstType::Uret)
    }
}

/// A classified instruction: enough to propose the next PC and the
/// call/return flags, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInst {
    pub inst_type: InstType,
    /// Size in bytes: 2 or 4, or 0 when the encoding is wider than the
    /// decoder understands.
    pub size: u8,
    pub rd: u8,
    pub rs1: u8,
    pub imm: i32,
}

impl DecodedInst {
    fn scalar(size: u8) -> DecodedInst {
        DecodedInst {
            inst_type: InstType::Scalar,
            size,
            rd: 0,
            rs1: 0,
            imm: 0,
        }
    }

    fn system(inst_type: InstType) -> DecodedInst {
        DecodedInst {
            inst_type,
            size: if matches!(inst_type, InstType::CEbreak) {
                2
            } else {
                4
            },
            rd: 0,
            rs1: 0,
            imm: 0,
        }
    }
}

/// The return-link registers (`ra` and `t0` by convention).
pub fn is_link(reg: u8) -> bool {
    reg == 1 || reg == 5
}

fn sext(value: u32, bits: u32) -> i32 {
    debug_assert!(bits >= 1 && bits <= 32);
    ((value << (32 - bits)) as i32) >> (32 - bits)
}

/// Classifies the instruction whose first (or only) 32 bits are
/// `bits`. `arch_bits` disambiguates the compressed encodings that
/// changed meaning between RV32 and RV64.
pub fn decode_instruction(bits: u32, arch_bits: u8) -> DecodedInst {
    if bits & 0b11 != 0b11 {
        decode16(bits as u16, arch_bits)
    } else if bits & 0b11100 != 0b11100 {
        decode32(bits)
    } else {
        // 48-bit and longer encodings: not something the walker can
        // follow on its own.
        DecodedInst {
            inst_type: InstType::Unknown,
            size: 0,
            rd: 0,
            rs1: 0,
            imm: 0,
        }
    }
}

#[bitmatch]
fn decode32(bits: u32) -> DecodedInst {
    #[bitmatch]
    match bits {
        "00000000000000000000000001110011" => DecodedInst::system(InstType::Ecall),
        "00000000000100000000000001110011" => DecodedInst::system(InstType::Ebreak),
        "00110000001000000000000001110011" => DecodedInst::system(InstType::Mret),
        "00010000001000000000000001110011" => DecodedInst::system(InstType::Sret),
        "00000000001000000000000001110011" => DecodedInst::system(InstType::Uret),
        "iiiiiiiiiiiiiiiiiiiiddddd1101111" => {
            // imm[20|10:1|11|19:12]
            let imm = ((i >> 19) << 20)
                | ((i & 0xff) << 12)
                | (((i >> 8) & 0x1) << 11)
                | (((i >> 9) & 0x3ff) << 1);
            DecodedInst {
                inst_type: InstType::Jal,
                size: 4,
                rd: d as u8,
                rs1: 0,
                imm: sext(imm, 21),
            }
        }
        "iiiiiiiiiiiisssss000ddddd1100111" => DecodedInst {
            inst_type: InstType::Jalr,
            size: 4,
            rd: d as u8,
            rs1: s as u8,
            imm: sext(i, 12),
        },
        "iiiiiiitttttsssssfffjjjjj1100011" => {
            let inst_type = match f {
                0b000 => InstType::Beq,
                0b001 => InstType::Bne,
                0b100 => InstType::Blt,
                0b101 => InstType::Bge,
                0b110 => InstType::Bltu,
                0b111 => InstType::Bgeu,
                _ => return DecodedInst::scalar(4),
            };
            // imm[12|10:5] in i, imm[4:1|11] in j
            let imm =
                ((i >> 6) << 12) | ((j & 0x1) << 11) | ((i & 0x3f) << 5) | (((j >> 1) & 0xf) << 1);
            DecodedInst {
                inst_type,
                size: 4,
                rd: 0,
                rs1: s as u8,
                imm: sext(imm, 13),
            }
        }
        _ => DecodedInst::scalar(4),
    }
}

#[bitmatch]
fn decode16(half: u16, arch_bits: u8) -> DecodedInst {
    let half = half as u32;
    #[bitmatch]
    match half {
        "1001000000000010" => DecodedInst::system(InstType::CEbreak),
        "1000sssss0000010" => {
            if s == 0 {
                // Reserved encoding.
                DecodedInst::scalar(2)
            } else {
                DecodedInst {
                    inst_type: InstType::CJr,
                    size: 2,
                    rd: 0,
                    rs1: s as u8,
                    imm: 0,
                }
            }
        }
        "1001sssss0000010" => DecodedInst {
            inst_type: InstType::CJalr,
            size: 2,
            rd: 1,
            rs1: s as u8,
            imm: 0,
        },
        "101iiiiiiiiiii01" => DecodedInst {
            inst_type: InstType::CJ,
            size: 2,
            rd: 0,
            rs1: 0,
            imm: cj_imm(i),
        },
        "001iiiiiiiiiii01" => {
            if arch_bits == 32 {
                DecodedInst {
                    inst_type: InstType::CJal,
                    size: 2,
                    rd: 1,
                    rs1: 0,
                    imm: cj_imm(i),
                }
            } else {
                // c.addiw on RV64.
                DecodedInst::scalar(2)
            }
        }
        "110iiisssiiiii01" => DecodedInst {
            inst_type: InstType::CBeqz,
            size: 2,
            rd: 0,
            rs1: s as u8 + 8,
            imm: cb_imm(i),
        },
        "111iiisssiiiii01" => DecodedInst {
            inst_type: InstType::CBnez,
            size: 2,
            rd: 0,
            rs1: s as u8 + 8,
            imm: cb_imm(i),
        },
        _ => DecodedInst::scalar(2),
    }
}

/// Unscrambles the `c.j`/`c.jal` offset from instruction bits 12:2:
/// offset[11|4|9:8|10|6|7|3:1|5].
fn cj_imm(i: u32) -> i32 {
    let imm = (((i >> 10) & 0x1) << 11)
        | (((i >> 9) & 0x1) << 4)
        | (((i >> 7) & 0x3) << 8)
        | (((i >> 6) & 0x1) << 10)
        | (((i >> 5) & 0x1) << 6)
        | (((i >> 4) & 0x1) << 7)
        | (((i >> 1) & 0x7) << 1)
        | ((i & 0x1) << 5);
    sext(imm, 12)
}

/// Unscrambles the `c.beqz`/`c.bnez` offset from instruction bits
/// 12:10 and 6:2: offset[8|4:3] and offset[7:6|2:1|5].
fn cb_imm(i: u32) -> i32 {
    let imm = (((i >> 7) & 0x1) << 8)
        | (((i >> 5) & 0x3) << 3)
        | (((i >> 3) & 0x3) << 6)
        | (((i >> 1) & 0x3) << 1)
        | ((i & 0x1) << 5);
    sext(imm, 9)
}

#[cfg(test)]
mod classify {
    use super::*;

    #[test]
    fn jal() {
        // jal x0, +16
        let d = decode_instruction(0x0100_006f, 32);
        assert_eq!(d.inst_type, InstType::Jal);
        assert_eq!((d.rd, d.imm, d.size), (0, 16, 4));

        // jal ra, -4
        let d = decode_instruction(0xffdf_f0ef, 32);
        assert_eq!(d.inst_type, InstType::Jal);
        assert_eq!((d.rd, d.imm), (1, -4));
    }

    #[test]
    fn jalr() {
        // ret (jalr x0, 0(x1))
        let d = decode_instruction(0x0000_8067, 32);
        assert_eq!(d.inst_type, InstType::Jalr);
        assert_eq!((d.rd, d.rs1, d.imm), (0, 1, 0));

        // jalr x1, 0(x5)
        let d = decode_instruction(0x0002_80e7, 32);
        assert_eq!((d.rd, d.rs1), (1, 5));
    }

    #[test]
    fn conditional_branches() {
        // beq x0, x0, +8
        let d = decode_instruction(0x0000_0463, 32);
        assert_eq!(d.inst_type, InstType::Beq);
        assert_eq!(d.imm, 8);

        // bne x1, x2, -8
        let d = decode_instruction(0xfe20_9ce3, 32);
        assert_eq!(d.inst_type, InstType::Bne);
        assert_eq!(d.imm, -8);
    }

    #[test]
    fn compressed_jumps() {
        // c.j . + 4
        let d = decode_instruction(0xa011, 32);
        assert_eq!(d.inst_type, InstType::CJ);
        assert_eq!((d.imm, d.size), (4, 2));

        // c.jr x1 / c.jalr x1
        let d = decode_instruction(0x8082, 32);
        assert_eq!(d.inst_type, InstType::CJr);
        assert_eq!(d.rs1, 1);
        let d = decode_instruction(0x9082, 32);
        assert_eq!(d.inst_type, InstType::CJalr);
        assert_eq!((d.rd, d.rs1), (1, 1));
    }

    #[test]
    fn compressed_branches() {
        // c.beqz x8, +6
        let d = decode_instruction(0xc019, 32);
        assert_eq!(d.inst_type, InstType::CBeqz);
        assert_eq!((d.rs1, d.imm), (8, 6));
    }

    #[test]
    fn cjal_is_arch_dependent() {
        // 001 imm 01 is c.jal on RV32, c.addiw on RV64.
        let bits = 0x2011;
        assert_eq!(decode_instruction(bits, 32).inst_type, InstType::CJal);
        assert_eq!(decode_instruction(bits, 64).inst_type, InstType::Scalar);
    }

    #[test]
    fn traps() {
        assert_eq!(decode_instruction(0x0000_0073, 32).inst_type, InstType::Ecall);
        assert_eq!(decode_instruction(0x0010_0073, 32).inst_type, InstType::Ebreak);
        assert_eq!(decode_instruction(0x9002, 32).inst_type, InstType::CEbreak);
        assert_eq!(decode_instruction(0x3020_0073, 32).inst_type, InstType::Mret);
    }

    #[test]
    fn wide_encodings_are_unknown() {
        // 48-bit encoding prefix.
        let d = decode_instruction(0x0000_001f, 32);
        assert_eq!(d.inst_type, InstType::Unknown);
        assert_eq!(d.size, 0);
    }
}
