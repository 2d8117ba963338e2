//! Next-PC proposal and call/return classification for a single
//! retired instruction.
//!
//! The walker in the engine owns the counts; this module is the pure
//! part: given a classified instruction, where can the PC go, and how
//! does the transfer classify for call-graph purposes.

use crate::inst::{is_link, DecodedInst, InstType};
use crate::crflags;

/// Fall-through address of `inst` at `pc`.
pub fn fall_through(pc: u64, inst: &DecodedInst) -> u64 {
    pc.wrapping_add(inst.size as u64)
}

/// Statically-known transfer target (direct jumps, taken conditional
/// branches).
pub fn direct_target(pc: u64, inst: &DecodedInst) -> u64 {
    pc.wrapping_add(inst.imm as i64 as u64)
}

/// Call/return flags implied by the instruction itself. Interrupt
/// detection is the engine's job; it is a property of the transfer,
/// not the opcode.
pub fn call_return_flags(inst: &DecodedInst) -> u8 {
    match inst.inst_type {
        InstType::Jal | InstType::CJal => {
            if is_link(inst.rd) {
                crflags::CALL
            } else {
                crflags::NONE
            }
        }
        InstType::Jalr | InstType::CJr | InstType::CJalr => {
            indirect_flags(inst.rd, inst.rs1)
        }
        InstType::Ecall | InstType::Ebreak | InstType::CEbreak => crflags::EXCEPTION,
        InstType::Mret | InstType::Sret | InstType::Uret => crflags::EXCEPTION_RETURN,
        _ => crflags::NONE,
    }
}

/// The link-register rules for register-indirect jumps:
///
/// | rd      | rs1     |                | class  |
/// |---------|---------|----------------|--------|
/// | link    | != link |                | call   |
/// | link    | link    | rd != rs1      | swap   |
/// | link    | link    | rd == rs1      | call   |
/// | != link | link    |                | return |
/// | != link | != link |                | none   |
fn indirect_flags(rd: u8, rs1: u8) -> u8 {
    match (is_link(rd), is_link(rs1)) {
        (true, false) => crflags::CALL,
        (true, true) if rd != rs1 => crflags::SWAP,
        (true, true) => crflags::CALL,
        (false, true) => crflags::RETURN,
        (false, false) => crflags::NONE,
    }
}
