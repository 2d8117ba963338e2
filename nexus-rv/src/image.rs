//! The program image the engine walks against.
//!
//! The decoder does not read ELF files or run a disassembler; it
//! consumes a pre-built view of executable memory: 16-bit halfwords
//! plus optional per-address display text and source decorations.

use std::collections::{BTreeMap, HashMap};

/// Source-level decoration for one address.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceInfo {
    pub file: String,
    pub line: u32,
    pub function: String,
    /// Nearest preceding symbol and the distance to it.
    pub label: String,
    pub label_offset: u64,
}

/// Immutable view of the traced program.
pub trait ProgramImage {
    /// The halfword at `addr`, if it lies inside an executable
    /// section.
    fn halfword(&self, addr: u64) -> Option<u16>;

    /// Pre-disassembled display text for the instruction at `addr`.
    fn disassembly(&self, addr: u64) -> Option<&str>;

    /// Source decoration for `addr`.
    fn source_info(&self, addr: u64) -> Option<&SourceInfo>;

    /// Up to 32 bits of instruction starting at `addr`, assembled
    /// little-endian from halfwords. `None` if even the first
    /// halfword is outside the image.
    fn instruction_bits(&self, addr: u64) -> Option<u32> {
        let low = self.halfword(addr)? as u32;
        if low & 0b11 != 0b11 {
            return Some(low);
        }
        match self.halfword(addr.wrapping_add(2)) {
            Some(high) => Some(low | (high as u32) << 16),
            // A 32-bit encoding cut off by the end of the section;
            // surface what is there and let classification fail.
            None => Some(low),
        }
    }
}

/// Append-only table implementation of [`ProgramImage`]: halfwords
/// keyed by address, decorations on the side. This is what the flat
/// binary loader and the tests use; an ELF-backed image implements
/// the same trait elsewhere.
#[derive(Debug, Clone, Default)]
pub struct TableImage {
    halfwords: BTreeMap<u64, u16>,
    disasm: HashMap<u64, String>,
    source: HashMap<u64, SourceInfo>,
}

impl TableImage {
    pub fn new() -> TableImage {
        TableImage::default()
    }

    /// Loads a flat binary blob at `base`. Odd trailing bytes are
    /// dropped; halfwords are little-endian.
    pub fn load_binary(&mut self, base: u64, bytes: &[u8]) {
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            self.halfwords
                .insert(base + 2 * i as u64, u16::from_le_bytes([pair[0], pair[1]]));
        }
    }

    pub fn set_halfword(&mut self, addr: u64, halfword: u16) {
        self.halfwords.insert(addr, halfword);
    }

    /// Places a full 32-bit instruction at `addr`.
    pub fn set_word(&mut self, addr: u64, word: u32) {
        self.halfwords.insert(addr, word as u16);
        self.halfwords.insert(addr + 2, (word >> 16) as u16);
    }

    pub fn set_disassembly(&mut self, addr: u64, text: impl Into<String>) {
        self.disasm.insert(addr, text.into());
    }

    pub fn set_source_info(&mut self, addr: u64, info: SourceInfo) {
        self.source.insert(addr, info);
    }

    pub fn is_empty(&self) -> bool {
        self.halfwords.is_empty()
    }
}

impl ProgramImage for TableImage {
    fn halfword(&self, addr: u64) -> Option<u16> {
        self.halfwords.get(&addr).copied()
    }

    fn disassembly(&self, addr: u64) -> Option<&str> {
        self.disasm.get(&addr).map(|s| s.as_str())
    }

    fn source_info(&self, addr: u64) -> Option<&SourceInfo> {
        self.source.get(&addr)
    }
}
