//! Slice-level primitives: the raw byte source, the per-message slice
//! group, and the bit-granular cursor that field parsing is built on.
//!
//! A slice is one byte of wire data. Bits 7:2 carry six payload bits,
//! bits 1:0 carry the MSEO code. Payload bits concatenate LSB-first
//! across the slices of a message.

use std::io::{ErrorKind, Read};

use bitvec::prelude::*;

use crate::{BadMessage, ErrorInt, Mseo};

/// Longest legal message, in slice bytes. Encoders never produce
/// more; a longer END-less run means the stream is corrupt.
pub const MAX_MESSAGE_SLICES: usize = 32;

/// Payload bits carried per slice.
pub const BITS_PER_SLICE: usize = 6;

/// Extracts the six payload bits of a slice byte.
#[inline]
pub fn payload(byte: u8) -> u8 {
    (byte >> 2) & 0x3f
}

/// Extracts the MSEO code of a slice byte. `None` for the reserved
/// `0b10` encoding.
#[inline]
pub fn mseo(byte: u8) -> Option<Mseo> {
    match byte & 0x3 {
        0x00 => Some(Mseo::Normal),
        0x01 => Some(Mseo::VarEnd),
        0x03 => Some(Mseo::End),
        _ => None,
    }
}

const CHUNK: usize = 4096;

/// Buffered byte source for the slice parser. Retries on
/// `Interrupted`, reports `WouldBlock` from non-blocking sources as
/// [`ErrorInt::NeedMore`], and tracks the absolute stream offset for
/// message records.
pub(crate) struct SliceReader<R>
where
    R: Read,
{
    reader: R,
    buf: [u8; CHUNK],
    len: usize,
    at: usize,
    offset: u64,
}

impl<R> SliceReader<R>
where
    R: Read,
{
    pub fn new(reader: R) -> SliceReader<R> {
        SliceReader {
            reader,
            buf: [0; CHUNK],
            len: 0,
            at: 0,
            offset: 0,
        }
    }

    /// Absolute offset of the next byte [`pop_byte`](Self::pop_byte)
    /// will return.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn pop_byte(&mut self) -> Result<u8, ErrorInt> {
        while self.at == self.len {
            match self.reader.read(&mut self.buf) {
                Ok(0) => return Err(ErrorInt::Eof),
                Ok(n) => {
                    self.at = 0;
                    self.len = n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(ErrorInt::NeedMore),
                Err(e) => return Err(e.into()),
            }
        }

        let byte = self.buf[self.at];
        self.at += 1;
        self.offset += 1;
        Ok(byte)
    }
}

/// One END-terminated group of slices, unpacked into a contiguous
/// payload bit buffer plus the MSEO code of each slice.
#[derive(Debug, Clone, Default)]
pub struct MessageSlices {
    raw: Vec<u8>,
    bits: BitVec<Lsb0, u8>,
    mseo: Vec<Mseo>,
}

impl MessageSlices {
    pub fn new() -> MessageSlices {
        MessageSlices::default()
    }

    /// Appends one slice byte. The byte must have a valid MSEO code;
    /// the parser filters the reserved encoding before calling this.
    pub fn push(&mut self, byte: u8) {
        let code = mseo(byte).expect("slice byte with reserved MSEO");
        self.raw.push(byte);
        self.mseo.push(code);
        let p = payload(byte);
        for i in 0..BITS_PER_SLICE {
            self.bits.push(p & (1 << i) != 0);
        }
    }

    /// The raw wire bytes of the group.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn num_slices(&self) -> usize {
        self.mseo.len()
    }

    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    /// True once the group ends in an END slice.
    pub fn complete(&self) -> bool {
        self.mseo.last() == Some(&Mseo::End)
    }
}

/// Reads arbitrary-width little-endian fields out of a
/// [`MessageSlices`] group while honoring the MSEO boundaries of
/// every slice passed over, not just the final one.
pub struct BitCursor<'a> {
    msg: &'a MessageSlices,
    pos: usize,
    eom: bool,
}

impl<'a> BitCursor<'a> {
    pub fn new(msg: &'a MessageSlices) -> BitCursor<'a> {
        BitCursor {
            msg,
            pos: 0,
            eom: false,
        }
    }

    /// True once a read has consumed the final payload bit of the END
    /// slice. Fields after that point are absent by definition.
    pub fn eom(&self) -> bool {
        self.eom
    }

    /// Current bit position, for error reporting.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Reads a fixed field of `width` bits (1..=64). The read may span
    /// slices, but every slice boundary it steps across must belong to
    /// a NORMAL slice: fixed fields never continue past the end of a
    /// variable field or message.
    pub fn read_fixed(&mut self, width: usize) -> Result<u64, BadMessage> {
        debug_assert!(width >= 1 && width <= 64);

        let end = self.pos + width;
        if end > self.msg.bit_len() {
            return Err(BadMessage::Truncated {
                want: end,
                have: self.msg.bit_len(),
            });
        }

        // Slices fully passed over mid-read must be NORMAL.
        let first = self.pos / BITS_PER_SLICE;
        let last = (end - 1) / BITS_PER_SLICE;
        for slice in first..last {
            if self.msg.mseo[slice] != Mseo::Normal {
                return Err(BadMessage::FieldBoundary {
                    width,
                    at: self.pos,
                });
            }
        }

        let value = self.msg.bits[self.pos..end].load_le::<u64>();
        self.pos = end;
        if end == self.msg.bit_len() {
            self.eom = true;
        }
        Ok(value)
    }

    /// Reads a variable field: all payload bits from the current
    /// position through the next slice whose MSEO is not NORMAL.
    /// Returns the value and the number of bits consumed. Encodings
    /// with a set bit above position 63 fail with
    /// [`BadMessage::Overflow`].
    pub fn read_var(&mut self) -> Result<(u64, usize), BadMessage> {
        if self.pos >= self.msg.bit_len() {
            return Err(BadMessage::Truncated {
                want: self.pos + 1,
                have: self.msg.bit_len(),
            });
        }

        let first = self.pos / BITS_PER_SLICE;
        let term = (first..self.msg.num_slices())
            .find(|&slice| self.msg.mseo[slice] != Mseo::Normal)
            .expect("slice group without terminator");

        let end = (term + 1) * BITS_PER_SLICE;
        let width = end - self.pos;

        let value_end = end.min(self.pos + 64);
        let value = self.msg.bits[self.pos..value_end].load_le::<u64>();
        if width > 64 && self.msg.bits[value_end..end].any() {
            // Leave the cursor past the field so the caller can keep
            // resynchronizing on slice boundaries.
            self.pos = end;
            self.eom = self.msg.mseo[term] == Mseo::End;
            return Err(BadMessage::Overflow);
        }

        self.pos = end;
        self.eom = self.msg.mseo[term] == Mseo::End;
        Ok((value, width))
    }
}
