//! Streaming slice unwrapping for the serial-wire fan-out path.
//!
//! Unlike the pull-based [`SliceParser`](crate::parser::SliceParser),
//! this variant is fed one byte at a time and reports message
//! structure through callbacks, which suits a socket pump that never
//! wants to block on a partial message. Only DATA_ACQUISITION
//! messages are reassembled into values; everything else is observed
//! structurally and passed over.

use std::fmt;

use bitvec::prelude::*;

/// Callbacks the unwrapper makes as it recognizes message structure.
pub trait SliceAcceptor {
    /// First slice of a message seen; `tcode` is its payload.
    fn start_message(&mut self, tcode: u8);

    /// A field boundary slice landed: all payload bits accumulated
    /// since the last boundary, LSB-first. `overflowed` reports that
    /// the accumulator capacity was exceeded and `bits` is truncated.
    fn message_data(&mut self, bits: &BitSlice<Lsb0, u8>, overflowed: bool);

    /// The boundary ended a variable field.
    fn end_field(&mut self);

    /// The boundary ended the whole message.
    fn end_message(&mut self);
}

/// Accumulator cap. A well-formed field never gets near this; a
/// stream of line noise could.
pub const MAX_ACCUMULATOR_BITS: usize = 4096;

/// State machine translating raw slice bytes into [`SliceAcceptor`]
/// callbacks. The unwrapper owns its acceptor; [`acceptor`],
/// [`acceptor_mut`] and [`into_inner`] reach it.
///
/// [`acceptor`]: Self::acceptor
/// [`acceptor_mut`]: Self::acceptor_mut
/// [`into_inner`]: Self::into_inner
pub struct SliceUnwrapper<A>
where
    A: SliceAcceptor,
{
    acceptor: A,
    in_message: bool,
    data: BitVec<Lsb0, u8>,
    overflowed: bool,
}

impl<A> SliceUnwrapper<A>
where
    A: SliceAcceptor,
{
    pub fn new(acceptor: A) -> SliceUnwrapper<A> {
        SliceUnwrapper {
            acceptor,
            in_message: false,
            data: BitVec::new(),
            overflowed: false,
        }
    }

    pub fn acceptor(&self) -> &A {
        &self.acceptor
    }

    pub fn acceptor_mut(&mut self) -> &mut A {
        &mut self.acceptor
    }

    pub fn into_inner(self) -> A {
        self.acceptor
    }

    fn empty_data(&mut self) {
        self.data.clear();
        self.overflowed = false;
    }

    /// Feeds one wire byte.
    pub fn append_byte(&mut self, byte: u8) {
        let mseo = byte & 0x3;
        let mdo = byte >> 2;

        if !self.in_message && mseo == 0 {
            // Optimistically the start of a message; the TCODE goes
            // out through the callback and not into the field data.
            self.in_message = true;
            self.acceptor.start_message(mdo);
        } else if self.in_message {
            if self.data.len() < MAX_ACCUMULATOR_BITS - 6 {
                for i in 0..6 {
                    self.data.push(mdo & (1 << i) != 0);
                }
            } else {
                self.overflowed = true;
            }
            if mseo != 0 {
                self.acceptor.message_data(&self.data, self.overflowed);
                if mseo & 0x1 != 0 {
                    self.acceptor.end_field();
                }
                if mseo & 0x2 != 0 {
                    self.acceptor.end_message();
                    self.in_message = false;
                }
                self.empty_data();
            }
        } else {
            // Mid-message noise from before we attached; the next
            // clean start slice resynchronizes.
        }
    }
}

/// A reassembled DATA_ACQUISITION message.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataAcquisitionMessage {
    pub src: Option<u32>,
    pub idtag: u32,
    pub data: u32,
    pub timestamp: Option<u64>,
}

impl fmt::Display for DataAcquisitionMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcode=7")?;
        if let Some(src) = self.src {
            write!(f, " src={:x}", src)?;
        }
        write!(f, " idtag={:x} dqdata={:x}", self.idtag, self.data)?;
        if let Some(ts) = self.timestamp {
            write!(f, " timestamp={:x}", ts)?;
        }
        Ok(())
    }
}

/// [`SliceAcceptor`] that reconstructs DATA_ACQUISITION messages.
/// Messages of any other kind, messages with a wrong variable-field
/// count, and messages containing an overflowed field are silently
/// discarded.
pub struct MessageReassembler {
    src_bits: u8,
    accepting: bool,
    field_count: usize,
    overflowed_field: bool,
    ready: bool,
    wip: DataAcquisitionMessage,
}

impl MessageReassembler {
    pub fn new(src_bits: u8) -> MessageReassembler {
        MessageReassembler {
            src_bits,
            accepting: false,
            field_count: 0,
            overflowed_field: false,
            ready: false,
            wip: DataAcquisitionMessage::default(),
        }
    }

    /// Takes the completed message, if one is ready. Getting it
    /// consumes it.
    pub fn get_message(&mut self) -> Option<DataAcquisitionMessage> {
        if self.ready {
            self.ready = false;
            Some(self.wip.clone())
        } else {
            None
        }
    }
}

fn load_bits(bits: &BitSlice<Lsb0, u8>, from: usize, max: usize) -> u64 {
    if from >= bits.len() {
        return 0;
    }
    let to = bits.len().min(from + max);
    bits[from..to].load_le::<u64>()
}

impl SliceAcceptor for MessageReassembler {
    fn start_message(&mut self, tcode: u8) {
        self.ready = false;
        self.overflowed_field = false;
        self.field_count = 0;
        self.wip = DataAcquisitionMessage::default();
        self.accepting = tcode == 7;
    }

    fn message_data(&mut self, bits: &BitSlice<Lsb0, u8>, overflowed: bool) {
        if !self.accepting {
            return;
        }
        if overflowed {
            self.overflowed_field = true;
            return;
        }
        let src_bits = self.src_bits as usize;
        match self.field_count {
            0 => {
                if src_bits != 0 {
                    self.wip.src = Some(load_bits(bits, 0, src_bits.min(32)) as u32);
                }
                self.wip.idtag = load_bits(bits, src_bits, 32) as u32;
            }
            1 => self.wip.data = load_bits(bits, 0, 32) as u32,
            2 => self.wip.timestamp = Some(load_bits(bits, 0, 64)),
            _ => {
                // Extra fields mean the message is malformed; the
                // field count check at end of message rejects it.
            }
        }
    }

    fn end_field(&mut self) {
        self.field_count += 1;
    }

    fn end_message(&mut self) {
        if self.accepting {
            self.accepting = false;
            if (2..=3).contains(&self.field_count) && !self.overflowed_field {
                self.ready = true;
            }
        }
    }
}

/// Combined unwrapper + reassembler with a one-call interface.
pub struct NexusStream {
    unwrapper: SliceUnwrapper<MessageReassembler>,
}

impl NexusStream {
    pub fn new(src_bits: u8) -> NexusStream {
        NexusStream {
            unwrapper: SliceUnwrapper::new(MessageReassembler::new(src_bits)),
        }
    }

    /// Feeds one byte; returns a message when that byte completed
    /// one.
    pub fn append_byte(&mut self, byte: u8) -> Option<DataAcquisitionMessage> {
        self.unwrapper.append_byte(byte);
        self.unwrapper.acceptor_mut().get_message()
    }
}
