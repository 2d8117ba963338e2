//! The slice parser: turns the raw byte stream into typed
//! [`Message`]s, one per END-terminated slice group.

use std::io::Read;

use log::{debug, warn};

use crate::message::{Message, Payload};
use crate::slice::{mseo, BitCursor, MessageSlices, SliceReader, MAX_MESSAGE_SLICES};
use crate::{BType, BadMessage, Error, ErrorInt, IctReason, Mseo, SyncReason, TCode};

/// Streaming message parser.
///
/// The source-id width is fixed at construction and applies to the
/// whole stream. Parse failures are logged and recovered internally:
/// the parser drops the corrupted group, resynchronizes on the next
/// END slice, and keeps going. [`dropped`](Self::dropped) counts the
/// casualties.
pub struct SliceParser<R>
where
    R: Read,
{
    reader: SliceReader<R>,
    src_bits: u8,
    msg_num: u32,
    dropped: u32,

    // Partially collected group, kept across NeedMore returns so a
    // non-blocking source never loses slices.
    group: MessageSlices,
    group_offset: u64,
    poison: Option<BadMessage>,
}

impl<R> SliceParser<R>
where
    R: Read,
{
    pub fn new(reader: R, src_bits: u8) -> SliceParser<R> {
        SliceParser {
            reader: SliceReader::new(reader),
            src_bits,
            msg_num: 0,
            dropped: 0,
            group: MessageSlices::new(),
            group_offset: 0,
            poison: None,
        }
    }

    /// Number of slice groups dropped due to parse failures.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Number of messages successfully parsed so far.
    pub fn message_count(&self) -> u32 {
        self.msg_num
    }

    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut R {
        self.reader.get_mut()
    }

    /// Returns an iterator over the remaining [`Message`]s.
    pub fn messages(&mut self) -> Messages<R> {
        Messages { parser: self }
    }

    pub(crate) fn next_int(&mut self) -> Result<Message, ErrorInt> {
        loop {
            match self.fill_group() {
                Ok(()) => {}
                Err(ErrorInt::BadMessage(bad)) => {
                    self.dropped += 1;
                    warn!(
                        "dropping slice group at offset {}: {}",
                        self.group_offset, bad
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            let group = std::mem::take(&mut self.group);
            match self.parse_group(&group) {
                Ok(msg) => return Ok(msg),
                Err(bad) => {
                    self.dropped += 1;
                    warn!(
                        "dropping message {} at offset {}: {}",
                        self.msg_num + self.dropped,
                        self.group_offset,
                        bad
                    );
                }
            }
        }
    }

    /// Collects slices into `self.group` until an END slice lands.
    /// Streams containing the reserved MSEO code or an overlong
    /// group are consumed through their next END slice and reported
    /// as `BadMessage`, leaving the parser aligned on a message
    /// boundary.
    fn fill_group(&mut self) -> Result<(), ErrorInt> {
        loop {
            let offset = self.reader.offset();
            let byte = self.reader.pop_byte()?;

            let code = match mseo(byte) {
                Some(code) => code,
                None => {
                    self.poison.get_or_insert(BadMessage::InvalidMseo(byte));
                    continue;
                }
            };

            if self.group.num_slices() == 0 && self.poison.is_none() {
                self.group_offset = offset;
            }
            if self.poison.is_none() {
                self.group.push(byte);
                if self.group.num_slices() > MAX_MESSAGE_SLICES {
                    self.poison = Some(BadMessage::MissingEnd(MAX_MESSAGE_SLICES));
                }
            }

            if code == Mseo::End {
                return match self.poison.take() {
                    Some(bad) => {
                        self.group = MessageSlices::new();
                        Err(bad.into())
                    }
                    None => Ok(()),
                };
            }
        }
    }

    fn parse_group(&mut self, group: &MessageSlices) -> Result<Message, BadMessage> {
        let mut cur = BitCursor::new(group);

        let raw_tcode = cur.read_fixed(6)? as u8;
        let src = if self.src_bits > 0 {
            cur.read_fixed(self.src_bits as usize)? as u8
        } else {
            0
        };

        let tcode = TCode::from_raw(raw_tcode).ok_or(BadMessage::UnsupportedTcode(raw_tcode))?;

        let payload = match tcode {
            TCode::OwnershipTrace => {
                let (word, _) = cur.read_var()?;
                Payload::Ownership {
                    tag: (word & 0x3) as u8,
                    prv: ((word >> 2) & 0x3) as u8,
                    v: ((word >> 4) & 0x1) as u8,
                    pid: (word >> 5) as u32,
                }
            }
            TCode::DirectBranch => Payload::DirectBranch {
                i_cnt: cur.read_var()?.0 as u32,
            },
            TCode::IndirectBranch => {
                let b_type = read_b_type(&mut cur)?;
                Payload::IndirectBranch {
                    b_type,
                    i_cnt: cur.read_var()?.0 as u32,
                    u_addr: cur.read_var()?.0,
                }
            }
            TCode::DataAcquisition => Payload::DataAcquisition {
                id_tag: cur.read_var()?.0 as u32,
                data: cur.read_var()?.0 as u32,
            },
            TCode::Error => {
                let etype = cur.read_fixed(4)? as u8;
                let _padding = cur.read_var()?;
                Payload::Error { etype }
            }
            TCode::Sync => Payload::Sync {
                reason: SyncReason::from_raw(cur.read_fixed(4)?),
                i_cnt: cur.read_var()?.0 as u32,
                f_addr: cur.read_var()?.0,
            },
            TCode::DirectBranchWs => Payload::DirectBranchWs {
                reason: SyncReason::from_raw(cur.read_fixed(4)?),
                i_cnt: cur.read_var()?.0 as u32,
                f_addr: cur.read_var()?.0,
            },
            TCode::IndirectBranchWs => {
                let reason = SyncReason::from_raw(cur.read_fixed(4)?);
                let b_type = read_b_type(&mut cur)?;
                Payload::IndirectBranchWs {
                    reason,
                    b_type,
                    i_cnt: cur.read_var()?.0 as u32,
                    f_addr: cur.read_var()?.0,
                }
            }
            TCode::AuxAccessWrite => Payload::AuxAccessWrite {
                addr: cur.read_var()?.0 as u32,
                data: cur.read_var()?.0 as u32,
            },
            TCode::ResourceFull => Payload::ResourceFull {
                r_code: cur.read_fixed(4)? as u8,
                r_data: cur.read_var()?.0,
            },
            TCode::IndirectBranchHist => {
                let b_type = read_b_type(&mut cur)?;
                Payload::IndirectBranchHist {
                    b_type,
                    i_cnt: cur.read_var()?.0 as u32,
                    u_addr: cur.read_var()?.0,
                    history: cur.read_var()?.0,
                }
            }
            TCode::IndirectBranchHistWs => {
                let reason = SyncReason::from_raw(cur.read_fixed(4)?);
                let b_type = read_b_type(&mut cur)?;
                Payload::IndirectBranchHistWs {
                    reason,
                    b_type,
                    i_cnt: cur.read_var()?.0 as u32,
                    f_addr: cur.read_var()?.0,
                    history: cur.read_var()?.0,
                }
            }
            TCode::Correlation => {
                let evcode = cur.read_fixed(4)? as u8;
                let cdf = cur.read_fixed(2)? as u8;
                if cdf > 1 {
                    return Err(BadMessage::BadFieldValue {
                        field: "cdf",
                        value: cdf as u64,
                    });
                }
                let i_cnt = cur.read_var()?.0 as u32;
                let history = if cdf == 1 { cur.read_var()?.0 } else { 0 };
                Payload::Correlation {
                    evcode,
                    cdf,
                    i_cnt,
                    history,
                }
            }
            TCode::InCircuitTrace | TCode::InCircuitTraceWs => {
                let cksrc = IctReason::from_raw(cur.read_fixed(4)?);
                let ckdf = cur.read_fixed(2)? as u8;
                if ckdf > 1 {
                    return Err(BadMessage::BadFieldValue {
                        field: "ckdf",
                        value: ckdf as u64,
                    });
                }
                let mut ckdata = [0u64; 2];
                ckdata[0] = cur.read_var()?.0;
                if ckdf == 1 {
                    ckdata[1] = cur.read_var()?.0;
                }
                if tcode == TCode::InCircuitTrace {
                    Payload::InCircuitTrace {
                        cksrc,
                        ckdf,
                        ckdata,
                    }
                } else {
                    Payload::InCircuitTraceWs {
                        cksrc,
                        ckdf,
                        ckdata,
                    }
                }
            }
        };

        // One optional trailing timestamp. EOM already set means the
        // encoder omitted it; anything left over after reading it is
        // a framing error.
        let timestamp = if cur.eom() {
            None
        } else {
            Some(cur.read_var()?.0)
        };
        if !cur.eom() {
            return Err(BadMessage::TrailingBits(group.bit_len() - cur.pos()));
        }

        self.msg_num += 1;
        debug!(
            "message {}: {:?} src {} at offset {}",
            self.msg_num, tcode, src, self.group_offset
        );

        Ok(Message {
            msg_num: self.msg_num,
            src,
            timestamp,
            offset: self.group_offset,
            raw: group.raw().to_vec(),
            payload,
        })
    }
}

fn read_b_type(cur: &mut BitCursor) -> Result<BType, BadMessage> {
    let raw = cur.read_fixed(2)?;
    BType::from_raw(raw).ok_or(BadMessage::BadFieldValue {
        field: "b_type",
        value: raw,
    })
}

/// Iterator over parsed [`Message`]s. Ends at EOF; I/O and
/// unrecoverable errors are yielded as `Err`.
pub struct Messages<'a, R>
where
    R: Read,
{
    parser: &'a mut SliceParser<R>,
}

impl<'a, R> Iterator for Messages<'a, R>
where
    R: Read,
{
    type Item = Result<Message, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.parser.next_int() {
            Ok(msg) => Some(Ok(msg)),
            Err(e) => e.into_item().map(Err),
        }
    }
}
