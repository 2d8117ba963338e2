//! Instrumentation trace channel (ITC) aggregation.
//!
//! Software on the target writes words to stimulus registers; the
//! trace carries them as DATA_ACQUISITION / AUXACCESS_WRITE messages.
//! This module reassembles those writes into printable, timestamped
//! strings: either byte-wise (the print channel) or via pre-parsed
//! no-load format strings, where a single write carries the arguments
//! and the format lives in the image.

use std::collections::VecDeque;

use log::debug;

use crate::MAX_HARTS;

/// A pre-parsed no-load format string. The channel a write lands on
/// selects the record; `data` is split into `arg_count` fields.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NlString {
    /// Number of arguments packed into the 32-bit write (0..=4).
    pub arg_count: u8,
    /// Bit `i` set means argument `i` is signed.
    pub signed_mask: u32,
    /// printf-style format; `%d %i %u %x %X %c %%` are understood.
    pub format: String,
}

/// ITC handling configuration.
#[derive(Debug, Clone)]
pub struct ItcOptions {
    /// Reassemble byte-wise prints from [`channel`](Self::channel).
    pub print: bool,

    /// Format no-load-string writes.
    pub nls: bool,

    /// Stimulus channel carrying printable bytes.
    pub channel: u8,

    /// In-progress line capacity in bytes; overflow drops from the
    /// head and flags the next emitted message.
    pub capacity: usize,

    /// No-load format strings, indexed by channel (up to 32).
    pub formats: Vec<Option<NlString>>,
}

impl Default for ItcOptions {
    fn default() -> ItcOptions {
        ItcOptions {
            print: false,
            nls: true,
            channel: 0,
            capacity: 4096,
            formats: Vec::new(),
        }
    }
}

/// A completed instrumentation message.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItcMessage {
    pub text: String,
    /// Timestamp of the first contributing write.
    pub start_time: u64,
    /// Timestamp of the write that completed the message.
    pub end_time: u64,
    /// Data was lost to ring overflow somewhere before this message.
    pub overflowed: bool,
}

#[derive(Debug, Default)]
struct HartItc {
    line: Vec<u8>,
    start_time: u64,
    have_start: bool,
    dropped: bool,
    done: VecDeque<ItcMessage>,
}

/// Per-hart aggregation of instrumentation writes.
#[derive(Debug)]
pub struct ItcPrint {
    opts: ItcOptions,
    harts: Vec<HartItc>,
}

impl ItcPrint {
    pub fn new(opts: ItcOptions) -> ItcPrint {
        let mut harts = Vec::with_capacity(MAX_HARTS);
        harts.resize_with(MAX_HARTS, HartItc::default);
        ItcPrint { opts, harts }
    }

    pub fn enabled(&self) -> bool {
        self.opts.print || self.opts.nls
    }

    /// Feeds one instrumentation write. `address` is the stimulus
    /// register offset: bits 31:2 select the channel, bits 1:0 the
    /// write width (0 = word, 2 = halfword, 3 = byte).
    pub fn feed(&mut self, hart: usize, address: u32, data: u32, timestamp: u64) {
        if hart >= self.harts.len() {
            return;
        }
        let channel = address >> 2;

        if self.opts.nls {
            if let Some(Some(nls)) = self.opts.formats.get(channel as usize) {
                let text = format_nls(nls, data);
                self.terminate_line(hart, timestamp);
                let h = &mut self.harts[hart];
                h.done.push_back(ItcMessage {
                    text,
                    start_time: timestamp,
                    end_time: timestamp,
                    overflowed: std::mem::take(&mut h.dropped),
                });
                return;
            }
        }

        if self.opts.print && channel == self.opts.channel as u32 {
            let width = match address & 0x3 {
                3 => 1,
                2 => 2,
                _ => 4,
            };
            for i in 0..width {
                let byte = (data >> (8 * i)) as u8;
                self.push_char(hart, byte, timestamp);
            }
        }
    }

    fn push_char(&mut self, hart: usize, byte: u8, timestamp: u64) {
        match byte {
            b'\0' | b'\n' | b'\r' => {
                let h = &mut self.harts[hart];
                if !h.have_start {
                    h.start_time = timestamp;
                }
                let msg = ItcMessage {
                    text: String::from_utf8_lossy(&h.line).into_owned(),
                    start_time: h.start_time,
                    end_time: timestamp,
                    overflowed: std::mem::take(&mut h.dropped),
                };
                h.line.clear();
                h.have_start = false;
                h.done.push_back(msg);
            }
            _ => {
                let h = &mut self.harts[hart];
                if !h.have_start {
                    h.start_time = timestamp;
                    h.have_start = true;
                }
                if h.line.len() >= self.opts.capacity {
                    h.line.remove(0);
                    if !h.dropped {
                        debug!("itc line overflow on hart {}, dropping head", hart);
                    }
                    h.dropped = true;
                }
                h.line.push(byte);
            }
        }
    }

    /// Terminates any in-progress line as its own message.
    fn terminate_line(&mut self, hart: usize, timestamp: u64) {
        let h = &mut self.harts[hart];
        if h.line.is_empty() {
            return;
        }
        let msg = ItcMessage {
            text: String::from_utf8_lossy(&h.line).into_owned(),
            start_time: h.start_time,
            end_time: timestamp,
            overflowed: std::mem::take(&mut h.dropped),
        };
        h.line.clear();
        h.have_start = false;
        h.done.push_back(msg);
    }

    /// Next completed message for `hart`, if any.
    pub fn poll(&mut self, hart: usize) -> Option<ItcMessage> {
        self.harts.get_mut(hart)?.done.pop_front()
    }

    /// True if [`poll`](Self::poll) would return something.
    pub fn pending(&self, hart: usize) -> bool {
        self.harts
            .get(hart)
            .map(|h| !h.done.is_empty())
            .unwrap_or(false)
    }

    /// Hands back an unterminated in-progress line so nothing is lost
    /// at end of stream. Completed messages still queue first.
    pub fn flush(&mut self, hart: usize) -> Option<ItcMessage> {
        if let Some(msg) = self.poll(hart) {
            return Some(msg);
        }
        let h = self.harts.get_mut(hart)?;
        if h.line.is_empty() {
            return None;
        }
        let msg = ItcMessage {
            text: String::from_utf8_lossy(&h.line).into_owned(),
            start_time: h.start_time,
            end_time: h.start_time,
            overflowed: std::mem::take(&mut h.dropped),
        };
        h.line.clear();
        h.have_start = false;
        Some(msg)
    }
}

/// Splits `data` into the argument fields of `nls` and renders the
/// format. Field widths follow the write convention: one argument
/// takes all 32 bits, two take 16 each, three take 11/11/10, four
/// take bytes.
fn format_nls(nls: &NlString, data: u32) -> String {
    let args: Vec<(u32, u32)> = match nls.arg_count.min(4) {
        0 => Vec::new(),
        1 => vec![(data, 32)],
        2 => vec![(data >> 16, 16), (data & 0xffff, 16)],
        3 => vec![
            (data >> 21, 11),
            ((data >> 10) & 0x7ff, 11),
            (data & 0x3ff, 10),
        ],
        _ => vec![
            (data >> 24, 8),
            ((data >> 16) & 0xff, 8),
            ((data >> 8) & 0xff, 8),
            (data & 0xff, 8),
        ],
    };

    let mut out = String::new();
    let mut next = 0usize;
    let mut chars = nls.format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(spec) => {
                let (value, width) = args.get(next).copied().unwrap_or((0, 32));
                let signed = nls.signed_mask & (1 << next) != 0;
                next += 1;
                let signed_value = ((value << (32 - width)) as i32) >> (32 - width);
                match spec {
                    'd' | 'i' => {
                        if signed {
                            out.push_str(&signed_value.to_string());
                        } else {
                            out.push_str(&value.to_string());
                        }
                    }
                    'u' => out.push_str(&value.to_string()),
                    'x' => out.push_str(&format!("{:x}", value)),
                    'X' => out.push_str(&format!("{:X}", value)),
                    'c' => out.push(char::from(value as u8)),
                    other => {
                        // Not a conversion this decoder does; keep it
                        // visible rather than guessing.
                        out.push('%');
                        out.push(other);
                        next -= 1;
                    }
                }
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod aggregation {
    use super::*;

    fn print_opts() -> ItcOptions {
        ItcOptions {
            print: true,
            nls: false,
            channel: 0,
            capacity: 64,
            formats: Vec::new(),
        }
    }

    // Writes to the print channel whose payload ends in a terminator
    // come back out as exactly one string, bytes in order.
    #[test]
    fn lossless_framing() {
        let mut itc = ItcPrint::new(print_opts());
        itc.feed(0, 0, u32::from_le_bytes(*b"hell"), 10);
        itc.feed(0, 0, u32::from_le_bytes(*b"o!\n\0"), 20);

        let msg = itc.poll(0).expect("message after terminator");
        assert_eq!(msg.text, "hello!");
        assert_eq!((msg.start_time, msg.end_time), (10, 20));
        // The trailing NUL terminates a second, empty message.
        assert_eq!(itc.poll(0).unwrap().text, "");
        assert!(itc.poll(0).is_none());
    }

    #[test]
    fn width_comes_from_the_low_address_bits() {
        let mut itc = ItcPrint::new(print_opts());
        itc.feed(0, 0x3, b'a' as u32, 1); // byte write
        itc.feed(0, 0x2, u32::from_le_bytes([b'b', b'c', 0, 0]), 2); // halfword
        itc.feed(0, 0x3, b'\n' as u32, 3);
        assert_eq!(itc.flush(0).unwrap().text, "abc");
    }

    #[test]
    fn other_channels_are_ignored() {
        let mut itc = ItcPrint::new(print_opts());
        itc.feed(0, 5 << 2, b'x' as u32, 1);
        assert!(itc.flush(0).is_none());
    }

    #[test]
    fn flush_recovers_partial_line() {
        let mut itc = ItcPrint::new(print_opts());
        itc.feed(0, 0x3, b'p' as u32, 7);
        assert!(itc.poll(0).is_none());
        let msg = itc.flush(0).unwrap();
        assert_eq!(msg.text, "p");
        assert_eq!(msg.start_time, 7);
    }

    #[test]
    fn overflow_drops_head_and_flags() {
        let mut opts = print_opts();
        opts.capacity = 4;
        let mut itc = ItcPrint::new(opts);
        for &b in b"abcdef" {
            itc.feed(0, 0x3, b as u32, 1);
        }
        itc.feed(0, 0x3, b'\n' as u32, 2);
        let msg = itc.poll(0).unwrap();
        assert_eq!(msg.text, "cdef");
        assert!(msg.overflowed);
    }

    #[test]
    fn per_hart_isolation() {
        let mut itc = ItcPrint::new(print_opts());
        itc.feed(0, 0x3, b'a' as u32, 1);
        itc.feed(1, 0x3, b'b' as u32, 1);
        assert_eq!(itc.flush(0).unwrap().text, "a");
        assert_eq!(itc.flush(1).unwrap().text, "b");
    }

    #[test]
    fn nls_formats_and_closes_the_line() {
        let mut opts = print_opts();
        opts.nls = true;
        opts.formats = vec![
            None,
            Some(NlString {
                arg_count: 2,
                signed_mask: 0b10,
                format: "x=%u y=%d%%".into(),
            }),
        ];
        let mut itc = ItcPrint::new(opts);
        // Partial print-channel line first.
        itc.feed(0, 0x3, b'q' as u32, 1);
        // Then an NLS write on channel 1: args 3 and -2.
        let data = (3u32 << 16) | (-2i32 as u32 & 0xffff);
        itc.feed(0, (1 << 2) | 0, data, 5);

        assert_eq!(itc.poll(0).unwrap().text, "q");
        assert_eq!(itc.poll(0).unwrap().text, "x=3 y=-2%");
    }

    #[test]
    fn nls_char_and_hex() {
        let nls = NlString {
            arg_count: 4,
            signed_mask: 0,
            format: "%c%c=%x/%X".into(),
        };
        assert_eq!(format_nls(&nls, 0x41_42_1f_2a), "AB=1f/2A");
    }
}
