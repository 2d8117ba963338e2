//! # `nexus-rv`
//!
//! A decoder for the RISC-V Nexus trace slice protocol (IEEE-ISTO
//! 5001 message formats as emitted by RISC-V trace encoders). The
//! crate reconstructs the full retired-instruction stream of one or
//! more harts from the raw trace byte stream and a program image.
//!
//! The decoder is split along the natural joints of the problem:
//!
//! - [`SliceParser`](parser::SliceParser) reassembles the 8-bit slice
//!   stream (6 payload bits + 2 MSEO bits per byte) into typed
//!   [`Message`](message::Message)s.
//! - [`Trace`](engine::Trace) drives the parser and a
//!   [`ProgramImage`](image::ProgramImage) through a per-hart state
//!   machine, yielding one decorated [`Instruction`](engine::Instruction)
//!   per call. Instrumentation (ITC) writes are folded into printable
//!   strings by [`ItcPrint`](itc::ItcPrint) on the side.
//! - [`NexusStream`](swt::NexusStream) is the callback-driven streaming
//!   variant used by the serial-wire fan-out server, sharing the same
//!   slice encoding rules.
//!
//! Usage is simple:
//! ```no_run
//! use nexus_rv::{Trace, TraceConfig, TableImage};
//!
//! let image = TableImage::new();
//! // or a std::fs::File, or anything else that implements std::io::Read
//! let stream: &[u8] = &[
//!     // ...
//! ];
//! let mut trace = Trace::new(stream, image, TraceConfig::default());
//! for instruction in trace.instructions() {
//!     // ...
//! }
//! ```
#[deny(rustdoc::broken_intra_doc_links)]
pub mod builder;
pub mod count;
pub mod engine;
pub mod image;
pub mod inst;
pub mod itc;
pub mod message;
pub mod parser;
pub mod slice;
pub mod stepper;
pub mod swt;

pub use count::{Count, CountKind};
pub use engine::{Analytics, Instruction, Instructions, Trace};
pub use image::{ProgramImage, SourceInfo, TableImage};
pub use itc::{ItcMessage, ItcOptions, ItcPrint, NlString};
pub use message::{Message, Payload};
pub use parser::SliceParser;
pub use slice::BitCursor;
pub use swt::{DataAcquisitionMessage, NexusStream, SliceAcceptor, SliceUnwrapper};

/// Maximum number of harts a single trace stream can carry. The `src`
/// field may be up to 8 bits wide, but encoders funnel at most this
/// many harts into one funnel port.
pub const MAX_HARTS: usize = 16;

/// Message-state-end-of code carried in the low two bits of every
/// slice byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mseo {
    /// More payload of the current field follows.
    Normal = 0x00,

    /// The slice terminates a variable-width field; the message
    /// continues.
    VarEnd = 0x01,

    /// The slice terminates the whole message. `0b10` is not a valid
    /// encoding and forces a resync.
    End = 0x03,
}

/// The 6-bit message kind carried in the first slice of every message.
///
/// The set is closed; kinds defined by Nexus but never produced by
/// RISC-V trace encoders (data read/write, port replacement, ...) are
/// recognized only far enough to be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TCode {
    OwnershipTrace = 2,
    DirectBranch = 3,
    IndirectBranch = 4,
    DataAcquisition = 7,
    Error = 8,
    Sync = 9,
    DirectBranchWs = 11,
    IndirectBranchWs = 12,
    AuxAccessWrite = 23,
    ResourceFull = 27,
    IndirectBranchHist = 28,
    IndirectBranchHistWs = 29,
    Correlation = 33,
    InCircuitTrace = 34,
    InCircuitTraceWs = 35,
}

impl TCode {
    /// Maps a raw 6-bit kind to a known `TCode`.
    pub fn from_raw(tcode: u8) -> Option<TCode> {
        Some(match tcode {
            2 => TCode::OwnershipTrace,
            3 => TCode::DirectBranch,
            4 => TCode::IndirectBranch,
            7 => TCode::DataAcquisition,
            8 => TCode::Error,
            9 => TCode::Sync,
            11 => TCode::DirectBranchWs,
            12 => TCode::IndirectBranchWs,
            23 => TCode::AuxAccessWrite,
            27 => TCode::ResourceFull,
            28 => TCode::IndirectBranchHist,
            29 => TCode::IndirectBranchHistWs,
            33 => TCode::Correlation,
            34 => TCode::InCircuitTrace,
            35 => TCode::InCircuitTraceWs,
            _ => return None,
        })
    }
}

/// Branch kind reported by indirect-branch messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BType {
    /// An ordinary computed transfer (`jalr` and friends).
    Indirect = 0,

    /// The transfer was caused by a trap or interrupt.
    Exception = 1,

    /// The transfer was caused by a hardware event (debug entry).
    Hardware = 2,
}

impl BType {
    fn from_raw(raw: u64) -> Option<BType> {
        Some(match raw {
            0 => BType::Indirect,
            1 => BType::Exception,
            2 => BType::Hardware,
            _ => return None,
        })
    }
}

/// Why a synchronizing message (one carrying a full address) was
/// emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncReason {
    ExternalTrigger = 0,
    ExitReset = 1,
    PeriodicCount = 2,
    ExitDebug = 3,
    ICntOverflow = 4,
    TraceEnable = 5,
    Watchpoint = 6,
    FifoOverrun = 7,
    ExitPowerDown = 9,
    MessageContention = 11,
    PcSample = 15,
    Unknown = 0xff,
}

impl SyncReason {
    fn from_raw(raw: u64) -> SyncReason {
        match raw {
            0 => SyncReason::ExternalTrigger,
            1 => SyncReason::ExitReset,
            2 => SyncReason::PeriodicCount,
            3 => SyncReason::ExitDebug,
            4 => SyncReason::ICntOverflow,
            5 => SyncReason::TraceEnable,
            6 => SyncReason::Watchpoint,
            7 => SyncReason::FifoOverrun,
            9 => SyncReason::ExitPowerDown,
            11 => SyncReason::MessageContention,
            15 => SyncReason::PcSample,
            _ => SyncReason::Unknown,
        }
    }
}

/// Event source of an in-circuit trace message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IctReason {
    Control = 0,
    ExternalTrigger = 8,
    InferableCall = 9,
    Exception = 10,
    Interrupt = 11,
    Context = 13,
    Watchpoint = 14,
    PcSample = 15,
    Unknown = 0xff,
}

impl IctReason {
    fn from_raw(raw: u64) -> IctReason {
        match raw {
            0 => IctReason::Control,
            8 => IctReason::ExternalTrigger,
            9 => IctReason::InferableCall,
            10 => IctReason::Exception,
            11 => IctReason::Interrupt,
            13 => IctReason::Context,
            14 => IctReason::Watchpoint,
            15 => IctReason::PcSample,
            _ => IctReason::Unknown,
        }
    }
}

/// RESOURCEFULL resource codes.
pub mod rcode {
    /// Instruction count that overflowed without an event.
    pub const I_CNT: u8 = 0;
    /// A flushed branch-history buffer.
    pub const HISTORY: u8 = 1;
    /// A not-taken conditional branch run length.
    pub const NOT_TAKEN_COUNT: u8 = 8;
    /// A taken conditional branch run length.
    pub const TAKEN_COUNT: u8 = 9;
}

/// Call/return classification flags attached to a retired instruction.
/// Several may be set at once (`CALL | INTERRUPT` on an interrupted
/// call, for example), so the representation is a bitmask rather than
/// an enum.
pub mod crflags {
    pub const NONE: u8 = 0;
    pub const CALL: u8 = 1 << 0;
    pub const RETURN: u8 = 1 << 1;
    pub const SWAP: u8 = 1 << 2;
    pub const INTERRUPT: u8 = 1 << 3;
    pub const EXCEPTION: u8 = 1 << 4;
    pub const EXCEPTION_RETURN: u8 = 1 << 5;
}

/// Outcome annotation for a retired conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchFlag {
    None,
    Unknown,
    Taken,
    NotTaken,
}

/// Set of malformed message conditions that can occur during decode.
/// All of them are recovered by resynchronizing to the next END slice;
/// [`Overflow`](BadMessage::Overflow) additionally drops the message
/// it occurred in.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BadMessage {
    /// A fixed field would read past a VAR_END or END slice boundary.
    #[error("fixed field of {width} bits runs past a field boundary at bit {at}")]
    FieldBoundary { width: usize, at: usize },

    /// A read ran past the END slice of the message.
    #[error("message truncated: wanted {want} bits, {have} present")]
    Truncated { want: usize, have: usize },

    /// A slice carried the reserved MSEO encoding `0b10`.
    #[error("invalid MSEO code in slice byte {:#04x}", .0)]
    InvalidMseo(u8),

    /// No END slice was seen within the maximum message length.
    #[error("no END slice within {0} bytes")]
    MissingEnd(usize),

    /// A variable field encoded a value wider than 64 bits.
    #[error("variable field encodes more than 64 significant bits")]
    Overflow,

    /// The message kind is not one the decoder handles.
    #[error("unhandled TCODE {0}")]
    UnsupportedTcode(u8),

    /// Payload bits remained after the last field of the message.
    #[error("{0} payload bits left over after the last field")]
    TrailingBits(usize),

    /// A field carried a value outside its defined encoding space.
    #[error("field {field} has out-of-range value {value}")]
    BadFieldValue { field: &'static str, value: u64 },
}

/// Errors surfaced by the public decoding interfaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte source has no data buffered right now; retry later.
    /// Only returned for non-blocking sources.
    #[error("byte source is empty, retry later")]
    NeedMore,

    #[error("malformed message: {0}")]
    BadMessage(#[from] BadMessage),

    /// An engine invariant was violated; the affected hart has been
    /// resynchronized.
    #[error("decoder invariant violated: {0}")]
    Internal(&'static str),
}

/// Internal error type; `Eof` terminates iteration instead of being
/// surfaced as an error.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ErrorInt {
    #[error("source failed to read: {0}")]
    Io(#[from] std::io::Error),
    #[error("EOF encountered")]
    Eof,
    #[error("byte source empty")]
    NeedMore,
    #[error(transparent)]
    BadMessage(#[from] BadMessage),
    #[error("{0}")]
    Internal(&'static str),
}

impl ErrorInt {
    /// Maps the internal error onto the public iterator item contract:
    /// `None` at end of stream, `Some(Err(..))` otherwise.
    pub(crate) fn into_item(self) -> Option<Error> {
        match self {
            ErrorInt::Eof => None,
            ErrorInt::Io(io) => Some(Error::Io(io)),
            ErrorInt::NeedMore => Some(Error::NeedMore),
            ErrorInt::BadMessage(m) => Some(Error::BadMessage(m)),
            ErrorInt::Internal(s) => Some(Error::Internal(s)),
        }
    }
}

impl From<Error> for ErrorInt {
    fn from(e: Error) -> ErrorInt {
        match e {
            Error::Io(io) => ErrorInt::Io(io),
            Error::NeedMore => ErrorInt::NeedMore,
            Error::BadMessage(m) => ErrorInt::BadMessage(m),
            Error::Internal(s) => ErrorInt::Internal(s),
        }
    }
}

/// Decoder configuration, fixed for the lifetime of a [`Trace`].
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Width in bits of the `src` (hart id) field present in every
    /// message. `0` disables it (single-hart stream). Valid range
    /// `0..=8`.
    pub src_bits: u8,

    /// Width in bits of the rolling timestamp counter, used for wrap
    /// correction.
    pub ts_size: u8,

    /// Timestamp tick frequency in Hz. When non-zero, reported
    /// timestamps can be scaled to seconds; ticks are reported
    /// verbatim otherwise.
    pub ts_freq: u32,

    /// Address width of the traced cores. Matters only for the few
    /// compressed opcodes whose meaning differs between RV32 and RV64
    /// (`c.jal` vs `c.addiw`).
    pub arch_bits: u8,

    /// Instrumentation trace channel handling.
    pub itc: ItcOptions,
}

impl Default for TraceConfig {
    fn default() -> TraceConfig {
        TraceConfig {
            src_bits: 0,
            ts_size: 40,
            ts_freq: 0,
            arch_bits: 32,
            itc: ItcOptions::default(),
        }
    }
}

impl TraceConfig {
    /// Number of harts a stream with this configuration can address.
    pub fn num_harts(&self) -> usize {
        if self.src_bits == 0 {
            1
        } else {
            MAX_HARTS.min(1usize << self.src_bits.min(7))
        }
    }
}
