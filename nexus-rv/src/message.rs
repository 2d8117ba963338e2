//! Typed trace messages and their value-extraction queries.

use crate::{BType, IctReason, SyncReason, TCode};

/// The per-kind fields of a message. Field layouts follow the Nexus
/// message formats; addresses are stored as encoded (right-shifted by
/// one) and exposed shifted back by the accessors.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Payload {
    /// Process/privilege context change.
    Ownership { pid: u32, v: u8, prv: u8, tag: u8 },

    /// A taken direct branch; the target is statically known.
    DirectBranch { i_cnt: u32 },

    /// A computed transfer; the target arrives as an XOR delta.
    IndirectBranch {
        b_type: BType,
        i_cnt: u32,
        u_addr: u64,
    },

    /// Instrumentation write (`idtag` selects channel and width).
    DataAcquisition { id_tag: u32, data: u32 },

    /// The encoder hit an internal error condition.
    Error { etype: u8 },

    /// Synchronization point with a full address.
    Sync {
        reason: SyncReason,
        i_cnt: u32,
        f_addr: u64,
    },

    /// Direct branch reported with a full target address.
    DirectBranchWs {
        reason: SyncReason,
        i_cnt: u32,
        f_addr: u64,
    },

    /// Indirect branch reported with a full target address.
    IndirectBranchWs {
        reason: SyncReason,
        b_type: BType,
        i_cnt: u32,
        f_addr: u64,
    },

    /// Memory-mapped auxiliary write (same shape as an
    /// instrumentation write, keyed by register address).
    AuxAccessWrite { addr: u32, data: u32 },

    /// A flushed counter resource; `r_code` selects the meaning of
    /// `r_data`.
    ResourceFull { r_code: u8, r_data: u64 },

    /// Indirect branch plus the history of conditional branch
    /// outcomes since the last message.
    IndirectBranchHist {
        b_type: BType,
        i_cnt: u32,
        u_addr: u64,
        history: u64,
    },

    /// History-carrying indirect branch with a full address.
    IndirectBranchHistWs {
        reason: SyncReason,
        b_type: BType,
        i_cnt: u32,
        f_addr: u64,
        history: u64,
    },

    /// Trace-stop marker; `cdf == 1` adds a final history field.
    Correlation {
        evcode: u8,
        cdf: u8,
        i_cnt: u32,
        history: u64,
    },

    /// In-circuit trace event with an XOR-delta payload.
    InCircuitTrace {
        cksrc: IctReason,
        ckdf: u8,
        ckdata: [u64; 2],
    },

    /// In-circuit trace event with a full-address payload.
    InCircuitTraceWs {
        cksrc: IctReason,
        ckdf: u8,
        ckdata: [u64; 2],
    },
}

/// One parsed trace message: the typed payload plus stream
/// bookkeeping shared by every kind.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// Ordinal of this message in the stream, starting at 1.
    pub msg_num: u32,

    /// Hart that generated the message (0 when `src_bits` is 0).
    pub src: u8,

    /// Raw trailing timestamp field, when present. Reconstruction
    /// against the previous timestamp happens in the engine.
    pub timestamp: Option<u64>,

    /// Byte offset of the first slice within the stream.
    pub offset: u64,

    /// The wire bytes the message was parsed from.
    pub raw: Vec<u8>,

    pub payload: Payload,
}

impl Message {
    pub fn tcode(&self) -> TCode {
        match self.payload {
            Payload::Ownership { .. } => TCode::OwnershipTrace,
            Payload::DirectBranch { .. } => TCode::DirectBranch,
            Payload::IndirectBranch { .. } => TCode::IndirectBranch,
            Payload::DataAcquisition { .. } => TCode::DataAcquisition,
            Payload::Error { .. } => TCode::Error,
            Payload::Sync { .. } => TCode::Sync,
            Payload::DirectBranchWs { .. } => TCode::DirectBranchWs,
            Payload::IndirectBranchWs { .. } => TCode::IndirectBranchWs,
            Payload::AuxAccessWrite { .. } => TCode::AuxAccessWrite,
            Payload::ResourceFull { .. } => TCode::ResourceFull,
            Payload::IndirectBranchHist { .. } => TCode::IndirectBranchHist,
            Payload::IndirectBranchHistWs { .. } => TCode::IndirectBranchHistWs,
            Payload::Correlation { .. } => TCode::Correlation,
            Payload::InCircuitTrace { .. } => TCode::InCircuitTrace,
            Payload::InCircuitTraceWs { .. } => TCode::InCircuitTraceWs,
        }
    }

    pub fn have_timestamp(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Instruction count carried by the message, if its kind has one.
    pub fn i_cnt(&self) -> Option<u32> {
        match self.payload {
            Payload::DirectBranch { i_cnt }
            | Payload::IndirectBranch { i_cnt, .. }
            | Payload::Sync { i_cnt, .. }
            | Payload::DirectBranchWs { i_cnt, .. }
            | Payload::IndirectBranchWs { i_cnt, .. }
            | Payload::IndirectBranchHist { i_cnt, .. }
            | Payload::IndirectBranchHistWs { i_cnt, .. }
            | Payload::Correlation { i_cnt, .. } => Some(i_cnt),
            _ => None,
        }
    }

    /// XOR address delta, shifted back up to an address mask.
    pub fn u_addr(&self) -> Option<u64> {
        match self.payload {
            Payload::IndirectBranch { u_addr, .. }
            | Payload::IndirectBranchHist { u_addr, .. } => Some(u_addr << 1),
            _ => None,
        }
    }

    /// Full target address, shifted back up.
    pub fn f_addr(&self) -> Option<u64> {
        match self.payload {
            Payload::Sync { f_addr, .. }
            | Payload::DirectBranchWs { f_addr, .. }
            | Payload::IndirectBranchWs { f_addr, .. }
            | Payload::IndirectBranchHistWs { f_addr, .. } => Some(f_addr << 1),
            Payload::InCircuitTraceWs { cksrc, ckdata, .. } if cksrc != IctReason::Control => {
                Some(ckdata[0] << 1)
            }
            _ => None,
        }
    }

    pub fn b_type(&self) -> Option<BType> {
        match self.payload {
            Payload::IndirectBranch { b_type, .. }
            | Payload::IndirectBranchWs { b_type, .. }
            | Payload::IndirectBranchHist { b_type, .. }
            | Payload::IndirectBranchHistWs { b_type, .. } => Some(b_type),
            _ => None,
        }
    }

    pub fn sync_reason(&self) -> Option<SyncReason> {
        match self.payload {
            Payload::Sync { reason, .. }
            | Payload::DirectBranchWs { reason, .. }
            | Payload::IndirectBranchWs { reason, .. }
            | Payload::IndirectBranchHistWs { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Branch history bitstring (LSB oldest, MSB stop sentinel).
    pub fn history(&self) -> Option<u64> {
        match self.payload {
            Payload::IndirectBranchHist { history, .. }
            | Payload::IndirectBranchHistWs { history, .. } => Some(history),
            Payload::Correlation { cdf: 1, history, .. } => Some(history),
            Payload::ResourceFull {
                r_code: crate::rcode::HISTORY,
                r_data,
            } => Some(r_data),
            _ => None,
        }
    }

    pub fn r_code(&self) -> Option<u8> {
        match self.payload {
            Payload::ResourceFull { r_code, .. } => Some(r_code),
            _ => None,
        }
    }

    pub fn r_data(&self) -> Option<u64> {
        match self.payload {
            Payload::ResourceFull { r_data, .. } => Some(r_data),
            _ => None,
        }
    }

    pub fn ict_source(&self) -> Option<IctReason> {
        match self.payload {
            Payload::InCircuitTrace { cksrc, .. } | Payload::InCircuitTraceWs { cksrc, .. } => {
                Some(cksrc)
            }
            _ => None,
        }
    }

    /// In-circuit trace payload word `i` (0 or 1), raw.
    pub fn ict_payload(&self, i: usize) -> Option<u64> {
        match self.payload {
            Payload::InCircuitTrace { ckdf, ckdata, .. }
            | Payload::InCircuitTraceWs { ckdf, ckdata, .. } => {
                if i == 0 || (i == 1 && ckdf == 1) {
                    Some(ckdata[i])
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        match self.payload {
            Payload::Ownership { pid, .. } => Some(pid),
            _ => None,
        }
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// True for kinds that can (re)synchronize a hart: they carry a
    /// full address.
    pub fn is_sync_point(&self) -> bool {
        self.f_addr().is_some()
    }
}
