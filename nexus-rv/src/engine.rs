//! The trace engine: drives the slice parser and a program image
//! through a per-hart state machine and yields one decorated
//! instruction per call.
//!
//! Each hart cycles through the same life: wait for a message with a
//! full address (the sync handshake), then alternate between
//! retiring a message's counts into the consumable record and
//! walking the image instruction by instruction until those counts
//! are spent and the message's implied transfer fires. Structural
//! problems never stop the iterator; the offending hart re-enters
//! the sync state and the stream keeps moving.

use std::fmt;
use std::io::Read;

use log::{debug, warn};

use crate::count::{Count, CountKind};
use crate::image::{ProgramImage, SourceInfo};
use crate::inst::{decode_instruction, DecodedInst, InstType};
use crate::itc::{ItcMessage, ItcPrint};
use crate::message::{Message, Payload};
use crate::parser::SliceParser;
use crate::stepper;
use crate::{crflags, BType, BranchFlag, Error, ErrorInt, IctReason, SyncReason, TCode, TraceConfig};

/// One retired instruction with its decorations.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    pub core: u8,
    pub pid: u32,
    pub prv: u8,

    pub address: u64,
    /// Raw instruction bits (low halfword only for compressed).
    pub bits: u32,
    /// Size in bytes.
    pub size: u8,
    /// Display text from the image, when it has one.
    pub text: Option<String>,

    /// Bitmask of [`crflags`] values.
    pub cr_flags: u8,
    pub br_flag: BranchFlag,

    /// Reconstructed timestamp in target ticks.
    pub timestamp: u64,

    pub source: Option<SourceInfo>,
}

/// Where a pending transfer target comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingDest {
    /// XOR delta against the PC of the retiring branch.
    Xor(u64),
    /// Absolute address from a with-sync message.
    Abs(u64),
}

impl PendingDest {
    fn resolve(self, branch_pc: u64) -> u64 {
        match self {
            PendingDest::Xor(mask) => branch_pc ^ mask,
            PendingDest::Abs(addr) => addr,
        }
    }
}

#[derive(Debug, Default)]
struct HartState {
    synced: bool,
    pc: u64,
    last_faddr: u64,
    last_ts: u64,
    counts: Count,

    pending_dest: Option<PendingDest>,
    pending_b_type: Option<BType>,
    /// The current message is a direct-branch report: a conditional
    /// branch that exhausts the count retires taken.
    taken_event: bool,
    /// Re-enter the sync state once the current counts drain
    /// (correlation messages stop the trace).
    resync_after: bool,
    /// The next retired instruction is the first after a
    /// discontinuity; flag it as an interrupt entry.
    enter_isr: bool,

    pid: u32,
    /// Packed privilege: bit 4 is the virtualization mode, bits 1:0
    /// the privilege level.
    prv: u8,
}

impl HartState {
    fn clear_pending(&mut self) {
        self.pending_dest = None;
        self.pending_b_type = None;
        self.taken_event = false;
    }
}

/// Per-hart tallies over a decode run.
#[derive(Debug, Clone, Default)]
pub struct CoreStats {
    pub messages: u64,
    pub syncs: u64,
    pub instructions: u64,
    pub inst16: u64,
    pub inst32: u64,
    pub taken_branches: u64,
    pub not_taken_branches: u64,
    pub calls: u64,
    pub returns: u64,
    pub swaps: u64,
    pub exceptions: u64,
    pub exception_returns: u64,
    pub interrupts: u64,
}

/// Decode-run statistics, queryable while iterating or after.
#[derive(Debug, Clone, Default)]
pub struct Analytics {
    cores: Vec<CoreStats>,
}

impl Analytics {
    fn new(num_harts: usize) -> Analytics {
        Analytics {
            cores: vec![CoreStats::default(); num_harts],
        }
    }

    pub fn core(&self, hart: usize) -> Option<&CoreStats> {
        self.cores.get(hart)
    }

    pub fn cores(&self) -> &[CoreStats] {
        &self.cores
    }

    fn core_mut(&mut self, hart: usize) -> &mut CoreStats {
        &mut self.cores[hart]
    }

    pub fn total_instructions(&self) -> u64 {
        self.cores.iter().map(|c| c.instructions).sum()
    }

    pub fn total_messages(&self) -> u64 {
        self.cores.iter().map(|c| c.messages).sum()
    }
}

impl fmt::Display for Analytics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, c) in self.cores.iter().enumerate() {
            if c.messages == 0 && c.instructions == 0 {
                continue;
            }
            writeln!(
                f,
                "core {}: {} messages ({} syncs), {} instructions ({} rv16, {} rv32)",
                i, c.messages, c.syncs, c.instructions, c.inst16, c.inst32
            )?;
            writeln!(
                f,
                "        branches {} taken / {} not taken; {} calls, {} returns, {} swaps",
                c.taken_branches, c.not_taken_branches, c.calls, c.returns, c.swaps
            )?;
            writeln!(
                f,
                "        {} exceptions, {} exception returns, {} interrupts",
                c.exceptions, c.exception_returns, c.interrupts
            )?;
        }
        Ok(())
    }
}

/// The decoder proper. Pulls messages from `source`, walks `image`,
/// and yields [`Instruction`]s through [`instructions`].
///
/// [`instructions`]: Self::instructions
pub struct Trace<R, P>
where
    R: Read,
    P: ProgramImage,
{
    parser: SliceParser<R>,
    image: P,
    config: TraceConfig,
    harts: Vec<HartState>,
    itc: ItcPrint,
    analytics: Analytics,
    /// Hart currently in the instruction-walk state, if any.
    walking: Option<usize>,
}

impl<R, P> Trace<R, P>
where
    R: Read,
    P: ProgramImage,
{
    pub fn new(source: R, image: P, config: TraceConfig) -> Trace<R, P> {
        let num_harts = config.num_harts();
        let mut harts = Vec::with_capacity(num_harts);
        harts.resize_with(num_harts, HartState::default);
        Trace {
            parser: SliceParser::new(source, config.src_bits),
            image,
            itc: ItcPrint::new(config.itc.clone()),
            analytics: Analytics::new(num_harts),
            config,
            harts,
            walking: None,
        }
    }

    /// Returns an iterator over retired instructions. `None` at end
    /// of stream; [`Error::NeedMore`] when a non-blocking source ran
    /// dry mid-message.
    pub fn instructions(&mut self) -> Instructions<R, P> {
        Instructions { trace: self }
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    /// Messages the parser had to drop.
    pub fn dropped_messages(&self) -> u32 {
        self.parser.dropped()
    }

    /// Next completed instrumentation string for `hart`.
    pub fn itc_poll(&mut self, hart: usize) -> Option<ItcMessage> {
        self.itc.poll(hart)
    }

    /// Drains any unfinished instrumentation line for `hart`; call
    /// once the instruction iterator has ended.
    pub fn itc_flush(&mut self, hart: usize) -> Option<ItcMessage> {
        self.itc.flush(hart)
    }

    pub fn itc_pending(&self, hart: usize) -> bool {
        self.itc.pending(hart)
    }

    pub fn num_harts(&self) -> usize {
        self.harts.len()
    }

    /// Converts a tick timestamp to seconds using the configured
    /// frequency.
    pub fn timestamp_seconds(&self, ticks: u64) -> Option<f64> {
        if self.config.ts_freq == 0 {
            None
        } else {
            Some(ticks as f64 / self.config.ts_freq as f64)
        }
    }

    pub fn image(&self) -> &P {
        &self.image
    }

    /// Classifies and decorates the instruction at `addr` without
    /// touching the walk. Context fields (core, pid, privilege,
    /// timestamp) are zero: this is a view of the image, not of the
    /// trace.
    pub fn instruction_at(&self, addr: u64) -> Option<Instruction> {
        let bits = self.image.instruction_bits(addr)?;
        let d = decode_instruction(bits, self.config.arch_bits);
        Some(Instruction {
            core: 0,
            pid: 0,
            prv: 0,
            address: addr,
            bits,
            size: d.size,
            text: self.image.disassembly(addr).map(|t| t.to_string()),
            cr_flags: stepper::call_return_flags(&d),
            br_flag: BranchFlag::None,
            timestamp: 0,
            source: self.image.source_info(addr).cloned(),
        })
    }

    fn next_int(&mut self) -> Result<Instruction, ErrorInt> {
        loop {
            if let Some(hart) = self.walking {
                match self.walk_one(hart) {
                    Ok(instr) => return Ok(instr),
                    Err(ErrorInt::Internal(why)) => {
                        self.resync(hart, why);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let msg = self.parser.next_int()?;
            let src = msg.src as usize;
            if let Err(ErrorInt::Internal(why)) = self.dispatch(msg) {
                if src < self.harts.len() {
                    self.resync(src, why);
                }
            }
        }
    }

    /// Drops a hart back into the sync state after an inconsistency.
    fn resync(&mut self, hart: usize, why: &'static str) {
        warn!("hart {}: {}; resynchronizing", hart, why);
        let h = &mut self.harts[hart];
        h.synced = false;
        h.resync_after = false;
        h.enter_isr = false;
        h.counts.clear();
        h.clear_pending();
        if self.walking == Some(hart) {
            self.walking = None;
        }
    }

    /// Applies one message to its hart. On success the hart may be
    /// left in the walking state.
    fn dispatch(&mut self, msg: Message) -> Result<(), ErrorInt> {
        let hart = msg.src as usize;
        if hart >= self.harts.len() {
            warn!(
                "message {} addresses hart {} outside the configured {}; skipping",
                msg.msg_num,
                hart,
                self.harts.len()
            );
            return Ok(());
        }
        self.analytics.core_mut(hart).messages += 1;

        // Timestamps on with-sync kinds are absolute; all others are
        // deltas against the previous value.
        if let Some(raw) = msg.timestamp {
            let full = matches!(
                msg.tcode(),
                TCode::Sync
                    | TCode::DirectBranchWs
                    | TCode::IndirectBranchWs
                    | TCode::IndirectBranchHistWs
                    | TCode::InCircuitTraceWs
            );
            let h = &mut self.harts[hart];
            h.last_ts = process_ts(full, h.last_ts, raw, self.config.ts_size);
        }

        match msg.payload {
            Payload::DataAcquisition { id_tag, data } => {
                let ts = self.harts[hart].last_ts;
                self.itc.feed(hart, id_tag, data, ts);
                Ok(())
            }
            Payload::AuxAccessWrite { addr, data } => {
                let ts = self.harts[hart].last_ts;
                self.itc.feed(hart, addr, data, ts);
                Ok(())
            }
            Payload::Ownership { pid, v, prv, .. } => {
                let h = &mut self.harts[hart];
                h.pid = pid;
                h.prv = ((v & 1) << 4) | (prv & 3);
                Ok(())
            }
            Payload::Error { etype } => {
                warn!("hart {}: encoder error message (etype {})", hart, etype);
                self.resync(hart, "encoder reported an error");
                Ok(())
            }
            Payload::InCircuitTrace { cksrc, ckdata, .. } => {
                let h = &mut self.harts[hart];
                if h.synced && cksrc != IctReason::Control {
                    h.last_faddr ^= ckdata[0] << 1;
                    debug!(
                        "hart {}: ict {:?} at {:#x}",
                        hart, cksrc, h.last_faddr
                    );
                }
                Ok(())
            }
            Payload::InCircuitTraceWs { cksrc, ckdata, .. } => {
                let h = &mut self.harts[hart];
                if cksrc == IctReason::Control {
                    debug!("hart {}: ict control {:#x}", hart, ckdata[0]);
                    return Ok(());
                }
                let addr = ckdata[0] << 1;
                h.last_faddr = addr;
                if !h.synced {
                    // A with-sync event is as good a handshake as a
                    // SYNC message.
                    h.synced = true;
                    h.pc = addr;
                    h.counts.clear();
                    h.clear_pending();
                    self.analytics.core_mut(hart).syncs += 1;
                }
                debug!("hart {}: ict {:?} at {:#x}", hart, cksrc, addr);
                Ok(())
            }
            Payload::ResourceFull { r_code, r_data } => {
                let h = &mut self.harts[hart];
                match r_code {
                    crate::rcode::I_CNT => h.counts.add_i_cnt(r_data as u32),
                    crate::rcode::HISTORY => h.counts.set_history(r_data)?,
                    crate::rcode::TAKEN_COUNT => h.counts.set_taken(r_data as u32)?,
                    crate::rcode::NOT_TAKEN_COUNT => h.counts.set_not_taken(r_data as u32)?,
                    other => warn!("hart {}: resource-full code {} ignored", hart, other),
                }
                Ok(())
            }
            _ => self.retire(hart, &msg),
        }
    }

    /// Retires an instruction-bearing message: installs its counts
    /// and pending transfer, or performs the sync handshake if the
    /// hart is not synchronized yet.
    fn retire(&mut self, hart: usize, msg: &Message) -> Result<(), ErrorInt> {
        if !self.harts[hart].synced {
            if let Some(f_addr) = msg.f_addr() {
                let reason = msg.sync_reason();
                debug!(
                    "hart {}: synchronized at {:#x} ({:?})",
                    hart, f_addr, reason
                );
                let h = &mut self.harts[hart];
                h.synced = true;
                h.pc = f_addr;
                h.last_faddr = f_addr;
                h.counts.clear();
                h.clear_pending();
                self.analytics.core_mut(hart).syncs += 1;
            } else {
                debug!(
                    "hart {}: skipping message {} while waiting for sync",
                    hart, msg.msg_num
                );
            }
            return Ok(());
        }

        if msg.sync_reason() == Some(SyncReason::FifoOverrun) {
            // Messages were lost; whatever counts are pending cannot
            // be trusted any more.
            warn!("hart {}: encoder FIFO overrun, discarding counts", hart);
            self.harts[hart].counts.clear();
            self.harts[hart].clear_pending();
        }

        if let Some(i_cnt) = msg.i_cnt() {
            self.harts[hart].counts.add_i_cnt(i_cnt);
        }
        if let Some(history) = msg.history() {
            self.harts[hart].counts.set_history(history)?;
        }

        let h = &mut self.harts[hart];
        h.taken_event = false;
        h.pending_b_type = msg.b_type();
        h.pending_dest = match msg.payload {
            Payload::DirectBranch { .. } => {
                h.taken_event = true;
                None
            }
            Payload::DirectBranchWs { .. } => {
                h.taken_event = true;
                msg.f_addr().map(PendingDest::Abs)
            }
            Payload::Sync { .. } => msg.f_addr().map(PendingDest::Abs),
            Payload::IndirectBranch { .. } | Payload::IndirectBranchHist { .. } => {
                msg.u_addr().map(PendingDest::Xor)
            }
            Payload::IndirectBranchWs { .. } | Payload::IndirectBranchHistWs { .. } => {
                msg.f_addr().map(PendingDest::Abs)
            }
            Payload::Correlation { evcode, .. } => {
                debug!("hart {}: correlation (evcode {}), trace stops", hart, evcode);
                h.resync_after = true;
                None
            }
            _ => None,
        };

        if h.counts.exhausted() {
            // Nothing to walk. A zero-count transfer still moves the
            // PC; a zero-count correlation just turns the trace off.
            if let Some(dest) = h.pending_dest.take() {
                let target = dest.resolve(h.pc);
                debug!(
                    "hart {}: zero-count transfer {:#x} -> {:#x}",
                    hart, h.pc, target
                );
                h.pc = target;
                h.last_faddr = target;
                h.clear_pending();
            }
            if h.resync_after {
                h.resync_after = false;
                h.synced = false;
            }
            self.walking = None;
        } else {
            self.walking = Some(hart);
        }
        Ok(())
    }

    /// Retires exactly one instruction of the walking hart.
    fn walk_one(&mut self, hart: usize) -> Result<Instruction, ErrorInt> {
        let pc = self.harts[hart].pc;
        let bits = self
            .image
            .instruction_bits(pc)
            .ok_or(ErrorInt::Internal("walked outside the program image"))?;
        let d = decode_instruction(bits, self.config.arch_bits);

        let mut cr = stepper::call_return_flags(&d);
        let mut br = BranchFlag::None;

        if std::mem::take(&mut self.harts[hart].enter_isr) {
            cr |= crflags::INTERRUPT;
        }

        let next_pc = if d.inst_type == InstType::Unknown {
            self.step_unknown(hart)?
        } else if d.inst_type.is_conditional() {
            let (target, flag) = self.step_conditional(hart, pc, &d)?;
            br = flag;
            target
        } else if d.inst_type.is_indirect() || d.inst_type.is_trap_return() {
            self.step_indirect(hart, pc)?
        } else {
            self.step_sequential(hart, pc, &d)?
        };

        let h = &mut self.harts[hart];
        h.pc = next_pc;
        if h.counts.exhausted() && h.pending_dest.is_none() {
            h.clear_pending();
            self.walking = None;
            if h.resync_after {
                h.resync_after = false;
                h.synced = false;
                debug!("hart {}: trace off after correlation", hart);
            }
        }

        let h = &self.harts[hart];
        let stats = self.analytics.core_mut(hart);
        stats.instructions += 1;
        match d.size {
            2 => stats.inst16 += 1,
            4 => stats.inst32 += 1,
            _ => {}
        }
        match br {
            BranchFlag::Taken => stats.taken_branches += 1,
            BranchFlag::NotTaken => stats.not_taken_branches += 1,
            _ => {}
        }
        if cr & crflags::CALL != 0 {
            stats.calls += 1;
        }
        if cr & crflags::RETURN != 0 {
            stats.returns += 1;
        }
        if cr & crflags::SWAP != 0 {
            stats.swaps += 1;
        }
        if cr & crflags::EXCEPTION != 0 {
            stats.exceptions += 1;
        }
        if cr & crflags::EXCEPTION_RETURN != 0 {
            stats.exception_returns += 1;
        }
        if cr & crflags::INTERRUPT != 0 {
            stats.interrupts += 1;
        }

        Ok(Instruction {
            core: hart as u8,
            pid: h.pid,
            prv: h.prv,
            address: pc,
            bits,
            size: d.size,
            text: self.image.disassembly(pc).map(|t| t.to_string()),
            cr_flags: cr,
            br_flag: br,
            timestamp: h.last_ts,
            source: self.image.source_info(pc).cloned(),
        })
    }

    /// Applies the pending transfer if this consumption emptied the
    /// counts. Returns the (possibly overridden) next PC and whether
    /// the override disagreed with the computed one.
    fn apply_event(h: &mut HartState, computed: u64) -> (u64, bool) {
        if !h.counts.exhausted() {
            return (computed, false);
        }
        match h.pending_dest.take() {
            None => (computed, false),
            Some(dest) => {
                // The branch site is the instruction being retired;
                // its PC is still in h.pc at this point.
                let target = dest.resolve(h.pc);
                h.last_faddr = target;
                (target, target != computed)
            }
        }
    }

    fn step_sequential(
        &mut self,
        hart: usize,
        pc: u64,
        d: &DecodedInst,
    ) -> Result<u64, ErrorInt> {
        let h = &mut self.harts[hart];
        h.counts
            .consume_i_cnt(1)
            .map_err(|_| ErrorInt::Internal("instruction count ran out mid-walk"))?;

        let computed = if d.inst_type.is_direct_jump() {
            stepper::direct_target(pc, d)
        } else {
            stepper::fall_through(pc, d)
        };

        let (next, disagreed) = Self::apply_event(h, computed);
        if disagreed {
            // The event address did not follow from the opcode: the
            // hart was pulled elsewhere (trap entry, lost messages).
            h.enter_isr = true;
        }
        Ok(next)
    }

    fn step_conditional(
        &mut self,
        hart: usize,
        pc: u64,
        d: &DecodedInst,
    ) -> Result<(u64, BranchFlag), ErrorInt> {
        let h = &mut self.harts[hart];
        let taken = match h.counts.current_kind() {
            CountKind::History => h.counts.consume_history()?.0,
            CountKind::Taken => {
                h.counts.consume_taken()?;
                true
            }
            CountKind::NotTaken => {
                h.counts.consume_not_taken()?;
                false
            }
            CountKind::ICnt => {
                h.counts.consume_i_cnt(1)?;
                // Exhausting the count on a conditional branch is the
                // direct-branch event itself; mid-count conditionals
                // in a count-only stream fell through.
                h.counts.exhausted() && h.taken_event
            }
            CountKind::None => {
                return Err(ErrorInt::Internal(
                    "conditional branch with no consumable left",
                ))
            }
        };

        let computed = if taken {
            stepper::direct_target(pc, d)
        } else {
            stepper::fall_through(pc, d)
        };
        let (next, disagreed) = Self::apply_event(h, computed);
        if disagreed {
            h.enter_isr = true;
        }
        Ok((
            next,
            if taken {
                BranchFlag::Taken
            } else {
                BranchFlag::NotTaken
            },
        ))
    }

    fn step_indirect(&mut self, hart: usize, pc: u64) -> Result<u64, ErrorInt> {
        let h = &mut self.harts[hart];
        h.counts
            .consume_i_cnt(1)
            .map_err(|_| ErrorInt::Internal("indirect branch outside the instruction count"))?;
        if !h.counts.exhausted() {
            return Err(ErrorInt::Internal(
                "indirect branch inside an instruction count",
            ));
        }
        let b_type = h.pending_b_type.take();
        match h.pending_dest.take() {
            Some(dest) => {
                let target = dest.resolve(pc);
                h.last_faddr = target;
                if matches!(b_type, Some(BType::Exception) | Some(BType::Hardware)) {
                    // The transfer was hijacked by a trap; the landing
                    // instruction starts a handler.
                    h.enter_isr = true;
                }
                Ok(target)
            }
            None => Err(ErrorInt::Internal(
                "indirect branch without a target address",
            )),
        }
    }

    /// An encoding the walker cannot follow: the event address is the
    /// only way forward.
    fn step_unknown(&mut self, hart: usize) -> Result<u64, ErrorInt> {
        let h = &mut self.harts[hart];
        let _ = h.counts.consume_i_cnt(1);
        if h.counts.exhausted() {
            if let Some(dest) = h.pending_dest.take() {
                let target = dest.resolve(h.pc);
                h.last_faddr = target;
                h.pending_b_type = None;
                return Ok(target);
            }
        }
        Err(ErrorInt::Internal(
            "undecodable instruction without an event address",
        ))
    }
}

/// Reconstructs a message timestamp. With-sync values are absolute
/// (wrap-corrected to stay monotone), everything else is a delta on
/// the previous value.
fn process_ts(full: bool, last: u64, new: u64, ts_size: u8) -> u64 {
    if ts_size >= 64 {
        return if full { new } else { last.wrapping_add(new) };
    }
    let span = 1u64 << ts_size;
    if full {
        let mut t = new;
        while t < last {
            t = t.saturating_add(span);
        }
        t
    } else {
        last.saturating_add(new)
    }
}

/// Iterator over retired [`Instruction`]s.
pub struct Instructions<'a, R, P>
where
    R: Read,
    P: ProgramImage,
{
    trace: &'a mut Trace<R, P>,
}

impl<'a, R, P> Iterator for Instructions<'a, R, P>
where
    R: Read,
    P: ProgramImage,
{
    type Item = Result<Instruction, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.trace.next_int() {
            Ok(instr) => Some(Ok(instr)),
            Err(e) => e.into_item().map(Err),
        }
    }
}

#[cfg(test)]
mod timestamps {
    use super::process_ts;

    #[test]
    fn deltas_accumulate() {
        let mut t = 0;
        t = process_ts(false, t, 0x80_0000, 24);
        assert_eq!(t, 0x80_0000);
        t = process_ts(false, t, 0x1, 24);
        assert_eq!(t, 0x80_0001);
    }

    #[test]
    fn delta_past_the_counter_width_keeps_monotone() {
        // Two deltas of 0x800000 on a 24-bit counter walk right past
        // 2^24 without wrapping back.
        let mut t = 0;
        t = process_ts(false, t, 0x80_0000, 24);
        t = process_ts(false, t, 0x80_0001, 24);
        assert_eq!(t, 0x100_0001);
    }

    #[test]
    fn full_timestamps_wrap_forward() {
        let t = process_ts(true, 0xff_fffe, 0x2, 24);
        assert_eq!(t, 0x100_0002);
        // Monotone values pass through unchanged.
        assert_eq!(process_ts(true, 5, 7, 24), 7);
    }
}
