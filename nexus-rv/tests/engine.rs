use nexus_rv::builder::MessageStreamBuilder;
use nexus_rv::{
    crflags, BranchFlag, Instruction, ItcOptions, SyncReason, TableImage, Trace, TraceConfig,
};

const C_NOP: u16 = 0x0001;
const BEQ_X0_X0_8: u32 = 0x0000_0463;
const C_J_4: u16 = 0xa011;
const RET: u32 = 0x0000_8067;

const TRACE_ENABLE: u8 = SyncReason::TraceEnable as u8;

fn run(bytes: &[u8], image: TableImage, config: TraceConfig) -> (Vec<Instruction>, u32) {
    let mut trace = Trace::new(bytes, image, config);
    let instructions = trace
        .instructions()
        .map(|i| i.expect("decode error"))
        .collect();
    (instructions, trace.dropped_messages())
}

// A sync followed by a direct-branch count walks the image and tags
// the branch at the end of the count as taken.
#[test]
fn direct_branch_walk() {
    let mut image = TableImage::new();
    image.set_halfword(0x1000, C_NOP);
    image.set_halfword(0x1002, C_NOP);
    image.set_word(0x1004, BEQ_X0_X0_8);
    image.set_halfword(0x100c, C_J_4);
    image.set_disassembly(0x1004, "beq x0, x0, 8");

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.direct_branch(0, 0, 3, None);
    // One more count so the landing address is observable.
    b.direct_branch(0, 0, 1, None);

    let (instrs, dropped) = run(b.bytes(), image, TraceConfig::default());
    assert_eq!(dropped, 0);

    let pcs: Vec<u64> = instrs.iter().map(|i| i.address).collect();
    assert_eq!(pcs, [0x1000, 0x1002, 0x1004, 0x100c]);

    assert_eq!(instrs[0].br_flag, BranchFlag::None);
    assert_eq!(instrs[1].br_flag, BranchFlag::None);
    assert_eq!(instrs[2].br_flag, BranchFlag::Taken);
    assert_eq!(instrs[2].text.as_deref(), Some("beq x0, x0, 8"));
    assert_eq!(instrs[2].size, 4);
    assert_eq!(instrs[3].address, 0x1004 + 8);
}

// Branch history bits resolve the conditionals inside the walk, and
// the indirect target at the end is the branch-site PC xored with the
// message's shifted u_addr.
#[test]
fn history_walk_and_xor_address() {
    let mut image = TableImage::new();
    image.set_halfword(0x2000, C_NOP);
    image.set_word(0x2002, BEQ_X0_X0_8); // not taken -> 0x2006
    image.set_word(0x2006, BEQ_X0_X0_8); // taken -> 0x200e
    image.set_word(0x200e, RET);
    image.set_halfword(0x4000, C_NOP);

    let branch_site = 0x200e_u64;
    let target = 0x4000_u64;
    let u_addr = (branch_site ^ target) >> 1;

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x2000 >> 1, None);
    // Two non-conditional instructions for the count, outcomes
    // "not taken, then taken" below the stop bit.
    b.indirect_branch_hist(0, 0, 0, 2, u_addr, 0b101, None);
    b.direct_branch(0, 0, 1, None);

    let (instrs, _) = run(b.bytes(), image, TraceConfig::default());
    let pcs: Vec<u64> = instrs.iter().map(|i| i.address).collect();
    assert_eq!(pcs, [0x2000, 0x2002, 0x2006, 0x200e, 0x4000]);

    assert_eq!(instrs[1].br_flag, BranchFlag::NotTaken);
    assert_eq!(instrs[2].br_flag, BranchFlag::Taken);
    assert_ne!(instrs[3].cr_flags & crflags::RETURN, 0);
    // XOR address law at the branch site.
    assert_eq!(instrs[4].address, branch_site ^ (u_addr << 1));
}

// A RESOURCEFULL taken-count makes the following conditional
// branches retire taken until it drains.
#[test]
fn resource_full_taken_count() {
    let mut image = TableImage::new();
    image.set_word(0x5000, BEQ_X0_X0_8); // taken -> 0x5008
    image.set_word(0x5008, BEQ_X0_X0_8); // taken -> 0x5010
    image.set_halfword(0x5010, C_J_4);

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x5000 >> 1, None);
    b.resource_full(0, 0, nexus_rv::rcode::TAKEN_COUNT, 2, None);
    b.direct_branch(0, 0, 1, None);

    let (instrs, _) = run(b.bytes(), image, TraceConfig::default());
    let pcs: Vec<u64> = instrs.iter().map(|i| i.address).collect();
    assert_eq!(pcs, [0x5000, 0x5008, 0x5010]);
    assert_eq!(instrs[0].br_flag, BranchFlag::Taken);
    assert_eq!(instrs[1].br_flag, BranchFlag::Taken);
    assert_eq!(instrs[2].br_flag, BranchFlag::None);
}

// Timestamps ride along as deltas and stay monotone on the yielded
// instructions.
#[test]
fn timestamps_accumulate_monotone() {
    let mut image = TableImage::new();
    for addr in (0x1000..0x1010).step_by(2) {
        image.set_halfword(addr, C_NOP);
    }

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, Some(0x100));
    b.direct_branch(0, 0, 2, Some(0x80_0000));
    b.direct_branch(0, 0, 2, Some(0x1));

    let mut config = TraceConfig::default();
    config.ts_size = 24;
    let (instrs, _) = run(b.bytes(), image, config);
    assert_eq!(instrs.len(), 4);

    let stamps: Vec<u64> = instrs.iter().map(|i| i.timestamp).collect();
    assert_eq!(stamps, [0x80_0100, 0x80_0100, 0x80_0101, 0x80_0101]);
    assert!(stamps.windows(2).all(|w| w[1] >= w[0]));
}

// A corrupted message costs itself and nothing else; decoding
// continues on the next good one.
#[test]
fn error_recovery_mid_stream() {
    let mut image = TableImage::new();
    for addr in (0x1000..0x1010).step_by(2) {
        image.set_halfword(addr, C_NOP);
    }

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.direct_branch(0, 0, 1, None);
    let mut bytes = b.into_bytes();

    // A variable field that overflows 64 bits.
    bytes.push(3 << 2);
    for _ in 0..11 {
        bytes.push(0b111111_00);
    }
    bytes.push(0b111111_11);

    let mut b = MessageStreamBuilder::new();
    b.direct_branch(0, 0, 1, None);
    bytes.extend_from_slice(b.bytes());

    let (instrs, dropped) = run(&bytes, image, TraceConfig::default());
    assert_eq!(dropped, 1);
    assert_eq!(instrs.len(), 2);
    assert_eq!(instrs[1].address, 0x1002);
}

// Nothing is yielded before the first full-address message.
#[test]
fn no_instructions_before_sync() {
    let mut image = TableImage::new();
    image.set_halfword(0x1000, C_NOP);
    image.set_halfword(0x1002, C_NOP);

    let mut b = MessageStreamBuilder::new();
    b.direct_branch(0, 0, 5, None); // unsynced: skipped
    b.indirect_branch(0, 0, 0, 2, 0x40, None); // unsynced: skipped
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.direct_branch(0, 0, 1, None);

    let (instrs, dropped) = run(b.bytes(), image, TraceConfig::default());
    assert_eq!(dropped, 0);
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].address, 0x1000);
}

// A full-address message that lands somewhere the walk did not
// predict flags the first instruction of the new flow as an
// interrupt entry.
#[test]
fn discontinuity_marks_interrupt_entry() {
    let mut image = TableImage::new();
    image.set_halfword(0x6000, C_NOP);
    image.set_halfword(0x7000, C_NOP);

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x6000 >> 1, None);
    // One instruction, then "you are at 0x7000" although the walk
    // computed 0x6002.
    b.sync(0, 0, SyncReason::ICntOverflow as u8, 1, 0x7000 >> 1, None);
    b.direct_branch(0, 0, 1, None);

    let (instrs, _) = run(b.bytes(), image, TraceConfig::default());
    assert_eq!(instrs.len(), 2);
    assert_eq!(instrs[0].address, 0x6000);
    assert_eq!(instrs[0].cr_flags & crflags::INTERRUPT, 0);
    assert_eq!(instrs[1].address, 0x7000);
    assert_ne!(instrs[1].cr_flags & crflags::INTERRUPT, 0);
}

// An exception-kind indirect branch marks the handler entry.
#[test]
fn exception_transfer_enters_isr() {
    let mut image = TableImage::new();
    image.set_word(0x2000, RET);
    image.set_halfword(0x8000, C_NOP);

    let branch_site = 0x2000_u64;
    let handler = 0x8000_u64;

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x2000 >> 1, None);
    b.indirect_branch(0, 0, 1, 1, (branch_site ^ handler) >> 1, None); // b_type exception
    b.direct_branch(0, 0, 1, None);

    let (instrs, _) = run(b.bytes(), image, TraceConfig::default());
    assert_eq!(instrs.len(), 2);
    assert_eq!(instrs[1].address, handler);
    assert_ne!(instrs[1].cr_flags & crflags::INTERRUPT, 0);
}

// Ownership messages decorate subsequent instructions with the
// process context.
#[test]
fn ownership_context_rides_along() {
    let mut image = TableImage::new();
    image.set_halfword(0x1000, C_NOP);

    let mut b = MessageStreamBuilder::new();
    b.ownership(0, 0, 42, 0, 3, 0, None);
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.direct_branch(0, 0, 1, None);

    let (instrs, _) = run(b.bytes(), image, TraceConfig::default());
    assert_eq!(instrs[0].pid, 42);
    assert_eq!(instrs[0].prv, 3);
}

// A correlation message ends the trace segment; decoding resumes at
// the next sync point.
#[test]
fn correlation_stops_and_resyncs() {
    let mut image = TableImage::new();
    image.set_halfword(0x1000, C_NOP);
    image.set_halfword(0x1002, C_NOP);
    image.set_halfword(0x9000, C_NOP);

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.correlation(0, 0, 4, 2, None, None);
    // Would-be counts while the trace is off: skipped.
    b.direct_branch(0, 0, 7, None);
    b.sync(0, 0, TRACE_ENABLE, 0, 0x9000 >> 1, None);
    b.direct_branch(0, 0, 1, None);

    let (instrs, _) = run(b.bytes(), image, TraceConfig::default());
    let pcs: Vec<u64> = instrs.iter().map(|i| i.address).collect();
    assert_eq!(pcs, [0x1000, 0x1002, 0x9000]);
}

// Instrumentation writes pass through to the aggregator keyed by
// hart, without disturbing the instruction stream.
#[test]
fn itc_print_through_the_engine() {
    let mut image = TableImage::new();
    image.set_halfword(0x1000, C_NOP);

    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.data_acquisition(0, 0, 0, 4, u32::from_le_bytes(*b"hi!\n"), None);
    b.direct_branch(0, 0, 1, None);

    let mut config = TraceConfig::default();
    config.itc = ItcOptions {
        print: true,
        nls: false,
        channel: 0,
        capacity: 4096,
        formats: Vec::new(),
    };

    let mut trace = Trace::new(b.bytes(), image, config);
    let instrs: Vec<Instruction> = trace.instructions().map(|i| i.unwrap()).collect();
    assert_eq!(instrs.len(), 1);

    let msg = trace.itc_poll(0).expect("completed itc string");
    assert_eq!(msg.text, "hi!");
    assert!(trace.itc_flush(0).is_none());
}

// Streams from several harts interleave without clobbering each
// other's state.
#[test]
fn multi_hart_interleave() {
    let mut image = TableImage::new();
    image.set_halfword(0x1000, C_NOP);
    image.set_halfword(0x1002, C_NOP);
    image.set_halfword(0x2000, C_NOP);
    image.set_halfword(0x2002, C_NOP);

    let mut b = MessageStreamBuilder::new();
    b.sync(2, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.sync(2, 1, TRACE_ENABLE, 0, 0x2000 >> 1, None);
    b.direct_branch(2, 0, 1, None);
    b.direct_branch(2, 1, 1, None);
    b.direct_branch(2, 0, 1, None);
    b.direct_branch(2, 1, 1, None);

    let mut config = TraceConfig::default();
    config.src_bits = 2;
    let (instrs, _) = run(b.bytes(), image, config);

    let seq: Vec<(u8, u64)> = instrs.iter().map(|i| (i.core, i.address)).collect();
    assert_eq!(
        seq,
        [(0, 0x1000), (1, 0x2000), (0, 0x1002), (1, 0x2002)]
    );
}

// Address lookup decorates from the image without touching the walk.
#[test]
fn instruction_lookup_by_address() {
    let mut image = TableImage::new();
    image.set_word(0x1000, RET);
    image.set_disassembly(0x1000, "ret");

    let empty: &[u8] = &[];
    let trace = Trace::new(empty, image, TraceConfig::default());
    let instr = trace.instruction_at(0x1000).unwrap();
    assert_eq!(instr.bits, RET);
    assert_eq!(instr.size, 4);
    assert_eq!(instr.text.as_deref(), Some("ret"));
    assert_ne!(instr.cr_flags & crflags::RETURN, 0);
    assert!(trace.instruction_at(0x9999_0000).is_none());
}

// Between sync points, the number of yielded instructions equals the
// sum of consumed counts.
#[test]
fn count_sum_property() {
    let mut image = TableImage::new();
    // 0x1000: nop; 0x1002: beq (nt) -> 0x1006; 0x1006: nop;
    // 0x1008: beq (t) -> 0x1010; 0x1010: ret
    image.set_halfword(0x1000, C_NOP);
    image.set_word(0x1002, BEQ_X0_X0_8);
    image.set_halfword(0x1006, C_NOP);
    image.set_word(0x1008, BEQ_X0_X0_8);
    image.set_word(0x1010, RET);
    image.set_halfword(0x3000, C_NOP);

    let i_cnt = 3; // nop, nop, ret
    let history = 0b101; // outcomes not-taken then taken, below the stop bit
    let mut b = MessageStreamBuilder::new();
    b.sync(0, 0, TRACE_ENABLE, 0, 0x1000 >> 1, None);
    b.indirect_branch_hist(0, 0, 0, i_cnt, (0x1010_u64 ^ 0x3000) >> 1, history, None);

    let (instrs, _) = run(b.bytes(), image, TraceConfig::default());
    let history_bits = 2;
    assert_eq!(instrs.len() as u32, i_cnt + history_bits);
}
