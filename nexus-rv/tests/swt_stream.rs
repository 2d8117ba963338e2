use nexus_rv::builder::MessageStreamBuilder;
use nexus_rv::{DataAcquisitionMessage, NexusStream};

fn pump(bytes: &[u8], src_bits: u8) -> Vec<DataAcquisitionMessage> {
    let mut ns = NexusStream::new(src_bits);
    let mut out = Vec::new();
    for &byte in bytes {
        if let Some(msg) = ns.append_byte(byte) {
            out.push(msg);
        }
    }
    out
}

#[test]
fn reassemble_with_source_and_timestamp() {
    const SRC_BITS: u8 = 6;
    let mut b = MessageStreamBuilder::new();
    b.data_acquisition(SRC_BITS, 0x3f, 0, 4, 0x1234_5678, Some(0x1234_5678_5555_5555));

    let msgs = pump(b.bytes(), SRC_BITS);
    assert_eq!(
        msgs,
        [DataAcquisitionMessage {
            src: Some(0x3f),
            idtag: 0,
            data: 0x1234_5678,
            timestamp: Some(0x1234_5678_5555_5555),
        }]
    );
}

#[test]
fn idtag_encodes_channel_and_width() {
    let mut b = MessageStreamBuilder::new();
    b.data_acquisition(0, 0, 31, 1, 0x12, Some(8));
    let msgs = pump(b.bytes(), 0);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].src, None);
    // Channel 31, byte-wide write: tag = 31 * 4 + 3.
    assert_eq!(msgs[0].idtag, 31 * 4 + 3);
    assert_eq!(msgs[0].data, 0x12);
}

#[test]
fn timestamp_is_optional() {
    let mut b = MessageStreamBuilder::new();
    b.data_acquisition(0, 0, 5, 1, 0x8, None);
    let msgs = pump(b.bytes(), 0);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].timestamp, None);
}

// Noise between messages costs at most the message that follows it;
// the stream then resynchronizes.
#[test]
fn zero_noise_swallows_one_message() {
    const SRC_BITS: u8 = 6;
    let mut b = MessageStreamBuilder::new();
    b.data_acquisition(SRC_BITS, 0x3f, 0, 4, 0x1234_5678, Some(0x55));
    for _ in 0..10_000 {
        b.literal_slice(0);
    }
    // The first message after noise is absorbed by the phantom
    // message the noise started.
    b.data_acquisition(SRC_BITS, 0x23, 4, 1, 0x7, Some(0x8));
    b.data_acquisition(SRC_BITS, 0x23, 5, 1, 0x8, None);

    let msgs = pump(b.bytes(), SRC_BITS);
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].data, 0x1234_5678);
    assert_eq!(msgs[1].src, Some(0x23));
    assert_eq!(msgs[1].idtag, 5 * 4 + 3);
    assert_eq!(msgs[1].data, 0x8);
}

// A DATA_ACQUISITION with a missing field has the wrong variable
// field count and is silently discarded.
#[test]
fn malformed_message_is_discarded() {
    const SRC_BITS: u8 = 6;
    let mut b = MessageStreamBuilder::new();
    b.data_acquisition_no_tag(SRC_BITS, 0x23, 1, 0x77, None);
    b.data_acquisition(SRC_BITS, 0x23, 4, 1, 0x7, Some(0x8));

    let msgs = pump(b.bytes(), SRC_BITS);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].idtag, 4 * 4 + 3);
    assert_eq!(msgs[0].data, 0x7);
}

// Non-DATA_ACQUISITION messages pass through structurally without
// producing anything.
#[test]
fn other_kinds_are_ignored() {
    let mut b = MessageStreamBuilder::new();
    b.direct_branch(0, 0, 5, None);
    b.sync(0, 0, 5, 0, 0x1000 >> 1, None);
    b.data_acquisition(0, 0, 1, 4, 0xaa, None);

    let msgs = pump(b.bytes(), 0);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].data, 0xaa);
}

#[test]
fn display_matches_the_debug_dump_shape() {
    let msg = DataAcquisitionMessage {
        src: Some(0x3f),
        idtag: 0x7c,
        data: 0x12,
        timestamp: Some(0x55),
    };
    assert_eq!(msg.to_string(), "tcode=7 src=3f idtag=7c dqdata=12 timestamp=55");

    let msg = DataAcquisitionMessage {
        src: None,
        idtag: 4,
        data: 7,
        timestamp: None,
    };
    assert_eq!(msg.to_string(), "tcode=7 idtag=4 dqdata=7");
}
