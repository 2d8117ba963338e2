//! End-to-end relay: a named pipe stands in for the serial device,
//! the server runs its real service loop in threaded-wait mode, and
//! two subscribers must each receive the byte stream verbatim.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nexus_rv::builder::MessageStreamBuilder;
use nexus_rv_swt::server::{IoConnections, ServerOptions};

fn make_fifo() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("nexus-rv-swt-relay-{}.pipe", std::process::id()));
    std::fs::remove_file(&path).ok();
    let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
    // SAFETY: plain libc call on an owned, NUL-terminated path.
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    assert_eq!(rc, 0, "mkfifo failed: {}", std::io::Error::last_os_error());
    path
}

fn read_exactly(stream: &mut TcpStream, want: usize, deadline: Instant) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 4096];
    while out.len() < want {
        assert!(
            Instant::now() < deadline,
            "timed out with {} of {} bytes",
            out.len(),
            want
        );
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => panic!("subscriber read failed: {}", e),
        }
    }
    out
}

#[test]
fn every_subscriber_sees_the_stream_verbatim() {
    let mut b = MessageStreamBuilder::new();
    for i in 0..50u32 {
        b.data_acquisition(0, 0, i % 32, 4, 0x1000 + i, Some(i as u64));
    }
    let payload = b.into_bytes();

    let path = make_fifo();

    // The writer half plays the target: it holds the pipe open and
    // starts transmitting only once the test says the subscribers are
    // in place.
    let (start_tx, start_rx) = std::sync::mpsc::channel::<()>();
    let writer_path = path.clone();
    let writer_payload = payload.clone();
    let writer = std::thread::spawn(move || {
        let mut pipe = OpenOptions::new().write(true).open(&writer_path).unwrap();
        start_rx.recv().unwrap();
        pipe.write_all(&writer_payload).unwrap();
        // Dropping the writer EOFs the reader, like a pulled cable.
    });

    let device = File::open(&path).unwrap();
    let opts = ServerOptions {
        port: 0,
        src_bits: 0,
        threaded: true,
    };
    let mut io = IoConnections::new(&opts, device).unwrap();
    let addr = io.local_addr().unwrap();

    let mut sub_a = TcpStream::connect(addr).unwrap();
    let mut sub_b = TcpStream::connect(addr).unwrap();
    sub_a
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    sub_b
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    // Both connections are pending in the accept queue; service until
    // they are subscribed, then open the data tap.
    let deadline = Instant::now() + Duration::from_secs(10);
    while io.client_count() < 2 {
        assert!(Instant::now() < deadline, "accept timed out");
        io.service().unwrap();
    }
    start_tx.send(()).unwrap();

    // Drive the loop until the device EOFs, then a few more rounds to
    // drain the send queues.
    while !io.did_serial_disconnect() {
        assert!(Instant::now() < deadline, "service loop timed out");
        io.service().unwrap();
    }
    for _ in 0..4 {
        io.service().unwrap();
    }

    let got_a = read_exactly(&mut sub_a, payload.len(), deadline);
    let got_b = read_exactly(&mut sub_b, payload.len(), deadline);
    assert_eq!(got_a, payload);
    assert_eq!(got_b, payload);

    writer.join().unwrap();
    io.close_resources();
    std::fs::remove_file(&path).ok();
}
