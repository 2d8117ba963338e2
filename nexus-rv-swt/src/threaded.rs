//! Thread-synchronized wait mode.
//!
//! On targets where the serial device cannot sit in the same
//! readiness wait as the sockets, the wait is split across two helper
//! threads: one blocks in the socket poll, one blocks in serial
//! `read`. A single mutex and condition variable coordinate them with
//! the request/response/ack handshake; the serial thread feeds a
//! bounded lookahead buffer the main loop drains. Semantics are
//! identical to the single-threaded readiness loop.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::debug;
use mio::{Events, Poll, Token, Waker};

/// Bound on buffered serial bytes; the serial thread stalls rather
/// than grow past this.
const LOOKAHEAD_MAX: usize = 64 * 1024;

#[derive(Default)]
struct State {
    exit_requested: bool,

    /// Main sets this; the select thread synchronizes on it.
    select_request_valid: bool,
    /// The select thread sets this with `ready` filled in; main
    /// clears it on the next iteration.
    select_response_valid: bool,
    /// Main acknowledges a response; the select thread waits for the
    /// ack before its next iteration.
    select_response_ack: bool,
    ready: Vec<Token>,

    serial_lookahead: Vec<u8>,
    serial_eof: bool,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

pub struct ThreadedWait {
    shared: Arc<Shared>,
    waker: Waker,
    select_thread: Option<JoinHandle<()>>,
    serial_thread: Option<JoinHandle<()>>,
    serial_fd: Option<RawFd>,
}

impl ThreadedWait {
    /// Takes ownership of the poll (the select thread becomes the
    /// only caller of `poll`); registrations keep happening from the
    /// main thread through a cloned registry.
    pub fn new(poll: Poll, waker_token: Token) -> Result<ThreadedWait> {
        let waker =
            Waker::new(poll.registry(), waker_token).context("failed to create poll waker")?;
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        });

        let select_shared = shared.clone();
        let select_thread = std::thread::Builder::new()
            .name("swt-select".into())
            .spawn(move || run_select(select_shared, poll, waker_token))
            .context("failed to spawn select thread")?;

        Ok(ThreadedWait {
            shared,
            waker,
            select_thread: Some(select_thread),
            serial_thread: None,
            serial_fd: None,
        })
    }

    /// Hands the (blocking) serial descriptor to a fresh reader
    /// thread. Called at startup and again after a reconnect.
    pub fn attach_serial(&mut self, fd: RawFd) -> Result<()> {
        self.reap_serial();
        {
            let mut st = self.shared.state.lock().unwrap();
            st.serial_eof = false;
            st.serial_lookahead.clear();
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("swt-serial".into())
            .spawn(move || run_serial(shared, fd))
            .context("failed to spawn serial thread")?;
        self.serial_thread = Some(handle);
        self.serial_fd = Some(fd);
        Ok(())
    }

    /// Blocks until the select thread reports socket readiness or
    /// serial data (or EOF) is buffered. Returns the ready tokens and
    /// whether the serial side wants servicing.
    pub fn wait(&self) -> (Vec<Token>, bool) {
        let mut st = self.shared.state.lock().unwrap();

        if !st.select_request_valid {
            st.select_request_valid = true;
            st.select_response_valid = false;
            // The select thread may be waiting on this transition.
            self.shared.changed.notify_all();
        }

        while !(st.select_response_valid
            || !st.serial_lookahead.is_empty()
            || st.serial_eof
            || st.exit_requested)
        {
            st = self.shared.changed.wait(st).unwrap();
        }

        let mut tokens = Vec::new();
        if st.select_response_valid {
            st.select_response_ack = true;
            st.select_request_valid = false;
            tokens = std::mem::take(&mut st.ready);
            self.shared.changed.notify_all();
        }
        let serial = !st.serial_lookahead.is_empty() || st.serial_eof;
        (tokens, serial)
    }

    /// Drains buffered serial bytes. `(0, true)` reports EOF.
    pub fn serial_read(&self, buf: &mut [u8]) -> (usize, bool) {
        let mut st = self.shared.state.lock().unwrap();
        let n = st.serial_lookahead.len().min(buf.len());
        buf[..n].copy_from_slice(&st.serial_lookahead[..n]);
        st.serial_lookahead.drain(..n);
        if n > 0 {
            // The serial thread may be stalled on a full lookahead.
            self.shared.changed.notify_all();
        }
        (n, n == 0 && st.serial_eof)
    }

    /// Tears down the dead serial reader after an EOF and closes its
    /// descriptor. The caller reopens the device and calls
    /// [`attach_serial`](Self::attach_serial) again.
    pub fn detach_serial(&mut self) {
        self.reap_serial();
    }

    fn reap_serial(&mut self) {
        if let Some(handle) = self.serial_thread.take() {
            let _ = handle.join();
        }
        if let Some(fd) = self.serial_fd.take() {
            // SAFETY: the fd was received via into_raw_fd and the
            // reader thread holding it has been joined.
            unsafe { libc::close(fd) };
        }
    }

    /// Requests both helpers to exit, unblocks them, and joins.
    pub fn shutdown(&mut self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.exit_requested = true;
            self.shared.changed.notify_all();
        }
        // Unblock the poll and the serial read.
        let _ = self.waker.wake();
        if let Some(fd) = self.serial_fd.take() {
            // SAFETY: closing here is what lets the blocked read
            // return; the thread checks exit_requested before using
            // the result.
            unsafe { libc::close(fd) };
        }
        if let Some(handle) = self.select_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.serial_thread.take() {
            let _ = handle.join();
        }
        debug!("threaded wait shut down");
    }
}

fn run_select(shared: Arc<Shared>, mut poll: Poll, waker_token: Token) {
    let mut events = Events::with_capacity(64);
    loop {
        {
            let mut st = shared.state.lock().unwrap();
            while !(st.select_request_valid || st.exit_requested) {
                st = shared.changed.wait(st).unwrap();
            }
            if st.exit_requested {
                return;
            }
        }

        // Block in the poll without holding the mutex.
        let result = poll.poll(&mut events, None);

        let mut st = shared.state.lock().unwrap();
        if st.exit_requested {
            return;
        }
        st.select_response_ack = false;
        st.ready.clear();
        if result.is_ok() {
            for ev in events.iter() {
                if ev.token() != waker_token {
                    st.ready.push(ev.token());
                }
            }
        }
        st.select_response_valid = true;
        shared.changed.notify_all();

        while !(st.select_response_ack || st.exit_requested) {
            st = shared.changed.wait(st).unwrap();
        }
        if st.exit_requested {
            return;
        }
    }
}

fn run_serial(shared: Arc<Shared>, fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        // SAFETY: the fd stays open until shutdown/detach, both of
        // which join this thread after the read unblocks.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
            continue;
        }

        let mut st = shared.state.lock().unwrap();
        if st.exit_requested {
            return;
        }
        if n > 0 {
            while st.serial_lookahead.len() >= LOOKAHEAD_MAX && !st.exit_requested {
                st = shared.changed.wait(st).unwrap();
            }
            if st.exit_requested {
                return;
            }
            st.serial_lookahead.extend_from_slice(&buf[..n as usize]);
            shared.changed.notify_all();
        } else {
            st.serial_eof = true;
            shared.changed.notify_all();
            return;
        }
    }
}
