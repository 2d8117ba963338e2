//! The fan-out server: one listening socket, one serial device, any
//! number of subscriber sockets.
//!
//! Raw slice bytes read from the serial side are relayed verbatim to
//! every subscriber, in order, with per-client backpressure. Clients
//! are watched for readability only; writability in the wait set
//! would fire constantly and turn the loop into a spin. Inbound
//! client bytes are discarded: the protocol is one-way, reads exist
//! to notice disconnects.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use nexus_rv::NexusStream;

use crate::threaded::ThreadedWait;

const LISTENER: Token = Token(0);
const SERIAL: Token = Token(1);
const WAKER: Token = Token(2);
const FIRST_CLIENT: usize = 3;

/// Queue depth past which a client is considered stalled and further
/// bytes for it are withheld.
const HIGH_WATER: usize = 512 * 1024;

/// Kernel-side send buffer requested for each subscriber.
const CLIENT_SNDBUF: usize = 1024 * 1024;

const SERIAL_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub port: u16,
    pub src_bits: u8,
    /// Use the helper-thread wait instead of a single readiness loop.
    pub threaded: bool,
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    queue: Vec<u8>,
    /// The queue crossed the high-water mark; bytes for this client
    /// are dropped until it drains completely. Resumption is a fresh
    /// subscription boundary, never a gap in the middle.
    withholding: bool,
}

enum Mode {
    Loop { poll: Poll, events: Events },
    Threaded(ThreadedWait),
}

enum SerialRead {
    Data(usize),
    Empty,
    Eof,
}

pub struct IoConnections {
    registry: Registry,
    mode: Mode,
    listener: TcpListener,
    /// Readiness-loop mode keeps the device here; the threaded mode's
    /// reader thread owns the descriptor instead.
    serial: Option<File>,
    serial_connected: bool,
    warned_serial_closed: bool,
    clients: Vec<Option<Client>>,
    clients_high_water: usize,
    stream: NexusStream,
}

impl IoConnections {
    pub fn new(opts: &ServerOptions, serial: File) -> Result<IoConnections> {
        let addr: SocketAddr = ([0, 0, 0, 0], opts.port).into();
        let mut listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to bind server socket on port {}", opts.port))?;

        let poll = Poll::new().context("failed to create poll")?;
        let registry = poll
            .registry()
            .try_clone()
            .context("failed to clone poll registry")?;
        registry
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("failed to register server socket")?;

        let (mode, serial) = if opts.threaded {
            let mut wait = ThreadedWait::new(poll, WAKER)?;
            wait.attach_serial(serial.into_raw_fd())?;
            (Mode::Threaded(wait), None)
        } else {
            registry
                .register(&mut SourceFd(&serial.as_raw_fd()), SERIAL, Interest::READABLE)
                .context("failed to register serial device")?;
            (
                Mode::Loop {
                    poll,
                    events: Events::with_capacity(64),
                },
                Some(serial),
            )
        };

        Ok(IoConnections {
            registry,
            mode,
            listener,
            serial,
            serial_connected: true,
            warned_serial_closed: false,
            clients: Vec::new(),
            clients_high_water: 0,
            stream: NexusStream::new(opts.src_bits),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of connected subscribers.
    pub fn client_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_some()).count()
    }

    /// True once the subscriber count has fallen back to zero after
    /// having been non-zero; the `autoexit` trigger.
    pub fn has_client_count_decreased_to_zero(&self) -> bool {
        self.clients_high_water > 0 && self.client_count() == 0
    }

    pub fn did_serial_disconnect(&self) -> bool {
        !self.serial_connected
    }

    /// Re-attaches a reopened serial device after a disconnect.
    /// Subscribers are not disturbed.
    pub fn set_serial_device(&mut self, serial: File) -> Result<()> {
        match &mut self.mode {
            Mode::Loop { .. } => {
                self.registry
                    .register(&mut SourceFd(&serial.as_raw_fd()), SERIAL, Interest::READABLE)
                    .context("failed to re-register serial device")?;
                self.serial = Some(serial);
            }
            Mode::Threaded(wait) => {
                wait.attach_serial(serial.into_raw_fd())?;
            }
        }
        self.serial_connected = true;
        self.warned_serial_closed = false;
        Ok(())
    }

    /// Waits for activity and services everything that became ready.
    pub fn service(&mut self) -> Result<()> {
        let (tokens, mut serial_ready) = self.wait()?;

        let mut accept = false;
        let mut ready_clients = Vec::new();
        for token in tokens {
            match token {
                LISTENER => accept = true,
                SERIAL => serial_ready = true,
                WAKER => {}
                other => ready_clients.push(other),
            }
        }

        if accept {
            self.accept_clients();
        }
        if serial_ready {
            self.pump_serial();
        }
        for token in ready_clients {
            self.service_client_read(token);
        }
        self.flush_queues();
        Ok(())
    }

    fn wait(&mut self) -> Result<(Vec<Token>, bool)> {
        match &mut self.mode {
            Mode::Loop { poll, events } => {
                if let Err(e) = poll.poll(events, None) {
                    if e.kind() == ErrorKind::Interrupted {
                        return Ok((Vec::new(), false));
                    }
                    return Err(e).context("poll failed");
                }
                Ok((events.iter().map(|e| e.token()).collect(), false))
            }
            Mode::Threaded(wait) => Ok(wait.wait()),
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    set_send_buffer(&stream);
                    let slot = match self.clients.iter().position(|c| c.is_none()) {
                        Some(slot) => slot,
                        None => {
                            self.clients.push(None);
                            self.clients.len() - 1
                        }
                    };
                    let token = Token(FIRST_CLIENT + slot);
                    if let Err(e) = self.registry.register(&mut stream, token, Interest::READABLE)
                    {
                        warn!("failed to register client {}: {}", peer, e);
                        continue;
                    }
                    info!("client {} connected", peer);
                    self.clients[slot] = Some(Client {
                        stream,
                        peer,
                        queue: Vec::new(),
                        withholding: false,
                    });
                    let active = self.clients.iter().filter(|c| c.is_some()).count();
                    self.clients_high_water = self.clients_high_water.max(active);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn serial_read(&mut self, buf: &mut [u8]) -> SerialRead {
        match &mut self.mode {
            Mode::Loop { .. } => {
                let file = match self.serial.as_mut() {
                    Some(file) => file,
                    None => return SerialRead::Empty,
                };
                loop {
                    match file.read(buf) {
                        Ok(0) => return SerialRead::Eof,
                        Ok(n) => return SerialRead::Data(n),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return SerialRead::Empty,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("serial read failed: {}", e);
                            return SerialRead::Eof;
                        }
                    }
                }
            }
            Mode::Threaded(wait) => match wait.serial_read(buf) {
                (0, true) => SerialRead::Eof,
                (0, false) => SerialRead::Empty,
                (n, _) => SerialRead::Data(n),
            },
        }
    }

    /// Consumes all immediately-available serial input and relays it.
    fn pump_serial(&mut self) {
        let mut buf = [0u8; SERIAL_CHUNK];
        loop {
            match self.serial_read(&mut buf) {
                SerialRead::Empty => break,
                SerialRead::Eof => {
                    self.mark_serial_disconnected();
                    break;
                }
                SerialRead::Data(n) => {
                    debug!("serial: {} bytes", n);
                    for &byte in &buf[..n] {
                        if let Some(msg) = self.stream.append_byte(byte) {
                            // Reconstructed for observability only;
                            // clients get the raw slice bytes.
                            debug!("message: {}", msg);
                        }
                    }
                    self.queue_serial_bytes_to_clients(&buf[..n]);
                }
            }
        }
    }

    fn mark_serial_disconnected(&mut self) {
        if !self.warned_serial_closed {
            warn!("serial device was disconnected");
            self.warned_serial_closed = true;
        }
        match &mut self.mode {
            Mode::Loop { .. } => {
                if let Some(serial) = self.serial.take() {
                    let _ = self.registry.deregister(&mut SourceFd(&serial.as_raw_fd()));
                }
            }
            Mode::Threaded(wait) => wait.detach_serial(),
        }
        self.serial_connected = false;
    }

    /// Appends `bytes` to every subscriber's queue, subject to the
    /// high-water rule: a stalled client gets nothing more until its
    /// queue has fully drained.
    fn queue_serial_bytes_to_clients(&mut self, bytes: &[u8]) {
        for client in self.clients.iter_mut().flatten() {
            if client.withholding {
                if client.queue.is_empty() {
                    debug!("client {} drained, resuming", client.peer);
                    client.withholding = false;
                } else {
                    continue;
                }
            }
            if client.queue.len() > HIGH_WATER {
                // Only log when *newly* withholding.
                warn!(
                    "client {} is not consuming data fast enough; withholding",
                    client.peer
                );
                client.withholding = true;
                continue;
            }
            client.queue.extend_from_slice(bytes);
        }
    }

    fn service_client_read(&mut self, token: Token) {
        if token.0 < FIRST_CLIENT {
            return;
        }
        let slot = token.0 - FIRST_CLIENT;
        let mut buf = [0u8; 1024];
        let dead = loop {
            let client = match self.clients.get_mut(slot) {
                Some(Some(client)) => client,
                _ => return,
            };
            match client.stream.read(&mut buf) {
                // EOF: the subscriber went away.
                Ok(0) => break true,
                // The protocol is one-way; inbound bytes only prove
                // liveness.
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("client {} read error: {}", client.peer, e);
                    break true;
                }
            }
        };
        if dead {
            self.drop_client(slot);
        }
    }

    /// Sends as much of each queue as the sockets will take.
    fn flush_queues(&mut self) {
        for slot in 0..self.clients.len() {
            let dead = loop {
                let client = match self.clients.get_mut(slot) {
                    Some(Some(client)) => client,
                    _ => break false,
                };
                if client.queue.is_empty() {
                    break false;
                }
                match client.stream.write(&client.queue) {
                    Ok(0) => break false,
                    Ok(n) => {
                        client.queue.drain(..n);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break false,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("client {} send error: {}", client.peer, e);
                        break true;
                    }
                }
            };
            if dead {
                self.drop_client(slot);
            }
        }
    }

    fn drop_client(&mut self, slot: usize) {
        if let Some(Some(mut client)) = self.clients.get_mut(slot).map(Option::take) {
            info!("client {} disconnected", client.peer);
            let _ = self.registry.deregister(&mut client.stream);
        }
    }

    /// Releases everything in reverse acquisition order: clients,
    /// serial device, listening socket.
    pub fn close_resources(&mut self) {
        for slot in (0..self.clients.len()).rev() {
            self.drop_client(slot);
        }
        match &mut self.mode {
            Mode::Loop { .. } => {
                if let Some(serial) = self.serial.take() {
                    let _ = self.registry.deregister(&mut SourceFd(&serial.as_raw_fd()));
                }
            }
            Mode::Threaded(wait) => wait.shutdown(),
        }
        let _ = self.registry.deregister(&mut self.listener);
    }
}

fn set_send_buffer(stream: &TcpStream) {
    let size = CLIENT_SNDBUF as libc::c_int;
    // SAFETY: the fd is valid and the option value is a plain int.
    let result = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        warn!(
            "setting client send buffer failed: {}",
            std::io::Error::last_os_error()
        );
    }
}
