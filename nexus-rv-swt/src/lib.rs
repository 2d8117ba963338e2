//! Serial-wire trace fan-out.
//!
//! The server side of live tracing: slice bytes arrive over a serial
//! link and are relayed verbatim to any number of TCP subscribers.
//! See [`server::IoConnections`] for the loop itself.

pub mod serial;
pub mod server;
pub mod threaded;
