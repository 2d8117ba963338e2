use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{error, info};
use structopt::StructOpt;

use nexus_rv_swt::serial;
use nexus_rv_swt::server::{IoConnections, ServerOptions};

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Relays RISC-V Nexus slice bytes from a serial device to TCP subscribers, verbatim and in order, with per-client backpressure."
)]
struct Opt {
    #[structopt(
        long = "--device",
        parse(from_os_str),
        default_value = "/dev/ttyUSB0",
        help = "Serial device carrying the trace byte stream."
    )]
    device: PathBuf,

    #[structopt(
        long = "--port",
        default_value = "4568",
        help = "TCP port to listen on for subscribers."
    )]
    port: u16,

    #[structopt(
        long = "--baud",
        default_value = "115200",
        help = "Baud rate; must match the target's probe interface block."
    )]
    baud: u32,

    #[structopt(
        long = "--srcbits",
        default_value = "0",
        help = "Width of the source-id field in trace messages (0 to 8); 0 means single-hart."
    )]
    srcbits: u8,

    #[structopt(
        long = "--autoexit",
        help = "Exit when the subscriber count drops from non-zero to zero."
    )]
    autoexit: bool,

    #[structopt(
        long = "--threaded",
        help = "Use helper threads instead of a single readiness loop. For platforms where the serial device cannot be polled alongside sockets."
    )]
    threaded: bool,

    #[structopt(
        short = "d",
        long = "--debug",
        help = "Dump the raw byte stream and reconstructed messages."
    )]
    debug: bool,
}

/// Pause between reconnection attempts after the serial device goes
/// away.
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let default_filter = if opt.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if opt.srcbits > 8 {
        bail!("--srcbits must be 0 to 8");
    }

    let device = serial::open_serial(&opt.device, opt.baud, !opt.threaded)?;
    let options = ServerOptions {
        port: opt.port,
        src_bits: opt.srcbits,
        threaded: opt.threaded,
    };
    let mut io = IoConnections::new(&options, device)?;
    info!("listening on port {}", opt.port);

    while !(opt.autoexit && io.has_client_count_decreased_to_zero()) {
        io.service()?;

        if io.did_serial_disconnect() {
            error!("detected serial disconnect");
            // Keep trying to reconnect; subscribers stay up.
            loop {
                info!("attempting to reconnect to {}", opt.device.display());
                match serial::open_serial(&opt.device, opt.baud, !opt.threaded) {
                    Ok(device) => {
                        info!("reconnected to {}", opt.device.display());
                        io.set_serial_device(device)?;
                        break;
                    }
                    Err(_) => std::thread::sleep(RECONNECT_PAUSE),
                }
            }
        }
    }

    io.close_resources();
    Ok(())
}
