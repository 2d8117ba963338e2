use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nexus_rv::{Error, ItcOptions, TableImage, Trace, TraceConfig};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "A RISC-V Nexus trace stream decoder. Reconstructs the retired instruction stream from a raw trace file or socket and a program image."
)]
struct Opt {
    #[structopt(
        name = "TRACE",
        parse(from_os_str),
        required_unless("tcp"),
        help = "Raw trace input file."
    )]
    trace: Option<PathBuf>,

    #[structopt(
        long = "--tcp",
        value_name = "HOST:PORT",
        help = "Read the trace from a TCP stream instead of a file."
    )]
    tcp: Option<String>,

    #[structopt(
        long = "--image",
        parse(from_os_str),
        help = "Flat binary program image the trace was captured from."
    )]
    image: Option<PathBuf>,

    #[structopt(
        long = "--base",
        default_value = "0",
        parse(try_from_str = parse_addr),
        help = "Load address of the program image."
    )]
    base: u64,

    #[structopt(long = "--srcbits", default_value = "0")]
    srcbits: u8,

    #[structopt(long = "--ts-size", default_value = "40")]
    ts_size: u8,

    #[structopt(
        long = "--freq",
        default_value = "0",
        help = "Timestamp tick frequency in Hz; 0 reports raw ticks."
    )]
    freq: u32,

    #[structopt(long = "--arch", default_value = "32", help = "Address width: 32 or 64.")]
    arch: u8,

    #[structopt(
        long = "--itcprint",
        value_name = "CHANNEL",
        help = "Reassemble printable writes on the given ITC channel."
    )]
    itcprint: Option<u8>,

    #[structopt(long = "--stats", help = "Print per-core statistics after decoding.")]
    stats: bool,
}

fn parse_addr(s: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

enum Source {
    File(File),
    Tcp(TcpStream),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::File(f) => f.read(buf),
            Source::Tcp(s) => s.read(buf),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    if opt.arch != 32 && opt.arch != 64 {
        bail!("--arch must be 32 or 64");
    }
    if opt.srcbits > 8 {
        bail!("--srcbits must be 0 to 8");
    }
    if !(8..=64).contains(&opt.ts_size) {
        bail!("--ts-size must be 8 to 64");
    }

    let source = match (&opt.tcp, &opt.trace) {
        (Some(addr), _) => {
            let stream = TcpStream::connect(addr)
                .with_context(|| format!("failed to connect to {}", addr))?;
            stream
                .set_nonblocking(true)
                .context("failed to make the trace socket non-blocking")?;
            Source::Tcp(stream)
        }
        (None, Some(path)) => {
            Source::File(File::open(path).context("failed to open trace file")?)
        }
        (None, None) => unreachable!("structopt requires one of TRACE or --tcp"),
    };

    let mut image = TableImage::new();
    if let Some(path) = &opt.image {
        let bytes = std::fs::read(path).context("failed to read program image")?;
        image.load_binary(opt.base, &bytes);
    }

    let config = TraceConfig {
        src_bits: opt.srcbits,
        ts_size: opt.ts_size,
        ts_freq: opt.freq,
        arch_bits: opt.arch,
        itc: ItcOptions {
            print: opt.itcprint.is_some(),
            nls: true,
            channel: opt.itcprint.unwrap_or(0),
            capacity: 4096,
            formats: Vec::new(),
        },
    };

    let mut trace = Trace::new(source, image, config);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    loop {
        let item = match trace.instructions().next() {
            None => break,
            Some(Err(Error::NeedMore)) => {
                // Live socket with nothing buffered yet.
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            Some(Err(e)) => return Err(e).context("decode error"),
            Some(Ok(instr)) => instr,
        };

        write!(out, "[core {}]", item.core)?;
        if item.timestamp != 0 {
            match trace.timestamp_seconds(item.timestamp) {
                Some(secs) => write!(out, " t={:.9}", secs)?,
                None => write!(out, " t={}", item.timestamp)?,
            }
        }
        write!(out, " {:#010x}:", item.address)?;
        match item.size {
            2 => write!(out, " {:04x}    ", item.bits & 0xffff)?,
            _ => write!(out, " {:08x}", item.bits)?,
        }
        if let Some(text) = &item.text {
            write!(out, "  {}", text)?;
        }
        if let Some(src) = &item.source {
            write!(out, "  # {}:{} ({})", src.file, src.line, src.function)?;
        }
        writeln!(out)?;

        let core = item.core as usize;
        while let Some(msg) = trace.itc_poll(core) {
            writeln!(out, "ITC print [core {}]: {}", core, msg.text)?;
        }
    }

    for core in 0..trace.num_harts() {
        while let Some(msg) = trace.itc_flush(core) {
            writeln!(out, "ITC print [core {}]: {}", core, msg.text)?;
        }
    }

    if trace.dropped_messages() > 0 {
        log::warn!("{} messages dropped", trace.dropped_messages());
    }
    if opt.stats {
        write!(out, "{}", trace.analytics())?;
    }

    Ok(())
}
