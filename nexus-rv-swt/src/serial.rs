//! Serial device setup: open, raw mode, baud rate.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Quantizes a requested baud rate to the nearest supported termios
/// constant at or above common break points.
fn nearest_baud(baud: u32) -> libc::speed_t {
    if baud <= 9600 {
        libc::B9600
    } else if baud <= 19200 {
        libc::B19200
    } else if baud <= 38400 {
        libc::B38400
    } else if baud <= 57600 {
        libc::B57600
    } else if baud <= 115_200 {
        libc::B115200
    } else if baud <= 230_400 {
        libc::B230400
    } else if baud <= 460_800 {
        libc::B460800
    } else if baud <= 921_600 {
        libc::B921600
    } else if baud <= 1_000_000 {
        libc::B1000000
    } else if baud <= 1_500_000 {
        libc::B1500000
    } else if baud <= 2_000_000 {
        libc::B2000000
    } else {
        libc::B4000000
    }
}

/// Puts the descriptor into raw 8N1 mode at `baud`. The settings
/// mirror what terminal emulators negotiate for these adapters; in
/// particular canonical mode and echo must be off or the kernel will
/// sit on partial lines.
fn init_device(fd: i32, baud: libc::speed_t) -> Result<()> {
    // SAFETY: fd is a valid open descriptor for the lifetime of this
    // call; termios is plain data initialized by tcgetattr.
    unsafe {
        let mut options: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut options) != 0 {
            bail!("tcgetattr failed");
        }
        if libc::cfsetispeed(&mut options, baud) != 0 || libc::cfsetospeed(&mut options, baud) != 0
        {
            bail!("setting baud rate failed");
        }

        options.c_iflag &= !(libc::ICRNL | libc::IXON);
        options.c_iflag |= libc::IGNBRK;
        options.c_oflag &= !(libc::OPOST | libc::ONLCR);
        options.c_lflag &= !(libc::ICANON
            | libc::ISIG
            | libc::ECHO
            | libc::ECHOE
            | libc::ECHOK
            | libc::ECHONL
            | libc::ECHOCTL
            | libc::ECHOKE
            | libc::ECHOPRT
            | libc::IEXTEN);
        options.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE);
        options.c_cflag |= libc::CS8 | libc::CLOCAL | libc::CREAD;

        if libc::tcsetattr(fd, libc::TCSANOW, &options) != 0 {
            bail!("tcsetattr failed");
        }
        if libc::tcflush(fd, libc::TCIOFLUSH) != 0 {
            bail!("tcflush failed");
        }

        let mut readback: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut readback) != 0 {
            bail!("tcgetattr readback failed");
        }
        if libc::cfgetispeed(&readback) != baud {
            bail!("device did not accept the requested baud rate");
        }
    }
    Ok(())
}

/// Opens the serial device read-only. `nonblocking` is used for the
/// readiness-loop mode; the threaded mode reads blocking from its own
/// thread. A regular file (useful when replaying a capture) is opened
/// without touching termios.
pub fn open_serial(path: &Path, baud: u32, nonblocking: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if nonblocking {
        opts.custom_flags(libc::O_NONBLOCK);
    }
    let file = opts
        .open(path)
        .with_context(|| format!("failed to open serial device {}", path.display()))?;

    let fd = file.as_raw_fd();
    // SAFETY: fd is valid; isatty only inspects it.
    let is_tty = unsafe { libc::isatty(fd) } == 1;
    if is_tty {
        init_device(fd, nearest_baud(baud))
            .with_context(|| format!("failed to configure {}", path.display()))?;
    }
    Ok(file)
}
