use anyhow::{Context, Result};
use log::warn;
use mmu_link::Transport;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::{collections::VecDeque, os::unix::io::RawFd, path::PathBuf};

/// A pseudo-terminal pair standing in for the MMU's UART
///
/// The emulated MMU talks on the master side, the protocol logic on the slave side. Both ends are
/// non-blocking.
pub struct SerialEmulator {
    master: RawFd,
    slave: RawFd,
}

impl SerialEmulator {
    pub fn new() -> Result<Self> {
        use nix::sys::termios::*;

        let termios: Termios = unsafe { std::mem::zeroed() };

        let ptys = nix::pty::openpty(None, &Some(termios)).context("Could not allocate pty")?;
        let serial = SerialEmulator {
            master: ptys.master,
            slave: ptys.slave,
        };
        for fd in [serial.master, serial.slave] {
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .context("Could not make pty non-blocking")?;
        }
        Ok(serial)
    }

    pub fn ttyname(&self) -> Result<PathBuf> {
        nix::unistd::ttyname(self.slave).context("Could not get TTY name")
    }

    pub fn master(&self) -> RawFd {
        self.master
    }

    pub fn slave(&self) -> RawFd {
        self.slave
    }
}

impl Drop for SerialEmulator {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.master);
        let _ = nix::unistd::close(self.slave);
    }
}

/// Appends whatever is readable on `fd` to `buf`
pub fn read_available(fd: RawFd, buf: &mut Vec<u8>) -> Result<()> {
    let mut recv = [0u8; 128];
    loop {
        match nix::unistd::read(fd, &mut recv) {
            Err(Errno::EWOULDBLOCK) | Ok(0) => return Ok(()),
            Err(e) => return Err(e).context("read failed"),
            Ok(n) => buf.extend(&recv[..n]),
        }
    }
}

pub fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match nix::unistd::write(fd, data) {
            Err(Errno::EWOULDBLOCK) => continue,
            Err(e) => return Err(e).context("write failed"),
            Ok(n) => data = &data[n..],
        }
    }
    Ok(())
}

/// Printer side of the pty as seen by the protocol logic
pub struct PtyTransport {
    fd: RawFd,
    rx: VecDeque<u8>,
    scratch: Vec<u8>,
}

impl PtyTransport {
    pub fn new(fd: RawFd) -> Self {
        PtyTransport {
            fd,
            rx: VecDeque::new(),
            scratch: Vec::new(),
        }
    }
}

impl Transport for PtyTransport {
    fn receive(&mut self) -> Option<u8> {
        if self.rx.is_empty() {
            self.scratch.clear();
            if let Err(e) = read_available(self.fd, &mut self.scratch) {
                warn!("{e:#}");
            }
            self.rx.extend(self.scratch.iter().copied());
        }
        self.rx.pop_front()
    }

    fn transmit(&mut self, frame: &[u8]) {
        if let Err(e) = write_all(self.fd, frame) {
            warn!("{e:#}");
        }
    }
}
