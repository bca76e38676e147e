use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::riffle::common::{Error, Result, ERR_IO};

/// A bidirectional byte channel. Either a TCP socket, or a pair of pipe
/// ends for tunneled sessions where the protocol runs over the stdin and
/// stdout of a spawned program. The two flavors are fixed at construction.
pub struct Transport {
    kind: Kind,
    nonblocking: bool,
}

enum Kind {
    Tcp(TcpStream),
    Pipes {
        input: File,
        output: File,
        write_timeout: Option<Duration>,
    },
}

impl Transport {
    pub fn from_tcp(stream: TcpStream) -> Self {
        Transport {
            kind: Kind::Tcp(stream),
            nonblocking: false,
        }
    }

    /// Wrap an already-connected descriptor pair: reads come from input,
    /// writes go to output.
    pub fn from_pipes(input: File, output: File) -> Self {
        Transport {
            kind: Kind::Pipes {
                input,
                output,
                write_timeout: None,
            },
            nonblocking: false,
        }
    }

    pub fn is_socket(&self) -> bool {
        matches!(self.kind, Kind::Tcp(_))
    }

    /// Write data to the channel, returning the number of bytes accepted,
    /// which may be less than data.len(). In non-blocking mode a send the
    /// kernel can't accept right now returns Ok(0) instead of an error.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        loop {
            let result = match &mut self.kind {
                Kind::Tcp(stream) => stream.write(data),
                Kind::Pipes {
                    output,
                    write_timeout,
                    ..
                } => {
                    if let Some(t) = write_timeout {
                        if !poll_fd(output.as_raw_fd(), libc::POLLOUT, Some(*t)) {
                            return Err(Error::new(ERR_IO, "Can't write to connection: timed out"));
                        }
                    }
                    output.write(data)
                }
            };
            return match result {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if self.nonblocking && e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(Error::from(e)),
            };
        }
    }

    /// Read available bytes into buf. Returns 0 only on a clean EOF, which
    /// the connection layer above treats as the peer closing the session.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let result = match &mut self.kind {
                Kind::Tcp(stream) => stream.read(buf),
                Kind::Pipes { input, .. } => input.read(buf),
            };
            return match result {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(Error::from(e)),
            };
        }
    }

    /// Non-blocking poll: is there inbound data ready to read?
    pub fn pending(&self) -> bool {
        poll_fd(self.read_fd(), libc::POLLIN, Some(Duration::ZERO))
    }

    /// None blocks forever, a zero interval switches to non-blocking sends,
    /// and any other value bounds how long a send may stall.
    pub fn set_timeout(&mut self, interval: Option<Duration>) -> Result<()> {
        match interval {
            None => {
                self.set_nonblocking(false)?;
                self.set_write_timeout(None)?;
                self.nonblocking = false;
            }
            Some(t) if t.is_zero() => {
                self.set_nonblocking(true)?;
                self.nonblocking = true;
            }
            Some(t) => {
                self.set_nonblocking(false)?;
                self.set_write_timeout(Some(t))?;
                self.nonblocking = false;
            }
        }
        Ok(())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        match &mut self.kind {
            Kind::Tcp(stream) => stream.set_nonblocking(nonblocking).map_err(Error::from),
            // Reads from a tunnel pipe always block; only the write side
            // participates in stalled-write detection.
            Kind::Pipes { output, .. } => set_fd_nonblocking(output.as_raw_fd(), nonblocking),
        }
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        match &mut self.kind {
            Kind::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Error::from),
            Kind::Pipes { write_timeout, .. } => {
                *write_timeout = timeout;
                Ok(())
            }
        }
    }

    fn read_fd(&self) -> RawFd {
        match &self.kind {
            Kind::Tcp(stream) => stream.as_raw_fd(),
            Kind::Pipes { input, .. } => input.as_raw_fd(),
        }
    }
}

fn set_fd_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = match timeout {
        Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
        None => -1,
    };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
}
