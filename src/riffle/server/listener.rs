use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::riffle::common::{Error, Result};

// Pause after hitting a descriptor or memory limit, so in-flight
// connections get a chance to release resources before the next accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What to do about a failed accept.
enum AcceptFailure {
    /// A hiccup on the pending connection itself; try again at once.
    Retry,
    /// Resource pressure on this process or the host; wait, then retry.
    Backoff,
    /// The listening socket is unusable; stop accepting.
    Shutdown,
}

fn classify_accept_failure(err: &io::Error) -> AcceptFailure {
    match err.raw_os_error() {
        Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) => {
            AcceptFailure::Retry
        }
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            AcceptFailure::Backoff
        }
        _ => AcceptFailure::Shutdown,
    }
}

pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    pub fn new(address: String) -> Result<Self> {
        let addr: SocketAddr = address.parse()?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self { address, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }

    /// Accept the next connection, riding out transient failures. Returns
    /// None once the listening socket itself is gone (e.g. closed during
    /// shutdown) or reports an error we have no recovery for.
    pub fn accept(&self) -> Option<TcpStream> {
        loop {
            match self.listener.accept() {
                Ok((sock, remote_addr)) => {
                    debug!(%remote_addr, listener = %self.address, "accepted connection");
                    return Some(sock);
                }
                Err(e) => match classify_accept_failure(&e) {
                    AcceptFailure::Retry => warn!(%e, "transient accept failure"),
                    AcceptFailure::Backoff => {
                        warn!(%e, "accept hit a resource limit, backing off");
                        thread::sleep(ACCEPT_BACKOFF);
                    }
                    AcceptFailure::Shutdown => {
                        error!(%e, listener = %self.address, "stopping accept loop");
                        return None;
                    }
                },
            }
        }
    }
}
