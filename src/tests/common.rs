use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering::Relaxed;

use crate::riffle::common::Result;
use crate::riffle::proto::{ConnOptions, Connection};
use crate::riffle::server::Transport;

pub static LISTEN_PORT: AtomicU16 = AtomicU16::new(10101);

pub fn listen_port() -> u16 {
    LISTEN_PORT.fetch_add(1, Relaxed)
}

/// A kernel pipe as (read end, write end).
pub fn os_pipe() -> (File, File) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
}

/// Two connections wired back to back over a pair of pipes.
pub fn connection_pair() -> (Connection, Connection) {
    let (a_in, b_out) = os_pipe();
    let (b_in, a_out) = os_pipe();
    (
        Connection::new(Transport::from_pipes(a_in, a_out), ConnOptions::default()),
        Connection::new(Transport::from_pipes(b_in, b_out), ConnOptions::default()),
    )
}

/// A connection whose inbound side is preloaded with input followed by EOF.
/// The returned file is the capture end for anything the connection writes;
/// keep it alive for the duration of the test.
pub fn conn_from_bytes(input: &[u8]) -> (Connection, File) {
    let (rx, mut tx) = os_pipe();
    tx.write_all(input).expect("couldn't preload pipe");
    drop(tx);
    let (out_rx, out_tx) = os_pipe();
    (
        Connection::new(Transport::from_pipes(rx, out_tx), ConnOptions::default()),
        out_rx,
    )
}

/// Collect the exact bytes a writer puts on the wire, including buffered
/// bytes released when the connection is dropped.
pub fn encode_with<F>(f: F) -> Vec<u8>
where
    F: FnOnce(&mut Connection) -> Result<()>,
{
    use std::io::Read;

    let (mut out_rx, out_tx) = os_pipe();
    let (in_rx, in_tx) = os_pipe();
    let mut conn = Connection::new(Transport::from_pipes(in_rx, out_tx), ConnOptions::default());
    f(&mut conn).expect("write failed");
    conn.flush().expect("flush failed");
    drop(conn);
    drop(in_tx);

    let mut data = Vec::new();
    out_rx.read_to_end(&mut data).expect("couldn't drain pipe");
    data
}
