use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use fnv::FnvHashSet;
use tracing::debug;

use crate::riffle::common::{Error, Result, ERR_IO};
use crate::riffle::proto::item::{is_whitespace, Item};
use crate::riffle::server::Transport;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_MAX_LIST_DEPTH: usize = 64;

// Must stay smaller than the read buffer minus one, so the scanned tail
// always fits behind the synthetic paren.
const GARBAGE_SCAN_SIZE: usize = 256;

/// Callback invoked when a send stalls. The handler may read from the
/// connection (typically to consume responses the peer can't flush until we
/// drain them) so that a pipelined exchange can't deadlock. The send that
/// stalled is retried when the handler returns.
pub type BlockHandler = Box<dyn FnMut(&mut Connection) -> Result<()> + Send>;

#[derive(Clone, Copy, Debug)]
pub struct ConnOptions {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_list_depth: usize,
}

impl Default for ConnOptions {
    fn default() -> Self {
        ConnOptions {
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            max_list_depth: DEFAULT_MAX_LIST_DEPTH,
        }
    }
}

/// A buffered, full-duplex protocol connection over a Transport.
///
/// Reads and writes go through fixed-size buffers to amortize syscalls.
/// Refilling the read buffer always flushes the write buffer first, so a
/// request is on the wire before we block waiting for its response.
pub struct Connection {
    transport: Transport,
    read_buf: BytesMut,  // unread inbound bytes
    write_buf: BytesMut, // outbound bytes not yet flushed
    read_size: usize,
    write_size: usize,
    max_list_depth: usize,
    block_handler: Option<BlockHandler>,
    capabilities: FnvHashSet<String>,
}

impl Connection {
    pub fn new(transport: Transport, options: ConnOptions) -> Self {
        let read_size = options.read_buffer_size.max(DEFAULT_BUFFER_SIZE);
        let write_size = options.write_buffer_size.max(DEFAULT_BUFFER_SIZE);
        Connection {
            transport,
            read_buf: BytesMut::with_capacity(read_size),
            write_buf: BytesMut::with_capacity(write_size),
            read_size,
            write_size,
            max_list_depth: options.max_list_depth.max(1),
            block_handler: None,
            capabilities: FnvHashSet::default(),
        }
    }

    pub fn max_list_depth(&self) -> usize {
        self.max_list_depth
    }

    /// Install (or remove) the stalled-write handler. While a handler is
    /// installed the transport runs non-blocking sends so stalls surface as
    /// zero-byte writes instead of blocking the thread.
    pub fn set_block_handler(&mut self, handler: Option<BlockHandler>) -> Result<()> {
        let interval = if handler.is_some() {
            Some(Duration::ZERO)
        } else {
            None
        };
        self.block_handler = handler;
        self.transport.set_timeout(interval)
    }

    pub fn has_block_handler(&self) -> bool {
        self.block_handler.is_some()
    }

    /// True if the transport has inbound bytes ready.
    pub fn pending_input(&self) -> bool {
        self.transport.pending()
    }

    /// Bound how long a send may stall before the connection is failed.
    pub fn set_send_timeout(&mut self, interval: Option<Duration>) -> Result<()> {
        self.transport.set_timeout(interval)
    }

    // --- write buffer management ---

    /// Append data to the write buffer, flushing as needed. Payloads larger
    /// than the buffer itself go straight to the transport.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut data = data;
        if !self.write_buf.is_empty() && self.write_buf.len() + data.len() > self.write_size {
            // Fill and then empty the write buffer.
            let room = self.write_size - self.write_buf.len();
            self.write_buf.extend_from_slice(&data[..room]);
            data = &data[room..];
            self.flush()?;
        }
        if data.len() > self.write_size {
            self.write_direct(data)?;
        } else {
            self.write_buf.extend_from_slice(data);
        }
        Ok(())
    }

    /// Empty the write buffer to the transport.
    pub fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        // Detach the pending bytes first so nested reads from a block
        // handler never observe partial framing in the write buffer.
        let pending = self.write_buf.split();
        self.write_direct(&pending)
    }

    /// Push data to the transport until it is all gone, invoking the block
    /// handler whenever the kernel won't take more.
    fn write_direct(&mut self, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            let count = self.transport.send(&data[pos..])?;
            if count == 0 {
                let mut handler = self.block_handler.take().ok_or_else(|| {
                    Error::new(ERR_IO, "Can't write to connection: zero-length write")
                })?;
                let result = handler(self);
                self.block_handler = Some(handler);
                result?;
            }
            pos += count;
        }
        Ok(())
    }

    // --- read buffer management ---

    /// Refill the (empty) read buffer with whatever the transport has.
    fn refill(&mut self) -> Result<()> {
        debug_assert!(self.read_buf.is_empty());
        self.flush()?;
        self.read_buf.resize(self.read_size, 0);
        let blocking_override = self.block_handler.is_some() && self.transport.is_socket();
        match transport_read(&mut self.transport, blocking_override, &mut self.read_buf[..]) {
            Ok(count) => {
                self.read_buf.truncate(count);
                Ok(())
            }
            Err(e) => {
                self.read_buf.clear();
                Err(e)
            }
        }
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        if self.read_buf.is_empty() {
            self.refill()?;
        }
        let b = self.read_buf[0];
        self.read_buf.advance(1);
        Ok(b)
    }

    pub fn read_byte_skip_whitespace(&mut self) -> Result<u8> {
        loop {
            let b = self.read_byte()?;
            if !is_whitespace(b) {
                return Ok(b);
            }
        }
    }

    /// Fill data completely. Chunks larger than the read buffer are read
    /// straight off the transport to avoid a double copy.
    pub fn read_exact(&mut self, data: &mut [u8]) -> Result<()> {
        let mut pos = self.drain_into(data, 0);
        while data.len() - pos > self.read_size {
            self.flush()?;
            let blocking_override = self.block_handler.is_some() && self.transport.is_socket();
            let count = transport_read(&mut self.transport, blocking_override, &mut data[pos..])?;
            pos += count;
        }
        while pos < data.len() {
            self.refill()?;
            pos = self.drain_into(data, pos);
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; count];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    /// Copy buffered bytes into data starting at pos; returns the new pos.
    fn drain_into(&mut self, data: &mut [u8], pos: usize) -> usize {
        let count = self.read_buf.len().min(data.len() - pos);
        data[pos..pos + count].copy_from_slice(&self.read_buf[..count]);
        self.read_buf.advance(count);
        pos + count
    }

    /// Discard raw transport bytes until a left paren followed by whitespace,
    /// then seed the read buffer with a synthetic paren plus the trailing
    /// bytes. Tunneled sessions use this to step over shell greetings that
    /// precede the first real tuple.
    pub fn skip_leading_garbage(&mut self) -> Result<()> {
        debug_assert!(self.read_buf.is_empty());
        let mut buf = [0u8; GARBAGE_SCAN_SIZE];
        let mut lparen = false;
        let mut discarded = 0usize;
        loop {
            let blocking_override = self.block_handler.is_some() && self.transport.is_socket();
            let count = transport_read(&mut self.transport, blocking_override, &mut buf)?;
            let chunk = &buf[..count];

            // A paren at the end of the previous chunk may pair with
            // whitespace at the start of this one.
            let mut tail = if lparen && !chunk.is_empty() && is_whitespace(chunk[0]) {
                Some(0)
            } else {
                None
            };
            if tail.is_none() {
                for p in memchr::memchr_iter(b'(', chunk) {
                    if p + 1 < count && is_whitespace(chunk[p + 1]) {
                        tail = Some(p + 1);
                        break;
                    }
                }
            }

            if let Some(start) = tail {
                discarded += start;
                debug!(discarded, "skipped leading garbage");
                self.read_buf.clear();
                self.read_buf.put_u8(b'(');
                self.read_buf.extend_from_slice(&chunk[start..]);
                return Ok(());
            }
            discarded += count;
            lparen = chunk.last() == Some(&b'(');
        }
    }

    // --- capabilities ---

    /// Record the capability words the peer advertised.
    pub fn set_capabilities(&mut self, list: &[Item]) -> Result<()> {
        for item in list {
            match item {
                Item::Word(word) => {
                    self.capabilities.insert(word.clone());
                }
                _ => return Err(Error::malformed("Capability entry is not a word")),
            }
        }
        Ok(())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn send_capabilities(&mut self, capabilities: &[&str]) -> Result<()> {
        self.start_list()?;
        for word in capabilities {
            self.write_word(word)?;
        }
        self.end_list()
    }

    pub fn recv_capabilities(&mut self) -> Result<()> {
        match self.read_item()? {
            Item::List(list) => self.set_capabilities(&list),
            _ => Err(Error::malformed("Capability list expected")),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Best effort: a cleanly finished session has nothing left anyway.
        let _ = self.flush();
    }
}

/// Read from the transport with the block-handler bookkeeping applied:
/// reads always block, even while non-blocking sends are in effect, and a
/// zero-length read means the peer closed the connection.
fn transport_read(
    transport: &mut Transport,
    blocking_override: bool,
    data: &mut [u8],
) -> Result<usize> {
    if blocking_override {
        transport.set_timeout(None)?;
    }
    let result = transport.recv(data);
    if blocking_override {
        transport.set_timeout(Some(Duration::ZERO))?;
    }
    let count = result?;
    if count == 0 {
        return Err(Error::closed());
    }
    Ok(count)
}
