use std::net::TcpStream;
use std::thread;

use tracing::{info, warn};

use crate::riffle::common::Result;
use crate::riffle::config::Settings;
use crate::riffle::proto::{cram_server, handle_commands, CommandEntry, Connection, Item};
use crate::riffle::server::{Listener, Transport};

/// Capabilities this server advertises to every client.
const SERVER_CAPABILITIES: &[&str] = &["pipelining"];

const COMMANDS: &[CommandEntry<()>] = &[
    CommandEntry {
        name: "ping",
        handler: cmd_ping,
        terminate: false,
    },
    CommandEntry {
        name: "bye",
        handler: cmd_bye,
        terminate: true,
    },
];

fn cmd_ping(conn: &mut Connection, _params: &[Item], _context: &mut ()) -> Result<()> {
    conn.write_cmd_response("", &[])
}

fn cmd_bye(conn: &mut Connection, _params: &[Item], _context: &mut ()) -> Result<()> {
    conn.write_cmd_response("", &[])
}

/// Accepts connections and serves each on its own thread: capability
/// exchange, then CRAM-MD5 when a user database is configured, then the
/// command loop.
pub struct Service {
    pub address: String,
}

impl Service {
    pub fn new(address: String) -> Self {
        Service { address }
    }

    pub fn run(&self, settings: &'static Settings) -> Result<()> {
        let listener = Listener::new(self.address.clone())?;
        info!(address = %listener.address, "listening");
        loop {
            let sock = match listener.accept() {
                Some(sock) => sock,
                None => return Ok(()),
            };
            thread::spawn(move || {
                if let Err(e) = serve_connection(sock, settings) {
                    warn!(error = %e, "connection terminated");
                }
            });
        }
    }
}

fn serve_connection(sock: TcpStream, settings: &Settings) -> Result<()> {
    if let Some(timeout) = settings.idle_timeout() {
        sock.set_read_timeout(Some(timeout))?;
    }
    serve(
        Connection::new(Transport::from_tcp(sock), settings.conn_options()),
        settings,
    )
}

fn serve(mut conn: Connection, settings: &Settings) -> Result<()> {
    conn.send_capabilities(SERVER_CAPABILITIES)?;
    conn.recv_capabilities()?;

    // No configured users means an open server: skip the auth exchange.
    if !settings.users.is_empty() {
        match cram_server(&mut conn, &settings.users)? {
            Some(user) => info!(%user, "client authenticated"),
            None => return Ok(()),
        }
    }

    handle_commands(&mut conn, COMMANDS, &mut ())
}
