use tracing::{debug, warn};

use crate::riffle::common::{Error, Result, ERR_UNKNOWN_CMD};
use crate::riffle::proto::connection::Connection;
use crate::riffle::proto::item::Item;
use crate::riffle::proto::tuple::{parse_tuple, Arg, Field};

/// One server-side command. Handlers signal an application failure by
/// returning an error marked with Error::command_error; anything else tears
/// the connection down. A terminate entry ends the dispatch loop after the
/// request is served.
pub struct CommandEntry<C> {
    pub name: &'static str,
    pub handler: fn(&mut Connection, &[Item], &mut C) -> Result<()>,
    pub terminate: bool,
}

impl Connection {
    /// Emit a command tuple: `( name ( params... ) )`.
    pub fn write_cmd(&mut self, name: &str, fmt: &str, args: &[Arg]) -> Result<()> {
        self.start_list()?;
        self.write_word(name)?;
        self.write_tuple(fmt, args)?;
        self.end_list()
    }

    /// Emit a success envelope: `( success ( params... ) )`.
    pub fn write_cmd_response(&mut self, fmt: &str, args: &[Arg]) -> Result<()> {
        self.start_list()?;
        self.write_word("success")?;
        self.write_tuple(fmt, args)?;
        self.end_list()
    }

    /// Emit a failure envelope carrying the whole cause chain, one
    /// `( code message file line )` tuple per link. A missing message is
    /// marshalled as the empty string.
    pub fn write_cmd_failure(&mut self, err: &Error) -> Result<()> {
        self.start_list()?;
        self.write_word("failure")?;
        self.start_list()?;
        let mut link = Some(err);
        while let Some(e) = link {
            self.write_tuple(
                "nccn",
                &[
                    Arg::Number(e.code() as u64),
                    Arg::Cstring(Some(e.message().unwrap_or(""))),
                    Arg::Cstring(Some(e.file())),
                    Arg::Number(e.line()),
                ],
            )?;
            link = e.cause();
        }
        self.end_list()?;
        self.end_list()
    }

    /// Read a response envelope. On success the params parse per fmt; on
    /// failure the marshalled cause chain comes back as the error, rebuilt
    /// from the end so its order is preserved.
    pub fn read_cmd_response(&mut self, fmt: &str) -> Result<Vec<Field>> {
        let item = self.read_item()?;
        let (status, params) = envelope_parts(&item)?;
        match status {
            "success" => parse_tuple(params, fmt),
            "failure" => Err(read_failure(params)?),
            _ => Err(Error::malformed(format!(
                "Unknown status '{}' in command response",
                status
            ))),
        }
    }
}

fn envelope_parts(item: &Item) -> Result<(&str, &[Item])> {
    if let Item::List(list) = item {
        if let [Item::Word(status), Item::List(params)] = list.as_slice() {
            return Ok((status.as_str(), params.as_slice()));
        }
    }
    Err(Error::malformed("Malformed network data"))
}

/// Rebuild an error chain from a failure envelope's params.
fn read_failure(params: &[Item]) -> Result<Error> {
    if params.is_empty() {
        return Err(Error::malformed("Empty error list"));
    }
    let mut err: Option<Error> = None;
    for elt in params.iter().rev() {
        let fields = match elt {
            Item::List(list) => parse_tuple(list, "nccn")?,
            _ => return Err(Error::malformed("Malformed error list")),
        };
        let (code, message, file, line) = match fields.as_slice() {
            [Field::Number(code), Field::Cstring(Some(message)), Field::Cstring(Some(file)), Field::Number(line)] => {
                (*code, message.clone(), file.clone(), *line)
            }
            _ => return Err(Error::malformed("Malformed error list")),
        };
        let code =
            u32::try_from(code).map_err(|_| Error::malformed("Malformed error list"))?;
        // An empty message marshals a nonexistent one.
        let message = if message.is_empty() {
            None
        } else {
            Some(message)
        };
        err = Some(Error::from_wire(code, message, file, line, err.take()));
    }
    Ok(err.unwrap())
}

/// Serve commands from the peer until a terminate entry runs, the peer
/// closes the connection, or a fatal error occurs. Command-error chains are
/// relayed as failure envelopes and the loop keeps going; the response (or
/// failure) reaches the wire no later than the next request's read.
pub fn handle_commands<C>(
    conn: &mut Connection,
    commands: &[CommandEntry<C>],
    context: &mut C,
) -> Result<()> {
    loop {
        let request = conn.read_tuple("wl")?;
        let (name, params) = match request.as_slice() {
            [Field::Word(Some(name)), Field::List(Some(params))] => (name.clone(), params.clone()),
            _ => return Err(Error::malformed("Malformed network data")),
        };
        debug!(command = %name, params = params.len(), "dispatching command");

        let entry = commands.iter().find(|c| c.name == name);
        let err = match entry {
            Some(entry) => (entry.handler)(conn, &params, context).err(),
            None => Some(Error::command_error(Error::new(
                ERR_UNKNOWN_CMD,
                format!("Unknown command '{}'", name),
            ))),
        };

        if let Some(err) = err {
            if err.is_command_error() {
                warn!(command = %name, error = %err.root_cause(), "command failed");
                conn.write_cmd_failure(err.cause().unwrap_or(&err))?;
            } else {
                return Err(err);
            }
        }

        if let Some(entry) = entry {
            if entry.terminate {
                conn.flush()?;
                return Ok(());
            }
        }
    }
}
