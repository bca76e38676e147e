use std::fmt::{self, Debug, Display};
use std::net::AddrParseError;
use std::panic::Location;
use std::string::FromUtf8Error;
use std::{io, result, str};

// Error codes carried in failure envelopes on the wire. The block starts
// well clear of OS errno space so peers can tell the two apart.
pub const ERR_GENERAL: u32 = 200_000;
/// Reserved marker code: the cause chain below this error is an application
/// failure to be relayed to the peer, not a fatal protocol error.
pub const ERR_CMD: u32 = 210_000;
pub const ERR_UNKNOWN_CMD: u32 = 210_001;
pub const ERR_CONNECTION_CLOSED: u32 = 210_002;
pub const ERR_IO: u32 = 210_003;
pub const ERR_MALFORMED_DATA: u32 = 210_004;
pub const ERR_NOT_AUTHORIZED: u32 = 210_005;

#[derive(PartialEq, Eq)]
pub struct Error {
    err: Box<ErrorData>, // boxed so Result<T> stays a single word
}

#[derive(Debug, PartialEq, Eq)]
struct ErrorData {
    code: u32,
    message: Option<String>,
    file: String,
    line: u64,
    cause: Option<Error>,
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    #[track_caller]
    pub fn new<S: ToString>(code: u32, msg: S) -> Self {
        Self::build(code, Some(msg.to_string()), None)
    }

    #[track_caller]
    pub fn malformed<S: ToString>(msg: S) -> Self {
        Self::build(ERR_MALFORMED_DATA, Some(msg.to_string()), None)
    }

    #[track_caller]
    pub fn closed() -> Self {
        Self::build(
            ERR_CONNECTION_CLOSED,
            Some("Connection closed unexpectedly".to_string()),
            None,
        )
    }

    #[track_caller]
    pub fn not_authorized<S: ToString>(msg: S) -> Self {
        Self::build(ERR_NOT_AUTHORIZED, Some(msg.to_string()), None)
    }

    /// Mark an application failure so the dispatch loop relays it to the
    /// peer as a failure envelope instead of tearing the connection down.
    #[track_caller]
    pub fn command_error(cause: Error) -> Self {
        Self::build(ERR_CMD, None, Some(cause))
    }

    #[track_caller]
    pub fn wrap<S: ToString>(code: u32, msg: S, cause: Error) -> Self {
        Self::build(code, Some(msg.to_string()), Some(cause))
    }

    #[track_caller]
    fn build(code: u32, message: Option<String>, cause: Option<Error>) -> Self {
        let loc = Location::caller();
        Error {
            err: Box::new(ErrorData {
                code,
                message,
                file: loc.file().to_string(),
                line: loc.line() as u64,
                cause,
            }),
        }
    }

    /// Reassemble an error received in a failure envelope. file and line
    /// describe the failure site on the peer, not on this host.
    pub fn from_wire(
        code: u32,
        message: Option<String>,
        file: String,
        line: u64,
        cause: Option<Error>,
    ) -> Self {
        Error {
            err: Box::new(ErrorData {
                code,
                message,
                file,
                line,
                cause,
            }),
        }
    }

    pub fn code(&self) -> u32 {
        self.err.code
    }

    pub fn message(&self) -> Option<&str> {
        self.err.message.as_deref()
    }

    pub fn file(&self) -> &str {
        &self.err.file
    }

    pub fn line(&self) -> u64 {
        self.err.line
    }

    pub fn cause(&self) -> Option<&Error> {
        self.err.cause.as_ref()
    }

    pub fn is_command_error(&self) -> bool {
        self.err.code == ERR_CMD
    }

    /// The last link of the cause chain, i.e. the error created first.
    pub fn root_cause(&self) -> &Error {
        let mut err = self;
        while let Some(cause) = err.cause() {
            err = cause;
        }
        err
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::new(ERR_IO, err)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(err: str::Utf8Error) -> Self {
        Error::malformed(err)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(err: FromUtf8Error) -> Self {
        Error::malformed(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::new(ERR_GENERAL, err)
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(ERR_GENERAL, err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::new(ERR_GENERAL, err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.err.message {
            Some(msg) => f.write_str(msg),
            None => write!(f, "error code {}", self.err.code),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.err, f)
    }
}
