mod errors;
mod util;

pub use self::errors::{
    Error, Result, ERR_CMD, ERR_CONNECTION_CLOSED, ERR_GENERAL, ERR_IO, ERR_MALFORMED_DATA,
    ERR_NOT_AUTHORIZED, ERR_UNKNOWN_CMD,
};
pub use self::util::hostname;
