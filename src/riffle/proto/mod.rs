mod connection;
mod cram;
mod dispatch;
mod item;
mod tuple;

pub use self::connection::{
    BlockHandler, ConnOptions, Connection, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_LIST_DEPTH,
};
pub use self::cram::{cram_client, cram_server};
pub use self::dispatch::{handle_commands, CommandEntry};
pub use self::item::Item;
pub use self::tuple::{parse_tuple, Arg, Field};
