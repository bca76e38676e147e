pub mod common;
pub mod config;
pub mod proto;
pub mod server;

pub use common::{Error, Result};
