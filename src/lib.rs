pub mod riffle;
#[cfg(test)]
mod tests;

pub use crate::riffle::*;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::riffle::common::Result;
use crate::riffle::config::{load_config, Settings};

pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than max_level
        // will be written to stdout.
        .with_max_level(max_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");
}

/// Load the configuration settings from riffle.yaml
/// See riffle::config::load_config for more info.
pub fn init_settings() -> Result<&'static Settings> {
    load_config("riffle.yaml")
}
