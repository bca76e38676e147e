mod config;

pub use self::config::{conf, load_config, Settings};
