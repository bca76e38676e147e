use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use fnv::FnvHashMap;
use serde::Deserialize;
use tracing::{debug, info};

use crate::riffle::common::{Error, Result};
use crate::riffle::proto::{ConnOptions, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_LIST_DEPTH};

#[derive(Deserialize)]
pub struct Settings {
    /// config_path is the path of the loaded config file
    #[serde(skip)]
    config_path: PathBuf,
    /// host to listen on, defaults to 0.0.0.0
    #[serde(default = "default_host")]
    pub host: String,
    /// port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// read_buffer_size is the size of the per-connection (user-space) read buffer
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    /// write_buffer_size is the size of the per-connection (user-space) write buffer
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    /// max_list_depth bounds how deeply the peer may nest lists
    #[serde(default = "default_max_list_depth")]
    pub max_list_depth: usize,
    /// idle_timeout_seconds closes client connections that send nothing for this long. 0 is disabled.
    #[serde(default)]
    pub idle_timeout_seconds: u32,
    /// users maps user names to shared secrets for CRAM-MD5. Empty disables authentication.
    #[serde(default)]
    pub users: FnvHashMap<String, String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
const fn default_port() -> u16 {
    3690
}
const fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
const fn default_max_list_depth() -> usize {
    DEFAULT_MAX_LIST_DEPTH
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            config_path: PathBuf::new(),
            host: default_host(),
            port: default_port(),
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            max_list_depth: default_max_list_depth(),
            idle_timeout_seconds: 0,
            users: FnvHashMap::default(),
        }
    }
}

impl Settings {
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn load(&mut self, path: PathBuf) -> Result<()> {
        self.config_path = path;
        if self.read_buffer_size < DEFAULT_BUFFER_SIZE {
            self.read_buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.write_buffer_size < DEFAULT_BUFFER_SIZE {
            self.write_buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.read_buffer_size > 1024 * 1024 || self.write_buffer_size > 1024 * 1024 {
            return Err(Error::from("connection buffers cannot be > 1MB"));
        }
        if self.max_list_depth < DEFAULT_MAX_LIST_DEPTH {
            self.max_list_depth = DEFAULT_MAX_LIST_DEPTH;
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn conn_options(&self) -> ConnOptions {
        ConnOptions {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            max_list_depth: self.max_list_depth,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds as u64))
        }
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

pub fn conf() -> &'static Settings {
    SETTINGS.get().expect("config is not loaded")
}

/// Locate, parse and validate the config file, then install it globally.
pub fn load_config(config_name: &str) -> Result<&'static Settings> {
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy(), "found config file");
    let file = File::open(&config_path)?;
    let mut settings: Settings = serde_yaml::from_reader(file)?;
    settings.load(config_path)?;
    if SETTINGS.set(settings).is_err() {
        return Err(Error::from("config is already loaded"));
    }
    Ok(conf())
}

/// Resolve the config file. An explicit path on the command line always
/// wins (and must exist); otherwise the first hit among the candidate
/// locations is used: the working directory and its ancestors, then the
/// per-user locations, then the system-wide one.
fn find_config_file(config_name: &str) -> Result<PathBuf> {
    if let Some(arg) = env::args().nth(1) {
        let path = PathBuf::from(arg);
        if !path.exists() {
            return Err(Error::from(
                format!(
                    "config file {} does not exist",
                    path.to_string_lossy()
                )
                .as_str(),
            ));
        }
        return Ok(path);
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        candidates.extend(cwd.ancestors().map(|dir| dir.join(config_name)));
    }
    if let Ok(home) = env::var("HOME") {
        let home = Path::new(&home);
        candidates.push(home.join(".config/riffle").join(config_name));
        candidates.push(home.join(format!(".{}", config_name)));
    }
    candidates.push(Path::new("/etc/riffle").join(config_name));

    for candidate in candidates {
        debug!(path = %candidate.to_string_lossy(), "trying config location");
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::from(
        format!(
            "no {} found in any config location",
            config_name
        )
        .as_str(),
    ))
}
