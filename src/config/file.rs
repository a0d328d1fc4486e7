//! Locating and reading the configuration file
//!
//! A path given on the command line wins, then `$SSHPROXY_CONFIG`, then the
//! first existing file among the per-user and system-wide locations. With
//! none of them the built-in defaults apply, which is enough when the
//! account service runs on its default address.

use super::Config;
use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SSHPROXY_CONFIG";

const FILE_NAME: &str = "sshproxy.toml";

/// How the configuration file was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// `--config` on the command line
    Argument,
    /// `$SSHPROXY_CONFIG`
    Environment,
    /// The user's configuration directory
    User,
    /// `/etc/sshproxy`
    System,
    /// No file; built-in defaults
    Defaults,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Argument => "command line",
            Source::Environment => CONFIG_ENV,
            Source::User => "user config dir",
            Source::System => "system",
            Source::Defaults => "defaults",
        })
    }
}

/// A location the configuration may be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub source: Source,
}

/// Parsed configuration and where it came from
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// `None` when the defaults are in use
    pub path: Option<PathBuf>,
    pub source: Source,
    pub config: Config,
}

/// Locations searched when no path is given, most specific first
pub fn candidates() -> Vec<Candidate> {
    let mut found = Vec::new();
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        found.push(Candidate {
            path: PathBuf::from(path),
            source: Source::Environment,
        });
    }
    if let Some(dir) = dirs::config_dir() {
        found.push(Candidate {
            path: dir.join("sshproxy").join(FILE_NAME),
            source: Source::User,
        });
    }
    if cfg!(unix) {
        found.push(Candidate {
            path: Path::new("/etc/sshproxy").join(FILE_NAME),
            source: Source::System,
        });
    }
    found
}

/// First candidate that exists
///
/// `$SSHPROXY_CONFIG` is returned even when missing, so a typo surfaces as
/// a read error instead of silently falling through.
pub fn discover() -> Option<Candidate> {
    candidates()
        .into_iter()
        .find(|c| c.source == Source::Environment || c.path.is_file())
}

/// Read and parse one configuration file
pub fn parse(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Load `explicit` or the discovered file, falling back to the defaults
pub fn load(explicit: Option<&Path>) -> Result<ConfigFile> {
    let candidate = match explicit {
        Some(path) => Some(Candidate {
            path: path.to_path_buf(),
            source: Source::Argument,
        }),
        None => discover(),
    };
    let Some(Candidate { path, source }) = candidate else {
        debug!("no configuration file, using defaults");
        return Ok(ConfigFile {
            path: None,
            source: Source::Defaults,
            config: Config::default(),
        });
    };
    let config = parse(&path)?;
    info!(path = %path.display(), %source, "configuration file read");
    Ok(ConfigFile {
        path: Some(path),
        source,
        config,
    })
}
