//! Control-plane backends

pub mod http;
pub mod local;

use anyhow::Result;
use converge::CloudClient;
use std::fmt;
use std::path::PathBuf;

pub use http::HttpCloud;
pub use local::LocalCloud;

use crate::config;

/// Where resources are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Simulated control plane persisted in a JSON file
    Local(PathBuf),
    /// ARM-style REST endpoint
    Http(String),
}

impl Backend {
    /// `--endpoint` wins; otherwise the state file (or its default)
    pub fn select(endpoint: Option<&str>, state: Option<&str>) -> Result<Self> {
        if let Some(url) = endpoint {
            return Ok(Self::Http(url.to_string()));
        }
        let path = match state {
            Some(p) => config::expand_path(p),
            None => config::default_state_path()?,
        };
        Ok(Self::Local(path))
    }

    pub fn connect(&self) -> Result<Box<dyn CloudClient>> {
        log::debug!("Connecting to {self}");
        Ok(match self {
            Self::Local(path) => Box::new(LocalCloud::open(path)?),
            Self::Http(url) => Box::new(HttpCloud::from_env(url.as_str())),
        })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "local state {}", path.display()),
            Self::Http(url) => write!(f, "{url}"),
        }
    }
}
