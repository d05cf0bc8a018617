//! Purpose: Tunables for a mediator and the on-disk container list.
//! Exports: `MediatorConfig`, `ContainerFile`.
//! Role: Validated before any queue or channel is built.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::session::ContainerConfig;

pub const DEFAULT_OUTER_CONCURRENCY: usize = 1;
pub const DEFAULT_INNER_CONCURRENCY: usize = 4;
pub const DEFAULT_EVENT_BUFFER: usize = 16;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediatorConfig {
    /// Client operations allowed to execute at once.
    pub outer_concurrency: usize,
    /// Backend calls allowed in flight at once.
    pub inner_concurrency: usize,
    /// Account-status events retained for slow subscribers.
    pub event_buffer: usize,
    pub request_timeout: Duration,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            outer_concurrency: DEFAULT_OUTER_CONCURRENCY,
            inner_concurrency: DEFAULT_INNER_CONCURRENCY,
            event_buffer: DEFAULT_EVENT_BUFFER,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl MediatorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.outer_concurrency == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("outer concurrency must be greater than zero")
                .with_hint("Use 1 to run client operations one at a time."));
        }
        if self.inner_concurrency == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("inner concurrency must be greater than zero")
                .with_hint("Use a positive value like 4."));
        }
        if self.inner_concurrency < self.outer_concurrency {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("inner concurrency must be at least the outer concurrency")
                .with_hint("Raise inner concurrency or lower outer concurrency."));
        }
        if self.event_buffer == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("event buffer must be greater than zero")
                .with_hint("Use a positive value like 16."));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("request timeout must be greater than zero")
                .with_hint("Use a positive value like 30s."));
        }
        Ok(())
    }
}

/// `{"containers": [...]}` file listing the containers a client talks to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerFile {
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
}

impl ContainerFile {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("failed to read config {}", path.display()))
                .with_hint("Pass an existing file with --config.")
                .with_source(err)
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let file: ContainerFile = serde_json::from_str(raw).map_err(|err| {
            Error::new(ErrorKind::InvalidInput)
                .with_message("invalid container config")
                .with_hint("Expected {\"containers\": [{\"containerIdentifier\": ..., \"apiToken\": ...}]}.")
                .with_source(err)
        })?;
        Ok(file)
    }
}
