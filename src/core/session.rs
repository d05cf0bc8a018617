//! Purpose: Hold the session token and registered container configurations.
//! Exports: `SessionState`, `SessionSnapshot`, `ContainerConfig`, `Environment`.
//! Role: Shared, read-mostly state consulted by every operation dispatch.
//! Invariants: Readers get an immutable snapshot; token and container table never tear.
//! Invariants: A token is set once per authentication cycle; clear before setting anew.
//! Invariants: Container configs are read-only after registration; ids are unique.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub container_identifier: String,
    #[serde(default)]
    pub environment: Environment,
    pub api_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ContainerConfig {
    pub fn new(container_identifier: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            container_identifier: container_identifier.into(),
            environment: Environment::Development,
            api_token: api_token.into(),
            name: None,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionSnapshot {
    token: Option<Arc<str>>,
    containers: Arc<Vec<Arc<ContainerConfig>>>,
}

impl SessionSnapshot {
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn require_token(&self) -> Result<Arc<str>, Error> {
        self.token.clone().ok_or_else(|| {
            Error::new(ErrorKind::NotAuthenticated)
                .with_message("no session token is set")
                .with_hint("Authenticate and supply a session token before submitting work.")
        })
    }

    pub fn container(&self, container_id: &str) -> Result<Arc<ContainerConfig>, Error> {
        self.containers
            .iter()
            .find(|config| config.container_identifier == container_id)
            .cloned()
            .ok_or_else(|| unknown_container(container_id))
    }

    /// Registered containers in registration order.
    pub fn containers(&self) -> &[Arc<ContainerConfig>] {
        &self.containers
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    current: Mutex<Arc<SessionSnapshot>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_session_token(&self, token: impl Into<String>) -> Result<(), Error> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput).with_message("session token is empty"));
        }
        self.update(|snapshot| {
            if let Some(existing) = snapshot.token.as_deref() {
                if existing == token {
                    return Ok(());
                }
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("a session token is already set")
                    .with_hint("Clear the current session before authenticating again."));
            }
            snapshot.token = Some(Arc::from(token.as_str()));
            Ok(())
        })
    }

    pub fn clear_session_token(&self) {
        let _ = self.update(|snapshot| {
            snapshot.token = None;
            Ok(())
        });
    }

    pub fn register_container(&self, config: ContainerConfig) -> Result<(), Error> {
        if config.container_identifier.is_empty() {
            return Err(
                Error::new(ErrorKind::InvalidInput).with_message("container identifier is empty")
            );
        }
        self.update(|snapshot| {
            if snapshot
                .containers
                .iter()
                .any(|existing| existing.container_identifier == config.container_identifier)
            {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "container {} is already registered",
                    config.container_identifier
                )));
            }
            let mut containers = snapshot.containers.as_ref().clone();
            containers.push(Arc::new(config.clone()));
            snapshot.containers = Arc::new(containers);
            Ok(())
        })
    }

    pub fn info_for_container(&self, container_id: &str) -> Result<Arc<ContainerConfig>, Error> {
        self.snapshot().container(container_id)
    }

    // Writers copy the current snapshot, edit the copy, and swap it in under the lock.
    fn update<F>(&self, edit: F) -> Result<(), Error>
    where
        F: FnOnce(&mut SessionSnapshot) -> Result<(), Error>,
    {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = current.as_ref().clone();
        edit(&mut next)?;
        *current = Arc::new(next);
        Ok(())
    }
}

pub(crate) fn unknown_container(container_id: &str) -> Error {
    Error::new(ErrorKind::UnknownContainer)
        .with_message(format!("container {container_id} is not registered"))
        .with_hint("Register the container configuration before submitting operations.")
}
