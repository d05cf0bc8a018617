use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Internal,
    Usage,
    InvalidInput,
    NotAuthenticated,
    UnknownContainer,
    NetworkFailure,
    Server,
    PartialFailure,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "Internal",
            ErrorKind::Usage => "Usage",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::NotAuthenticated => "NotAuthenticated",
            ErrorKind::UnknownContainer => "UnknownContainer",
            ErrorKind::NetworkFailure => "NetworkFailure",
            ErrorKind::Server => "Server",
            ErrorKind::PartialFailure => "PartialFailure",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

/// Per-item failures of a batch, keyed by item identifier.
pub type PartialErrors = BTreeMap<String, Error>;

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    server_code: Option<String>,
    partial_errors: Option<PartialErrors>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            server_code: None,
            partial_errors: None,
            source: None,
        }
    }

    /// Aggregate error for a batch where only some items failed.
    pub fn partial(errors: PartialErrors) -> Self {
        let count = errors.len();
        Self::new(ErrorKind::PartialFailure)
            .with_message(format!("{count} item(s) failed"))
            .with_partial_errors(errors)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn server_code(&self) -> Option<&str> {
        self.server_code.as_deref()
    }

    pub fn partial_errors(&self) -> Option<&PartialErrors> {
        self.partial_errors.as_ref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_server_code(mut self, code: impl Into<String>) -> Self {
        self.server_code = Some(code.into());
        self
    }

    pub fn with_partial_errors(mut self, errors: PartialErrors) -> Self {
        self.partial_errors = Some(errors);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(code) = &self.server_code {
            write!(f, " (server code: {code})")?;
        }
        if let Some(errors) = &self.partial_errors {
            let ids: Vec<&str> = errors.keys().map(String::as_str).collect();
            write!(f, " (failed items: {})", ids.join(", "))?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::InvalidInput => 3,
        ErrorKind::NotAuthenticated => 4,
        ErrorKind::UnknownContainer => 5,
        ErrorKind::NetworkFailure => 6,
        ErrorKind::Server => 7,
        ErrorKind::PartialFailure => 8,
        ErrorKind::Cancelled => 9,
    }
}
