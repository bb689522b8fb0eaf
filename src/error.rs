use std::fmt;

/// Crate-wide error, formatted to match the fatal-path log line:
/// `nsenter: <context>: <cause>`.
#[derive(Debug)]
pub struct BootstrapError {
    context: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BootstrapError {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            source: None,
        }
    }

    pub fn with_source(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            context: context.into(),
            source: Some(source.into()),
        }
    }
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "nsenter: {}: {}", self.context, src),
            None => write!(f, "nsenter: {}", self.context),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|v| v as _)
    }
}

pub type Error = BootstrapError;
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for BootstrapError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source("io error", err)
    }
}

impl From<nix::errno::Errno> for BootstrapError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::with_source("syscall failed", std::io::Error::from(err))
    }
}

impl From<std::string::FromUtf8Error> for BootstrapError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::with_source("invalid utf-8", err)
    }
}

impl From<std::ffi::NulError> for BootstrapError {
    fn from(err: std::ffi::NulError) -> Self {
        Self::with_source("invalid c string", err)
    }
}

impl From<serde_json::Error> for BootstrapError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("json error", err)
    }
}

impl From<String> for BootstrapError {
    fn from(context: String) -> Self {
        Self::new(context)
    }
}

impl From<&str> for BootstrapError {
    fn from(context: &str) -> Self {
        Self::new(context.to_owned())
    }
}

/// Attaches context to a fallible operation, keeping the original error as `source`.
pub(crate) trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| BootstrapError::with_source(context, err))
    }
}
