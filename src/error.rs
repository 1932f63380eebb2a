//! Errors surfaced at the edge of the library.

use std::fmt;

/// Errors returned by [`crate::Session`] and the model facade.
///
/// Internal loaders work with [`anyhow::Result`]; a load failure is wrapped
/// as [`LmError::FatalConfiguration`] once it reaches the caller. Nothing
/// downstream of a broken model is meaningful, so callers should stop rather
/// than retry.
#[derive(Debug)]
pub enum LmError {
    /// The model file could not be read as any supported representation.
    FatalConfiguration(anyhow::Error),
    /// A caller broke the calling contract (stale handle, bad id, ...).
    InvalidArgument(String),
}

impl LmError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl fmt::Display for LmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FatalConfiguration(e) => write!(f, "unusable language model: {e:#}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for LmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FatalConfiguration(e) => Some(e.as_ref()),
            Self::InvalidArgument(_) => None,
        }
    }
}

impl From<anyhow::Error> for LmError {
    fn from(e: anyhow::Error) -> Self {
        Self::FatalConfiguration(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn it_formats_errors() {
        let e = LmError::invalid("chart handle 7 out of range");
        assert_eq!("invalid argument: chart handle 7 out of range", e.to_string());
        let e = LmError::from(anyhow!("bad magic").context("loading lm.bin"));
        assert_eq!("unusable language model: loading lm.bin: bad magic", e.to_string());
        assert!(std::error::Error::source(&e).is_some());
    }
}
