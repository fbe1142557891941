use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to invalid state or arguments within duplex-transport
    Validation,
    /// Internal error from dependencies
    Internal,
    /// Error related to the WebSocket connection
    Transport,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    #[must_use]
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Self::with_source(Kind::Validation, err)
    }
}

/// Transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// The transport has been destroyed and no longer accepts commands
    Destroyed,
    /// The dial target could not be built into a valid URL
    InvalidUrl(url::ParseError),
    /// No candidate endpoints were supplied
    NoEndpoints,
    /// Event subscriber lagged and missed messages
    Lagged {
        /// Number of events that were missed
        count: u64,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroyed => write!(f, "transport destroyed"),
            Self::InvalidUrl(e) => write!(f, "invalid dial target: {e}"),
            Self::NoEndpoints => write!(f, "no candidate endpoints configured"),
            Self::Lagged { count } => write!(f, "event subscriber lagged, missed {count} events"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::InvalidUrl(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::with_source(Kind::Transport, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::with_source(Kind::Validation, TransportError::InvalidUrl(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_source() {
        let err = Error::validation("empty endpoint list");
        assert_eq!(err.kind(), Kind::Validation);
        assert!(err.to_string().contains("empty endpoint list"), "{err}");
    }

    #[test]
    fn downcast_recovers_transport_error() {
        let err: Error = TransportError::Destroyed.into();
        assert_eq!(err.kind(), Kind::Transport);
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::Destroyed)
        ));
    }
}
