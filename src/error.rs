//! Crate-level error roll-up.
//!
//! Each capability owns its error enum; this is a thin wrapper so callers
//! holding a `wayline::Error` can still classify retryability.

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::queries::QueryError;
use crate::registry::RegistryError;
use crate::transport::TransportError;

/// Whether retrying the failed operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs or state.
    Permanent,
    /// Retry may help (transient contention or outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Database(_) => Transience::Permanent,
            Error::Registry(RegistryError::Corrupt { .. }) => Transience::Permanent,
            Error::Registry(RegistryError::Unavailable(_)) => Transience::Unknown,
            Error::Query(_) => Transience::Permanent,
            Error::Transport(TransportError::ShuttingDown) => Transience::Permanent,
            Error::Transport(TransportError::Unavailable(_)) => Transience::Retryable,
            Error::Config(_) => Transience::Permanent,
        }
    }
}
