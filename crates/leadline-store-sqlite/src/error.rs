//! Error type for `leadline-store-sqlite`.

use leadline_core::IntoDomainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] leadline_core::Error),

  #[error("database error: {0}")]
  Database(tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  /// A stored value that does not decode (bad timestamp, unknown enum tag).
  #[error("decode error: {0}")]
  Decode(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised inside a connection closure travel back boxed in
/// `tokio_rusqlite::Error::Other`; unwrap them here so domain failures keep
/// their type.
impl From<tokio_rusqlite::Error> for Error {
  fn from(err: tokio_rusqlite::Error) -> Self {
    match err {
      tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<Error>() {
        Ok(ours) => *ours,
        Err(other) => match other.downcast::<leadline_core::Error>() {
          Ok(core) => Self::Core(*core),
          Err(other) => Self::Database(tokio_rusqlite::Error::Other(other)),
        },
      },
      tokio_rusqlite::Error::Rusqlite(e) => Self::Sqlite(e),
      other => Self::Database(other),
    }
  }
}

impl From<Error> for tokio_rusqlite::Error {
  fn from(err: Error) -> Self { tokio_rusqlite::Error::Other(Box::new(err)) }
}

impl IntoDomainError for Error {
  fn into_domain(self) -> Result<leadline_core::Error, Self> {
    match self {
      Self::Core(e) => Ok(e),
      other => Err(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  use super::*;

  #[test]
  fn domain_errors_survive_the_connection_boundary() {
    let boxed: tokio_rusqlite::Error =
      Error::Core(leadline_core::Error::LeadNotFound(Uuid::nil())).into();
    let back = Error::from(boxed);
    assert!(matches!(
      back.into_domain(),
      Ok(leadline_core::Error::LeadNotFound(_))
    ));
  }
}
