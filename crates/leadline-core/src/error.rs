//! Error types for `leadline-core`.

use thiserror::Error;
use uuid::Uuid;

use crate::{
  evolution::Phase,
  stage::{Stage, TransitionCause},
};

#[derive(Debug, Error)]
pub enum Error {
  // ── Ingestion ────────────────────────────────────────────────────────────
  #[error("unrecognized signal source: {0:?}")]
  UnrecognizedSource(String),

  #[error("malformed {origin} payload: {reason}")]
  MalformedPayload { origin: String, reason: String },

  /// An event with this idempotency key is already in the journal.
  #[error("duplicate event {source_id:?} (already stored as {existing})")]
  DuplicateEvent { source_id: String, existing: Uuid },

  #[error("unknown tag type: {0:?}")]
  UnknownTag(String),

  // ── Leads ────────────────────────────────────────────────────────────────
  #[error("lead not found: {0}")]
  LeadNotFound(Uuid),

  #[error("company {0} has no open lead")]
  NoOpenLead(Uuid),

  #[error("no open lead matches contact (email: {email:?}, phone: {phone:?})")]
  NoMatchingLead {
    email: Option<String>,
    phone: Option<String>,
  },

  #[error("illegal stage transition {from} -> {to} (cause: {cause})")]
  IllegalTransition {
    from:  Stage,
    to:    Stage,
    cause: TransitionCause,
  },

  #[error("dead letter not found: {0}")]
  DeadLetterNotFound(Uuid),

  // ── Configuration ────────────────────────────────────────────────────────
  #[error("rule configuration error: {0}")]
  RuleConfiguration(String),

  // ── Schema evolution ─────────────────────────────────────────────────────
  #[error(
    "migration {migration} failed {phase} verification: expected {expected}, got {actual}"
  )]
  MigrationVerificationFailure {
    migration: String,
    phase:     Phase,
    expected:  String,
    actual:    String,
  },

  #[error("migration {migration} is halted after a failed {phase}; acknowledge it first")]
  MigrationHalted { migration: String, phase: Phase },

  #[error("migration {0} has no phase left to run")]
  MigrationComplete(String),

  #[error("migration {migration} cannot run {requested}; the next phase is {next}")]
  PhaseOutOfOrder {
    migration: String,
    requested: Phase,
    next:      Phase,
  },

  #[error("migration {0} has no completed phase to roll back")]
  NothingToRollBack(String),

  #[error("migration {0} has nothing to acknowledge")]
  NothingToAcknowledge(String),

  #[error(
    "migration {migration} cannot contract: cutover soak incomplete ({remaining_secs}s remaining, {errors} errors)"
  )]
  SoakIncomplete {
    migration:      String,
    remaining_secs: i64,
    errors:         u32,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ─── Backend error bridging ──────────────────────────────────────────────────

/// Implemented by storage-backend errors so that domain failures raised inside
/// a backend (duplicate events, missing leads) can be recovered as [`Error`].
pub trait IntoDomainError: Sized {
  /// Split off the domain error, or hand back `self` if this is a pure
  /// backend failure.
  fn into_domain(self) -> Result<Error, Self>;
}

/// An error from a service that drives a storage backend.
#[derive(Debug, Error)]
pub enum ServiceError {
  #[error(transparent)]
  Domain(#[from] Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ServiceError {
  /// Convert a backend error, surfacing any domain error it carries.
  pub fn from_store<E>(err: E) -> Self
  where
    E: std::error::Error + IntoDomainError + Send + Sync + 'static,
  {
    match err.into_domain() {
      Ok(domain) => Self::Domain(domain),
      Err(other) => Self::Store(Box::new(other)),
    }
  }

  /// The domain error, if this is one.
  pub fn domain(&self) -> Option<&Error> {
    match self {
      Self::Domain(e) => Some(e),
      Self::Store(_) => None,
    }
  }
}
