//! Rejected signals and commands, held for an operator to look at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{Error, normalize::RawSignal, pipeline::StageCommand};

/// Why something was dead-lettered. Stored as its snake_case string.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectionCode {
  UnrecognizedSource,
  MalformedPayload,
  UnknownTag,
  UnresolvedLead,
  IllegalTransition,
  Other,
}

impl RejectionCode {
  pub fn for_error(err: &Error) -> Self {
    match err {
      Error::UnrecognizedSource(_) => Self::UnrecognizedSource,
      Error::MalformedPayload { .. } => Self::MalformedPayload,
      Error::UnknownTag(_) => Self::UnknownTag,
      Error::LeadNotFound(_)
      | Error::NoOpenLead(_)
      | Error::NoMatchingLead { .. } => Self::UnresolvedLead,
      Error::IllegalTransition { .. } => Self::IllegalTransition,
      _ => Self::Other,
    }
  }
}

/// What was rejected, kept verbatim so it can be replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeadLetterPayload {
  Signal(RawSignal),
  /// A stage change that the controller refused. Automatic transitions are
  /// recorded here too, as the command they would have been.
  StageCommand(StageCommand),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeadLetter {
  pub lead_id:   Option<Uuid>,
  pub source_id: Option<String>,
  pub code:      RejectionCode,
  pub detail:    String,
  pub raw:       DeadLetterPayload,
}

impl NewDeadLetter {
  pub fn signal(signal: &RawSignal, lead_id: Option<Uuid>, err: &Error) -> Self {
    Self {
      lead_id,
      source_id: Some(signal.source_id.clone()),
      code: RejectionCode::for_error(err),
      detail: err.to_string(),
      raw: DeadLetterPayload::Signal(signal.clone()),
    }
  }

  pub fn command(
    command: &StageCommand,
    source_id: Option<String>,
    err: &Error,
  ) -> Self {
    Self {
      lead_id: Some(command.lead_id),
      source_id,
      code: RejectionCode::for_error(err),
      detail: err.to_string(),
      raw: DeadLetterPayload::StageCommand(command.clone()),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
  pub dead_letter_id:  Uuid,
  pub lead_id:         Option<Uuid>,
  pub source_id:       Option<String>,
  pub code:            RejectionCode,
  pub detail:          String,
  pub raw:             DeadLetterPayload,
  pub recorded_at:     DateTime<Utc>,
  pub acknowledged_at: Option<DateTime<Utc>>,
  pub acknowledged_by: Option<String>,
}

impl DeadLetter {
  pub fn is_acknowledged(&self) -> bool { self.acknowledged_at.is_some() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stage::{Stage, TransitionCause};

  #[test]
  fn codes_follow_the_error() {
    let illegal = Error::IllegalTransition {
      from:  Stage::New,
      to:    Stage::Won,
      cause: TransitionCause::Operator,
    };
    assert_eq!(
      RejectionCode::for_error(&illegal),
      RejectionCode::IllegalTransition
    );
    assert_eq!(
      RejectionCode::for_error(&Error::NoOpenLead(Uuid::nil())),
      RejectionCode::UnresolvedLead
    );
    let code: &'static str = RejectionCode::MalformedPayload.into();
    assert_eq!(code, "malformed_payload");
  }
}
