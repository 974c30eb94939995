//! Activity events, the unit of the append-only journal.
//!
//! Every signal that reaches the core, and every reaction the core derives
//! from it, is recorded as an immutable [`ActivityEvent`]. Payloads are typed
//! per event kind; nothing past the normalizer handles untyped JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{
  Result,
  stage::{Stage, TransitionCause},
};

// ─── Kinds ───────────────────────────────────────────────────────────────────

/// The discriminant stored in the journal's `kind` column.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
  SmsSent,
  WebhookAppointment,
  SiteVisitSession,
  ManualNote,
  StageChange,
  TagApplied,
  TagRemoved,
  OwnerLinked,
}

/// Which outbound SMS template was sent.
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
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SmsKind {
  /// Sent while the owner is on a live call with the operator.
  AnswerCall,
  /// Sent after leaving a voicemail.
  Voicemail,
  FollowUp,
}

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsSent {
  pub kind:    SmsKind,
  /// Voicemail sequence number, when the sender tracks one.
  pub attempt: Option<u8>,
  pub to:      Option<String>,
  pub body:    Option<String>,
}

/// Contact details supplied by the booking system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentContact {
  pub name:  Option<String>,
  pub email: Option<String>,
  pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentBooked {
  pub starts_at:   DateTime<Utc>,
  pub calendar_id: Option<String>,
  pub title:       Option<String>,
  pub booked_by:   Option<String>,
  pub contact:     AppointmentContact,
}

/// A summarised website session from the analytics beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitSession {
  pub session_id: String,
  pub started_at: DateTime<Utc>,
  pub ended_at:   DateTime<Utc>,
  pub page_views: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteAdded {
  pub note_id:    Uuid,
  pub content:    String,
  pub author:     String,
  pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChanged {
  pub from:  Stage,
  pub to:    Stage,
  pub cause: TransitionCause,
  pub actor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagGranted {
  pub tag_type:          String,
  pub is_auto_generated: bool,
  pub granted_by:        String,
  pub rule_id:           Option<String>,
  pub rule_version:      Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRevoked {
  pub tag_type:   String,
  pub removed_by: String,
  pub reason:     Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerLinked {
  pub owner_id: Uuid,
}

/// The typed payload of an event. The variant name is the [`EventKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
  SmsSent(SmsSent),
  WebhookAppointment(AppointmentBooked),
  SiteVisitSession(VisitSession),
  ManualNote(NoteAdded),
  StageChange(StageChanged),
  TagApplied(TagGranted),
  TagRemoved(TagRevoked),
  OwnerLinked(OwnerLinked),
}

impl EventPayload {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::SmsSent(_) => EventKind::SmsSent,
      Self::WebhookAppointment(_) => EventKind::WebhookAppointment,
      Self::SiteVisitSession(_) => EventKind::SiteVisitSession,
      Self::ManualNote(_) => EventKind::ManualNote,
      Self::StageChange(_) => EventKind::StageChange,
      Self::TagApplied(_) => EventKind::TagApplied,
      Self::TagRemoved(_) => EventKind::TagRemoved,
      Self::OwnerLinked(_) => EventKind::OwnerLinked,
    }
  }

  /// Serialise the inner payload (without the type tag) for storage.
  pub fn to_json(&self) -> Result<serde_json::Value> {
    let full = serde_json::to_value(self)?;
    Ok(full.get("data").cloned().unwrap_or(serde_json::Value::Null))
  }

  /// Rebuild a payload from its stored kind and JSON body.
  pub fn from_parts(kind: &str, data: serde_json::Value) -> Result<Self> {
    let wrapped = serde_json::json!({ "type": kind, "data": data });
    Ok(serde_json::from_value(wrapped)?)
  }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Input to [`crate::store::PipelineStore::append`]. The store assigns
/// `event_id`, `seq`, and `recorded_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
  /// Source-supplied idempotency key; unique across the journal.
  pub source_id:   String,
  /// Which producer delivered the signal (e.g. `sms`, `operator`).
  pub source:      String,
  /// When it happened in the real world.
  pub occurred_at: DateTime<Utc>,
  pub payload:     EventPayload,
}

/// An immutable journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
  pub event_id:    Uuid,
  pub lead_id:     Uuid,
  /// Journal position; replay order.
  pub seq:         i64,
  pub source_id:   String,
  pub source:      String,
  /// Causal time. May lag `recorded_at` for late-arriving signals.
  pub occurred_at: DateTime<Utc>,
  /// Server-assigned append time.
  pub recorded_at: DateTime<Utc>,
  pub payload:     EventPayload,
}

impl ActivityEvent {
  pub fn kind(&self) -> EventKind { self.payload.kind() }

  /// The real-world interval this event covers. Sessions span their visit;
  /// everything else is instantaneous at `occurred_at`.
  pub fn span(&self) -> (DateTime<Utc>, DateTime<Utc>) {
    match &self.payload {
      EventPayload::SiteVisitSession(s) => (s.started_at, s.ended_at),
      _ => (self.occurred_at, self.occurred_at),
    }
  }
}

/// One page of a lead's journal, ordered by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalPage {
  pub events:      Vec<ActivityEvent>,
  /// Pass back as `cursor` to continue; `None` once the journal is exhausted.
  pub next_cursor: Option<i64>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn payload_parts_round_trip_through_storage_form() {
    let payload = EventPayload::SmsSent(SmsSent {
      kind:    SmsKind::Voicemail,
      attempt: Some(2),
      to:      Some("2055005170".into()),
      body:    None,
    });
    let kind: &'static str = payload.kind().into();
    assert_eq!(kind, "sms_sent");

    let data = payload.to_json().unwrap();
    assert_eq!(data["kind"], "voicemail");
    assert_eq!(EventPayload::from_parts(kind, data).unwrap(), payload);
  }

  #[test]
  fn unknown_kind_fails_to_decode() {
    assert!(EventPayload::from_parts("fax_sent", serde_json::json!({})).is_err());
  }
}
