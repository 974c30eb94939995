//! The event normalizer. The only place untyped signal payloads are read.
//!
//! [`normalize`] is a pure function from a [`RawSignal`] to the events it
//! describes, so a source can retry delivery freely. Appending is the
//! journal's job.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
  Error, Result,
  event::{
    AppointmentBooked, AppointmentContact, EventKind, EventPayload, NewEvent,
    NoteAdded, SmsKind, SmsSent, TagGranted, TagRevoked, VisitSession,
  },
};

pub const SOURCE_SMS: &str = "sms";
pub const SOURCE_APPOINTMENT: &str = "appointment_webhook";
pub const SOURCE_ANALYTICS: &str = "analytics";
pub const SOURCE_OPERATOR: &str = "operator";

// ─── Inbound contract ────────────────────────────────────────────────────────

/// How a signal identifies the lead it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum LeadRef {
  Lead { lead_id: Uuid },
  /// The company's most recent open lead.
  Company { company_id: Uuid },
  /// The open lead of whichever company's owner matches.
  Contact {
    email: Option<String>,
    phone: Option<String>,
  },
}

/// A signal as delivered by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignal {
  /// Idempotency key; redelivery with the same key has no further effect.
  pub source_id:   String,
  pub source:      String,
  pub lead:        LeadRef,
  /// Optional declaration of the event kind; checked when present.
  #[serde(default)]
  pub event_type:  Option<String>,
  #[serde(default)]
  pub occurred_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub payload:     serde_json::Value,
}

/// Turn a raw signal into journal-ready events.
pub fn normalize(signal: &RawSignal) -> Result<Vec<NewEvent>> {
  if signal.source_id.trim().is_empty() {
    return Err(malformed(&signal.source, "source_id is empty"));
  }
  if let Some(declared) = &signal.event_type
    && let Ok(kind) = declared.parse::<EventKind>()
    && !is_signal_kind(kind)
  {
    return Err(malformed(
      &signal.source,
      format!("{kind} entries are derived and cannot be submitted"),
    ));
  }

  let events = match signal.source.as_str() {
    SOURCE_SMS => vec![sms(signal)?],
    SOURCE_APPOINTMENT => vec![appointment(signal)?],
    SOURCE_ANALYTICS => analytics(signal)?,
    SOURCE_OPERATOR => vec![operator(signal)?],
    other => return Err(Error::UnrecognizedSource(other.to_owned())),
  };

  if let Some(declared) = &signal.event_type {
    for e in &events {
      let kind: &'static str = e.payload.kind().into();
      if kind != declared {
        return Err(malformed(
          &signal.source,
          format!("declared event_type {declared:?} but payload is {kind:?}"),
        ));
      }
    }
  }

  Ok(events)
}

fn malformed(origin: &str, reason: impl Into<String>) -> Error {
  Error::MalformedPayload {
    origin: origin.to_owned(),
    reason: reason.into(),
  }
}

fn parse<T: DeserializeOwned>(signal: &RawSignal) -> Result<T> {
  serde_json::from_value(signal.payload.clone())
    .map_err(|e| malformed(&signal.source, e.to_string()))
}

fn occurred_at(signal: &RawSignal) -> Result<DateTime<Utc>> {
  signal
    .occurred_at
    .ok_or_else(|| malformed(&signal.source, "occurred_at is required"))
}

fn event(
  signal: &RawSignal,
  occurred_at: DateTime<Utc>,
  payload: EventPayload,
) -> NewEvent {
  NewEvent {
    source_id: signal.source_id.clone(),
    source: signal.source.clone(),
    occurred_at,
    payload,
  }
}

// ─── SMS sender ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SmsWire {
  kind:    Option<SmsKind>,
  /// Legacy activity-log action, e.g. `sms_voicemail_2_sent`.
  action:  Option<String>,
  attempt: Option<u8>,
  to:      Option<String>,
  body:    Option<String>,
}

/// Decode a legacy action string into a kind and voicemail attempt.
fn sms_action(action: &str) -> Option<(SmsKind, Option<u8>)> {
  let inner = action.strip_prefix("sms_")?.strip_suffix("_sent")?;
  match inner {
    "answer_call" => Some((SmsKind::AnswerCall, None)),
    "follow_up" => Some((SmsKind::FollowUp, None)),
    "voicemail" => Some((SmsKind::Voicemail, None)),
    other => {
      let n = other.strip_prefix("voicemail_")?.parse().ok()?;
      Some((SmsKind::Voicemail, Some(n)))
    }
  }
}

fn sms(signal: &RawSignal) -> Result<NewEvent> {
  let wire: SmsWire = parse(signal)?;
  let (kind, attempt) = match (wire.kind, wire.action.as_deref()) {
    (Some(kind), _) => (kind, wire.attempt),
    (None, Some(action)) => {
      let (kind, attempt) = sms_action(action).ok_or_else(|| {
        malformed(&signal.source, format!("unknown sms action {action:?}"))
      })?;
      (kind, attempt.or(wire.attempt))
    }
    (None, None) => {
      return Err(malformed(&signal.source, "missing `kind` or `action`"));
    }
  };
  Ok(event(
    signal,
    occurred_at(signal)?,
    EventPayload::SmsSent(SmsSent {
      kind,
      attempt,
      to: wire.to,
      body: wire.body,
    }),
  ))
}

// ─── Appointment webhook ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppointmentWire {
  #[serde(rename = "type")]
  event_type:  String,
  #[serde(default)]
  contact:     Option<ContactWire>,
  appointment: AppointmentDetailsWire,
  booked_by:   Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ContactWire {
  first_name: Option<String>,
  last_name:  Option<String>,
  name:       Option<String>,
  email:      Option<String>,
  phone:      Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppointmentDetailsWire {
  start_time:  Option<String>,
  start_date:  Option<String>,
  calendar_id: Option<String>,
  title:       Option<String>,
}

const APPOINTMENT_TYPES: &[&str] = &["AppointmentCreate", "appointment.created"];

/// Booking systems send either a full timestamp in `startTime`, or a date and
/// a wall-clock time split across `startDate`/`startTime` (taken as UTC).
fn appointment_start(
  details: &AppointmentDetailsWire,
) -> Option<DateTime<Utc>> {
  let time = details.start_time.as_deref()?;
  if let Ok(dt) = DateTime::parse_from_rfc3339(time) {
    return Some(dt.with_timezone(&Utc));
  }
  let date = NaiveDate::parse_from_str(details.start_date.as_deref()?, "%Y-%m-%d").ok()?;
  let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
    .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
    .ok()?;
  Some(NaiveDateTime::new(date, time).and_utc())
}

fn appointment(signal: &RawSignal) -> Result<NewEvent> {
  let wire: AppointmentWire = parse(signal)?;
  if !APPOINTMENT_TYPES.contains(&wire.event_type.as_str()) {
    return Err(malformed(
      &signal.source,
      format!("unsupported webhook type {:?}", wire.event_type),
    ));
  }
  let starts_at = appointment_start(&wire.appointment).ok_or_else(|| {
    malformed(&signal.source, "invalid appointment date/time")
  })?;

  let c = wire.contact.unwrap_or_default();
  let full_name = [c.first_name.as_deref(), c.last_name.as_deref()]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");
  let name = c
    .name
    .or_else(|| (!full_name.trim().is_empty()).then_some(full_name));

  Ok(event(
    signal,
    occurred_at(signal)?,
    EventPayload::WebhookAppointment(AppointmentBooked {
      starts_at,
      calendar_id: wire.appointment.calendar_id,
      title: wire.appointment.title,
      booked_by: wire.booked_by,
      contact: AppointmentContact { name, email: c.email, phone: c.phone },
    }),
  ))
}

// ─── Analytics beacon ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionWire {
  session_id: String,
  started_at: DateTime<Utc>,
  ended_at:   DateTime<Utc>,
  #[serde(default)]
  page_views: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnalyticsWire {
  Batch { sessions: Vec<SessionWire> },
  Single(SessionWire),
}

fn analytics(signal: &RawSignal) -> Result<Vec<NewEvent>> {
  let (sessions, batched) = match parse::<AnalyticsWire>(signal)? {
    AnalyticsWire::Batch { sessions } => (sessions, true),
    AnalyticsWire::Single(s) => (vec![s], false),
  };
  if sessions.is_empty() {
    return Err(malformed(&signal.source, "no sessions in summary"));
  }

  sessions
    .into_iter()
    .map(|s| {
      if s.session_id.trim().is_empty() {
        return Err(malformed(&signal.source, "session_id is empty"));
      }
      if s.ended_at < s.started_at {
        return Err(malformed(
          &signal.source,
          format!("session {} ends before it starts", s.session_id),
        ));
      }
      let mut e = event(
        signal,
        s.started_at,
        EventPayload::SiteVisitSession(VisitSession {
          session_id: s.session_id.clone(),
          started_at: s.started_at,
          ended_at:   s.ended_at,
          page_views: s.page_views,
        }),
      );
      if batched {
        e.source_id = format!("{}#{}", signal.source_id, s.session_id);
      }
      Ok(e)
    })
    .collect()
}

// ─── Operator actions ────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum OperatorWire {
  Note {
    content:    String,
    author:     String,
    #[serde(default)]
    is_private: bool,
  },
  ApplyTag {
    tag_type: String,
    operator: String,
  },
  RemoveTag {
    tag_type: String,
    operator: String,
    reason:   Option<String>,
  },
}

fn operator(signal: &RawSignal) -> Result<NewEvent> {
  let at = occurred_at(signal)?;
  let payload = match parse::<OperatorWire>(signal)? {
    OperatorWire::Note { content, author, is_private } => {
      if content.trim().is_empty() {
        return Err(malformed(&signal.source, "note content is empty"));
      }
      EventPayload::ManualNote(NoteAdded {
        // Derived from the idempotency key so retries describe the same note.
        note_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, signal.source_id.as_bytes()),
        content,
        author,
        is_private,
      })
    }
    OperatorWire::ApplyTag { tag_type, operator } => {
      EventPayload::TagApplied(TagGranted {
        tag_type,
        is_auto_generated: false,
        granted_by: operator,
        rule_id: None,
        rule_version: None,
      })
    }
    OperatorWire::RemoveTag { tag_type, operator, reason } => {
      EventPayload::TagRemoved(TagRevoked {
        tag_type,
        removed_by: operator,
        reason,
      })
    }
  };
  Ok(event(signal, at, payload))
}

/// Kinds a producer may submit; everything else is derived by the core.
fn is_signal_kind(kind: EventKind) -> bool {
  !matches!(kind, EventKind::StageChange | EventKind::OwnerLinked)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use serde_json::json;

  use super::*;

  fn signal(source: &str, payload: serde_json::Value) -> RawSignal {
    RawSignal {
      source_id:   "sig-1".into(),
      source:      source.into(),
      lead:        LeadRef::Lead { lead_id: Uuid::nil() },
      event_type:  None,
      occurred_at: Some(Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap()),
      payload,
    }
  }

  #[test]
  fn unknown_source_is_unrecognized() {
    let err = normalize(&signal("fax", json!({}))).unwrap_err();
    assert!(matches!(err, Error::UnrecognizedSource(s) if s == "fax"));
  }

  #[test]
  fn sms_accepts_legacy_action_strings() {
    let events =
      normalize(&signal("sms", json!({ "action": "sms_voicemail_2_sent" })))
        .unwrap();
    assert_eq!(events.len(), 1);
    match &events[0].payload {
      EventPayload::SmsSent(s) => {
        assert_eq!(s.kind, SmsKind::Voicemail);
        assert_eq!(s.attempt, Some(2));
      }
      other => panic!("unexpected payload {other:?}"),
    }
  }

  #[test]
  fn sms_without_timestamp_is_malformed() {
    let mut s = signal("sms", json!({ "kind": "answer_call" }));
    s.occurred_at = None;
    assert!(matches!(
      normalize(&s),
      Err(Error::MalformedPayload { .. })
    ));
  }

  #[test]
  fn appointment_with_split_date_and_time() {
    let events = normalize(&signal(
      "appointment_webhook",
      json!({
        "type": "AppointmentCreate",
        "contact": { "firstName": "Dana", "lastName": "Reyes", "email": "dana@coolair.com" },
        "appointment": { "startDate": "2025-03-06", "startTime": "14:30", "calendarId": "cal-nick" }
      }),
    ))
    .unwrap();
    match &events[0].payload {
      EventPayload::WebhookAppointment(a) => {
        assert_eq!(
          a.starts_at,
          Utc.with_ymd_and_hms(2025, 3, 6, 14, 30, 0).unwrap()
        );
        assert_eq!(a.contact.name.as_deref(), Some("Dana Reyes"));
        assert_eq!(a.calendar_id.as_deref(), Some("cal-nick"));
      }
      other => panic!("unexpected payload {other:?}"),
    }
  }

  #[test]
  fn non_appointment_webhooks_are_malformed() {
    let err = normalize(&signal(
      "appointment_webhook",
      json!({ "type": "ContactUpdate", "appointment": {} }),
    ))
    .unwrap_err();
    assert!(matches!(err, Error::MalformedPayload { .. }));
  }

  #[test]
  fn analytics_batches_fan_out_with_derived_keys() {
    let events = normalize(&signal(
      "analytics",
      json!({ "sessions": [
        { "session_id": "a", "started_at": "2025-03-04T15:00:00Z", "ended_at": "2025-03-04T15:03:00Z", "page_views": 4 },
        { "session_id": "b", "started_at": "2025-03-05T09:00:00Z", "ended_at": "2025-03-05T09:01:00Z" }
      ]}),
    ))
    .unwrap();
    let keys: Vec<_> = events.iter().map(|e| e.source_id.as_str()).collect();
    assert_eq!(keys, ["sig-1#a", "sig-1#b"]);
    assert_eq!(
      events[1].occurred_at,
      Utc.with_ymd_and_hms(2025, 3, 5, 9, 0, 0).unwrap()
    );
  }

  #[test]
  fn inverted_session_is_malformed() {
    let err = normalize(&signal(
      "analytics",
      json!({ "session_id": "a", "started_at": "2025-03-04T15:00:00Z", "ended_at": "2025-03-04T14:00:00Z" }),
    ))
    .unwrap_err();
    assert!(matches!(err, Error::MalformedPayload { .. }));
  }

  #[test]
  fn operator_notes_get_stable_ids() {
    let s = signal(
      "operator",
      json!({ "action": "note", "content": "Call back Tuesday", "author": "nick" }),
    );
    let first = normalize(&s).unwrap();
    let again = normalize(&s).unwrap();
    assert_eq!(first, again);
  }

  #[test]
  fn declared_event_type_must_match() {
    let mut s = signal("sms", json!({ "kind": "answer_call" }));
    s.event_type = Some("site_visit_session".into());
    assert!(matches!(
      normalize(&s),
      Err(Error::MalformedPayload { .. })
    ));
    s.event_type = Some("sms_sent".into());
    assert!(normalize(&s).is_ok());
  }

  #[test]
  fn derived_kinds_cannot_be_submitted() {
    let mut s = signal(
      "operator",
      json!({ "action": "note", "content": "moved to won", "author": "nick" }),
    );
    s.event_type = Some("stage_change".into());
    let err = normalize(&s).unwrap_err();
    assert!(
      matches!(&err, Error::MalformedPayload { reason, .. } if reason.contains("derived")),
      "{err:?}"
    );
  }
}
