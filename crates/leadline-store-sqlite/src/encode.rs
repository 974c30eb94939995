//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings and UUIDs as hyphenated
//! lowercase strings. Enums use their strum snake_case form. Payloads and
//! aggregate collections are compact JSON.

use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, Utc};
use leadline_core::{
  dead_letter::{DeadLetter, RejectionCode},
  event::{ActivityEvent, EventPayload},
  lead::{Lead, Note},
  owner::BusinessOwner,
  pipeline::StageNotification,
  stage::Stage,
  tag::Tag,
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Decode(format!("bad timestamp {s:?}: {e}")))
}

pub fn encode_stage(stage: Stage) -> &'static str { stage.into() }

pub fn decode_stage(s: &str) -> Result<Stage> {
  Stage::from_str(s).map_err(|_| Error::Decode(format!("unknown stage: {s:?}")))
}

// ─── Aggregate collections ───────────────────────────────────────────────────

pub fn encode_notes(notes: &[Note]) -> Result<String> {
  Ok(serde_json::to_string(notes)?)
}

pub fn decode_notes(s: &str) -> Result<Vec<Note>> { Ok(serde_json::from_str(s)?) }

/// Tags are stored as a JSON array ordered by `tag_type`.
pub fn encode_tags(tags: &BTreeMap<String, Tag>) -> Result<String> {
  Ok(serde_json::to_string(&tags.values().collect::<Vec<_>>())?)
}

pub fn decode_tags(s: &str) -> Result<BTreeMap<String, Tag>> {
  let tags: Vec<Tag> = serde_json::from_str(s)?;
  Ok(tags.into_iter().map(|t| (t.tag_type.clone(), t)).collect())
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const EVENT_COLUMNS: &str = "seq, event_id, lead_id, source_id, source, \
                                 kind, payload_json, occurred_at, recorded_at";

/// Raw strings read directly from an `events` row.
pub struct RawEvent {
  pub seq:          i64,
  pub event_id:     String,
  pub lead_id:      String,
  pub source_id:    String,
  pub source:       String,
  pub kind:         String,
  pub payload_json: String,
  pub occurred_at:  String,
  pub recorded_at:  String,
}

impl RawEvent {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq:          row.get(0)?,
      event_id:     row.get(1)?,
      lead_id:      row.get(2)?,
      source_id:    row.get(3)?,
      source:       row.get(4)?,
      kind:         row.get(5)?,
      payload_json: row.get(6)?,
      occurred_at:  row.get(7)?,
      recorded_at:  row.get(8)?,
    })
  }

  pub fn into_event(self) -> Result<ActivityEvent> {
    let data: serde_json::Value = serde_json::from_str(&self.payload_json)?;
    Ok(ActivityEvent {
      event_id:    decode_uuid(&self.event_id)?,
      lead_id:     decode_uuid(&self.lead_id)?,
      seq:         self.seq,
      source_id:   self.source_id,
      source:      self.source,
      occurred_at: decode_dt(&self.occurred_at)?,
      recorded_at: decode_dt(&self.recorded_at)?,
      payload:     EventPayload::from_parts(&self.kind, data)?,
    })
  }
}

pub const LEAD_COLUMNS: &str = "lead_id, company_id, stage, business_owner_id, \
                                created_at, updated_at, journal_seq";

/// The scalar columns of a `leads` row; collections are read separately.
pub struct RawLead {
  pub lead_id:           String,
  pub company_id:        String,
  pub stage:             String,
  pub business_owner_id: Option<String>,
  pub created_at:        String,
  pub updated_at:        String,
  pub journal_seq:       i64,
}

impl RawLead {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      lead_id:           row.get(0)?,
      company_id:        row.get(1)?,
      stage:             row.get(2)?,
      business_owner_id: row.get(3)?,
      created_at:        row.get(4)?,
      updated_at:        row.get(5)?,
      journal_seq:       row.get(6)?,
    })
  }

  pub fn into_lead(self) -> Result<Lead> {
    Ok(Lead {
      lead_id:           decode_uuid(&self.lead_id)?,
      company_id:        decode_uuid(&self.company_id)?,
      stage:             decode_stage(&self.stage)?,
      notes:             Vec::new(),
      tags:              BTreeMap::new(),
      business_owner_id: self.business_owner_id.as_deref().map(decode_uuid).transpose()?,
      created_at:        decode_dt(&self.created_at)?,
      updated_at:        decode_dt(&self.updated_at)?,
      journal_seq:       self.journal_seq,
    })
  }
}

pub const OWNER_COLUMNS: &str = "owner_id, company_id, name, email, phone, \
                                 auth_provider, last_login, created_at";

pub struct RawOwner {
  pub owner_id:      String,
  pub company_id:    String,
  pub name:          Option<String>,
  pub email:         Option<String>,
  pub phone:         Option<String>,
  pub auth_provider: String,
  pub last_login:    Option<String>,
  pub created_at:    String,
}

impl RawOwner {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      owner_id:      row.get(0)?,
      company_id:    row.get(1)?,
      name:          row.get(2)?,
      email:         row.get(3)?,
      phone:         row.get(4)?,
      auth_provider: row.get(5)?,
      last_login:    row.get(6)?,
      created_at:    row.get(7)?,
    })
  }

  pub fn into_owner(self) -> Result<BusinessOwner> {
    Ok(BusinessOwner {
      owner_id:      decode_uuid(&self.owner_id)?,
      company_id:    decode_uuid(&self.company_id)?,
      name:          self.name,
      email:         self.email,
      phone:         self.phone,
      auth_provider: self.auth_provider,
      last_login:    self.last_login.as_deref().map(decode_dt).transpose()?,
      created_at:    decode_dt(&self.created_at)?,
    })
  }
}

pub const DEAD_LETTER_COLUMNS: &str = "dead_letter_id, lead_id, source_id, code, \
                                       detail, raw_json, recorded_at, \
                                       acknowledged_at, acknowledged_by";

pub struct RawDeadLetter {
  pub dead_letter_id:  String,
  pub lead_id:         Option<String>,
  pub source_id:       Option<String>,
  pub code:            String,
  pub detail:          String,
  pub raw_json:        String,
  pub recorded_at:     String,
  pub acknowledged_at: Option<String>,
  pub acknowledged_by: Option<String>,
}

impl RawDeadLetter {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      dead_letter_id:  row.get(0)?,
      lead_id:         row.get(1)?,
      source_id:       row.get(2)?,
      code:            row.get(3)?,
      detail:          row.get(4)?,
      raw_json:        row.get(5)?,
      recorded_at:     row.get(6)?,
      acknowledged_at: row.get(7)?,
      acknowledged_by: row.get(8)?,
    })
  }

  pub fn into_dead_letter(self) -> Result<DeadLetter> {
    Ok(DeadLetter {
      dead_letter_id:  decode_uuid(&self.dead_letter_id)?,
      lead_id:         self.lead_id.as_deref().map(decode_uuid).transpose()?,
      source_id:       self.source_id,
      code:            RejectionCode::from_str(&self.code)
        .map_err(|_| Error::Decode(format!("unknown rejection code: {:?}", self.code)))?,
      detail:          self.detail,
      raw:             serde_json::from_str(&self.raw_json)?,
      recorded_at:     decode_dt(&self.recorded_at)?,
      acknowledged_at: self.acknowledged_at.as_deref().map(decode_dt).transpose()?,
      acknowledged_by: self.acknowledged_by,
    })
  }
}

pub const OUTBOX_COLUMNS: &str = "event_id, lead_id, from_stage, to_stage, occurred_at";

pub struct RawNotification {
  pub event_id:    String,
  pub lead_id:     String,
  pub from_stage:  String,
  pub to_stage:    String,
  pub occurred_at: String,
}

impl RawNotification {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:    row.get(0)?,
      lead_id:     row.get(1)?,
      from_stage:  row.get(2)?,
      to_stage:    row.get(3)?,
      occurred_at: row.get(4)?,
    })
  }

  pub fn into_notification(self) -> Result<StageNotification> {
    Ok(StageNotification {
      event_id:    decode_uuid(&self.event_id)?,
      lead_id:     decode_uuid(&self.lead_id)?,
      from:        decode_stage(&self.from_stage)?,
      to:          decode_stage(&self.to_stage)?,
      occurred_at: decode_dt(&self.occurred_at)?,
    })
  }
}
