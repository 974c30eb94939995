//! Reading and writing the lead aggregate in whichever shape is live.
//!
//! Everything here is synchronous and runs inside a connection closure,
//! usually within the transaction of the operation that called it.

use std::collections::BTreeMap;

use leadline_core::{
  lead::{Lead, Note},
  tag::Tag,
};
use rusqlite::{Connection, OptionalExtension as _, params};
use uuid::Uuid;

use crate::{
  Error, Result,
  consolidate::MIGRATION_ID,
  encode::{
    LEAD_COLUMNS, RawLead, decode_dt, decode_notes, decode_tags, encode_dt,
    encode_notes, encode_stage, encode_tags, encode_uuid,
  },
};

/// Which physical shapes exist and which one readers trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
  pub legacy_present:    bool,
  pub dual_write:        bool,
  pub read_consolidated: bool,
}

impl Shape {
  pub fn load(conn: &Connection) -> Result<Self> {
    let mut stmt = conn.prepare("SELECT name, enabled FROM shape_flags")?;
    let flags = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))?
      .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    let flag = |name: &str| flags.get(name).copied().unwrap_or(false);
    Ok(Self {
      legacy_present:    flag("legacy_present"),
      dual_write:        flag("dual_write"),
      read_consolidated: flag("read_consolidated"),
    })
  }

  fn writes_consolidated(self) -> bool { self.dual_write || self.read_consolidated }
}

pub fn set_flag(conn: &Connection, name: &str, enabled: bool) -> Result<()> {
  conn.execute(
    "UPDATE shape_flags SET enabled = ?2 WHERE name = ?1",
    params![name, enabled],
  )?;
  Ok(())
}

type Collections = (Vec<Note>, BTreeMap<String, Tag>);

// ─── Reads ───────────────────────────────────────────────────────────────────

fn read_base(conn: &Connection, lead_id: &str) -> Result<Option<Lead>> {
  let raw = conn
    .query_row(
      &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE lead_id = ?1"),
      params![lead_id],
      RawLead::from_row,
    )
    .optional()?;
  raw.map(RawLead::into_lead).transpose()
}

pub fn read_legacy(conn: &Connection, lead_id: &str) -> Result<Collections> {
  let mut stmt = conn.prepare(
    "SELECT note_id, content, author, is_private, created_at
     FROM lead_notes WHERE lead_id = ?1 ORDER BY position",
  )?;
  let raw_notes = stmt
    .query_map(params![lead_id], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, bool>(3)?,
        row.get::<_, String>(4)?,
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  let notes = raw_notes
    .into_iter()
    .map(|(id, content, author, is_private, created_at)| {
      Ok::<_, Error>(Note {
        note_id: Uuid::parse_str(&id)?,
        content,
        author,
        is_private,
        created_at: decode_dt(&created_at)?,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  let mut stmt = conn.prepare(
    "SELECT tag_type, value, is_auto_generated, granted_at, granted_by, rule_version
     FROM lead_tags WHERE lead_id = ?1 ORDER BY tag_type",
  )?;
  let raw_tags = stmt
    .query_map(params![lead_id], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, bool>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, String>(4)?,
        row.get::<_, Option<u32>>(5)?,
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  let tags = raw_tags
    .into_iter()
    .map(|(tag_type, value, is_auto, granted_at, granted_by, rule_version)| {
      let tag = Tag {
        tag_type: tag_type.clone(),
        value,
        is_auto_generated: is_auto,
        granted_at: decode_dt(&granted_at)?,
        granted_by,
        rule_version,
      };
      Ok::<_, Error>((tag_type, tag))
    })
    .collect::<Result<BTreeMap<_, _>>>()?;

  Ok((notes, tags))
}

/// `None` for a lead the backfill has not reached yet.
pub fn read_consolidated(
  conn: &Connection,
  lead_id: &str,
) -> Result<Option<Collections>> {
  let (notes, tags): (Option<String>, Option<String>) = conn.query_row(
    "SELECT notes_json, tags_json FROM leads WHERE lead_id = ?1",
    params![lead_id],
    |row| Ok((row.get(0)?, row.get(1)?)),
  )?;
  match (notes, tags) {
    (Some(notes), Some(tags)) => Ok(Some((decode_notes(&notes)?, decode_tags(&tags)?))),
    _ => Ok(None),
  }
}

/// Load a lead from the shape readers currently trust. While both shapes are
/// live after cutover, the legacy shape is read as a shadow and any
/// disagreement is counted against the migration's soak.
pub fn read_lead(conn: &Connection, lead_id: Uuid) -> Result<Option<Lead>> {
  let id = encode_uuid(lead_id);
  let Some(mut lead) = read_base(conn, &id)? else {
    return Ok(None);
  };
  let shape = Shape::load(conn)?;

  let collections = if shape.read_consolidated {
    let consolidated = read_consolidated(conn, &id)?.unwrap_or_default();
    if shape.legacy_present {
      let legacy = read_legacy(conn, &id)?;
      if legacy != consolidated {
        tracing::warn!(%lead_id, "shadow read mismatch between lead shapes");
        conn.execute(
          "UPDATE migrations SET cutover_errors = cutover_errors + 1
           WHERE migration_id = ?1",
          params![MIGRATION_ID],
        )?;
      }
    }
    consolidated
  } else {
    read_legacy(conn, &id)?
  };
  (lead.notes, lead.tags) = collections;
  Ok(Some(lead))
}

// ─── Writes ──────────────────────────────────────────────────────────────────

/// Persist the whole aggregate to every live shape.
pub fn write_lead(conn: &Connection, lead: &Lead) -> Result<()> {
  let id = encode_uuid(lead.lead_id);
  let shape = Shape::load(conn)?;

  conn.execute(
    "INSERT INTO leads (
       lead_id, company_id, stage, business_owner_id,
       created_at, updated_at, journal_seq
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT (lead_id) DO UPDATE SET
       stage             = excluded.stage,
       business_owner_id = excluded.business_owner_id,
       updated_at        = excluded.updated_at,
       journal_seq       = excluded.journal_seq",
    params![
      id,
      encode_uuid(lead.company_id),
      encode_stage(lead.stage),
      lead.business_owner_id.map(encode_uuid),
      encode_dt(lead.created_at),
      encode_dt(lead.updated_at),
      lead.journal_seq,
    ],
  )?;

  if shape.legacy_present {
    write_legacy(conn, &id, lead)?;
  }
  if shape.writes_consolidated() {
    conn.execute(
      "UPDATE leads SET notes_json = ?2, tags_json = ?3 WHERE lead_id = ?1",
      params![id, encode_notes(&lead.notes)?, encode_tags(&lead.tags)?],
    )?;
  }
  Ok(())
}

fn write_legacy(conn: &Connection, id: &str, lead: &Lead) -> Result<()> {
  conn.execute("DELETE FROM lead_notes WHERE lead_id = ?1", params![id])?;
  for (position, note) in lead.notes.iter().enumerate() {
    conn.execute(
      "INSERT INTO lead_notes (
         note_id, lead_id, position, content, author, is_private, created_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        encode_uuid(note.note_id),
        id,
        position as i64,
        note.content,
        note.author,
        note.is_private,
        encode_dt(note.created_at),
      ],
    )?;
  }

  conn.execute("DELETE FROM lead_tags WHERE lead_id = ?1", params![id])?;
  for tag in lead.tags.values() {
    conn.execute(
      "INSERT INTO lead_tags (
         lead_id, tag_type, value, is_auto_generated,
         granted_at, granted_by, rule_version
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        id,
        tag.tag_type,
        tag.value,
        tag.is_auto_generated,
        encode_dt(tag.granted_at),
        tag.granted_by,
        tag.rule_version,
      ],
    )?;
  }
  Ok(())
}
