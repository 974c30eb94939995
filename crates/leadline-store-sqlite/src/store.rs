//! [`SqliteStore`], the SQLite implementation of [`PipelineStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use leadline_core::{
  dead_letter::{DeadLetter, NewDeadLetter},
  event::{ActivityEvent, EventKind, EventPayload, JournalPage, NewEvent},
  lead::Lead,
  owner::{BusinessOwner, MatchedOn, NormalizedCandidate, Resolution},
  pipeline::StageNotification,
  store::{Appended, LeadQuery, PipelineStore},
};
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior, params};
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

use crate::{
  Error, Result,
  aggregate::{self, Shape},
  encode::{
    DEAD_LETTER_COLUMNS, EVENT_COLUMNS, OUTBOX_COLUMNS, OWNER_COLUMNS,
    RawDeadLetter, RawEvent, RawNotification, RawOwner, decode_uuid, encode_dt,
    encode_stage, encode_uuid,
  },
  schema::{LEGACY_SCHEMA, SCHEMA},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A lead pipeline store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        conn.execute_batch(SCHEMA)?;
        if Shape::load(conn)?.legacy_present {
          conn.execute_batch(LEGACY_SCHEMA)?;
        }
        Ok(())
      })
      .await
  }

  /// Run `f` on the connection thread, keeping our error type intact.
  pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
  {
    with_conn(&self.conn, f).await
  }
}

pub(crate) async fn with_conn<T, F>(
  conn: &tokio_rusqlite::Connection,
  f: F,
) -> Result<T>
where
  T: Send + 'static,
  F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
  Ok(conn.call(move |conn| f(conn).map_err(Into::into)).await?)
}

// ─── Journal ─────────────────────────────────────────────────────────────────

fn append_tx(conn: &mut Connection, lead_id: Uuid, input: NewEvent) -> Result<Appended> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let existing: Option<String> = tx
    .query_row(
      "SELECT event_id FROM events WHERE source_id = ?1",
      params![input.source_id],
      |row| row.get(0),
    )
    .optional()?;
  if let Some(existing) = existing {
    return Err(
      leadline_core::Error::DuplicateEvent {
        source_id: input.source_id,
        existing:  decode_uuid(&existing)?,
      }
      .into(),
    );
  }

  let mut lead = aggregate::read_lead(&tx, lead_id)?
    .ok_or(leadline_core::Error::LeadNotFound(lead_id))?;

  let event_id = Uuid::new_v4();
  let recorded_at = Utc::now();
  let kind: &'static str = input.payload.kind().into();
  tx.execute(
    "INSERT INTO events (
       event_id, lead_id, source_id, source, kind,
       payload_json, occurred_at, recorded_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    params![
      encode_uuid(event_id),
      encode_uuid(lead_id),
      input.source_id,
      input.source,
      kind,
      input.payload.to_json()?.to_string(),
      encode_dt(input.occurred_at),
      encode_dt(recorded_at),
    ],
  )?;
  if let EventPayload::StageChange(change) = &input.payload {
    tx.execute(
      "INSERT INTO stage_outbox (event_id, lead_id, from_stage, to_stage, occurred_at)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![
        encode_uuid(event_id),
        encode_uuid(lead_id),
        encode_stage(change.from),
        encode_stage(change.to),
        encode_dt(input.occurred_at),
      ],
    )?;
  }

  let event = ActivityEvent {
    event_id,
    lead_id,
    seq: tx.last_insert_rowid(),
    source_id: input.source_id,
    source: input.source,
    occurred_at: input.occurred_at,
    recorded_at,
    payload: input.payload,
  };
  lead.apply(&event);
  aggregate::write_lead(&tx, &lead)?;
  tx.commit()?;

  Ok(Appended { event, lead })
}

fn read_events(
  conn: &Connection,
  lead_id: Uuid,
  after: i64,
  limit: Option<usize>,
) -> Result<Vec<ActivityEvent>> {
  let limit = limit.map_or(-1, |l| l as i64);
  let mut stmt = conn.prepare(&format!(
    "SELECT {EVENT_COLUMNS} FROM events
     WHERE lead_id = ?1 AND seq > ?2
     ORDER BY seq
     LIMIT ?3"
  ))?;
  let raws = stmt
    .query_map(params![encode_uuid(lead_id), after, limit], RawEvent::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawEvent::into_event).collect()
}

/// Entries of `kinds`, optionally only those at or after `since`.
/// Timestamps are UTC RFC 3339 text, which sorts chronologically.
fn read_events_of(
  conn: &Connection,
  lead_id: Uuid,
  kinds: &[EventKind],
  since: Option<DateTime<Utc>>,
) -> Result<Vec<ActivityEvent>> {
  let kinds: Vec<&'static str> = kinds.iter().map(|&k| <&'static str>::from(k)).collect();
  let mut stmt = conn.prepare(&format!(
    "SELECT {EVENT_COLUMNS} FROM events
     WHERE lead_id = ?1
       AND kind IN (SELECT value FROM json_each(?2))
       AND (?3 IS NULL OR occurred_at >= ?3)
     ORDER BY seq"
  ))?;
  let raws = stmt
    .query_map(
      params![encode_uuid(lead_id), serde_json::to_string(&kinds)?, since.map(encode_dt)],
      RawEvent::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawEvent::into_event).collect()
}

fn rebuild_tx(conn: &mut Connection, lead_id: Uuid) -> Result<Lead> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let current = aggregate::read_lead(&tx, lead_id)?
    .ok_or(leadline_core::Error::LeadNotFound(lead_id))?;

  let events = read_events(&tx, lead_id, 0, None)?;
  let seed = Lead::open(lead_id, current.company_id, current.created_at);
  let lead = Lead::replay(seed, &events);
  aggregate::write_lead(&tx, &lead)?;
  tx.commit()?;

  if lead != current {
    tracing::warn!(%lead_id, "stored aggregate differed from journal replay");
  }
  Ok(lead)
}

// ─── Owners ──────────────────────────────────────────────────────────────────

fn owner_by_key(
  conn: &Connection,
  company_id: &str,
  column: &str,
  key: &str,
) -> Result<Option<BusinessOwner>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {OWNER_COLUMNS} FROM business_owners
         WHERE company_id = ?1 AND {column} = ?2"
      ),
      params![company_id, key],
      RawOwner::from_row,
    )
    .optional()?;
  raw.map(RawOwner::into_owner).transpose()
}

fn owner_by_keys(
  conn: &Connection,
  c: &NormalizedCandidate,
) -> Result<Option<(BusinessOwner, MatchedOn)>> {
  let company = encode_uuid(c.company_id);
  if let Some(key) = &c.email_key {
    if let Some(owner) = owner_by_key(conn, &company, "email_key", key)? {
      return Ok(Some((owner, MatchedOn::Email)));
    }
  }
  if let Some(key) = &c.phone_key {
    if let Some(owner) = owner_by_key(conn, &company, "phone_key", key)? {
      return Ok(Some((owner, MatchedOn::Phone)));
    }
  }
  Ok(None)
}

fn owner_by_id(conn: &Connection, owner_id: &str) -> Result<Option<BusinessOwner>> {
  let raw = conn
    .query_row(
      &format!("SELECT {OWNER_COLUMNS} FROM business_owners WHERE owner_id = ?1"),
      params![owner_id],
      RawOwner::from_row,
    )
    .optional()?;
  raw.map(RawOwner::into_owner).transpose()
}

fn resolve_owner_tx(conn: &mut Connection, c: NormalizedCandidate) -> Result<Resolution> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let resolution = if let Some((owner, matched_on)) = owner_by_keys(&tx, &c)? {
    // Fill gaps, never overwrite. Each pair is its own statement so a key
    // already claimed by another owner only skips that pair.
    let id = encode_uuid(owner.owner_id);
    tx.execute(
      "UPDATE business_owners SET name = COALESCE(name, ?2) WHERE owner_id = ?1",
      params![id, c.name],
    )?;
    tx.execute(
      "UPDATE OR IGNORE business_owners
       SET email = COALESCE(email, ?2), email_key = COALESCE(email_key, ?3)
       WHERE owner_id = ?1",
      params![id, c.email, c.email_key],
    )?;
    tx.execute(
      "UPDATE OR IGNORE business_owners
       SET phone = COALESCE(phone, ?2), phone_key = COALESCE(phone_key, ?3)
       WHERE owner_id = ?1",
      params![id, c.phone, c.phone_key],
    )?;
    let owner = owner_by_id(&tx, &id)?.unwrap_or(owner);
    Resolution { owner, matched_on }
  } else {
    let owner_id = Uuid::new_v4();
    let inserted = tx.execute(
      "INSERT INTO business_owners (
         owner_id, company_id, name, email, email_key,
         phone, phone_key, auth_provider, created_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
       ON CONFLICT DO NOTHING",
      params![
        encode_uuid(owner_id),
        encode_uuid(c.company_id),
        c.name,
        c.email,
        c.email_key,
        c.phone,
        c.phone_key,
        c.auth_provider,
        encode_dt(Utc::now()),
      ],
    )?;
    if inserted == 1 {
      let owner = owner_by_id(&tx, &encode_uuid(owner_id))?
        .ok_or_else(|| Error::Decode("inserted owner vanished".into()))?;
      Resolution { owner, matched_on: MatchedOn::Created }
    } else {
      let (owner, _) = owner_by_keys(&tx, &c)?
        .ok_or_else(|| Error::Decode("conflicting owner not found".into()))?;
      Resolution { owner, matched_on: MatchedOn::Conflict }
    }
  };

  tx.commit()?;
  Ok(resolution)
}

// ─── Dead letters ────────────────────────────────────────────────────────────

fn dead_letter_by_id(conn: &Connection, id: &str) -> Result<Option<DeadLetter>> {
  let raw = conn
    .query_row(
      &format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE dead_letter_id = ?1"),
      params![id],
      RawDeadLetter::from_row,
    )
    .optional()?;
  raw.map(RawDeadLetter::into_dead_letter).transpose()
}

fn record_dead_letter_tx(conn: &mut Connection, entry: NewDeadLetter) -> Result<DeadLetter> {
  let tx = conn.transaction()?;
  let id = encode_uuid(Uuid::new_v4());
  let code: &'static str = entry.code.into();
  let raw_json = serde_json::to_string(&entry.raw)?;
  let digest = hex::encode(Sha256::digest(raw_json.as_bytes()));

  // The same rejection of the same payload keeps one row. If an operator
  // already acknowledged it, the repeat reopens it.
  tx.execute(
    "INSERT INTO dead_letters (
       dead_letter_id, lead_id, source_id, code, detail,
       raw_json, payload_digest, recorded_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT (source_id, code, payload_digest) DO UPDATE
       SET detail          = excluded.detail,
           recorded_at     = excluded.recorded_at,
           acknowledged_at = NULL,
           acknowledged_by = NULL
       WHERE dead_letters.acknowledged_at IS NOT NULL",
    params![
      id,
      entry.lead_id.map(encode_uuid),
      entry.source_id,
      code,
      entry.detail,
      raw_json,
      digest,
      encode_dt(Utc::now()),
    ],
  )?;

  let raw = tx
    .query_row(
      &format!(
        "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
         WHERE dead_letter_id = ?1
            OR (source_id = ?2 AND code = ?3 AND payload_digest = ?4)"
      ),
      params![id, entry.source_id, code, digest],
      RawDeadLetter::from_row,
    )
    .optional()?;
  let stored = raw.map(RawDeadLetter::into_dead_letter).transpose()?;
  tx.commit()?;
  stored.ok_or_else(|| Error::Decode("recorded dead letter not found".into()))
}

// ─── PipelineStore impl ──────────────────────────────────────────────────────

impl PipelineStore for SqliteStore {
  type Error = Error;

  // ── Leads ─────────────────────────────────────────────────────────────────

  async fn create_lead(&self, company_id: Uuid) -> Result<Lead> {
    let lead = Lead::open(Uuid::new_v4(), company_id, Utc::now());
    let stored = lead.clone();
    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        aggregate::write_lead(&tx, &stored)?;
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(lead)
  }

  async fn get_lead(&self, lead_id: Uuid) -> Result<Option<Lead>> {
    self.with_conn(move |conn| aggregate::read_lead(conn, lead_id)).await
  }

  async fn find_open_lead(&self, company_id: Uuid) -> Result<Option<Lead>> {
    self
      .with_conn(move |conn| {
        let id: Option<String> = conn
          .query_row(
            "SELECT lead_id FROM leads
             WHERE company_id = ?1
               AND stage NOT IN ('won', 'lost', 'unresponsive')
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
            params![encode_uuid(company_id)],
            |row| row.get(0),
          )
          .optional()?;
        match id {
          Some(id) => aggregate::read_lead(conn, decode_uuid(&id)?),
          None => Ok(None),
        }
      })
      .await
  }

  async fn list_leads(&self, query: &LeadQuery) -> Result<Vec<Lead>> {
    let company = query.company_id.map(encode_uuid);
    let stage = query.stage.map(encode_stage);
    let tag = query.tag.clone();
    let limit = query.limit.unwrap_or(100) as i64;
    let offset = query.offset.unwrap_or(0) as i64;

    self
      .with_conn(move |conn| {
        let tag_filter = if Shape::load(conn)?.read_consolidated {
          "EXISTS (SELECT 1 FROM json_each(l.tags_json) j
                   WHERE json_extract(j.value, '$.tag_type') = ?3)"
        } else {
          "EXISTS (SELECT 1 FROM lead_tags t
                   WHERE t.lead_id = l.lead_id AND t.tag_type = ?3)"
        };
        let mut stmt = conn.prepare(&format!(
          "SELECT l.lead_id FROM leads l
           WHERE (?1 IS NULL OR l.company_id = ?1)
             AND (?2 IS NULL OR l.stage = ?2)
             AND (?3 IS NULL OR {tag_filter})
           ORDER BY l.created_at DESC, l.rowid DESC
           LIMIT ?4 OFFSET ?5"
        ))?;
        let ids = stmt
          .query_map(params![company, stage, tag, limit, offset], |row| {
            row.get::<_, String>(0)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut leads = Vec::with_capacity(ids.len());
        for id in ids {
          if let Some(lead) = aggregate::read_lead(conn, decode_uuid(&id)?)? {
            leads.push(lead);
          }
        }
        Ok(leads)
      })
      .await
  }

  async fn rebuild_lead(&self, lead_id: Uuid) -> Result<Lead> {
    self.with_conn(move |conn| rebuild_tx(conn, lead_id)).await
  }

  // ── Journal ───────────────────────────────────────────────────────────────

  async fn append(&self, lead_id: Uuid, event: NewEvent) -> Result<Appended> {
    self.with_conn(move |conn| append_tx(conn, lead_id, event)).await
  }

  async fn event_by_source(&self, source_id: &str) -> Result<Option<ActivityEvent>> {
    let source_id = source_id.to_owned();
    self
      .with_conn(move |conn| {
        let raw = conn
          .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE source_id = ?1"),
            params![source_id],
            RawEvent::from_row,
          )
          .optional()?;
        raw.map(RawEvent::into_event).transpose()
      })
      .await
  }

  async fn read_since(
    &self,
    lead_id: Uuid,
    cursor: Option<i64>,
    limit: usize,
  ) -> Result<JournalPage> {
    self
      .with_conn(move |conn| {
        // One extra row tells us whether another page exists.
        let mut events = read_events(conn, lead_id, cursor.unwrap_or(0), Some(limit + 1))?;
        let next_cursor = if events.len() > limit {
          events.truncate(limit);
          events.last().map(|e| e.seq)
        } else {
          None
        };
        Ok(JournalPage { events, next_cursor })
      })
      .await
  }

  async fn history(&self, lead_id: Uuid) -> Result<Vec<ActivityEvent>> {
    self.with_conn(move |conn| read_events(conn, lead_id, 0, None)).await
  }

  async fn history_of(
    &self,
    lead_id: Uuid,
    kinds: &[EventKind],
    since: Option<DateTime<Utc>>,
  ) -> Result<Vec<ActivityEvent>> {
    let kinds = kinds.to_vec();
    self
      .with_conn(move |conn| read_events_of(conn, lead_id, &kinds, since))
      .await
  }

  // ── Owners ────────────────────────────────────────────────────────────────

  async fn resolve_owner(&self, candidate: NormalizedCandidate) -> Result<Resolution> {
    self.with_conn(move |conn| resolve_owner_tx(conn, candidate)).await
  }

  async fn get_owner(&self, owner_id: Uuid) -> Result<Option<BusinessOwner>> {
    self
      .with_conn(move |conn| owner_by_id(conn, &encode_uuid(owner_id)))
      .await
  }

  async fn find_owners(
    &self,
    email_key: Option<String>,
    phone_key: Option<String>,
  ) -> Result<Vec<BusinessOwner>> {
    self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {OWNER_COLUMNS} FROM business_owners
           WHERE (?1 IS NOT NULL AND email_key = ?1)
              OR (?2 IS NOT NULL AND phone_key = ?2)
           ORDER BY created_at"
        ))?;
        let raws = stmt
          .query_map(params![email_key, phone_key], RawOwner::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawOwner::into_owner).collect()
      })
      .await
  }

  // ── Dead letters ──────────────────────────────────────────────────────────

  async fn record_dead_letter(&self, entry: NewDeadLetter) -> Result<DeadLetter> {
    self.with_conn(move |conn| record_dead_letter_tx(conn, entry)).await
  }

  async fn list_dead_letters(&self, include_acknowledged: bool) -> Result<Vec<DeadLetter>> {
    self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
           WHERE ?1 OR acknowledged_at IS NULL
           ORDER BY recorded_at, rowid"
        ))?;
        let raws = stmt
          .query_map(params![include_acknowledged], RawDeadLetter::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawDeadLetter::into_dead_letter).collect()
      })
      .await
  }

  async fn get_dead_letter(&self, dead_letter_id: Uuid) -> Result<Option<DeadLetter>> {
    self
      .with_conn(move |conn| dead_letter_by_id(conn, &encode_uuid(dead_letter_id)))
      .await
  }

  async fn acknowledge_dead_letter(
    &self,
    dead_letter_id: Uuid,
    operator: &str,
  ) -> Result<DeadLetter> {
    let operator = operator.to_owned();
    self
      .with_conn(move |conn| {
        let id = encode_uuid(dead_letter_id);
        // Acknowledging twice keeps the first acknowledgement.
        let updated = conn.execute(
          "UPDATE dead_letters
           SET acknowledged_at = COALESCE(acknowledged_at, ?2),
               acknowledged_by = COALESCE(acknowledged_by, ?3)
           WHERE dead_letter_id = ?1",
          params![id, encode_dt(Utc::now()), operator],
        )?;
        if updated == 0 {
          return Err(leadline_core::Error::DeadLetterNotFound(dead_letter_id).into());
        }
        dead_letter_by_id(conn, &id)?
          .ok_or_else(|| leadline_core::Error::DeadLetterNotFound(dead_letter_id).into())
      })
      .await
  }

  // ── Notification outbox ───────────────────────────────────────────────────

  async fn pending_notifications(
    &self,
    lead_id: Option<Uuid>,
    limit: usize,
  ) -> Result<Vec<StageNotification>> {
    let lead = lead_id.map(encode_uuid);
    self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {OUTBOX_COLUMNS} FROM stage_outbox
           WHERE delivered_at IS NULL AND (?1 IS NULL OR lead_id = ?1)
           ORDER BY rowid
           LIMIT ?2"
        ))?;
        let raws = stmt
          .query_map(params![lead, limit as i64], RawNotification::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawNotification::into_notification).collect()
      })
      .await
  }

  async fn mark_notification_delivered(&self, event_id: Uuid) -> Result<()> {
    self
      .with_conn(move |conn| {
        conn.execute(
          "UPDATE stage_outbox
           SET delivered_at = COALESCE(delivered_at, ?2), attempts = attempts + 1
           WHERE event_id = ?1",
          params![encode_uuid(event_id), encode_dt(Utc::now())],
        )?;
        Ok(())
      })
      .await
  }

  async fn record_notification_failure(&self, event_id: Uuid, error: String) -> Result<()> {
    self
      .with_conn(move |conn| {
        conn.execute(
          "UPDATE stage_outbox SET attempts = attempts + 1, last_error = ?2
           WHERE event_id = ?1 AND delivered_at IS NULL",
          params![encode_uuid(event_id), error],
        )?;
        Ok(())
      })
      .await
  }
}
