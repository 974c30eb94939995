//! The `consolidate-lead-shape` migration: move lead notes and tags out of
//! the legacy `lead_notes` / `lead_tags` tables into JSON columns on `leads`.
//!
//! Also implements [`MigrationLedger`] for [`SqliteStore`], keeping migration
//! records in the `migrations` table beside the data they describe.

use leadline_core::evolution::{
  BackfillBatch, MigrationLedger, MigrationRecord, Phase, PhaseChange,
  ShapeMigration, Verification,
};
use rusqlite::{Connection, OptionalExtension as _, params};
use sha2::{Digest, Sha256};

use crate::{
  Error, Result,
  aggregate::{self, Shape},
  encode::{encode_dt, encode_notes, encode_tags},
  schema::LEGACY_SCHEMA,
  store::{SqliteStore, with_conn},
};

pub const MIGRATION_ID: &str = "consolidate-lead-shape";

const ADD_NOTES: &str = "ALTER TABLE leads ADD COLUMN notes_json TEXT";
const ADD_TAGS: &str = "ALTER TABLE leads ADD COLUMN tags_json TEXT";
const DROP_NOTES: &str = "ALTER TABLE leads DROP COLUMN notes_json";
const DROP_TAGS: &str = "ALTER TABLE leads DROP COLUMN tags_json";

const RESTORE_NOTES: &str = "
INSERT OR IGNORE INTO lead_notes (
    note_id, lead_id, position, content, author, is_private, created_at
)
SELECT json_extract(j.value, '$.note_id'),
       l.lead_id,
       j.key,
       json_extract(j.value, '$.content'),
       json_extract(j.value, '$.author'),
       json_extract(j.value, '$.is_private'),
       json_extract(j.value, '$.created_at')
FROM leads l, json_each(l.notes_json) j";

const RESTORE_TAGS: &str = "
INSERT OR IGNORE INTO lead_tags (
    lead_id, tag_type, value, is_auto_generated, granted_at, granted_by, rule_version
)
SELECT l.lead_id,
       json_extract(j.value, '$.tag_type'),
       json_extract(j.value, '$.value'),
       json_extract(j.value, '$.is_auto_generated'),
       json_extract(j.value, '$.granted_at'),
       json_extract(j.value, '$.granted_by'),
       json_extract(j.value, '$.rule_version')
FROM leads l, json_each(l.tags_json) j";

fn flag_sql(name: &str, enabled: bool) -> String {
  format!(
    "UPDATE shape_flags SET enabled = {} WHERE name = '{name}'",
    i32::from(enabled)
  )
}

// ─── Migration ───────────────────────────────────────────────────────────────

/// Handle to the consolidation migration for one database.
#[derive(Clone)]
pub struct ConsolidateLeadShape {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  pub fn consolidate_lead_shape(&self) -> ConsolidateLeadShape {
    ConsolidateLeadShape { conn: self.conn.clone() }
  }
}

fn has_json_columns(conn: &Connection) -> Result<i64> {
  Ok(conn.query_row(
    "SELECT COUNT(*) FROM pragma_table_info('leads')
     WHERE name IN ('notes_json', 'tags_json')",
    [],
    |row| row.get(0),
  )?)
}

fn has_column(conn: &Connection, column: &str) -> Result<bool> {
  Ok(conn.query_row(
    "SELECT COUNT(*) > 0 FROM pragma_table_info('leads') WHERE name = ?1",
    params![column],
    |row| row.get(0),
  )?)
}

fn legacy_tables(conn: &Connection) -> Result<i64> {
  Ok(conn.query_row(
    "SELECT COUNT(*) FROM sqlite_master
     WHERE type = 'table' AND name IN ('lead_notes', 'lead_tags')",
    [],
    |row| row.get(0),
  )?)
}

/// Hash every lead's collections as read from one shape. Leads are visited
/// in `lead_id` order; a lead missing from the shape hashes as `null`.
fn checksum(conn: &Connection, consolidated: bool) -> Result<String> {
  let mut stmt = conn.prepare("SELECT lead_id FROM leads ORDER BY lead_id")?;
  let ids = stmt
    .query_map([], |row| row.get::<_, String>(0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut hasher = Sha256::new();
  for id in &ids {
    let collections = if consolidated {
      aggregate::read_consolidated(conn, id)?
    } else {
      Some(aggregate::read_legacy(conn, id)?)
    };
    let body = match collections {
      Some((notes, tags)) => format!("{}|{}", encode_notes(&notes)?, encode_tags(&tags)?),
      None => "null".to_owned(),
    };
    hasher.update(id.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    hasher.update(b"\n");
  }
  Ok(format!("{}:{}", ids.len(), hex::encode(hasher.finalize())))
}

fn compare_shapes(conn: &Connection, query: &str) -> Result<Verification> {
  Ok(Verification {
    query:    query.to_owned(),
    expected: checksum(conn, false)?,
    actual:   checksum(conn, true)?,
  })
}

fn execute_phase(conn: &mut Connection, phase: Phase) -> Result<PhaseChange> {
  let tx = conn.transaction()?;
  let mut change = PhaseChange::default();

  match phase {
    Phase::Expand => {
      // Rollback drops only the columns this run added.
      let mut rollback = vec![flag_sql("dual_write", false)];
      for (column, add, drop) in [
        ("notes_json", ADD_NOTES, DROP_NOTES),
        ("tags_json", ADD_TAGS, DROP_TAGS),
      ] {
        if !has_column(&tx, column)? {
          tx.execute_batch(add)?;
          change.changes.push(add.to_owned());
          rollback.push(drop.to_owned());
        }
      }
      aggregate::set_flag(&tx, "dual_write", true)?;
      change.changes.push(flag_sql("dual_write", true));
      change.rollback = rollback;
    }
    Phase::Backfill => {
      // Rows are copied batch by batch through `backfill`.
      change.changes.push("backfill leads.notes_json, leads.tags_json".into());
      change.rollback = vec!["UPDATE leads SET notes_json = NULL, tags_json = NULL".into()];
    }
    Phase::Cutover => {
      aggregate::set_flag(&tx, "read_consolidated", true)?;
      tx.execute(
        "UPDATE migrations SET cutover_errors = 0 WHERE migration_id = ?1",
        params![MIGRATION_ID],
      )?;
      change.changes.push(flag_sql("read_consolidated", true));
      change.rollback = vec![flag_sql("read_consolidated", false)];
    }
    Phase::Contract => {
      aggregate::set_flag(&tx, "legacy_present", false)?;
      tx.execute_batch("DROP TABLE IF EXISTS lead_notes; DROP TABLE IF EXISTS lead_tags;")?;
      change.changes = vec![
        flag_sql("legacy_present", false),
        "DROP TABLE lead_notes".into(),
        "DROP TABLE lead_tags".into(),
      ];
      change.rollback = vec![
        LEGACY_SCHEMA.into(),
        RESTORE_NOTES.into(),
        RESTORE_TAGS.into(),
        flag_sql("legacy_present", true),
      ];
    }
  }

  tx.commit()?;
  Ok(change)
}

fn verify_phase(conn: &Connection, phase: Phase) -> Result<Verification> {
  match phase {
    Phase::Expand => Ok(Verification {
      query:    "json columns on leads".into(),
      expected: "2".into(),
      actual:   has_json_columns(conn)?.to_string(),
    }),
    Phase::Backfill => compare_shapes(conn, "legacy vs consolidated checksum after backfill"),
    Phase::Cutover => {
      let shape = Shape::load(conn)?;
      if !shape.read_consolidated {
        return Ok(Verification {
          query:    "read_consolidated flag".into(),
          expected: "1".into(),
          actual:   "0".into(),
        });
      }
      compare_shapes(conn, "legacy vs consolidated checksum at cutover")
    }
    Phase::Contract => Ok(Verification {
      query:    "legacy tables remaining".into(),
      expected: "0".into(),
      actual:   legacy_tables(conn)?.to_string(),
    }),
  }
}

fn backfill_batch(conn: &mut Connection, batch: &BackfillBatch) -> Result<usize> {
  let tx = conn.transaction()?;
  let mut written = 0;
  for id in &batch.keys {
    let (notes, tags) = aggregate::read_legacy(&tx, id)?;
    written += tx.execute(
      "UPDATE leads SET notes_json = ?2, tags_json = ?3 WHERE lead_id = ?1",
      params![id, encode_notes(&notes)?, encode_tags(&tags)?],
    )?;
  }
  tx.commit()?;
  Ok(written)
}

impl ShapeMigration for ConsolidateLeadShape {
  type Error = Error;

  fn migration_id(&self) -> &str { MIGRATION_ID }

  async fn execute(&self, phase: Phase) -> Result<PhaseChange> {
    with_conn(&self.conn, move |conn| execute_phase(conn, phase)).await
  }

  async fn backfill_batches(&self, batch_size: usize) -> Result<Vec<BackfillBatch>> {
    with_conn(&self.conn, move |conn| {
      let mut stmt = conn.prepare("SELECT lead_id FROM leads ORDER BY lead_id")?;
      let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(
        ids
          .chunks(batch_size.max(1))
          .map(|chunk| BackfillBatch {
            batch_id: format!("{}..{}", chunk[0], chunk[chunk.len() - 1]),
            keys:     chunk.to_vec(),
          })
          .collect(),
      )
    })
    .await
  }

  async fn backfill(&self, batch: BackfillBatch) -> Result<usize> {
    with_conn(&self.conn, move |conn| backfill_batch(conn, &batch)).await
  }

  async fn verify(&self, phase: Phase) -> Result<Verification> {
    with_conn(&self.conn, move |conn| verify_phase(conn, phase)).await
  }

  async fn rollback(&self, change: &PhaseChange) -> Result<()> {
    let statements = change.rollback.clone();
    with_conn(&self.conn, move |conn| {
      let tx = conn.transaction()?;
      for stmt in &statements {
        tx.execute_batch(stmt)?;
      }
      tx.commit()?;
      Ok(())
    })
    .await
  }
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

impl MigrationLedger for SqliteStore {
  type Error = Error;

  async fn load_migration(&self, migration_id: &str) -> Result<Option<MigrationRecord>> {
    let migration_id = migration_id.to_owned();
    self
      .with_conn(move |conn| {
        let row: Option<(String, u32)> = conn
          .query_row(
            "SELECT record_json, cutover_errors FROM migrations WHERE migration_id = ?1",
            params![migration_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()?;
        let Some((json, cutover_errors)) = row else {
          return Ok(None);
        };
        let mut record: MigrationRecord = serde_json::from_str(&json)?;
        // Shadow reads bump the column directly; it is the live count.
        record.cutover_errors = cutover_errors;
        Ok(Some(record))
      })
      .await
  }

  async fn save_migration(&self, record: &MigrationRecord) -> Result<()> {
    let id = record.migration_id.clone();
    let json = serde_json::to_string(record)?;
    let updated_at = encode_dt(record.updated_at);
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT INTO migrations (migration_id, record_json, updated_at)
           VALUES (?1, ?2, ?3)
           ON CONFLICT (migration_id) DO UPDATE SET
             record_json = excluded.record_json,
             updated_at  = excluded.updated_at",
          params![id, json, updated_at],
        )?;
        Ok(())
      })
      .await
  }
}

impl SqliteStore {
  /// The live shape flags.
  pub async fn shape(&self) -> Result<Shape> {
    self.with_conn(|conn| Shape::load(conn)).await
  }

  /// Shadow-read mismatches counted since cutover.
  pub async fn cutover_errors(&self) -> Result<u32> {
    self
      .with_conn(|conn| {
        let n: Option<u32> = conn
          .query_row(
            "SELECT cutover_errors FROM migrations WHERE migration_id = ?1",
            params![MIGRATION_ID],
            |row| row.get(0),
          )
          .optional()?;
        Ok(n.unwrap_or(0))
      })
      .await
  }
}
