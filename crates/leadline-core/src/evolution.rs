//! Live storage-shape migrations: expand → backfill → cutover → contract.
//!
//! A [`Coordinator`] drives one [`ShapeMigration`] a single phase per call.
//! Each phase reports what it changed and the statements that undo it, and is
//! then verified. A failed verification runs the undo statements and halts the
//! migration until an operator acknowledges the halt. Progress lives in a
//! [`MigrationLedger`] so a restarted process resumes where it stopped,
//! including part-way through a backfill.

use std::{collections::BTreeSet, future::Future, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{Error, IntoDomainError, ServiceError};

// ─── Phases ──────────────────────────────────────────────────────────────────

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
pub enum Phase {
  /// Add the new shape beside the old one; writers start dual-writing.
  Expand,
  /// Copy existing rows into the new shape, in resumable batches.
  Backfill,
  /// Readers switch to the new shape.
  Cutover,
  /// Drop the old shape. Gated on a clean cutover soak.
  Contract,
}

impl Phase {
  pub const ALL: [Phase; 4] =
    [Phase::Expand, Phase::Backfill, Phase::Cutover, Phase::Contract];

  pub fn next(self) -> Option<Phase> {
    match self {
      Self::Expand => Some(Self::Backfill),
      Self::Backfill => Some(Self::Cutover),
      Self::Cutover => Some(Self::Contract),
      Self::Contract => None,
    }
  }

  pub fn predecessor(self) -> Option<Phase> {
    match self {
      Self::Expand => None,
      Self::Backfill => Some(Self::Expand),
      Self::Cutover => Some(Self::Backfill),
      Self::Contract => Some(Self::Cutover),
    }
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// What a phase did, and the statements that undo it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
  pub changes:  Vec<String>,
  pub rollback: Vec<String>,
}

/// The outcome of a phase's verification query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
  pub query:    String,
  pub expected: String,
  pub actual:   String,
}

impl Verification {
  pub fn passed(&self) -> bool { self.expected == self.actual }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
  pub phase:        Phase,
  pub change:       PhaseChange,
  pub verification: Verification,
  pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Halt {
  pub phase:           Phase,
  pub reason:          String,
  /// Whether the phase's undo statements ran cleanly.
  pub rolled_back:     bool,
  pub halted_at:       DateTime<Utc>,
  pub acknowledged_by: Option<String>,
  pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
  pub migration_id:   String,
  /// Verified phases, in order.
  pub completed:      Vec<PhaseRecord>,
  /// Set while the migration is blocked on an operator.
  pub halted:         Option<Halt>,
  pub halt_history:   Vec<Halt>,
  pub backfill_done:  BTreeSet<String>,
  pub cutover_at:     Option<DateTime<Utc>>,
  /// Maintained by the store's shadow reads; the ledger reports the live
  /// count on load.
  pub cutover_errors: u32,
  pub updated_at:     DateTime<Utc>,
}

impl MigrationRecord {
  pub fn new(migration_id: &str, now: DateTime<Utc>) -> Self {
    Self {
      migration_id:   migration_id.to_owned(),
      completed:      Vec::new(),
      halted:         None,
      halt_history:   Vec::new(),
      backfill_done:  BTreeSet::new(),
      cutover_at:     None,
      cutover_errors: 0,
      updated_at:     now,
    }
  }

  pub fn last_phase(&self) -> Option<Phase> {
    self.completed.last().map(|r| r.phase)
  }

  /// The phase `advance` would run, or `None` once contracted.
  pub fn next_phase(&self) -> Option<Phase> {
    match self.last_phase() {
      None => Some(Phase::Expand),
      Some(p) => p.next(),
    }
  }
}

/// One unit of backfill work. `batch_id` is stable across runs so completed
/// batches can be skipped on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillBatch {
  pub batch_id: String,
  pub keys:     Vec<String>,
}

// ─── Seams ───────────────────────────────────────────────────────────────────

/// Durable migration progress.
pub trait MigrationLedger: Send + Sync {
  type Error: std::error::Error + IntoDomainError + Send + Sync + 'static;

  fn load_migration<'a>(
    &'a self,
    migration_id: &'a str,
  ) -> impl Future<Output = Result<Option<MigrationRecord>, Self::Error>> + Send + 'a;

  fn save_migration<'a>(
    &'a self,
    record: &'a MigrationRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// A concrete shape change a backend knows how to perform.
///
/// Implementations are cheap handles (cloned into backfill tasks).
pub trait ShapeMigration: Clone + Send + Sync + 'static {
  type Error: std::error::Error + IntoDomainError + Send + Sync + 'static;

  fn migration_id(&self) -> &str;

  /// Apply a phase's structural change. For [`Phase::Backfill`] this only
  /// prepares; rows are copied through [`ShapeMigration::backfill`].
  fn execute(
    &self,
    phase: Phase,
  ) -> impl Future<Output = Result<PhaseChange, Self::Error>> + Send + '_;

  fn backfill_batches(
    &self,
    batch_size: usize,
  ) -> impl Future<Output = Result<Vec<BackfillBatch>, Self::Error>> + Send + '_;

  /// Copy one batch. Must be idempotent. Returns the number of rows written.
  fn backfill(
    &self,
    batch: BackfillBatch,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  fn verify(
    &self,
    phase: Phase,
  ) -> impl Future<Output = Result<Verification, Self::Error>> + Send + '_;

  fn rollback<'a>(
    &'a self,
    change: &'a PhaseChange,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct EvolutionSettings {
  pub batch_size:      usize,
  pub max_concurrency: usize,
  pub soak_period:     TimeDelta,
}

impl Default for EvolutionSettings {
  fn default() -> Self {
    Self {
      batch_size:      500,
      max_concurrency: 4,
      soak_period:     TimeDelta::hours(24),
    }
  }
}

pub struct Coordinator<M, L> {
  migration: M,
  ledger:    L,
  settings:  EvolutionSettings,
}

type Outcome<T> = Result<T, ServiceError>;

impl<M: ShapeMigration, L: MigrationLedger> Coordinator<M, L> {
  pub fn new(migration: M, ledger: L, settings: EvolutionSettings) -> Self {
    Self { migration, ledger, settings }
  }

  fn id(&self) -> String { self.migration.migration_id().to_owned() }

  pub async fn status(&self) -> Outcome<MigrationRecord> {
    let id = self.id();
    let record = self
      .ledger
      .load_migration(&id)
      .await
      .map_err(ServiceError::from_store)?;
    Ok(record.unwrap_or_else(|| MigrationRecord::new(&id, Utc::now())))
  }

  async fn save(&self, record: &mut MigrationRecord, now: DateTime<Utc>) -> Outcome<()> {
    record.updated_at = now;
    self
      .ledger
      .save_migration(record)
      .await
      .map_err(ServiceError::from_store)
  }

  /// Run exactly one phase. `requested`, when given, must name the next
  /// phase; operators pass it to guard against running something unexpected.
  pub async fn advance(
    &self,
    requested: Option<Phase>,
    now: DateTime<Utc>,
  ) -> Outcome<PhaseRecord> {
    let id = self.id();
    let mut record = self.status().await?;

    if let Some(halt) = &record.halted {
      return Err(Error::MigrationHalted { migration: id, phase: halt.phase }.into());
    }
    let Some(phase) = record.next_phase() else {
      return Err(Error::MigrationComplete(id).into());
    };
    if let Some(requested) = requested {
      if requested != phase {
        return Err(
          Error::PhaseOutOfOrder { migration: id, requested, next: phase }.into(),
        );
      }
    }
    if phase == Phase::Contract {
      self.check_soak(&record, now)?;
    }

    tracing::info!(migration = %id, %phase, "running migration phase");
    let change = self
      .migration
      .execute(phase)
      .await
      .map_err(ServiceError::from_store)?;

    if phase == Phase::Backfill {
      self.run_backfill(&mut record, now).await?;
    }

    let verification = self
      .migration
      .verify(phase)
      .await
      .map_err(ServiceError::from_store)?;

    if !verification.passed() {
      return Err(self.halt(&mut record, phase, &change, verification, now).await);
    }

    let completed = PhaseRecord { phase, change, verification, completed_at: now };
    record.completed.push(completed.clone());
    if phase == Phase::Cutover {
      record.cutover_at = Some(now);
    }
    self.save(&mut record, now).await?;
    tracing::info!(migration = %id, %phase, "migration phase verified");
    Ok(completed)
  }

  fn check_soak(&self, record: &MigrationRecord, now: DateTime<Utc>) -> Outcome<()> {
    let soaked_at = record
      .cutover_at
      .map(|at| at + self.settings.soak_period)
      .unwrap_or(now + self.settings.soak_period);
    let remaining = (soaked_at - now).num_seconds().max(0);
    if remaining > 0 || record.cutover_errors > 0 {
      return Err(
        Error::SoakIncomplete {
          migration:      record.migration_id.clone(),
          remaining_secs: remaining,
          errors:         record.cutover_errors,
        }
        .into(),
      );
    }
    Ok(())
  }

  async fn run_backfill(
    &self,
    record: &mut MigrationRecord,
    now: DateTime<Utc>,
  ) -> Outcome<()> {
    let batches = self
      .migration
      .backfill_batches(self.settings.batch_size.max(1))
      .await
      .map_err(ServiceError::from_store)?;
    let total = batches.len();
    let pending: Vec<_> = batches
      .into_iter()
      .filter(|b| !record.backfill_done.contains(&b.batch_id))
      .collect();
    tracing::info!(
      migration = %record.migration_id,
      total,
      pending = pending.len(),
      "backfilling"
    );

    let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for batch in pending {
      let migration = self.migration.clone();
      let permits = permits.clone();
      tasks.spawn(async move {
        let batch_id = batch.batch_id.clone();
        let result = match permits.acquire_owned().await {
          Ok(_permit) => migration
            .backfill(batch)
            .await
            .map_err(ServiceError::from_store),
          Err(closed) => Err(ServiceError::Store(Box::new(closed))),
        };
        (batch_id, result)
      });
    }

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((batch_id, Ok(rows))) => {
          tracing::debug!(batch = %batch_id, rows, "backfill batch done");
          record.backfill_done.insert(batch_id);
          self.save(record, now).await?;
        }
        Ok((batch_id, Err(err))) => {
          tracing::warn!(batch = %batch_id, error = %err, "backfill batch failed");
          failure.get_or_insert(err);
        }
        Err(join) => {
          failure.get_or_insert(ServiceError::Store(Box::new(join)));
        }
      }
    }

    match failure {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  async fn halt(
    &self,
    record: &mut MigrationRecord,
    phase: Phase,
    change: &PhaseChange,
    verification: Verification,
    now: DateTime<Utc>,
  ) -> ServiceError {
    let id = record.migration_id.clone();
    tracing::error!(
      migration = %id,
      %phase,
      expected = %verification.expected,
      actual = %verification.actual,
      "migration verification failed; rolling back"
    );

    let rolled_back = match self.migration.rollback(change).await {
      Ok(()) => true,
      Err(err) => {
        tracing::error!(migration = %id, %phase, error = %err, "rollback failed");
        false
      }
    };
    if phase == Phase::Backfill {
      record.backfill_done.clear();
    }
    record.halted = Some(Halt {
      phase,
      reason: format!(
        "{}: expected {}, got {}",
        verification.query, verification.expected, verification.actual
      ),
      rolled_back,
      halted_at: now,
      acknowledged_by: None,
      acknowledged_at: None,
    });
    if let Err(err) = self.save(record, now).await {
      return err;
    }

    Error::MigrationVerificationFailure {
      migration: id,
      phase,
      expected: verification.expected,
      actual: verification.actual,
    }
    .into()
  }

  /// Clear a halt so the failed phase can be retried.
  pub async fn acknowledge(
    &self,
    operator: &str,
    now: DateTime<Utc>,
  ) -> Outcome<Halt> {
    let mut record = self.status().await?;
    let Some(mut halt) = record.halted.take() else {
      return Err(Error::NothingToAcknowledge(self.id()).into());
    };
    halt.acknowledged_by = Some(operator.to_owned());
    halt.acknowledged_at = Some(now);
    record.halt_history.push(halt.clone());
    self.save(&mut record, now).await?;
    tracing::info!(migration = %record.migration_id, phase = %halt.phase, operator, "halt acknowledged");
    Ok(halt)
  }

  /// Undo the most recently verified phase using its recorded statements.
  pub async fn rollback_last(&self, now: DateTime<Utc>) -> Outcome<PhaseRecord> {
    let id = self.id();
    let mut record = self.status().await?;
    if let Some(halt) = &record.halted {
      return Err(Error::MigrationHalted { migration: id, phase: halt.phase }.into());
    }
    let Some(last) = record.completed.pop() else {
      return Err(Error::NothingToRollBack(id).into());
    };

    self
      .migration
      .rollback(&last.change)
      .await
      .map_err(ServiceError::from_store)?;
    match last.phase {
      Phase::Backfill => record.backfill_done.clear(),
      Phase::Cutover => record.cutover_at = None,
      Phase::Expand | Phase::Contract => {}
    }
    self.save(&mut record, now).await?;
    tracing::warn!(migration = %id, phase = %last.phase, "migration phase rolled back");
    Ok(last)
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::BTreeMap,
    sync::Mutex,
  };

  use chrono::TimeZone;

  use super::*;

  #[derive(Debug, thiserror::Error)]
  enum FakeError {
    #[error(transparent)]
    Core(#[from] Error),
    #[error("batch {0} failed")]
    Batch(String),
  }

  impl IntoDomainError for FakeError {
    fn into_domain(self) -> Result<Error, Self> {
      match self {
        Self::Core(e) => Ok(e),
        other => Err(other),
      }
    }
  }

  #[derive(Default)]
  struct FakeState {
    rows:          usize,
    copied:        BTreeSet<String>,
    applied:       Vec<String>,
    fail_verify:   Option<Phase>,
    fail_batch:    Option<String>,
    running:       usize,
    peak:          usize,
    ledger:        BTreeMap<String, MigrationRecord>,
    backfill_runs: usize,
  }

  #[derive(Clone, Default)]
  struct Fake(Arc<Mutex<FakeState>>);

  impl Fake {
    fn with_rows(rows: usize) -> Self {
      let fake = Self::default();
      fake.0.lock().unwrap().rows = rows;
      fake
    }
  }

  impl ShapeMigration for Fake {
    type Error = FakeError;

    fn migration_id(&self) -> &str { "fake" }

    async fn execute(&self, phase: Phase) -> Result<PhaseChange, FakeError> {
      self.0.lock().unwrap().applied.push(format!("do {phase}"));
      Ok(PhaseChange {
        changes:  vec![format!("do {phase}")],
        rollback: vec![format!("undo {phase}")],
      })
    }

    async fn backfill_batches(
      &self,
      batch_size: usize,
    ) -> Result<Vec<BackfillBatch>, FakeError> {
      let rows = self.0.lock().unwrap().rows;
      let keys: Vec<String> = (0..rows).map(|i| format!("{i:04}")).collect();
      Ok(
        keys
          .chunks(batch_size)
          .map(|c| BackfillBatch { batch_id: c[0].clone(), keys: c.to_vec() })
          .collect(),
      )
    }

    async fn backfill(&self, batch: BackfillBatch) -> Result<usize, FakeError> {
      {
        let mut s = self.0.lock().unwrap();
        s.backfill_runs += 1;
        s.running += 1;
        s.peak = s.peak.max(s.running);
        if s.fail_batch.as_deref() == Some(batch.batch_id.as_str()) {
          s.fail_batch = None;
          s.running -= 1;
          return Err(FakeError::Batch(batch.batch_id));
        }
      }
      tokio::task::yield_now().await;
      let mut s = self.0.lock().unwrap();
      s.running -= 1;
      let n = batch.keys.len();
      s.copied.extend(batch.keys);
      Ok(n)
    }

    async fn verify(&self, phase: Phase) -> Result<Verification, FakeError> {
      let s = self.0.lock().unwrap();
      let expected = s.rows.to_string();
      let actual = if s.fail_verify == Some(phase) {
        "0".to_owned()
      } else if phase == Phase::Backfill {
        s.copied.len().to_string()
      } else {
        expected.clone()
      };
      Ok(Verification { query: format!("count after {phase}"), expected, actual })
    }

    async fn rollback(&self, change: &PhaseChange) -> Result<(), FakeError> {
      self.0.lock().unwrap().applied.extend(change.rollback.iter().cloned());
      Ok(())
    }
  }

  impl MigrationLedger for Fake {
    type Error = FakeError;

    async fn load_migration(
      &self,
      migration_id: &str,
    ) -> Result<Option<MigrationRecord>, FakeError> {
      Ok(self.0.lock().unwrap().ledger.get(migration_id).cloned())
    }

    async fn save_migration(&self, record: &MigrationRecord) -> Result<(), FakeError> {
      self
        .0
        .lock()
        .unwrap()
        .ledger
        .insert(record.migration_id.clone(), record.clone());
      Ok(())
    }
  }

  fn t(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + TimeDelta::hours(hours)
  }

  fn coordinator(fake: &Fake) -> Coordinator<Fake, Fake> {
    Coordinator::new(fake.clone(), fake.clone(), EvolutionSettings {
      batch_size:      3,
      max_concurrency: 2,
      soak_period:     TimeDelta::hours(24),
    })
  }

  fn domain(err: ServiceError) -> Error {
    match err {
      ServiceError::Domain(e) => e,
      other => panic!("expected a domain error, got {other}"),
    }
  }

  #[tokio::test]
  async fn phases_run_in_order_one_per_call() {
    let fake = Fake::with_rows(10);
    let c = coordinator(&fake);

    assert_eq!(c.advance(None, t(0)).await.unwrap().phase, Phase::Expand);
    assert_eq!(c.advance(None, t(1)).await.unwrap().phase, Phase::Backfill);
    assert_eq!(fake.0.lock().unwrap().copied.len(), 10);
    assert!(fake.0.lock().unwrap().peak <= 2);

    let err = domain(c.advance(Some(Phase::Contract), t(2)).await.unwrap_err());
    assert!(matches!(err, Error::PhaseOutOfOrder { next: Phase::Cutover, .. }));

    assert_eq!(c.advance(None, t(2)).await.unwrap().phase, Phase::Cutover);
    let status = c.status().await.unwrap();
    assert_eq!(status.cutover_at, Some(t(2)));
    assert_eq!(status.next_phase(), Some(Phase::Contract));
  }

  #[tokio::test]
  async fn contract_waits_for_a_clean_soak() {
    let fake = Fake::with_rows(4);
    let c = coordinator(&fake);
    for hour in 0..3 {
      c.advance(None, t(hour)).await.unwrap();
    }

    let err = domain(c.advance(None, t(10)).await.unwrap_err());
    assert!(matches!(
      err,
      Error::SoakIncomplete { remaining_secs: 57600, errors: 0, .. }
    ));

    // A shadow-read mismatch during the soak also blocks contraction.
    fake.0.lock().unwrap().ledger.get_mut("fake").unwrap().cutover_errors = 1;
    let err = domain(c.advance(None, t(30)).await.unwrap_err());
    assert!(matches!(err, Error::SoakIncomplete { errors: 1, .. }));

    fake.0.lock().unwrap().ledger.get_mut("fake").unwrap().cutover_errors = 0;
    assert_eq!(c.advance(None, t(30)).await.unwrap().phase, Phase::Contract);
    let err = domain(c.advance(None, t(31)).await.unwrap_err());
    assert!(matches!(err, Error::MigrationComplete(_)));
  }

  #[tokio::test]
  async fn failed_verification_rolls_back_and_halts() {
    let fake = Fake::with_rows(4);
    fake.0.lock().unwrap().fail_verify = Some(Phase::Expand);
    let c = coordinator(&fake);

    let err = domain(c.advance(None, t(0)).await.unwrap_err());
    assert!(matches!(
      err,
      Error::MigrationVerificationFailure { phase: Phase::Expand, .. }
    ));
    assert_eq!(fake.0.lock().unwrap().applied, ["do expand", "undo expand"]);

    // Blocked until acknowledged, even once the fault is fixed.
    fake.0.lock().unwrap().fail_verify = None;
    let err = domain(c.advance(None, t(1)).await.unwrap_err());
    assert!(matches!(err, Error::MigrationHalted { .. }));

    let halt = c.acknowledge("dana", t(2)).await.unwrap();
    assert!(halt.rolled_back);
    assert_eq!(halt.acknowledged_by.as_deref(), Some("dana"));
    assert_eq!(c.advance(None, t(3)).await.unwrap().phase, Phase::Expand);

    let err = domain(c.acknowledge("dana", t(4)).await.unwrap_err());
    assert!(matches!(err, Error::NothingToAcknowledge(_)));
  }

  #[tokio::test]
  async fn interrupted_backfill_resumes_without_redoing_batches() {
    let fake = Fake::with_rows(9);
    fake.0.lock().unwrap().fail_batch = Some("0003".into());
    let c = coordinator(&fake);
    c.advance(None, t(0)).await.unwrap();

    assert!(c.advance(None, t(1)).await.is_err());
    let done = c.status().await.unwrap().backfill_done;
    assert_eq!(done.len(), 2);
    assert!(!done.contains("0003"));

    let runs_before = fake.0.lock().unwrap().backfill_runs;
    assert_eq!(c.advance(None, t(2)).await.unwrap().phase, Phase::Backfill);
    assert_eq!(fake.0.lock().unwrap().backfill_runs, runs_before + 1);
  }

  #[tokio::test]
  async fn rollback_last_undoes_the_latest_phase() {
    let fake = Fake::with_rows(2);
    let c = coordinator(&fake);
    c.advance(None, t(0)).await.unwrap();
    c.advance(None, t(1)).await.unwrap();

    let undone = c.rollback_last(t(2)).await.unwrap();
    assert_eq!(undone.phase, Phase::Backfill);
    let status = c.status().await.unwrap();
    assert!(status.backfill_done.is_empty());
    assert_eq!(status.next_phase(), Some(Phase::Backfill));

    c.rollback_last(t(3)).await.unwrap();
    let err = domain(c.rollback_last(t(4)).await.unwrap_err());
    assert!(matches!(err, Error::NothingToRollBack(_)));
  }
}
