//! The `PipelineStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g.
//! `leadline-store-sqlite`). The [`Pipeline`](crate::pipeline::Pipeline) and
//! the HTTP layer depend on this abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  IntoDomainError,
  dead_letter::{DeadLetter, NewDeadLetter},
  event::{ActivityEvent, EventKind, JournalPage, NewEvent},
  lead::Lead,
  owner::{BusinessOwner, NormalizedCandidate, Resolution},
  pipeline::StageNotification,
  stage::Stage,
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// Parameters for [`PipelineStore::list_leads`].
#[derive(Debug, Clone, Default)]
pub struct LeadQuery {
  pub company_id: Option<Uuid>,
  pub stage:      Option<Stage>,
  /// Only leads currently holding this tag.
  pub tag:        Option<String>,
  pub limit:      Option<usize>,
  pub offset:     Option<usize>,
}

/// The result of a successful append: the stored entry and the aggregate as
/// patched in the same transaction.
#[derive(Debug, Clone)]
pub struct Appended {
  pub event: ActivityEvent,
  pub lead:  Lead,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a lead pipeline storage backend.
///
/// The journal is append-only. The lead aggregate is derived from it and is
/// patched atomically with every append; [`rebuild_lead`] recomputes it from
/// scratch. A stage-change append also queues a [`StageNotification`] in the
/// same transaction, which stays pending until marked delivered.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
///
/// [`rebuild_lead`]: PipelineStore::rebuild_lead
pub trait PipelineStore: Send + Sync {
  type Error: std::error::Error + IntoDomainError + Send + Sync + 'static;

  // ── Leads ─────────────────────────────────────────────────────────────

  /// Open a new lead in stage `new` for a company.
  fn create_lead(
    &self,
    company_id: Uuid,
  ) -> impl Future<Output = Result<Lead, Self::Error>> + Send + '_;

  fn get_lead(
    &self,
    lead_id: Uuid,
  ) -> impl Future<Output = Result<Option<Lead>, Self::Error>> + Send + '_;

  /// The company's most recently created lead that is not in a terminal
  /// stage.
  fn find_open_lead(
    &self,
    company_id: Uuid,
  ) -> impl Future<Output = Result<Option<Lead>, Self::Error>> + Send + '_;

  fn list_leads<'a>(
    &'a self,
    query: &'a LeadQuery,
  ) -> impl Future<Output = Result<Vec<Lead>, Self::Error>> + Send + 'a;

  /// Replay the lead's journal over an empty aggregate and persist the
  /// result. Fails with `LeadNotFound` for an unknown lead.
  fn rebuild_lead(
    &self,
    lead_id: Uuid,
  ) -> impl Future<Output = Result<Lead, Self::Error>> + Send + '_;

  // ── Journal ───────────────────────────────────────────────────────────

  /// Durably append an event and fold it into the lead in one transaction.
  ///
  /// Fails with `DuplicateEvent` if `source_id` is already journaled, and
  /// with `LeadNotFound` if the lead does not exist.
  fn append(
    &self,
    lead_id: Uuid,
    event: NewEvent,
  ) -> impl Future<Output = Result<Appended, Self::Error>> + Send + '_;

  fn event_by_source<'a>(
    &'a self,
    source_id: &'a str,
  ) -> impl Future<Output = Result<Option<ActivityEvent>, Self::Error>> + Send + 'a;

  /// Up to `limit` entries with `seq > cursor`, in `seq` order.
  fn read_since(
    &self,
    lead_id: Uuid,
    cursor: Option<i64>,
    limit: usize,
  ) -> impl Future<Output = Result<JournalPage, Self::Error>> + Send + '_;

  /// The lead's whole journal, in `seq` order.
  fn history(
    &self,
    lead_id: Uuid,
  ) -> impl Future<Output = Result<Vec<ActivityEvent>, Self::Error>> + Send + '_;

  /// The lead's entries of the given kinds, in `seq` order. `since` drops
  /// entries that occurred before it.
  fn history_of<'a>(
    &'a self,
    lead_id: Uuid,
    kinds: &'a [EventKind],
    since: Option<DateTime<Utc>>,
  ) -> impl Future<Output = Result<Vec<ActivityEvent>, Self::Error>> + Send + 'a;

  // ── Owners ────────────────────────────────────────────────────────────

  /// Match by email key, then phone key, within the candidate's company;
  /// insert if neither matches. Safe under concurrent calls.
  fn resolve_owner(
    &self,
    candidate: NormalizedCandidate,
  ) -> impl Future<Output = Result<Resolution, Self::Error>> + Send + '_;

  fn get_owner(
    &self,
    owner_id: Uuid,
  ) -> impl Future<Output = Result<Option<BusinessOwner>, Self::Error>> + Send + '_;

  /// Owners in any company whose email or phone key matches.
  fn find_owners(
    &self,
    email_key: Option<String>,
    phone_key: Option<String>,
  ) -> impl Future<Output = Result<Vec<BusinessOwner>, Self::Error>> + Send + '_;

  // ── Dead letters ──────────────────────────────────────────────────────

  /// Record a rejection. The same `(source_id, code)` with an identical raw
  /// payload keeps one entry and returns it, reopening it if it had been
  /// acknowledged. A different payload under the same `source_id` is a new
  /// entry.
  fn record_dead_letter(
    &self,
    entry: NewDeadLetter,
  ) -> impl Future<Output = Result<DeadLetter, Self::Error>> + Send + '_;

  fn list_dead_letters(
    &self,
    include_acknowledged: bool,
  ) -> impl Future<Output = Result<Vec<DeadLetter>, Self::Error>> + Send + '_;

  fn get_dead_letter(
    &self,
    dead_letter_id: Uuid,
  ) -> impl Future<Output = Result<Option<DeadLetter>, Self::Error>> + Send + '_;

  /// Mark an entry handled. Fails with `DeadLetterNotFound`.
  fn acknowledge_dead_letter<'a>(
    &'a self,
    dead_letter_id: Uuid,
    operator: &'a str,
  ) -> impl Future<Output = Result<DeadLetter, Self::Error>> + Send + 'a;

  // ── Notification outbox ───────────────────────────────────────────────

  /// Undelivered stage notifications, oldest first, optionally for one lead.
  fn pending_notifications(
    &self,
    lead_id: Option<Uuid>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<StageNotification>, Self::Error>> + Send + '_;

  /// The receiver accepted the notification for `event_id`.
  fn mark_notification_delivered(
    &self,
    event_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Count a failed attempt; the notification stays pending.
  fn record_notification_failure(
    &self,
    event_id: Uuid,
    error: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
