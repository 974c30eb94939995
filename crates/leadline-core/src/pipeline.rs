//! The pipeline service: normalise, journal, react.
//!
//! [`Pipeline`] is the single entry point for writes. Every write to a lead
//! happens under that lead's async mutex, so appends and the reactions they
//! trigger are serialised per lead while different leads proceed in parallel.
//! Reactions run synchronously after each append and are idempotent; a
//! redelivered signal re-runs them against the already-stored event, which
//! completes any reaction a crash interrupted. For the same reason stage
//! notifications are read back from the store's outbox after each write
//! rather than sent straight from the reaction.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};
use uuid::Uuid;

use crate::{
  Error, ServiceError,
  dead_letter::{DeadLetter, DeadLetterPayload, NewDeadLetter},
  event::{
    ActivityEvent, AppointmentBooked, EventPayload, JournalPage, NewEvent,
    OwnerLinked, StageChanged,
  },
  lead::{Lead, LeadView},
  normalize::{self, LeadRef, RawSignal},
  owner::{self, OwnerCandidate, Resolution},
  rules::RuleEngine,
  stage::{self, Stage, Transition, TransitionCause},
  store::{LeadQuery, PipelineStore},
  tag::TagCatalog,
};

/// `source` recorded on stage changes the controller derives.
pub const STAGE_SOURCE: &str = "stage_controller";

const MAX_PAGE: usize = 500;

type Outcome<T> = Result<T, ServiceError>;

// ─── Commands and reports ────────────────────────────────────────────────────

/// An operator's request to move a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCommand {
  pub lead_id:    Uuid,
  pub to:         Stage,
  pub operator:   String,
  /// Client-chosen idempotency key. Retrying with the same key is safe.
  #[serde(default)]
  pub request_id: Option<String>,
}

/// Published after every stage change. The store queues one per stage-change
/// entry; delivery is at-least-once and consumers dedupe on
/// [`StageNotification::dedupe_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNotification {
  /// The stage-change entry this announces.
  pub event_id:    Uuid,
  pub lead_id:     Uuid,
  pub from:        Stage,
  pub to:          Stage,
  pub occurred_at: DateTime<Utc>,
}

impl StageNotification {
  pub fn dedupe_key(&self) -> String {
    format!("{}:{}:{}", self.lead_id, self.to, self.occurred_at.to_rfc3339())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
  pub lead_id:      Uuid,
  /// The signal's events as journaled (by this call or an earlier delivery).
  pub recorded:     Vec<ActivityEvent>,
  /// Every event was already in the journal.
  pub duplicate:    bool,
  /// Tags, stage changes, and owner links derived by this call.
  pub derived:      Vec<ActivityEvent>,
  pub stage:        Stage,
  /// Dead letters raised by reactions (e.g. a refused automatic transition).
  pub dead_letters: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transitioned {
  pub lead:  Lead,
  /// `None` when the lead was already in the requested stage.
  pub event: Option<ActivityEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerLink {
  pub resolution: Resolution,
  pub lead:       Lead,
}

// ─── Per-lead locks ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LeadLocks {
  inner: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl LeadLocks {
  fn entry(&self, lead_id: Uuid) -> Arc<AsyncMutex<()>> {
    let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    // Drop locks nobody holds or waits on.
    map.retain(|id, m| *id == lead_id || Arc::strong_count(m) > 1);
    map.entry(lead_id).or_default().clone()
  }

  pub async fn lock(&self, lead_id: Uuid) -> OwnedMutexGuard<()> {
    self.entry(lead_id).lock_owned().await
  }
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub struct Pipeline<S> {
  store:    Arc<S>,
  rules:    Arc<RuleEngine>,
  locks:    Arc<LeadLocks>,
  notifier: Option<mpsc::UnboundedSender<StageNotification>>,
}

impl<S> Clone for Pipeline<S> {
  fn clone(&self) -> Self {
    Self {
      store:    self.store.clone(),
      rules:    self.rules.clone(),
      locks:    self.locks.clone(),
      notifier: self.notifier.clone(),
    }
  }
}

impl<S: PipelineStore> Pipeline<S> {
  pub fn new(store: Arc<S>, rules: RuleEngine) -> Self {
    Self {
      store,
      rules: Arc::new(rules),
      locks: Arc::default(),
      notifier: None,
    }
  }

  /// Hand undelivered stage changes to `tx` after each write. The receiver
  /// treats them as a wake-up; the store's outbox is the source of truth.
  pub fn with_notifications(
    mut self,
    tx: mpsc::UnboundedSender<StageNotification>,
  ) -> Self {
    self.notifier = Some(tx);
    self
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn catalog(&self) -> &TagCatalog { self.rules.catalog() }

  // ── Leads ─────────────────────────────────────────────────────────────

  pub async fn open_lead(&self, company_id: Uuid) -> Outcome<Lead> {
    let lead = self
      .store
      .create_lead(company_id)
      .await
      .map_err(ServiceError::from_store)?;
    tracing::info!(lead_id = %lead.lead_id, %company_id, "lead opened");
    Ok(lead)
  }

  async fn require_lead(&self, lead_id: Uuid) -> Outcome<Lead> {
    self
      .store
      .get_lead(lead_id)
      .await
      .map_err(ServiceError::from_store)?
      .ok_or_else(|| Error::LeadNotFound(lead_id).into())
  }

  async fn view(&self, lead: Lead) -> Outcome<LeadView> {
    let owner = match lead.business_owner_id {
      Some(id) => self
        .store
        .get_owner(id)
        .await
        .map_err(ServiceError::from_store)?,
      None => None,
    };
    Ok(LeadView::new(lead, owner, self.catalog()))
  }

  pub async fn lead_view(&self, lead_id: Uuid) -> Outcome<LeadView> {
    let lead = self.require_lead(lead_id).await?;
    self.view(lead).await
  }

  pub async fn list_leads(&self, query: &LeadQuery) -> Outcome<Vec<LeadView>> {
    let leads = self
      .store
      .list_leads(query)
      .await
      .map_err(ServiceError::from_store)?;
    let mut views = Vec::with_capacity(leads.len());
    for lead in leads {
      views.push(self.view(lead).await?);
    }
    Ok(views)
  }

  pub async fn journal(
    &self,
    lead_id: Uuid,
    cursor: Option<i64>,
    limit: usize,
  ) -> Outcome<JournalPage> {
    self.require_lead(lead_id).await?;
    self
      .store
      .read_since(lead_id, cursor, limit.clamp(1, MAX_PAGE))
      .await
      .map_err(ServiceError::from_store)
  }

  /// Recompute the aggregate from the journal.
  pub async fn rebuild(&self, lead_id: Uuid) -> Outcome<Lead> {
    let _guard = self.locks.lock(lead_id).await;
    let lead = self
      .store
      .rebuild_lead(lead_id)
      .await
      .map_err(ServiceError::from_store)?;
    tracing::info!(%lead_id, seq = lead.journal_seq, "lead rebuilt from journal");
    Ok(lead)
  }

  // ── Ingestion ─────────────────────────────────────────────────────────

  /// Accept a signal. Rejections are dead-lettered and returned as errors;
  /// a redelivery is not an error and reports `duplicate`.
  pub async fn ingest(&self, signal: RawSignal) -> Outcome<IngestReport> {
    let events = match normalize::normalize(&signal) {
      Ok(events) => events,
      Err(err) => return Err(self.reject(&signal, None, err).await),
    };
    let lead = match self.resolve_lead(&signal.lead).await {
      Ok(lead) => lead,
      Err(ServiceError::Domain(err)) => {
        return Err(self.reject(&signal, None, err).await);
      }
      Err(other) => return Err(other),
    };
    if let Err(err) = self.check_tags(&events) {
      return Err(self.reject(&signal, Some(lead.lead_id), err).await);
    }

    let lead_id = lead.lead_id;
    let _guard = self.locks.lock(lead_id).await;

    let mut report = IngestReport {
      lead_id,
      recorded: Vec::new(),
      duplicate: true,
      derived: Vec::new(),
      stage: lead.stage,
      dead_letters: Vec::new(),
    };

    for new in events {
      let (event, fresh) = match self.append(lead_id, new).await? {
        Appended::Fresh(event) => (event, true),
        Appended::Existing(event) => (event, false),
      };
      if fresh {
        report.duplicate = false;
        tracing::info!(
          %lead_id,
          source = %event.source,
          source_id = %event.source_id,
          kind = %event.kind(),
          seq = event.seq,
          "event journaled"
        );
      } else {
        tracing::debug!(source_id = %event.source_id, "duplicate delivery; re-running reactions");
      }
      if event.lead_id == lead_id {
        self.react(&event, &mut report).await?;
      }
      report.recorded.push(event);
    }

    report.stage = self.require_lead(lead_id).await?.stage;
    self.announce(lead_id).await;
    Ok(report)
  }

  async fn resolve_lead(&self, target: &LeadRef) -> Outcome<Lead> {
    match target {
      LeadRef::Lead { lead_id } => self.require_lead(*lead_id).await,
      LeadRef::Company { company_id } => self
        .store
        .find_open_lead(*company_id)
        .await
        .map_err(ServiceError::from_store)?
        .ok_or_else(|| Error::NoOpenLead(*company_id).into()),
      LeadRef::Contact { email, phone } => {
        let email_key = email.as_deref().and_then(owner::email_key);
        let phone_key = phone.as_deref().and_then(owner::phone_key);
        let unmatched = || -> ServiceError {
          Error::NoMatchingLead { email: email.clone(), phone: phone.clone() }
            .into()
        };
        if email_key.is_none() && phone_key.is_none() {
          return Err(unmatched());
        }

        let mut owners = self
          .store
          .find_owners(email_key.clone(), phone_key)
          .await
          .map_err(ServiceError::from_store)?;
        // Email matches win over phone matches.
        owners.sort_by_key(|o| {
          o.email.as_deref().and_then(owner::email_key) != email_key
        });
        for candidate in owners {
          if let Some(lead) = self
            .store
            .find_open_lead(candidate.company_id)
            .await
            .map_err(ServiceError::from_store)?
          {
            return Ok(lead);
          }
        }
        Err(unmatched())
      }
    }
  }

  /// Operator tag commands must name a catalog entry.
  fn check_tags(&self, events: &[NewEvent]) -> Result<(), Error> {
    for event in events {
      let tag_type = match &event.payload {
        EventPayload::TagApplied(g) => &g.tag_type,
        EventPayload::TagRemoved(r) => &r.tag_type,
        _ => continue,
      };
      if !self.catalog().contains(tag_type) {
        return Err(Error::UnknownTag(tag_type.clone()));
      }
    }
    Ok(())
  }

  async fn reject(
    &self,
    signal: &RawSignal,
    lead_id: Option<Uuid>,
    err: Error,
  ) -> ServiceError {
    tracing::warn!(
      source = %signal.source,
      source_id = %signal.source_id,
      error = %err,
      "signal rejected"
    );
    let entry = NewDeadLetter::signal(signal, lead_id, &err);
    if let Err(store_err) = self.store.record_dead_letter(entry).await {
      tracing::error!(error = %store_err, "failed to record dead letter");
    }
    err.into()
  }

  async fn append(&self, lead_id: Uuid, event: NewEvent) -> Outcome<Appended> {
    match self
      .store
      .append(lead_id, event)
      .await
      .map_err(ServiceError::from_store)
    {
      Ok(appended) => Ok(Appended::Fresh(appended.event)),
      Err(ServiceError::Domain(Error::DuplicateEvent { source_id, existing })) => {
        let event = self
          .store
          .event_by_source(&source_id)
          .await
          .map_err(ServiceError::from_store)?
          .ok_or(Error::DuplicateEvent { source_id, existing })?;
        Ok(Appended::Existing(event))
      }
      Err(other) => Err(other),
    }
  }

  /// Append a derived event; an earlier run may already have stored it.
  async fn derive(
    &self,
    lead_id: Uuid,
    event: NewEvent,
    report: &mut IngestReport,
  ) -> Outcome<Option<ActivityEvent>> {
    match self.append(lead_id, event).await? {
      Appended::Fresh(event) => {
        report.derived.push(event.clone());
        Ok(Some(event))
      }
      Appended::Existing(_) => Ok(None),
    }
  }

  // ── Reactions ─────────────────────────────────────────────────────────

  async fn react(
    &self,
    event: &ActivityEvent,
    report: &mut IngestReport,
  ) -> Outcome<()> {
    let lead_id = event.lead_id;
    let lead = self.require_lead(lead_id).await?;
    let scope = self.rules.history_scope(event);
    let history = if scope.kinds.is_empty() {
      Vec::new()
    } else {
      self
        .store
        .history_of(lead_id, &scope.kinds, scope.since)
        .await
        .map_err(ServiceError::from_store)?
    };

    for grant in self.rules.evaluate(event, &history, &lead) {
      let tag = grant.tag_type.clone();
      if self.derive(lead_id, grant.into_event(), report).await?.is_some() {
        tracing::info!(%lead_id, %tag, trigger = %event.source_id, "tag granted");
      }
    }

    if let EventPayload::WebhookAppointment(booking) = &event.payload {
      self.book_appointment(event, &lead, report).await?;
      if lead.business_owner_id.is_none() {
        self.link_contact(event, booking, &lead, report).await?;
      }
    }
    Ok(())
  }

  async fn book_appointment(
    &self,
    event: &ActivityEvent,
    lead: &Lead,
    report: &mut IngestReport,
  ) -> Outcome<()> {
    let cause = TransitionCause::AppointmentBooked;
    match stage::plan(lead.stage, Stage::Appointment, cause) {
      Ok(Transition::Unchanged) => Ok(()),
      Ok(Transition::Move { from, to }) => {
        let change = NewEvent {
          source_id:   format!("stage:appointment:{}", event.source_id),
          source:      STAGE_SOURCE.into(),
          occurred_at: event.occurred_at,
          payload:     EventPayload::StageChange(StageChanged {
            from,
            to,
            cause,
            actor: None,
          }),
        };
        if self.derive(lead.lead_id, change, report).await?.is_some() {
          tracing::info!(lead_id = %lead.lead_id, %from, %to, "appointment moved lead");
        }
        Ok(())
      }
      Err(err) => {
        tracing::warn!(
          lead_id = %lead.lead_id,
          source_id = %event.source_id,
          allowed = ?stage::successors(lead.stage, cause).collect::<Vec<_>>(),
          error = %err,
          "automatic transition refused"
        );
        let command = StageCommand {
          lead_id:    lead.lead_id,
          to:         Stage::Appointment,
          operator:   event.source.clone(),
          request_id: None,
        };
        let entry =
          NewDeadLetter::command(&command, Some(event.source_id.clone()), &err);
        let letter = self
          .store
          .record_dead_letter(entry)
          .await
          .map_err(ServiceError::from_store)?;
        report.dead_letters.push(letter.dead_letter_id);
        Ok(())
      }
    }
  }

  async fn link_contact(
    &self,
    event: &ActivityEvent,
    booking: &AppointmentBooked,
    lead: &Lead,
    report: &mut IngestReport,
  ) -> Outcome<()> {
    let candidate = OwnerCandidate {
      company_id:    lead.company_id,
      name:          booking.contact.name.clone(),
      email:         booking.contact.email.clone(),
      phone:         booking.contact.phone.clone(),
      auth_provider: None,
    };
    let Ok(candidate) = candidate.normalize() else {
      tracing::debug!(source_id = %event.source_id, "appointment carries no usable contact");
      return Ok(());
    };
    let resolution = self
      .store
      .resolve_owner(candidate)
      .await
      .map_err(ServiceError::from_store)?;
    let link = NewEvent {
      source_id:   format!("owner:{}", event.source_id),
      source:      STAGE_SOURCE.into(),
      occurred_at: event.occurred_at,
      payload:     EventPayload::OwnerLinked(OwnerLinked {
        owner_id: resolution.owner.owner_id,
      }),
    };
    self.derive(lead.lead_id, link, report).await?;
    Ok(())
  }

  /// Pass the lead's undelivered stage changes to the notifier, including
  /// any an earlier run journaled but never got out. The write has already
  /// committed, so failures here are only logged.
  async fn announce(&self, lead_id: Uuid) {
    let Some(tx) = &self.notifier else { return };
    let pending = match self.store.pending_notifications(Some(lead_id), MAX_PAGE).await {
      Ok(pending) => pending,
      Err(err) => {
        tracing::error!(%lead_id, error = %err, "failed to read notification outbox");
        return;
      }
    };
    for note in pending {
      if tx.send(note).is_err() {
        tracing::warn!(%lead_id, "notification channel closed");
        return;
      }
    }
  }

  // ── Operator commands ─────────────────────────────────────────────────

  /// Move a lead on an operator's behalf.
  pub async fn transition(&self, command: StageCommand) -> Outcome<Transitioned> {
    self.command(command, TransitionCause::Operator).await
  }

  /// Bring a closed lead back to `contacted`.
  pub async fn reopen(
    &self,
    lead_id: Uuid,
    operator: String,
    request_id: Option<String>,
  ) -> Outcome<Transitioned> {
    let command = StageCommand { lead_id, to: Stage::Contacted, operator, request_id };
    self.command(command, TransitionCause::Reopen).await
  }

  async fn command(
    &self,
    command: StageCommand,
    cause: TransitionCause,
  ) -> Outcome<Transitioned> {
    let lead_id = command.lead_id;
    let _guard = self.locks.lock(lead_id).await;
    let lead = self.require_lead(lead_id).await?;

    let source_id = format!(
      "stage-command:{}",
      command
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
    );

    let (from, to) = match stage::plan(lead.stage, command.to, cause) {
      Ok(Transition::Unchanged) => {
        self.announce(lead_id).await;
        return Ok(Transitioned { lead, event: None });
      }
      Ok(Transition::Move { from, to }) => (from, to),
      Err(err) => {
        tracing::warn!(
          %lead_id,
          operator = %command.operator,
          allowed = ?stage::successors(lead.stage, cause).collect::<Vec<_>>(),
          error = %err,
          "transition refused"
        );
        let entry = NewDeadLetter::command(&command, Some(source_id), &err);
        if let Err(store_err) = self.store.record_dead_letter(entry).await {
          tracing::error!(error = %store_err, "failed to record dead letter");
        }
        return Err(err.into());
      }
    };

    let change = NewEvent {
      source_id,
      source: normalize::SOURCE_OPERATOR.into(),
      occurred_at: Utc::now(),
      payload: EventPayload::StageChange(StageChanged {
        from,
        to,
        cause,
        actor: Some(command.operator.clone()),
      }),
    };
    let event = match self.append(lead_id, change).await? {
      Appended::Fresh(event) => {
        tracing::info!(%lead_id, %from, %to, %cause, operator = %command.operator, "lead moved");
        event
      }
      Appended::Existing(event) => event,
    };
    self.announce(lead_id).await;
    let lead = self.require_lead(lead_id).await?;
    Ok(Transitioned { lead, event: Some(event) })
  }

  /// Resolve an owner for the lead's company and link it to the lead.
  pub async fn link_owner(
    &self,
    lead_id: Uuid,
    candidate: OwnerCandidate,
  ) -> Outcome<OwnerLink> {
    let _guard = self.locks.lock(lead_id).await;
    let lead = self.require_lead(lead_id).await?;
    let candidate = OwnerCandidate { company_id: lead.company_id, ..candidate }
      .normalize()?;

    let resolution = self
      .store
      .resolve_owner(candidate)
      .await
      .map_err(ServiceError::from_store)?;
    let owner_id = resolution.owner.owner_id;
    tracing::info!(%lead_id, %owner_id, matched_on = ?resolution.matched_on, "owner resolved");

    if lead.business_owner_id == Some(owner_id) {
      return Ok(OwnerLink { resolution, lead });
    }
    let link = NewEvent {
      source_id:   format!("owner-link:{lead_id}:{owner_id}:{}", lead.journal_seq),
      source:      normalize::SOURCE_OPERATOR.into(),
      occurred_at: Utc::now(),
      payload:     EventPayload::OwnerLinked(OwnerLinked { owner_id }),
    };
    self.append(lead_id, link).await?;
    let lead = self.require_lead(lead_id).await?;
    Ok(OwnerLink { resolution, lead })
  }

  // ── Dead letters ──────────────────────────────────────────────────────

  pub async fn dead_letters(&self, include_acknowledged: bool) -> Outcome<Vec<DeadLetter>> {
    self
      .store
      .list_dead_letters(include_acknowledged)
      .await
      .map_err(ServiceError::from_store)
  }

  pub async fn acknowledge(&self, dead_letter_id: Uuid, operator: &str) -> Outcome<DeadLetter> {
    self
      .store
      .acknowledge_dead_letter(dead_letter_id, operator)
      .await
      .map_err(ServiceError::from_store)
  }

  /// Re-submit a dead-lettered signal or command. On success the entry is
  /// acknowledged on the operator's behalf.
  pub async fn replay_dead_letter(
    &self,
    dead_letter_id: Uuid,
    operator: &str,
  ) -> Outcome<DeadLetter> {
    let letter = self
      .store
      .get_dead_letter(dead_letter_id)
      .await
      .map_err(ServiceError::from_store)?
      .ok_or(Error::DeadLetterNotFound(dead_letter_id))?;

    match letter.raw {
      DeadLetterPayload::Signal(signal) => {
        self.ingest(signal).await?;
      }
      DeadLetterPayload::StageCommand(command) => {
        self.transition(command).await?;
      }
    }
    tracing::info!(%dead_letter_id, operator, "dead letter replayed");
    self.acknowledge(dead_letter_id, operator).await
  }
}

enum Appended {
  Fresh(ActivityEvent),
  Existing(ActivityEvent),
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[tokio::test]
  async fn lead_locks_serialise_one_lead_only() {
    let locks = LeadLocks::default();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let held = locks.lock(a).await;
    // Another lead is independent.
    let _other = locks.lock(b).await;
    assert!(locks.entry(a).try_lock().is_err());
    drop(held);
    assert!(locks.entry(a).try_lock().is_ok());
  }

  #[test]
  fn notification_dedupe_key_names_lead_stage_and_time() {
    let note = StageNotification {
      event_id:    Uuid::new_v4(),
      lead_id:     Uuid::nil(),
      from:        Stage::New,
      to:          Stage::Appointment,
      occurred_at: Utc.with_ymd_and_hms(2025, 3, 6, 14, 30, 0).unwrap(),
    };
    assert_eq!(
      note.dedupe_key(),
      "00000000-0000-0000-0000-000000000000:appointment:2025-03-06T14:30:00+00:00"
    );
  }
}
