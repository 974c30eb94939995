//! Outbound stage-change notifications.
//!
//! Every stage-change entry is queued in the store's outbox in the same
//! transaction that journals it. [`Notifier`] drains that outbox on a
//! background task and POSTs each notification as JSON, marking it delivered
//! only once the webhook answers 2xx. The pipeline's channel only wakes the
//! task early; a periodic sweep (which also runs at startup) picks up anything
//! a crash or an unreachable webhook left behind. Delivery is at-least-once:
//! receivers dedupe on the `Idempotency-Key` header (also present in the body
//! as `dedupe_key`).

use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, bail};
use leadline_core::{pipeline::StageNotification, store::PipelineStore};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Outbox rows handled per store read.
const BATCH: usize = 100;

#[derive(Serialize)]
struct Body<'a> {
  #[serde(flatten)]
  note:       &'a StageNotification,
  dedupe_key: String,
}

/// Delivers queued stage-change notifications to a webhook.
pub struct Notifier<S> {
  store:    Arc<S>,
  client:   Client,
  url:      Option<String>,
  attempts: u32,
  backoff:  Duration,
  sweep:    Duration,
}

impl<S: PipelineStore + 'static> Notifier<S> {
  /// A notifier for `url`; `None` logs notifications instead of sending them.
  pub fn new(url: Option<String>, store: Arc<S>) -> anyhow::Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .context("failed to build HTTP client")?;
    Ok(Self {
      store,
      client,
      url,
      attempts: 3,
      backoff: Duration::from_millis(250),
      sweep: Duration::from_secs(30),
    })
  }

  /// Override the retry policy. `attempts` counts the first try.
  pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
    self.attempts = attempts.max(1);
    self.backoff = backoff;
    self
  }

  /// How often the outbox is swept when nothing wakes the task.
  pub fn with_sweep(mut self, every: Duration) -> Self {
    self.sweep = every.max(Duration::from_millis(10));
    self
  }

  /// Run on a background task until every sender is dropped.
  pub fn spawn(self, rx: mpsc::UnboundedReceiver<StageNotification>) -> JoinHandle<()> {
    tokio::spawn(self.run(rx))
  }

  pub async fn run(self, mut rx: mpsc::UnboundedReceiver<StageNotification>) {
    let mut ticker = tokio::time::interval(self.sweep);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        woke = rx.recv() => match woke {
          // One sweep covers every queued wake-up.
          Some(_) => while rx.try_recv().is_ok() {},
          None => break,
        },
        // The first tick fires at once, so startup sweeps too.
        _ = ticker.tick() => {}
      }
      self.sweep_logged().await;
    }

    self.sweep_logged().await;
    tracing::debug!("notification channel closed");
  }

  async fn sweep_logged(&self) {
    if let Err(err) = self.drain().await {
      tracing::error!(error = %err, "failed to read notification outbox");
    }
  }

  /// Attempt every pending notification once. Returns how many were
  /// delivered; failures stay pending for the next sweep.
  pub async fn drain(&self) -> anyhow::Result<usize> {
    let mut delivered = 0;
    loop {
      let batch = self.store.pending_notifications(None, BATCH).await?;
      let fetched = batch.len();
      let mut failed = 0;

      for note in batch {
        match self.deliver(&note).await {
          Ok(()) => {
            self.store.mark_notification_delivered(note.event_id).await?;
            delivered += 1;
          }
          Err(err) => {
            tracing::warn!(
              lead_id = %note.lead_id,
              to = %note.to,
              error = %err,
              "stage notification left pending"
            );
            self
              .store
              .record_notification_failure(note.event_id, err.to_string())
              .await?;
            failed += 1;
          }
        }
      }

      // A short or partly failed batch means nothing new is deliverable now.
      if fetched < BATCH || failed > 0 {
        return Ok(delivered);
      }
    }
  }

  /// Send one notification, retrying server errors with exponential backoff.
  pub async fn deliver(&self, note: &StageNotification) -> anyhow::Result<()> {
    let key = note.dedupe_key();
    let Some(url) = &self.url else {
      tracing::info!(
        lead_id = %note.lead_id,
        from = %note.from,
        to = %note.to,
        dedupe_key = %key,
        "stage changed"
      );
      return Ok(());
    };

    let body = Body { note, dedupe_key: key.clone() };
    let mut delay = self.backoff;
    for attempt in 1..=self.attempts {
      let result = self
        .client
        .post(url)
        .header(IDEMPOTENCY_HEADER, &key)
        .json(&body)
        .send()
        .await;

      match result {
        Ok(resp) if resp.status().is_success() => {
          tracing::debug!(lead_id = %note.lead_id, attempt, "stage notification delivered");
          return Ok(());
        }
        Ok(resp) if !retryable(resp.status()) => {
          bail!("webhook rejected notification: {}", resp.status());
        }
        Ok(resp) => {
          tracing::warn!(lead_id = %note.lead_id, attempt, status = %resp.status(), "webhook error");
        }
        Err(err) => {
          tracing::warn!(lead_id = %note.lead_id, attempt, error = %err, "webhook unreachable");
        }
      }

      if attempt < self.attempts {
        tokio::time::sleep(delay).await;
        delay *= 2;
      }
    }
    bail!("gave up after {} attempts", self.attempts)
  }
}

fn retryable(status: StatusCode) -> bool {
  status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  };

  use axum::{
    Json,
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
  };
  use chrono::{TimeZone, Utc};
  use leadline_core::{
    event::{EventPayload, NewEvent, StageChanged},
    stage::{Stage, TransitionCause},
  };
  use leadline_store_sqlite::SqliteStore;
  use serde_json::Value;
  use tokio::net::TcpListener;
  use uuid::Uuid;

  use super::*;

  #[derive(Clone, Default)]
  struct Hook {
    /// Respond with a 503 to this many requests before accepting.
    failures: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<(String, Value)>>>,
  }

  async fn receive(
    State(hook): State<Hook>,
    headers: HeaderMap,
    Json(body): Json<Value>,
  ) -> StatusCode {
    let key = headers
      .get(IDEMPOTENCY_HEADER)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_owned();
    hook.received.lock().unwrap().push((key, body));
    let remaining = hook.failures.load(Ordering::SeqCst);
    if remaining > 0 {
      hook.failures.store(remaining - 1, Ordering::SeqCst);
      StatusCode::SERVICE_UNAVAILABLE
    } else {
      StatusCode::NO_CONTENT
    }
  }

  async fn serve(hook: Hook) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/hook", post(receive)).with_state(hook);
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/hook")
  }

  fn note() -> StageNotification {
    StageNotification {
      event_id:    Uuid::new_v4(),
      lead_id:     Uuid::new_v4(),
      from:        Stage::New,
      to:          Stage::Appointment,
      occurred_at: Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap(),
    }
  }

  /// A store holding one journaled move per entry in `moves`, none delivered.
  async fn store_with_moves(moves: &[(Stage, Stage)]) -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let lead = store.create_lead(Uuid::new_v4()).await.unwrap();
    for (i, (from, to)) in moves.iter().enumerate() {
      let change = NewEvent {
        source_id:   format!("move-{i}"),
        source:      "operator".into(),
        occurred_at: Utc.with_ymd_and_hms(2025, 3, 4, 15, i as u32, 0).unwrap(),
        payload:     EventPayload::StageChange(StageChanged {
          from:  *from,
          to:    *to,
          cause: TransitionCause::Operator,
          actor: Some("nick".into()),
        }),
      };
      store.append(lead.lead_id, change).await.unwrap();
    }
    Arc::new(store)
  }

  async fn notifier(url: Option<String>) -> Notifier<SqliteStore> {
    Notifier::new(url, store_with_moves(&[]).await)
      .unwrap()
      .with_retry(3, Duration::from_millis(5))
  }

  #[tokio::test]
  async fn server_errors_are_retried_with_the_same_key() {
    let hook = Hook::default();
    hook.failures.store(2, Ordering::SeqCst);
    let n = note();

    notifier(Some(serve(hook.clone()).await)).await.deliver(&n).await.unwrap();

    let received = hook.received.lock().unwrap();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|(key, _)| *key == n.dedupe_key()));
    let (_, body) = &received[2];
    assert_eq!(body["to"], "appointment");
    assert_eq!(body["dedupe_key"], n.dedupe_key());
    assert_eq!(body["event_id"], n.event_id.to_string());
  }

  #[tokio::test]
  async fn delivery_gives_up_after_the_last_attempt() {
    let hook = Hook::default();
    hook.failures.store(10, Ordering::SeqCst);

    let err = notifier(Some(serve(hook.clone()).await))
      .await
      .deliver(&note())
      .await
      .unwrap_err();
    assert!(err.to_string().contains("3 attempts"));
    assert_eq!(hook.received.lock().unwrap().len(), 3);
  }

  #[tokio::test]
  async fn queued_moves_go_out_before_the_task_exits() {
    let hook = Hook::default();
    let store =
      store_with_moves(&[(Stage::New, Stage::Contacted), (Stage::Contacted, Stage::Won)]).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let task = Notifier::new(Some(serve(hook.clone()).await), store.clone())
      .unwrap()
      .with_sweep(Duration::from_secs(3600))
      .spawn(rx);

    drop(tx);
    task.await.unwrap();

    let received = hook.received.lock().unwrap();
    let stages: Vec<_> = received.iter().map(|(_, body)| body["to"].clone()).collect();
    assert_eq!(stages, ["contacted", "won"]);
    assert!(store.pending_notifications(None, 10).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn failed_deliveries_stay_pending_until_a_later_sweep() {
    let hook = Hook::default();
    hook.failures.store(1, Ordering::SeqCst);
    let store = store_with_moves(&[(Stage::New, Stage::Appointment)]).await;
    let notifier = Notifier::new(Some(serve(hook.clone()).await), store.clone())
      .unwrap()
      .with_retry(1, Duration::from_millis(5));

    assert_eq!(notifier.drain().await.unwrap(), 0);
    let pending = store.pending_notifications(None, 10).await.unwrap();
    assert_eq!(pending.len(), 1);

    assert_eq!(notifier.drain().await.unwrap(), 1);
    assert!(store.pending_notifications(None, 10).await.unwrap().is_empty());

    let received = hook.received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].0, pending[0].dedupe_key());
    assert_eq!(received[0].0, received[1].0);
  }

  #[tokio::test]
  async fn without_a_url_notifications_are_logged_and_cleared() {
    let store = store_with_moves(&[(Stage::New, Stage::Lost)]).await;
    let notifier = Notifier::new(None, store.clone()).unwrap();
    assert_eq!(notifier.drain().await.unwrap(), 1);
    assert!(store.pending_notifications(None, 10).await.unwrap().is_empty());
  }
}
