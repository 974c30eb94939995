//! Handlers for `/leads` endpoints.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/leads` | Body: `{"company_id":"..."}`; returns 201 + lead view |
//! | `GET`    | `/leads` | Optional `stage`, `tag`, `company_id`, `limit`, `offset` |
//! | `GET`    | `/leads/:id` | 404 if not found |
//! | `GET`    | `/leads/:id/events` | Optional `cursor`, `limit` |
//! | `POST`   | `/leads/:id/stage` | Body: [`StageBody`] |
//! | `POST`   | `/leads/:id/reopen` | Body: [`ReopenBody`] |
//! | `POST`   | `/leads/:id/notes` | Body: [`NoteBody`] |
//! | `POST`   | `/leads/:id/tags` | Body: [`TagBody`] |
//! | `DELETE` | `/leads/:id/tags/:tag_type` | Body: [`UntagBody`] |
//! | `POST`   | `/leads/:id/owner` | Body: [`OwnerBody`] |
//! | `POST`   | `/leads/:id/rebuild` | Replays the journal |
//!
//! Notes and tag commands go through the normalizer as `operator` signals,
//! so they are journaled and deduplicated like any other signal.

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::Utc;
use leadline_core::{
  event::JournalPage,
  lead::{Lead, LeadView},
  normalize::{LeadRef, RawSignal, SOURCE_OPERATOR},
  owner::OwnerCandidate,
  pipeline::{IngestReport, OwnerLink, Pipeline, StageCommand, Transitioned},
  stage::Stage,
  store::{LeadQuery, PipelineStore},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{error::ApiError, signals::status_for};

const DEFAULT_PAGE: usize = 100;

// ─── Create ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  pub company_id: Uuid,
}

/// `POST /leads`
pub async fn create<S>(
  State(pipeline): State<Pipeline<S>>,
  Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PipelineStore + 'static,
{
  let lead = pipeline.open_lead(body.company_id).await?;
  let view = pipeline.lead_view(lead.lead_id).await?;
  Ok((StatusCode::CREATED, Json(view)))
}

// ─── Read ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub company_id: Option<Uuid>,
  pub stage:      Option<Stage>,
  pub tag:        Option<String>,
  pub limit:      Option<usize>,
  pub offset:     Option<usize>,
}

/// `GET /leads[?stage=..][&tag=..][&company_id=..][&limit=..][&offset=..]`
pub async fn list<S>(
  State(pipeline): State<Pipeline<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<LeadView>>, ApiError>
where
  S: PipelineStore + 'static,
{
  let query = LeadQuery {
    company_id: params.company_id,
    stage:      params.stage,
    tag:        params.tag,
    limit:      params.limit,
    offset:     params.offset,
  };
  Ok(Json(pipeline.list_leads(&query).await?))
}

/// `GET /leads/:id`
pub async fn get_one<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<LeadView>, ApiError>
where
  S: PipelineStore + 'static,
{
  Ok(Json(pipeline.lead_view(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct JournalParams {
  pub cursor: Option<i64>,
  pub limit:  Option<usize>,
}

/// `GET /leads/:id/events[?cursor=..][&limit=..]`
pub async fn events<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Query(params): Query<JournalParams>,
) -> Result<Json<JournalPage>, ApiError>
where
  S: PipelineStore + 'static,
{
  let page = pipeline
    .journal(id, params.cursor, params.limit.unwrap_or(DEFAULT_PAGE))
    .await?;
  Ok(Json(page))
}

// ─── Stage commands ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StageBody {
  pub to:         Stage,
  pub operator:   String,
  pub request_id: Option<String>,
}

/// `POST /leads/:id/stage`
pub async fn transition<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<StageBody>,
) -> Result<Json<Transitioned>, ApiError>
where
  S: PipelineStore + 'static,
{
  let command = StageCommand {
    lead_id:    id,
    to:         body.to,
    operator:   body.operator,
    request_id: body.request_id,
  };
  Ok(Json(pipeline.transition(command).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReopenBody {
  pub operator:   String,
  pub request_id: Option<String>,
}

/// `POST /leads/:id/reopen`
pub async fn reopen<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<ReopenBody>,
) -> Result<Json<Transitioned>, ApiError>
where
  S: PipelineStore + 'static,
{
  Ok(Json(pipeline.reopen(id, body.operator, body.request_id).await?))
}

// ─── Operator signals ─────────────────────────────────────────────────────────

/// Wrap an operator action as a signal addressed to one lead. Without a
/// client-chosen `request_id` every call is a new signal.
fn operator_signal(
  lead_id: Uuid,
  request_id: Option<String>,
  payload: serde_json::Value,
) -> RawSignal {
  let key = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
  RawSignal {
    source_id:   format!("operator:{key}"),
    source:      SOURCE_OPERATOR.into(),
    lead:        LeadRef::Lead { lead_id },
    event_type:  None,
    occurred_at: Some(Utc::now()),
    payload,
  }
}

async fn submit<S>(
  pipeline: &Pipeline<S>,
  signal: RawSignal,
) -> Result<(StatusCode, Json<IngestReport>), ApiError>
where
  S: PipelineStore + 'static,
{
  let report = pipeline.ingest(signal).await?;
  Ok((status_for(&report), Json(report)))
}

#[derive(Debug, Deserialize)]
pub struct NoteBody {
  pub content:    String,
  pub author:     String,
  #[serde(default)]
  pub is_private: bool,
  pub request_id: Option<String>,
}

/// `POST /leads/:id/notes`
pub async fn add_note<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<NoteBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PipelineStore + 'static,
{
  let payload = json!({
    "action": "note",
    "content": body.content,
    "author": body.author,
    "is_private": body.is_private,
  });
  submit(&pipeline, operator_signal(id, body.request_id, payload)).await
}

#[derive(Debug, Deserialize)]
pub struct TagBody {
  pub tag_type:   String,
  pub operator:   String,
  pub request_id: Option<String>,
}

/// `POST /leads/:id/tags`
pub async fn apply_tag<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<TagBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PipelineStore + 'static,
{
  let payload = json!({
    "action": "apply_tag",
    "tag_type": body.tag_type,
    "operator": body.operator,
  });
  submit(&pipeline, operator_signal(id, body.request_id, payload)).await
}

#[derive(Debug, Deserialize)]
pub struct UntagBody {
  pub operator:   String,
  pub reason:     Option<String>,
  pub request_id: Option<String>,
}

/// `DELETE /leads/:id/tags/:tag_type`
pub async fn remove_tag<S>(
  State(pipeline): State<Pipeline<S>>,
  Path((id, tag_type)): Path<(Uuid, String)>,
  Json(body): Json<UntagBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PipelineStore + 'static,
{
  let payload = json!({
    "action": "remove_tag",
    "tag_type": tag_type,
    "operator": body.operator,
    "reason": body.reason,
  });
  submit(&pipeline, operator_signal(id, body.request_id, payload)).await
}

// ─── Owner ────────────────────────────────────────────────────────────────────

/// An owner identity; the company is always the lead's.
#[derive(Debug, Deserialize)]
pub struct OwnerBody {
  pub name:          Option<String>,
  pub email:         Option<String>,
  pub phone:         Option<String>,
  pub auth_provider: Option<String>,
}

/// `POST /leads/:id/owner`
pub async fn link_owner<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<OwnerBody>,
) -> Result<Json<OwnerLink>, ApiError>
where
  S: PipelineStore + 'static,
{
  let candidate = OwnerCandidate {
    company_id:    Uuid::nil(),
    name:          body.name,
    email:         body.email,
    phone:         body.phone,
    auth_provider: body.auth_provider,
  };
  Ok(Json(pipeline.link_owner(id, candidate).await?))
}

/// `POST /leads/:id/rebuild`
pub async fn rebuild<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Lead>, ApiError>
where
  S: PipelineStore + 'static,
{
  Ok(Json(pipeline.rebuild(id).await?))
}
