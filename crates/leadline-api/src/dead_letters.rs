//! Handlers for `/dead-letters` endpoints and the tag catalog.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/dead-letters` | Optional `?include_acknowledged=true` |
//! | `POST` | `/dead-letters/:id/ack` | Body: `{"operator":"..."}` |
//! | `POST` | `/dead-letters/:id/replay` | Body: `{"operator":"..."}` |
//! | `GET`  | `/tags` | The tag catalog |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use leadline_core::{
  dead_letter::DeadLetter,
  pipeline::Pipeline,
  store::PipelineStore,
  tag::TagCatalog,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListParams {
  #[serde(default)]
  pub include_acknowledged: bool,
}

/// `GET /dead-letters[?include_acknowledged=true]`
pub async fn list<S>(
  State(pipeline): State<Pipeline<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<DeadLetter>>, ApiError>
where
  S: PipelineStore + 'static,
{
  Ok(Json(pipeline.dead_letters(params.include_acknowledged).await?))
}

#[derive(Debug, Deserialize)]
pub struct OperatorBody {
  pub operator: String,
}

/// `POST /dead-letters/:id/ack`
pub async fn acknowledge<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<OperatorBody>,
) -> Result<Json<DeadLetter>, ApiError>
where
  S: PipelineStore + 'static,
{
  Ok(Json(pipeline.acknowledge(id, &body.operator).await?))
}

/// `POST /dead-letters/:id/replay`
pub async fn replay<S>(
  State(pipeline): State<Pipeline<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<OperatorBody>,
) -> Result<Json<DeadLetter>, ApiError>
where
  S: PipelineStore + 'static,
{
  Ok(Json(pipeline.replay_dead_letter(id, &body.operator).await?))
}

/// `GET /tags`
pub async fn catalog<S>(State(pipeline): State<Pipeline<S>>) -> Json<TagCatalog>
where
  S: PipelineStore + 'static,
{
  Json(pipeline.catalog().clone())
}
