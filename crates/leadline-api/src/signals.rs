//! Handler for `POST /signals`.
//!
//! The body is a [`RawSignal`]. A new signal answers `202 Accepted`; a
//! redelivery of one already journaled answers `200 OK` with the same report.
//! Rejected signals are dead-lettered before the error is returned.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use leadline_core::{
  normalize::RawSignal,
  pipeline::{IngestReport, Pipeline},
  store::PipelineStore,
};

use crate::error::ApiError;

/// `POST /signals`
pub async fn ingest<S>(
  State(pipeline): State<Pipeline<S>>,
  Json(signal): Json<RawSignal>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PipelineStore + 'static,
{
  let report = pipeline.ingest(signal).await?;
  Ok((status_for(&report), Json(report)))
}

pub(crate) fn status_for(report: &IngestReport) -> StatusCode {
  if report.duplicate { StatusCode::OK } else { StatusCode::ACCEPTED }
}
