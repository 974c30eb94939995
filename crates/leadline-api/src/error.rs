//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use leadline_core::{Error as CoreError, ServiceError};
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  /// The request is well-formed but conflicts with the lead's state.
  #[error("conflict: {0}")]
  Conflict(String),

  /// The request is well-formed but names something we cannot act on.
  #[error("unprocessable: {0}")]
  Unprocessable(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<ServiceError> for ApiError {
  fn from(err: ServiceError) -> Self {
    let domain = match err {
      ServiceError::Domain(e) => e,
      ServiceError::Store(e) => return ApiError::Store(e),
    };
    let message = domain.to_string();
    match domain {
      CoreError::LeadNotFound(_) | CoreError::DeadLetterNotFound(_) => {
        ApiError::NotFound(message)
      }
      CoreError::UnrecognizedSource(_)
      | CoreError::MalformedPayload { .. }
      | CoreError::Serialization(_) => ApiError::BadRequest(message),
      CoreError::UnknownTag(_)
      | CoreError::NoOpenLead(_)
      | CoreError::NoMatchingLead { .. } => ApiError::Unprocessable(message),
      CoreError::DuplicateEvent { .. }
      | CoreError::IllegalTransition { .. }
      | CoreError::MigrationHalted { .. }
      | CoreError::MigrationComplete(_)
      | CoreError::PhaseOutOfOrder { .. }
      | CoreError::NothingToRollBack(_)
      | CoreError::NothingToAcknowledge(_)
      | CoreError::SoakIncomplete { .. } => ApiError::Conflict(message),
      CoreError::RuleConfiguration(_)
      | CoreError::MigrationVerificationFailure { .. } => {
        ApiError::Store(Box::new(domain))
      }
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
      ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
      ApiError::Store(e) => {
        tracing::error!(error = %e, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
      }
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}

#[cfg(test)]
mod tests {
  use leadline_core::stage::{Stage, TransitionCause};
  use uuid::Uuid;

  use super::*;

  fn status(err: CoreError) -> StatusCode {
    ApiError::from(ServiceError::Domain(err)).into_response().status()
  }

  #[test]
  fn domain_errors_map_to_statuses() {
    assert_eq!(status(CoreError::LeadNotFound(Uuid::nil())), StatusCode::NOT_FOUND);
    assert_eq!(
      status(CoreError::UnrecognizedSource("fax".into())),
      StatusCode::BAD_REQUEST
    );
    assert_eq!(
      status(CoreError::UnknownTag("vip".into())),
      StatusCode::UNPROCESSABLE_ENTITY
    );
    assert_eq!(
      status(CoreError::IllegalTransition {
        from:  Stage::New,
        to:    Stage::Won,
        cause: TransitionCause::Operator,
      }),
      StatusCode::CONFLICT
    );
    assert_eq!(
      status(CoreError::RuleConfiguration("bad window".into())),
      StatusCode::INTERNAL_SERVER_ERROR
    );
  }
}
