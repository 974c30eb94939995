//! JSON HTTP API for Leadline.
//!
//! Exposes an axum [`Router`] backed by a [`Pipeline`] over any
//! [`leadline_core::store::PipelineStore`]. Auth and TLS are the caller's
//! responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", leadline_api::api_router(pipeline.clone()))
//! ```

pub mod dead_letters;
pub mod error;
pub mod leads;
pub mod signals;

use axum::{
  Router,
  routing::{delete, get, post},
};
use leadline_core::{pipeline::Pipeline, store::PipelineStore};
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// Build the API router for `pipeline`.
pub fn api_router<S>(pipeline: Pipeline<S>) -> Router<()>
where
  S: PipelineStore + 'static,
{
  Router::new()
    // Signals
    .route("/signals", post(signals::ingest::<S>))
    // Leads
    .route("/leads", get(leads::list::<S>).post(leads::create::<S>))
    .route("/leads/{id}", get(leads::get_one::<S>))
    .route("/leads/{id}/events", get(leads::events::<S>))
    .route("/leads/{id}/stage", post(leads::transition::<S>))
    .route("/leads/{id}/reopen", post(leads::reopen::<S>))
    .route("/leads/{id}/notes", post(leads::add_note::<S>))
    .route("/leads/{id}/tags", post(leads::apply_tag::<S>))
    .route("/leads/{id}/tags/{tag_type}", delete(leads::remove_tag::<S>))
    .route("/leads/{id}/owner", post(leads::link_owner::<S>))
    .route("/leads/{id}/rebuild", post(leads::rebuild::<S>))
    // Catalog and dead letters
    .route("/tags", get(dead_letters::catalog::<S>))
    .route("/dead-letters", get(dead_letters::list::<S>))
    .route("/dead-letters/{id}/ack", post(dead_letters::acknowledge::<S>))
    .route("/dead-letters/{id}/replay", post(dead_letters::replay::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(pipeline)
}
