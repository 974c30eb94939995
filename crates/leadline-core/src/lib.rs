//! Core types, rules, and orchestration for the Leadline lead pipeline.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! Storage backends implement [`store::PipelineStore`] and
//! [`evolution::MigrationLedger`]; everything else here is pure logic plus the
//! [`pipeline::Pipeline`] service that sequences it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod dead_letter;
pub mod error;
pub mod event;
pub mod evolution;
pub mod lead;
pub mod normalize;
pub mod owner;
pub mod pipeline;
pub mod rules;
pub mod stage;
pub mod store;
pub mod tag;

pub use error::{Error, IntoDomainError, Result, ServiceError};
