//! Pipeline stages and the transition controller.
//!
//! Every stage change in the system is planned here. The adjacency table is
//! explicit: an edge exists only if it is listed in [`ADJACENCY`], and each
//! edge names the causes that may take it.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{Error, Result};

/// A lead's position in the outreach funnel.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
  #[default]
  New,
  Contacted,
  Appointment,
  Won,
  Lost,
  Unresponsive,
}

impl Stage {
  pub const ALL: [Stage; 6] = [
    Stage::New,
    Stage::Contacted,
    Stage::Appointment,
    Stage::Won,
    Stage::Lost,
    Stage::Unresponsive,
  ];

  /// Terminal stages close the lead; only a reopen command leaves them.
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Won | Self::Lost | Self::Unresponsive)
  }
}

/// What asked for a stage change.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransitionCause {
  /// An explicit operator command.
  Operator,
  /// A `webhook_appointment` event. The only privileged event.
  AppointmentBooked,
  /// The operator "reopen" command on a closed lead.
  Reopen,
}

// ─── Adjacency table ─────────────────────────────────────────────────────────

/// One allowed edge of the stage graph.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
  pub from:   Stage,
  pub to:     Stage,
  pub causes: &'static [TransitionCause],
}

use Stage::*;
use TransitionCause::{AppointmentBooked as Booked, Operator as Op, Reopen as Re};

/// The complete stage graph. Anything not listed here is illegal.
pub const ADJACENCY: &[Edge] = &[
  Edge { from: New,          to: Contacted,    causes: &[Op] },
  Edge { from: New,          to: Appointment,  causes: &[Booked] },
  Edge { from: New,          to: Lost,         causes: &[Op] },
  Edge { from: New,          to: Unresponsive, causes: &[Op] },
  Edge { from: Contacted,    to: Appointment,  causes: &[Op, Booked] },
  Edge { from: Contacted,    to: Won,          causes: &[Op] },
  Edge { from: Contacted,    to: Lost,         causes: &[Op] },
  Edge { from: Contacted,    to: Unresponsive, causes: &[Op] },
  Edge { from: Appointment,  to: Won,          causes: &[Op] },
  Edge { from: Appointment,  to: Lost,         causes: &[Op] },
  Edge { from: Appointment,  to: Unresponsive, causes: &[Op] },
  Edge { from: Won,          to: Contacted,    causes: &[Re] },
  Edge { from: Lost,         to: Contacted,    causes: &[Re] },
  Edge { from: Unresponsive, to: Contacted,    causes: &[Re] },
];

/// Whether `cause` may move a lead from `from` to `to`.
pub fn is_allowed(from: Stage, to: Stage, cause: TransitionCause) -> bool {
  ADJACENCY
    .iter()
    .any(|e| e.from == from && e.to == to && e.causes.contains(&cause))
}

/// Stages reachable from `from` by `cause`.
pub fn successors(
  from: Stage,
  cause: TransitionCause,
) -> impl Iterator<Item = Stage> {
  ADJACENCY
    .iter()
    .filter(move |e| e.from == from && e.causes.contains(&cause))
    .map(|e| e.to)
}

// ─── Controller ──────────────────────────────────────────────────────────────

/// The result of planning a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  /// Move the lead along an allowed edge.
  Move { from: Stage, to: Stage },
  /// The lead is already where the request wants it.
  Unchanged,
}

/// Plan a transition of a lead currently in `current` toward `requested`.
///
/// A request for the current stage is a no-op so that retried commands and
/// re-delivered appointment webhooks are idempotent. Everything else must be
/// an edge of [`ADJACENCY`] that lists `cause`.
pub fn plan(
  current: Stage,
  requested: Stage,
  cause: TransitionCause,
) -> Result<Transition> {
  if current == requested {
    return Ok(Transition::Unchanged);
  }
  if is_allowed(current, requested, cause) {
    Ok(Transition::Move { from: current, to: requested })
  } else {
    Err(Error::IllegalTransition { from: current, to: requested, cause })
  }
}
