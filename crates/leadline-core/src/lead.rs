//! The lead aggregate: stage, tags, notes, and owner reference for one
//! outreach attempt.
//!
//! A [`Lead`] is never authoritative: it is the left fold of the lead's
//! journal over [`Lead::open`]. Stores patch it with [`Lead::apply`] inside
//! the append transaction and can rebuild it with [`Lead::replay`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  event::{ActivityEvent, EventPayload},
  owner::BusinessOwner,
  stage::Stage,
  tag::{Tag, TagCatalog},
};

/// An operator note. Stored in append order, displayed newest-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
  pub note_id:    Uuid,
  pub content:    String,
  pub author:     String,
  pub is_private: bool,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
  pub lead_id:           Uuid,
  pub company_id:        Uuid,
  pub stage:             Stage,
  pub notes:             Vec<Note>,
  /// Keyed by `tag_type`, so a type is held at most once.
  pub tags:              BTreeMap<String, Tag>,
  pub business_owner_id: Option<Uuid>,
  pub created_at:        DateTime<Utc>,
  pub updated_at:        DateTime<Utc>,
  /// `seq` of the last journal entry folded in.
  pub journal_seq:       i64,
}

impl Lead {
  /// The empty state every lead's journal is folded over.
  pub fn open(lead_id: Uuid, company_id: Uuid, created_at: DateTime<Utc>) -> Self {
    Self {
      lead_id,
      company_id,
      stage: Stage::New,
      notes: Vec::new(),
      tags: BTreeMap::new(),
      business_owner_id: None,
      created_at,
      updated_at: created_at,
      journal_seq: 0,
    }
  }

  /// Fold one journal entry into the aggregate. Entries at or below
  /// `journal_seq` were already applied and are skipped.
  pub fn apply(&mut self, event: &ActivityEvent) {
    if event.seq <= self.journal_seq {
      return;
    }
    self.journal_seq = event.seq;

    let mutated = match &event.payload {
      EventPayload::ManualNote(n) => {
        self.notes.push(Note {
          note_id:    n.note_id,
          content:    n.content.clone(),
          author:     n.author.clone(),
          is_private: n.is_private,
          created_at: event.occurred_at,
        });
        true
      }
      EventPayload::StageChange(c) => {
        self.stage = c.to;
        true
      }
      EventPayload::TagApplied(g) => {
        if self.tags.contains_key(&g.tag_type) {
          false
        } else {
          self.tags.insert(g.tag_type.clone(), Tag {
            tag_type:          g.tag_type.clone(),
            value:             g.tag_type.clone(),
            is_auto_generated: g.is_auto_generated,
            granted_at:        event.occurred_at,
            granted_by:        g.granted_by.clone(),
            rule_version:      g.rule_version,
          });
          true
        }
      }
      EventPayload::TagRemoved(r) => self.tags.remove(&r.tag_type).is_some(),
      EventPayload::OwnerLinked(o) => {
        self.business_owner_id = Some(o.owner_id);
        true
      }
      EventPayload::SmsSent(_)
      | EventPayload::WebhookAppointment(_)
      | EventPayload::SiteVisitSession(_) => false,
    };

    if mutated {
      self.updated_at = event.recorded_at;
    }
  }

  /// Rebuild from `seed` by folding `events` in journal order.
  pub fn replay<'a>(
    mut seed: Lead,
    events: impl IntoIterator<Item = &'a ActivityEvent>,
  ) -> Lead {
    for event in events {
      seed.apply(event);
    }
    seed
  }

  pub fn has_tag(&self, tag_type: &str) -> bool {
    self.tags.contains_key(tag_type)
  }
}

// ─── Read model ──────────────────────────────────────────────────────────────

/// A held tag with its catalog display metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagView {
  #[serde(flatten)]
  pub tag:          Tag,
  pub display_name: Option<String>,
  pub color_class:  Option<String>,
}

/// What collaborators read: notes newest-first, owner expanded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadView {
  pub lead_id:        Uuid,
  pub company_id:     Uuid,
  pub stage:          Stage,
  pub tags:           Vec<TagView>,
  pub notes:          Vec<Note>,
  pub business_owner: Option<BusinessOwner>,
  pub created_at:     DateTime<Utc>,
  pub updated_at:     DateTime<Utc>,
}

impl LeadView {
  pub fn new(
    lead: Lead,
    owner: Option<BusinessOwner>,
    catalog: &TagCatalog,
  ) -> Self {
    let tags = lead
      .tags
      .into_values()
      .map(|tag| {
        let def = catalog.get(&tag.tag_type);
        TagView {
          display_name: def.map(|d| d.display_name.clone()),
          color_class: def.map(|d| d.color_class.clone()),
          tag,
        }
      })
      .collect();
    let mut notes = lead.notes;
    notes.reverse();
    Self {
      lead_id: lead.lead_id,
      company_id: lead.company_id,
      stage: lead.stage,
      tags,
      notes,
      business_owner: owner,
      created_at: lead.created_at,
      updated_at: lead.updated_at,
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::{
    event::{NoteAdded, StageChanged, TagGranted, TagRevoked},
    stage::TransitionCause,
  };

  fn at(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(secs, 0).unwrap() }

  fn event(seq: i64, payload: EventPayload) -> ActivityEvent {
    ActivityEvent {
      event_id: Uuid::new_v4(),
      lead_id: Uuid::nil(),
      seq,
      source_id: format!("src-{seq}"),
      source: "test".into(),
      occurred_at: at(seq * 10),
      recorded_at: at(seq * 10 + 1),
      payload,
    }
  }

  fn grant(tag: &str) -> EventPayload {
    EventPayload::TagApplied(TagGranted {
      tag_type:          tag.into(),
      is_auto_generated: true,
      granted_by:        "rules".into(),
      rule_id:           None,
      rule_version:      Some(1),
    })
  }

  fn note(content: &str) -> EventPayload {
    EventPayload::ManualNote(NoteAdded {
      note_id:    Uuid::new_v4(),
      content:    content.into(),
      author:     "nick".into(),
      is_private: false,
    })
  }

  #[test]
  fn granting_the_same_tag_twice_keeps_one() {
    let mut lead = Lead::open(Uuid::nil(), Uuid::nil(), at(0));
    lead.apply(&event(1, grant("answered-call")));
    lead.apply(&event(2, grant("answered-call")));
    assert_eq!(lead.tags.len(), 1);
    // The second grant mutated nothing.
    assert_eq!(lead.updated_at, at(11));
  }

  #[test]
  fn already_applied_entries_are_skipped() {
    let mut lead = Lead::open(Uuid::nil(), Uuid::nil(), at(0));
    let e = event(1, note("first call"));
    lead.apply(&e);
    lead.apply(&e);
    assert_eq!(lead.notes.len(), 1);
    assert_eq!(lead.journal_seq, 1);
  }

  #[test]
  fn removal_and_stage_changes_fold_in_order() {
    let events = vec![
      event(1, grant("answered-call")),
      event(
        2,
        EventPayload::StageChange(StageChanged {
          from:  Stage::New,
          to:    Stage::Contacted,
          cause: TransitionCause::Operator,
          actor: Some("nick".into()),
        }),
      ),
      event(
        3,
        EventPayload::TagRemoved(TagRevoked {
          tag_type:   "answered-call".into(),
          removed_by: "nick".into(),
          reason:     None,
        }),
      ),
    ];
    let lead =
      Lead::replay(Lead::open(Uuid::nil(), Uuid::nil(), at(0)), &events);
    assert_eq!(lead.stage, Stage::Contacted);
    assert!(lead.tags.is_empty());
    assert_eq!(lead.updated_at, at(31));
  }

  #[test]
  fn view_lists_notes_newest_first() {
    let mut lead = Lead::open(Uuid::nil(), Uuid::nil(), at(0));
    lead.apply(&event(1, note("older")));
    lead.apply(&event(2, note("newer")));
    lead.apply(&event(3, grant("answered-call")));

    let view = LeadView::new(lead, None, &TagCatalog::standard());
    let contents: Vec<_> = view.notes.iter().map(|n| n.content.as_str()).collect();
    assert_eq!(contents, ["newer", "older"]);
    assert_eq!(view.tags[0].display_name.as_deref(), Some("Answered Call"));
  }
}
