//! The auto-tag rule engine.
//!
//! Rules are evaluated once per journal entry against the lead's history.
//! Only rules whose trigger matches the new entry run, and a rule never
//! grants a tag the lead already holds. Grants carry an idempotency key
//! derived from the triggering entry, so re-running evaluation after a
//! redelivery appends nothing new.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  event::{ActivityEvent, EventKind, EventPayload, NewEvent, SmsKind, TagGranted},
  lead::Lead,
  tag::{self, TagCatalog},
};

/// `source` recorded on events the engine derives.
pub const RULES_SOURCE: &str = "rules";

// ─── Rule model ──────────────────────────────────────────────────────────────

/// Which journal entries a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum EventPattern {
  Kind(EventKind),
  /// An `sms_sent` of one template kind.
  Sms(SmsKind),
}

impl EventPattern {
  /// The journal kind every matching entry has.
  pub fn kind(&self) -> EventKind {
    match self {
      Self::Kind(kind) => *kind,
      Self::Sms(_) => EventKind::SmsSent,
    }
  }

  pub fn matches(&self, event: &ActivityEvent) -> bool {
    match (self, &event.payload) {
      (Self::Kind(kind), payload) => payload.kind() == *kind,
      (Self::Sms(kind), EventPayload::SmsSent(s)) => s.kind == *kind,
      (Self::Sms(_), _) => false,
    }
  }
}

/// How the two halves of a pair rule must relate in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
  /// The intervals overlap, or the gap between them is within the window.
  /// Order does not matter.
  Overlap,
  /// `second` starts no earlier than `first` and within the window of it.
  After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
  Single {
    pattern: EventPattern,
  },
  Pair {
    first:       EventPattern,
    second:      EventPattern,
    window:      TimeDelta,
    correlation: Correlation,
  },
  /// Fires once the number of matching entries exceeds `more_than`.
  Count {
    pattern:   EventPattern,
    more_than: usize,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
  pub id:       String,
  pub tag_type: String,
  pub kind:     RuleKind,
}

impl Rule {
  fn triggered_by(&self, event: &ActivityEvent) -> bool {
    match &self.kind {
      RuleKind::Single { pattern } | RuleKind::Count { pattern, .. } => {
        pattern.matches(event)
      }
      RuleKind::Pair { first, second, .. } => {
        first.matches(event) || second.matches(event)
      }
    }
  }

  /// The earliest `occurred_at` an entry can have and still matter when
  /// this rule is evaluated for `trigger`. `None` is unbounded.
  fn horizon(&self, trigger: &ActivityEvent) -> Option<DateTime<Utc>> {
    match &self.kind {
      RuleKind::Single { .. } | RuleKind::Count { .. } => None,
      // A long session can overlap from arbitrarily far back.
      RuleKind::Pair { correlation: Correlation::Overlap, .. } => None,
      RuleKind::Pair { first, second, window, correlation: Correlation::After } => {
        let as_second = second.matches(trigger).then(|| trigger.span().0 - *window);
        let as_first = first.matches(trigger).then_some(trigger.occurred_at);
        as_second.into_iter().chain(as_first).min()
      }
    }
  }
}

/// The part of a lead's journal the rules triggered by one entry can see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryScope {
  /// Empty when every triggered rule decides from the trigger alone.
  pub kinds: Vec<EventKind>,
  /// Entries that occurred earlier cannot change the outcome.
  pub since: Option<DateTime<Utc>>,
}

/// Tunable windows for the standard rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSettings {
  pub during_call_window:     TimeDelta,
  pub after_voicemail_window: TimeDelta,
}

impl Default for RuleSettings {
  fn default() -> Self {
    Self {
      during_call_window:     TimeDelta::minutes(10),
      after_voicemail_window: TimeDelta::hours(48),
    }
  }
}

/// The rule table the sales dashboard ships with.
pub fn standard_rules(settings: &RuleSettings) -> Vec<Rule> {
  let visit = EventPattern::Kind(EventKind::SiteVisitSession);
  vec![
    Rule {
      id:       "answered-call".into(),
      tag_type: tag::ANSWERED_CALL.into(),
      kind:     RuleKind::Single {
        pattern: EventPattern::Sms(SmsKind::AnswerCall),
      },
    },
    Rule {
      id:       "voicemail-left".into(),
      tag_type: tag::VOICEMAIL_LEFT.into(),
      kind:     RuleKind::Single {
        pattern: EventPattern::Sms(SmsKind::Voicemail),
      },
    },
    Rule {
      id:       "viewed-during-call".into(),
      tag_type: tag::VIEWED_DURING_CALL.into(),
      kind:     RuleKind::Pair {
        first:       EventPattern::Sms(SmsKind::AnswerCall),
        second:      visit,
        window:      settings.during_call_window,
        correlation: Correlation::Overlap,
      },
    },
    Rule {
      id:       "viewed-after-voicemail".into(),
      tag_type: tag::VIEWED_AFTER_VOICEMAIL.into(),
      kind:     RuleKind::Pair {
        first:       EventPattern::Sms(SmsKind::Voicemail),
        second:      visit,
        window:      settings.after_voicemail_window,
        correlation: Correlation::After,
      },
    },
    Rule {
      id:       "return-visitor".into(),
      tag_type: tag::RETURN_VISITOR.into(),
      kind:     RuleKind::Count { pattern: visit, more_than: 1 },
    },
  ]
}

// ─── Grants ──────────────────────────────────────────────────────────────────

/// A tag the engine decided to grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
  pub tag_type:          String,
  pub rule_id:           String,
  pub rule_version:      u32,
  pub trigger_source_id: String,
  /// The trigger's causal time; the tag is granted "when" its trigger happened.
  pub occurred_at:       DateTime<Utc>,
}

impl Grant {
  pub fn idempotency_key(&self) -> String {
    format!("auto-tag:{}:{}", self.tag_type, self.trigger_source_id)
  }

  pub fn into_event(self) -> NewEvent {
    NewEvent {
      source_id:   self.idempotency_key(),
      source:      RULES_SOURCE.into(),
      occurred_at: self.occurred_at,
      payload:     EventPayload::TagApplied(TagGranted {
        tag_type:          self.tag_type,
        is_auto_generated: true,
        granted_by:        RULES_SOURCE.into(),
        rule_id:           Some(self.rule_id),
        rule_version:      Some(self.rule_version),
      }),
    }
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// A validated rule table bound to a tag catalog.
#[derive(Debug, Clone)]
pub struct RuleEngine {
  catalog: TagCatalog,
  rules:   Vec<Rule>,
}

impl RuleEngine {
  /// Validate `rules` against `catalog`. Every rule must grant a known auto
  /// tag, and pair rules need a positive window.
  pub fn load(catalog: TagCatalog, rules: Vec<Rule>) -> Result<Self> {
    let mut ids = BTreeSet::new();
    for rule in &rules {
      if !ids.insert(rule.id.as_str()) {
        return Err(Error::RuleConfiguration(format!(
          "duplicate rule id {:?}",
          rule.id
        )));
      }
      match catalog.get(&rule.tag_type) {
        None => {
          return Err(Error::RuleConfiguration(format!(
            "rule {:?} grants unknown tag type {:?}",
            rule.id, rule.tag_type
          )));
        }
        Some(def) if !def.is_auto => {
          return Err(Error::RuleConfiguration(format!(
            "rule {:?} grants {:?}, which is not an auto tag",
            rule.id, rule.tag_type
          )));
        }
        Some(_) => {}
      }
      if let RuleKind::Pair { window, .. } = &rule.kind {
        if *window <= TimeDelta::zero() {
          return Err(Error::RuleConfiguration(format!(
            "rule {:?} has a non-positive window",
            rule.id
          )));
        }
      }
    }
    Ok(Self { catalog, rules })
  }

  /// The standard catalog and rule table.
  pub fn standard(settings: &RuleSettings) -> Result<Self> {
    Self::load(TagCatalog::standard(), standard_rules(settings))
  }

  pub fn catalog(&self) -> &TagCatalog { &self.catalog }

  /// Which entries [`evaluate`](Self::evaluate) needs to see for `trigger`.
  pub fn history_scope(&self, trigger: &ActivityEvent) -> HistoryScope {
    let mut kinds = BTreeSet::new();
    let mut horizons = Vec::new();
    for rule in self.rules.iter().filter(|r| r.triggered_by(trigger)) {
      match &rule.kind {
        RuleKind::Single { .. } => continue,
        RuleKind::Count { pattern, .. } => {
          kinds.insert(pattern.kind());
        }
        RuleKind::Pair { first, second, .. } => {
          kinds.insert(first.kind());
          kinds.insert(second.kind());
        }
      }
      horizons.push(rule.horizon(trigger));
    }
    HistoryScope {
      kinds: kinds.into_iter().collect(),
      // `None` orders first, so one unbounded rule widens the whole read.
      since: horizons.into_iter().min().flatten(),
    }
  }

  /// Decide which tags `trigger` earns. `history` is the lead's journal and
  /// may include `trigger` itself.
  pub fn evaluate(
    &self,
    trigger: &ActivityEvent,
    history: &[ActivityEvent],
    lead: &Lead,
  ) -> Vec<Grant> {
    let mut granted = BTreeSet::new();
    let mut grants = Vec::new();

    for rule in self.rules.iter().filter(|r| r.triggered_by(trigger)) {
      if lead.has_tag(&rule.tag_type) || granted.contains(&rule.tag_type) {
        continue;
      }
      if !fires(rule, trigger, history) {
        continue;
      }
      tracing::debug!(
        rule = %rule.id,
        tag = %rule.tag_type,
        trigger = %trigger.source_id,
        "rule fired"
      );
      granted.insert(rule.tag_type.clone());
      grants.push(Grant {
        tag_type:          rule.tag_type.clone(),
        rule_id:           rule.id.clone(),
        rule_version:      self.catalog.version,
        trigger_source_id: trigger.source_id.clone(),
        occurred_at:       trigger.occurred_at,
      });
    }
    grants
  }
}

fn fires(rule: &Rule, trigger: &ActivityEvent, history: &[ActivityEvent]) -> bool {
  let others = || history.iter().filter(|e| e.event_id != trigger.event_id);

  match &rule.kind {
    RuleKind::Single { .. } => true,
    RuleKind::Count { pattern, more_than } => {
      1 + others().filter(|e| pattern.matches(e)).count() > *more_than
    }
    RuleKind::Pair { first, second, window, correlation } => {
      let as_first = first.matches(trigger)
        && others()
          .filter(|e| second.matches(e))
          .any(|e| correlated(*correlation, *window, trigger, e));
      let as_second = second.matches(trigger)
        && others()
          .filter(|e| first.matches(e))
          .any(|e| correlated(*correlation, *window, e, trigger));
      as_first || as_second
    }
  }
}

fn correlated(
  correlation: Correlation,
  window: TimeDelta,
  first: &ActivityEvent,
  second: &ActivityEvent,
) -> bool {
  match correlation {
    Correlation::Overlap => {
      let (a_start, a_end) = first.span();
      let (b_start, b_end) = second.span();
      let gap = if a_end < b_start {
        b_start - a_end
      } else if b_end < a_start {
        a_start - b_end
      } else {
        TimeDelta::zero()
      };
      gap <= window
    }
    Correlation::After => {
      let (start, _) = second.span();
      start >= first.occurred_at && start - first.occurred_at <= window
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use uuid::Uuid;

  use super::*;
  use crate::event::{NoteAdded, SmsSent, VisitSession};

  fn at(mins: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap() + TimeDelta::minutes(mins)
  }

  fn entry(seq: i64, occurred_at: DateTime<Utc>, payload: EventPayload) -> ActivityEvent {
    ActivityEvent {
      event_id: Uuid::new_v4(),
      lead_id: Uuid::nil(),
      seq,
      source_id: format!("src-{seq}"),
      source: "test".into(),
      occurred_at,
      recorded_at: at(1000 + seq),
      payload,
    }
  }

  fn sms(seq: i64, mins: i64, kind: SmsKind) -> ActivityEvent {
    entry(
      seq,
      at(mins),
      EventPayload::SmsSent(SmsSent { kind, attempt: None, to: None, body: None }),
    )
  }

  fn visit(seq: i64, start: i64, end: i64) -> ActivityEvent {
    entry(
      seq,
      at(start),
      EventPayload::SiteVisitSession(VisitSession {
        session_id: format!("s{seq}"),
        started_at: at(start),
        ended_at:   at(end),
        page_views: 3,
      }),
    )
  }

  fn engine() -> RuleEngine { RuleEngine::standard(&RuleSettings::default()).unwrap() }

  fn lead() -> Lead { Lead::open(Uuid::nil(), Uuid::nil(), at(-60)) }

  fn tags(grants: &[Grant]) -> Vec<&str> {
    grants.iter().map(|g| g.tag_type.as_str()).collect()
  }

  #[test]
  fn answered_call_is_granted_on_its_own() {
    let call = sms(1, 0, SmsKind::AnswerCall);
    let grants = engine().evaluate(&call, &[call.clone()], &lead());
    assert_eq!(tags(&grants), ["answered-call"]);
    assert_eq!(grants[0].idempotency_key(), "auto-tag:answered-call:src-1");
  }

  #[test]
  fn visit_overlapping_a_call_is_viewed_during_call() {
    let call = sms(1, 0, SmsKind::AnswerCall);
    let v = visit(2, -2, 3);
    let grants = engine().evaluate(&v, &[call, v.clone()], &lead());
    assert_eq!(tags(&grants), ["viewed-during-call"]);
  }

  #[test]
  fn late_call_still_correlates_with_an_earlier_visit() {
    // The visit landed first; the call signal arrives later but falls within
    // the window of the visit's end.
    let v = visit(1, 0, 4);
    let call = sms(2, 12, SmsKind::AnswerCall);
    let grants = engine().evaluate(&call, &[v, call.clone()], &lead());
    assert_eq!(tags(&grants), ["answered-call", "viewed-during-call"]);
  }

  #[test]
  fn visit_outside_the_window_does_not_correlate() {
    let call = sms(1, 0, SmsKind::AnswerCall);
    let v = visit(2, 30, 35);
    let grants = engine().evaluate(&v, &[call, v.clone()], &lead());
    assert!(grants.is_empty());
  }

  #[test]
  fn after_voicemail_requires_the_visit_to_follow() {
    let vm = sms(1, 0, SmsKind::Voicemail);
    let before = visit(2, -30, -25);
    assert!(
      engine()
        .evaluate(&before, &[vm.clone(), before.clone()], &lead())
        .is_empty()
    );

    let after = visit(3, 24 * 60, 24 * 60 + 5);
    let grants = engine().evaluate(&after, &[vm, before, after.clone()], &lead());
    assert_eq!(tags(&grants), ["viewed-after-voicemail", "return-visitor"]);
  }

  #[test]
  fn return_visitor_needs_more_than_one_session() {
    let first = visit(1, 0, 1);
    assert!(engine().evaluate(&first, &[first.clone()], &lead()).is_empty());

    let second = visit(2, 60, 61);
    let grants = engine().evaluate(&second, &[first, second.clone()], &lead());
    assert_eq!(tags(&grants), ["return-visitor"]);
  }

  #[test]
  fn held_tags_are_not_granted_again() {
    let call = sms(1, 0, SmsKind::AnswerCall);
    let mut lead = lead();
    let grant = engine()
      .evaluate(&call, &[call.clone()], &lead)
      .remove(0)
      .into_event();
    lead.apply(&entry(2, grant.occurred_at, grant.payload));

    let again = sms(3, 5, SmsKind::AnswerCall);
    assert!(engine().evaluate(&again, &[call, again.clone()], &lead).is_empty());
  }

  #[test]
  fn history_scope_reads_only_what_triggered_rules_can_match() {
    let e = engine();

    // answered-call needs nothing; viewed-during-call needs visits from any time.
    let call = sms(1, 0, SmsKind::AnswerCall);
    let scope = e.history_scope(&call);
    assert_eq!(scope.kinds, [EventKind::SmsSent, EventKind::SiteVisitSession]);
    assert_eq!(scope.since, None);

    // viewed-after-voicemail only looks at visits from the voicemail onwards.
    let vm = sms(2, 30, SmsKind::Voicemail);
    let scope = e.history_scope(&vm);
    assert_eq!(scope.kinds, [EventKind::SmsSent, EventKind::SiteVisitSession]);
    assert_eq!(scope.since, Some(at(30)));

    let follow_up = sms(3, 40, SmsKind::FollowUp);
    assert_eq!(e.history_scope(&follow_up), HistoryScope::default());
  }

  #[test]
  fn scoped_history_grants_what_the_full_journal_grants() {
    let e = engine();
    let vm = sms(1, 0, SmsKind::Voicemail);
    let early = visit(2, -90, -80);
    let late = visit(3, 60, 70);
    let note = entry(
      4,
      at(65),
      EventPayload::ManualNote(NoteAdded {
        note_id:    Uuid::new_v4(),
        content:    "called back".into(),
        author:     "nick".into(),
        is_private: false,
      }),
    );
    let full = [vm.clone(), early, late.clone(), note];

    for trigger in [&vm, &late] {
      let scope = e.history_scope(trigger);
      let scoped: Vec<_> = full
        .iter()
        .filter(|x| scope.kinds.contains(&x.kind()))
        .filter(|x| scope.since.is_none_or(|since| x.occurred_at >= since))
        .cloned()
        .collect();
      assert_eq!(
        e.evaluate(trigger, &scoped, &lead()),
        e.evaluate(trigger, &full, &lead())
      );
    }
  }

  #[test]
  fn rules_for_unknown_or_manual_tags_are_rejected() {
    let single = |tag: &str| Rule {
      id:       "r".into(),
      tag_type: tag.into(),
      kind:     RuleKind::Single {
        pattern: EventPattern::Kind(EventKind::ManualNote),
      },
    };
    for tag in ["no-such-tag", tag::CALLBACK_RECEIVED] {
      assert!(matches!(
        RuleEngine::load(TagCatalog::standard(), vec![single(tag)]),
        Err(Error::RuleConfiguration(_))
      ));
    }
  }

  #[test]
  fn non_positive_windows_are_rejected() {
    let settings = RuleSettings {
      during_call_window: TimeDelta::zero(),
      ..Default::default()
    };
    assert!(matches!(
      RuleEngine::standard(&settings),
      Err(Error::RuleConfiguration(_))
    ));
  }
}
