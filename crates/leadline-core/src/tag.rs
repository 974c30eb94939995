//! The versioned tag catalog and granted tags.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ANSWERED_CALL: &str = "answered-call";
pub const VOICEMAIL_LEFT: &str = "voicemail-left";
pub const VIEWED_DURING_CALL: &str = "viewed-during-call";
pub const VIEWED_AFTER_VOICEMAIL: &str = "viewed-after-voicemail";
pub const RETURN_VISITOR: &str = "return-visitor";
pub const CALLBACK_RECEIVED: &str = "callback-received";

/// One entry of the `tag_definitions` catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
  /// Stable key; what leads actually store.
  pub tag_type:     String,
  pub display_name: String,
  pub color_class:  String,
  pub description:  Option<String>,
  /// Auto tags may be granted by rules; the rest only by operators.
  pub is_auto:      bool,
}

impl TagDefinition {
  pub fn new(
    tag_type: &str,
    display_name: &str,
    color_class: &str,
    description: &str,
    is_auto: bool,
  ) -> Self {
    Self {
      tag_type: tag_type.to_owned(),
      display_name: display_name.to_owned(),
      color_class: color_class.to_owned(),
      description: Some(description.to_owned()),
      is_auto,
    }
  }
}

/// The fixed set of tag types a deployment knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCatalog {
  pub version:     u32,
  pub definitions: BTreeMap<String, TagDefinition>,
}

impl TagCatalog {
  pub fn new(
    version: u32,
    definitions: impl IntoIterator<Item = TagDefinition>,
  ) -> Self {
    Self {
      version,
      definitions: definitions
        .into_iter()
        .map(|d| (d.tag_type.clone(), d))
        .collect(),
    }
  }

  /// The catalog shipped with the sales dashboard.
  pub fn standard() -> Self {
    Self::new(1, [
      TagDefinition::new(
        ANSWERED_CALL,
        "Answered Call",
        "bg-green-100 text-green-800",
        "Customer answered the phone call",
        true,
      ),
      TagDefinition::new(
        VOICEMAIL_LEFT,
        "Voicemail Left",
        "bg-blue-100 text-blue-800",
        "Left voicemail message",
        true,
      ),
      TagDefinition::new(
        VIEWED_DURING_CALL,
        "Viewed During Call",
        "bg-purple-100 text-purple-800",
        "Visited website while on phone call",
        true,
      ),
      TagDefinition::new(
        VIEWED_AFTER_VOICEMAIL,
        "Viewed After Voicemail",
        "bg-indigo-100 text-indigo-800",
        "Visited website after voicemail was left",
        true,
      ),
      TagDefinition::new(
        RETURN_VISITOR,
        "Return Visitor",
        "bg-orange-100 text-orange-800",
        "Multiple website visits",
        true,
      ),
      TagDefinition::new(
        CALLBACK_RECEIVED,
        "Callback Received",
        "bg-yellow-100 text-yellow-800",
        "Customer called back",
        false,
      ),
    ])
  }

  pub fn get(&self, tag_type: &str) -> Option<&TagDefinition> {
    self.definitions.get(tag_type)
  }

  pub fn contains(&self, tag_type: &str) -> bool {
    self.definitions.contains_key(tag_type)
  }

  pub fn iter(&self) -> impl Iterator<Item = &TagDefinition> {
    self.definitions.values()
  }
}

/// A tag held by a lead. At most one per `tag_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
  pub tag_type:          String,
  pub value:             String,
  pub is_auto_generated: bool,
  pub granted_at:        DateTime<Utc>,
  pub granted_by:        String,
  pub rule_version:      Option<u32>,
}
