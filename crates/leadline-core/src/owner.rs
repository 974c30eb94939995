//! Business owners and the matching keys used to deduplicate them.
//!
//! Resolution itself runs inside the store, under the unique indexes on
//! `(company_id, email_key)` and `(company_id, phone_key)`. This module only
//! defines the candidate shape and how identities are normalised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// The canonical owner of a prospect business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessOwner {
  pub owner_id:      Uuid,
  pub company_id:    Uuid,
  pub name:          Option<String>,
  pub email:         Option<String>,
  pub phone:         Option<String>,
  pub auth_provider: String,
  pub last_login:    Option<DateTime<Utc>>,
  pub created_at:    DateTime<Utc>,
}

/// An identity to resolve against the owners of one company.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerCandidate {
  pub company_id:    Uuid,
  pub name:          Option<String>,
  pub email:         Option<String>,
  pub phone:         Option<String>,
  /// Defaults to `pipeline_contact`.
  pub auth_provider: Option<String>,
}

/// A candidate with its matching keys computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCandidate {
  pub company_id:    Uuid,
  pub name:          Option<String>,
  pub email:         Option<String>,
  pub email_key:     Option<String>,
  pub phone:         Option<String>,
  pub phone_key:     Option<String>,
  pub auth_provider: String,
}

impl OwnerCandidate {
  /// Compute matching keys. A candidate must carry a usable email or phone.
  pub fn normalize(&self) -> Result<NormalizedCandidate> {
    let email_key = self.email.as_deref().and_then(email_key);
    let phone_key = self.phone.as_deref().and_then(phone_key);
    if email_key.is_none() && phone_key.is_none() {
      return Err(Error::MalformedPayload {
        origin: "owner".into(),
        reason: "candidate needs a valid email or phone".into(),
      });
    }
    Ok(NormalizedCandidate {
      company_id: self.company_id,
      name: non_blank(self.name.as_deref()),
      email: email_key.as_ref().and(non_blank(self.email.as_deref())),
      email_key,
      phone: phone_key.as_ref().and(non_blank(self.phone.as_deref())),
      phone_key,
      auth_provider: self
        .auth_provider
        .clone()
        .unwrap_or_else(|| "pipeline_contact".into()),
    })
  }
}

/// How a resolution found its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedOn {
  Email,
  Phone,
  /// Newly inserted.
  Created,
  /// Lost an insert race; the concurrent winner was returned.
  Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
  pub owner:      BusinessOwner,
  pub matched_on: MatchedOn,
}

impl Resolution {
  pub fn created(&self) -> bool { self.matched_on == MatchedOn::Created }
}

// ─── Keys ────────────────────────────────────────────────────────────────────

/// Case-insensitive email key. Anything without an `@` is not an email.
pub fn email_key(raw: &str) -> Option<String> {
  let key = raw.trim().to_lowercase();
  match key.split_once('@') {
    Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
      Some(key)
    }
    _ => None,
  }
}

/// Digits-only phone key. A leading US country code is dropped so that
/// `+1 (205) 500-5170` and `205-500-5170` match.
pub fn phone_key(raw: &str) -> Option<String> {
  let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
  let digits = if digits.len() == 11 && digits.starts_with('1') {
    digits[1..].to_owned()
  } else {
    digits
  };
  (digits.len() >= 7).then_some(digits)
}

fn non_blank(s: Option<&str>) -> Option<String> {
  s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn email_keys_ignore_case_and_whitespace() {
    assert_eq!(
      email_key("  Owner@CoolAir.COM "),
      Some("owner@coolair.com".into())
    );
    assert_eq!(email_key("not-an-email"), None);
    assert_eq!(email_key("@example.com"), None);
  }

  #[test]
  fn phone_keys_keep_digits_and_drop_us_prefix() {
    assert_eq!(phone_key("(205) 500-5170"), Some("2055005170".into()));
    assert_eq!(phone_key("+1 205.500.5170"), Some("2055005170".into()));
    assert_eq!(phone_key("205-500-5170"), Some("2055005170".into()));
    assert_eq!(phone_key("ext 12"), None);
  }

  #[test]
  fn candidate_without_contact_is_rejected() {
    let candidate = OwnerCandidate {
      company_id: Uuid::new_v4(),
      name: Some("Dana".into()),
      email: Some("nope".into()),
      ..Default::default()
    };
    assert!(matches!(
      candidate.normalize(),
      Err(Error::MalformedPayload { .. })
    ));
  }

  #[test]
  fn candidate_keeps_display_values_beside_keys() {
    let n = OwnerCandidate {
      company_id: Uuid::nil(),
      email: Some(" Dana@CoolAir.com".into()),
      phone: Some("(601) 613-7813".into()),
      ..Default::default()
    }
    .normalize()
    .unwrap();
    assert_eq!(n.email.as_deref(), Some("Dana@CoolAir.com"));
    assert_eq!(n.email_key.as_deref(), Some("dana@coolair.com"));
    assert_eq!(n.phone_key.as_deref(), Some("6016137813"));
    assert_eq!(n.auth_provider, "pipeline_contact");
  }
}
