// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messaging addresses (URNs) and contact URN rows.

use serde::{Deserialize, Serialize};

use super::ids::{ChannelID, ContactID, OrgID, UrnID};

/// Priority given to a contact's preferred URN.
pub const TOP_PRIORITY: i32 = 1000;

/// Schemes we know how to normalize and route.
pub const VALID_SCHEMES: &[&str] = &[
    "discord",
    "email",
    "ext",
    "facebook",
    "fcm",
    "freshchat",
    "instagram",
    "jiochat",
    "line",
    "mailto",
    "rocketchat",
    "slack",
    "tel",
    "telegram",
    "twitter",
    "twitterid",
    "viber",
    "vk",
    "webchat",
    "wechat",
    "whatsapp",
];

/// A parsed URN: `scheme:path[?query][#display]`.
///
/// Only `scheme:path` is part of its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urn {
    /// The scheme, e.g. `tel`.
    pub scheme: String,
    /// The scheme-specific address.
    pub path: String,
    /// Optional query string (without the `?`).
    pub query: String,
    /// Optional display value (without the `#`).
    pub display: String,
}

impl Urn {
    /// Parses a URN string without normalizing it.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("'{}' has no scheme", s))?;
        let scheme = scheme.trim().to_lowercase();
        if scheme.is_empty() {
            return Err(format!("'{}' has an empty scheme", s));
        }

        let (rest, display) = match rest.split_once('#') {
            Some((r, d)) => (r, d.to_string()),
            None => (rest, String::new()),
        };
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (rest.to_string(), String::new()),
        };

        Ok(Self {
            scheme,
            path,
            query,
            display,
        })
    }

    /// Builds a URN from scheme and path.
    pub fn new(scheme: &str, path: &str) -> Self {
        Self {
            scheme: scheme.to_lowercase(),
            path: path.to_string(),
            query: String::new(),
            display: String::new(),
        }
    }

    /// The identity of this URN, `scheme:path`.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }

    /// Returns the normalized form of this URN.
    pub fn normalize(&self, default_country: Option<&str>) -> Self {
        let path = self.path.trim();
        let path = match self.scheme.as_str() {
            "tel" => normalize_tel(path, default_country),
            "twitter" => path.trim_start_matches('@').to_lowercase(),
            "email" | "mailto" => path.to_lowercase(),
            "whatsapp" => path.trim_start_matches('+').to_string(),
            _ => path.to_string(),
        };

        Self {
            scheme: self.scheme.clone(),
            path,
            query: self.query.clone(),
            display: self.display.clone(),
        }
    }

    /// Checks this URN is valid for its scheme.
    pub fn validate(&self) -> Result<(), String> {
        if !VALID_SCHEMES.contains(&self.scheme.as_str()) {
            return Err(format!("unknown scheme '{}'", self.scheme));
        }
        if self.path.is_empty() {
            return Err("path cannot be empty".to_string());
        }
        if self.path.chars().any(char::is_whitespace) {
            return Err("path cannot contain whitespace".to_string());
        }

        let valid = match self.scheme.as_str() {
            "tel" => {
                let digits = self.path.strip_prefix('+').unwrap_or(&self.path);
                (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
                    || self.path.chars().all(|c| c.is_ascii_alphanumeric())
            }
            "whatsapp" | "telegram" | "twitterid" => {
                self.path.chars().all(|c| c.is_ascii_digit())
            }
            "email" | "mailto" => {
                matches!(self.path.split_once('@'), Some((u, d)) if !u.is_empty() && d.contains('.'))
            }
            _ => true,
        };

        if valid {
            Ok(())
        } else {
            Err(format!("invalid path for scheme {}", self.scheme))
        }
    }

    /// Parses, normalizes and validates a URN string in one go.
    pub fn parse_normalized(s: &str, default_country: Option<&str>) -> Result<Self, String> {
        let urn = Self::parse(s)?.normalize(default_country);
        urn.validate()?;
        Ok(urn)
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.display.is_empty() {
            write!(f, "#{}", self.display)?;
        }
        Ok(())
    }
}

fn normalize_tel(path: &str, default_country: Option<&str>) -> String {
    let mut cleaned: String = path
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    if let Some(rest) = cleaned.strip_prefix("00") {
        cleaned = format!("+{}", rest);
    }

    // numbers without a leading + are left alone unless we know a calling code for the org
    if !cleaned.starts_with('+') && cleaned.chars().all(|c| c.is_ascii_digit()) {
        if let Some(code) = default_country.and_then(calling_code) {
            if let Some(local) = cleaned.strip_prefix('0') {
                if local.len() >= 6 {
                    return format!("+{}{}", code, local);
                }
            } else if cleaned.starts_with(code) && cleaned.len() > 10 {
                return format!("+{}", cleaned);
            }
        }
    }

    if cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        cleaned.to_lowercase()
    } else {
        cleaned
    }
}

fn calling_code(country: &str) -> Option<&'static str> {
    match country.to_uppercase().as_str() {
        "US" | "CA" => Some("1"),
        "RW" => Some("250"),
        "KE" => Some("254"),
        "UG" => Some("256"),
        "NG" => Some("234"),
        "EC" => Some("593"),
        "BR" => Some("55"),
        "GB" => Some("44"),
        "IN" => Some("91"),
        _ => None,
    }
}

/// A row in `contact_urns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContactUrn {
    /// Row id.
    pub id: UrnID,
    /// Owning org.
    pub org_id: OrgID,
    /// Owning contact, nil when orphaned.
    pub contact_id: ContactID,
    /// `scheme:path`.
    pub identity: String,
    /// The scheme.
    pub scheme: String,
    /// The path.
    pub path: String,
    /// Optional display value.
    pub display: Option<String>,
    /// Higher is preferred.
    pub priority: i32,
    /// Preferred channel for sending to this URN.
    pub channel_id: ChannelID,
    /// Channel-specific auth tokens.
    pub auth_tokens: Option<sqlx::types::Json<std::collections::HashMap<String, String>>>,
}

impl ContactUrn {
    /// The URN this row holds.
    pub fn urn(&self) -> Urn {
        Urn {
            scheme: self.scheme.clone(),
            path: self.path.clone(),
            query: String::new(),
            display: self.display.clone().unwrap_or_default(),
        }
    }

    /// Auth tokens as a plain map.
    pub fn auth_tokens(&self) -> std::collections::HashMap<String, String> {
        self.auth_tokens
            .as_ref()
            .map(|t| t.0.clone())
            .unwrap_or_default()
    }
}

/// Orders URN rows by priority desc, id asc.
pub fn sort_by_priority(urns: &mut [ContactUrn]) {
    urns.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_query_and_display() {
        let urn = Urn::parse("telegram:12345?id=3#bobby").unwrap();
        assert_eq!(urn.scheme, "telegram");
        assert_eq!(urn.path, "12345");
        assert_eq!(urn.query, "id=3");
        assert_eq!(urn.display, "bobby");
        assert_eq!(urn.identity(), "telegram:12345");
        assert_eq!(urn.to_string(), "telegram:12345?id=3#bobby");

        assert!(Urn::parse("nocolon").is_err());
        assert!(Urn::parse(":123").is_err());
    }

    #[test]
    fn test_normalize() {
        let cases = vec![
            ("tel:+1 (605) 574-2222", None, "tel:+16055742222"),
            ("tel:0044 7911 123456", None, "tel:+447911123456"),
            ("tel:0788383383", Some("RW"), "tel:+250788383383"),
            ("tel:ABC123", None, "tel:abc123"),
            ("twitter:@Bobby", None, "twitter:bobby"),
            ("email:Bob@Example.COM", None, "email:bob@example.com"),
            ("whatsapp:+250788383383", None, "whatsapp:250788383383"),
            ("telegram: 200001 ", None, "telegram:200001"),
        ];

        for (input, country, expected) in cases {
            let urn = Urn::parse(input).unwrap().normalize(country);
            assert_eq!(urn.identity(), expected, "normalizing {}", input);
        }
    }

    #[test]
    fn test_validate() {
        assert!(Urn::parse_normalized("tel:+16055742222", None).is_ok());
        assert!(Urn::parse_normalized("telegram:200001", None).is_ok());
        assert!(Urn::parse_normalized("email:bob@example.com", None).is_ok());
        assert!(Urn::parse_normalized("facebook:1234567", None).is_ok());

        assert!(Urn::parse_normalized("xyz:1234", None).is_err());
        assert!(Urn::parse_normalized("tel:", None).is_err());
        assert!(Urn::parse_normalized("telegram:abc", None).is_err());
        assert!(Urn::parse_normalized("email:bob", None).is_err());
        assert!(Urn::parse_normalized("tel:+12-ab", None).is_err());
    }

    #[test]
    fn test_sort_by_priority() {
        let mk = |id: i64, priority: i32| ContactUrn {
            id: UrnID(id),
            org_id: OrgID(1),
            contact_id: ContactID(1),
            identity: format!("tel:+{}", id),
            scheme: "tel".to_string(),
            path: format!("+{}", id),
            display: None,
            priority,
            channel_id: ChannelID(0),
            auth_tokens: None,
        };
        let mut urns = vec![mk(3, 999), mk(2, 1000), mk(1, 999)];
        sort_by_priority(&mut urns);
        let ids: Vec<i64> = urns.iter().map(|u| u.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }
}
