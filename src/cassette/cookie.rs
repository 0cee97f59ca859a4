//! Cookies observed in `Set-Cookie` headers while recording

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{ReelError, Result};

/// A single HTTP cookie with its RFC 6265 attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// Domain attribute, or the request host when absent
    pub domain: String,
    /// Path attribute, `/` when absent
    pub path: String,
    /// Expires attribute
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    /// Max-Age attribute in seconds
    #[serde(default)]
    pub max_age: Option<i64>,
    /// Secure flag
    #[serde(default)]
    pub secure: bool,
    /// HttpOnly flag
    #[serde(default)]
    pub http_only: bool,
    /// SameSite policy
    #[serde(default)]
    pub same_site: Option<SameSite>,
    /// When the cookie was observed
    pub created_at: DateTime<Utc>,
}

/// SameSite attribute values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    /// First-party context only
    Strict,
    /// Sent with top-level navigation
    Lax,
    /// Sent in all contexts
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => f.write_str("Strict"),
            Self::Lax => f.write_str("Lax"),
            Self::None => f.write_str("None"),
        }
    }
}

impl Cookie {
    /// Parse a `Set-Cookie` header value.
    ///
    /// `default_domain` is used when the header carries no `Domain`
    /// attribute (normally the host of the request URL).
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the `name=value` pair is missing
    pub fn parse(header_value: &str, default_domain: &str) -> Result<Self> {
        let mut parts = header_value.split(';').map(str::trim);

        let (name, value) = parts
            .next()
            .and_then(|pair| pair.split_once('='))
            .ok_or_else(|| {
                ReelError::InvalidFormat(format!("Set-Cookie without name=value: {header_value}"))
            })?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ReelError::InvalidFormat(format!(
                "Set-Cookie with empty name: {header_value}"
            )));
        }

        let mut cookie = Self {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: default_domain.to_ascii_lowercase(),
            path: "/".to_string(),
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
            created_at: Utc::now(),
        };

        for part in parts.filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((key, val)) => {
                    let val = val.trim();
                    match key.trim().to_ascii_lowercase().as_str() {
                        "domain" if !val.is_empty() => {
                            cookie.domain = val.trim_start_matches('.').to_ascii_lowercase();
                        }
                        "path" if val.starts_with('/') => cookie.path = val.to_string(),
                        "expires" => {
                            cookie.expires = DateTime::parse_from_rfc2822(val)
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc));
                        }
                        "max-age" => cookie.max_age = val.parse().ok(),
                        "samesite" => {
                            cookie.same_site = match val.to_ascii_lowercase().as_str() {
                                "strict" => Some(SameSite::Strict),
                                "lax" => Some(SameSite::Lax),
                                "none" => Some(SameSite::None),
                                _ => None,
                            };
                        }
                        _ => {}
                    }
                }
                None => match part.to_ascii_lowercase().as_str() {
                    "secure" => cookie.secure = true,
                    "httponly" => cookie.http_only = true,
                    _ => {}
                },
            }
        }

        Ok(cookie)
    }

    /// Identity used for de-duplication within a cassette
    #[must_use]
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.name, &self.domain, &self.path)
    }

    /// Whether the cookie has expired relative to `now`.
    ///
    /// Max-Age takes precedence over Expires. A Max-Age too large to
    /// represent as a date never expires.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return true;
            }
            return Duration::try_seconds(max_age)
                .and_then(|age| self.created_at.checked_add_signed(age))
                .is_some_and(|deadline| deadline <= now);
        }
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Whether the cookie has expired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_cookie() {
        let cookie = Cookie::parse(
            "JSESSIONID=abc123; Domain=.example.com; Path=/app; Max-Age=3600; Secure; HttpOnly; SameSite=Lax",
            "api.example.com",
        )
        .unwrap();

        assert_eq!(cookie.name, "JSESSIONID");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.domain, "example.com");
        assert_eq!(cookie.path, "/app");
        assert_eq!(cookie.max_age, Some(3600));
        assert!(cookie.secure);
        assert!(cookie.http_only);
        assert_eq!(cookie.same_site, Some(SameSite::Lax));
    }

    #[test]
    fn test_parse_defaults() {
        let cookie = Cookie::parse("theme=dark", "Example.COM").unwrap();

        assert_eq!(cookie.domain, "example.com");
        assert_eq!(cookie.path, "/");
        assert!(!cookie.secure);
        assert!(cookie.same_site.is_none());
    }

    #[test]
    fn test_parse_expires() {
        let cookie = Cookie::parse(
            "old=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT",
            "example.com",
        )
        .unwrap();

        assert!(cookie.expires.is_some());
        assert!(cookie.is_expired());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Cookie::parse("novalue", "example.com").is_err());
        assert!(Cookie::parse("=value", "example.com").is_err());
    }

    #[test]
    fn test_max_age_precedence() {
        let mut cookie = Cookie::parse("s=1; Max-Age=60", "example.com").unwrap();
        cookie.expires = Some(Utc::now() - Duration::days(1));

        assert!(!cookie.is_expired());

        cookie.max_age = Some(0);
        assert!(cookie.is_expired());
    }

    #[test]
    fn test_huge_max_age_never_expires() {
        let cookie = Cookie::parse("sid=1; Max-Age=99999999999999", "example.com").unwrap();
        assert_eq!(cookie.max_age, Some(99_999_999_999_999));
        assert!(!cookie.is_expired());

        let mut cookie = Cookie::parse("sid=1", "example.com").unwrap();
        cookie.max_age = Some(i64::MAX);
        assert!(!cookie.is_expired());
    }
}
