//! Cassette data model: a named, versioned, ordered set of interactions

mod cookie;
mod headers;
mod websocket;

pub use cookie::{Cookie, SameSite};
pub use headers::Headers;
pub use websocket::{CloseFrame, Direction, MessagePayload, WebSocketExchange, WebSocketMessage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ReelError, Result};

/// Schema version written for new cassettes
pub const CASSETTE_VERSION: &str = "2.0";

/// Schema major versions this build can read
pub const SUPPORTED_MAJOR_VERSIONS: &[u32] = &[1, 2];

/// A cassette containing recorded HTTP/WebSocket interactions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cassette {
    /// Schema version
    pub version: String,
    /// Cassette name, unique per storage directory
    pub name: String,
    /// Creation timestamp
    pub recorded_at: DateTime<Utc>,
    /// Interactions in recording order
    pub interactions: Vec<Interaction>,
    /// Cookies accumulated while recording
    #[serde(default)]
    pub cookies: Vec<Cookie>,
}

/// One recorded exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Protocol-specific payload
    pub kind: InteractionKind,
    /// When the interaction was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    /// Upstream response time, used for latency simulation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

/// Protocol of an interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InteractionKind {
    /// HTTP request/response pair
    Http {
        /// Recorded request
        request: HttpRequest,
        /// Recorded response
        response: HttpResponse,
    },
    /// WebSocket connection with its frames
    WebSocket(WebSocketExchange),
}

/// Protocol discriminant used by the matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain or TLS-terminated HTTP
    Http,
    /// WebSocket upgrade
    WebSocket,
}

/// HTTP request descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method, compared case-insensitively
    pub method: String,
    /// Full URL including the query string
    pub url: String,
    /// Request headers
    #[serde(default)]
    pub headers: Headers,
    /// Raw body, `None` when empty
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

/// HTTP response descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    #[serde(default)]
    pub headers: Headers,
    /// Raw body, `None` when empty
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Build a request without headers or body
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body; an empty body is stored as `None`
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self.body = (!body.is_empty()).then_some(body);
        self
    }

    /// Body length in bytes
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }
}

impl HttpResponse {
    /// Build a response without headers or body
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body; an empty body is stored as `None`
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self.body = (!body.is_empty()).then_some(body);
        self
    }

    /// Body length in bytes
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }
}

impl InteractionKind {
    /// Protocol of this interaction
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Http { .. } => Protocol::Http,
            Self::WebSocket(_) => Protocol::WebSocket,
        }
    }
}

impl Cassette {
    /// Create an empty cassette at the current schema version
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: CASSETTE_VERSION.to_string(),
            name: name.into(),
            recorded_at: Utc::now(),
            interactions: Vec::new(),
            cookies: Vec::new(),
        }
    }

    /// Append an interaction and return its index.
    ///
    /// Interactions are never reordered; the index is stable for the
    /// lifetime of the cassette.
    pub fn push(&mut self, kind: InteractionKind, response_time_ms: Option<u64>) -> usize {
        self.interactions.push(Interaction {
            kind,
            recorded_at: Some(Utc::now()),
            response_time_ms,
        });
        self.interactions.len() - 1
    }

    /// Insert a cookie, replacing one with the same `(name, domain, path)`
    pub fn upsert_cookie(&mut self, cookie: Cookie) {
        match self.cookies.iter_mut().find(|c| c.key() == cookie.key()) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// First cookie with this name
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Number of interactions
    #[must_use]
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether the cassette has no interactions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Reject schema versions whose major component this build does not know
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` for an unknown or malformed version
    pub fn check_version(&self) -> Result<()> {
        check_version(&self.name, &self.version)
    }
}

/// Reject a schema `version` this build does not know, for cassette `name`
///
/// # Errors
///
/// Returns `UnsupportedFormat` for an unknown or malformed version
pub fn check_version(name: &str, version: &str) -> Result<()> {
    match version_major(version) {
        Some(major) if SUPPORTED_MAJOR_VERSIONS.contains(&major) => Ok(()),
        _ => Err(ReelError::UnsupportedFormat {
            name: name.to_string(),
            reason: format!("unsupported cassette version '{version}'"),
        }),
    }
}

/// Major component of a `major.minor` version string
#[must_use]
pub fn version_major(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// Host part of a URL, lowercased, without userinfo or port
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    let host = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split(']').next().unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };

    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}
