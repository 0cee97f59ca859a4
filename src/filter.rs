//! Recording filters: what gets recorded, and what gets masked first

use std::borrow::Cow;

use tracing::debug;

use crate::cassette::{Headers, HttpRequest, HttpResponse, MessagePayload, WebSocketExchange};
use crate::config::EngineConfig;

/// Placeholder written over redacted data
pub const REDACTED: &str = "[REDACTED]";

/// Why a live response was not recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Status code is in `recording.skip_status_codes`
    Status(u16),
    /// Body exceeds `limits.max_response_size`
    TooLarge(usize),
}

/// Filters applied to interactions before they are appended
#[derive(Debug, Clone, Default)]
pub struct RecordingFilter {
    headers: Vec<String>,
    secrets: Vec<String>,
    skip_status_codes: Vec<u16>,
    max_response_size: usize,
}

impl RecordingFilter {
    /// Build the filter described by `config`
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            headers: config.redaction.headers.clone(),
            secrets: config
                .redaction
                .secrets
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            skip_status_codes: config.recording.skip_status_codes.clone(),
            max_response_size: config.limits.max_response_size,
        }
    }

    /// `Some(reason)` if the response should be returned but not recorded
    #[must_use]
    pub fn skip_reason(&self, response: &HttpResponse) -> Option<SkipReason> {
        if self.skip_status_codes.contains(&response.status) {
            return Some(SkipReason::Status(response.status));
        }
        let size = response.body_len();
        (size > self.max_response_size).then_some(SkipReason::TooLarge(size))
    }

    /// Masked copy of a request
    #[must_use]
    pub fn redact_request(&self, request: &HttpRequest) -> HttpRequest {
        let mut request = request.clone();
        request.url = self.redact_str(&request.url);
        self.redact_headers(&mut request.headers);
        request.body = request.body.map(|b| self.redact_bytes(b));
        request
    }

    /// Form of an incoming request that compares equal to its recording.
    ///
    /// Recorded URLs and bodies have secrets replaced, so a live request is
    /// matched after the same replacement.
    #[must_use]
    pub fn matchable<'a>(&self, request: &'a HttpRequest) -> Cow<'a, HttpRequest> {
        if self.secrets.is_empty() {
            Cow::Borrowed(request)
        } else {
            Cow::Owned(self.redact_request(request))
        }
    }

    /// URL with secrets replaced, as it is stored in a cassette
    #[must_use]
    pub fn redact_url(&self, url: &str) -> String {
        self.redact_str(url)
    }

    /// Masked copy of a response
    #[must_use]
    pub fn redact_response(&self, response: &HttpResponse) -> HttpResponse {
        let mut response = response.clone();
        self.redact_headers(&mut response.headers);
        response.body = response.body.map(|b| self.redact_bytes(b));
        response
    }

    /// Masked copy of a WebSocket exchange
    #[must_use]
    pub fn redact_websocket(&self, exchange: &WebSocketExchange) -> WebSocketExchange {
        let mut exchange = exchange.clone();
        exchange.url = self.redact_url(&exchange.url);
        for message in &mut exchange.messages {
            match &mut message.payload {
                MessagePayload::Text(text) => *text = self.redact_str(text),
                MessagePayload::Binary(data) => {
                    *data = self.redact_bytes(std::mem::take(data));
                }
                MessagePayload::Ping(_) | MessagePayload::Pong(_) => {}
            }
        }
        exchange
    }

    fn redact_headers(&self, headers: &mut Headers) {
        for (name, value) in headers.values_mut() {
            if self.headers.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                debug!("Redacting header {name}");
                *value = REDACTED.to_string();
            } else if !self.secrets.is_empty() {
                *value = self.redact_str(value);
            }
        }
    }

    fn redact_str(&self, input: &str) -> String {
        self.secrets
            .iter()
            .fold(input.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    fn redact_bytes(&self, body: Vec<u8>) -> Vec<u8> {
        if self.secrets.is_empty() {
            return body;
        }
        match String::from_utf8(body) {
            Ok(text) => self.redact_str(&text).into_bytes(),
            Err(err) => err.into_bytes(),
        }
    }
}
