//! Request fingerprinting for constant-time candidate lookup

use sha2::{Digest, Sha256};

use crate::cassette::{HttpRequest, InteractionKind, Protocol};

/// SHA-256 fingerprint of a matching key
pub type Fingerprint = [u8; 32];

/// Compute the fingerprint of a `(protocol, method, url)` key
///
/// The fingerprint includes:
/// 1. Protocol tag
/// 2. Method (uppercase normalized)
/// 3. Full URL, query string included, byte for byte
///
/// Each field is length-prefixed so adjacent fields cannot alias.
#[must_use]
pub fn fingerprint(protocol: Protocol, method: &str, url: &str) -> Fingerprint {
    let mut hasher = Sha256::new();

    // 1. Protocol
    hasher.update([protocol_tag(protocol)]);

    // 2. Method (uppercase normalized)
    let method = method.to_ascii_uppercase();
    hasher.update((method.len() as u32).to_le_bytes());
    hasher.update(method.as_bytes());

    // 3. URL (exact)
    hasher.update((url.len() as u32).to_le_bytes());
    hasher.update(url.as_bytes());

    hasher.finalize().into()
}

/// Fingerprint of an incoming HTTP request
#[must_use]
pub fn fingerprint_request(request: &HttpRequest) -> Fingerprint {
    fingerprint(Protocol::Http, &request.method, &request.url)
}

/// Fingerprint of a recorded interaction
#[must_use]
pub fn fingerprint_interaction(kind: &InteractionKind) -> Fingerprint {
    match kind {
        InteractionKind::Http { request, .. } => fingerprint_request(request),
        InteractionKind::WebSocket(exchange) => {
            fingerprint(Protocol::WebSocket, "GET", &exchange.url)
        }
    }
}

/// Short hex prefix for log lines
#[must_use]
pub fn short_hex(fingerprint: &Fingerprint) -> String {
    hex::encode(&fingerprint[..8])
}

fn protocol_tag(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Http => 1,
        Protocol::WebSocket => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cassette::{HttpResponse, WebSocketExchange};

    #[test]
    fn test_fingerprint_deterministic() {
        let hash1 = fingerprint(Protocol::Http, "GET", "http://api.test/x");
        let hash2 = fingerprint(Protocol::Http, "GET", "http://api.test/x");

        assert_eq!(hash1, hash2, "Fingerprint must be deterministic");
    }

    #[test]
    fn test_method_case_insensitive() {
        let upper = fingerprint(Protocol::Http, "POST", "http://api.test/x");
        let lower = fingerprint(Protocol::Http, "post", "http://api.test/x");

        assert_eq!(upper, lower);
    }

    #[test]
    fn test_fingerprint_different_methods() {
        let get = fingerprint(Protocol::Http, "GET", "http://api.test/x");
        let post = fingerprint(Protocol::Http, "POST", "http://api.test/x");

        assert_ne!(get, post, "Different methods should produce different hashes");
    }

    #[test]
    fn test_query_string_is_significant() {
        let a = fingerprint(Protocol::Http, "GET", "http://api.test/x?a=1&b=2");
        let b = fingerprint(Protocol::Http, "GET", "http://api.test/x?b=2&a=1");

        assert_ne!(a, b, "URLs are compared without normalization");
    }

    #[test]
    fn test_protocol_separates_keys() {
        let http = fingerprint(Protocol::Http, "GET", "ws://chat.test/");
        let ws = fingerprint(Protocol::WebSocket, "GET", "ws://chat.test/");

        assert_ne!(http, ws);
    }

    #[test]
    fn test_interaction_matches_request() {
        let request = HttpRequest::new("get", "http://api.test/users");
        let kind = InteractionKind::Http {
            request: HttpRequest::new("GET", "http://api.test/users"),
            response: HttpResponse::new(200),
        };

        assert_eq!(fingerprint_request(&request), fingerprint_interaction(&kind));

        let ws = InteractionKind::WebSocket(WebSocketExchange::new("http://api.test/users"));
        assert_ne!(fingerprint_request(&request), fingerprint_interaction(&ws));
    }

    #[test]
    fn test_short_hex() {
        let hash = fingerprint(Protocol::Http, "GET", "/");
        assert_eq!(short_hex(&hash).len(), 16);
    }
}
