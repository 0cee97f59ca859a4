//! Binary cassette decoder

use bytes::Buf;
use chrono::{DateTime, Utc};

use super::format::{payload_crc, FileHeader, HEADER_SIZE};
use super::{
    KIND_HTTP, KIND_WEBSOCKET, PAYLOAD_BINARY, PAYLOAD_PING, PAYLOAD_PONG, PAYLOAD_TEXT,
};
use crate::cassette::{
    Cassette, CloseFrame, Cookie, Direction, Headers, HttpRequest, HttpResponse, Interaction,
    InteractionKind, MessagePayload, SameSite, WebSocketExchange, WebSocketMessage,
};
use crate::{ReelError, Result};

/// Decode a `.reel` container
///
/// # Errors
///
/// Returns `CorruptedData` on a CRC mismatch and `InvalidFormat` if the
/// payload is truncated or malformed
pub fn decode(data: &[u8]) -> Result<Cassette> {
    let header = FileHeader::read(data)?;

    let payload = &data[HEADER_SIZE..];
    if payload.len() as u64 != header.payload_len {
        return Err(ReelError::InvalidFormat(format!(
            "Payload length mismatch: header says {}, file has {}",
            header.payload_len,
            payload.len()
        )));
    }

    let computed = payload_crc(payload);
    if computed != header.payload_crc {
        return Err(ReelError::CorruptedData {
            section: "payload",
            expected: header.payload_crc,
            actual: computed,
        });
    }

    let mut decoder = Decoder { buf: payload };

    let version = decoder.string()?;
    let name = decoder.string()?;
    let recorded_at = decoder.datetime()?;

    let interaction_count = decoder.u32()?;
    if interaction_count != header.interaction_count {
        return Err(ReelError::InvalidFormat(format!(
            "Interaction count mismatch: header says {}, payload has {interaction_count}",
            header.interaction_count
        )));
    }
    let mut interactions = Vec::with_capacity(decoder.capacity_hint(interaction_count));
    for _ in 0..interaction_count {
        interactions.push(decoder.interaction()?);
    }

    let cookie_count = decoder.u32()?;
    let mut cookies = Vec::with_capacity(decoder.capacity_hint(cookie_count));
    for _ in 0..cookie_count {
        cookies.push(decoder.cookie()?);
    }

    if decoder.buf.has_remaining() {
        return Err(ReelError::InvalidFormat(format!(
            "{} trailing bytes after payload",
            decoder.buf.remaining()
        )));
    }

    Ok(Cassette {
        version,
        name,
        recorded_at,
        interactions,
        cookies,
    })
}

/// Bounds-checked reader over the payload
struct Decoder<'a> {
    buf: &'a [u8],
}

impl Decoder<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ReelError::InvalidFormat(format!(
                "Truncated payload: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Cap preallocation by what the remaining bytes could possibly hold
    fn capacity_hint(&self, n: u32) -> usize {
        (n as usize).min(self.buf.remaining())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ReelError::InvalidFormat(format!("Invalid option tag {other}"))),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    fn opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        if self.flag()? {
            self.bytes().map(Some)
        } else {
            Ok(None)
        }
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| ReelError::InvalidFormat(format!("Invalid UTF-8 string: {e}")))
    }

    fn datetime(&mut self) -> Result<DateTime<Utc>> {
        let secs = self.i64()?;
        let nanos = self.u32()?;
        DateTime::from_timestamp(secs, nanos)
            .ok_or_else(|| ReelError::InvalidFormat(format!("Invalid timestamp {secs}.{nanos}")))
    }

    fn opt_datetime(&mut self) -> Result<Option<DateTime<Utc>>> {
        if self.flag()? {
            self.datetime().map(Some)
        } else {
            Ok(None)
        }
    }

    fn headers(&mut self) -> Result<Headers> {
        let n = self.u32()?;
        let mut pairs = Vec::with_capacity(self.capacity_hint(n));
        for _ in 0..n {
            let name = self.string()?;
            let value = self.string()?;
            pairs.push((name, value));
        }
        Ok(Headers::from(pairs))
    }

    fn interaction(&mut self) -> Result<Interaction> {
        let tag = self.u8()?;
        let recorded_at = self.opt_datetime()?;
        let response_time_ms = if self.flag()? { Some(self.u64()?) } else { None };

        let kind = match tag {
            KIND_HTTP => InteractionKind::Http {
                request: self.request()?,
                response: self.response()?,
            },
            KIND_WEBSOCKET => InteractionKind::WebSocket(self.websocket()?),
            other => {
                return Err(ReelError::InvalidFormat(format!(
                    "Unknown interaction kind {other}"
                )))
            }
        };

        Ok(Interaction {
            kind,
            recorded_at,
            response_time_ms,
        })
    }

    fn request(&mut self) -> Result<HttpRequest> {
        Ok(HttpRequest {
            method: self.string()?,
            url: self.string()?,
            headers: self.headers()?,
            body: self.opt_bytes()?,
        })
    }

    fn response(&mut self) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status: self.u16()?,
            headers: self.headers()?,
            body: self.opt_bytes()?,
        })
    }

    fn websocket(&mut self) -> Result<WebSocketExchange> {
        let url = self.string()?;
        let n = self.u32()?;
        let mut messages = Vec::with_capacity(self.capacity_hint(n));
        for _ in 0..n {
            let direction = match self.u8()? {
                0 => Direction::Sent,
                1 => Direction::Received,
                other => {
                    return Err(ReelError::InvalidFormat(format!(
                        "Invalid frame direction {other}"
                    )))
                }
            };
            let timestamp_ms = self.u64()?;
            let payload = match self.u8()? {
                PAYLOAD_TEXT => MessagePayload::Text(self.string()?),
                PAYLOAD_BINARY => MessagePayload::Binary(self.bytes()?),
                PAYLOAD_PING => MessagePayload::Ping(self.bytes()?),
                PAYLOAD_PONG => MessagePayload::Pong(self.bytes()?),
                other => {
                    return Err(ReelError::InvalidFormat(format!(
                        "Invalid frame payload type {other}"
                    )))
                }
            };
            messages.push(WebSocketMessage {
                direction,
                timestamp_ms,
                payload,
            });
        }

        let close_frame = if self.flag()? {
            Some(CloseFrame {
                code: self.u16()?,
                reason: self.string()?,
            })
        } else {
            None
        };

        Ok(WebSocketExchange {
            url,
            messages,
            close_frame,
        })
    }

    fn cookie(&mut self) -> Result<Cookie> {
        let name = self.string()?;
        let value = self.string()?;
        let domain = self.string()?;
        let path = self.string()?;
        let expires = self.opt_datetime()?;
        let max_age = if self.flag()? { Some(self.i64()?) } else { None };
        let flags = self.u8()?;
        let same_site = match self.u8()? {
            0 => None,
            1 => Some(SameSite::Strict),
            2 => Some(SameSite::Lax),
            3 => Some(SameSite::None),
            other => {
                return Err(ReelError::InvalidFormat(format!(
                    "Invalid SameSite value {other}"
                )))
            }
        };
        let created_at = self.datetime()?;

        Ok(Cookie {
            name,
            value,
            domain,
            path,
            expires,
            max_age,
            secure: flags & 0b01 != 0,
            http_only: flags & 0b10 != 0,
            same_site,
            created_at,
        })
    }
}
