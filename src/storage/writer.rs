//! Binary cassette encoder

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};

use super::format::{payload_crc, FileHeader, HEADER_SIZE};
use super::{
    KIND_HTTP, KIND_WEBSOCKET, PAYLOAD_BINARY, PAYLOAD_PING, PAYLOAD_PONG, PAYLOAD_TEXT,
};
use crate::cassette::{
    Cassette, Cookie, Direction, Headers, HttpRequest, HttpResponse, InteractionKind,
    MessagePayload, SameSite, WebSocketExchange,
};
use crate::{ReelError, Result};

/// Encode a cassette as a `.reel` container
///
/// # Errors
///
/// Returns error if a count or length does not fit the container's
/// 32-bit fields
pub fn encode(cassette: &Cassette) -> Result<Vec<u8>> {
    let mut payload = BytesMut::with_capacity(4096);

    put_str(&mut payload, &cassette.version)?;
    put_str(&mut payload, &cassette.name)?;
    put_datetime(&mut payload, &cassette.recorded_at);

    payload.put_u32_le(count(cassette.interactions.len())?);
    for interaction in &cassette.interactions {
        match &interaction.kind {
            InteractionKind::Http { request, response } => {
                payload.put_u8(KIND_HTTP);
                put_common(&mut payload, interaction.recorded_at.as_ref(), interaction.response_time_ms);
                put_request(&mut payload, request)?;
                put_response(&mut payload, response)?;
            }
            InteractionKind::WebSocket(exchange) => {
                payload.put_u8(KIND_WEBSOCKET);
                put_common(&mut payload, interaction.recorded_at.as_ref(), interaction.response_time_ms);
                put_websocket(&mut payload, exchange)?;
            }
        }
    }

    payload.put_u32_le(count(cassette.cookies.len())?);
    for cookie in &cassette.cookies {
        put_cookie(&mut payload, cookie)?;
    }

    let mut header = FileHeader {
        payload_len: payload.len() as u64,
        recorded_at_ms: cassette.recorded_at.timestamp_millis(),
        interaction_count: count(cassette.interactions.len())?,
        cookie_count: count(cassette.cookies.len())?,
        payload_crc: payload_crc(&payload),
        ..FileHeader::default()
    };
    header.seal();

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(&payload);
    Ok(out)
}

fn count(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| ReelError::DataTooLarge {
        size: n,
        limit: u32::MAX as usize,
    })
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_bytes(buf, s.as_bytes())
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    buf.put_u32_le(count(data.len())?);
    buf.put_slice(data);
    Ok(())
}

fn put_opt_bytes(buf: &mut BytesMut, data: Option<&[u8]>) -> Result<()> {
    match data {
        Some(data) => {
            buf.put_u8(1);
            put_bytes(buf, data)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_datetime(buf: &mut BytesMut, dt: &DateTime<Utc>) {
    buf.put_i64_le(dt.timestamp());
    buf.put_u32_le(dt.timestamp_subsec_nanos());
}

fn put_opt_datetime(buf: &mut BytesMut, dt: Option<&DateTime<Utc>>) {
    match dt {
        Some(dt) => {
            buf.put_u8(1);
            put_datetime(buf, dt);
        }
        None => buf.put_u8(0),
    }
}

fn put_common(buf: &mut BytesMut, recorded_at: Option<&DateTime<Utc>>, response_time_ms: Option<u64>) {
    put_opt_datetime(buf, recorded_at);
    match response_time_ms {
        Some(ms) => {
            buf.put_u8(1);
            buf.put_u64_le(ms);
        }
        None => buf.put_u8(0),
    }
}

fn put_headers(buf: &mut BytesMut, headers: &Headers) -> Result<()> {
    buf.put_u32_le(count(headers.len())?);
    for (name, value) in headers.iter() {
        put_str(buf, name)?;
        put_str(buf, value)?;
    }
    Ok(())
}

fn put_request(buf: &mut BytesMut, request: &HttpRequest) -> Result<()> {
    put_str(buf, &request.method)?;
    put_str(buf, &request.url)?;
    put_headers(buf, &request.headers)?;
    put_opt_bytes(buf, request.body.as_deref())
}

fn put_response(buf: &mut BytesMut, response: &HttpResponse) -> Result<()> {
    buf.put_u16_le(response.status);
    put_headers(buf, &response.headers)?;
    put_opt_bytes(buf, response.body.as_deref())
}

fn put_websocket(buf: &mut BytesMut, exchange: &WebSocketExchange) -> Result<()> {
    put_str(buf, &exchange.url)?;
    buf.put_u32_le(count(exchange.messages.len())?);
    for message in &exchange.messages {
        buf.put_u8(match message.direction {
            Direction::Sent => 0,
            Direction::Received => 1,
        });
        buf.put_u64_le(message.timestamp_ms);
        match &message.payload {
            MessagePayload::Text(text) => {
                buf.put_u8(PAYLOAD_TEXT);
                put_str(buf, text)?;
            }
            MessagePayload::Binary(data) => {
                buf.put_u8(PAYLOAD_BINARY);
                put_bytes(buf, data)?;
            }
            MessagePayload::Ping(data) => {
                buf.put_u8(PAYLOAD_PING);
                put_bytes(buf, data)?;
            }
            MessagePayload::Pong(data) => {
                buf.put_u8(PAYLOAD_PONG);
                put_bytes(buf, data)?;
            }
        }
    }
    match &exchange.close_frame {
        Some(frame) => {
            buf.put_u8(1);
            buf.put_u16_le(frame.code);
            put_str(buf, &frame.reason)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_cookie(buf: &mut BytesMut, cookie: &Cookie) -> Result<()> {
    put_str(buf, &cookie.name)?;
    put_str(buf, &cookie.value)?;
    put_str(buf, &cookie.domain)?;
    put_str(buf, &cookie.path)?;
    put_opt_datetime(buf, cookie.expires.as_ref());
    match cookie.max_age {
        Some(max_age) => {
            buf.put_u8(1);
            buf.put_i64_le(max_age);
        }
        None => buf.put_u8(0),
    }
    buf.put_u8(u8::from(cookie.secure) | (u8::from(cookie.http_only) << 1));
    buf.put_u8(match cookie.same_site {
        None => 0,
        Some(SameSite::Strict) => 1,
        Some(SameSite::Lax) => 2,
        Some(SameSite::None) => 3,
    });
    put_datetime(buf, &cookie.created_at);
    Ok(())
}
