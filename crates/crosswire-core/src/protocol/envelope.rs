//! Envelope: the routed unit exchanged between peers (panic-free parsing).
//!
//! Byte layout, fields in declaration order, every variable-length field
//! prefixed with a u32 LE byte count:
//!
//! ```text
//! service | method | data | meta_count:u32 (name | value)* | message_id | code:i32 | desc
//! ```
//!
//! Parsing rules (same discipline as stream framing):
//! - Never index the buffer; always go through `Buf` with `remaining()` checks.
//! - Never `unwrap()` / `expect()` / `panic!()` in production paths.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// One metadata pair. Metas are an ordered list, not a map: duplicate names
/// and their relative order survive the round trip (multi-valued headers,
/// trace fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub name: String,
    pub value: String,
}

impl Meta {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The logical unit of routing, metadata, and payload.
///
/// `data` is opaque to the framework; the negotiated codec only matters to
/// whoever finally interprets it. An empty `message_id` marks a
/// fire-and-forget request: no response envelope will ever be produced for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub service: String,
    pub method: String,
    pub data: Bytes,
    pub metas: Vec<Meta>,
    pub message_id: Bytes,
    /// Status code, 0 = success. Only meaningful on responses.
    pub code: i32,
    /// Human-readable status description. Only meaningful on responses.
    pub desc: String,
}

impl Envelope {
    /// Build a request envelope. Callers that expect a reply set `message_id`
    /// afterwards.
    pub fn request(
        service: impl Into<String>,
        method: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Build a success response correlated to `req` (same message id,
    /// mirrored routing fields).
    pub fn reply_to(req: &Envelope, data: impl Into<Bytes>) -> Self {
        Self {
            service: req.service.clone(),
            method: req.method.clone(),
            data: data.into(),
            message_id: req.message_id.clone(),
            ..Default::default()
        }
    }

    /// Build an error response correlated to `req`.
    pub fn error_reply_to(req: &Envelope, code: i32, desc: impl Into<String>) -> Self {
        Self {
            service: req.service.clone(),
            method: req.method.clone(),
            message_id: req.message_id.clone(),
            code,
            desc: desc.into(),
            ..Default::default()
        }
    }

    /// A non-empty message id means the peer is waiting for exactly one
    /// response carrying the same id.
    pub fn expects_reply(&self) -> bool {
        !self.message_id.is_empty()
    }

    /// First meta value with this name, if any.
    pub fn meta(&self, name: &str) -> Option<&str> {
        self.metas
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.as_str())
    }

    /// Append a meta pair, preserving insertion order.
    pub fn push_meta(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.metas.push(Meta::new(name, value));
    }

    /// Serialize to the envelope byte layout (without the stream length
    /// prefix; that belongs to `frame`).
    pub fn encode(&self) -> Bytes {
        let mut cap = 4 * 6 + self.service.len() + self.method.len() + self.data.len();
        cap += self.message_id.len() + self.desc.len();
        for m in &self.metas {
            cap += 8 + m.name.len() + m.value.len();
        }
        let mut buf = BytesMut::with_capacity(cap);

        put_slice(&mut buf, self.service.as_bytes());
        put_slice(&mut buf, self.method.as_bytes());
        put_slice(&mut buf, &self.data);
        buf.put_u32_le(self.metas.len() as u32);
        for m in &self.metas {
            put_slice(&mut buf, m.name.as_bytes());
            put_slice(&mut buf, m.value.as_bytes());
        }
        put_slice(&mut buf, &self.message_id);
        buf.put_i32_le(self.code);
        put_slice(&mut buf, self.desc.as_bytes());

        buf.freeze()
    }

    /// Deserialize from the envelope byte layout. Trailing garbage after the
    /// last field is a protocol error.
    pub fn decode(mut buf: Bytes) -> Result<Envelope> {
        let service = get_string(&mut buf, "service")?;
        let method = get_string(&mut buf, "method")?;
        let data = get_bytes(&mut buf, "data")?;

        if buf.remaining() < 4 {
            return Err(short("meta count"));
        }
        let meta_count = buf.get_u32_le() as usize;
        // Each meta pair takes at least 8 bytes of length prefixes.
        if meta_count > buf.remaining() / 8 {
            return Err(Error::Protocol(format!(
                "meta count {meta_count} exceeds remaining buffer"
            )));
        }
        let mut metas = Vec::with_capacity(meta_count);
        for _ in 0..meta_count {
            let name = get_string(&mut buf, "meta name")?;
            let value = get_string(&mut buf, "meta value")?;
            metas.push(Meta { name, value });
        }

        let message_id = get_bytes(&mut buf, "message id")?;
        if buf.remaining() < 4 {
            return Err(short("code"));
        }
        let code = buf.get_i32_le();
        let desc = get_string(&mut buf, "desc")?;

        if buf.has_remaining() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after envelope",
                buf.remaining()
            )));
        }

        Ok(Envelope {
            service,
            method,
            data,
            metas,
            message_id,
            code,
            desc,
        })
    }
}

fn put_slice(buf: &mut BytesMut, s: &[u8]) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s);
}

fn get_bytes(buf: &mut Bytes, field: &'static str) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(short(field));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(Error::Protocol(format!(
            "{field} length {len} exceeds remaining buffer"
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String> {
    let raw = get_bytes(buf, field)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::Protocol(format!("{field} is not valid utf-8")))
}

fn short(field: &'static str) -> Error {
    Error::Protocol(format!("envelope too short reading {field}"))
}
