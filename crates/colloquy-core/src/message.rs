//! The universal message envelope exchanged between peers.

use std::fmt;

use bytes::Bytes;

use crate::status::Status;
use crate::xfer::XferPipe;

/// Body codec ID meaning "no codec".
pub const CODEC_NONE: u8 = 0;

/// The three message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// A request that expects a [`MsgType::Reply`] with the same seq.
    Call = 1,
    /// The answer to a [`MsgType::Call`]; carries a status.
    Reply = 2,
    /// A fire-and-forget notification.
    Push = 3,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Call),
            2 => Some(Self::Reply),
            3 => Some(Self::Push),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => write!(f, "CALL"),
            Self::Reply => write!(f, "REPLY"),
            Self::Push => write!(f, "PUSH"),
        }
    }
}

/// An ordered multimap of metadata entries.
///
/// Duplicate keys are allowed and insertion order is preserved on the
/// wire, where the map is rendered as a query string `k=v&k2=v2…` with
/// percent-escaped keys and values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    entries: Vec<(String, Vec<u8>)>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `key`, if any.
    pub fn peek(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// First value for `key` as UTF-8, if any.
    pub fn peek_str(&self, key: &str) -> Option<&str> {
        self.peek(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Append an entry, keeping any existing values for the same key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace every value for `key` with a single entry.
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.to_owned(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Render the wire form, preserving insertion order.
    pub fn to_query(&self) -> String {
        let mut out = String::new();
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            percent_encode_into(k.as_bytes(), &mut out);
            out.push('=');
            percent_encode_into(v, &mut out);
        }
        out
    }

    /// Parse the wire form produced by [`Meta::to_query`].
    pub fn parse_query(raw: &[u8]) -> Result<Self, Status> {
        let mut meta = Meta::new();
        if raw.is_empty() {
            return Ok(meta);
        }
        for pair in raw.split(|&b| b == b'&') {
            if pair.is_empty() {
                continue;
            }
            let mut it = pair.splitn(2, |&b| b == b'=');
            let key = percent_decode(it.next().unwrap_or_default())
                .map_err(|e| Status::protocol_error(format!("bad meta escape: {e}")))?;
            let key = String::from_utf8(key)
                .map_err(|_| Status::protocol_error("meta key is not UTF-8"))?;
            let value = percent_decode(it.next().unwrap_or_default())
                .map_err(|e| Status::protocol_error(format!("bad meta escape: {e}")))?;
            meta.entries.push((key, value));
        }
        Ok(meta)
    }
}

/// The envelope for every CALL, REPLY and PUSH.
///
/// Invariants enforced by the protocol layer:
/// - `status` is written to the wire iff `mtype == Reply`;
/// - `body` holds codec-encoded, *untransformed* bytes — the transfer
///   pipe is applied on encode and reversed on decode, so a decoded
///   message is always directly codec-decodable;
/// - `size` is the wire length of the frame after the length prefix, as
///   observed by the last encode/decode.
#[derive(Clone, Debug)]
pub struct Message {
    pub seq: u32,
    pub mtype: MsgType,
    pub service_method: String,
    pub status: Status,
    pub meta: Meta,
    pub body_codec: u8,
    pub xfer_pipe: XferPipe,
    pub body: Bytes,
    pub size: u32,
}

impl Message {
    /// A blank message of the given type.
    pub fn new(mtype: MsgType) -> Self {
        Self {
            seq: 0,
            mtype,
            service_method: String::new(),
            status: Status::ok(),
            meta: Meta::new(),
            body_codec: CODEC_NONE,
            xfer_pipe: XferPipe::new(),
            body: Bytes::new(),
            size: 0,
        }
    }

    /// A CALL addressed to `service_method`.
    pub fn new_call(seq: u32, service_method: impl Into<String>) -> Self {
        let mut m = Self::new(MsgType::Call);
        m.seq = seq;
        m.service_method = service_method.into();
        m
    }

    /// A PUSH addressed to `service_method`.
    pub fn new_push(seq: u32, service_method: impl Into<String>) -> Self {
        let mut m = Self::new(MsgType::Push);
        m.seq = seq;
        m.service_method = service_method.into();
        m
    }

    /// The REPLY paired to `call`: same seq, same service method, and
    /// the request's body codec and transfer pipe (a handler may
    /// override the codec afterwards).
    pub fn new_reply(call: &Message, status: Status) -> Self {
        let mut m = Self::new(MsgType::Reply);
        m.seq = call.seq;
        m.service_method = call.service_method.clone();
        m.body_codec = call.body_codec;
        m.xfer_pipe = call.xfer_pipe.clone();
        m.status = status;
        m
    }

    /// Field-wise equality ignoring the decode-time `size` bookkeeping.
    pub fn wire_eq(&self, other: &Message) -> bool {
        self.seq == other.seq
            && self.mtype == other.mtype
            && self.service_method == other.service_method
            && (self.mtype != MsgType::Reply || self.status == other.status)
            && self.meta == other.meta
            && self.body_codec == other.body_codec
            && self.xfer_pipe.ids() == other.xfer_pipe.ids()
            && self.body == other.body
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq={} {:?}", self.mtype, self.seq, self.service_method)?;
        if self.mtype == MsgType::Reply {
            write!(f, " status[{}]", self.status)?;
        }
        if f.alternate() {
            write!(f, " meta={:?} body={} bytes", self.meta.to_query(), self.body.len())?;
        }
        Ok(())
    }
}

const UPPERHEX: &[u8; 16] = b"0123456789ABCDEF";

/// Percent-encode `input` into `out`.
///
/// Unreserved bytes (`A–Z a–z 0–9 - _ . ~`) pass through; everything
/// else becomes `%XX`.
pub(crate) fn percent_encode_into(input: &[u8], out: &mut String) {
    for &b in input {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                out.push('%');
                out.push(UPPERHEX[(b >> 4) as usize] as char);
                out.push(UPPERHEX[(b & 0x0f) as usize] as char);
            }
        }
    }
}

/// Reverse [`percent_encode_into`]; also accepts `+` for space.
pub(crate) fn percent_decode(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' => {
                let hi = input.get(i + 1).and_then(|b| (*b as char).to_digit(16));
                let lo = input.get(i + 2).and_then(|b| (*b as char).to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(((hi << 4) | lo) as u8);
                        i += 3;
                    }
                    _ => return Err(format!("truncated escape at byte {i}")),
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_preserves_order_and_duplicates() {
        let mut meta = Meta::new();
        meta.append("k", b"1".to_vec());
        meta.append("z", b"2".to_vec());
        meta.append("k", b"3".to_vec());
        assert_eq!(meta.to_query(), "k=1&z=2&k=3");
        assert_eq!(meta.peek("k"), Some(&b"1"[..]));

        let parsed = Meta::parse_query(meta.to_query().as_bytes()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn meta_set_replaces_all_values() {
        let mut meta = Meta::new();
        meta.append("k", b"1".to_vec());
        meta.append("k", b"2".to_vec());
        meta.set("k", b"3".to_vec());
        assert_eq!(meta.to_query(), "k=3");
    }

    #[test]
    fn meta_escapes_reserved_bytes() {
        let mut meta = Meta::new();
        meta.append("a&b", vec![0x00, b'=', 0xff]);
        let q = meta.to_query();
        assert_eq!(q, "a%26b=%00%3D%FF");
        assert_eq!(Meta::parse_query(q.as_bytes()).unwrap(), meta);
    }

    #[test]
    fn reply_inherits_codec_and_seq() {
        let mut call = Message::new_call(7, "/home/test");
        call.body_codec = b'j';
        let reply = Message::new_reply(&call, Status::ok());
        assert_eq!(reply.seq, 7);
        assert_eq!(reply.mtype, MsgType::Reply);
        assert_eq!(reply.body_codec, b'j');
        assert_eq!(reply.service_method, "/home/test");
    }
}
