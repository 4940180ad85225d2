//! Protocols bind a [`Message`] to a byte stream.
//!
//! Both shipped protocols are length-prefixed with a big-endian `u32`
//! frame size so they can be delimited on any reliable byte stream:
//!
//! - [`RawProto`] (default): a compact binary envelope with a stable
//!   field layout.
//! - [`JsonProto`]: the same field set as one JSON object, for peers
//!   that favor debuggability over density.
//!
//! The transfer pipe is applied here: `pack` transforms the body before
//! emit and `unpack` reverses it, so [`Message::body`] always holds
//! directly codec-decodable bytes in memory.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, MsgType};
use crate::status::Status;
use crate::xfer::XferPipe;

/// Default upper bound on one frame's wire size: 1 GiB.
pub const DEFAULT_READ_LIMIT: u32 = 1024 * 1024 * 1024;

/// Reader half handed to a protocol.
pub type ProtoReader<'a> = dyn AsyncRead + Send + Unpin + 'a;
/// Writer half handed to a protocol.
pub type ProtoWriter<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// A message protocol: encoder/decoder between [`Message`] and a byte
/// stream.
///
/// Implementations must be stateless per call (`&self`): the session
/// layer shares one instance between its read and write loops.
#[async_trait]
pub trait Proto: Send + Sync {
    /// The protocol's 1-byte ID and name.
    fn version(&self) -> (u8, &'static str);

    /// Encode `m` onto `w`, applying the transfer pipe to the body.
    ///
    /// Updates `m.size` with the frame size after the length prefix.
    async fn pack(&self, w: &mut ProtoWriter<'_>, m: &mut Message) -> Result<(), Status>;

    /// Decode one message from `r`, reversing the transfer pipe.
    ///
    /// Frames larger than `read_limit` are a protocol error; any parse
    /// failure is fatal to the connection.
    async fn unpack(&self, r: &mut ProtoReader<'_>, read_limit: u32) -> Result<Message, Status>;
}

/// Factory for protocol instances, selectable per peer or per dial.
pub type ProtoFunc = Arc<dyn Fn() -> Arc<dyn Proto> + Send + Sync>;

/// Factory for the default ([`RawProto`]) protocol.
pub fn default_proto_func() -> ProtoFunc {
    raw_proto_func()
}

/// Factory for [`RawProto`].
pub fn raw_proto_func() -> ProtoFunc {
    Arc::new(|| Arc::new(RawProto))
}

/// Factory for [`JsonProto`].
pub fn json_proto_func() -> ProtoFunc {
    Arc::new(|| Arc::new(JsonProto))
}

async fn read_frame(r: &mut ProtoReader<'_>, read_limit: u32) -> Result<Vec<u8>, Status> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Status::transport_error("connection closed")
        } else {
            Status::transport_error(e)
        }
    })?;
    let size = u32::from_be_bytes(len_buf);
    if size > read_limit {
        return Err(Status::protocol_error(format!(
            "frame size {size} exceeds read limit {read_limit}"
        )));
    }
    let mut frame = vec![0u8; size as usize];
    r.read_exact(&mut frame)
        .await
        .map_err(|e| Status::protocol_error(format!("short frame: {e}")))?;
    Ok(frame)
}

async fn write_frame(w: &mut ProtoWriter<'_>, frame: &[u8]) -> Result<(), Status> {
    w.write_all(&(frame.len() as u32).to_be_bytes())
        .await
        .map_err(Status::transport_error)?;
    w.write_all(frame).await.map_err(Status::transport_error)?;
    w.flush().await.map_err(Status::transport_error)?;
    Ok(())
}

/// Cursor over a received frame; every short read is a protocol error.
struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Status> {
        if self.buf.len() < n {
            return Err(Status::protocol_error(format!(
                "frame truncated: wanted {n} bytes, {} left",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, Status> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, Status> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_len_prefixed(&mut self) -> Result<&'a [u8], Status> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

/// The default binary protocol.
///
/// Frame layout after the `u32` size prefix, big-endian throughout:
///
/// ```text
/// u8 pipe_len, pipe_len filter IDs
/// u32 seq
/// u8 mtype
/// u32 len + service_method (UTF-8)
/// mtype == REPLY only: u32 len + status query string
/// u32 len + meta query string
/// u8 body_codec
/// body … (to end of frame)
/// ```
pub struct RawProto;

#[async_trait]
impl Proto for RawProto {
    fn version(&self) -> (u8, &'static str) {
        (b'r', "raw")
    }

    async fn pack(&self, w: &mut ProtoWriter<'_>, m: &mut Message) -> Result<(), Status> {
        let body = m.xfer_pipe.on_pack(&m.body)?;

        let sm = m.service_method.as_bytes();
        let mut frame = Vec::with_capacity(32 + sm.len() + body.len());
        frame.push(m.xfer_pipe.len() as u8);
        frame.extend_from_slice(m.xfer_pipe.ids());
        frame.extend_from_slice(&m.seq.to_be_bytes());
        frame.push(m.mtype as u8);
        frame.extend_from_slice(&(sm.len() as u32).to_be_bytes());
        frame.extend_from_slice(sm);
        if m.mtype == MsgType::Reply {
            let status = m.status.to_query();
            frame.extend_from_slice(&(status.len() as u32).to_be_bytes());
            frame.extend_from_slice(status.as_bytes());
        }
        let meta = m.meta.to_query();
        frame.extend_from_slice(&(meta.len() as u32).to_be_bytes());
        frame.extend_from_slice(meta.as_bytes());
        frame.push(m.body_codec);
        frame.extend_from_slice(&body);

        m.size = frame.len() as u32;
        write_frame(w, &frame).await
    }

    async fn unpack(&self, r: &mut ProtoReader<'_>, read_limit: u32) -> Result<Message, Status> {
        let frame = read_frame(r, read_limit).await?;
        let size = frame.len() as u32;
        let mut fr = FrameReader::new(&frame);

        let pipe_len = fr.take_u8()? as usize;
        let pipe = XferPipe::from_wire(fr.take(pipe_len)?);
        let seq = fr.take_u32()?;
        let mtype_raw = fr.take_u8()?;
        let mtype = MsgType::from_u8(mtype_raw)
            .ok_or_else(|| Status::protocol_error(format!("unknown message type {mtype_raw}")))?;
        let service_method = std::str::from_utf8(fr.take_len_prefixed()?)
            .map_err(|_| Status::protocol_error("service method is not UTF-8"))?
            .to_owned();
        let status = if mtype == MsgType::Reply {
            Status::parse_query(fr.take_len_prefixed()?)?
        } else {
            Status::ok()
        };
        let meta = crate::message::Meta::parse_query(fr.take_len_prefixed()?)?;
        let body_codec = fr.take_u8()?;
        let body = pipe.on_unpack(fr.rest())?;

        Ok(Message {
            seq,
            mtype,
            service_method,
            status,
            meta,
            body_codec,
            xfer_pipe: pipe,
            body: Bytes::from(body),
            size,
        })
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Serialize, Deserialize)]
struct JsonFrame {
    seq: u32,
    mtype: u8,
    service_method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    meta: String,
    body_codec: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    xfer_pipe: Vec<u8>,
    #[serde(default)]
    body: String,
    #[serde(default, skip_serializing_if = "is_false")]
    body_b64: bool,
}

/// The JSON protocol: one length-prefixed JSON object per frame.
///
/// Status and meta ride in their query-string forms; the (transformed)
/// body rides verbatim when it is valid UTF-8 and base64-encoded
/// otherwise (`body_b64: true`).
pub struct JsonProto;

#[async_trait]
impl Proto for JsonProto {
    fn version(&self) -> (u8, &'static str) {
        (b'j', "json")
    }

    async fn pack(&self, w: &mut ProtoWriter<'_>, m: &mut Message) -> Result<(), Status> {
        use base64::Engine as _;

        let body = m.xfer_pipe.on_pack(&m.body)?;
        let (body, body_b64) = match String::from_utf8(body) {
            Ok(text) => (text, false),
            Err(e) => (
                base64::engine::general_purpose::STANDARD.encode(e.as_bytes()),
                true,
            ),
        };
        let frame = JsonFrame {
            seq: m.seq,
            mtype: m.mtype as u8,
            service_method: m.service_method.clone(),
            status: if m.mtype == MsgType::Reply {
                m.status.to_query()
            } else {
                String::new()
            },
            meta: m.meta.to_query(),
            body_codec: m.body_codec,
            xfer_pipe: m.xfer_pipe.ids().to_vec(),
            body,
            body_b64,
        };
        let frame = serde_json::to_vec(&frame).map_err(Status::encode_error)?;
        m.size = frame.len() as u32;
        write_frame(w, &frame).await
    }

    async fn unpack(&self, r: &mut ProtoReader<'_>, read_limit: u32) -> Result<Message, Status> {
        use base64::Engine as _;

        let raw = read_frame(r, read_limit).await?;
        let size = raw.len() as u32;
        let frame: JsonFrame = serde_json::from_slice(&raw)
            .map_err(|e| Status::protocol_error(format!("malformed JSON frame: {e}")))?;

        let mtype = MsgType::from_u8(frame.mtype)
            .ok_or_else(|| Status::protocol_error(format!("unknown message type {}", frame.mtype)))?;
        let status = if mtype == MsgType::Reply {
            Status::parse_query(frame.status.as_bytes())?
        } else {
            Status::ok()
        };
        let body = if frame.body_b64 {
            base64::engine::general_purpose::STANDARD
                .decode(frame.body.as_bytes())
                .map_err(|e| Status::protocol_error(format!("bad body base64: {e}")))?
        } else {
            frame.body.into_bytes()
        };
        let pipe = XferPipe::from_wire(&frame.xfer_pipe);
        let body = pipe.on_unpack(&body)?;

        Ok(Message {
            seq: frame.seq,
            mtype,
            service_method: frame.service_method,
            status,
            meta: crate::message::Meta::parse_query(frame.meta.as_bytes())?,
            body_codec: frame.body_codec,
            xfer_pipe: pipe,
            body: Bytes::from(body),
            size,
        })
    }
}
