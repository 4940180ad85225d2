//! Body codecs and the process-wide codec registry.
//!
//! A codec converts a dynamic body value tree ([`BodyValue`]) to bytes
//! and back. Typed call sites convert their concrete types through the
//! tree with `serde_json::to_value` / `from_value`, so any
//! serde-serializable type can ride any codec.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Once;

use parking_lot::RwLock;

use crate::status::Status;

/// The dynamic body representation: a tagged JSON-like value tree.
pub type BodyValue = serde_json::Value;

/// Codec ID for JSON bodies.
pub const JSON: u8 = b'j';
/// Codec ID for plain UTF-8 text bodies.
pub const PLAIN: u8 = b's';
/// Codec ID reserved for Protobuf; no implementation ships.
pub const PROTOBUF: u8 = b'p';
/// Codec ID reserved for Thrift; no implementation ships.
pub const THRIFT: u8 = b't';

/// A body codec: a (marshal, unmarshal) pair registered under a 1-byte ID.
pub trait Codec: Send + Sync {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    fn marshal(&self, body: &BodyValue) -> Result<Vec<u8>, Status>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<BodyValue, Status>;
}

static CODECS: RwLock<BTreeMap<u8, Arc<dyn Codec>>> = RwLock::new(BTreeMap::new());
static DEFAULTS: Once = Once::new();

fn ensure_defaults() {
    DEFAULTS.call_once(|| {
        let mut codecs = CODECS.write();
        codecs
            .entry(JSON)
            .or_insert_with(|| Arc::new(JsonCodec) as Arc<dyn Codec>);
        codecs
            .entry(PLAIN)
            .or_insert_with(|| Arc::new(PlainCodec) as Arc<dyn Codec>);
    });
}

/// Register a codec process-wide.
///
/// Idempotent by ID: re-registering the same (id, name) succeeds, while
/// claiming an ID held by a different codec fails.
pub fn register(codec: Arc<dyn Codec>) -> Result<(), Status> {
    ensure_defaults();
    let mut codecs = CODECS.write();
    match codecs.get(&codec.id()) {
        Some(existing) if existing.name() == codec.name() => Ok(()),
        Some(existing) => Err(Status::internal(format!(
            "codec id {:#04x} already registered as {:?}",
            codec.id(),
            existing.name()
        ))),
        None => {
            codecs.insert(codec.id(), codec);
            Ok(())
        }
    }
}

/// Look up a codec by ID.
pub fn get(id: u8) -> Option<Arc<dyn Codec>> {
    ensure_defaults();
    CODECS.read().get(&id).cloned()
}

/// Look up a codec by registered name.
pub fn get_by_name(name: &str) -> Option<Arc<dyn Codec>> {
    ensure_defaults();
    CODECS.read().values().find(|c| c.name() == name).cloned()
}

/// JSON codec (`b'j'`).
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn id(&self) -> u8 {
        JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, body: &BodyValue) -> Result<Vec<u8>, Status> {
        serde_json::to_vec(body).map_err(Status::encode_error)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<BodyValue, Status> {
        if bytes.is_empty() {
            return Ok(BodyValue::Null);
        }
        serde_json::from_slice(bytes).map_err(Status::decode_error)
    }
}

/// Plain-text codec (`b's'`): the body value must be a string (or null),
/// carried as raw UTF-8.
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn id(&self) -> u8 {
        PLAIN
    }

    fn name(&self) -> &'static str {
        "plain"
    }

    fn marshal(&self, body: &BodyValue) -> Result<Vec<u8>, Status> {
        match body {
            BodyValue::Null => Ok(Vec::new()),
            BodyValue::String(s) => Ok(s.clone().into_bytes()),
            other => Err(Status::encode_error(format!(
                "plain codec cannot carry a {} value",
                json_kind(other)
            ))),
        }
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<BodyValue, Status> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Status::decode_error(format!("plain body is not UTF-8: {e}")))?;
        Ok(BodyValue::String(text.to_owned()))
    }
}

fn json_kind(value: &BodyValue) -> &'static str {
    match value {
        BodyValue::Null => "null",
        BodyValue::Bool(_) => "bool",
        BodyValue::Number(_) => "number",
        BodyValue::String(_) => "string",
        BodyValue::Array(_) => "array",
        BodyValue::Object(_) => "object",
    }
}
