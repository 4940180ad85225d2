//! The uniform status triple carried on REPLY messages and used as the
//! error value throughout the framework.

use std::error::Error;
use std::fmt;

use crate::message::{percent_decode, percent_encode_into};

/// Well-known status codes.
///
/// Conventional ranges: `0` ok, `1..=199` informational/retriable,
/// `400..=499` caller errors, `500..=599` handler/system errors,
/// `900..=999` transport/protocol errors. Handlers are free to use any
/// other `i32` value.
pub mod code {
    /// Success.
    pub const OK: i32 = 0;
    /// The request body could not be decoded.
    pub const DECODE_ERROR: i32 = 400;
    /// No handler is registered for the service method.
    pub const NOT_FOUND: i32 = 404;
    /// The call deadline expired before a reply arrived.
    pub const TIMEOUT: i32 = 408;
    /// The handler returned a non-ok status.
    pub const HANDLER_ERROR: i32 = 500;
    /// A body could not be encoded with the selected codec.
    pub const ENCODE_ERROR: i32 = 520;
    /// An internal invariant was violated.
    pub const INTERNAL: i32 = 580;
    /// The connection was lost, the peer closed, or a write was refused.
    pub const TRANSPORT_ERROR: i32 = 900;
    /// Malformed envelope, frame over the read limit, unknown codec or
    /// filter ID, or a duplicate reply seq.
    pub const PROTOCOL_ERROR: i32 = 901;
    /// A transfer filter failed to apply or reverse.
    pub const TRANSFER_PIPE_ERROR: i32 = 902;
}

/// A `(code, message, cause)` triple.
///
/// `code == 0` means success; everything else is a failure. The `message`
/// is the stable, user-facing text for the code; `cause` carries the
/// occurrence-specific detail.
///
/// On the wire a status is rendered as a query string:
/// `?code=<int>&msg=<urlenc>&cause=<urlenc>`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Status {
    code: i32,
    message: String,
    cause: String,
}

impl Status {
    /// Create a status from its three parts.
    pub fn new(code: i32, message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: cause.into(),
        }
    }

    /// The success status.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn not_found(service_method: &str) -> Self {
        Self::new(
            code::NOT_FOUND,
            "not found",
            format!("no handler for {service_method:?}"),
        )
    }

    pub fn handler_error(cause: impl Into<String>) -> Self {
        Self::new(code::HANDLER_ERROR, "handler error", cause)
    }

    pub fn decode_error(cause: impl fmt::Display) -> Self {
        Self::new(code::DECODE_ERROR, "decode error", cause.to_string())
    }

    pub fn encode_error(cause: impl fmt::Display) -> Self {
        Self::new(code::ENCODE_ERROR, "encode error", cause.to_string())
    }

    pub fn timeout() -> Self {
        Self::new(code::TIMEOUT, "timeout", "call deadline exceeded")
    }

    pub fn transport_error(cause: impl fmt::Display) -> Self {
        Self::new(code::TRANSPORT_ERROR, "transport error", cause.to_string())
    }

    pub fn protocol_error(cause: impl fmt::Display) -> Self {
        Self::new(code::PROTOCOL_ERROR, "protocol error", cause.to_string())
    }

    pub fn xfer_error(cause: impl fmt::Display) -> Self {
        Self::new(
            code::TRANSFER_PIPE_ERROR,
            "transfer pipe error",
            cause.to_string(),
        )
    }

    pub fn internal(cause: impl fmt::Display) -> Self {
        Self::new(code::INTERNAL, "internal error", cause.to_string())
    }

    /// Whether this status signals success.
    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> &str {
        &self.cause
    }

    /// Render the wire form: `?code=<int>&msg=<urlenc>&cause=<urlenc>`.
    pub fn to_query(&self) -> String {
        let mut out = String::with_capacity(24 + self.message.len() + self.cause.len());
        out.push_str("?code=");
        out.push_str(&self.code.to_string());
        out.push_str("&msg=");
        percent_encode_into(self.message.as_bytes(), &mut out);
        out.push_str("&cause=");
        percent_encode_into(self.cause.as_bytes(), &mut out);
        out
    }

    /// Parse the wire form produced by [`Status::to_query`].
    ///
    /// Unknown keys are ignored; missing keys default to empty. A
    /// malformed `code` value is a protocol error.
    pub fn parse_query(raw: &[u8]) -> Result<Self, Status> {
        let raw = raw.strip_prefix(b"?").unwrap_or(raw);
        let mut status = Status::ok();
        if raw.is_empty() {
            return Ok(status);
        }
        for pair in raw.split(|&b| b == b'&') {
            let mut it = pair.splitn(2, |&b| b == b'=');
            let key = it.next().unwrap_or_default();
            let value = it.next().unwrap_or_default();
            let value = percent_decode(value)
                .map_err(|e| Status::protocol_error(format!("bad status escape: {e}")))?;
            match key {
                b"code" => {
                    let text = std::str::from_utf8(&value)
                        .map_err(|_| Status::protocol_error("status code is not UTF-8"))?;
                    status.code = text
                        .parse()
                        .map_err(|_| Status::protocol_error(format!("bad status code {text:?}")))?;
                }
                b"msg" => status.message = String::from_utf8_lossy(&value).into_owned(),
                b"cause" => status.cause = String::from_utf8_lossy(&value).into_owned(),
                _ => {}
            }
        }
        Ok(status)
    }

    /// Convert a `Result`-position status into `Err` unless it is ok.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cause.is_empty() {
            write!(f, "code={} msg={}", self.code, self.message)
        } else {
            write!(
                f,
                "code={} msg={} cause={}",
                self.code, self.message, self.cause
            )
        }
    }
}

impl Error for Status {}

impl From<std::io::Error> for Status {
    fn from(e: std::io::Error) -> Self {
        Status::transport_error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trip() {
        let st = Status::new(500, "handler error", "boom & bust?");
        let q = st.to_query();
        assert_eq!(q, "?code=500&msg=handler%20error&cause=boom%20%26%20bust%3F");
        assert_eq!(Status::parse_query(q.as_bytes()).unwrap(), st);
    }

    #[test]
    fn empty_query_is_ok() {
        let st = Status::parse_query(b"").unwrap();
        assert!(st.is_ok());
        assert_eq!(st.code(), 0);
    }

    #[test]
    fn bad_code_is_protocol_error() {
        let err = Status::parse_query(b"?code=abc").unwrap_err();
        assert_eq!(err.code(), code::PROTOCOL_ERROR);
    }
}
