//! Handler contexts: the view of the session and the current message
//! that CALL and PUSH handlers receive.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;

use colloquy_core::{Message, Meta, Status};

use crate::session::{CallOptions, Session};

fn host_of(addr: &str) -> String {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_owned(),
        _ => addr.to_owned(),
    }
}

/// Context handed to a CALL handler.
pub struct CallCtx {
    session: Session,
    msg: Arc<Message>,
    reply_codec: Arc<AtomicU8>,
}

impl CallCtx {
    pub(crate) fn new(session: Session, msg: Arc<Message>, reply_codec: Arc<AtomicU8>) -> Self {
        Self {
            session,
            msg,
            reply_codec,
        }
    }

    /// The session this call arrived on; usable to push back to the
    /// remote peer or to issue calls of its own.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn seq(&self) -> u32 {
        self.msg.seq
    }

    pub fn service_method(&self) -> &str {
        &self.msg.service_method
    }

    pub fn meta(&self) -> &Meta {
        &self.msg.meta
    }

    /// First metadata value for `key`.
    pub fn peek_meta(&self, key: &str) -> Option<&[u8]> {
        self.msg.meta.peek(key)
    }

    pub fn peek_meta_str(&self, key: &str) -> Option<&str> {
        self.msg.meta.peek_str(key)
    }

    /// The codec ID the request body arrived with.
    pub fn body_codec(&self) -> u8 {
        self.msg.body_codec
    }

    /// The remote peer's host.
    pub fn ip(&self) -> String {
        host_of(&self.session.remote_addr())
    }

    /// Override the reply's body codec; by default the reply inherits
    /// the request's codec.
    pub fn set_reply_codec(&self, id: u8) {
        self.reply_codec.store(id, Ordering::Relaxed);
    }

    /// Push a notification back over this session.
    pub async fn push<T: Serialize>(&self, service_method: &str, arg: T) -> Result<(), Status> {
        self.session
            .push(service_method, arg, CallOptions::new())
            .await
    }
}

/// Context handed to a PUSH handler.
pub struct PushCtx {
    session: Session,
    msg: Arc<Message>,
}

impl PushCtx {
    pub(crate) fn new(session: Session, msg: Arc<Message>) -> Self {
        Self { session, msg }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn seq(&self) -> u32 {
        self.msg.seq
    }

    pub fn service_method(&self) -> &str {
        &self.msg.service_method
    }

    pub fn meta(&self) -> &Meta {
        &self.msg.meta
    }

    pub fn peek_meta(&self, key: &str) -> Option<&[u8]> {
        self.msg.meta.peek(key)
    }

    pub fn peek_meta_str(&self, key: &str) -> Option<&str> {
        self.msg.meta.peek_str(key)
    }

    pub fn ip(&self) -> String {
        host_of(&self.session.remote_addr())
    }
}
