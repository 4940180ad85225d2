//! Sessions: one live bidirectional connection between two peers.
//!
//! A session owns a single transport connection and two cooperative
//! loops. Only the read loop touches the receive half and only the
//! write loop touches the send half; everything else talks to them
//! through channels, so wire order equals enqueue order and frame
//! decoding is never blocked by a running handler.
//!
//! A connection supervisor wraps the loops: on unexpected loss of a
//! dialed connection it applies the peer's redial policy and re-enters
//! the ACTIVE state with a fresh connection, failing the previous
//! connection's inflight calls.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};

use colloquy_core::{
    codec, status::code, BodyValue, BoxIoStream, Conn, Message, MsgType, Proto, Status, XferPipe,
};

use crate::context::{CallCtx, PushCtx};
use crate::peer::PeerCore;

const OUT_QUEUE_DEPTH: usize = 256;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Active,
    Closing,
    Closed,
}

/// A cheap snapshot of a session's identity, handed to plugin hooks.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: String,
    pub local_addr: String,
    pub remote_addr: String,
}

/// Per-call options.
///
/// ```
/// use colloquy::CallOptions;
/// use std::time::Duration;
///
/// let opts = CallOptions::new()
///     .with_add_meta("peer_id", "110")
///     .with_context_age(Duration::from_millis(100));
/// ```
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    meta_add: Vec<(String, String)>,
    meta_set: Vec<(String, String)>,
    body_codec: Option<u8>,
    xfer_ids: Vec<u8>,
    context_age: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a metadata entry, keeping existing values for the key.
    pub fn with_add_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta_add.push((key.into(), value.into()));
        self
    }

    /// Replace every metadata value for the key.
    pub fn with_set_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta_set.push((key.into(), value.into()));
        self
    }

    /// Select the body codec for this message.
    pub fn with_body_codec(mut self, id: u8) -> Self {
        self.body_codec = Some(id);
        self
    }

    /// Apply a transfer filter pipe to this message's body.
    pub fn with_xfer_pipe(mut self, ids: &[u8]) -> Self {
        self.xfer_ids.extend_from_slice(ids);
        self
    }

    /// Per-call deadline; combined with the peer's defaults.
    pub fn with_context_age(mut self, age: Duration) -> Self {
        self.context_age = Some(age);
        self
    }
}

pub(crate) enum Role {
    Dial { addr: String },
    Accept,
}

struct Outbound {
    msg: Message,
    done: Option<oneshot::Sender<Result<(), Status>>>,
}

pub(crate) struct SessionInner {
    id: String,
    peer: Weak<PeerCore>,
    role: Role,
    proto: Arc<dyn Proto>,

    local_addr: Mutex<String>,
    remote_addr: Mutex<String>,

    seq_out: AtomicU32,
    seq_in: AtomicU32,
    inflight: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    out_tx: Mutex<Option<mpsc::Sender<Outbound>>>,

    state_tx: watch::Sender<SessionState>,
    close_tx: watch::Sender<bool>,
    close_requested: AtomicBool,

    created_at: Instant,

    // Config snapshot taken at creation.
    session_age: Duration,
    context_age: Duration,
    read_limit: u32,
    redial_times: i32,
    redial_interval: Duration,
    default_codec: u8,
    print_detail: bool,
    count_time: bool,
    slow_threshold: Duration,
}

/// Handle to a live session. Cloning is cheap; all clones refer to the
/// same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(peer: &Arc<PeerCore>, role: Role, proto: Arc<dyn Proto>, id: String) -> Self {
        let config = &peer.config;
        let (state_tx, _) = watch::channel(SessionState::Init);
        let (close_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                id,
                peer: Arc::downgrade(peer),
                role,
                proto,
                local_addr: Mutex::new(String::new()),
                remote_addr: Mutex::new(String::new()),
                seq_out: AtomicU32::new(0),
                seq_in: AtomicU32::new(0),
                inflight: Mutex::new(HashMap::new()),
                out_tx: Mutex::new(None),
                state_tx,
                close_tx,
                close_requested: AtomicBool::new(false),
                created_at: Instant::now(),
                session_age: config.default_session_age,
                context_age: config.default_context_age,
                read_limit: config.read_limit,
                redial_times: config.redial_times,
                redial_interval: config.redial_interval,
                default_codec: peer.default_codec,
                print_detail: config.print_detail,
                count_time: config.count_time,
                slow_threshold: config.slow_comet_duration,
            }),
        }
    }

    pub(crate) fn spawn_supervisor(&self, first: Conn) {
        let session = self.clone();
        tokio::spawn(async move { supervise(session, first).await });
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn local_addr(&self) -> String {
        self.inner.local_addr.lock().clone()
    }

    pub fn remote_addr(&self) -> String {
        self.inner.remote_addr.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.inner.id.clone(),
            local_addr: self.local_addr(),
            remote_addr: self.remote_addr(),
        }
    }

    /// The configured maximum session age, if any.
    pub fn session_age(&self) -> Option<Duration> {
        (!self.inner.session_age.is_zero()).then_some(self.inner.session_age)
    }

    /// The default per-call deadline, if any.
    pub fn context_age(&self) -> Option<Duration> {
        (!self.inner.context_age.is_zero()).then_some(self.inner.context_age)
    }

    /// Number of calls waiting for a reply (diagnostics).
    pub fn pending_calls(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    /// Seq of the most recently received message (diagnostics).
    pub fn received_seq(&self) -> u32 {
        self.inner.seq_in.load(Ordering::Relaxed)
    }

    /// Issue a CALL with typed argument and result.
    pub async fn call<A, R>(&self, service_method: &str, arg: A, opts: CallOptions) -> Result<R, Status>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let arg = serde_json::to_value(arg).map_err(Status::encode_error)?;
        let reply = self.call_value(service_method, arg, opts).await?;
        serde_json::from_value(reply).map_err(Status::decode_error)
    }

    /// Issue a CALL on the dynamic body tree.
    ///
    /// The pending-call handle is installed before the first byte is
    /// written, so a reply can never race the registration. On success
    /// the reply body is codec-decoded; a non-ok reply status is
    /// returned as the error.
    pub async fn call_value(
        &self,
        service_method: &str,
        arg: BodyValue,
        opts: CallOptions,
    ) -> Result<BodyValue, Status> {
        let inner = &self.inner;
        let seq = inner.seq_out.fetch_add(1, Ordering::Relaxed);
        let mut msg = Message::new_call(seq, service_method);
        apply_options(&mut msg, &opts, inner.default_codec)?;
        let codec = codec::get(msg.body_codec).ok_or_else(|| {
            Status::encode_error(format!("unknown body codec {:#04x}", msg.body_codec))
        })?;
        msg.body = codec.marshal(&arg)?.into();

        let deadline = self.effective_deadline(opts.context_age);

        let (tx, rx) = oneshot::channel();
        inner.inflight.lock().insert(seq, tx);
        let mut guard = InflightGuard {
            inner: inner.as_ref(),
            seq,
            armed: true,
        };

        self.enqueue(msg).await?;

        let reply = match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => return Err(Status::timeout()),
            },
            None => rx.await,
        };
        guard.disarm();
        let reply = reply.map_err(|_| Status::transport_error("session closed"))?;
        reply.status.clone().into_result()?;

        let codec = match codec::get(reply.body_codec) {
            Some(codec) => codec,
            None => {
                let status = Status::protocol_error(format!(
                    "reply carries unknown body codec {:#04x}",
                    reply.body_codec
                ));
                self.shutdown(&status);
                return Err(status);
            }
        };
        codec.unmarshal(&reply.body)
    }

    /// Send a fire-and-forget PUSH.
    pub async fn push<A: Serialize>(
        &self,
        service_method: &str,
        arg: A,
        opts: CallOptions,
    ) -> Result<(), Status> {
        let arg = serde_json::to_value(arg).map_err(Status::encode_error)?;
        let inner = &self.inner;
        let seq = inner.seq_out.fetch_add(1, Ordering::Relaxed);
        let mut msg = Message::new_push(seq, service_method);
        apply_options(&mut msg, &opts, inner.default_codec)?;
        let codec = codec::get(msg.body_codec).ok_or_else(|| {
            Status::encode_error(format!("unknown body codec {:#04x}", msg.body_codec))
        })?;
        msg.body = codec.marshal(&arg)?.into();
        self.enqueue(msg).await
    }

    /// Gracefully close the session and wait for it to reach CLOSED.
    ///
    /// Queued writes are drained; inflight calls fail with a transport
    /// error. Idempotent.
    pub async fn close(&self) {
        self.inner.close_requested.store(true, Ordering::Release);
        let _ = self.inner.close_tx.send(true);
        self.closed().await;
    }

    /// Wait until the session reaches its terminal state.
    pub async fn closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Fatal teardown initiated from the inside (protocol violations).
    pub(crate) fn shutdown(&self, cause: &Status) {
        tracing::error!(session_id = %self.inner.id, %cause, "fatal session error");
        self.inner.close_requested.store(true, Ordering::Release);
        let _ = self.inner.close_tx.send(true);
    }

    fn effective_deadline(&self, per_call: Option<Duration>) -> Option<Duration> {
        let inner = &self.inner;
        let mut deadline = per_call;
        if !inner.context_age.is_zero() {
            deadline = Some(match deadline {
                Some(d) => d.min(inner.context_age),
                None => inner.context_age,
            });
        }
        if !inner.session_age.is_zero() {
            let remaining = inner.session_age.saturating_sub(inner.created_at.elapsed());
            deadline = Some(match deadline {
                Some(d) => d.min(remaining),
                None => remaining,
            });
        }
        deadline
    }

    /// Hand a message to the write loop and wait for the write outcome.
    pub(crate) async fn enqueue(&self, msg: Message) -> Result<(), Status> {
        let tx = {
            let guard = self.inner.out_tx.lock();
            guard.clone()
        };
        let tx = tx.ok_or_else(|| Status::transport_error("session closed"))?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Outbound {
            msg,
            done: Some(done_tx),
        })
        .await
        .map_err(|_| Status::transport_error("session closed"))?;
        done_rx
            .await
            .map_err(|_| Status::transport_error("session closed"))?
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn apply_options(msg: &mut Message, opts: &CallOptions, default_codec: u8) -> Result<(), Status> {
    for (k, v) in &opts.meta_add {
        msg.meta.append(k.clone(), v.as_bytes().to_vec());
    }
    for (k, v) in &opts.meta_set {
        msg.meta.set(k, v.as_bytes().to_vec());
    }
    msg.body_codec = opts.body_codec.unwrap_or(default_codec);
    if !opts.xfer_ids.is_empty() {
        msg.xfer_pipe = XferPipe::from_ids(&opts.xfer_ids)?;
    }
    Ok(())
}

struct InflightGuard<'a> {
    inner: &'a SessionInner,
    seq: u32,
    armed: bool,
}

impl InflightGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.inflight.lock().remove(&self.seq).is_some() {
            tracing::debug!(
                session_id = %self.inner.id,
                seq = self.seq,
                "removed pending call handle"
            );
        }
    }
}

// ============================================================================
// Connection supervisor
// ============================================================================

async fn supervise(session: Session, first: Conn) {
    let inner = Arc::clone(&session.inner);
    let mut conn = first;
    let cause = loop {
        let cause = run_conn(&session, conn).await;
        drain_inflight(&inner);

        let redialable = matches!(inner.role, Role::Dial { .. })
            && !inner.close_requested.load(Ordering::Acquire)
            && cause.code() == code::TRANSPORT_ERROR
            && inner.redial_times != 0;
        if !redialable {
            break cause;
        }
        tracing::warn!(session_id = %inner.id, %cause, "connection lost; redialing");
        match redial(&inner).await {
            Some(fresh) => conn = fresh,
            None => break cause,
        }
    };

    if let Some(peer) = inner.peer.upgrade() {
        peer.remove_session(&inner.id);
        peer.plugins.post_disconnect(&session.info());
    }
    let _ = inner.state_tx.send(SessionState::Closed);
    if cause.is_ok() {
        tracing::info!(session_id = %inner.id, "session closed");
    } else {
        tracing::info!(session_id = %inner.id, %cause, "session closed");
    }
}

/// One redial round: sleep, dial, repeat within the budget.
async fn redial(inner: &Arc<SessionInner>) -> Option<Conn> {
    let Role::Dial { addr } = &inner.role else {
        return None;
    };
    let mut close_rx = inner.close_tx.subscribe();
    let mut remaining = inner.redial_times;
    loop {
        if remaining == 0 {
            return None;
        }
        if remaining > 0 {
            remaining -= 1;
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.redial_interval) => {}
            _ = close_rx.wait_for(|closed| *closed) => return None,
        }
        if inner.close_requested.load(Ordering::Acquire) {
            return None;
        }
        let peer = inner.peer.upgrade()?;
        match peer.transport.dial(addr, &peer.dial_opts()).await {
            Ok(conn) => {
                let status = peer.plugins.post_dial(&SessionInfo {
                    id: inner.id.clone(),
                    local_addr: conn.local_addr.clone(),
                    remote_addr: conn.remote_addr.clone(),
                });
                if status.is_ok() {
                    tracing::info!(session_id = %inner.id, addr, "redialed");
                    return Some(conn);
                }
                tracing::warn!(session_id = %inner.id, %status, "post_dial rejected redial");
            }
            Err(status) => {
                tracing::debug!(session_id = %inner.id, %status, "redial attempt failed");
            }
        }
    }
}

/// Drive one connection until it dies or the session is closed.
/// Returns the close cause; ok means a local graceful close.
async fn run_conn(session: &Session, conn: Conn) -> Status {
    let inner = &session.inner;
    *inner.local_addr.lock() = conn.local_addr;
    *inner.remote_addr.lock() = conn.remote_addr;

    let (reader, writer) = tokio::io::split(conn.stream);
    let (tx, rx) = mpsc::channel(OUT_QUEUE_DEPTH);
    *inner.out_tx.lock() = Some(tx);
    let _ = inner.state_tx.send(SessionState::Active);

    let mut write_task = tokio::spawn(write_loop(session.clone(), writer, rx));
    let mut close_rx = inner.close_tx.subscribe();

    let session_age = async {
        if inner.session_age.is_zero() {
            futures::future::pending::<()>().await;
        } else {
            let remaining = inner.session_age.saturating_sub(inner.created_at.elapsed());
            tokio::time::sleep(remaining).await;
        }
    };

    let cause = tokio::select! {
        status = read_loop(session, reader) => status,
        joined = &mut write_task => match joined {
            Ok(status) => status,
            Err(e) => Status::internal(format!("write loop panicked: {e}")),
        },
        _ = close_rx.wait_for(|closed| *closed) => Status::ok(),
        _ = session_age => {
            inner.close_requested.store(true, Ordering::Release);
            Status::transport_error("session age expired")
        }
    };

    // Stop accepting writes; the write loop drains what is queued.
    let _ = inner.state_tx.send(SessionState::Closing);
    drop(inner.out_tx.lock().take());
    if !write_task.is_finished() {
        if cause.is_ok() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut write_task)
                .await
                .is_err()
            {
                write_task.abort();
            }
        } else {
            write_task.abort();
        }
    }

    cause
}

fn drain_inflight(inner: &SessionInner) {
    let drained: Vec<_> = inner.inflight.lock().drain().collect();
    if !drained.is_empty() {
        tracing::debug!(
            session_id = %inner.id,
            count = drained.len(),
            "failing inflight calls after disconnect"
        );
    }
    // Dropping the senders resolves every waiting caller with a
    // transport error.
}

// ============================================================================
// Read loop
// ============================================================================

async fn read_loop(session: &Session, mut reader: ReadHalf<BoxIoStream>) -> Status {
    let inner = &session.inner;
    let Some(peer) = inner.peer.upgrade() else {
        return Status::transport_error("peer dropped");
    };

    loop {
        let status = peer.plugins.pre_read_header(&session.info());
        if !status.is_ok() {
            return status;
        }

        let mut msg = match inner.proto.unpack(&mut reader, inner.read_limit).await {
            Ok(msg) => msg,
            Err(status) => return status,
        };
        inner.seq_in.store(msg.seq, Ordering::Relaxed);
        if inner.print_detail {
            tracing::debug!(session_id = %inner.id, msg = %format_args!("{msg:#}"), "received");
        } else {
            tracing::trace!(session_id = %inner.id, %msg, "received");
        }

        match msg.mtype {
            MsgType::Reply => deliver_reply(session, &peer, msg),
            MsgType::Call => {
                let status = peer.plugins.post_read_call_header(&mut msg);
                if !status.is_ok() {
                    // The hook's status replaces the handler outcome.
                    let reply = Message::new_reply(&msg, status);
                    let session = session.clone();
                    tokio::spawn(async move {
                        let _ = session.enqueue(reply).await;
                    });
                    continue;
                }
                let permit = match peer.pool.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Status::internal("handler pool closed"),
                };
                let session = session.clone();
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatch_call(session, peer, msg).await;
                });
            }
            MsgType::Push => {
                let status = peer.plugins.post_read_push_header(&mut msg);
                if !status.is_ok() {
                    tracing::debug!(session_id = %inner.id, %status, "PUSH rejected by plugin");
                    continue;
                }
                let permit = match peer.pool.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Status::internal("handler pool closed"),
                };
                let session = session.clone();
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatch_push(session, peer, msg).await;
                });
            }
        }
    }
}

/// Correlate a REPLY to its pending call. A reply whose seq has no
/// pending entry (late, duplicate, or never issued) is discarded.
fn deliver_reply(session: &Session, peer: &Arc<PeerCore>, mut msg: Message) {
    let mut status = peer.plugins.post_read_reply_header(&mut msg);
    if status.is_ok() {
        status = peer.plugins.post_read_reply_body(&msg);
    }
    if !status.is_ok() {
        msg.status = status;
    }

    let waiter = session.inner.inflight.lock().remove(&msg.seq);
    match waiter {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => {
            tracing::debug!(
                session_id = %session.inner.id,
                seq = msg.seq,
                "discarding reply with no pending call"
            );
        }
    }
}

// ============================================================================
// Handler dispatch
// ============================================================================

async fn dispatch_call(session: Session, peer: Arc<PeerCore>, msg: Message) {
    let started = Instant::now();
    let service_method = msg.service_method.clone();
    let Some(reply) = build_reply(&session, &peer, msg).await else {
        return;
    };
    let reply_status = reply.status.clone();
    if let Err(status) = session.enqueue(reply).await {
        tracing::warn!(
            session_id = %session.inner.id,
            service_method,
            %status,
            "failed to send reply"
        );
        return;
    }

    let cost = started.elapsed();
    if session.inner.count_time {
        tracing::debug!(
            session_id = %session.inner.id,
            service_method,
            status = %reply_status,
            ?cost,
            "handled CALL"
        );
    }
    if !session.inner.slow_threshold.is_zero() && cost > session.inner.slow_threshold {
        tracing::warn!(
            session_id = %session.inner.id,
            service_method,
            ?cost,
            "slow CALL handler"
        );
    }
}

/// Run the routed handler and build the paired reply.
///
/// Returns `None` when the session was shut down instead (unknown
/// envelope-level codec).
async fn build_reply(session: &Session, peer: &Arc<PeerCore>, msg: Message) -> Option<Message> {
    let Some(handler) = peer.router.lookup_call(&msg.service_method) else {
        return Some(Message::new_reply(&msg, Status::not_found(&msg.service_method)));
    };

    let Some(codec) = codec::get(msg.body_codec) else {
        let status =
            Status::protocol_error(format!("unknown body codec {:#04x}", msg.body_codec));
        session.shutdown(&status);
        return None;
    };
    let body = match codec.unmarshal(&msg.body) {
        Ok(body) => body,
        Err(status) => return Some(Message::new_reply(&msg, status)),
    };
    let status = peer.plugins.post_read_call_body(&msg);
    if !status.is_ok() {
        return Some(Message::new_reply(&msg, status));
    }

    let msg = Arc::new(msg);
    let reply_codec = Arc::new(AtomicU8::new(colloquy_core::CODEC_NONE));
    let ctx = CallCtx::new(session.clone(), Arc::clone(&msg), Arc::clone(&reply_codec));

    let outcome = AssertUnwindSafe(handler(ctx, body)).catch_unwind().await;
    let (value, status) = match outcome {
        Ok(pair) => pair,
        Err(panic) => (None, Status::handler_error(panic_message(&panic))),
    };

    let mut reply = Message::new_reply(&msg, status);
    match reply_codec.load(Ordering::Relaxed) {
        colloquy_core::CODEC_NONE => {}
        id => reply.body_codec = id,
    }
    if let Some(value) = value {
        match codec::get(reply.body_codec) {
            Some(codec) => match codec.marshal(&value) {
                Ok(bytes) => reply.body = bytes.into(),
                Err(status) => reply.status = status,
            },
            None => {
                reply.status = Status::encode_error(format!(
                    "unknown reply body codec {:#04x}",
                    reply.body_codec
                ));
            }
        }
    }
    Some(reply)
}

async fn dispatch_push(session: Session, peer: Arc<PeerCore>, msg: Message) {
    let started = Instant::now();
    let Some(handler) = peer.router.lookup_push(&msg.service_method) else {
        tracing::warn!(
            session_id = %session.inner.id,
            service_method = msg.service_method,
            "dropping PUSH with no handler"
        );
        return;
    };

    let Some(codec) = codec::get(msg.body_codec) else {
        let status =
            Status::protocol_error(format!("unknown body codec {:#04x}", msg.body_codec));
        session.shutdown(&status);
        return;
    };
    let body = match codec.unmarshal(&msg.body) {
        Ok(body) => body,
        Err(status) => {
            tracing::warn!(session_id = %session.inner.id, %status, "undecodable PUSH body");
            return;
        }
    };
    let status = peer.plugins.post_read_push_body(&msg);
    if !status.is_ok() {
        tracing::debug!(session_id = %session.inner.id, %status, "PUSH body rejected by plugin");
        return;
    }

    let service_method = msg.service_method.clone();
    let ctx = PushCtx::new(session.clone(), Arc::new(msg));
    let outcome = AssertUnwindSafe(handler(ctx, body)).catch_unwind().await;
    let status = match outcome {
        Ok(status) => status,
        Err(panic) => Status::handler_error(panic_message(&panic)),
    };
    if !status.is_ok() {
        tracing::warn!(
            session_id = %session.inner.id,
            service_method,
            %status,
            "PUSH handler failed"
        );
    }

    let cost = started.elapsed();
    if session.inner.count_time {
        tracing::debug!(session_id = %session.inner.id, service_method, ?cost, "handled PUSH");
    }
    if !session.inner.slow_threshold.is_zero() && cost > session.inner.slow_threshold {
        tracing::warn!(session_id = %session.inner.id, service_method, ?cost, "slow PUSH handler");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_owned()
    }
}

// ============================================================================
// Write loop
// ============================================================================

/// The only task that touches the send half. Messages leave the wire in
/// queue order; the queue closing means the connection is being torn
/// down and the loop drains what is left.
async fn write_loop(
    session: Session,
    mut writer: WriteHalf<BoxIoStream>,
    mut rx: mpsc::Receiver<Outbound>,
) -> Status {
    let inner = &session.inner;
    let peer = inner.peer.upgrade();

    while let Some(Outbound { mut msg, done }) = rx.recv().await {
        if let Some(peer) = &peer {
            let status = match msg.mtype {
                MsgType::Call => peer.plugins.pre_write_call(&msg),
                MsgType::Reply => peer.plugins.pre_write_reply(&msg),
                MsgType::Push => peer.plugins.pre_write_push(&msg),
            };
            if !status.is_ok() {
                if let Some(done) = done {
                    let _ = done.send(Err(status));
                }
                continue;
            }
        }

        match inner.proto.pack(&mut writer, &mut msg).await {
            Ok(()) => {
                if inner.print_detail {
                    tracing::debug!(session_id = %inner.id, msg = %format_args!("{msg:#}"), "sent");
                } else {
                    tracing::trace!(session_id = %inner.id, %msg, "sent");
                }
                let status = match &peer {
                    Some(peer) => match msg.mtype {
                        MsgType::Call => peer.plugins.post_write_call(&msg),
                        MsgType::Reply => peer.plugins.post_write_reply(&msg),
                        MsgType::Push => peer.plugins.post_write_push(&msg),
                    },
                    None => Status::ok(),
                };
                if let Some(done) = done {
                    let _ = done.send(status.into_result());
                }
            }
            Err(status) => {
                let fatal = status.code() == code::TRANSPORT_ERROR;
                if let Some(done) = done {
                    let _ = done.send(Err(status.clone()));
                }
                if fatal {
                    return status;
                }
                // Encode and pipe failures poison only this message.
            }
        }
    }
    Status::ok()
}
