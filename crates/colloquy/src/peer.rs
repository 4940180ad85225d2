//! The peer: factory and owner of sessions.
//!
//! A peer can dial out and listen at the same time; every connection
//! becomes a [`Session`] sharing the peer's router, plugins and
//! configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};

use colloquy_core::{codec, transport, DialOpts, ProtoFunc, Status, Transport};

use crate::config::PeerConfig;
use crate::context::{CallCtx, PushCtx};
use crate::plugin::{Plugin, PluginContainer};
use crate::router::{
    call_handler, push_handler, RouteKind, RouteRecord, Router, ServiceMethodMapper,
};
use crate::session::{Role, Session, SessionInfo};

pub(crate) struct PeerCore {
    pub(crate) config: PeerConfig,
    pub(crate) router: Router,
    pub(crate) plugins: PluginContainer,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) proto_func: ProtoFunc,
    pub(crate) default_codec: u8,
    pub(crate) pool: Arc<Semaphore>,

    sessions: Mutex<HashMap<String, Session>>,
    session_seq: AtomicU64,
    listen_addr: Mutex<Option<String>>,
    closing: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl PeerCore {
    pub(crate) fn dial_opts(&self) -> DialOpts {
        DialOpts {
            local_addr: self.config.dial_local_addr(),
            timeout: self.config.dial_deadline(),
        }
    }

    pub(crate) fn remove_session(&self, id: &str) {
        self.sessions.lock().remove(id);
    }

    fn next_session_id(&self, remote_addr: &str) -> String {
        let n = self.session_seq.fetch_add(1, Ordering::Relaxed);
        format!("{remote_addr}#{n}")
    }
}

/// A symmetric RPC endpoint.
///
/// ```no_run
/// use colloquy::{Peer, PeerConfig, CallOptions, Status};
/// use serde_json::{json, Value};
///
/// # async fn demo() -> Result<(), Status> {
/// let peer = Peer::new(PeerConfig::default())?;
/// peer.route_call("Home", "Test", |_ctx, arg: Value| async move {
///     Ok::<_, Status>(json!({ "echo": arg }))
/// })?;
///
/// let session = peer.dial("127.0.0.1:9090").await?;
/// let result: Value = session
///     .call("/home/test", json!({"author": "andeya"}), CallOptions::new())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Peer {
    core: Arc<PeerCore>,
}

impl Peer {
    /// Build a peer from its configuration with no plugins.
    pub fn new(config: PeerConfig) -> Result<Self, Status> {
        Self::with_plugins(config, Vec::new())
    }

    /// Build a peer with an ordered plugin list.
    pub fn with_plugins(mut config: PeerConfig, plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, Status> {
        config.check()?;
        let transport = transport::for_network(&config.network)?;
        let default_codec = codec::get_by_name(&config.default_body_codec)
            .ok_or_else(|| {
                Status::internal(format!(
                    "unknown default body codec {:?}",
                    config.default_body_codec
                ))
            })?
            .id();
        let permits = match config.worker_pool_capacity {
            0 => Semaphore::MAX_PERMITS,
            n => n.min(Semaphore::MAX_PERMITS),
        };
        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            core: Arc::new(PeerCore {
                config,
                router: Router::new(ServiceMethodMapper::default()),
                plugins: PluginContainer::from_plugins(plugins),
                transport,
                proto_func: colloquy_core::default_proto_func(),
                default_codec,
                pool: Arc::new(Semaphore::new(permits)),
                sessions: Mutex::new(HashMap::new()),
                session_seq: AtomicU64::new(1),
                listen_addr: Mutex::new(None),
                closing: AtomicBool::new(false),
                close_tx,
            }),
        })
    }

    /// Select how (service, method) pairs map to route keys. Applies to
    /// registrations made after the call.
    pub fn set_service_method_mapper(&self, mapper: ServiceMethodMapper) {
        self.core.router.set_mapper(mapper);
    }

    /// Register a CALL handler under the mapped route for
    /// `(service, method)`.
    pub fn route_call<A, R, F, Fut>(&self, service: &str, method: &str, f: F) -> Result<(), Status>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, Status>> + Send + 'static,
    {
        let key = self.core.router.mapper().route(service, method);
        self.route_call_key(&key, f)
    }

    /// Register a CALL handler under an explicit route key.
    pub fn route_call_key<A, R, F, Fut>(&self, key: &str, f: F) -> Result<(), Status>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, Status>> + Send + 'static,
    {
        let mut record = RouteRecord {
            kind: RouteKind::Call,
            key: key.to_owned(),
        };
        self.core.plugins.post_reg(&mut record).into_result()?;
        self.core.router.register_call(record.key, call_handler(f))
    }

    /// Register a PUSH handler under the mapped route for
    /// `(service, method)`.
    pub fn route_push<A, F, Fut>(&self, service: &str, method: &str, f: F) -> Result<(), Status>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Status>> + Send + 'static,
    {
        let key = self.core.router.mapper().route(service, method);
        self.route_push_key(&key, f)
    }

    /// Register a PUSH handler under an explicit route key.
    pub fn route_push_key<A, F, Fut>(&self, key: &str, f: F) -> Result<(), Status>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Status>> + Send + 'static,
    {
        let mut record = RouteRecord {
            kind: RouteKind::Push,
            key: key.to_owned(),
        };
        self.core.plugins.post_reg(&mut record).into_result()?;
        self.core.router.register_push(record.key, push_handler(f))
    }

    /// Dial `addr` with the peer's default protocol.
    pub async fn dial(&self, addr: &str) -> Result<Session, Status> {
        self.dial_with_proto(addr, self.core.proto_func.clone()).await
    }

    /// Dial `addr` with an explicit protocol factory.
    pub async fn dial_with_proto(&self, addr: &str, proto_func: ProtoFunc) -> Result<Session, Status> {
        if self.core.closing.load(Ordering::Acquire) {
            return Err(Status::transport_error("peer is closing"));
        }
        let conn = self
            .core
            .transport
            .dial(addr, &self.core.dial_opts())
            .await?;
        let info = SessionInfo {
            id: self.core.next_session_id(&conn.remote_addr),
            local_addr: conn.local_addr.clone(),
            remote_addr: conn.remote_addr.clone(),
        };
        self.core.plugins.post_dial(&info).into_result()?;

        self.core.router.mark_serving();
        let session = Session::new(
            &self.core,
            Role::Dial {
                addr: addr.to_owned(),
            },
            proto_func(),
            info.id.clone(),
        );
        self.core
            .sessions
            .lock()
            .insert(info.id.clone(), session.clone());
        tracing::info!(
            session_id = info.id,
            remote_addr = info.remote_addr,
            "dialed session"
        );
        session.spawn_supervisor(conn);
        Ok(session)
    }

    /// Bind the configured listen address and serve until the peer is
    /// closed. One session is spawned per accepted connection.
    pub async fn listen_and_serve(&self) -> Result<(), Status> {
        self.listen_and_serve_with(self.core.proto_func.clone()).await
    }

    /// [`Peer::listen_and_serve`] with an explicit protocol factory.
    pub async fn listen_and_serve_with(&self, proto_func: ProtoFunc) -> Result<(), Status> {
        let addr = self.core.config.listen_addr();
        let mut listener = self.core.transport.listen(&addr).await?;
        let bound = listener.local_addr();
        tracing::info!(
            addr = %bound,
            network = %self.core.config.network,
            "listening"
        );
        *self.core.listen_addr.lock() = Some(bound);
        self.core.router.mark_serving();

        let mut close_rx = self.core.close_tx.subscribe();
        loop {
            let conn = tokio::select! {
                _ = close_rx.wait_for(|closed| *closed) => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(status) => {
                        if self.core.closing.load(Ordering::Acquire) {
                            return Ok(());
                        }
                        return Err(status);
                    }
                },
            };

            let info = SessionInfo {
                id: self.core.next_session_id(&conn.remote_addr),
                local_addr: conn.local_addr.clone(),
                remote_addr: conn.remote_addr.clone(),
            };
            let status = self.core.plugins.post_accept(&info);
            if !status.is_ok() {
                tracing::warn!(
                    remote_addr = info.remote_addr,
                    %status,
                    "connection rejected"
                );
                continue;
            }

            let session = Session::new(&self.core, Role::Accept, proto_func(), info.id.clone());
            self.core
                .sessions
                .lock()
                .insert(info.id.clone(), session.clone());
            tracing::info!(
                session_id = info.id,
                remote_addr = info.remote_addr,
                "accepted session"
            );
            session.spawn_supervisor(conn);
        }
    }

    /// The address the listener actually bound, once serving.
    pub fn listen_addr(&self) -> Option<String> {
        self.core.listen_addr.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.lock().len()
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.core.sessions.lock().get(id).cloned()
    }

    /// Idempotent teardown: stop accepting, close every session and
    /// wait for each to reach its terminal state.
    pub async fn close(&self) {
        self.core.closing.store(true, Ordering::Release);
        let _ = self.core.close_tx.send(true);
        let sessions: Vec<Session> = self.core.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("network", &self.core.config.network)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
