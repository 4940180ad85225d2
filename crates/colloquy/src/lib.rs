//! colloquy: symmetric peer-to-peer RPC.
//!
//! Every [`Peer`] can dial and listen at once; either side of a
//! [`Session`] may issue request/response exchanges (CALL), send
//! fire-and-forget notifications (PUSH), and intercept the lifecycle
//! through [`Plugin`] hooks. Messages ride a pluggable byte-stream
//! transport, carry a reversible transfer-filter pipeline and a
//! selectable body codec.
//!
//! # Quick start
//!
//! ```no_run
//! use colloquy::{CallOptions, Peer, PeerConfig, Status};
//! use serde_json::{json, Value};
//!
//! # async fn demo() -> Result<(), Status> {
//! // Server peer.
//! let srv = Peer::new(PeerConfig {
//!     listen_port: 9090,
//!     ..Default::default()
//! })?;
//! srv.route_call("Home", "Test", |ctx, arg: Value| async move {
//!     let caller = ctx.peek_meta_str("peer_id").unwrap_or("?").to_owned();
//!     Ok::<_, Status>(json!({ "arg": arg, "caller": caller }))
//! })?;
//! tokio::spawn(async move { srv.listen_and_serve().await });
//!
//! // Client peer.
//! let cli = Peer::new(PeerConfig::default())?;
//! let sess = cli.dial(":9090").await?;
//! let result: Value = sess
//!     .call(
//!         "/home/test",
//!         json!({"author": "andeya"}),
//!         CallOptions::new().with_add_meta("peer_id", "110"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod peer;
pub mod plugin;
pub mod router;
pub mod session;

pub use config::PeerConfig;
pub use context::{CallCtx, PushCtx};
pub use peer::Peer;
pub use plugin::{IgnoreCase, Plugin, PluginContainer};
pub use router::{RouteKind, RouteRecord, Router, ServiceMethodMapper};
pub use session::{CallOptions, Session, SessionInfo, SessionState};

// Re-export the wire layer.
pub use colloquy_core::{
    codec, default_proto_func, json_proto_func, raw_proto_func, status, transport, xfer, BodyValue,
    Codec, GzipFilter, Message, Meta, MsgType, Proto, ProtoFunc, Status, XferFilter, XferPipe,
};

/// Convenient imports for applications.
pub mod prelude {
    pub use crate::{
        CallCtx, CallOptions, IgnoreCase, Peer, PeerConfig, Plugin, PushCtx, ServiceMethodMapper,
        Session, Status,
    };
}
