//! URI-keyed handler routing for CALL and PUSH.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use colloquy_core::{BodyValue, Status};

use crate::context::{CallCtx, PushCtx};

/// Which route table a registration targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    Call,
    Push,
}

/// A route about to be registered; plugins may rewrite the key.
#[derive(Clone, Debug)]
pub struct RouteRecord {
    pub kind: RouteKind,
    pub key: String,
}

/// How a (service, method) name pair maps to a route key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceMethodMapper {
    /// `("Home", "Test")` → `/home/test`.
    #[default]
    HttpService,
    /// `("Home", "Test")` → `Home.Test`.
    RpcService,
}

impl ServiceMethodMapper {
    pub fn route(&self, service: &str, method: &str) -> String {
        match self {
            Self::HttpService => format!("/{}/{}", snake(service), snake(method)),
            Self::RpcService => format!("{service}.{method}"),
        }
    }
}

/// `CamelCase` → `snake_case`, keeping digit runs attached to the
/// preceding word (`TestV2` → `test_v2`).
fn snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let boundary = i > 0
                && (chars[i - 1].is_lowercase()
                    || chars.get(i + 1).is_some_and(|n| n.is_lowercase()));
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Erased CALL handler: body value in, optional body value and status out.
pub type CallHandler =
    Arc<dyn Fn(CallCtx, BodyValue) -> BoxFuture<'static, (Option<BodyValue>, Status)> + Send + Sync>;

/// Erased PUSH handler.
pub type PushHandler = Arc<dyn Fn(PushCtx, BodyValue) -> BoxFuture<'static, Status> + Send + Sync>;

/// Erase a typed CALL handler.
///
/// The argument is decoded from the body value tree; a decode failure
/// becomes a [`Status::decode_error`] reply without invoking `f`.
pub fn call_handler<A, R, F, Fut>(f: F) -> CallHandler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<R, Status>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx, value| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let arg: A = match serde_json::from_value(value) {
                Ok(arg) => arg,
                Err(e) => return (None, Status::decode_error(e)),
            };
            match f(ctx, arg).await {
                Ok(result) => match serde_json::to_value(result) {
                    Ok(value) => (Some(value), Status::ok()),
                    Err(e) => (None, Status::encode_error(e)),
                },
                Err(status) => (None, status),
            }
        })
    })
}

/// Erase a typed PUSH handler.
pub fn push_handler<A, F, Fut>(f: F) -> PushHandler
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), Status>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx, value| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let arg: A = match serde_json::from_value(value) {
                Ok(arg) => arg,
                Err(e) => return Status::decode_error(e),
            };
            match f(ctx, arg).await {
                Ok(()) => Status::ok(),
                Err(status) => status,
            }
        })
    })
}

/// The two disjoint route tables of a peer.
///
/// Routes are registered before serving; the tables are effectively
/// read-only once the first session is live.
pub struct Router {
    mapper: RwLock<ServiceMethodMapper>,
    call_routes: RwLock<HashMap<String, CallHandler>>,
    push_routes: RwLock<HashMap<String, PushHandler>>,
    serving: AtomicBool,
}

impl Router {
    pub fn new(mapper: ServiceMethodMapper) -> Self {
        Self {
            mapper: RwLock::new(mapper),
            call_routes: RwLock::new(HashMap::new()),
            push_routes: RwLock::new(HashMap::new()),
            serving: AtomicBool::new(false),
        }
    }

    pub fn mapper(&self) -> ServiceMethodMapper {
        *self.mapper.read()
    }

    pub fn set_mapper(&self, mapper: ServiceMethodMapper) {
        *self.mapper.write() = mapper;
    }

    /// Flag the tables as live; later registrations are a logic error.
    pub(crate) fn mark_serving(&self) {
        self.serving.store(true, Ordering::Release);
    }

    fn check_mutable(&self, key: &str) {
        if self.serving.load(Ordering::Acquire) {
            debug_assert!(false, "route {key:?} registered while serving");
            tracing::error!(key, "route registered while serving; lookups may miss it");
        }
    }

    pub fn register_call(&self, key: String, handler: CallHandler) -> Result<(), Status> {
        self.check_mutable(&key);
        let mut routes = self.call_routes.write();
        if routes.contains_key(&key) {
            return Err(Status::internal(format!("duplicate CALL route {key:?}")));
        }
        tracing::debug!(key, "registered CALL route");
        routes.insert(key, handler);
        Ok(())
    }

    pub fn register_push(&self, key: String, handler: PushHandler) -> Result<(), Status> {
        self.check_mutable(&key);
        let mut routes = self.push_routes.write();
        if routes.contains_key(&key) {
            return Err(Status::internal(format!("duplicate PUSH route {key:?}")));
        }
        tracing::debug!(key, "registered PUSH route");
        routes.insert(key, handler);
        Ok(())
    }

    pub fn lookup_call(&self, service_method: &str) -> Option<CallHandler> {
        self.call_routes.read().get(service_method).cloned()
    }

    pub fn lookup_push(&self, service_method: &str) -> Option<PushHandler> {
        self.push_routes.read().get(service_method).cloned()
    }
}
