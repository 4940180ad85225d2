//! Lifecycle plugins.
//!
//! A plugin overrides any subset of the hooks on [`Plugin`]; every hook
//! defaults to a no-op returning ok. The [`PluginContainer`] invokes
//! each plugin in registration order and stops at the first non-ok
//! status, which becomes the effective outcome at that hook point.

use std::sync::Arc;

use colloquy_core::{Message, Status};

use crate::router::RouteRecord;
use crate::session::SessionInfo;

/// An installable set of lifecycle hooks.
///
/// Hooks taking `&mut Message` run before the message is interpreted
/// and may rewrite it (e.g. normalize the service method); `&Message`
/// hooks are observe-only.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// After a route is mapped, before it lands in the router.
    fn post_reg(&self, route: &mut RouteRecord) -> Status {
        Status::ok()
    }

    /// After an outbound connection is established.
    fn post_dial(&self, sess: &SessionInfo) -> Status {
        Status::ok()
    }

    /// After an inbound connection is accepted. A non-ok status drops
    /// the connection.
    fn post_accept(&self, sess: &SessionInfo) -> Status {
        Status::ok()
    }

    fn pre_write_call(&self, m: &Message) -> Status {
        Status::ok()
    }

    fn post_write_call(&self, m: &Message) -> Status {
        Status::ok()
    }

    fn pre_write_reply(&self, m: &Message) -> Status {
        Status::ok()
    }

    fn post_write_reply(&self, m: &Message) -> Status {
        Status::ok()
    }

    fn pre_write_push(&self, m: &Message) -> Status {
        Status::ok()
    }

    fn post_write_push(&self, m: &Message) -> Status {
        Status::ok()
    }

    /// Before the read loop blocks on the next frame.
    fn pre_read_header(&self, sess: &SessionInfo) -> Status {
        Status::ok()
    }

    fn post_read_call_header(&self, m: &mut Message) -> Status {
        Status::ok()
    }

    fn post_read_call_body(&self, m: &Message) -> Status {
        Status::ok()
    }

    fn post_read_push_header(&self, m: &mut Message) -> Status {
        Status::ok()
    }

    fn post_read_push_body(&self, m: &Message) -> Status {
        Status::ok()
    }

    fn post_read_reply_header(&self, m: &mut Message) -> Status {
        Status::ok()
    }

    fn post_read_reply_body(&self, m: &Message) -> Status {
        Status::ok()
    }

    /// After a connection is torn down.
    fn post_disconnect(&self, sess: &SessionInfo) -> Status {
        Status::ok()
    }
}

macro_rules! chain_hook {
    ($name:ident, ref $arg_ty:ty) => {
        pub fn $name(&self, arg: $arg_ty) -> Status {
            for plugin in &self.plugins {
                let status = plugin.$name(arg);
                if !status.is_ok() {
                    tracing::debug!(
                        plugin = plugin.name(),
                        hook = stringify!($name),
                        %status,
                        "plugin short-circuited the chain"
                    );
                    return status;
                }
            }
            Status::ok()
        }
    };
    ($name:ident, mut $arg_ty:ty) => {
        pub fn $name(&self, arg: $arg_ty) -> Status {
            for plugin in &self.plugins {
                let status = plugin.$name(&mut *arg);
                if !status.is_ok() {
                    tracing::debug!(
                        plugin = plugin.name(),
                        hook = stringify!($name),
                        %status,
                        "plugin short-circuited the chain"
                    );
                    return status;
                }
            }
            Status::ok()
        }
    };
}

/// The ordered plugin list owned by a peer.
#[derive(Clone, Default)]
pub struct PluginContainer {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_plugins(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    chain_hook!(post_reg, mut &mut RouteRecord);
    chain_hook!(post_dial, ref &SessionInfo);
    chain_hook!(post_accept, ref &SessionInfo);
    chain_hook!(pre_write_call, ref &Message);
    chain_hook!(post_write_call, ref &Message);
    chain_hook!(pre_write_reply, ref &Message);
    chain_hook!(post_write_reply, ref &Message);
    chain_hook!(pre_write_push, ref &Message);
    chain_hook!(post_write_push, ref &Message);
    chain_hook!(pre_read_header, ref &SessionInfo);
    chain_hook!(post_read_call_header, mut &mut Message);
    chain_hook!(post_read_call_body, ref &Message);
    chain_hook!(post_read_push_header, mut &mut Message);
    chain_hook!(post_read_push_body, ref &Message);
    chain_hook!(post_read_reply_header, mut &mut Message);
    chain_hook!(post_read_reply_body, ref &Message);
    chain_hook!(post_disconnect, ref &SessionInfo);
}

/// Case-insensitive routing.
///
/// Lowercases route keys at registration and incoming service methods
/// at read time, so `"/home/TesT"` resolves the handler registered for
/// `"/home/test"`.
pub struct IgnoreCase;

impl IgnoreCase {
    pub fn new() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

impl Plugin for IgnoreCase {
    fn name(&self) -> &'static str {
        "ignore-case"
    }

    fn post_reg(&self, route: &mut RouteRecord) -> Status {
        route.key = route.key.to_lowercase();
        Status::ok()
    }

    fn post_read_call_header(&self, m: &mut Message) -> Status {
        m.service_method = m.service_method.to_lowercase();
        Status::ok()
    }

    fn post_read_push_header(&self, m: &mut Message) -> Status {
        m.service_method = m.service_method.to_lowercase();
        Status::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteKind;

    struct Deny {
        hook: &'static str,
    }

    impl Plugin for Deny {
        fn name(&self) -> &'static str {
            "deny"
        }

        fn post_accept(&self, _sess: &SessionInfo) -> Status {
            if self.hook == "post_accept" {
                Status::new(403, "denied", "")
            } else {
                Status::ok()
            }
        }
    }

    struct Counter {
        hits: std::sync::atomic::AtomicUsize,
    }

    impl Plugin for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn post_accept(&self, _sess: &SessionInfo) -> Status {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Status::ok()
        }
    }

    #[test]
    fn first_non_ok_short_circuits() {
        let counter = Arc::new(Counter {
            hits: std::sync::atomic::AtomicUsize::new(0),
        });
        let mut container = PluginContainer::new();
        container.add(Arc::new(Deny {
            hook: "post_accept",
        }));
        container.add(counter.clone());

        let info = SessionInfo {
            id: "s".into(),
            local_addr: "l".into(),
            remote_addr: "r".into(),
        };
        let status = container.post_accept(&info);
        assert_eq!(status.code(), 403);
        assert_eq!(counter.hits.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn ignore_case_lowercases_both_ends() {
        let container = PluginContainer::from_plugins(vec![IgnoreCase::new()]);

        let mut route = RouteRecord {
            kind: RouteKind::Call,
            key: "/Home/TesT".to_owned(),
        };
        container.post_reg(&mut route);
        assert_eq!(route.key, "/home/test");

        let mut m = colloquy_core::Message::new_call(1, "/Home/TesT");
        container.post_read_call_header(&mut m);
        assert_eq!(m.service_method, "/home/test");
    }
}
