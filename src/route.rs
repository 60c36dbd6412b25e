//! Route registration and name resolution.
//!
//! The registry is a single, process-wide table built once at startup and
//! treated as immutable afterward; see [`crate::session`] for the per-session
//! cache of instantiated [`RouteDispatch`] objects it resolves against.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::CallArgs;
use crate::error::{RpcError, RpcResult};
use crate::session::SessionHandle;

/// A stateful, per-session route object. One instance is created the first
/// time any of its methods are resolved on a given session, and lives for the
/// session's lifetime.
#[async_trait]
pub trait RouteDispatch: Send + Sync {
    /// Invoke `method` with the given arguments and return its result.
    ///
    /// Implementations are expected to be a hand-written `match` over their
    /// known method names, returning [`RpcError::MethodNotFound`] for
    /// anything else — the registry has already filtered private and
    /// no-proxy names by the time this is called, but an implementation
    /// should never assume every name reaching it is one it recognizes.
    async fn dispatch(&self, method: &str, args: CallArgs) -> RpcResult<Value>;

    /// Called exactly once when the owning session closes.
    async fn on_close(&self) {}
}

/// Produces a new [`RouteDispatch`] instance bound to one session.
pub type RouteFactory = Arc<dyn Fn(SessionHandle) -> Arc<dyn RouteDispatch> + Send + Sync>;

/// A stateless, session-scoped handler. Receives the session as its first
/// argument, per §6's bare-function convention.
pub type BareFn =
    Arc<dyn Fn(SessionHandle, CallArgs) -> BoxFuture<'static, RpcResult<Value>> + Send + Sync>;

/// One registration in the [`RouteRegistry`].
#[derive(Clone)]
enum RouteEntry {
    Factory(RouteFactory),
    Function(BareFn),
}

/// The outcome of resolving a dotted or bare call name.
pub enum Resolved {
    /// Invoke `method` on this cached (or freshly created) route instance.
    Method(Arc<dyn RouteDispatch>, String),
    /// Invoke this bare function directly.
    Function(BareFn),
}

/// Name of the built-in `ping` bare function every [`RouteRegistry`] starts
/// with, per §6's application-level keepalive fallback.
pub const PING_ROUTE: &str = "ping";

fn is_private(name: &str) -> bool {
    name.starts_with('_')
}

fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Process-wide mapping from route/function name to its registration.
///
/// Registration is expected to happen once near startup; after that the
/// registry is read-only in practice even though nothing prevents calling
/// `register` later (route names are not namespaced per connection, so
/// registering after sessions are already open would apply to all of them).
#[derive(Default)]
pub struct RouteRegistry {
    entries: DashMap<String, RouteEntry>,
    no_proxy: Mutex<HashSet<String>>,
}

impl RouteRegistry {
    /// A registry seeded with the built-in `ping` route (see [`PING_ROUTE`]),
    /// mirroring the reference implementation's `ROUTES = {'ping': ping}`.
    /// An embedder registering its own `ping` under the same name overrides
    /// this default, same as any other registration.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self::default();
        registry.register_fn(
            PING_ROUTE,
            Arc::new(|_session, _args| Box::pin(async { Ok(Value::String("pong".to_string())) })),
        );
        registry
    }

    /// Register a stateful route factory under `name`.
    pub fn register_route(&self, name: impl Into<String>, factory: RouteFactory) {
        self.entries.insert(name.into(), RouteEntry::Factory(factory));
    }

    /// Register a stateless bare function under `name`.
    pub fn register_fn(&self, name: impl Into<String>, func: BareFn) {
        self.entries.insert(name.into(), RouteEntry::Function(func));
    }

    /// Opt a fully-qualified name (`route.method` or a bare function name) out
    /// of dispatch, mirroring the reference implementation's `@noproxy`
    /// decorator via an explicit registration-time call — Rust has no runtime
    /// attribute interception to hang a decorator off of.
    pub fn mark_no_proxy(&self, name: impl Into<String>) {
        self.no_proxy.lock().insert(name.into());
    }

    fn is_no_proxy(&self, name: &str) -> bool {
        self.no_proxy.lock().contains(name)
    }

    /// Resolve `func_name` against this registry, instantiating (and caching,
    /// in `cache`) a route object on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MethodNotFound`] if the name does not resolve to a
    /// registered route method or bare function, is private (final segment
    /// starts with `_`), or has been marked no-proxy.
    pub fn resolve(
        &self,
        func_name: &str,
        cache: &RouteInstanceCache,
        handle: SessionHandle,
    ) -> RpcResult<Resolved> {
        let (route, method) = match func_name.split_once('.') {
            Some((route, method)) => (route.to_string(), method.to_string()),
            None => (func_name.to_string(), "init".to_string()),
        };

        if let Some(factory) = self.entries.get(&route).and_then(|entry| match entry.value() {
            RouteEntry::Factory(factory) => Some(factory.clone()),
            RouteEntry::Function(_) => None,
        }) {
            if is_private(&method) || self.is_no_proxy(&format!("{route}.{method}")) {
                return Err(RpcError::MethodNotFound(func_name.to_string()));
            }
            let instance = cache.get_or_create(&route, || factory(handle));
            return Ok(Resolved::Method(instance, method));
        }

        if is_private(last_segment(func_name)) || self.is_no_proxy(func_name) {
            return Err(RpcError::MethodNotFound(func_name.to_string()));
        }

        if let Some(func) = self.entries.get(func_name).and_then(|entry| match entry.value() {
            RouteEntry::Function(func) => Some(func.clone()),
            RouteEntry::Factory(_) => None,
        }) {
            return Ok(Resolved::Function(func));
        }

        Err(RpcError::MethodNotFound(func_name.to_string()))
    }
}

impl std::fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("routes", &self.entries.len())
            .finish()
    }
}

/// Per-session cache of lazily-instantiated route objects, keyed by route name.
#[derive(Default)]
pub struct RouteInstanceCache {
    instances: DashMap<String, Arc<dyn RouteDispatch>>,
}

impl RouteInstanceCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(
        &self,
        route: &str,
        make: impl FnOnce() -> Arc<dyn RouteDispatch>,
    ) -> Arc<dyn RouteDispatch> {
        if let Some(existing) = self.instances.get(route) {
            return Arc::clone(existing.value());
        }
        self.instances
            .entry(route.to_string())
            .or_insert_with(make)
            .clone()
    }

    /// All instances created on this session, for the close-time `on_close` sweep.
    pub fn iter_instances(&self) -> Vec<Arc<dyn RouteDispatch>> {
        self.instances.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RouteDispatch for Echo {
        async fn dispatch(&self, method: &str, args: CallArgs) -> RpcResult<Value> {
            match method {
                "simple_method" => Ok(Value::Object(args.keyword)),
                "init" => Ok(Value::Bool(true)),
                _ => Err(RpcError::MethodNotFound(method.to_string())),
            }
        }
    }

    fn handle() -> SessionHandle {
        Session::new_detached_handle_for_test()
    }

    #[test]
    fn resolves_dotted_route_method() {
        let registry = RouteRegistry::new();
        registry.register_route("R", Arc::new(|_h| Arc::new(Echo) as Arc<dyn RouteDispatch>));
        let cache = RouteInstanceCache::new();

        match registry.resolve("R.simple_method", &cache, handle()).unwrap() {
            Resolved::Method(_, method) => assert_eq!(method, "simple_method"),
            Resolved::Function(_) => panic!("expected a method resolution"),
        }
    }

    #[test]
    fn bare_name_maps_to_init() {
        let registry = RouteRegistry::new();
        registry.register_route("R", Arc::new(|_h| Arc::new(Echo) as Arc<dyn RouteDispatch>));
        let cache = RouteInstanceCache::new();

        match registry.resolve("R", &cache, handle()).unwrap() {
            Resolved::Method(_, method) => assert_eq!(method, "init"),
            Resolved::Function(_) => panic!("expected a method resolution"),
        }
    }

    #[test]
    fn private_method_never_resolves() {
        let registry = RouteRegistry::new();
        registry.register_route("R", Arc::new(|_h| Arc::new(Echo) as Arc<dyn RouteDispatch>));
        let cache = RouteInstanceCache::new();

        assert!(matches!(
            registry.resolve("R._secret", &cache, handle()),
            Err(RpcError::MethodNotFound(_))
        ));
    }

    #[test]
    fn no_proxy_method_is_rejected() {
        let registry = RouteRegistry::new();
        registry.register_route("R", Arc::new(|_h| Arc::new(Echo) as Arc<dyn RouteDispatch>));
        registry.mark_no_proxy("R.simple_method");
        let cache = RouteInstanceCache::new();

        assert!(matches!(
            registry.resolve("R.simple_method", &cache, handle()),
            Err(RpcError::MethodNotFound(_))
        ));
    }

    #[test]
    fn bare_function_resolves_by_whole_name() {
        let registry = RouteRegistry::new();
        registry.register_fn(
            "f",
            Arc::new(|_h, args| Box::pin(async move { Ok(Value::Object(args.keyword)) })),
        );
        let cache = RouteInstanceCache::new();

        assert!(matches!(
            registry.resolve("f", &cache, handle()).unwrap(),
            Resolved::Function(_)
        ));
    }

    #[tokio::test]
    async fn new_registry_answers_ping_with_pong() {
        let registry = RouteRegistry::new();
        let cache = RouteInstanceCache::new();

        let func = match registry.resolve(PING_ROUTE, &cache, handle()).unwrap() {
            Resolved::Function(func) => func,
            Resolved::Method(..) => panic!("expected the built-in ping to be a bare function"),
        };
        let result = func(handle(), CallArgs::default()).await.unwrap();
        assert_eq!(result, Value::String("pong".to_string()));
    }

    #[test]
    fn registering_a_custom_ping_overrides_the_built_in_one() {
        let registry = RouteRegistry::new();
        registry.register_fn(
            PING_ROUTE,
            Arc::new(|_h, _args| Box::pin(async { Ok(Value::String("custom".to_string())) })),
        );
        let cache = RouteInstanceCache::new();

        match registry.resolve(PING_ROUTE, &cache, handle()).unwrap() {
            Resolved::Function(_) => {}
            Resolved::Method(..) => panic!("expected a bare function"),
        }
    }

    #[test]
    fn unknown_name_is_method_not_found() {
        let registry = RouteRegistry::new();
        let cache = RouteInstanceCache::new();
        assert!(matches!(
            registry.resolve("nope", &cache, handle()),
            Err(RpcError::MethodNotFound(_))
        ));
    }

    #[test]
    fn instance_is_cached_across_resolutions() {
        let registry = RouteRegistry::new();
        registry.register_route("R", Arc::new(|_h| Arc::new(Echo) as Arc<dyn RouteDispatch>));
        let cache = RouteInstanceCache::new();

        let first = match registry.resolve("R.simple_method", &cache, handle()).unwrap() {
            Resolved::Method(instance, _) => Arc::as_ptr(&instance),
            Resolved::Function(_) => unreachable!(),
        };
        let second = match registry.resolve("R.init", &cache, handle()).unwrap() {
            Resolved::Method(instance, _) => Arc::as_ptr(&instance),
            Resolved::Function(_) => unreachable!(),
        };
        assert_eq!(first, second);
    }
}
