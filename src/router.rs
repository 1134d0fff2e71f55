//! Service-method routing.
//!
//! Handlers are plain async closures. Registration captures the argument type
//! so the exchange can decode a body into it before the handler runs, and the
//! reply type so the result can be encoded afterwards.

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{type_name, Any};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{RegistryError, RpcError};
use crate::exchange::{CallCtx, PushCtx};
use crate::message::MessageType;
use crate::plugin::{Plugin, PluginContainer};
use crate::status::Status;

/// Typed argument produced from a decoded body.
pub type Arg = Box<dyn Any + Send + Sync>;

type ArgFactory = Arc<dyn Fn(Value) -> Result<Arg, Status> + Send + Sync>;
type CallInvoker = Arc<dyn Fn(CallCtx, Arg) -> BoxFuture<'static, Result<Value, Status>> + Send + Sync>;
type PushInvoker = Arc<dyn Fn(PushCtx, Arg) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

enum Invoker {
    Call(CallInvoker),
    Push(PushInvoker),
}

pub const UNKNOWN_HANDLER_NAME: &str = "*";

pub struct Handler {
    name: String,
    arg_type: &'static str,
    reply_type: Option<&'static str>,
    new_arg: ArgFactory,
    invoker: Invoker,
    plugins: PluginContainer,
    is_unknown: bool,
}

impl Handler {
    fn for_call<A, R, F, Fut>(name: String, f: F, plugins: PluginContainer, is_unknown: bool) -> Self
    where
        A: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let invoker: CallInvoker = Arc::new(move |ctx, arg: Arg| match arg.downcast::<A>() {
            Ok(arg) => {
                let fut = f(ctx, *arg);
                Box::pin(async move {
                    let reply = fut.await?;
                    serde_json::to_value(reply).map_err(|e| Status::internal(e.to_string()))
                })
            }
            Err(_) => Box::pin(future::ready(Err(Status::internal(format!(
                "argument is not a {}",
                type_name::<A>()
            ))))),
        });
        Self {
            name,
            arg_type: type_name::<A>(),
            reply_type: Some(type_name::<R>()),
            new_arg: arg_factory::<A>(),
            invoker: Invoker::Call(invoker),
            plugins,
            is_unknown,
        }
    }

    fn for_push<A, F, Fut>(name: String, f: F, plugins: PluginContainer, is_unknown: bool) -> Self
    where
        A: DeserializeOwned + Send + Sync + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let invoker: PushInvoker = Arc::new(move |ctx, arg: Arg| match arg.downcast::<A>() {
            Ok(arg) => Box::pin(f(ctx, *arg)),
            Err(_) => Box::pin(future::ready(Err(Status::internal(format!(
                "argument is not a {}",
                type_name::<A>()
            ))))),
        });
        Self {
            name,
            arg_type: type_name::<A>(),
            reply_type: None,
            new_arg: arg_factory::<A>(),
            invoker: Invoker::Push(invoker),
            plugins,
            is_unknown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// `None` for Push handlers.
    pub fn reply_type(&self) -> Option<&'static str> {
        self.reply_type
    }

    pub fn plugins(&self) -> &PluginContainer {
        &self.plugins
    }

    pub fn is_unknown(&self) -> bool {
        self.is_unknown
    }

    pub fn mtype(&self) -> MessageType {
        match self.invoker {
            Invoker::Call(_) => MessageType::Call,
            Invoker::Push(_) => MessageType::Push,
        }
    }

    pub(crate) fn new_arg(&self, body: Value) -> Result<Arg, Status> {
        (self.new_arg)(body)
    }

    pub(crate) fn call(&self, ctx: CallCtx, arg: Arg) -> BoxFuture<'static, Result<Value, Status>> {
        match &self.invoker {
            Invoker::Call(f) => f(ctx, arg),
            Invoker::Push(_) => Box::pin(future::ready(Err(Status::mtype_not_allowed(format!(
                "{} is a push handler",
                self.name
            ))))),
        }
    }

    pub(crate) fn push(&self, ctx: PushCtx, arg: Arg) -> BoxFuture<'static, Result<(), Status>> {
        match &self.invoker {
            Invoker::Push(f) => f(ctx, arg),
            Invoker::Call(_) => Box::pin(future::ready(Err(Status::mtype_not_allowed(format!(
                "{} is a call handler",
                self.name
            ))))),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("mtype", &self.mtype())
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("is_unknown", &self.is_unknown)
            .finish()
    }
}

fn arg_factory<A>() -> ArgFactory
where
    A: DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(|body: Value| {
        serde_json::from_value::<A>(body)
            .map(|arg| Box::new(arg) as Arg)
            .map_err(|e| Status::bad_message(format!("decode {}: {e}", type_name::<A>())))
    })
}

/// Joins route segments into `/a/b` form.
fn join_path(prefix: &str, path: &str) -> Result<String, RegistryError> {
    if prefix.contains('?') || path.contains('?') {
        return Err(RegistryError::InvalidPath(format!("{prefix}{path}")));
    }
    let joined: Vec<&str> = prefix
        .split('/')
        .chain(path.split('/'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if joined.is_empty() {
        return Err(RegistryError::InvalidPath(format!("{prefix}{path}")));
    }
    Ok(format!("/{}", joined.join("/")))
}

struct RouterInner {
    calls: DashMap<String, Arc<Handler>>,
    pushes: DashMap<String, Arc<Handler>>,
    unknown_call: ArcSwapOption<Handler>,
    unknown_push: ArcSwapOption<Handler>,
    plugins: PluginContainer,
}

/// Path to handler table shared by every session of an endpoint.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(plugins: PluginContainer) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                calls: DashMap::new(),
                pushes: DashMap::new(),
                unknown_call: ArcSwapOption::empty(),
                unknown_push: ArcSwapOption::empty(),
                plugins,
            }),
        }
    }

    pub fn plugins(&self) -> &PluginContainer {
        &self.inner.plugins
    }

    pub fn route_call<A, R, F, Fut>(&self, path: &str, f: F) -> Result<Arc<Handler>, RpcError>
    where
        A: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let name = join_path("", path)?;
        let handler = Handler::for_call(name, f, self.inner.plugins.clone(), false);
        self.insert(handler)
    }

    pub fn route_push<A, F, Fut>(&self, path: &str, f: F) -> Result<Arc<Handler>, RpcError>
    where
        A: DeserializeOwned + Send + Sync + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let name = join_path("", path)?;
        let handler = Handler::for_push(name, f, self.inner.plugins.clone(), false);
        self.insert(handler)
    }

    /// Route group under `prefix`. `plugins` run only for handlers of the group,
    /// between the endpoint's left and right plugins.
    pub fn sub_route(
        &self,
        prefix: &str,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<SubRouter, RpcError> {
        SubRouter::new(self.clone(), join_path("", prefix)?, &self.inner.plugins, plugins)
    }

    /// Fallback for Calls with no exact route. The body arrives undecoded as a
    /// generic value.
    pub fn set_unknown_call<R, F, Fut>(&self, f: F) -> Result<Arc<Handler>, RpcError>
    where
        R: Serialize + 'static,
        F: Fn(CallCtx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let handler = Arc::new(Handler::for_call(
            UNKNOWN_HANDLER_NAME.to_string(),
            f,
            self.inner.plugins.derive(),
            true,
        ));
        handler.plugins().after_reg_router(&handler)?;
        self.inner.unknown_call.store(Some(handler.clone()));
        debug!("unknown call handler set");
        Ok(handler)
    }

    pub fn set_unknown_push<F, Fut>(&self, f: F) -> Result<Arc<Handler>, RpcError>
    where
        F: Fn(PushCtx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let handler = Arc::new(Handler::for_push(
            UNKNOWN_HANDLER_NAME.to_string(),
            f,
            self.inner.plugins.derive(),
            true,
        ));
        handler.plugins().after_reg_router(&handler)?;
        self.inner.unknown_push.store(Some(handler.clone()));
        debug!("unknown push handler set");
        Ok(handler)
    }

    /// Exact match first, then the unknown fallback.
    pub fn get_call(&self, path: &str) -> Option<Arc<Handler>> {
        match self.inner.calls.get(path) {
            Some(h) => Some(h.value().clone()),
            None => self.inner.unknown_call.load_full(),
        }
    }

    pub fn get_push(&self, path: &str) -> Option<Arc<Handler>> {
        match self.inner.pushes.get(path) {
            Some(h) => Some(h.value().clone()),
            None => self.inner.unknown_push.load_full(),
        }
    }

    pub fn call_routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.inner.calls.iter().map(|e| e.key().clone()).collect();
        routes.sort();
        routes
    }

    pub fn push_routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.inner.pushes.iter().map(|e| e.key().clone()).collect();
        routes.sort();
        routes
    }

    fn insert(&self, handler: Handler) -> Result<Arc<Handler>, RpcError> {
        let table = match handler.mtype() {
            MessageType::Push => &self.inner.pushes,
            _ => &self.inner.calls,
        };
        let handler = Arc::new(handler);
        if table.contains_key(&handler.name) {
            return Err(RegistryError::DuplicateRoute(handler.name.clone()).into());
        }
        // A route a plugin rejects is never served.
        handler.plugins().after_reg_router(&handler)?;
        match table.entry(handler.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateRoute(handler.name.clone()).into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler.clone());
            }
        }
        debug!(
            route = %handler.name,
            mtype = %handler.mtype(),
            arg_type = handler.arg_type,
            "route registered"
        );
        Ok(handler)
    }
}

/// Route group with its own middle plugins.
#[derive(Clone)]
pub struct SubRouter {
    router: Router,
    prefix: String,
    plugins: PluginContainer,
}

impl SubRouter {
    fn new(
        router: Router,
        prefix: String,
        parent: &PluginContainer,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Self, RpcError> {
        let container = parent.derive();
        for plugin in plugins {
            container.add_middle(plugin)?;
        }
        Ok(Self {
            router,
            prefix,
            plugins: container,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn plugins(&self) -> &PluginContainer {
        &self.plugins
    }

    pub fn route_call<A, R, F, Fut>(&self, path: &str, f: F) -> Result<Arc<Handler>, RpcError>
    where
        A: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let name = join_path(&self.prefix, path)?;
        let handler = Handler::for_call(name, f, self.plugins.clone(), false);
        self.router.insert(handler)
    }

    pub fn route_push<A, F, Fut>(&self, path: &str, f: F) -> Result<Arc<Handler>, RpcError>
    where
        A: DeserializeOwned + Send + Sync + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let name = join_path(&self.prefix, path)?;
        let handler = Handler::for_push(name, f, self.plugins.clone(), false);
        self.router.insert(handler)
    }

    pub fn sub_route(
        &self,
        prefix: &str,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<SubRouter, RpcError> {
        SubRouter::new(
            self.router.clone(),
            join_path(&self.prefix, prefix)?,
            &self.plugins,
            plugins,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn add(_ctx: CallCtx, nums: Vec<i64>) -> Result<i64, Status> {
        Ok(nums.iter().sum())
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "math/add").unwrap(), "/math/add");
        assert_eq!(join_path("/math/", "/add/").unwrap(), "/math/add");
        assert!(join_path("", "").is_err());
        assert!(join_path("", "/a?b=1").is_err());
    }

    #[test]
    fn test_exact_route_wins_over_unknown() {
        let router = Router::new(PluginContainer::new());
        router.route_call("/math/add", add).unwrap();
        router
            .set_unknown_call(|_ctx, _body: Value| async { Ok("fallback") })
            .unwrap();

        let exact = router.get_call("/math/add").unwrap();
        assert!(!exact.is_unknown());
        assert_eq!(exact.arg_type(), type_name::<Vec<i64>>());
        assert_eq!(exact.reply_type(), Some(type_name::<i64>()));

        let fallback = router.get_call("/math/mul").unwrap();
        assert!(fallback.is_unknown());
        assert!(router.get_push("/math/add").is_none());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let router = Router::new(PluginContainer::new());
        router.route_call("/a", add).unwrap();
        let err = router.route_call("a/", add).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Registry(RegistryError::DuplicateRoute(_))
        ));
        // Same path may exist once per direction.
        router
            .route_push("/a", |_ctx, _n: i64| async { Ok(()) })
            .unwrap();
    }

    #[test]
    fn test_sub_route_prefixes_and_derives_plugins() {
        let router = Router::new(PluginContainer::new());
        let math = router.sub_route("math", vec![]).unwrap();
        let h = math.route_call("add", add).unwrap();
        assert_eq!(h.name(), "/math/add");
        let nested = math.sub_route("v2", vec![]).unwrap();
        let h2 = nested.route_call("/add", add).unwrap();
        assert_eq!(h2.name(), "/math/v2/add");
        assert_eq!(router.call_routes(), vec!["/math/add", "/math/v2/add"]);
    }

    #[test]
    fn test_arg_decode_failure_is_bad_message() {
        let router = Router::new(PluginContainer::new());
        let h = router.route_call("/math/add", add).unwrap();
        let err = h.new_arg(serde_json::json!("nope")).unwrap_err();
        assert_eq!(err.code(), crate::status::CODE_BAD_MESSAGE);
        assert!(h.new_arg(serde_json::json!([1, 2])).is_ok());
    }

    struct DenyUnderX;

    impl Plugin for DenyUnderX {
        fn name(&self) -> &str {
            "deny_under_x"
        }

        fn after_reg_router(&self, handler: &Handler) -> crate::plugin::HookResult {
            if handler.name().starts_with("/x") {
                return Err(Status::conflict(format!("{} is reserved", handler.name())));
            }
            Ok(())
        }
    }

    #[test]
    fn test_rejected_route_is_not_registered() {
        let plugins = PluginContainer::new();
        plugins.add_left(Arc::new(DenyUnderX)).unwrap();
        let router = Router::new(plugins);

        assert!(router.route_call("/x", add).is_err());
        assert!(router.route_push("/x/y", |_ctx, _n: i64| async { Ok(()) }).is_err());
        assert!(router.get_call("/x").is_none());
        assert!(router.get_push("/x/y").is_none());
        assert!(router.call_routes().is_empty());

        router.route_call("/ok", add).unwrap();
        assert_eq!(router.call_routes(), vec!["/ok"]);
        // Once rejected, the path stays free for a later attempt.
        assert!(router.route_call("/x", add).is_err());
    }
}
