//! The owner of everything shared between sessions: configuration, plugins,
//! routes, registries and the session hub. An endpoint can accept connections,
//! dial out, or both.

pub(crate) mod dialer;
mod hub;
mod listener;

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::CodecRegistry;
use crate::config::{self, EndpointConfig};
use crate::error::RpcError;
use crate::exchange::ExchangePool;
use crate::filter::FilterRegistry;
use crate::plugin::{Plugin, PluginContainer};
use crate::proto::{raw_proto_func, ProtoContext, ProtoFunc};
use crate::router::Router;
use crate::session::{Redialer, Session};
use crate::socket::{IoStream, Socket};
use crate::status::Status;

use dialer::DialedConn;
pub(crate) use hub::Hub;
use listener::Listener;

const EXCHANGE_POOL_CAPACITY: usize = 1024;

pub(crate) struct EndpointCore {
    pub(crate) config: EndpointConfig,
    pub(crate) plugins: PluginContainer,
    pub(crate) router: Router,
    pub(crate) proto_func: ProtoFunc,
    pub(crate) proto_ctx: ProtoContext,
    pub(crate) default_body_codec: u8,
    pub(crate) hub: Hub,
    pub(crate) handler_permits: Arc<Semaphore>,
    pub(crate) pool: ExchangePool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) listeners: TaskTracker,
}

pub struct EndpointBuilder {
    config: EndpointConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    post_plugins: Vec<Arc<dyn Plugin>>,
    codecs: Option<CodecRegistry>,
    filters: Option<FilterRegistry>,
    proto_func: Option<ProtoFunc>,
}

impl EndpointBuilder {
    /// Adds a plugin that runs before any route-group plugin.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Adds a plugin that runs after every route-group plugin.
    pub fn post_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.post_plugins.push(plugin);
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Framing for new sessions. Defaults to the raw protocol.
    pub fn proto(mut self, proto_func: ProtoFunc) -> Self {
        self.proto_func = Some(proto_func);
        self
    }

    pub fn build(self) -> Result<Endpoint, RpcError> {
        let plugins = PluginContainer::new();
        for plugin in self.plugins {
            plugins.add_left(plugin)?;
        }
        for plugin in self.post_plugins {
            plugins.add_right(plugin)?;
        }

        let mut config = self.config;
        plugins.before_new_endpoint(&mut config)?;
        config::validate(&config)?;

        let codecs = Arc::new(self.codecs.unwrap_or_else(CodecRegistry::with_defaults));
        let filters = Arc::new(
            self.filters
                .unwrap_or_else(|| FilterRegistry::with_limit(config.max_message_size)),
        );
        let default_body_codec = codecs.get_by_name(&config.default_body_codec)?.id();
        let proto_ctx =
            ProtoContext::new(codecs, filters).with_max_message_size(config.max_message_size);

        let core = Arc::new(EndpointCore {
            router: Router::new(plugins.clone()),
            proto_func: self.proto_func.unwrap_or_else(raw_proto_func),
            proto_ctx,
            default_body_codec,
            hub: Hub::new(),
            handler_permits: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            pool: ExchangePool::new(EXCHANGE_POOL_CAPACITY),
            shutdown: CancellationToken::new(),
            listeners: TaskTracker::new(),
            plugins,
            config,
        });
        let endpoint = Endpoint { core };
        endpoint.core.plugins.after_new_endpoint(&endpoint)?;
        debug!(
            network = %endpoint.core.config.network,
            plugins = ?endpoint.core.plugins.names(),
            "endpoint created"
        );
        Ok(endpoint)
    }
}

#[derive(Clone)]
pub struct Endpoint {
    core: Arc<EndpointCore>,
}

impl Endpoint {
    pub fn builder(config: EndpointConfig) -> EndpointBuilder {
        EndpointBuilder {
            config,
            plugins: Vec::new(),
            post_plugins: Vec::new(),
            codecs: None,
            filters: None,
            proto_func: None,
        }
    }

    pub fn new(config: EndpointConfig) -> Result<Self, RpcError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.core.config
    }

    pub fn router(&self) -> &Router {
        &self.core.router
    }

    pub fn plugins(&self) -> &PluginContainer {
        &self.core.plugins
    }

    pub fn proto_context(&self) -> &ProtoContext {
        &self.core.proto_ctx
    }

    pub fn default_body_codec(&self) -> u8 {
        self.core.default_body_codec
    }

    /// Binds the configured listen address and starts accepting in the
    /// background. Returns the bound address.
    pub async fn listen(&self) -> Result<String, RpcError> {
        let (listener, bound) = Listener::bind(&self.core.config).await?;
        self.core.plugins.after_listen(&bound)?;
        info!(network = %self.core.config.network, addr = %bound, "listening");

        let endpoint = self.clone();
        let shutdown = self.core.shutdown.clone();
        self.core.listeners.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok(conn) => {
                        let endpoint = endpoint.clone();
                        tokio::spawn(async move {
                            if let Err(status) = endpoint.serve_dialed(conn).await {
                                debug!(%status, "connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    }
                }
            }
        });
        Ok(bound)
    }

    async fn serve_dialed(&self, conn: DialedConn) -> Result<Arc<Session>, Status> {
        self.serve_conn(conn.stream, conn.local_addr, conn.remote_addr)
            .await
    }

    /// Serves an already accepted stream as the server side of a session.
    pub async fn serve_conn<S: IoStream>(
        &self,
        stream: S,
        local_addr: Option<String>,
        remote_addr: Option<String>,
    ) -> Result<Arc<Session>, Status> {
        let socket = Socket::new(
            stream,
            local_addr,
            remote_addr,
            &self.core.proto_func,
            self.core.proto_ctx.clone(),
        );
        let session = Session::new(self.core.clone(), socket, None);
        if let Err(status) = self.core.plugins.after_accept(&session).await {
            warn!(session_id = %session.id(), %status, "connection rejected by plugin");
            session.close().await;
            return Err(status);
        }
        if !session.start() {
            return Err(Status::conn_closed(Some("session closed while preparing".into())));
        }
        info!(session_id = %session.id(), remote_addr = %session.remote_addr(), "accepted");
        Ok(session)
    }

    /// Connects to `addr`. Failed attempts are retried `redial_times` more
    /// times; the resulting session also redials on its own when it drops.
    pub async fn dial(&self, addr: &str) -> Result<Arc<Session>, Status> {
        let config = &self.core.config;
        let redialer = (config.redial_times != 0).then(|| Redialer {
            addr: addr.to_string(),
            times: config.redial_times,
            interval: config.redial_interval(),
        });

        let mut attempt: i32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let result = match dialer::dial_stream(&self.core, addr, false).await {
                Ok(conn) => self.prepare_client(conn, redialer.clone()).await,
                Err(status) => Err(status),
            };
            let status = match result {
                Ok(session) => return Ok(session),
                Err(status) => status,
            };
            warn!(addr, attempt, %status, "dial failed");
            let _ = self.core.plugins.after_dial_fail(addr, &status, false).await;

            let exhausted = config.redial_times >= 0 && attempt > config.redial_times;
            if exhausted || self.core.shutdown.is_cancelled() {
                return Err(status);
            }
            tokio::time::sleep(config.redial_interval()).await;
        }
    }

    /// Uses an existing stream as the client side of a session. Such a
    /// session cannot redial.
    pub async fn connect_conn<S: IoStream>(
        &self,
        stream: S,
        remote_addr: Option<String>,
    ) -> Result<Arc<Session>, Status> {
        let conn = DialedConn {
            stream: Box::new(stream),
            local_addr: None,
            remote_addr,
        };
        self.prepare_client(conn, None).await
    }

    async fn prepare_client(
        &self,
        conn: DialedConn,
        redialer: Option<Redialer>,
    ) -> Result<Arc<Session>, Status> {
        let socket = Socket::new(
            conn.stream,
            conn.local_addr,
            conn.remote_addr,
            &self.core.proto_func,
            self.core.proto_ctx.clone(),
        );
        let session = Session::new(self.core.clone(), socket, redialer);
        if let Err(status) = self.core.plugins.after_dial(&session, false).await {
            session.close().await;
            return Err(status);
        }
        if !session.start() {
            return Err(Status::conn_closed(Some("session closed while preparing".into())));
        }
        info!(session_id = %session.id(), remote_addr = %session.remote_addr(), "dialed");
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.core.hub.get(id)
    }

    /// Visits live sessions until `f` returns false.
    pub fn range_sessions<F>(&self, f: F)
    where
        F: FnMut(&Arc<Session>) -> bool,
    {
        self.core.hub.range(f);
    }

    pub fn count_sessions(&self) -> usize {
        self.core.hub.len()
    }

    /// Stops accepting and closes every session.
    pub async fn close(&self) {
        self.core.shutdown.cancel();
        self.core.listeners.close();
        self.core.listeners.wait().await;

        let sessions = self.core.hub.all();
        let count = sessions.len();
        join_all(sessions.iter().map(|s| s.close())).await;
        info!(sessions = count, "endpoint closed");
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("network", &self.core.config.network)
            .field("sessions", &self.core.hub.len())
            .finish()
    }
}
