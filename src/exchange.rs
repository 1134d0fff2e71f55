//! Per-exchange context.
//!
//! An [`Exchange`] is checked out of the [`ExchangePool`] for every inbound
//! message, bound to the session it arrived on, and returned once the message
//! has been fully handled. Plugins receive it at every read hook and at the
//! reply write hooks.
//!
//! Bodies are decoded late. The protocol leaves the body encoded and only the
//! `build_*_body` step, after the header hooks ran and the handler or pending
//! call is known, decides how to decode it.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, warn};

use crate::callcmd::{CallCmd, CallState};
use crate::codec::NIL_CODEC_ID;
use crate::error::panic_message;
use crate::logging::{self, AccessRecord};
use crate::message::{Body, Message, MessageType, Meta};
use crate::plugin::PluginContainer;
use crate::router::{Arg, Handler};
use crate::session::Session;
use crate::status::{Status, CODE_CONN_CLOSED};

/// Reply settings a Call handler may change while it runs.
#[derive(Debug, Default)]
struct ReplyDraft {
    meta: Meta,
    body_codec: Option<u8>,
}

fn parse_query(service_method: &str) -> Vec<(String, String)> {
    match service_method.split_once('?') {
        Some((_, q)) => url::form_urlencoded::parse(q.as_bytes())
            .into_owned()
            .collect(),
        None => Vec::new(),
    }
}

fn strip_query(service_method: &str) -> &str {
    service_method
        .split_once('?')
        .map_or(service_method, |(path, _)| path)
}

/// Handle given to Call handlers.
#[derive(Clone)]
pub struct CallCtx {
    session: Arc<Session>,
    seq: i32,
    service_method: String,
    meta: Meta,
    body_codec: u8,
    start: Instant,
    deadline: Option<Instant>,
    draft: Arc<Mutex<ReplyDraft>>,
}

impl CallCtx {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    pub fn path(&self) -> &str {
        strip_query(&self.service_method)
    }

    /// `?k=v` pairs of the service method, in order.
    pub fn query(&self) -> Vec<(String, String)> {
        parse_query(&self.service_method)
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn peek_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key)
    }

    pub fn input_body_codec(&self) -> u8 {
        self.body_codec
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remote_addr(&self) -> String {
        self.session.remote_addr()
    }

    pub fn set_reply_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.draft.lock().meta.set(key, value);
    }

    /// Overrides the codec of the reply body. Defaults to the request's.
    pub fn set_reply_body_codec(&self, codec_id: u8) {
        self.draft.lock().body_codec = Some(codec_id);
    }
}

/// Handle given to Push handlers.
#[derive(Clone)]
pub struct PushCtx {
    session: Arc<Session>,
    seq: i32,
    service_method: String,
    meta: Meta,
    body_codec: u8,
    start: Instant,
    deadline: Option<Instant>,
}

impl PushCtx {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    pub fn path(&self) -> &str {
        strip_query(&self.service_method)
    }

    pub fn query(&self) -> Vec<(String, String)> {
        parse_query(&self.service_method)
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn peek_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key)
    }

    pub fn input_body_codec(&self) -> u8 {
        self.body_codec
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remote_addr(&self) -> String {
        self.session.remote_addr()
    }
}

/// Mutable state of one inbound exchange.
pub struct Exchange {
    session: Option<Arc<Session>>,
    input: Message,
    output: Message,
    handler: Option<Arc<Handler>>,
    plugins: Option<PluginContainer>,
    arg: Option<Arg>,
    reply_value: Option<Value>,
    call_cmd: Option<Arc<CallCmd>>,
    cmd_guard: Option<OwnedMutexGuard<CallState>>,
    start: Instant,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            session: None,
            input: Message::default(),
            output: Message::default(),
            handler: None,
            plugins: None,
            arg: None,
            reply_value: None,
            call_cmd: None,
            cmd_guard: None,
            start: Instant::now(),
        }
    }
}

impl Exchange {
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    /// The Reply being built; only meaningful for Calls.
    pub fn output(&self) -> &Message {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Message {
        &mut self.output
    }

    pub fn handler(&self) -> Option<&Arc<Handler>> {
        self.handler.as_ref()
    }

    /// The pending Call a Reply resolves.
    pub fn call_cmd(&self) -> Option<&Arc<CallCmd>> {
        self.call_cmd.as_ref()
    }

    pub fn seq(&self) -> i32 {
        self.input.seq
    }

    pub fn service_method(&self) -> &str {
        &self.input.service_method
    }

    pub fn path(&self) -> &str {
        self.input.path()
    }

    pub fn query(&self) -> Vec<(String, String)> {
        self.input.query()
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// Decoded handler argument, once the body has been read.
    pub fn arg<T: Any>(&self) -> Option<&T> {
        self.arg.as_ref()?.downcast_ref::<T>()
    }

    pub fn set_reply_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.output.meta.set(key, value);
    }

    pub(crate) fn bind(&mut self, session: Arc<Session>) {
        self.session = Some(session);
        self.start = Instant::now();
    }

    /// Detaches everything. A pending Call still owned here is resolved so
    /// its caller is never left waiting.
    pub(crate) fn release(&mut self) {
        if let Some(cmd) = self.call_cmd.take() {
            match self.cmd_guard.take() {
                Some(mut guard) => {
                    if guard.status.is_ok() && !cmd.is_done() {
                        guard.status = Status::internal("reply handling aborted");
                    }
                }
                None => {
                    if let Ok(mut state) = cmd.state().try_lock() {
                        state.status = Status::internal("reply handling aborted");
                    }
                }
            }
            cmd.resolve();
        }
        self.cmd_guard = None;
        self.session = None;
        self.input.reset();
        self.output.reset();
        self.handler = None;
        self.plugins = None;
        self.arg = None;
        self.reply_value = None;
        self.start = Instant::now();
    }

    fn active_plugins(&self, session: &Session) -> PluginContainer {
        self.plugins
            .clone()
            .unwrap_or_else(|| session.core().plugins.clone())
    }

    fn decode_input_body(&mut self, session: &Session) -> Result<Value, Status> {
        let value = match std::mem::take(&mut self.input.body) {
            Body::Empty => Value::Null,
            Body::Value(v) => v,
            Body::Encoded(bytes) => session
                .core()
                .proto_ctx
                .codecs
                .unmarshal(self.input.body_codec, &bytes)
                .map_err(|e| Status::bad_message(e.to_string()))?,
        };
        self.input.body = Body::Value(value.clone());
        Ok(value)
    }

    /// Dispatches on message type. Runs in its own task per inbound message.
    pub(crate) async fn serve(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        match self.input.mtype {
            MessageType::Call => {
                self.build_call_body(&session).await;
                self.handle_call(&session).await;
            }
            MessageType::Push => {
                if self.build_push_body(&session).await {
                    self.handle_push(&session).await;
                }
            }
            MessageType::Reply => {
                self.build_reply_body(&session).await;
                self.handle_reply(&session);
            }
            other => {
                warn!(
                    session_id = %session.id(),
                    mtype = %other,
                    seq = self.input.seq,
                    "message type not allowed on an open session"
                );
            }
        }
    }

    async fn build_call_body(&mut self, session: &Arc<Session>) {
        let core = session.core();
        self.input.deadline = core.config.context_age().map(|age| self.start + age);

        let handler = match core.router.get_call(self.input.path()) {
            Some(handler) => handler,
            None => {
                self.output.status = Status::not_found(self.input.path());
                return;
            }
        };
        let plugins = handler.plugins().clone();
        self.handler = Some(handler.clone());
        self.plugins = Some(plugins.clone());

        if let Err(status) = plugins.after_read_call_header(self).await {
            self.output.status = status;
            return;
        }
        if let Err(status) = plugins.before_read_call_body(self).await {
            self.output.status = status;
            return;
        }
        let arg = self
            .decode_input_body(session)
            .and_then(|body| handler.new_arg(body));
        match arg {
            Ok(arg) => self.arg = Some(arg),
            Err(status) => {
                self.output.status = status;
                return;
            }
        }
        if let Err(status) = plugins.after_read_call_body(self).await {
            self.output.status = status;
        }
    }

    async fn handle_call(&mut self, session: &Arc<Session>) {
        self.output.mtype = MessageType::Reply;
        self.output.seq = self.input.seq;
        self.output.service_method = self.input.service_method.clone();

        let draft = Arc::new(Mutex::new(ReplyDraft::default()));
        if self.output.status.is_ok() {
            if let (Some(handler), Some(arg)) = (self.handler.clone(), self.arg.take()) {
                let ctx = CallCtx {
                    session: session.clone(),
                    seq: self.input.seq,
                    service_method: self.input.service_method.clone(),
                    meta: self.input.meta.clone(),
                    body_codec: self.input.body_codec,
                    start: self.start,
                    deadline: self.input.deadline,
                    draft: draft.clone(),
                };
                let invocation = AssertUnwindSafe(handler.call(ctx, arg)).catch_unwind();
                let outcome = match self.input.deadline {
                    Some(deadline) => {
                        tokio::time::timeout_at(deadline.into(), invocation).await.ok()
                    }
                    None => Some(invocation.await),
                };
                match outcome {
                    Some(Ok(Ok(value))) => self.output.body = Body::Value(value),
                    Some(Ok(Err(status))) => self.output.status = status,
                    Some(Err(payload)) => {
                        let reason = panic_message(&*payload);
                        error!(
                            session_id = %session.id(),
                            seq = self.input.seq,
                            service_method = %self.input.service_method,
                            panic = %reason,
                            "call handler panicked"
                        );
                        self.output.status = Status::internal(reason).with_stack();
                    }
                    None => {
                        self.output.status = Status::handle_timeout(format!(
                            "{} did not finish before its deadline",
                            self.input.path()
                        ));
                    }
                }
            }
        }

        let draft = std::mem::take(&mut *draft.lock());
        for (k, v) in draft.meta.iter() {
            self.output.meta.set(k, v);
        }
        let core = session.core();
        self.output.body_codec = draft.body_codec.unwrap_or(match self.input.body_codec {
            NIL_CODEC_ID => core.default_body_codec,
            codec => codec,
        });
        if !self.output.status.is_ok() {
            self.output.body = Body::Empty;
        }
        // The reply gets a fresh window rather than the one the handler used up.
        self.output.deadline = core.config.context_age().map(|age| Instant::now() + age);

        self.write_reply(session).await;
        self.access_log(session, "CALL", true, self.start.elapsed());
    }

    async fn write_reply(&mut self, session: &Arc<Session>) {
        let plugins = self.active_plugins(session);
        if let Err(status) = plugins.before_write_reply(self).await {
            self.output.status = status;
            self.output.body = Body::Empty;
        }
        match session.write_message(&mut self.output).await {
            Ok(()) => {
                if let Err(status) = plugins.after_write_reply(self).await {
                    debug!(seq = self.output.seq, %status, "after_write_reply failed");
                }
            }
            Err(status) if status.code() == CODE_CONN_CLOSED => {
                debug!(
                    session_id = %session.id(),
                    seq = self.output.seq,
                    "reply dropped, connection closed"
                );
            }
            Err(status) => {
                warn!(
                    session_id = %session.id(),
                    seq = self.output.seq,
                    %status,
                    "reply write failed, sending internal error instead"
                );
                let mut fallback =
                    Message::new(MessageType::Reply, self.output.service_method.clone(), self.output.seq);
                fallback.status = Status::internal(status.to_string());
                if let Err(status) = session.write_message(&mut fallback).await {
                    debug!(seq = fallback.seq, %status, "fallback reply failed");
                }
                self.output.status = fallback.status;
            }
        }
    }

    /// Returns false when the push should not be handled.
    async fn build_push_body(&mut self, session: &Arc<Session>) -> bool {
        let core = session.core();
        self.input.deadline = core.config.context_age().map(|age| self.start + age);

        let handler = match core.router.get_push(self.input.path()) {
            Some(handler) => handler,
            None => {
                debug!(
                    session_id = %session.id(),
                    service_method = %self.input.service_method,
                    "push has no handler"
                );
                self.input.status = Status::not_found(self.input.path());
                self.access_log(session, "PUSH", false, self.start.elapsed());
                return false;
            }
        };
        let plugins = handler.plugins().clone();
        self.handler = Some(handler.clone());
        self.plugins = Some(plugins.clone());

        let result = async {
            plugins.after_read_push_header(self).await?;
            plugins.before_read_push_body(self).await?;
            let arg = handler.new_arg(self.decode_input_body(session)?)?;
            self.arg = Some(arg);
            plugins.after_read_push_body(self).await
        }
        .await;
        if let Err(status) = result {
            debug!(
                session_id = %session.id(),
                service_method = %self.input.service_method,
                %status,
                "push rejected"
            );
            self.input.status = status;
            self.access_log(session, "PUSH", false, self.start.elapsed());
            return false;
        }
        true
    }

    async fn handle_push(&mut self, session: &Arc<Session>) {
        let (Some(handler), Some(arg)) = (self.handler.clone(), self.arg.take()) else {
            return;
        };
        let ctx = PushCtx {
            session: session.clone(),
            seq: self.input.seq,
            service_method: self.input.service_method.clone(),
            meta: self.input.meta.clone(),
            body_codec: self.input.body_codec,
            start: self.start,
            deadline: self.input.deadline,
        };
        let invocation = AssertUnwindSafe(handler.push(ctx, arg)).catch_unwind();
        let outcome = match self.input.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), invocation).await.ok(),
            None => Some(invocation.await),
        };
        match outcome {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(status))) => {
                debug!(service_method = %self.input.service_method, %status, "push handler failed");
                self.input.status = status;
            }
            Some(Err(payload)) => {
                let reason = panic_message(&*payload);
                error!(
                    session_id = %session.id(),
                    service_method = %self.input.service_method,
                    panic = %reason,
                    "push handler panicked"
                );
                self.input.status = Status::internal(reason);
            }
            None => {
                self.input.status = Status::handle_timeout(format!(
                    "{} did not finish before its deadline",
                    self.input.path()
                ));
            }
        }
        self.access_log(session, "PUSH", false, self.start.elapsed());
    }

    async fn build_reply_body(&mut self, session: &Arc<Session>) {
        let Some(cmd) = session.take_pending(self.input.seq) else {
            debug!(
                session_id = %session.id(),
                seq = self.input.seq,
                "reply has no pending call, dropped"
            );
            return;
        };
        let guard = cmd.state().lock_owned().await;
        self.call_cmd = Some(cmd);
        self.cmd_guard = Some(guard);
        self.input.status.remap_from_peer();

        let plugins = session.core().plugins.clone();
        self.plugins = Some(plugins.clone());

        let result = async {
            plugins.after_read_reply_header(self).await?;
            plugins.before_read_reply_body(self).await?;
            if self.input.status.is_ok() {
                self.reply_value = Some(self.decode_input_body(session)?);
            }
            plugins.after_read_reply_body(self).await
        }
        .await;
        if let (Err(status), Some(guard)) = (result, self.cmd_guard.as_mut()) {
            guard.status = status;
        }
    }

    fn handle_reply(&mut self, session: &Arc<Session>) {
        let (Some(cmd), Some(mut guard)) = (self.call_cmd.take(), self.cmd_guard.take()) else {
            return;
        };
        guard.input_meta = self.input.meta.clone();
        guard.input_body_codec = self.input.body_codec;
        if guard.status.is_ok() {
            guard.status = self.input.status.clone();
        }
        guard.reply = if guard.status.is_ok() {
            self.reply_value.take()
        } else {
            None
        };
        drop(guard);
        cmd.resolve();
        self.access_log(session, "CALL", false, cmd.cost());
    }

    fn access_log(&self, session: &Session, kind: &'static str, inbound_call: bool, cost: Duration) {
        let config = &session.core().config;
        logging::access(
            AccessRecord {
                session_id: &session.id(),
                remote_addr: &session.remote_addr(),
                kind,
                input: &self.input,
                output: inbound_call.then_some(&self.output),
                cost,
            },
            config.slow_comet_duration(),
            config.print_detail,
        );
    }
}

/// Free list of exchanges shared by all sessions of an endpoint.
pub struct ExchangePool {
    free: Mutex<Vec<Box<Exchange>>>,
    capacity: usize,
}

impl ExchangePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn get(&self) -> Box<Exchange> {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Releases `ex` and keeps it for reuse if there is room.
    pub fn put(&self, mut ex: Box<Exchange>) {
        ex.release();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(ex);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageSetting;
    use serde_json::json;

    #[tokio::test]
    async fn test_release_clears_every_field() {
        let cmd = Arc::new(CallCmd::new(
            &Message::new(MessageType::Call, "/math/add", 3),
            None,
        ));
        let guard = cmd.state().lock_owned().await;

        let mut ex = Exchange::default();
        ex.input = Message::new(MessageType::Reply, "/math/add?x=1", 3);
        ex.input.apply(&[MessageSetting::meta("k", "v")]);
        ex.output.meta.set("out", "1");
        ex.arg = Some(Box::new(5i64));
        ex.reply_value = Some(json!(15));
        ex.plugins = Some(PluginContainer::new());
        ex.call_cmd = Some(cmd.clone());
        ex.cmd_guard = Some(guard);

        ex.release();

        assert!(ex.session.is_none());
        assert!(ex.handler.is_none());
        assert!(ex.plugins.is_none());
        assert!(ex.arg.is_none());
        assert!(ex.reply_value.is_none());
        assert!(ex.call_cmd.is_none());
        assert!(ex.cmd_guard.is_none());
        assert!(ex.input.service_method.is_empty());
        assert!(ex.input.meta.is_empty());
        assert!(ex.output.meta.is_empty());

        // The abandoned call was resolved, not left hanging.
        assert!(cmd.is_done());
        assert_eq!(
            cmd.status().await.code(),
            crate::status::CODE_INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_arg_downcast() {
        let mut ex = Exchange::default();
        ex.arg = Some(Box::new(vec![1i64, 2]));
        assert_eq!(ex.arg::<Vec<i64>>(), Some(&vec![1, 2]));
        assert!(ex.arg::<String>().is_none());
    }

    #[test]
    fn test_pool_reuses_released_exchanges() {
        let pool = ExchangePool::new(1);
        let mut a = pool.get();
        a.input.seq = 9;
        let b = pool.get();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.get().input.seq, 0);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_query_helpers() {
        assert_eq!(strip_query("/a/b?x=1"), "/a/b");
        assert_eq!(parse_query("/a?x=1&y=two"), vec![
            ("x".to_string(), "1".to_string()),
            ("y".to_string(), "two".to_string())
        ]);
        assert!(parse_query("/a").is_empty());
    }
}
