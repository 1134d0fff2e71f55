//! One connection and everything multiplexed over it.
//!
//! A session owns its socket, the sequence counter, the table of Calls still
//! waiting for a Reply and the lifecycle state. Inbound frames are read by a
//! single loop task and each one is handled in a task of its own; outbound
//! frames from any task are serialized by the socket.
//!
//! Removal from the pending table decides who resolves a Call. The reply path,
//! the disconnect sweep and the call deadline each remove first and only the
//! winner touches the Call afterwards.

pub mod state;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::callcmd::{CallCmd, CallNotify};
use crate::endpoint::{dialer, EndpointCore};
use crate::error::panic_message;
use crate::message::{Body, Message, MessageSetting, MessageType, Meta};
use crate::proto::ProtoFunc;
use crate::socket::Socket;
use crate::status::{Status, CODE_CONN_CLOSED};

pub use state::SessionState;
use state::AtomicState;

/// Where and how often a client session reconnects.
#[derive(Debug, Clone)]
pub(crate) struct Redialer {
    pub(crate) addr: String,
    /// Negative retries forever.
    pub(crate) times: i32,
    pub(crate) interval: Duration,
}

/// Identity of the connection a read loop serves. Replaced on every redial so
/// a stale loop cannot tear down its successor.
struct Conn {
    epoch: u64,
    cancel: CancellationToken,
}

/// Inbound authentication request read while the session is preparing.
#[derive(Debug, Clone)]
pub struct AuthRequest<T> {
    pub seq: i32,
    pub service_method: String,
    pub meta: Meta,
    pub body: T,
}

pub struct Session {
    core: Arc<EndpointCore>,
    socket: Socket,
    state: AtomicState,
    seq: AtomicI32,
    pending: Mutex<HashMap<i32, Arc<CallCmd>>>,
    redialer: Option<Redialer>,
    handler_tasks: TaskTracker,
    call_launches: TaskTracker,
    conn: Mutex<Conn>,
    redial_lock: tokio::sync::Mutex<()>,
    created: Instant,
}

impl Session {
    pub(crate) fn new(
        core: Arc<EndpointCore>,
        socket: Socket,
        redialer: Option<Redialer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            socket,
            state: AtomicState::new(SessionState::Preparing),
            seq: AtomicI32::new(0),
            pending: Mutex::new(HashMap::new()),
            redialer,
            handler_tasks: TaskTracker::new(),
            call_launches: TaskTracker::new(),
            conn: Mutex::new(Conn {
                epoch: 0,
                cancel: CancellationToken::new(),
            }),
            redial_lock: tokio::sync::Mutex::new(()),
            created: Instant::now(),
        })
    }

    pub(crate) fn core(&self) -> &Arc<EndpointCore> {
        &self.core
    }

    pub fn id(&self) -> String {
        self.socket.id()
    }

    /// Changes the id and re-keys the endpoint's session hub.
    pub fn set_id(self: &Arc<Self>, id: impl Into<String>) {
        let old = self.socket.id();
        self.socket.set_id(id);
        self.core.hub.rekey(&old, self);
    }

    pub fn local_addr(&self) -> String {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> String {
        self.socket.remote_addr()
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Usable now, or will reconnect on the next write.
    pub fn health(&self) -> bool {
        match self.state() {
            SessionState::Ok => true,
            SessionState::PassiveClosed => self.redialer.is_some(),
            _ => false,
        }
    }

    pub fn can_redial(&self) -> bool {
        self.redialer.is_some()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn set_proto(&self, proto_func: &ProtoFunc) {
        self.socket.set_proto(proto_func);
    }

    pub fn swap_insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.socket.swap_insert(key, value);
    }

    pub fn swap_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.socket.swap_get(key)
    }

    pub fn swap_remove(&self, key: &str) -> bool {
        self.socket.swap_remove(key)
    }

    fn next_seq(&self) -> i32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn new_output(
        &self,
        mtype: MessageType,
        service_method: &str,
        settings: &[MessageSetting],
    ) -> Message {
        let mut msg = Message::new(mtype, service_method, 0);
        msg.body_codec = self.core.default_body_codec;
        msg.apply(settings);
        if msg.deadline.is_none() {
            msg.deadline = self.core.config.context_age().map(|age| Instant::now() + age);
        }
        msg
    }

    fn check_writable(&self, mtype: MessageType) -> Result<(), Status> {
        let state = self.state();
        let is_auth = matches!(mtype, MessageType::AuthCall | MessageType::AuthReply);
        let allowed = match state {
            SessionState::Ok => true,
            SessionState::ActiveClosing => mtype == MessageType::Reply,
            SessionState::Preparing => {
                if !is_auth {
                    return Err(Status::mtype_not_allowed(format!(
                        "{mtype} cannot be written while the session is {state}"
                    )));
                }
                true
            }
            // Non-auth writes report ConnClosed so callers wait out the redial.
            SessionState::Redialing => is_auth,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Status::conn_closed(Some(format!("session is {state}"))))
        }
    }

    /// Writes one frame under the message deadline.
    pub(crate) async fn write_message(&self, msg: &mut Message) -> Result<(), Status> {
        self.check_writable(msg.mtype)?;
        if msg.is_expired() {
            return Err(Status::write_failed("deadline exceeded before write"));
        }
        let written = match msg.deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), self.socket.write_message(msg)).await
                {
                    Ok(written) => written,
                    Err(_) => {
                        // A partial frame may be on the wire; the stream is unusable.
                        self.socket.close().await;
                        return Err(Status::write_failed("write deadline exceeded"));
                    }
                }
            }
            None => self.socket.write_message(msg).await,
        };
        written.map_err(|e| {
            if e.is_disconnect() {
                Status::conn_closed(Some(e.to_string()))
            } else {
                Status::write_failed(e.to_string())
            }
        })
    }

    fn register(&self, msg: &mut Message, notify: Option<CallNotify>) -> Arc<CallCmd> {
        let mut pending = self.pending.lock();
        let mut seq = self.next_seq();
        // After wrap-around a very old Call may still hold this seq.
        while pending.contains_key(&seq) {
            seq = self.next_seq();
        }
        msg.seq = seq;
        let cmd = Arc::new(CallCmd::new(msg, notify));
        pending.insert(seq, cmd.clone());
        cmd
    }

    pub(crate) fn take_pending(&self, seq: i32) -> Option<Arc<CallCmd>> {
        self.pending.lock().remove(&seq)
    }

    fn take_pending_cmd(&self, cmd: &Arc<CallCmd>) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(&cmd.seq()) {
            Some(stored) if Arc::ptr_eq(stored, cmd) => {
                pending.remove(&cmd.seq());
                true
            }
            _ => false,
        }
    }

    async fn fail_call(&self, cmd: &Arc<CallCmd>, status: Status) {
        if self.take_pending_cmd(cmd) {
            cmd.cancel(status).await;
        }
    }

    async fn sweep_pending(&self, status: Status) {
        let cmds: Vec<Arc<CallCmd>> = self.pending.lock().drain().map(|(_, c)| c).collect();
        if !cmds.is_empty() {
            debug!(session_id = %self.id(), count = cmds.len(), "cancelling pending calls");
        }
        for cmd in cmds {
            cmd.cancel(status.clone()).await;
        }
    }

    /// Sends a Call and returns once it is on the wire or has failed. The
    /// returned command is resolved by the Reply, a disconnect, or the write
    /// failure itself.
    pub async fn async_call<A>(
        self: &Arc<Self>,
        service_method: &str,
        arg: &A,
        notify: Option<CallNotify>,
        settings: &[MessageSetting],
    ) -> Arc<CallCmd>
    where
        A: Serialize + ?Sized,
    {
        let _launch = self.call_launches.token();
        let mut msg = self.new_output(MessageType::Call, service_method, settings);
        let body = serde_json::to_value(arg);
        let cmd = self.register(&mut msg, notify);

        match body {
            Ok(value) => msg.body = Body::Value(value),
            Err(e) => {
                self.fail_call(&cmd, Status::bad_message(e.to_string())).await;
                return cmd;
            }
        }
        if let Err(status) = self.core.plugins.before_write_call(self, &mut msg).await {
            self.fail_call(&cmd, status).await;
            return cmd;
        }

        let mut redialed = false;
        loop {
            match self.write_message(&mut msg).await {
                Ok(()) => break,
                Err(status)
                    if status.code() == CODE_CONN_CLOSED && !redialed && self.can_redial() =>
                {
                    redialed = true;
                    // Held out of the table so the disconnect sweep skips it.
                    if !self.take_pending_cmd(&cmd) {
                        return cmd;
                    }
                    if !self.recover(status.cause().map(str::to_string)).await {
                        cmd.cancel(status).await;
                        return cmd;
                    }
                    self.pending.lock().insert(cmd.seq(), cmd.clone());
                }
                Err(status) => {
                    self.fail_call(&cmd, status).await;
                    return cmd;
                }
            }
        }

        if let Err(status) = self.core.plugins.after_write_call(self, &msg).await {
            debug!(seq = msg.seq, %status, "after_write_call failed");
        }
        cmd
    }

    /// Sends a Call and waits for its Reply, bounded by the call deadline.
    pub async fn call<A, R>(
        self: &Arc<Self>,
        service_method: &str,
        arg: &A,
        settings: &[MessageSetting],
    ) -> Result<R, Status>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let cmd = self.async_call(service_method, arg, None, settings).await;
        self.wait(&cmd).await;
        cmd.reply::<R>().await
    }

    /// Like [`Session::call`] but returns the command, with reply meta and
    /// timing, instead of only the decoded result.
    pub async fn call_cmd<A>(
        self: &Arc<Self>,
        service_method: &str,
        arg: &A,
        settings: &[MessageSetting],
    ) -> Arc<CallCmd>
    where
        A: Serialize + ?Sized,
    {
        let cmd = self.async_call(service_method, arg, None, settings).await;
        self.wait(&cmd).await;
        cmd
    }

    async fn wait(&self, cmd: &Arc<CallCmd>) {
        let Some(deadline) = cmd.deadline() else {
            cmd.done().await;
            return;
        };
        if tokio::time::timeout_at(deadline.into(), cmd.done())
            .await
            .is_ok()
        {
            return;
        }
        if self.take_pending_cmd(cmd) {
            cmd.cancel(Status::handle_timeout(format!(
                "no reply to {} before the deadline",
                cmd.service_method()
            )))
            .await;
        }
        // Otherwise the reply path or the sweep owns it and is finishing.
        cmd.done().await;
    }

    /// Sends a Push. No reply is expected.
    pub async fn push<A>(
        self: &Arc<Self>,
        service_method: &str,
        arg: &A,
        settings: &[MessageSetting],
    ) -> Result<(), Status>
    where
        A: Serialize + ?Sized,
    {
        let _launch = self.call_launches.token();
        let mut msg = self.new_output(MessageType::Push, service_method, settings);
        msg.seq = self.next_seq();
        msg.body = Body::Value(
            serde_json::to_value(arg).map_err(|e| Status::bad_message(e.to_string()))?,
        );
        self.core.plugins.before_write_push(self, &mut msg).await?;

        if let Err(status) = self.write_message(&mut msg).await {
            if status.code() != CODE_CONN_CLOSED
                || !self.can_redial()
                || !self.recover(status.cause().map(str::to_string)).await
            {
                return Err(status);
            }
            self.write_message(&mut msg).await?;
        }

        if let Err(status) = self.core.plugins.after_write_push(self, &msg).await {
            debug!(seq = msg.seq, %status, "after_write_push failed");
        }
        Ok(())
    }

    /// Marks the session usable and starts reading.
    pub(crate) fn start(self: &Arc<Self>) -> bool {
        if !self.state.transition(SessionState::Preparing, SessionState::Ok) {
            return false;
        }
        self.core.hub.insert(self.clone());
        self.spawn_read_loop();

        if let Some(age) = self.core.config.session_age() {
            let weak = Arc::downgrade(self);
            let expires = self.created + age;
            tokio::spawn(async move {
                tokio::time::sleep_until(expires.into()).await;
                if let Some(session) = weak.upgrade() {
                    if session.state() == SessionState::Ok {
                        info!(session_id = %session.id(), "session reached its max age");
                        session.close().await;
                    }
                }
            });
        }
        true
    }

    fn spawn_read_loop(self: &Arc<Self>) {
        let (epoch, cancel) = {
            let mut conn = self.conn.lock();
            conn.epoch += 1;
            conn.cancel = CancellationToken::new();
            (conn.epoch, conn.cancel.clone())
        };
        let session = self.clone();
        tokio::spawn(async move { session.read_loop(epoch, cancel).await });
    }

    async fn read_loop(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        let core = self.core.clone();
        let reason = loop {
            if cancel.is_cancelled() || !self.state().is_reading() {
                return;
            }
            if let Err(status) = core.plugins.before_read_header(&self).await {
                break Some(format!("before_read_header: {status}"));
            }

            let mut ex = core.pool.get();
            let read = tokio::select! {
                _ = cancel.cancelled() => None,
                read = self.socket.read_message(ex.input_mut()) => Some(read),
            };
            let Some(read) = read else {
                core.pool.put(ex);
                return;
            };
            if let Err(e) = read {
                core.pool.put(ex);
                if cancel.is_cancelled() || !self.state().is_reading() {
                    return;
                }
                if e.is_disconnect() {
                    debug!(session_id = %self.id(), error = %e, "peer disconnected");
                } else {
                    warn!(session_id = %self.id(), error = %e, "unreadable frame, closing");
                }
                break Some(e.to_string());
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = core.handler_permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                core.pool.put(ex);
                return;
            };

            ex.bind(self.clone());
            let task_core = core.clone();
            self.handler_tasks.spawn(async move {
                let _permit = permit;
                if let Err(payload) = AssertUnwindSafe(ex.serve()).catch_unwind().await {
                    error!(panic = %panic_message(&*payload), "exchange panicked");
                }
                task_core.pool.put(ex);
            });
        };
        self.passive_close(Some(epoch), reason).await;
    }

    /// Reacts to a lost connection: cancels pending Calls and redials if this
    /// is a client session. `epoch` identifies the connection that failed;
    /// `None` means the current one.
    async fn passive_close(self: &Arc<Self>, epoch: Option<u64>, reason: Option<String>) {
        let _redial_guard = match self.redialer {
            Some(_) => Some(self.redial_lock.lock().await),
            None => None,
        };
        {
            let conn = self.conn.lock();
            if epoch.is_some_and(|e| e != conn.epoch) {
                return;
            }
            if !self
                .state
                .transition(SessionState::Ok, SessionState::PassiveClosing)
            {
                return;
            }
            conn.cancel.cancel();
        }
        info!(
            session_id = %self.id(),
            reason = reason.as_deref().unwrap_or(""),
            "session disconnected"
        );

        self.core.hub.remove(self);
        self.sweep_pending(Status::conn_closed(reason.clone())).await;
        self.socket.close().await;

        self.handler_tasks.close();
        if tokio::time::timeout(self.core.config.shutdown_timeout(), self.handler_tasks.wait())
            .await
            .is_err()
        {
            warn!(session_id = %self.id(), "handlers still running after disconnect");
        }
        self.handler_tasks.reopen();

        if self.redialer.is_some() && self.redial_locked().await {
            return;
        }
        self.state
            .transition(SessionState::PassiveClosing, SessionState::PassiveClosed);
        if let Err(status) = self.core.plugins.after_disconnect(self).await {
            debug!(session_id = %self.id(), %status, "after_disconnect failed");
        }
    }

    /// Brings a dropped client session back. True when it is usable again.
    async fn recover(self: &Arc<Self>, reason: Option<String>) -> bool {
        if self.redialer.is_none() {
            return false;
        }
        match self.state() {
            SessionState::Ok => self.passive_close(None, reason).await,
            SessionState::PassiveClosed => {
                let _guard = self.redial_lock.lock().await;
                self.redial_locked().await;
            }
            _ => {}
        }
        let _guard = self.redial_lock.lock().await;
        self.state() == SessionState::Ok
    }

    /// Caller holds `redial_lock`.
    async fn redial_locked(self: &Arc<Self>) -> bool {
        let Some(redialer) = &self.redialer else {
            return false;
        };
        if self
            .state
            .transition_any(
                &[SessionState::PassiveClosing, SessionState::PassiveClosed],
                SessionState::Redialing,
            )
            .is_none()
        {
            return self.state() == SessionState::Ok;
        }

        let mut attempt: i32 = 0;
        while redialer.times < 0 || attempt < redialer.times {
            if attempt > 0 {
                tokio::time::sleep(redialer.interval).await;
            }
            attempt = attempt.saturating_add(1);
            if self.core.shutdown.is_cancelled() {
                break;
            }

            match dialer::dial_stream(&self.core, &redialer.addr, true).await {
                Ok(conn) => {
                    self.socket
                        .reset(conn.stream, conn.local_addr, conn.remote_addr)
                        .await;
                    if let Err(status) = self.core.plugins.after_dial(self, true).await {
                        warn!(session_id = %self.id(), attempt, %status, "redial rejected by plugin");
                        self.socket.close().await;
                        let _ = self.core.plugins.after_dial_fail(&redialer.addr, &status, true).await;
                        continue;
                    }
                    if !self.state.transition(SessionState::Redialing, SessionState::Ok) {
                        return false;
                    }
                    self.core.hub.insert(self.clone());
                    self.spawn_read_loop();
                    info!(session_id = %self.id(), attempt, addr = %redialer.addr, "redialed");
                    return true;
                }
                Err(status) => {
                    warn!(session_id = %self.id(), attempt, %status, "redial failed");
                    let _ = self.core.plugins.after_dial_fail(&redialer.addr, &status, true).await;
                }
            }
        }

        self.state
            .transition(SessionState::Redialing, SessionState::RedialFailed);
        self.state
            .transition(SessionState::RedialFailed, SessionState::PassiveClosed);
        false
    }

    /// Graceful shutdown. Drains in-flight work, then closes the connection.
    /// Only the first call does anything.
    pub async fn close(self: &Arc<Self>) {
        if self
            .state
            .transition_any(
                &[SessionState::Ok, SessionState::Preparing],
                SessionState::ActiveClosing,
            )
            .is_none()
        {
            return;
        }
        debug!(session_id = %self.id(), "session closing");
        self.core.hub.remove(self);

        self.call_launches.close();
        self.handler_tasks.close();
        let drain = async {
            self.call_launches.wait().await;
            self.handler_tasks.wait().await;
        };
        if tokio::time::timeout(self.core.config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            warn!(session_id = %self.id(), "close timed out waiting for in-flight work");
        }

        self.state
            .transition(SessionState::ActiveClosing, SessionState::ActiveClosed);
        self.conn.lock().cancel.cancel();
        self.socket.close().await;
        self.sweep_pending(Status::conn_closed(Some("session closed".into())))
            .await;
        if let Err(status) = self.core.plugins.after_disconnect(self).await {
            debug!(session_id = %self.id(), %status, "after_disconnect failed");
        }
        info!(session_id = %self.id(), "session closed");
    }

    fn decode_body(&self, msg: &mut Message) -> Result<Value, Status> {
        match std::mem::take(&mut msg.body) {
            Body::Empty => Ok(Value::Null),
            Body::Value(v) => Ok(v),
            Body::Encoded(bytes) => self
                .core
                .proto_ctx
                .codecs
                .unmarshal(msg.body_codec, &bytes)
                .map_err(|e| Status::bad_message(e.to_string())),
        }
    }

    async fn read_direct(&self, msg: &mut Message, deadline: Option<Instant>) -> Result<(), Status> {
        let read = match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(deadline.into(), self.socket.read_message(msg))
                    .await
                    .map_err(|_| Status::handle_timeout("no auth message before the deadline"))?
            }
            None => self.socket.read_message(msg).await,
        };
        read.map_err(|e| Status::conn_closed(Some(e.to_string())))
    }

    /// Client side of the handshake. Only valid before the session starts
    /// serving, typically from an `after_dial` hook.
    pub async fn auth_call<A, R>(
        &self,
        service_method: &str,
        arg: &A,
        settings: &[MessageSetting],
    ) -> Result<R, Status>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut msg = self.new_output(MessageType::AuthCall, service_method, settings);
        msg.seq = self.next_seq();
        msg.body = Body::Value(
            serde_json::to_value(arg).map_err(|e| Status::bad_message(e.to_string()))?,
        );
        self.write_message(&mut msg).await?;

        let mut reply = Message::default();
        self.read_direct(&mut reply, msg.deadline).await?;
        if reply.mtype != MessageType::AuthReply || reply.seq != msg.seq {
            return Err(Status::mtype_not_allowed(format!(
                "expected AUTH_REPLY seq={}, got {} seq={}",
                msg.seq, reply.mtype, reply.seq
            )));
        }
        reply.status.remap_from_peer();
        if !reply.status.is_ok() {
            return Err(reply.status);
        }
        let value = self.decode_body(&mut reply)?;
        serde_json::from_value(value).map_err(|e| Status::bad_message(e.to_string()))
    }

    /// Server side: reads the peer's authentication request. Any other
    /// message type is rejected.
    pub async fn auth_receive<T: DeserializeOwned>(&self) -> Result<AuthRequest<T>, Status> {
        let deadline = self
            .core
            .config
            .context_age()
            .map(|age| Instant::now() + age);
        let mut msg = Message::default();
        self.read_direct(&mut msg, deadline).await?;
        if msg.mtype != MessageType::AuthCall {
            return Err(Status::mtype_not_allowed(format!(
                "expected AUTH_CALL, got {}",
                msg.mtype
            )));
        }
        let value = self.decode_body(&mut msg)?;
        let body = serde_json::from_value(value).map_err(|e| Status::bad_message(e.to_string()))?;
        Ok(AuthRequest {
            seq: msg.seq,
            service_method: msg.service_method,
            meta: msg.meta,
            body,
        })
    }

    /// Answers an [`AuthRequest`]. A non-OK `status` is sent without a body.
    pub async fn auth_reply<R>(&self, seq: i32, reply: &R, status: Status) -> Result<(), Status>
    where
        R: Serialize + ?Sized,
    {
        let mut msg = self.new_output(MessageType::AuthReply, "", &[]);
        msg.seq = seq;
        if status.is_ok() {
            msg.body = Body::Value(
                serde_json::to_value(reply).map_err(|e| Status::bad_message(e.to_string()))?,
            );
        }
        msg.status = status;
        self.write_message(&mut msg).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}
