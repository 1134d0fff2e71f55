//! Correlation record for one outbound Call.

use parking_lot::Mutex as SyncMutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};

use crate::message::{Message, Meta};
use crate::status::Status;

/// Channel an async caller can hand in to be told when a Call finishes.
pub type CallNotify = mpsc::UnboundedSender<Arc<CallCmd>>;

/// Result side of a Call, filled by whoever resolves it.
#[derive(Debug, Default)]
pub struct CallState {
    pub(crate) status: Status,
    pub(crate) reply: Option<Value>,
    pub(crate) input_meta: Meta,
    pub(crate) input_body_codec: u8,
}

pub struct CallCmd {
    seq: i32,
    service_method: String,
    meta: Meta,
    start: Instant,
    deadline: Option<Instant>,
    state: Arc<Mutex<CallState>>,
    done: watch::Sender<bool>,
    notify: Option<CallNotify>,
    finished: SyncMutex<Option<Instant>>,
}

impl CallCmd {
    pub(crate) fn new(output: &Message, notify: Option<CallNotify>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            seq: output.seq,
            service_method: output.service_method.clone(),
            meta: output.meta.clone(),
            start: Instant::now(),
            deadline: output.deadline,
            state: Arc::new(Mutex::new(CallState::default())),
            done,
            notify,
            finished: SyncMutex::new(None),
        }
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Metadata sent with the Call.
    pub fn output_meta(&self) -> &Meta {
        &self.meta
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Time from creation to resolution, or to now while still pending.
    pub fn cost(&self) -> Duration {
        match *self.finished.lock() {
            Some(at) => at.duration_since(self.start),
            None => self.start.elapsed(),
        }
    }

    /// Waits until the Call is resolved.
    pub async fn done(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub async fn status(&self) -> Status {
        self.state.lock().await.status.clone()
    }

    /// Metadata carried by the Reply.
    pub async fn input_meta(&self) -> Meta {
        self.state.lock().await.input_meta.clone()
    }

    pub async fn input_body_codec(&self) -> u8 {
        self.state.lock().await.input_body_codec
    }

    /// Waits for the Call and returns the decoded reply or its failure status.
    pub async fn reply<T: DeserializeOwned>(&self) -> Result<T, Status> {
        let value = self.reply_value().await?;
        serde_json::from_value(value)
            .map_err(|e| Status::bad_message(format!("decode reply of {}: {e}", self.service_method)))
    }

    pub async fn reply_value(&self) -> Result<Value, Status> {
        self.done().await;
        let state = self.state.lock().await;
        if !state.status.is_ok() {
            return Err(state.status.clone());
        }
        Ok(state.reply.clone().unwrap_or(Value::Null))
    }

    /// Lock held by the reply path from body build to hand-off.
    pub(crate) fn state(&self) -> Arc<Mutex<CallState>> {
        self.state.clone()
    }

    /// Fires the done-signal. Returns false if it had already fired.
    pub(crate) fn resolve(self: &Arc<Self>) -> bool {
        if self.done.send_replace(true) {
            return false;
        }
        *self.finished.lock() = Some(Instant::now());
        if let Some(tx) = &self.notify {
            // A dropped receiver just means nobody is listening any more.
            let _ = tx.send(self.clone());
        }
        true
    }

    /// Resolves with `status`. The caller must already own the Call, i.e. have
    /// removed it from the pending table.
    pub(crate) async fn cancel(self: &Arc<Self>, status: Status) {
        if self.is_done() {
            return;
        }
        {
            let mut state = self.state.lock().await;
            state.status = status;
            state.reply = None;
        }
        self.resolve();
    }
}

impl std::fmt::Debug for CallCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCmd")
            .field("seq", &self.seq)
            .field("service_method", &self.service_method)
            .field("done", &self.is_done())
            .finish()
    }
}
