//! A duplex stream plus the protocol that frames it.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ProtoError;
use crate::message::Message;
use crate::proto::{DynReader, DynWriter, Proto, ProtoContext, ProtoFunc};

/// Anything that can carry frames: TCP, unix sockets, TLS wrappers, in-memory pipes.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IoStream for T {}

pub struct Socket {
    id: RwLock<String>,
    local_addr: RwLock<String>,
    remote_addr: RwLock<String>,
    reader: Mutex<Box<DynReader>>,
    writer: Mutex<Box<DynWriter>>,
    proto: ArcSwap<Box<dyn Proto>>,
    proto_ctx: ProtoContext,
    swap: DashMap<String, Arc<dyn Any + Send + Sync>>,
    closed: AtomicBool,
}

impl Socket {
    pub fn new<S: IoStream>(
        stream: S,
        local_addr: Option<String>,
        remote_addr: Option<String>,
        proto_func: &ProtoFunc,
        proto_ctx: ProtoContext,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let remote_addr = remote_addr.unwrap_or_default();
        let id = if remote_addr.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            remote_addr.clone()
        };
        Self {
            id: RwLock::new(id),
            local_addr: RwLock::new(local_addr.unwrap_or_default()),
            remote_addr: RwLock::new(remote_addr),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            proto: ArcSwap::from_pointee(proto_func(&proto_ctx)),
            proto_ctx,
            swap: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.write() = id.into();
    }

    pub fn local_addr(&self) -> String {
        self.local_addr.read().clone()
    }

    pub fn remote_addr(&self) -> String {
        self.remote_addr.read().clone()
    }

    pub fn proto_version(&self) -> (u8, &'static str) {
        self.proto.load().version()
    }

    /// Replaces the active protocol; takes effect for the next frame.
    pub fn set_proto(&self, proto_func: &ProtoFunc) {
        self.proto.store(Arc::new(proto_func(&self.proto_ctx)));
    }

    pub fn proto_context(&self) -> &ProtoContext {
        &self.proto_ctx
    }

    /// Reads one frame. Only the session read loop calls this.
    pub async fn read_message(&self, msg: &mut Message) -> Result<(), ProtoError> {
        let mut reader = self.reader.lock().await;
        let proto = self.proto.load_full();
        proto.unpack(msg, &mut **reader).await
    }

    /// Writes one frame; concurrent writers are serialized here.
    pub async fn write_message(&self, msg: &mut Message) -> Result<(), ProtoError> {
        if self.is_closed() {
            return Err(ProtoError::Io(std::io::ErrorKind::NotConnected.into()));
        }
        let mut writer = self.writer.lock().await;
        let proto = self.proto.load_full();
        proto.pack(msg, &mut **writer).await
    }

    pub fn swap_insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.swap.insert(key.into(), Arc::new(value));
    }

    pub fn swap_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.swap.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn swap_remove(&self, key: &str) -> bool {
        self.swap.remove(key).is_some()
    }

    pub fn swap_len(&self) -> usize {
        self.swap.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts down the write half; the peer observes EOF.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(socket_id = %self.id(), error = %e, "socket shutdown failed");
        }
    }

    /// Swaps in a fresh stream after a redial. The id is kept, side storage is
    /// cleared.
    pub async fn reset<S: IoStream>(
        &self,
        stream: S,
        local_addr: Option<String>,
        remote_addr: Option<String>,
    ) {
        let (reader, writer) = tokio::io::split(stream);
        let mut r = self.reader.lock().await;
        let mut w = self.writer.lock().await;
        *r = Box::new(reader);
        *w = Box::new(writer);
        if let Some(local) = local_addr {
            *self.local_addr.write() = local;
        }
        if let Some(remote) = remote_addr {
            *self.remote_addr.write() = remote;
        }
        self.swap.clear();
        self.closed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, MessageType};
    use crate::proto::raw_proto_func;
    use bytes::Bytes;

    fn pair() -> (Socket, Socket) {
        let (a, b) = tokio::io::duplex(4096);
        let f = raw_proto_func();
        (
            Socket::new(a, None, Some("peer-b".into()), &f, ProtoContext::default()),
            Socket::new(b, None, None, &f, ProtoContext::default()),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (a, b) = pair();
        let mut out = Message::new(MessageType::Push, "/chat/say", 3);
        out.body = Body::Encoded(Bytes::from_static(b"hello"));
        out.body_codec = b's';
        a.write_message(&mut out).await.unwrap();

        let mut input = Message::default();
        b.read_message(&mut input).await.unwrap();
        assert_eq!(input.service_method, "/chat/say");
        assert_eq!(input.body, Body::Encoded(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_id_defaults() {
        let (a, b) = pair();
        assert_eq!(a.id(), "peer-b");
        // No remote address: a generated id.
        assert_eq!(b.id().len(), 36);
        b.set_id("custom");
        assert_eq!(b.id(), "custom");
    }

    #[tokio::test]
    async fn test_swap_storage_typed() {
        let (a, _b) = pair();
        a.swap_insert("user", String::from("alice"));
        assert_eq!(a.swap_get::<String>("user").as_deref(), Some(&"alice".to_string()));
        assert!(a.swap_get::<u32>("user").is_none());
        assert!(a.swap_remove("user"));
        assert_eq!(a.swap_len(), 0);
    }

    #[tokio::test]
    async fn test_close_is_observed_by_peer_and_blocks_writes() {
        let (a, b) = pair();
        a.close().await;
        let mut input = Message::default();
        let err = b.read_message(&mut input).await.unwrap_err();
        assert!(err.is_disconnect());
        let err = a
            .write_message(&mut Message::new(MessageType::Push, "/x", 1))
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    struct Tagged(crate::proto::RawProto);

    #[async_trait::async_trait]
    impl Proto for Tagged {
        fn version(&self) -> (u8, &'static str) {
            (42, "tagged")
        }

        async fn pack(
            &self,
            msg: &mut Message,
            w: &mut crate::proto::DynWriter,
        ) -> Result<(), ProtoError> {
            self.0.pack(msg, w).await
        }

        async fn unpack(
            &self,
            msg: &mut Message,
            r: &mut crate::proto::DynReader,
        ) -> Result<(), ProtoError> {
            self.0.unpack(msg, r).await
        }
    }

    #[tokio::test]
    async fn test_set_proto_swaps_framing() {
        let (a, b) = pair();
        assert_eq!(a.proto_version(), (6, "raw"));
        let tagged: ProtoFunc = Arc::new(|ctx: &ProtoContext| {
            Box::new(Tagged(crate::proto::RawProto::new(ctx.clone()))) as Box<dyn Proto>
        });
        a.set_proto(&tagged);
        b.set_proto(&tagged);
        assert_eq!(a.proto_version(), (42, "tagged"));

        a.write_message(&mut Message::new(MessageType::Push, "/swapped", 5))
            .await
            .unwrap();
        let mut input = Message::default();
        b.read_message(&mut input).await.unwrap();
        assert_eq!(input.service_method, "/swapped");
    }

    #[tokio::test]
    async fn test_reset_keeps_id_and_clears_swap() {
        let (a, _b) = pair();
        a.swap_insert("k", 1u8);
        a.close().await;
        let (c, d) = tokio::io::duplex(1024);
        a.reset(c, None, Some("peer-d".into())).await;
        assert_eq!(a.id(), "peer-b");
        assert_eq!(a.remote_addr(), "peer-d");
        assert_eq!(a.swap_len(), 0);
        assert!(!a.is_closed());

        let peer = Socket::new(d, None, None, &raw_proto_func(), ProtoContext::default());
        a.write_message(&mut Message::new(MessageType::Push, "/after", 2))
            .await
            .unwrap();
        let mut input = Message::default();
        peer.read_message(&mut input).await.unwrap();
        assert_eq!(input.service_method, "/after");
    }
}
