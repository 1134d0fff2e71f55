//! Wire protocol contract.
//!
//! A protocol turns a whole `Message` into bytes on a stream and back. The
//! session guarantees a single reader per stream and serializes writers, so
//! implementations need no locking of their own.

pub mod raw;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::CodecRegistry;
use crate::error::ProtoError;
use crate::filter::FilterRegistry;
use crate::message::Message;

pub use raw::RawProto;

/// Default frame ceiling: 64 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

pub type DynReader = dyn AsyncRead + Unpin + Send;
pub type DynWriter = dyn AsyncWrite + Unpin + Send;

/// Registries and limits every protocol instance is built with.
#[derive(Clone)]
pub struct ProtoContext {
    pub codecs: Arc<CodecRegistry>,
    pub filters: Arc<FilterRegistry>,
    pub max_message_size: u32,
}

impl ProtoContext {
    pub fn new(codecs: Arc<CodecRegistry>, filters: Arc<FilterRegistry>) -> Self {
        Self {
            codecs,
            filters,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max: u32) -> Self {
        self.max_message_size = max;
        self
    }
}

impl Default for ProtoContext {
    fn default() -> Self {
        Self::new(
            Arc::new(CodecRegistry::with_defaults()),
            Arc::new(FilterRegistry::with_defaults()),
        )
    }
}

#[async_trait]
pub trait Proto: Send + Sync + 'static {
    /// `(id, name)` identifying the framing.
    fn version(&self) -> (u8, &'static str);

    /// Writes `msg` as one frame. Updates `msg.size`.
    async fn pack(&self, msg: &mut Message, w: &mut DynWriter) -> Result<(), ProtoError>;

    /// Reads one frame into `msg`. The body is left encoded.
    async fn unpack(&self, msg: &mut Message, r: &mut DynReader) -> Result<(), ProtoError>;
}

/// Builds a protocol for a new socket.
pub type ProtoFunc = Arc<dyn Fn(&ProtoContext) -> Box<dyn Proto> + Send + Sync>;

pub fn raw_proto_func() -> ProtoFunc {
    Arc::new(|ctx: &ProtoContext| Box::new(RawProto::new(ctx.clone())) as Box<dyn Proto>)
}
