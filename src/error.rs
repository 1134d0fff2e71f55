use std::io;
use thiserror::Error;

use crate::status::Status;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Status {0}")]
    Status(Status),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Dial timed out after {0}ms")]
    DialTimeout(u64),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Transport closed")]
    Closed,

    #[error("Write timed out")]
    WriteTimeout,
}

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Message too large: {size} bytes exceeds limit {max}")]
    TooLarge { size: u64, max: u32 },

    #[error("Message too short: {0} bytes")]
    TooShort(u32),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Field '{field}' is {len} bytes, limit {max}")]
    FieldOverflow {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported codec id: {0}")]
    UnknownId(u8),

    #[error("Unsupported codec name: {0}")]
    UnknownName(String),

    #[error("Marshal failed for {codec}: {reason}")]
    Marshal { codec: &'static str, reason: String },

    #[error("Unmarshal failed for {codec}: {reason}")]
    Unmarshal { codec: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Unsupported transfer filter id: {0}")]
    UnknownId(u8),

    #[error("Transfer filter chain too long: {0} (max 255)")]
    ChainTooLong(usize),

    #[error("Transfer filter '{name}' failed: {reason}")]
    Failed { name: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin '{0}' is already registered")]
    Duplicate(String),

    #[error("Plugin name must not be empty")]
    EmptyName,

    #[error("Plugin '{plugin}' failed at {hook}: {reason}")]
    HookFailed {
        plugin: String,
        hook: &'static str,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate codec id: {0}")]
    DuplicateCodecId(u8),

    #[error("Duplicate codec name: {0}")]
    DuplicateCodecName(String),

    #[error("Duplicate transfer filter id: {0}")]
    DuplicateFilterId(u8),

    #[error("Duplicate route: {0}")]
    DuplicateRoute(String),

    #[error("Invalid route path: {0:?}")]
    InvalidPath(String),
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        RpcError::Status(status)
    }
}

impl ProtoError {
    /// True when the underlying stream is gone rather than the frame being bad.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtoError::Io(e) => is_disconnect_io(e),
            _ => false,
        }
    }
}

pub(crate) fn is_disconnect_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
