//! Body codecs and the registry that resolves them by id or name.
//!
//! Bodies travel through the core as `serde_json::Value`; a codec only decides
//! how that value becomes bytes on the wire.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CodecError, RegistryError};

/// Codec id meaning "no body".
pub const NIL_CODEC_ID: u8 = 0;
pub const JSON_CODEC_ID: u8 = b'j';
pub const PLAIN_CODEC_ID: u8 = b's';

pub trait Codec: Send + Sync + 'static {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError>;
    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError>;
}

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn id(&self) -> u8 {
        JSON_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Marshal {
                codec: "json",
                reason: e.to_string(),
            })
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError> {
        if data.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(data).map_err(|e| CodecError::Unmarshal {
            codec: "json",
            reason: e.to_string(),
        })
    }
}

/// Plain text: strings go out verbatim, anything else as its JSON text.
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn id(&self) -> u8 {
        PLAIN_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "plain"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        Ok(match value {
            Value::Null => Bytes::new(),
            Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
            other => Bytes::from(other.to_string()),
        })
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError> {
        std::str::from_utf8(data)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| CodecError::Unmarshal {
                codec: "plain",
                reason: e.to_string(),
            })
    }
}

/// Explicit codec registry, built at startup and shared by `Arc`.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    by_id: HashMap<u8, Arc<dyn Codec>>,
    by_name: HashMap<&'static str, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the JSON and plain codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // Fresh registry, ids are distinct.
        let _ = registry.register(Arc::new(JsonCodec));
        let _ = registry.register(Arc::new(PlainCodec));
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Result<(), RegistryError> {
        if codec.id() == NIL_CODEC_ID || self.by_id.contains_key(&codec.id()) {
            return Err(RegistryError::DuplicateCodecId(codec.id()));
        }
        if self.by_name.contains_key(codec.name()) {
            return Err(RegistryError::DuplicateCodecName(codec.name().to_string()));
        }
        self.by_id.insert(codec.id(), codec.clone());
        self.by_name.insert(codec.name(), codec);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<Arc<dyn Codec>, CodecError> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or(CodecError::UnknownId(id))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Codec>, CodecError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::UnknownName(name.to_string()))
    }

    /// Encodes `value`; `NIL_CODEC_ID` or `Value::Null` produce an empty body.
    pub fn marshal(&self, id: u8, value: &Value) -> Result<Bytes, CodecError> {
        if id == NIL_CODEC_ID {
            return Ok(Bytes::new());
        }
        self.get(id)?.marshal(value)
    }

    pub fn unmarshal(&self, id: u8, data: &[u8]) -> Result<Value, CodecError> {
        if id == NIL_CODEC_ID {
            return Ok(Value::Null);
        }
        self.get(id)?.unmarshal(data)
    }
}
