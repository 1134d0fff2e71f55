//! The unit exchanged over a session: header fields plus a lazily decoded body.

use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};

use crate::codec::NIL_CODEC_ID;
use crate::error::ProtoError;
use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Push = 3,
    AuthCall = 4,
    AuthReply = 5,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Call => "CALL",
            MessageType::Reply => "REPLY",
            MessageType::Push => "PUSH",
            MessageType::AuthCall => "AUTH_CALL",
            MessageType::AuthReply => "AUTH_REPLY",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Call),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Push),
            4 => Ok(MessageType::AuthCall),
            5 => Ok(MessageType::AuthReply),
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered metadata pairs. Keys may repeat; `set` replaces the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pairs: Vec<(String, String)>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `application/x-www-form-urlencoded` form used on the wire.
    pub fn encode(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish()
    }

    pub fn decode(data: &[u8]) -> Self {
        Self {
            pairs: url::form_urlencoded::parse(data).into_owned().collect(),
        }
    }
}

/// Message body in one of its lifecycle forms.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    /// Decoded value, ready for a handler or a caller.
    Value(Value),
    /// Raw bytes as they came off the wire, not yet decoded.
    Encoded(Bytes),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Value(Value::Null) => true,
            Body::Value(_) => false,
            Body::Encoded(b) => b.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub seq: i32,
    pub mtype: MessageType,
    pub service_method: String,
    pub status: Status,
    pub meta: Meta,
    pub body_codec: u8,
    pub body: Body,
    pub xfer_pipe: Vec<u8>,
    /// Frame size computed by the last pack or unpack.
    pub size: u32,
    /// Local deadline for writing (outbound) or handling (inbound); never sent.
    pub deadline: Option<Instant>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            seq: 0,
            mtype: MessageType::Call,
            service_method: String::new(),
            status: Status::ok(),
            meta: Meta::new(),
            body_codec: NIL_CODEC_ID,
            body: Body::Empty,
            xfer_pipe: Vec::new(),
            size: 0,
            deadline: None,
        }
    }
}

impl Message {
    pub fn new(mtype: MessageType, service_method: impl Into<String>, seq: i32) -> Self {
        Self {
            mtype,
            service_method: service_method.into(),
            seq,
            ..Self::default()
        }
    }

    /// Clears every field so the message can be reused.
    pub fn reset(&mut self) {
        self.seq = 0;
        self.mtype = MessageType::Call;
        self.service_method.clear();
        self.status = Status::ok();
        self.meta.clear();
        self.body_codec = NIL_CODEC_ID;
        self.body = Body::Empty;
        self.xfer_pipe.clear();
        self.size = 0;
        self.deadline = None;
    }

    /// Service method without its query string.
    pub fn path(&self) -> &str {
        match self.service_method.split_once('?') {
            Some((path, _)) => path,
            None => &self.service_method,
        }
    }

    pub fn query(&self) -> Vec<(String, String)> {
        match self.service_method.split_once('?') {
            Some((_, q)) => url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn apply(&mut self, settings: &[MessageSetting]) {
        for setting in settings {
            setting.apply(self);
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seq={} method={} size={}",
            self.mtype, self.seq, self.service_method, self.size
        )
    }
}

/// Per-message option applied before the message is written.
#[derive(Debug, Clone)]
pub enum MessageSetting {
    Meta(String, String),
    BodyCodec(u8),
    XferPipe(Vec<u8>),
    Timeout(Duration),
    Deadline(Instant),
}

impl MessageSetting {
    pub fn meta(key: impl Into<String>, value: impl Into<String>) -> Self {
        MessageSetting::Meta(key.into(), value.into())
    }

    fn apply(&self, msg: &mut Message) {
        match self {
            MessageSetting::Meta(k, v) => msg.meta.set(k.clone(), v.clone()),
            MessageSetting::BodyCodec(id) => msg.body_codec = *id,
            MessageSetting::XferPipe(ids) => msg.xfer_pipe.extend_from_slice(ids),
            MessageSetting::Timeout(d) => msg.deadline = Some(Instant::now() + *d),
            MessageSetting::Deadline(at) => msg.deadline = Some(*at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meta_keeps_order_and_encodes() {
        let mut meta = Meta::new();
        meta.set("b", "2");
        meta.set("a", "x y&z");
        meta.set("b", "3");
        let encoded = meta.encode();
        assert_eq!(encoded, "b=3&a=x+y%26z");
        assert_eq!(Meta::decode(encoded.as_bytes()), meta);
    }

    #[test]
    fn test_path_and_query() {
        let msg = Message::new(MessageType::Call, "/math/add?scale=2&x=a", 1);
        assert_eq!(msg.path(), "/math/add");
        assert_eq!(
            msg.query(),
            vec![("scale".into(), "2".into()), ("x".into(), "a".into())]
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut msg = Message::new(MessageType::Push, "/a", 9);
        msg.apply(&[
            MessageSetting::meta("k", "v"),
            MessageSetting::BodyCodec(b'j'),
            MessageSetting::XferPipe(vec![1, 2]),
            MessageSetting::Timeout(Duration::from_secs(1)),
        ]);
        msg.body = Body::Value(json!(1));
        msg.status = Status::internal("x");
        msg.size = 99;
        msg.reset();
        assert_eq!(msg.seq, 0);
        assert!(msg.service_method.is_empty());
        assert!(msg.meta.is_empty());
        assert!(msg.xfer_pipe.is_empty());
        assert!(msg.body.is_empty());
        assert!(msg.status.is_ok());
        assert_eq!(msg.size, 0);
        assert!(msg.deadline.is_none());
    }

    #[test]
    fn test_unknown_type_byte() {
        assert!(MessageType::try_from(9).is_err());
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Reply);
    }
}
