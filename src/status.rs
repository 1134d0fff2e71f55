//! Structured result carried across the wire in place of raw errors.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const CODE_UNKNOWN_ERROR: i32 = -1;
pub const CODE_OK: i32 = 0;
pub const CODE_INVALID_OP: i32 = 1;
pub const CODE_WRONG_CONN: i32 = 100;
pub const CODE_CONN_CLOSED: i32 = 102;
pub const CODE_WRITE_FAILED: i32 = 104;
pub const CODE_DIAL_FAILED: i32 = 105;
pub const CODE_BAD_MESSAGE: i32 = 400;
pub const CODE_UNAUTHORIZED: i32 = 401;
pub const CODE_NOT_FOUND: i32 = 404;
pub const CODE_MTYPE_NOT_ALLOWED: i32 = 405;
pub const CODE_HANDLE_TIMEOUT: i32 = 408;
pub const CODE_CONFLICT: i32 = 409;
pub const CODE_INTERNAL_SERVER_ERROR: i32 = 500;
pub const CODE_BAD_GATEWAY: i32 = 502;

/// Default text for a well-known code.
pub fn code_text(code: i32) -> &'static str {
    match code {
        CODE_OK => "",
        CODE_INVALID_OP => "Invalid Operation",
        CODE_WRONG_CONN => "Wrong Connection",
        CODE_CONN_CLOSED => "Connection Closed",
        CODE_WRITE_FAILED => "Write Failed",
        CODE_DIAL_FAILED => "Dial Failed",
        CODE_BAD_MESSAGE => "Bad Message",
        CODE_UNAUTHORIZED => "Unauthorized",
        CODE_NOT_FOUND => "Not Found",
        CODE_MTYPE_NOT_ALLOWED => "Message Type Not Allowed",
        CODE_HANDLE_TIMEOUT => "Handle Timeout",
        CODE_CONFLICT => "Conflict",
        CODE_INTERNAL_SERVER_ERROR => "Internal Server Error",
        CODE_BAD_GATEWAY => "Bad Gateway",
        _ => "Unknown Error",
    }
}

/// Codes in this range are reserved for local connection failures. A peer
/// that reports one is treated as a misbehaving upstream.
pub fn is_reserved_local_code(code: i32) -> bool {
    code > 99 && code < 200
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
    #[serde(skip)]
    stack: Option<String>,
}

impl Status {
    pub fn new(code: i32, msg: impl Into<String>, cause: Option<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            cause,
            stack: None,
        }
    }

    /// Status with the default text for `code`.
    pub fn from_code(code: i32) -> Self {
        Self::new(code, code_text(code), None)
    }

    pub fn ok() -> Self {
        Self::default()
    }

    pub fn conn_closed(cause: Option<String>) -> Self {
        Self::new(CODE_CONN_CLOSED, code_text(CODE_CONN_CLOSED), cause)
    }

    pub fn write_failed(cause: impl Into<String>) -> Self {
        Self::new(
            CODE_WRITE_FAILED,
            code_text(CODE_WRITE_FAILED),
            Some(cause.into()),
        )
    }

    pub fn dial_failed(cause: impl Into<String>) -> Self {
        Self::new(
            CODE_DIAL_FAILED,
            code_text(CODE_DIAL_FAILED),
            Some(cause.into()),
        )
    }

    pub fn bad_message(cause: impl Into<String>) -> Self {
        Self::new(
            CODE_BAD_MESSAGE,
            code_text(CODE_BAD_MESSAGE),
            Some(cause.into()),
        )
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(
            CODE_NOT_FOUND,
            code_text(CODE_NOT_FOUND),
            Some(format!("{path} is not found")),
        )
    }

    pub fn mtype_not_allowed(cause: impl Into<String>) -> Self {
        Self::new(
            CODE_MTYPE_NOT_ALLOWED,
            code_text(CODE_MTYPE_NOT_ALLOWED),
            Some(cause.into()),
        )
    }

    pub fn handle_timeout(cause: impl Into<String>) -> Self {
        Self::new(
            CODE_HANDLE_TIMEOUT,
            code_text(CODE_HANDLE_TIMEOUT),
            Some(cause.into()),
        )
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        Self::new(
            CODE_INTERNAL_SERVER_ERROR,
            code_text(CODE_INTERNAL_SERVER_ERROR),
            Some(cause.into()),
        )
    }

    pub fn unauthorized(cause: impl Into<String>) -> Self {
        Self::new(
            CODE_UNAUTHORIZED,
            code_text(CODE_UNAUTHORIZED),
            Some(cause.into()),
        )
    }

    pub fn conflict(cause: impl Into<String>) -> Self {
        Self::new(CODE_CONFLICT, code_text(CODE_CONFLICT), Some(cause.into()))
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn set_code(&mut self, code: i32) {
        self.code = code;
    }

    pub fn set_msg(&mut self, msg: impl Into<String>) {
        self.msg = msg.into();
    }

    pub fn set_cause(&mut self, cause: Option<String>) {
        self.cause = cause;
    }

    /// Records the caller's backtrace; never sent to the peer.
    pub fn with_stack(mut self) -> Self {
        self.stack = Some(std::backtrace::Backtrace::force_capture().to_string());
        self
    }

    /// Status JSON for the wire. An OK status encodes as nothing.
    pub fn to_wire(&self) -> Vec<u8> {
        if self.is_ok() && self.msg.is_empty() && self.cause.is_none() {
            return Vec::new();
        }
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_wire(data: &[u8]) -> Result<Self, serde_json::Error> {
        if data.is_empty() {
            return Ok(Self::ok());
        }
        serde_json::from_slice(data)
    }

    /// Rewrites a reserved local code reported by a peer into `BadGateway`.
    pub(crate) fn remap_from_peer(&mut self) {
        if is_reserved_local_code(self.code) {
            let original = format!("upstream reported code {}: {}", self.code, self.msg);
            self.code = CODE_BAD_GATEWAY;
            self.msg = code_text(CODE_BAD_GATEWAY).to_string();
            self.cause = Some(match self.cause.take() {
                Some(cause) => format!("{original} ({cause})"),
                None => original,
            });
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} msg={:?}", self.code, self.msg)?;
        if let Some(cause) = &self.cause {
            write!(f, " cause={cause:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

impl From<crate::error::RpcError> for Status {
    fn from(e: crate::error::RpcError) -> Self {
        use crate::error::{RpcError, TransportError};
        match e {
            RpcError::Status(s) => s,
            RpcError::Transport(TransportError::Closed) => Status::conn_closed(None),
            RpcError::Transport(t) => Status::dial_failed(t.to_string()),
            RpcError::Codec(c) => Status::bad_message(c.to_string()),
            RpcError::Proto(p) if p.is_disconnect() => Status::conn_closed(Some(p.to_string())),
            RpcError::Proto(p) => Status::bad_message(p.to_string()),
            RpcError::Serialization(s) => Status::bad_message(s.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_status_encodes_empty() {
        let s = Status::ok();
        assert!(s.to_wire().is_empty());
        assert_eq!(Status::from_wire(&[]).unwrap(), Status::ok());
    }

    #[test]
    fn test_wire_round_trip_keeps_code_msg_cause() {
        let s = Status::not_found("/math/mul");
        let decoded = Status::from_wire(&s.to_wire()).unwrap();
        assert_eq!(decoded.code(), CODE_NOT_FOUND);
        assert_eq!(decoded.msg(), "Not Found");
        assert_eq!(decoded.cause(), Some("/math/mul is not found"));
    }

    #[test]
    fn test_stack_is_not_sent() {
        let s = Status::internal("boom").with_stack();
        assert!(s.stack().is_some());
        let decoded = Status::from_wire(&s.to_wire()).unwrap();
        assert!(decoded.stack().is_none());
    }

    #[test]
    fn test_remap_only_reserved_range() {
        let mut s = Status::conn_closed(None);
        s.remap_from_peer();
        assert_eq!(s.code(), CODE_BAD_GATEWAY);
        assert!(s.cause().unwrap().contains("102"));

        for code in [99, 200, 404, 500] {
            let mut s = Status::from_code(code);
            s.remap_from_peer();
            assert_eq!(s.code(), code);
        }
    }

    #[test]
    fn test_clones_do_not_share_cause() {
        let a = Status::write_failed("first");
        let mut b = a.clone();
        b.set_cause(Some("second".into()));
        assert_eq!(a.cause(), Some("first"));
        assert_eq!(b.cause(), Some("second"));
    }
}
