//! Reference framing.
//!
//! ```text
//! [u32 BE total length][u8 N][N filter ids][filtered payload]
//!
//! payload = [u8 seq len][seq, base-36 text]
//!           [u8 message type]
//!           [u8 path len][service method]
//!           [u16 BE status len][status json]
//!           [u16 BE meta len][meta, urlencoded]
//!           [u8 body codec id][body bytes]
//! ```
//!
//! The total length counts its own four bytes.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{DynReader, DynWriter, Proto, ProtoContext};
use crate::error::ProtoError;
use crate::message::{Body, Message, Meta, MessageType};
use crate::status::Status;

pub const RAW_PROTO_ID: u8 = 6;
pub const RAW_PROTO_NAME: &str = "raw";

/// Length prefix plus the filter-count byte.
const MIN_FRAME: u32 = 5;

pub struct RawProto {
    ctx: ProtoContext,
}

impl RawProto {
    pub fn new(ctx: ProtoContext) -> Self {
        Self { ctx }
    }

    /// Builds the complete frame for `msg`, length prefix included.
    pub fn encode(&self, msg: &mut Message) -> Result<Vec<u8>, ProtoError> {
        let payload = self.encode_payload(msg)?;
        let filtered = self.ctx.filters.pack(&msg.xfer_pipe, payload)?;

        let total = 4u64 + 1 + msg.xfer_pipe.len() as u64 + filtered.len() as u64;
        if total > u64::from(self.ctx.max_message_size) {
            return Err(ProtoError::TooLarge {
                size: total,
                max: self.ctx.max_message_size,
            });
        }
        msg.size = total as u32;

        let mut frame = Vec::with_capacity(total as usize);
        frame.extend_from_slice(&msg.size.to_be_bytes());
        frame.push(msg.xfer_pipe.len() as u8);
        frame.extend_from_slice(&msg.xfer_pipe);
        frame.extend_from_slice(&filtered);
        Ok(frame)
    }

    fn encode_payload(&self, msg: &Message) -> Result<Vec<u8>, ProtoError> {
        let seq = format_base36(msg.seq);
        let path = msg.service_method.as_bytes();
        let status = msg.status.to_wire();
        let meta = msg.meta.encode();
        let body = match &msg.body {
            Body::Empty => Bytes::new(),
            Body::Value(value) => self.ctx.codecs.marshal(msg.body_codec, value)?,
            Body::Encoded(bytes) => bytes.clone(),
        };

        check_len("service_method", path.len(), u8::MAX as usize)?;
        check_len("status", status.len(), u16::MAX as usize)?;
        check_len("meta", meta.len(), u16::MAX as usize)?;

        let mut out =
            Vec::with_capacity(1 + seq.len() + 2 + path.len() + 4 + status.len() + meta.len() + 1 + body.len());
        out.push(seq.len() as u8);
        out.extend_from_slice(seq.as_bytes());
        out.push(msg.mtype as u8);
        out.push(path.len() as u8);
        out.extend_from_slice(path);
        out.extend_from_slice(&(status.len() as u16).to_be_bytes());
        out.extend_from_slice(&status);
        out.extend_from_slice(&(meta.len() as u16).to_be_bytes());
        out.extend_from_slice(meta.as_bytes());
        out.push(msg.body_codec);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses a frame without its four-byte length prefix.
    pub fn decode(&self, frame: &[u8], msg: &mut Message) -> Result<(), ProtoError> {
        let mut cur = Cursor::new(frame);
        let n = cur.u8("filter count")? as usize;
        let ids = cur.take(n, "filter ids")?.to_vec();
        let payload = self.ctx.filters.unpack(&ids, cur.rest().to_vec())?;
        msg.xfer_pipe = ids;

        let mut cur = Cursor::new(&payload);
        let seq_len = cur.u8("seq length")? as usize;
        let seq_text = std::str::from_utf8(cur.take(seq_len, "seq")?)
            .map_err(|_| ProtoError::InvalidFrame("seq is not utf-8".into()))?;
        msg.seq = i32::from_str_radix(seq_text, 36)
            .map_err(|_| ProtoError::InvalidFrame(format!("bad seq {seq_text:?}")))?;

        msg.mtype = MessageType::try_from(cur.u8("message type")?)?;

        let path_len = cur.u8("path length")? as usize;
        msg.service_method = std::str::from_utf8(cur.take(path_len, "path")?)
            .map_err(|_| ProtoError::InvalidFrame("service method is not utf-8".into()))?
            .to_string();

        let status_len = cur.u16("status length")? as usize;
        msg.status = Status::from_wire(cur.take(status_len, "status")?)
            .map_err(|e| ProtoError::InvalidFrame(format!("bad status: {e}")))?;

        let meta_len = cur.u16("meta length")? as usize;
        msg.meta = Meta::decode(cur.take(meta_len, "meta")?);

        msg.body_codec = cur.u8("body codec")?;
        let body = cur.rest();
        msg.body = if body.is_empty() {
            Body::Empty
        } else {
            Body::Encoded(Bytes::copy_from_slice(body))
        };
        Ok(())
    }
}

#[async_trait]
impl Proto for RawProto {
    fn version(&self) -> (u8, &'static str) {
        (RAW_PROTO_ID, RAW_PROTO_NAME)
    }

    async fn pack(&self, msg: &mut Message, w: &mut DynWriter) -> Result<(), ProtoError> {
        let frame = self.encode(msg)?;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    async fn unpack(&self, msg: &mut Message, r: &mut DynReader) -> Result<(), ProtoError> {
        let total = r.read_u32().await?;
        if total < MIN_FRAME {
            return Err(ProtoError::TooShort(total));
        }
        if total > self.ctx.max_message_size {
            return Err(ProtoError::TooLarge {
                size: u64::from(total),
                max: self.ctx.max_message_size,
            });
        }
        let mut frame = vec![0u8; (total - 4) as usize];
        r.read_exact(&mut frame).await?;
        msg.size = total;
        self.decode(&frame, msg)
    }
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), ProtoError> {
    if len > max {
        return Err(ProtoError::FieldOverflow { field, len, max });
    }
    Ok(())
}

pub(crate) fn format_base36(seq: i32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if seq == 0 {
        return "0".to_string();
    }
    let mut n = i64::from(seq).unsigned_abs();
    let mut buf = Vec::with_capacity(8);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    if seq < 0 {
        buf.push(b'-');
    }
    buf.reverse();
    // Only ASCII digits, letters and '-' were pushed.
    String::from_utf8(buf).unwrap_or_default()
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ProtoError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ProtoError::InvalidFrame(format!("truncated {what}")))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, ProtoError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, ProtoError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, JSON_CODEC_ID};
    use crate::filter::tests::TagFilter;
    use crate::filter::{FilterRegistry, SHA256_FILTER_ID};
    use serde_json::json;
    use std::sync::Arc;

    fn proto() -> RawProto {
        let mut filters = FilterRegistry::with_defaults();
        filters.register(Arc::new(TagFilter(7))).unwrap();
        RawProto::new(ProtoContext::new(
            Arc::new(CodecRegistry::with_defaults()),
            Arc::new(filters),
        ))
    }

    fn cursor(buf: Vec<u8>) -> Box<DynReader> {
        Box::new(std::io::Cursor::new(buf))
    }

    fn sample(seq: i32, pipe: Vec<u8>) -> Message {
        let mut msg = Message::new(MessageType::Reply, "/math/add?x=1", seq);
        msg.status = Status::not_found("/math/add");
        msg.meta.set("trace", "abc");
        msg.meta.set("user", "a b");
        msg.body_codec = JSON_CODEC_ID;
        msg.body = Body::Value(json!({"sum": 15}));
        msg.xfer_pipe = pipe;
        msg
    }

    async fn round_trip(p: &RawProto, mut msg: Message) -> Message {
        let mut buf: Vec<u8> = Vec::new();
        p.pack(&mut msg, &mut buf).await.unwrap();
        assert_eq!(msg.size as usize, buf.len());
        let mut out = Message::default();
        let mut reader = cursor(buf);
        p.unpack(&mut out, &mut *reader).await.unwrap();
        assert_eq!(out.size, msg.size);
        out
    }

    #[tokio::test]
    async fn test_round_trip_all_header_fields() {
        let p = proto();
        let out = round_trip(&p, sample(42, vec![])).await;
        assert_eq!(out.seq, 42);
        assert_eq!(out.mtype, MessageType::Reply);
        assert_eq!(out.service_method, "/math/add?x=1");
        assert_eq!(out.status, Status::not_found("/math/add"));
        assert_eq!(out.meta.get("user"), Some("a b"));
        assert_eq!(out.meta.get("trace"), Some("abc"));
        assert_eq!(out.body_codec, JSON_CODEC_ID);
        match out.body {
            Body::Encoded(b) => assert_eq!(
                CodecRegistry::with_defaults()
                    .unmarshal(JSON_CODEC_ID, &b)
                    .unwrap(),
                json!({"sum": 15})
            ),
            other => panic!("expected encoded body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_trip_filter_chains_up_to_255() {
        let p = proto();
        for len in [0usize, 1, 2, 17, 128, 255] {
            let pipe: Vec<u8> = (0..len)
                .map(|i| if i % 3 == 0 { SHA256_FILTER_ID } else { 7 })
                .collect();
            let out = round_trip(&p, sample(len as i32, pipe.clone())).await;
            assert_eq!(out.xfer_pipe, pipe);
            assert_eq!(out.seq, len as i32);
            assert_eq!(out.meta.get("trace"), Some("abc"));
        }
    }

    #[tokio::test]
    async fn test_seq_extremes() {
        let p = proto();
        for seq in [0, -1, i32::MIN, i32::MAX, 36, 1295] {
            let out = round_trip(&p, sample(seq, vec![])).await;
            assert_eq!(out.seq, seq);
        }
    }

    #[test]
    fn test_base36_matches_radix_parse() {
        for seq in [0, 1, 35, 36, -36, i32::MAX, i32::MIN] {
            assert_eq!(i32::from_str_radix(&format_base36(seq), 36).unwrap(), seq);
        }
        assert_eq!(format_base36(36), "10");
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_read() {
        let p = RawProto::new(ProtoContext::default().with_max_message_size(1024));
        let mut reader = cursor((4096u32).to_be_bytes().to_vec());
        let mut out = Message::default();
        let err = p.unpack(&mut out, &mut *reader).await.unwrap_err();
        assert!(matches!(err, ProtoError::TooLarge { size: 4096, max: 1024 }));
    }

    #[tokio::test]
    async fn test_pack_enforces_ceiling() {
        let p = RawProto::new(ProtoContext::default().with_max_message_size(64));
        let mut msg = sample(1, vec![]);
        msg.body = Body::Encoded(Bytes::from(vec![0u8; 128]));
        let mut buf: Vec<u8> = Vec::new();
        assert!(matches!(
            p.pack(&mut msg, &mut buf).await,
            Err(ProtoError::TooLarge { .. })
        ));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_invalid() {
        let p = proto();
        let mut msg = sample(3, vec![]);
        let frame = p.encode(&mut msg).unwrap();
        let mut out = Message::default();
        // Drop the body and part of the meta.
        let cut = &frame[4..frame.len() - 30];
        assert!(matches!(
            p.decode(cut, &mut out),
            Err(ProtoError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let p = proto();
        let mut reader = cursor(Vec::new());
        let mut out = Message::default();
        let err = p.unpack(&mut out, &mut *reader).await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
