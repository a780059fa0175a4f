//! Length-prefixed frame codec for tokio streams.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{ContentType, Frame};

/// Hard cap on a single frame; larger frames indicate a corrupt stream.
/// Full data-state re-seeds are the largest legitimate frames.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Encodes/decodes [`Frame`]s. Any malformed input is a hard error; the
/// channel owner closes the connection and the router reconnects.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

fn proto_err(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(proto_err(format!(
                "frame of {frame_len} bytes exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if src.len() < LEN_PREFIX + frame_len {
            src.reserve(LEN_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let mut payload = src.split_to(frame_len);

        if payload.remaining() < 8 {
            return Err(proto_err("frame too short for content type and header count"));
        }
        let raw_type = payload.get_u32();
        let content_type = ContentType::from_u32(raw_type)
            .ok_or_else(|| proto_err(format!("unknown content type {raw_type}")))?;

        let header_count = payload.get_u32() as usize;
        let mut headers = std::collections::HashMap::with_capacity(header_count);
        for _ in 0..header_count {
            if payload.remaining() < 8 {
                return Err(proto_err("truncated frame header"));
            }
            let key = payload.get_i32();
            let value_len = payload.get_u32() as usize;
            if payload.remaining() < value_len {
                return Err(proto_err("truncated frame header value"));
            }
            headers.insert(key, payload.split_to(value_len).to_vec());
        }

        Ok(Some(Frame {
            content_type,
            headers,
            body: Bytes::from(payload.to_vec()),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let headers_len: usize = frame.headers.values().map(|v| 8 + v.len()).sum();
        let frame_len = 8 + headers_len + frame.body.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(proto_err(format!(
                "refusing to encode {frame_len}-byte frame, maximum is {MAX_FRAME_SIZE}"
            )));
        }

        dst.reserve(LEN_PREFIX + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u32(frame.content_type as u32);
        dst.put_u32(frame.headers.len() as u32);
        for (key, value) in &frame.headers {
            dst.put_i32(*key);
            dst.put_u32(value.len() as u32);
            dst.put_slice(value);
        }
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::header;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::new(ContentType::Route, b"{\"circuit_id\":\"c1\"}".to_vec())
            .with_correlation_id(7)
            .with_header(header::INITIATOR_LOCAL_ADDR, b"tcp:0.0.0.0:1".to_vec());
        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_input_yields_none() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(ContentType::Heartbeat, b"x".to_vec()), &mut buf)
            .unwrap();
        // Feed all but the last byte.
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn unknown_content_type_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_u32(9999); // not a content type
        buf.put_u32(0);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn decodes_multiple_frames_from_one_buffer() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(ContentType::Heartbeat, b"1".to_vec()), &mut buf)
            .unwrap();
        codec
            .encode(Frame::new(ContentType::HeartbeatResponse, b"2".to_vec()), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.content_type, ContentType::Heartbeat);
        assert_eq!(second.content_type, ContentType::HeartbeatResponse);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
