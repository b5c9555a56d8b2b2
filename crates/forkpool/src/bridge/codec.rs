//! Frame format of the worker control channel.
//!
//! Each message is a big-endian u32 byte length followed by that many bytes
//! of JSON. The primary writes `ControlRequest` frames into a worker's stdin
//! and reads `ControlResponse` frames from its stdout, so one codec type per
//! direction: `JsonCodec<ControlRequest>` and `JsonCodec<ControlResponse>`.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Control messages are a few hundred bytes. A bigger length prefix means a
/// worker wrote something other than frames to stdout.
const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Length-prefixed JSON codec for one direction of a control channel.
pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            frames,
            _message: PhantomData,
        }
    }
}

fn invalid_json(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame).map(Some).map_err(invalid_json)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, message: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&message).map_err(invalid_json)?;
        tracing::trace!(frame_bytes = json.len(), "Encoding control frame");
        self.frames.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ControlRequest, ControlResponse};

    #[test]
    fn codec_roundtrip_control_response() {
        let mut codec = JsonCodec::<ControlResponse>::new();
        let mut buf = BytesMut::new();

        let resp = ControlResponse::Exiting {
            code: 0,
            reason: "self-termination requested".to_string(),
        };
        codec.encode(resp, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        match decoded {
            ControlResponse::Exiting { code, reason } => {
                assert_eq!(code, 0);
                assert_eq!(reason, "self-termination requested");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<ControlRequest>::new();
        let mut full = BytesMut::new();
        codec.encode(ControlRequest::Shutdown, &mut full).unwrap();

        let split_at = full.len() - 2;
        let mut buf = BytesMut::from(&full[..split_at]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[split_at..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, ControlRequest::Shutdown));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = JsonCodec::<ControlResponse>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes());
        buf.extend_from_slice(b"{}");

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = JsonCodec::<ControlRequest>::new();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec()
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
