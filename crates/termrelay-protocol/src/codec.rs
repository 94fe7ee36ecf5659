use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::error::ProtocolError;

/// Default upper bound for a single message body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into messages framed as a `u32` big-endian length
/// followed by that many bytes.
///
/// Decoding is incremental: a message split across reads is buffered until
/// complete, and several messages in one read come out one by one. A length
/// above the limit ends the stream with [`ProtocolError::FrameTooLarge`].
#[derive(Debug)]
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
}

impl MessageCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            inner,
            max_frame_bytes,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn map_err(&self, err: std::io::Error) -> ProtocolError {
        let too_large = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_large {
            ProtocolError::FrameTooLarge {
                max_bytes: self.max_frame_bytes,
            }
        } else {
            ProtocolError::Io(err)
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        match self.inner.decode(src) {
            Ok(message) => Ok(message.map(BytesMut::freeze)),
            Err(e) => Err(self.map_err(e)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        match self.inner.decode_eof(src) {
            Ok(message) => Ok(message.map(BytesMut::freeze)),
            Err(e) => Err(self.map_err(e)),
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = item.len();
        self.inner.encode(item, dst).map_err(|e| {
            if len > self.max_frame_bytes {
                ProtocolError::FrameTooLarge {
                    max_bytes: self.max_frame_bytes,
                }
            } else {
                ProtocolError::Io(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{InboundFrame, WindowSize};
    use crate::preamble;

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_preamble_and_frames_in_one_read() {
        let mut wire = framed(&preamble::encode("abcdefghij"));
        wire.extend(framed(b"\x00ls\n"));
        wire.extend(framed(b""));
        wire.extend(framed(&[0x01, 0x00, 0x50, 0x00, 0x18]));

        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&wire[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(preamble::decode(&first).unwrap(), "abcdefghij");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            InboundFrame::decode(second).unwrap(),
            InboundFrame::Input(Bytes::from_static(b"ls\n"))
        );

        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(InboundFrame::decode(third).unwrap(), InboundFrame::Keepalive);

        let fourth = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            InboundFrame::decode(fourth).unwrap(),
            InboundFrame::Resize(WindowSize::new(80, 24))
        );

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_message_waits_for_more() {
        let wire = framed(b"\x00hello");
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&wire[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[3..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[7..]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&message[..], b"\x00hello");
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let mut codec = MessageCodec::new(16);
        let mut buf = BytesMut::from(&framed(&[0u8; 17])[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max_bytes: 16 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_message_at_limit_is_accepted() {
        let mut codec = MessageCodec::new(16);
        let mut buf = BytesMut::from(&framed(&[7u8; 16])[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 16);
    }

    #[test]
    fn test_encode_writes_big_endian_length() {
        let mut codec = MessageCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"out"), &mut dst).unwrap();
        codec.encode(Bytes::new(), &mut dst).unwrap();
        assert_eq!(&dst[..], b"\x00\x00\x00\x03out\x00\x00\x00\x00");
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let mut codec = MessageCodec::new(4);
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Bytes::from_static(b"too long"), &mut dst)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max_bytes: 4 }));
    }

    #[test]
    fn test_truncated_stream_at_eof_is_an_error() {
        let wire = framed(b"\x00hello");
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&wire[..6]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
