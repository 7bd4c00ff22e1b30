/// Wire codec — frames a TCP byte stream into protocol records.
///
/// One JSON record per `\n`-terminated line. serde_json escapes control
/// characters inside strings, so the delimiter can never appear inside a
/// well-formed record and binary payloads (base64 fields) pass through
/// unharmed.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{Envelope, Outbound, Reply};

/// Upper bound on a single frame, delimiter included.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Codec error: an oversized frame or an I/O error.
///
/// A line that is complete but does not parse as an [`Envelope`] is NOT an
/// error at this layer — it decodes to [`Inbound::Malformed`] so the server
/// can answer with a bad-request reply and keep the connection open.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds maximum length ({limit} bytes)")]
    FrameTooLong { limit: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Envelope(Envelope),
    /// A complete line that did not parse as an envelope.
    Malformed { error: String },
}

/// Frames newline-delimited JSON envelopes.
#[derive(Debug)]
pub struct WireCodec {
    max_frame_length: usize,
}

impl WireCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for WireCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline_pos = src.iter().position(|&b| b == b'\n');

        match newline_pos {
            Some(pos) => {
                let line = src.split_to(pos);
                src.advance(1); // skip the delimiter

                let frame = match serde_json::from_slice::<Envelope>(&line) {
                    Ok(envelope) => Inbound::Envelope(envelope),
                    Err(e) => Inbound::Malformed {
                        error: e.to_string(),
                    },
                };
                Ok(Some(frame))
            }
            None => {
                if src.len() > self.max_frame_length {
                    return Err(CodecError::FrameTooLong {
                        limit: self.max_frame_length,
                    });
                }
                Ok(None)
            }
        }
    }

    // The default decode_eof reports leftover bytes as an I/O error, which is
    // exactly the clean-close / dirty-close distinction we need: EOF with an
    // empty buffer ends the stream, EOF mid-record surfaces as an error.
}

fn encode_json<T: serde::Serialize>(item: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
    let wire = serde_json::to_vec(item)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    dst.reserve(wire.len() + 1);
    dst.put_slice(&wire);
    dst.put_u8(b'\n');
    Ok(())
}

impl Encoder<Envelope> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_json(&item, dst)
    }
}

impl Encoder<Reply> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_json(&item, dst)
    }
}

impl Encoder<Outbound> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_json(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode_one(codec: &mut WireCodec, buf: &mut BytesMut) -> Inbound {
        codec.decode(buf).unwrap().unwrap()
    }

    #[test]
    fn decode_complete_frame() {
        let mut codec = WireCodec::default();
        let envelope = Envelope::chat("alice", "bob", b"hello".to_vec());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(serde_json::to_string(&envelope).unwrap().as_bytes());
        buf.extend_from_slice(b"\n");

        assert_eq!(decode_one(&mut codec, &mut buf), Inbound::Envelope(envelope));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_then_complete() {
        let mut codec = WireCodec::default();
        let envelope = Envelope::logout("alice");
        let wire = serde_json::to_string(&envelope).unwrap();
        let (head, tail) = wire.split_at(10);

        let mut buf = BytesMut::from(head);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(tail.as_bytes());
        buf.extend_from_slice(b"\n");
        assert_eq!(decode_one(&mut codec, &mut buf), Inbound::Envelope(envelope));
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut codec = WireCodec::default();
        let first = Envelope::get_contacts("alice");
        let second = Envelope::directory_request("alice");

        let mut buf = BytesMut::new();
        for envelope in [&first, &second] {
            buf.extend_from_slice(serde_json::to_string(envelope).unwrap().as_bytes());
            buf.extend_from_slice(b"\n");
        }

        assert_eq!(decode_one(&mut codec, &mut buf), Inbound::Envelope(first));
        assert_eq!(decode_one(&mut codec, &mut buf), Inbound::Envelope(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_an_item_not_an_error() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::from("{\"kind\": \"nonsense\"}\n");

        match decode_one(&mut codec, &mut buf) {
            Inbound::Malformed { .. } => {}
            other => panic!("expected malformed frame, got {other:?}"),
        }

        // The decoder keeps working on the same stream.
        let envelope = Envelope::logout("alice");
        buf.extend_from_slice(serde_json::to_string(&envelope).unwrap().as_bytes());
        buf.extend_from_slice(b"\n");
        assert_eq!(decode_one(&mut codec, &mut buf), Inbound::Envelope(envelope));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = WireCodec::new(64);
        let mut buf = BytesMut::from(vec![b'x'; 65].as_slice());

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLong { limit: 64 })
        ));
    }

    #[test]
    fn eof_mid_record_is_a_dirty_close() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::from("{\"kind\": \"logo");

        // decode_eof with leftover bytes must error (connection reset), while
        // an empty buffer ends the stream cleanly.
        assert!(codec.decode_eof(&mut buf).is_err());
        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = WireCodec::default();
        let envelope = Envelope::chat("alice", "bob", vec![0x00, 0xff, b'\n']);

        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();
        assert_eq!(buf[buf.len() - 1], b'\n');

        assert_eq!(decode_one(&mut codec, &mut buf), Inbound::Envelope(envelope));
    }

    #[test]
    fn encode_reply_and_outbound() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::new();

        codec
            .encode(Reply::bad_request("no such user"), &mut buf)
            .unwrap();
        codec
            .encode(
                Outbound::Forward(Envelope::chat("alice", "bob", b"hi".to_vec())),
                &mut buf,
            )
            .unwrap();

        let text = String::from_utf8(buf.to_vec()).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().contains("bad_request"));
        assert!(lines.next().unwrap().contains("chat_message"));
    }
}
