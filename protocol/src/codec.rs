//! Framing for Protocol v1: a 4-byte big-endian length prefix followed by a
//! CBOR-encoded [`Envelope`] body, §3.1 of the spec.
//!
//! The shape follows the teacher's `CborPacketCodec` (length-prefixed CBOR
//! over a `tokio_util::codec::Framed` stream), generalized with an explicit
//! maximum frame size so an oversized or corrupt length prefix cannot make
//! the receiver allocate unbounded memory.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::Error;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Codec for one direction of a Protocol v1 connection.
///
/// `max_frame_bytes` bounds the declared body length; envelopes whose
/// length prefix exceeds it are rejected with [`Error::FrameTooLarge`]
/// before any body bytes are buffered.
pub struct EnvelopeCodec {
    max_frame_bytes: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        // Generous default; callers negotiating a connection should set
        // this from InitOk.max_frame_bytes once known.
        Self::new(64 * 1024 * 1024)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, Error> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
        if len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        if src.len() < LENGTH_PREFIX_BYTES + len {
            src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        let body = src.split_to(len);
        let envelope: Envelope = serde_cbor::from_slice(&body)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Error> {
        let body = serde_cbor::to_vec(&item)?;
        if body.len() > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_bytes,
            });
        }
        dst.reserve(LENGTH_PREFIX_BYTES + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::*;

    #[test]
    fn round_trips_a_heartbeat() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        let sent = Envelope::heartbeat("s1", Some(42));
        codec.encode(sent.clone(), &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(sent, got);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::heartbeat("s1", None), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut codec = EnvelopeCodec::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { len: 1024, max: 8 }));
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let mut codec = EnvelopeCodec::new(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Envelope::heartbeat("s1", None), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }
}
