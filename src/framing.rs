//! Side-channel wire framing: a 10-digit zero-padded ASCII length prefix
//! followed by that many payload bytes. There is no message-type field;
//! sequencing is implicit in protocol phase (SPEC_FULL.md §6).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::{Display, From};
use tokio_util::codec::{Decoder, Encoder};

/// Width, in ASCII digits, of the length prefix every frame starts with.
const LENGTH_PREFIX_WIDTH: usize = 10;

/// Errors raised while decoding or encoding side-channel frames.
#[derive(Debug, Display, From)]
pub enum FrameError {
    /// Underlying I/O failure.
    #[display(fmt = "I/O error: {}", _0)]
    Io(std::io::Error),

    /// The 10-byte length prefix was not a decimal number.
    #[display(fmt = "Bad length prefix: {:?}", _0)]
    #[from(ignore)]
    BadLengthPrefix(Vec<u8>),

    /// A payload longer than `9_999_999_999` bytes cannot be framed.
    #[display(fmt = "Payload too large to frame: {} bytes", _0)]
    #[from(ignore)]
    PayloadTooLarge(usize),
}

/// [`Decoder`]/[`Encoder`] for the side channel's length-prefixed framing.
///
/// Mirrors `crates/medea-coturn-telnet-client`'s `CoturnCliCodec`: a small
/// stateless `Copy` struct implementing both traits against raw
/// [`BytesMut`]/[`Bytes`] buffers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SideChannelCodec;

impl Decoder for SideChannelCodec {
    type Error = FrameError;
    type Item = BytesMut;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_WIDTH {
            return Ok(None);
        }

        let prefix = &src[..LENGTH_PREFIX_WIDTH];
        let len: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| FrameError::BadLengthPrefix(prefix.to_vec()))?;

        if src.len() < LENGTH_PREFIX_WIDTH + len {
            src.reserve(LENGTH_PREFIX_WIDTH + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_WIDTH);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for SideChannelCodec {
    type Error = FrameError;

    fn encode(
        &mut self,
        item: Bytes,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        if item.len() > 9_999_999_999 {
            return Err(FrameError::PayloadTooLarge(item.len()));
        }
        dst.reserve(LENGTH_PREFIX_WIDTH + item.len());
        dst.put_slice(format!("{:0>10}", item.len()).as_bytes());
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let mut codec = SideChannelCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();
        assert_eq!(&buf[..10], b"0000000005");

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_full_payload() {
        let mut codec = SideChannelCodec;
        let mut buf = BytesMut::from(&b"0000000005hel"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn rejects_non_numeric_prefix() {
        let mut codec = SideChannelCodec;
        let mut buf = BytesMut::from(&b"not-a-len!"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
