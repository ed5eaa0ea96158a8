use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Size of the length prefix that precedes every payload on the wire.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// An immutable message envelope.
///
/// On the wire a packet is framed as a big-endian `u32` payload length
/// followed by the payload bytes. There is no handshake, magic number or
/// version byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Bytes,
}

impl Packet {
    /// Creates a packet from a payload.
    ///
    /// Fails with [`AppError::MessageTooLarge`] if the payload length cannot be
    /// represented in the 32-bit length prefix.
    pub fn new(payload: impl Into<Bytes>) -> AppResult<Packet> {
        let payload = payload.into();
        if u32::try_from(payload.len()).is_err() {
            return Err(AppError::MessageTooLarge(format!(
                "payload of length {} does not fit in the length prefix",
                payload.len()
            )));
        }
        Ok(Packet { payload })
    }

    /// Wraps bytes read off the wire. Their length is bounded by a decoded
    /// prefix, so the invariant holds by construction.
    pub(crate) fn from_wire(payload: Bytes) -> Packet {
        debug_assert!(payload.len() <= u32::MAX as usize);
        Packet { payload }
    }

    pub fn empty() -> Packet {
        Packet {
            payload: Bytes::new(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn framed_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.payload.len()
    }

    /// Returns the wire representation: length prefix followed by the payload.
    pub fn framed(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.framed_len());
        buffer.put_slice(&Self::encode_length(self.payload.len() as u32));
        buffer.put_slice(&self.payload);
        buffer.freeze()
    }

    pub fn encode_length(length: u32) -> [u8; LENGTH_PREFIX_SIZE] {
        length.to_be_bytes()
    }

    /// Decodes a length prefix. The value is not validated beyond the numeric
    /// decode; callers wanting a ceiling must check it themselves.
    pub fn decode_length(prefix: &[u8]) -> AppResult<u32> {
        let bytes: [u8; LENGTH_PREFIX_SIZE] = prefix.try_into().map_err(|_| {
            AppError::InvalidValue(format!(
                "length prefix must be {} bytes, got {}",
                LENGTH_PREFIX_SIZE,
                prefix.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::hello(b"Hello".to_vec())]
    #[case::binary(vec![0u8, 255, 1, 254, 0, 0])]
    #[case::large(vec![0xAB; 70_000])]
    fn test_framed_prefix_describes_payload(#[case] payload: Vec<u8>) {
        let packet = Packet::new(payload.clone()).unwrap();
        let framed = packet.framed();

        let (prefix, body) = framed.split_at(LENGTH_PREFIX_SIZE);
        assert_eq!(Packet::decode_length(prefix).unwrap() as usize, payload.len());
        assert_eq!(body, payload.as_slice());
        assert_eq!(framed.len(), packet.framed_len());
    }

    #[test]
    fn test_length_prefix_matches_payload() {
        let packet = Packet::new("Hello").unwrap();
        let framed = packet.framed();

        assert_eq!(framed.len(), packet.framed_len());
        assert_eq!(&framed[..LENGTH_PREFIX_SIZE], &[0, 0, 0, 5]);
        assert_eq!(&framed[LENGTH_PREFIX_SIZE..], b"Hello");
        assert_eq!(Packet::decode_length(&framed[..LENGTH_PREFIX_SIZE]).unwrap(), 5);
    }

    #[test]
    fn test_empty_packet_frames_as_zero_prefix() {
        let packet = Packet::empty();
        assert!(packet.is_empty());
        assert_eq!(packet.framed().as_ref(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_length_rejects_short_prefix() {
        assert!(matches!(
            Packet::decode_length(&[1, 2]),
            Err(AppError::InvalidValue(_))
        ));
    }
}
