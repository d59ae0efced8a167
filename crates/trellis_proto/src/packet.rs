//! Packet batch codec.
//!
//! A packet payload is a batch of up to [`MAX_MESSAGES`] serialized
//! messages:
//!
//! ```text
//! [count: u8] ([len: varint] [bytes...]) * count
//! ```
//!
//! The 15-message cap keeps the count in a single byte with room to spare;
//! the real bound on a batch is always the endpoint's `max_packet_size`.

use bytes::Bytes;
use octs::{BytesMut, EncodeLen, Read, VarInt, Write};

/// Most messages one packet may batch.
pub const MAX_MESSAGES: usize = 15;

/// Bytes `msg` will occupy inside a packet payload: varint length prefix
/// plus the message itself.
#[must_use]
pub fn message_encoded_len(msg: &Bytes) -> usize {
    VarInt(msg.len() as u64).encode_len() + msg.len()
}

/// Bytes a batch of messages will occupy as a packet payload.
#[must_use]
pub fn encoded_len(msgs: &[Bytes]) -> usize {
    1 + msgs.iter().map(message_encoded_len).sum::<usize>()
}

/// Encodes a batch into a packet payload.
///
/// # Panics
///
/// Panics if the batch holds more than [`MAX_MESSAGES`] messages; callers
/// bound the batch while building it.
#[must_use]
pub fn encode(msgs: &[Bytes]) -> Bytes {
    assert!(msgs.len() <= MAX_MESSAGES);
    let mut buf = BytesMut::with_capacity(encoded_len(msgs));
    #[allow(clippy::cast_possible_truncation)] // count <= 15
    buf.write(msgs.len() as u8)
        .expect("BytesMut grows on demand");
    for msg in msgs {
        buf.write(VarInt(msg.len() as u64))
            .expect("BytesMut grows on demand");
        buf.write_from(msg.clone()).expect("BytesMut grows on demand");
    }
    buf.freeze()
}

/// Error when decoding a packet payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Count byte exceeds [`MAX_MESSAGES`].
    #[error("too many messages in packet - {count} / {MAX_MESSAGES}")]
    TooManyMessages {
        /// Count byte read from the payload.
        count: u8,
    },
    /// Payload ended before the advertised messages were read, or a length
    /// prefix was malformed.
    #[error("malformed packet payload")]
    Malformed,
    /// Bytes were left over after the advertised messages were read.
    #[error("trailing bytes after packet payload")]
    TrailingBytes,
}

/// Decodes a packet payload back into its batch of messages.
///
/// # Errors
///
/// Errors if the payload is malformed in any way; the caller counts the
/// failure and drops the frame.
pub fn decode(mut payload: Bytes) -> Result<Vec<Bytes>, PacketError> {
    let count = payload.read::<u8>().map_err(|_| PacketError::Malformed)?;
    if usize::from(count) > MAX_MESSAGES {
        return Err(PacketError::TooManyMessages { count });
    }
    let mut msgs = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = payload
            .read::<VarInt<u64>>()
            .map_err(|_| PacketError::Malformed)?
            .0;
        let len = usize::try_from(len).map_err(|_| PacketError::Malformed)?;
        let msg = payload.read_next(len).map_err(|_| PacketError::Malformed)?;
        msgs.push(msg);
    }
    if !payload.is_empty() {
        return Err(PacketError::TrailingBytes);
    }
    Ok(msgs)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn encode_decode_batch() {
        let msgs = vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b""),
            Bytes::from_static(b"three33"),
        ];
        let payload = encode(&msgs);
        assert_eq!(encoded_len(&msgs), payload.len());
        assert_eq!(msgs, decode(payload).unwrap());
    }

    #[test]
    fn empty_batch() {
        let payload = encode(&[]);
        assert_eq!(1, payload.len());
        assert!(decode(payload).unwrap().is_empty());
    }

    #[test]
    fn rejects_overlong_count() {
        let payload = Bytes::from_static(&[16]);
        assert_matches!(
            decode(payload),
            Err(PacketError::TooManyMessages { count: 16 })
        );
    }

    #[test]
    fn rejects_truncated_payload() {
        // one message of advertised length 5, only 2 bytes present
        let payload = Bytes::from_static(&[1, 5, b'h', b'i']);
        assert_matches!(decode(payload), Err(PacketError::Malformed));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut raw = encode(&[Bytes::from_static(b"ok")]).to_vec();
        raw.push(0xFF);
        assert_matches!(
            decode(Bytes::from(raw)),
            Err(PacketError::TrailingBytes)
        );
    }

    #[test]
    fn message_len_accounts_for_prefix() {
        let msg = Bytes::from_static(&[0; 200]);
        // 200 needs a 2-byte varint
        assert_eq!(202, message_encoded_len(&msg));
    }
}
