//! Event framing and the submission error surface.
//!
//! An application event travels as one opaque message: the event name,
//! varint-length-prefixed, followed by the serialized argument payload.
//! The protocol layer never looks inside; names come back out on the
//! receive side to key listener dispatch.

use bytes::Bytes;
use octs::{BytesMut, EncodeLen, Read, VarInt, Write};

use crate::carrier::PeerId;

/// Reserved literal that unlocks transmission when received.
///
/// It is sent as an ordinary reliable message - the raw 10 bytes, not an
/// encoded event - so it can never collide with an application event.
pub const HANDSHAKE: &[u8] = b"<~READY!~>";

/// Error returned to the submitter of an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Event exceeds the largest message any eligible endpoint accepts.
    #[error("event too large - {len} / {max} bytes")]
    TooLarge {
        /// Encoded size of the rejected event.
        len: usize,
        /// Largest encoded event an eligible endpoint accepts.
        max: usize,
    },
    /// No endpoints exist for the addressed peer.
    #[error("{peer} is not connected")]
    PeerNotConnected {
        /// The peer that was addressed.
        peer: PeerId,
    },
    /// The event name was empty.
    #[error("nil argument")]
    NilArgument,
}

impl From<trellis_proto::reliable::SendError> for SubmitError {
    fn from(err: trellis_proto::reliable::SendError) -> Self {
        let trellis_proto::reliable::SendError::TooLarge { len, max } = err;
        Self::TooLarge { len, max }
    }
}

/// Error when decoding a received event message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Length prefix or name bytes were truncated.
    #[error("malformed event message")]
    Malformed,
    /// The event name was not valid UTF-8.
    #[error("event name is not utf-8")]
    BadName,
}

/// Encoded size of `name` + `payload` as one event message.
#[must_use]
pub fn encoded_len(name: &str, payload: &Bytes) -> usize {
    VarInt(name.len() as u64).encode_len() + name.len() + payload.len()
}

/// Encodes an event into one protocol message.
#[must_use]
pub fn encode(name: &str, payload: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(name, payload));
    buf.write(VarInt(name.len() as u64))
        .expect("BytesMut grows on demand");
    buf.write_from(Bytes::copy_from_slice(name.as_bytes()))
        .expect("BytesMut grows on demand");
    buf.write_from(payload.clone())
        .expect("BytesMut grows on demand");
    buf.freeze()
}

/// Decodes one protocol message back into `(name, payload)`.
///
/// # Errors
///
/// Errors if the message is truncated or the name is not UTF-8; the caller
/// counts the failure and drops the message.
pub fn decode(mut msg: Bytes) -> Result<(String, Bytes), EventError> {
    let len = msg
        .read::<VarInt<u64>>()
        .map_err(|_| EventError::Malformed)?
        .0;
    let len = usize::try_from(len).map_err(|_| EventError::Malformed)?;
    let name = msg.read_next(len).map_err(|_| EventError::Malformed)?;
    let name = String::from_utf8(name.to_vec()).map_err(|_| EventError::BadName)?;
    Ok((name, msg))
}
