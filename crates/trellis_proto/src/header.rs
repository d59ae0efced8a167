//! Bit-packed 32-bit frame header codec.
//!
//! Every frame on the wire starts with one little-endian `u32`:
//!
//! ```text
//! bits  0..8   SACK   bitmap over seq in {ack+1 .. ack+8}
//! bits  8..12  ACK    cumulative ack: next expected receive seq - 1
//! bit   12     DATA   1 if the frame carries a payload packet
//! bit   13     SECOND 1 if a secondary header is packed into bits 18..30
//! bits 14..18  SEQ    this packet's seq (valid only if DATA = 1)
//! bits 18..26  SACK2  SACK of the secondary header
//! bits 26..30  ACK2   ACK of the secondary header
//! bits 30..32  reserved, zero
//! ```
//!
//! The secondary header is how one endpoint's acknowledgments ride along in
//! a paired endpoint's frames. [`merge`] packs a full (ack-only) header into
//! the high bits; [`split`] recovers it on the receive side as a standalone
//! header word, so it can be fed straight back into
//! [`on_frame`](crate::reliable::ReliableEndpoint::on_frame).
//!
//! For example, `ack = 4` with seqs 6 and 7 buffered out of order:
//!
//! ```text
//! SACK: 0b0000_0110
//!              ^  ^
//!              |  +- bit 0: seq 5 (ack + 1) has NOT arrived
//!              +---- bits 1, 2: seqs 6 and 7 arrived ahead of order
//! ```

use arbitrary::Arbitrary;
use bytes::Bytes;
use octs::{BufTooShortOr, Encode, EncodeLen, Read, Write};
use static_assertions::const_assert;

use crate::seq::Seq;

const SACK_LSB: u32 = 0;
const SACK_WIDTH: u32 = 8;
const ACK_LSB: u32 = 8;
const ACK_WIDTH: u32 = 4;
const DATA_BIT: u32 = 12;
const SECOND_BIT: u32 = 13;
const SEQ_LSB: u32 = 14;
const SEQ_WIDTH: u32 = 4;
const SACK2_LSB: u32 = 18;
const ACK2_LSB: u32 = 26;
const RESERVED_LSB: u32 = 30;

// the layout must tile the 32-bit word exactly
const_assert!(SEQ_LSB + SEQ_WIDTH == SACK2_LSB);
const_assert!(SACK2_LSB + SACK_WIDTH == ACK2_LSB);
const_assert!(ACK2_LSB + ACK_WIDTH == RESERVED_LSB);

/// Number of selective-acknowledgment bits in a header.
pub const SACK_BITS: u32 = SACK_WIDTH;

/// Bit mask with the low `width` bits set.
///
/// # Panics
///
/// Panics if `width >= 32`.
#[must_use]
pub const fn mask(width: u32) -> u32 {
    (1u32 << width) - 1
}

/// Reads the `width`-bit field of `word` starting at bit `lsb`.
///
/// # Example
///
/// ```
/// use trellis_proto::header::extract;
/// assert_eq!(0xB, extract(0xAB_CD, 8, 4));
/// ```
#[must_use]
pub const fn extract(word: u32, lsb: u32, width: u32) -> u32 {
    (word >> lsb) & mask(width)
}

/// Writes `value` into the `width`-bit field of `word` starting at bit
/// `lsb`, leaving every other bit untouched. Excess bits of `value` are
/// discarded.
///
/// # Example
///
/// ```
/// use trellis_proto::header::{extract, replace};
/// let word = replace(0xFFFF_FFFF, 8, 4, 0x5);
/// assert_eq!(0x5, extract(word, 8, 4));
/// assert_eq!(0xFFFF_F5FF, word);
/// ```
#[must_use]
pub const fn replace(word: u32, lsb: u32, width: u32, value: u32) -> u32 {
    (word & !(mask(width) << lsb)) | ((value & mask(width)) << lsb)
}

/// Decoded form of a primary frame header.
///
/// The secondary fields are not represented here; they are carried as an
/// opaque second `u32` by [`split`] and [`merge`], since their only consumer
/// is a paired endpoint which treats them as a full header of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub struct FrameHeader {
    /// Cumulative ack: the next expected receive seq minus 1.
    pub ack: Seq,
    /// Selective-ack bitmap; bit `i` refers to seq `ack + 1 + i`.
    pub sack: u8,
    /// Seq of the packet in this frame's payload, if it carries one.
    pub seq: Option<Seq>,
}

impl FrameHeader {
    /// Packs this header into its wire word. Field values wider than their
    /// bit ranges are truncated.
    #[must_use]
    pub const fn pack(&self) -> u32 {
        let mut word = 0;
        word = replace(word, SACK_LSB, SACK_WIDTH, self.sack as u32);
        word = replace(word, ACK_LSB, ACK_WIDTH, self.ack.0 as u32);
        if let Some(seq) = self.seq {
            word |= 1 << DATA_BIT;
            word = replace(word, SEQ_LSB, SEQ_WIDTH, seq.0 as u32);
        }
        word
    }

    /// Reads the primary fields out of a wire word, ignoring any secondary
    /// header bits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // fields are <= 8 bits wide
    pub const fn unpack(word: u32) -> Self {
        Self {
            ack: Seq(extract(word, ACK_LSB, ACK_WIDTH) as u8),
            sack: extract(word, SACK_LSB, SACK_WIDTH) as u8,
            seq: if word & (1 << DATA_BIT) == 0 {
                None
            } else {
                Some(Seq(extract(word, SEQ_LSB, SEQ_WIDTH) as u8))
            },
        }
    }
}

/// Packs `secondary`'s ACK and SACK fields into the high bits of `primary`
/// and sets SECOND.
///
/// Only the acknowledgment fields of the secondary survive; a secondary
/// header is always ack-only by construction.
///
/// # Example
///
/// ```
/// use trellis_proto::header::{merge, split};
/// # use trellis_proto::{header::FrameHeader, seq::Seq};
/// let primary = FrameHeader { ack: Seq(3), sack: 0b0110, seq: Some(Seq(4)) }.pack();
/// let secondary = FrameHeader { ack: Seq(9), sack: 0b0001, seq: None }.pack();
///
/// let merged = merge(primary, secondary);
/// assert_eq!((primary, Some(secondary)), split(merged));
/// ```
#[must_use]
pub const fn merge(primary: u32, secondary: u32) -> u32 {
    let mut word = primary | (1 << SECOND_BIT);
    word = replace(
        word,
        SACK2_LSB,
        SACK_WIDTH,
        extract(secondary, SACK_LSB, SACK_WIDTH),
    );
    word = replace(
        word,
        ACK2_LSB,
        ACK_WIDTH,
        extract(secondary, ACK_LSB, ACK_WIDTH),
    );
    word
}

/// Splits a wire word into its primary header and, if SECOND is set, the
/// secondary header reconstituted as a standalone ack-only word.
///
/// The returned primary has SECOND cleared and the secondary bit range
/// zeroed, so `merge(split(w).0, s)` reconstructs `w` exactly for any legal
/// `w` whose secondary was `s`.
#[must_use]
pub const fn split(word: u32) -> (u32, Option<u32>) {
    if word & (1 << SECOND_BIT) == 0 {
        return (word, None);
    }
    let mut secondary = 0;
    secondary = replace(
        secondary,
        SACK_LSB,
        SACK_WIDTH,
        extract(word, SACK2_LSB, SACK_WIDTH),
    );
    secondary = replace(
        secondary,
        ACK_LSB,
        ACK_WIDTH,
        extract(word, ACK2_LSB, ACK_WIDTH),
    );
    let mut primary = word & !(1 << SECOND_BIT);
    primary = replace(primary, SACK2_LSB, RESERVED_LSB - SACK2_LSB, 0);
    (primary, Some(secondary))
}

/// One wire unit: a packed header word plus an optional payload.
///
/// Encodes as the 4 header bytes little-endian followed by the raw payload
/// bytes; the payload length is implied by the carrier frame length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packed header word, including any merged secondary header.
    pub header: u32,
    /// Encoded packet carried by this frame, if any.
    pub payload: Option<Bytes>,
}

/// Encoded length of the header word inside a [`Frame`].
pub const HEADER_LEN: usize = 4;

/// Error when decoding a [`Frame`] from wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame was shorter than the header word.
    #[error("frame too short")]
    TooShort,
    /// DATA is set but the frame carries no payload bytes, or vice versa.
    #[error("payload presence does not match DATA flag")]
    PayloadMismatch,
}

impl EncodeLen for Frame {
    fn encode_len(&self) -> usize {
        HEADER_LEN + self.payload.as_ref().map_or(0, Bytes::len)
    }
}

impl Encode for Frame {
    type Error = core::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write_from(Bytes::copy_from_slice(&self.header.to_le_bytes()))?;
        if let Some(payload) = &self.payload {
            dst.write_from(payload.clone())?;
        }
        Ok(())
    }
}

impl Frame {
    /// Decodes a frame from the raw bytes of one carrier slot.
    ///
    /// The payload is everything after the header word; carriers delimit
    /// frames, so no length field is needed on the wire.
    ///
    /// # Errors
    ///
    /// Errors if the bytes are shorter than the header word, or if the
    /// presence of payload bytes contradicts the DATA flag.
    pub fn decode(mut src: Bytes) -> Result<Self, FrameError> {
        let word = src.read_next(HEADER_LEN).map_err(|_| FrameError::TooShort)?;
        let mut le = [0u8; HEADER_LEN];
        le.copy_from_slice(&word);
        let header = u32::from_le_bytes(le);

        let payload = if src.is_empty() { None } else { Some(src) };
        let has_data = header & (1 << DATA_BIT) != 0;
        if has_data != payload.is_some() {
            return Err(FrameError::PayloadMismatch);
        }
        Ok(Self { header, payload })
    }
}
