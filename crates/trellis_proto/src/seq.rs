//! See [`Seq`] and [`SeqSpace`].

use arbitrary::Arbitrary;

/// Sequence number identifying a packet sent across a network.
///
/// The number lives in a tiny power-of-two space - at most
/// [`SeqSpace::MAX_BITS`] bits - so it wraps around constantly during a
/// connection. All comparisons between sequence numbers must go through
/// [`SeqSpace::between`]; comparing two raw values with `<` gives the wrong
/// answer as soon as the space has wrapped, which is almost immediately.
///
/// The space can be visualized as a circle. With 4 bits:
///
/// ```text
///     14     15     0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Arbitrary)]
pub struct Seq(pub u8);

/// Serial-number arithmetic over a power-of-two sequence space.
///
/// The modulus `M = 2^bits` is a runtime value because the sequence width is
/// a configuration option. A window of size `w` is only unambiguous when
/// `w <= M/2`, which the window accessor guarantees by construction.
///
/// # Example
///
/// ```
/// use trellis_proto::seq::{Seq, SeqSpace};
///
/// let space = SeqSpace::new(4);
/// assert_eq!(16, space.modulus());
/// assert_eq!(8, space.window());
///
/// assert_eq!(Seq(0), space.advance(Seq(15), 1));
/// assert_eq!(Seq(14), space.advance(Seq(1), -3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpace {
    mask: u8,
}

impl SeqSpace {
    /// Widest supported sequence space, limited by the 4-bit SEQ field of
    /// the frame header.
    pub const MAX_BITS: u8 = 4;

    /// Creates a space over the modulus `2^bits`.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is 0 or greater than [`SeqSpace::MAX_BITS`].
    #[must_use]
    pub fn new(bits: u8) -> Self {
        assert!(bits >= 1 && bits <= Self::MAX_BITS);
        Self {
            mask: (1u8 << bits) - 1,
        }
    }

    /// Number of distinct sequence values in this space.
    #[must_use]
    pub const fn modulus(self) -> u8 {
        self.mask + 1
    }

    /// Window size this space supports: half of the sequence space.
    #[must_use]
    pub const fn window(self) -> usize {
        (self.modulus() / 2) as usize
    }

    /// Moves `s` by `d` steps around the circle; `d` may be negative.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // result in 0..m <= 16
    pub fn advance(self, s: Seq, d: i32) -> Seq {
        let m = i32::from(self.modulus());
        let v = (i32::from(s.0 & self.mask) + d).rem_euclid(m);
        Seq(v as u8)
    }

    /// Number of forward steps from `a` to `b`, in `0..modulus`.
    #[must_use]
    pub const fn distance(self, a: Seq, b: Seq) -> u8 {
        b.0.wrapping_sub(a.0) & self.mask
    }

    /// Circular "a <= b < c": true when stepping forward from `a`, one
    /// reaches `b` strictly before `c`.
    ///
    /// This is the only legal way to ask whether a sequence number falls
    /// inside a window.
    ///
    /// # Example
    ///
    /// ```
    /// use trellis_proto::seq::{Seq, SeqSpace};
    ///
    /// let space = SeqSpace::new(4);
    /// assert!(space.between(Seq(14), Seq(15), Seq(2)));
    /// assert!(space.between(Seq(14), Seq(1), Seq(2)));
    /// assert!(!space.between(Seq(14), Seq(2), Seq(2)));
    ///
    /// // degenerate left edge: true exactly when the window is non-empty
    /// assert!(space.between(Seq(3), Seq(3), Seq(4)));
    /// assert!(!space.between(Seq(3), Seq(3), Seq(3)));
    /// ```
    #[must_use]
    pub const fn between(self, a: Seq, b: Seq, c: Seq) -> bool {
        let a = a.0 & self.mask;
        let b = b.0 & self.mask;
        let c = c.0 & self.mask;
        (a <= b && b < c) || (c < a && a <= b) || (b < c && c < a)
    }
}
