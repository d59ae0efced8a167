//! See [`WindowBuf`].

use crate::seq::Seq;

/// Sliding-window slot buffer indexed by `seq mod window`.
///
/// Both endpoint buffers (packets pending acknowledgment, packets received
/// out of order) are one of these: a fixed array of `Option<T>` slots whose
/// capacity is the window size, a power of two. Indexing is `seq & (w - 1)`,
/// so a slot is reused as soon as the window has moved a full capacity past
/// it - the window invariants guarantee no two live packets ever share a
/// slot.
///
/// Slots are reused in place; nothing allocates after construction.
///
/// # Example
///
/// ```
/// use trellis_proto::{seq::Seq, window::WindowBuf};
///
/// let mut buf = WindowBuf::new(8);
/// assert!(buf.insert(Seq(3), "hello").is_none());
/// assert!(buf.occupied(Seq(3)));
///
/// // seq 11 maps to the same slot as seq 3
/// assert_eq!(Some("hello"), buf.insert(Seq(11), "world"));
/// assert_eq!(Some("world"), buf.take(Seq(11)));
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct WindowBuf<T> {
    slots: Box<[Option<T>]>,
}

impl<T> WindowBuf<T> {
    /// Creates a buffer of `window` slots.
    ///
    /// # Panics
    ///
    /// Panics if `window` is not a power of two.
    #[must_use]
    pub fn new(window: usize) -> Self {
        assert!(window.is_power_of_two());
        Self {
            slots: (0..window).map(|_| None).collect(),
        }
    }

    fn slot(&self, seq: Seq) -> usize {
        usize::from(seq.0) & (self.slots.len() - 1)
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns `true` if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Returns `true` if the slot for `seq` holds a value.
    #[must_use]
    pub fn occupied(&self, seq: Seq) -> bool {
        self.slots[self.slot(seq)].is_some()
    }

    /// Stores a value in the slot for `seq`, returning the displaced value
    /// if the slot was occupied.
    pub fn insert(&mut self, seq: Seq, value: T) -> Option<T> {
        let slot = self.slot(seq);
        self.slots[slot].replace(value)
    }

    /// Removes and returns the value in the slot for `seq`.
    pub fn take(&mut self, seq: Seq) -> Option<T> {
        let slot = self.slot(seq);
        self.slots[slot].take()
    }

    /// Borrows the value in the slot for `seq`.
    #[must_use]
    pub fn get(&self, seq: Seq) -> Option<&T> {
        self.slots[self.slot(seq)].as_ref()
    }

    /// Mutably borrows the value in the slot for `seq`.
    #[must_use]
    pub fn get_mut(&mut self, seq: Seq) -> Option<&mut T> {
        let slot = self.slot(seq);
        self.slots[slot].as_mut()
    }
}
