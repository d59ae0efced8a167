//! See [`ReliableEndpoint`].
//!
//! # Protocol outline
//!
//! One endpoint per peer per carrier. The sender side keeps a sliding
//! window of up to `window` packets in flight; each carries a batch of
//! messages and a 4-bit seq. The receiver buffers out-of-order packets in a
//! mirror window and drains in-order runs into its receive FIFO, so
//! delivery order always equals submission order.
//!
//! Every frame - data or not - advertises the receiver's cumulative ack and
//! an 8-bit selective-ack bitmap. Unacked packets retransmit on a fixed
//! timer; a SACK bit for a later seq while the oldest is still missing
//! accelerates that oldest packet ahead of its timer (the NAK path).
//!
//! The endpoint is sans-IO: frames leave through the transmit callback,
//! arrive via [`on_frame`](ReliableEndpoint::on_frame), and all timing
//! comes from the `now` arguments. Callbacks run synchronously and must
//! not re-enter the endpoint that invoked them.

mod recv;
mod send;

use bytes::Bytes;
use derivative::Derivative;
use web_time::{Duration, Instant};

use crate::{
    header::FrameHeader,
    queue::MessageQueue,
    rtt::RttEstimator,
    seq::{Seq, SeqSpace},
    stats::EndpointStats,
    window::WindowBuf,
};

/// Configuration for a [`ReliableEndpoint`].
///
/// All timing options are factors of `update_interval`, the nominal period
/// between [`tick`](ReliableEndpoint::tick) calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Sequence number width in bits, at most [`SeqSpace::MAX_BITS`].
    ///
    /// The send/receive window is half the sequence space,
    /// `2^(seq_bits - 1)`.
    pub seq_bits: u8,
    /// Largest serialized message accepted by
    /// [`send`](ReliableEndpoint::send).
    pub max_message_size: usize,
    /// Cap on serialized payload bytes per frame.
    pub max_packet_size: usize,
    /// Nominal period between `tick` calls.
    pub update_interval: Duration,
    /// An ack-only frame is emitted if nothing has been sent for
    /// `ack_timeout_factor * update_interval`.
    pub ack_timeout_factor: u32,
    /// An unacked packet retransmits after
    /// `packet_resend_delay_factor * update_interval` since its last send.
    pub packet_resend_delay_factor: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seq_bits: 4,
            max_message_size: 256,
            max_packet_size: 1024,
            update_interval: Duration::from_millis(100),
            ack_timeout_factor: 2,
            packet_resend_delay_factor: 3,
        }
    }
}

impl Config {
    /// Window size this configuration yields.
    #[must_use]
    pub const fn window(&self) -> usize {
        1 << (self.seq_bits - 1)
    }

    /// Idle period after which an ack-only frame is emitted.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.update_interval * self.ack_timeout_factor
    }

    /// Period an unacked packet waits between transmissions.
    #[must_use]
    pub fn resend_delay(&self) -> Duration {
        self.update_interval * self.packet_resend_delay_factor
    }
}

/// Error when submitting a message with [`ReliableEndpoint::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Message exceeds the endpoint's `max_message_size`; nothing was
    /// queued.
    #[error("message too large - {len} / {max} bytes")]
    TooLarge {
        /// Serialized size of the rejected message.
        len: usize,
        /// The endpoint's `max_message_size`.
        max: usize,
    },
}

/// Sends an outbound frame: the packed header word and, if the frame
/// carries a packet, its encoded payload.
pub type TransmitFn = Box<dyn FnMut(u32, Option<Bytes>)>;

/// Hands the receive queue to the application once in-order messages are
/// waiting; the callback drains it.
pub type ReceiveFn = Box<dyn FnMut(&mut MessageQueue)>;

/// Observes each freshly acknowledged seq.
pub type AckFn = Box<dyn FnMut(Seq)>;

/// Supplies a paired endpoint's ack-only header for piggybacking, if that
/// endpoint has something to acknowledge.
pub type SecondHeaderGetFn = Box<dyn FnMut() -> Option<u32>>;

/// Receives the secondary header split out of an inbound frame.
pub type SecondHeaderFn = Box<dyn FnMut(u32)>;

/// When an in-flight packet should next be (re)transmitted.
///
/// `Now` is the NAK-accelerated state: a SACK proved a later seq arrived
/// while this one is still missing, so it jumps the timer queue. It beats
/// any scheduled deadline when choosing what to resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resend {
    /// Retransmit on the next tick, ahead of every scheduled deadline.
    Now,
    /// Retransmit once this deadline has passed.
    At(Instant),
}

impl Resend {
    fn due(self, now: Instant) -> bool {
        match self {
            Self::Now => true,
            Self::At(at) => at <= now,
        }
    }
}

/// A packet occupying a send-window slot until acknowledged.
#[derive(Debug, Clone)]
struct SentPacket {
    /// Encoded batch payload, kept verbatim for retransmission.
    payload: Bytes,
    /// When the packet was first transmitted; RTT samples measure against
    /// this.
    sent_at: Instant,
    resend: Resend,
}

/// Selective-Repeat ARQ endpoint over one carrier.
///
/// See the [module-level documentation](self).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ReliableEndpoint {
    config: Config,
    space: SeqSpace,

    // send side
    /// Lower bound of the send window: oldest unacked seq.
    ack_expected: Seq,
    /// Upper bound of the send window: next fresh seq.
    next_to_send: Seq,
    /// `next_to_send - ack_expected`, circularly; never exceeds the
    /// window.
    out_buffered: usize,
    out_buf: WindowBuf<SentPacket>,
    send_queue: MessageQueue,

    // receive side
    /// Next in-order seq to deliver.
    packet_expected: Seq,
    /// Upper bound of the receive window: `packet_expected + window`.
    in_too_far: Seq,
    in_buf: WindowBuf<Vec<Bytes>>,
    recv_queue: MessageQueue,

    rtt: RttEstimator,
    last_ack_sent_at: Option<Instant>,
    /// Set when a data frame arrives, cleared when any own frame goes out
    /// or a paired endpoint takes the ack header for piggybacking.
    ack_pending: bool,
    /// Cleared by the handshake; while set, `tick` emits nothing.
    locked: bool,
    stats: EndpointStats,

    #[derivative(Debug = "ignore")]
    on_transmit: Option<TransmitFn>,
    #[derivative(Debug = "ignore")]
    on_receive: Option<ReceiveFn>,
    #[derivative(Debug = "ignore")]
    on_ack: Option<AckFn>,
    #[derivative(Debug = "ignore")]
    second_getter: Option<SecondHeaderGetFn>,
    #[derivative(Debug = "ignore")]
    on_second: Option<SecondHeaderFn>,
}

impl ReliableEndpoint {
    /// Creates an endpoint in the locked state.
    ///
    /// No frames are emitted until [`unlock_transmission`] is called;
    /// messages submitted before then accumulate and flush on unlock.
    ///
    /// [`unlock_transmission`]: ReliableEndpoint::unlock_transmission
    ///
    /// # Panics
    ///
    /// Panics if `config.seq_bits` is 0 or wider than
    /// [`SeqSpace::MAX_BITS`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        let space = SeqSpace::new(config.seq_bits);
        let window = config.window();
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // window <= 8
        let in_too_far = space.advance(Seq(0), window as i32);
        Self {
            space,
            ack_expected: Seq(0),
            next_to_send: Seq(0),
            out_buffered: 0,
            out_buf: WindowBuf::new(window),
            send_queue: MessageQueue::new(),
            packet_expected: Seq(0),
            in_too_far,
            in_buf: WindowBuf::new(window),
            recv_queue: MessageQueue::new(),
            rtt: RttEstimator::new(config.resend_delay(), window),
            last_ack_sent_at: None,
            ack_pending: false,
            locked: true,
            stats: EndpointStats::default(),
            on_transmit: None,
            on_receive: None,
            on_ack: None,
            second_getter: None,
            on_second: None,
            config,
        }
    }

    /// Clears the initial lock that keeps the endpoint from emitting
    /// frames before the handshake.
    pub fn unlock_transmission(&mut self) {
        if self.locked {
            tracing::debug!("transmission unlocked");
            self.locked = false;
        }
    }

    /// Returns `true` once transmission has been unlocked.
    #[must_use]
    pub const fn is_transmitting(&self) -> bool {
        !self.locked
    }

    /// Sets the transmit callback. Wire-up only; set once before use.
    pub fn set_transmit_callback(&mut self, cb: TransmitFn) {
        self.on_transmit = Some(cb);
    }

    /// Sets the receive callback. Wire-up only; set once before use.
    pub fn set_receive_callback(&mut self, cb: ReceiveFn) {
        self.on_receive = Some(cb);
    }

    /// Sets the ack callback. Wire-up only; set once before use.
    pub fn set_ack_callback(&mut self, cb: AckFn) {
        self.on_ack = Some(cb);
    }

    /// Sets the getter polled on each tick for a piggybacked secondary
    /// header.
    pub fn set_second_header_getter(&mut self, cb: SecondHeaderGetFn) {
        self.second_getter = Some(cb);
    }

    /// Sets the callback handed the secondary header split out of inbound
    /// frames.
    pub fn set_second_header_callback(&mut self, cb: SecondHeaderFn) {
        self.on_second = Some(cb);
    }

    /// The ack-only header this endpoint would send right now.
    #[must_use]
    pub fn ack_header(&self) -> u32 {
        FrameHeader {
            ack: self.space.advance(self.packet_expected, -1),
            sack: self.sack_bits(),
            seq: None,
        }
        .pack()
    }

    /// Takes the ack-only header for piggybacking on a paired endpoint's
    /// frame, if there is anything new to acknowledge.
    ///
    /// Clears the pending-ack latch: the acknowledgment is considered
    /// conveyed. If the carrying frame is lost, the peer's retransmission
    /// re-arms the latch.
    pub fn take_ack_header(&mut self) -> Option<u32> {
        if !self.ack_pending {
            return None;
        }
        self.ack_pending = false;
        Some(self.ack_header())
    }

    /// Selective-ack bitmap over the receive window: bit `i` is set if seq
    /// `packet_expected + i` is buffered out of order.
    fn sack_bits(&self) -> u8 {
        let mut sack = 0u8;
        for i in 0..crate::header::SACK_BITS {
            #[allow(clippy::cast_possible_wrap)] // i < 8
            let seq = self.space.advance(self.packet_expected, i as i32);
            if self.in_buf.occupied(seq) {
                sack |= 1 << i;
            }
        }
        sack
    }

    /// Oldest unacked seq: the lower bound of the send window.
    #[must_use]
    pub const fn ack_expected(&self) -> Seq {
        self.ack_expected
    }

    /// Next fresh seq: the upper bound of the send window.
    #[must_use]
    pub const fn next_to_send(&self) -> Seq {
        self.next_to_send
    }

    /// Next in-order seq the receive side will deliver.
    #[must_use]
    pub const fn packet_expected(&self) -> Seq {
        self.packet_expected
    }

    /// Upper bound of the receive window.
    #[must_use]
    pub const fn in_too_far(&self) -> Seq {
        self.in_too_far
    }

    /// Number of packets in flight.
    #[must_use]
    pub const fn out_buffered(&self) -> usize {
        self.out_buffered
    }

    /// Depth of the outgoing message FIFO.
    #[must_use]
    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Window size of this endpoint.
    #[must_use]
    pub const fn window(&self) -> usize {
        self.config.window()
    }

    /// The sequence space this endpoint operates in.
    #[must_use]
    pub const fn space(&self) -> SeqSpace {
        self.space
    }

    /// This endpoint's configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Round-trip time estimate.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Running counters.
    #[must_use]
    pub const fn stats(&self) -> &EndpointStats {
        &self.stats
    }
}
