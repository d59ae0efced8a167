//! See [`UnreliableEndpoint`].

use bytes::Bytes;
use derivative::Derivative;
use web_time::{Duration, Instant};

use crate::{
    packet,
    queue::MessageQueue,
    reliable::{ReceiveFn, SendError, TransmitFn},
    stats::EndpointStats,
};

/// Configuration for an [`UnreliableEndpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Largest serialized message accepted by
    /// [`send`](UnreliableEndpoint::send).
    pub max_message_size: usize,
    /// Cap on serialized payload bytes per frame.
    pub max_packet_size: usize,
    /// Nominal period between `tick` calls.
    pub update_interval: Duration,
    /// Sequence numbers wrap at this value; at most 256.
    pub max_seq: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 256,
            max_packet_size: 1024,
            update_interval: Duration::from_millis(100),
            max_seq: 256,
        }
    }
}

/// Packs the unreliable wire header: byte 0 is the seq, bytes 2-3 the
/// sender's timestamp in milliseconds mod 2^16.
#[must_use]
pub const fn pack_header(seq: u8, timestamp_ms: u16) -> u32 {
    seq as u32 | ((timestamp_ms as u32) << 16)
}

/// Splits an unreliable wire header into `(seq, timestamp_ms)`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // deliberate field extraction
pub const fn unpack_header(word: u32) -> (u8, u16) {
    (word as u8, (word >> 16) as u16)
}

/// Best-effort sibling of [`ReliableEndpoint`]: same submission and
/// callback surface, no acknowledgments and no retransmission.
///
/// Every frame carries a wrapping sequence byte and a millisecond
/// timestamp. The receive side counts sequence gaps as lost and moves on;
/// nothing is ever recovered.
///
/// [`ReliableEndpoint`]: crate::reliable::ReliableEndpoint
#[derive(Derivative)]
#[derivative(Debug)]
pub struct UnreliableEndpoint {
    config: Config,
    next_seq: u16,
    /// Timestamps count milliseconds since the first tick.
    epoch: Option<Instant>,
    send_queue: MessageQueue,
    recv_queue: MessageQueue,
    /// Seq the receive side expects next; `None` until the first frame.
    expected: Option<u16>,
    /// Timestamp of the newest frame received.
    last_remote_timestamp: Option<u16>,
    stats: EndpointStats,
    #[derivative(Debug = "ignore")]
    on_transmit: Option<TransmitFn>,
    #[derivative(Debug = "ignore")]
    on_receive: Option<ReceiveFn>,
}

impl UnreliableEndpoint {
    /// Creates an endpoint.
    ///
    /// # Panics
    ///
    /// Panics if `config.max_seq` is 0 or greater than 256.
    #[must_use]
    pub fn new(config: Config) -> Self {
        assert!(config.max_seq >= 1 && config.max_seq <= 256);
        Self {
            config,
            next_seq: 0,
            epoch: None,
            send_queue: MessageQueue::new(),
            recv_queue: MessageQueue::new(),
            expected: None,
            last_remote_timestamp: None,
            stats: EndpointStats::default(),
            on_transmit: None,
            on_receive: None,
        }
    }

    /// Sets the transmit callback. Wire-up only; set once before use.
    pub fn set_transmit_callback(&mut self, cb: TransmitFn) {
        self.on_transmit = Some(cb);
    }

    /// Sets the receive callback. Wire-up only; set once before use.
    pub fn set_receive_callback(&mut self, cb: ReceiveFn) {
        self.on_receive = Some(cb);
    }

    /// Enqueues a serialized message, returning the new send queue depth.
    ///
    /// # Errors
    ///
    /// Errors if the message exceeds `max_message_size`; nothing is
    /// queued.
    pub fn send(&mut self, msg: Bytes) -> Result<usize, SendError> {
        let len = msg.len();
        let max = self.config.max_message_size;
        if len > max {
            return Err(SendError::TooLarge { len, max });
        }
        self.stats.msgs_sent += 1;
        let depth = self.send_queue.push(msg);
        tracing::trace!(len, depth, "message queued");
        Ok(depth)
    }

    /// Emits at most one frame carrying a batch of queued messages.
    ///
    /// Nothing is emitted when the queue is empty: without
    /// acknowledgments there is no keepalive to send.
    pub fn tick(&mut self, now: Instant) {
        if self.send_queue.is_empty() {
            return;
        }

        let mut batch = Vec::new();
        let mut len = 1; // count byte
        while batch.len() < packet::MAX_MESSAGES {
            let Some(msg) = self.send_queue.peek() else {
                break;
            };
            let msg_len = packet::message_encoded_len(msg);
            if len + msg_len > self.config.max_packet_size {
                break;
            }
            len += msg_len;
            let msg = self.send_queue.pop().expect("peeked above");
            batch.push(msg);
        }
        if batch.is_empty() {
            self.stats.framing_overflows += 1;
            tracing::error!(
                max_packet_size = self.config.max_packet_size,
                "queued message exceeds the packet payload cap"
            );
            return;
        }

        let epoch = *self.epoch.get_or_insert(now);
        #[allow(clippy::cast_possible_truncation)] // deliberately mod 2^16
        let timestamp = now.saturating_duration_since(epoch).as_millis() as u16;
        #[allow(clippy::cast_possible_truncation)] // max_seq <= 256
        let seq = self.next_seq as u8;
        self.next_seq = (self.next_seq + 1) % self.config.max_seq;

        self.stats.packets_sent += 1;
        self.stats.frames_sent += 1;
        tracing::trace!(seq, timestamp, msgs = batch.len(), "frame emitted");
        let payload = packet::encode(&batch);
        if let Some(cb) = self.on_transmit.as_mut() {
            cb(pack_header(seq, timestamp), Some(payload));
        }
    }

    /// Processes one inbound frame.
    ///
    /// Forward gaps between the expected and observed seq count as lost;
    /// stale or repeated seqs count as duplicates and are dropped. The
    /// receive callback fires if the batch delivered any messages.
    pub fn on_frame(&mut self, word: u32, payload: Option<Bytes>) {
        self.stats.frames_recv += 1;
        tracing::trace!(word, "frame received");
        let (seq, timestamp) = unpack_header(word);
        let seq = u16::from(seq);
        if seq >= self.config.max_seq {
            self.stats.decode_errors += 1;
            tracing::trace!(seq, "seq outside the configured space");
            return;
        }
        let Some(payload) = payload else {
            self.stats.decode_errors += 1;
            tracing::trace!(seq, "frame without payload");
            return;
        };
        let msgs = match packet::decode(payload) {
            Ok(msgs) => msgs,
            Err(err) => {
                self.stats.decode_errors += 1;
                tracing::trace!(seq, %err, "dropping undecodable batch");
                return;
            }
        };

        if let Some(expected) = self.expected {
            let max_seq = self.config.max_seq;
            let gap = (seq + max_seq - expected) % max_seq;
            if u32::from(gap) >= u32::from(max_seq) / 2 {
                // stale: this frame arrived after a later one
                self.stats.duplicates += 1;
                tracing::trace!(seq, expected, "dropping stale frame");
                return;
            }
            if gap > 0 {
                self.stats.lost += u64::from(gap);
                tracing::trace!(seq, expected, gap, "sequence gap");
            }
        }
        self.expected = Some((seq + 1) % self.config.max_seq);
        self.last_remote_timestamp = Some(timestamp);

        tracing::trace!(seq, msgs = msgs.len(), "delivering batch");
        self.stats.packets_recv += 1;
        for msg in msgs {
            self.stats.msgs_recv += 1;
            self.recv_queue.push(msg);
        }
        if !self.recv_queue.is_empty() {
            if let Some(cb) = self.on_receive.as_mut() {
                cb(&mut self.recv_queue);
            }
        }
    }

    /// Timestamp carried by the newest frame received, if any.
    #[must_use]
    pub const fn last_remote_timestamp(&self) -> Option<u16> {
        self.last_remote_timestamp
    }

    /// Depth of the outgoing message FIFO.
    #[must_use]
    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    /// This endpoint's configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Running counters.
    #[must_use]
    pub const fn stats(&self) -> &EndpointStats {
        &self.stats
    }
}
