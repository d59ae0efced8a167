//! See [`EndpointStats`].

/// Running counters for one endpoint.
///
/// User-facing failures are returned from the submitting call; everything
/// that goes wrong on the wire is counted here instead, because the
/// endpoint must survive any hostile or broken peer input. Counters only
/// ever increase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Messages accepted by `send`.
    pub msgs_sent: u64,
    /// Messages delivered into the receive queue.
    pub msgs_recv: u64,
    /// Fresh packets built and transmitted.
    pub packets_sent: u64,
    /// Packets drained from the receive window in order.
    pub packets_recv: u64,
    /// Retransmissions of packets already sent at least once.
    pub packets_resent: u64,
    /// Frames handed to the transmit callback.
    pub frames_sent: u64,
    /// Frames fed into `on_frame`.
    pub frames_recv: u64,
    /// Received packets whose seq was already buffered or delivered.
    pub duplicates: u64,
    /// Received packets whose seq fell outside the receive window.
    pub out_of_window: u64,
    /// Inbound frames or payloads that failed to decode.
    pub decode_errors: u64,
    /// Outbound packets abandoned because their payload exceeded the hard
    /// byte cap.
    pub framing_overflows: u64,
    /// Sequence gaps observed by an unreliable receiver.
    pub lost: u64,
}
