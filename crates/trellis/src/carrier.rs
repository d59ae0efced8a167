//! Carrier contracts: what the host engine plugs in.
//!
//! A carrier is a host-provided byte pipe with a hard per-frame budget - an
//! event channel, a network-replicated property, or an ability actuator
//! whose trigger payload doubles as a frame. The dispatcher never sees the
//! difference: outbound frames leave through a [`TransmitFn`] per endpoint
//! profile, inbound frames come back through
//! [`Client::on_carrier_frame`](crate::Client::on_carrier_frame) or
//! [`Server::on_carrier_frame`](crate::Server::on_carrier_frame). Whatever
//! base-N text encoding a text-only channel needs is applied outside this
//! crate.

use trellis_proto::{reliable, reliable::TransmitFn, unreliable};

/// Identifies a remote peer, as assigned by the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl core::fmt::Display for PeerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Which of a peer's endpoints a carrier frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// Tiny client-to-server bursts over the ability-style slot.
    Small,
    /// Moderate bidirectional traffic over the regular event channel.
    Mid,
    /// Large server-to-client payloads over the per-peer keyed data slot.
    Big,
    /// Best-effort fan-out to all peers over the broadcast property.
    Broadcast,
}

/// Outbound byte pipes the host wires in when a peer attaches.
///
/// Which pipes are present depends on the side: a client transmits on
/// Small and Mid, a server on Mid and Big. The missing directions receive
/// only, and their acknowledgments travel piggybacked on Mid.
pub struct PeerCarriers {
    /// Small-profile transmit, client side only.
    pub small: Option<TransmitFn>,
    /// Mid-profile transmit, both sides.
    pub mid: TransmitFn,
    /// Big-profile transmit, server side only.
    pub big: Option<TransmitFn>,
}

impl core::fmt::Debug for PeerCarriers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeerCarriers")
            .field("small", &self.small.is_some())
            .field("big", &self.big.is_some())
            .finish_non_exhaustive()
    }
}

/// Endpoint configurations and routing knobs for one dispatcher.
///
/// The defaults assume the carrier budgets of a typical host: a ~25-byte
/// ability slot, a moderate event channel, and a roomy per-peer property.
/// Hosts with different budgets override the endpoint configs wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Small endpoint configuration.
    pub small: reliable::Config,
    /// Mid endpoint configuration.
    pub mid: reliable::Config,
    /// Big endpoint configuration.
    pub big: reliable::Config,
    /// Broadcast endpoint configuration.
    pub broadcast: unreliable::Config,
    /// Events small enough for the Small endpoint spill over to Mid once
    /// Small's send queue reaches this depth.
    pub small_queue_limit: usize,
    /// Capacity of the per-peer keyed carrier slot pool.
    pub big_slot_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            small: reliable::Config {
                max_message_size: 16,
                max_packet_size: 21,
                ..reliable::Config::default()
            },
            mid: reliable::Config {
                max_message_size: 120,
                max_packet_size: 180,
                ..reliable::Config::default()
            },
            big: reliable::Config {
                max_message_size: 1024,
                max_packet_size: 1200,
                ..reliable::Config::default()
            },
            broadcast: unreliable::Config {
                max_message_size: 120,
                max_packet_size: 180,
                ..unreliable::Config::default()
            },
            small_queue_limit: 8,
            big_slot_capacity: 64,
        }
    }
}
