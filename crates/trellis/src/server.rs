//! See [`Server`].

use std::{cell::Cell, rc::Rc};

use ahash::AHashMap;
use bytes::Bytes;
use trellis_proto::{reliable::TransmitFn, unreliable::UnreliableEndpoint};
use web_time::Instant;

use crate::{
    carrier::{DispatcherConfig, PeerCarriers, PeerId, Profile},
    event::{self, SubmitError, HANDSHAKE},
    link::{Clock, Inbox, Link, Role},
    signal::SignalBus,
    slot_pool::SlotPool,
};

/// Error when attaching a peer with [`Server::attach_peer`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    /// Every per-peer keyed carrier slot is leased.
    #[error("no free carrier slot for {peer}")]
    SlotsExhausted {
        /// The peer that could not be attached.
        peer: PeerId,
    },
    /// The peer already has a link.
    #[error("{peer} is already attached")]
    AlreadyAttached {
        /// The peer that was attached twice.
        peer: PeerId,
    },
}

/// Server-side dispatcher: one link per connected peer plus the transmit
/// half of the unreliable broadcast.
///
/// Constructed once at start-up and handed to submitters; there is no
/// process-wide instance. The host drives it with [`tick`](Server::tick)
/// at the configured update interval,
/// [`attach_peer`](Server::attach_peer) /
/// [`detach_peer`](Server::detach_peer) on join and leave, and
/// [`on_carrier_frame`](Server::on_carrier_frame) for every inbound frame.
#[derive(Debug)]
pub struct Server {
    config: DispatcherConfig,
    bus: SignalBus,
    links: AHashMap<PeerId, Link>,
    pool: SlotPool,
    broadcast: UnreliableEndpoint,
    inbox: Inbox,
    clock: Clock,
}

impl Server {
    /// Creates a server dispatcher; `broadcast` transmits on the shared
    /// broadcast property carrier.
    #[must_use]
    pub fn new(config: DispatcherConfig, broadcast: TransmitFn) -> Self {
        let mut broadcast_ep = UnreliableEndpoint::new(config.broadcast.clone());
        broadcast_ep.set_transmit_callback(broadcast);
        let pool = SlotPool::new(config.big_slot_capacity);
        Self {
            config,
            bus: SignalBus::new(),
            links: AHashMap::new(),
            pool,
            broadcast: broadcast_ep,
            inbox: Inbox::default(),
            clock: Rc::new(Cell::new(Instant::now())),
        }
    }

    /// Creates the endpoint trio for a newly joined peer.
    ///
    /// The peer's endpoints stay locked until its handshake literal
    /// arrives; submissions for it queue up in the meantime. A Big carrier
    /// slot is leased for the peer and held until detach.
    ///
    /// # Errors
    ///
    /// Errors if the peer is already attached or the slot pool is
    /// exhausted.
    pub fn attach_peer(
        &mut self,
        peer: PeerId,
        carriers: PeerCarriers,
    ) -> Result<(), AttachError> {
        if self.links.contains_key(&peer) {
            return Err(AttachError::AlreadyAttached { peer });
        }
        let slot = self
            .pool
            .lease()
            .ok_or(AttachError::SlotsExhausted { peer })?;
        let mut link = Link::new(
            &self.config,
            peer,
            carriers,
            &self.inbox,
            &self.clock,
            Role::Server,
        );
        link.slot = Some(slot);
        tracing::debug!(%peer, slot, "peer attached");
        self.links.insert(peer, link);
        Ok(())
    }

    /// Tears down a departed peer's endpoints and returns its carrier
    /// slot to the pool.
    ///
    /// Returns `false` if the peer was not attached.
    pub fn detach_peer(&mut self, peer: PeerId) -> bool {
        let Some(link) = self.links.remove(&peer) else {
            return false;
        };
        if let Some(slot) = link.slot {
            self.pool.release(slot);
        }
        tracing::debug!(%peer, "peer detached");
        true
    }

    /// Returns `true` once `peer`'s handshake literal has arrived.
    #[must_use]
    pub fn is_ready(&self, peer: PeerId) -> bool {
        self.links.get(&peer).is_some_and(|link| link.ready)
    }

    /// Peers currently attached, in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.links.keys().copied()
    }

    /// Registers a listener for reliable events named `event` from any
    /// peer.
    ///
    /// # Errors
    ///
    /// Errors if the event name is empty.
    pub fn connect_for_peer(
        &mut self,
        event: &str,
        mut listener: impl FnMut(PeerId, &Bytes) + 'static,
    ) -> Result<(), SubmitError> {
        if event.is_empty() {
            return Err(SubmitError::NilArgument);
        }
        self.bus.connect(
            event,
            Box::new(move |peer, payload| {
                if let Some(peer) = peer {
                    listener(peer, payload);
                }
            }),
        );
        Ok(())
    }

    /// Submits a reliable event to one peer, on Mid if it fits and Big
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Errors if the name is empty, the peer is not attached, or the
    /// encoded event exceeds Big's message limit.
    pub fn broadcast_to_peer(
        &mut self,
        peer: PeerId,
        event: &str,
        payload: &Bytes,
    ) -> Result<(), SubmitError> {
        if event.is_empty() {
            return Err(SubmitError::NilArgument);
        }
        let Some(link) = self.links.get(&peer) else {
            return Err(SubmitError::PeerNotConnected { peer });
        };

        let msg = event::encode(event, payload);
        let len = msg.len();
        if len <= self.config.mid.max_message_size {
            link.mid.borrow_mut().send(msg)?;
            return Ok(());
        }
        if len <= self.config.big.max_message_size {
            link.big.borrow_mut().send(msg)?;
            return Ok(());
        }
        Err(SubmitError::TooLarge {
            len,
            max: self.config.big.max_message_size,
        })
    }

    /// Submits a reliable event to every attached peer.
    ///
    /// # Errors
    ///
    /// Errors if the name is empty or the encoded event exceeds Big's
    /// message limit; sizing is identical for every peer, so the first
    /// failure is the only failure.
    pub fn broadcast_to_all(&mut self, event: &str, payload: &Bytes) -> Result<(), SubmitError> {
        let peers = self.links.keys().copied().collect::<Vec<_>>();
        for peer in peers {
            self.broadcast_to_peer(peer, event, payload)?;
        }
        Ok(())
    }

    /// Submits a best-effort event to every peer over the broadcast
    /// carrier.
    ///
    /// # Errors
    ///
    /// Errors if the name is empty or the encoded event exceeds the
    /// broadcast endpoint's message limit.
    pub fn unreliable_broadcast_to_all(
        &mut self,
        event: &str,
        payload: &Bytes,
    ) -> Result<(), SubmitError> {
        if event.is_empty() {
            return Err(SubmitError::NilArgument);
        }
        self.broadcast.send(event::encode(event, payload))?;
        Ok(())
    }

    /// Gives every transmitting endpoint a chance to emit one frame each.
    pub fn tick(&mut self, now: Instant) {
        self.clock.set(now);
        for link in self.links.values() {
            // Mid and Big transmit; Small is receive-only here, its acks
            // ride Mid's secondary header
            link.mid.borrow_mut().tick(now);
            link.big.borrow_mut().tick(now);
        }
        self.broadcast.tick(now);
        self.drain_inbox();
    }

    /// Feeds one inbound carrier frame to the endpoint it belongs to,
    /// then dispatches whatever messages came out of it.
    pub fn on_carrier_frame(
        &mut self,
        now: Instant,
        peer: PeerId,
        profile: Profile,
        word: u32,
        payload: Option<Bytes>,
    ) {
        self.clock.set(now);
        let Some(link) = self.links.get(&peer) else {
            tracing::trace!(%peer, "dropping frame from unattached peer");
            return;
        };
        match profile {
            Profile::Small => link.small.borrow_mut().on_frame(now, word, payload),
            Profile::Mid => link.mid.borrow_mut().on_frame(now, word, payload),
            Profile::Big | Profile::Broadcast => {
                // these profiles only flow server-to-client
                tracing::trace!(%peer, ?profile, "dropping frame on a send-only profile");
            }
        }
        self.drain_inbox();
    }

    /// Interprets messages the endpoint callbacks parked in the inbox:
    /// the handshake literal unlocks the peer's endpoints and echoes the
    /// literal back, everything else dispatches by event name.
    fn drain_inbox(&mut self) {
        loop {
            let next = self.inbox.borrow_mut().pop_front();
            let Some((peer, _profile, msg)) = next else {
                break;
            };
            if msg.as_ref() == HANDSHAKE {
                self.peer_ready(peer);
                continue;
            }
            match event::decode(msg) {
                Ok((name, payload)) => self.bus.broadcast(Some(peer), &name, payload),
                Err(err) => {
                    tracing::trace!(%peer, %err, "dropping undecodable event");
                }
            }
        }
    }

    /// First handshake literal from a peer: unlock its endpoints and
    /// answer with our own literal so the peer learns we are listening.
    fn peer_ready(&mut self, peer: PeerId) {
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };
        if link.ready {
            return;
        }
        link.ready = true;
        link.unlock();
        if let Err(err) = link.mid.borrow_mut().send(Bytes::from_static(HANDSHAKE)) {
            tracing::warn!(%peer, %err, "failed to queue handshake reply");
        }
        tracing::debug!(%peer, "peer ready");
    }

    /// Counters of the endpoint behind `peer`'s `profile`; the broadcast
    /// endpoint is shared, so any `peer` value answers for it.
    #[must_use]
    pub fn endpoint_stats(
        &self,
        peer: PeerId,
        profile: Profile,
    ) -> Option<trellis_proto::stats::EndpointStats> {
        if matches!(profile, Profile::Broadcast) {
            return Some(*self.broadcast.stats());
        }
        let link = self.links.get(&peer)?;
        let ep = match profile {
            Profile::Small => &link.small,
            Profile::Mid => &link.mid,
            Profile::Big => &link.big,
            Profile::Broadcast => unreachable!(),
        };
        Some(*ep.borrow().stats())
    }

    /// The signal bus dispatching received events.
    #[must_use]
    pub const fn signals(&self) -> &SignalBus {
        &self.bus
    }

    /// This dispatcher's configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// The slot pool backing per-peer keyed carriers.
    #[must_use]
    pub const fn slot_pool(&self) -> &SlotPool {
        &self.pool
    }
}
