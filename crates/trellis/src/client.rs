//! See [`Client`].

use std::{cell::Cell, rc::Rc};

use bytes::Bytes;
use trellis_proto::unreliable::UnreliableEndpoint;
use web_time::Instant;

use crate::{
    carrier::{DispatcherConfig, PeerCarriers, PeerId, Profile},
    event::{self, SubmitError, HANDSHAKE},
    link::{Clock, Inbox, Link, Role},
    signal::SignalBus,
};

/// The peer id a client addresses its server under.
pub const SERVER: PeerId = PeerId(0);

/// Client-side dispatcher: one link to the server plus the receive half of
/// the unreliable broadcast.
///
/// Constructed once at start-up and handed to submitters; there is no
/// process-wide instance. The host drives it with
/// [`tick`](Client::tick) at the configured update interval and
/// [`on_carrier_frame`](Client::on_carrier_frame) for every inbound frame.
#[derive(Debug)]
pub struct Client {
    config: DispatcherConfig,
    bus: SignalBus,
    link: Option<Link>,
    broadcast_recv: UnreliableEndpoint,
    inbox: Inbox,
    clock: Clock,
}

impl Client {
    /// Creates a client dispatcher with no server attached.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let inbox = Inbox::default();
        let mut broadcast_recv = UnreliableEndpoint::new(config.broadcast.clone());
        {
            let sink = Rc::clone(&inbox);
            broadcast_recv.set_receive_callback(Box::new(move |queue| {
                let mut sink = sink.borrow_mut();
                while let Some(msg) = queue.pop() {
                    sink.push_back((SERVER, Profile::Broadcast, msg));
                }
            }));
        }
        Self {
            config,
            bus: SignalBus::new(),
            link: None,
            broadcast_recv,
            inbox,
            clock: Rc::new(Cell::new(Instant::now())),
        }
    }

    /// Attaches the server connection.
    ///
    /// The joining side does not wait to be spoken to: its endpoints
    /// unlock immediately and the handshake literal goes out as the first
    /// reliable message on Mid.
    pub fn attach_server(&mut self, carriers: PeerCarriers) {
        let link = Link::new(
            &self.config,
            SERVER,
            carriers,
            &self.inbox,
            &self.clock,
            Role::Client,
        );
        link.unlock();
        link.mid
            .borrow_mut()
            .send(Bytes::from_static(HANDSHAKE))
            .expect("handshake literal fits any usable mid config");
        tracing::debug!("server attached, handshake queued");
        self.link = Some(link);
    }

    /// Drops the server connection and everything queued on it.
    pub fn detach_server(&mut self) {
        if self.link.take().is_some() {
            tracing::debug!("server detached");
        }
    }

    /// Returns `true` once the server's handshake literal has arrived.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.ready)
    }

    /// Reports whether the local player is in a blocking modal state;
    /// while set, small events route via Mid instead of the ability slot.
    pub fn set_modal(&mut self, modal: bool) {
        if let Some(link) = &mut self.link {
            link.modal = modal;
        }
    }

    /// Registers a listener for reliable and broadcast events named
    /// `event`.
    ///
    /// # Errors
    ///
    /// Errors if the event name is empty.
    pub fn connect(
        &mut self,
        event: &str,
        mut listener: impl FnMut(&Bytes) + 'static,
    ) -> Result<(), SubmitError> {
        if event.is_empty() {
            return Err(SubmitError::NilArgument);
        }
        self.bus
            .connect(event, Box::new(move |_, payload| listener(payload)));
        Ok(())
    }

    /// Submits a reliable client-to-server event.
    ///
    /// Events small enough for the Small endpoint go there while the peer
    /// is not modal and Small's queue is shallow; everything else that
    /// fits goes on Mid.
    ///
    /// # Errors
    ///
    /// Errors if the name is empty, no server is attached, or the encoded
    /// event exceeds Mid's message limit.
    pub fn broadcast_to_server(
        &mut self,
        event: &str,
        payload: &Bytes,
    ) -> Result<(), SubmitError> {
        if event.is_empty() {
            return Err(SubmitError::NilArgument);
        }
        let Some(link) = &self.link else {
            return Err(SubmitError::PeerNotConnected { peer: SERVER });
        };

        let msg = event::encode(event, payload);
        let len = msg.len();
        let small_fits = len <= self.config.small.max_message_size
            && !link.modal
            && link.small.borrow().send_queue_len() < self.config.small_queue_limit;
        if small_fits {
            link.small.borrow_mut().send(msg)?;
            return Ok(());
        }
        if len <= self.config.mid.max_message_size {
            link.mid.borrow_mut().send(msg)?;
            return Ok(());
        }
        Err(SubmitError::TooLarge {
            len,
            max: self.config.mid.max_message_size,
        })
    }

    /// Gives the transmitting endpoints a chance to emit one frame each.
    pub fn tick(&mut self, now: Instant) {
        self.clock.set(now);
        if let Some(link) = &self.link {
            // Small and Mid transmit; Big is receive-only here, its acks
            // ride Mid's secondary header
            link.small.borrow_mut().tick(now);
            link.mid.borrow_mut().tick(now);
        }
        self.drain_inbox();
    }

    /// Feeds one inbound carrier frame to the endpoint it belongs to,
    /// then dispatches whatever messages came out of it.
    pub fn on_carrier_frame(
        &mut self,
        now: Instant,
        profile: Profile,
        word: u32,
        payload: Option<Bytes>,
    ) {
        self.clock.set(now);
        match profile {
            Profile::Mid => {
                if let Some(link) = &self.link {
                    link.mid.borrow_mut().on_frame(now, word, payload);
                }
            }
            Profile::Big => {
                if let Some(link) = &self.link {
                    link.big.borrow_mut().on_frame(now, word, payload);
                }
            }
            Profile::Broadcast => self.broadcast_recv.on_frame(word, payload),
            Profile::Small => {
                // the ability slot only flows client-to-server
                tracing::trace!("dropping inbound frame on the small profile");
            }
        }
        self.drain_inbox();
    }

    /// Interprets messages the endpoint callbacks parked in the inbox:
    /// the handshake literal flips readiness, everything else dispatches
    /// by event name.
    fn drain_inbox(&mut self) {
        loop {
            let next = self.inbox.borrow_mut().pop_front();
            let Some((peer, _profile, msg)) = next else {
                break;
            };
            if msg.as_ref() == HANDSHAKE {
                if let Some(link) = &mut self.link {
                    if !link.ready {
                        link.ready = true;
                        tracing::debug!("server is ready");
                    }
                }
                continue;
            }
            match event::decode(msg) {
                Ok((name, payload)) => self.bus.broadcast(Some(peer), &name, payload),
                Err(err) => {
                    tracing::trace!(%err, "dropping undecodable event");
                }
            }
        }
    }

    /// Counters of the endpoint behind `profile`, if it exists.
    #[must_use]
    pub fn endpoint_stats(&self, profile: Profile) -> Option<trellis_proto::stats::EndpointStats> {
        if matches!(profile, Profile::Broadcast) {
            return Some(*self.broadcast_recv.stats());
        }
        let link = self.link.as_ref()?;
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
}
