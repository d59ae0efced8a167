//! Per-peer endpoint trio and its callback wiring.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use bytes::Bytes;
use trellis_proto::reliable::ReliableEndpoint;
use web_time::Instant;

use crate::carrier::{DispatcherConfig, PeerCarriers, PeerId, Profile};

/// Messages drained out of endpoint receive queues, waiting for the
/// dispatcher to interpret them once the protocol callbacks have returned.
///
/// Receive callbacks must not re-enter their endpoint, so they only move
/// messages here; handshake detection and listener dispatch happen
/// afterwards, outside any endpoint borrow.
pub(crate) type Inbox = Rc<RefCell<VecDeque<(PeerId, Profile, Bytes)>>>;

/// Latest `now` seen by the dispatcher, shared with callbacks that need a
/// timestamp but receive none (the secondary-header forward).
pub(crate) type Clock = Rc<Cell<Instant>>;

/// Which side of the connection this link serves; decides which endpoint
/// pairs with Mid for ack piggybacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Small and Mid transmit; Big receives, acked via Mid's piggyback.
    Client,
    /// Mid and Big transmit; Small receives, acked via Mid's piggyback.
    Server,
}

/// One peer's three reliable endpoints plus per-peer dispatcher state.
#[derive(Debug)]
pub(crate) struct Link {
    pub small: Rc<RefCell<ReliableEndpoint>>,
    pub mid: Rc<RefCell<ReliableEndpoint>>,
    pub big: Rc<RefCell<ReliableEndpoint>>,
    /// Blocking modal state reported by the host; gates Small routing.
    pub modal: bool,
    /// Set once the peer's handshake literal has been received.
    pub ready: bool,
    /// Index of the leased Big carrier slot, returned on detach.
    pub slot: Option<usize>,
}

impl Link {
    /// Creates the endpoint trio for `peer` and wires every callback.
    ///
    /// All endpoints start locked; [`Link::unlock`] opens them once the
    /// handshake literal arrives (or immediately, on the joining side).
    pub fn new(
        config: &DispatcherConfig,
        peer: PeerId,
        carriers: PeerCarriers,
        inbox: &Inbox,
        clock: &Clock,
        role: Role,
    ) -> Self {
        let small = Rc::new(RefCell::new(ReliableEndpoint::new(config.small.clone())));
        let mid = Rc::new(RefCell::new(ReliableEndpoint::new(config.mid.clone())));
        let big = Rc::new(RefCell::new(ReliableEndpoint::new(config.big.clone())));

        if let Some(transmit) = carriers.small {
            small.borrow_mut().set_transmit_callback(transmit);
        }
        mid.borrow_mut().set_transmit_callback(carriers.mid);
        if let Some(transmit) = carriers.big {
            big.borrow_mut().set_transmit_callback(transmit);
        }

        for (profile, ep) in [
            (Profile::Small, &small),
            (Profile::Mid, &mid),
            (Profile::Big, &big),
        ] {
            let sink = Rc::clone(inbox);
            ep.borrow_mut().set_receive_callback(Box::new(move |queue| {
                let mut sink = sink.borrow_mut();
                while let Some(msg) = queue.pop() {
                    sink.push_back((peer, profile, msg));
                }
            }));
        }

        // Mid carries the silent endpoint's acks: the paired endpoint has
        // no carrier of its own in this direction, so its receive window
        // acknowledges exclusively through Mid's spare header bits.
        let paired = match role {
            Role::Client => &big,
            Role::Server => &small,
        };
        {
            let paired = Rc::clone(paired);
            mid.borrow_mut()
                .set_second_header_getter(Box::new(move || {
                    paired.borrow_mut().take_ack_header()
                }));
        }
        {
            let paired = match role {
                Role::Client => Rc::clone(&small),
                Role::Server => Rc::clone(&big),
            };
            let clock = Rc::clone(clock);
            mid.borrow_mut()
                .set_second_header_callback(Box::new(move |word| {
                    paired.borrow_mut().on_frame(clock.get(), word, None);
                }));
        }

        Self {
            small,
            mid,
            big,
            modal: false,
            ready: false,
            slot: None,
        }
    }

    /// Unlocks transmission on every endpoint of this link.
    pub fn unlock(&self) {
        self.small.borrow_mut().unlock_transmission();
        self.mid.borrow_mut().unlock_transmission();
        self.big.borrow_mut().unlock_transmission();
    }
}
