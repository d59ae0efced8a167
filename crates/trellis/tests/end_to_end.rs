//! A client and a server wired through in-memory carriers, driven by
//! deterministic time.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use bytes::Bytes;
use trellis::{
    carrier::{DispatcherConfig, PeerCarriers, PeerId, Profile},
    client::SERVER,
    Client, Server, SubmitError,
};
use trellis_proto::reliable::TransmitFn;
use web_time::{Duration, Instant};

const PEER: PeerId = PeerId(1);

type Wire = Rc<RefCell<VecDeque<(Profile, u32, Option<Bytes>)>>>;

fn transmit_into(wire: &Wire, profile: Profile) -> TransmitFn {
    let wire = Rc::clone(wire);
    Box::new(move |word, payload| {
        wire.borrow_mut().push_back((profile, word, payload));
    })
}

struct Net {
    client: Client,
    server: Server,
    c2s: Wire,
    s2c: Wire,
    t: Instant,
    interval: Duration,
}

impl Net {
    fn new(config: DispatcherConfig) -> Self {
        let c2s = Wire::default();
        let s2c = Wire::default();

        let mut client = Client::new(config.clone());
        client.attach_server(PeerCarriers {
            small: Some(transmit_into(&c2s, Profile::Small)),
            mid: transmit_into(&c2s, Profile::Mid),
            big: None,
        });

        let mut server = Server::new(config.clone(), transmit_into(&s2c, Profile::Broadcast));
        server
            .attach_peer(
                PEER,
                PeerCarriers {
                    small: None,
                    mid: transmit_into(&s2c, Profile::Mid),
                    big: Some(transmit_into(&s2c, Profile::Big)),
                },
            )
            .unwrap();

        Self {
            client,
            server,
            c2s,
            s2c,
            t: Instant::now(),
            interval: config.mid.update_interval,
        }
    }

    /// One update: both sides tick, then all queued frames cross the wire.
    fn pump(&mut self) {
        self.t += self.interval;
        self.client.tick(self.t);
        self.server.tick(self.t);

        let frames = self.c2s.borrow_mut().drain(..).collect::<Vec<_>>();
        for (profile, word, payload) in frames {
            self.server
                .on_carrier_frame(self.t, PEER, profile, word, payload);
        }
        let frames = self.s2c.borrow_mut().drain(..).collect::<Vec<_>>();
        for (profile, word, payload) in frames {
            self.client.on_carrier_frame(self.t, profile, word, payload);
        }
    }

    fn pump_until_ready(&mut self) {
        for _ in 0..10 {
            if self.client.is_ready() && self.server.is_ready(PEER) {
                return;
            }
            self.pump();
        }
        panic!("handshake did not complete");
    }
}

#[test]
fn handshake_completes_both_ways() {
    let mut net = Net::new(DispatcherConfig::default());
    assert!(!net.client.is_ready());
    assert!(!net.server.is_ready(PEER));

    net.pump_until_ready();

    assert!(net.client.is_ready());
    assert!(net.server.is_ready(PEER));
}

#[test]
fn client_event_reaches_server_listener() {
    let mut net = Net::new(DispatcherConfig::default());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    net.server
        .connect_for_peer("OnShoot", move |peer, payload| {
            sink.borrow_mut().push((peer, payload.clone()));
        })
        .unwrap();

    net.pump_until_ready();
    net.client
        .broadcast_to_server("OnShoot", &Bytes::from_static(&[3, 4]))
        .unwrap();
    net.pump();
    net.pump();

    let seen = seen.borrow();
    assert_eq!(1, seen.len());
    assert_eq!((PEER, Bytes::from_static(&[3, 4])), seen[0]);
}

#[test]
fn server_event_reaches_client_listener() {
    let mut net = Net::new(DispatcherConfig::default());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    net.client
        .connect("OnScore", move |payload| {
            sink.borrow_mut().push(payload.clone());
        })
        .unwrap();

    net.pump_until_ready();
    net.server
        .broadcast_to_peer(PEER, "OnScore", &Bytes::from_static(b"+10"))
        .unwrap();
    net.pump();
    net.pump();

    assert_eq!(vec![Bytes::from_static(b"+10")], *seen.borrow());
}

#[test]
fn small_events_take_the_small_endpoint() {
    let mut net = Net::new(DispatcherConfig::default());
    net.pump_until_ready();

    net.client
        .broadcast_to_server("Hi", &Bytes::from_static(&[1]))
        .unwrap();
    assert_eq!(
        1,
        net.client.endpoint_stats(Profile::Small).unwrap().msgs_sent
    );

    // a modal peer routes the same event via mid
    net.client.set_modal(true);
    net.client
        .broadcast_to_server("Hi", &Bytes::from_static(&[1]))
        .unwrap();
    assert_eq!(
        1,
        net.client.endpoint_stats(Profile::Small).unwrap().msgs_sent
    );
    net.client.set_modal(false);

    // run well past the resend delay; the only way the small packet can
    // be acknowledged is via mid's secondary header
    for _ in 0..8 {
        net.pump();
    }
    let stats = net.client.endpoint_stats(Profile::Small).unwrap();
    assert_eq!(1, stats.packets_sent);
    assert_eq!(0, stats.packets_resent, "small ack never arrived");
}

#[test]
fn big_events_ack_through_piggyback_only() {
    let mut net = Net::new(DispatcherConfig::default());
    net.pump_until_ready();

    // too big for mid (120), fits big (1024)
    let payload = Bytes::from(vec![0xAB; 300]);
    net.server
        .broadcast_to_peer(PEER, "OnSnapshot", &payload)
        .unwrap();

    let seen = Rc::new(RefCell::new(0u32));
    let sink = Rc::clone(&seen);
    net.client
        .connect("OnSnapshot", move |_| *sink.borrow_mut() += 1)
        .unwrap();

    // run well past the resend delay; the piggybacked ack must have
    // stopped retransmission
    for _ in 0..8 {
        net.pump();
    }

    assert_eq!(1, *seen.borrow());
    let stats = net.server.endpoint_stats(PEER, Profile::Big).unwrap();
    assert_eq!(1, stats.packets_sent);
    assert_eq!(0, stats.packets_resent, "big ack never arrived");
    // and the client's big endpoint never put a frame on the wire
    let client_big = net.client.endpoint_stats(Profile::Big).unwrap();
    assert_eq!(0, client_big.frames_sent);
}

#[test]
fn unreliable_broadcast_reaches_client() {
    let mut net = Net::new(DispatcherConfig::default());
    net.pump_until_ready();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    net.client
        .connect("OnTick", move |payload| sink.borrow_mut().push(payload.clone()))
        .unwrap();

    net.server
        .unreliable_broadcast_to_all("OnTick", &Bytes::from_static(&[9]))
        .unwrap();
    net.pump();

    assert_eq!(vec![Bytes::from_static(&[9])], *seen.borrow());
}

#[test]
fn submissions_queue_during_handshake() {
    let mut net = Net::new(DispatcherConfig::default());

    // submitted before anyone is ready
    let seen = Rc::new(RefCell::new(0u32));
    let sink = Rc::clone(&seen);
    net.server
        .connect_for_peer("Early", move |_, _| *sink.borrow_mut() += 1)
        .unwrap();
    net.client
        .broadcast_to_server("Early", &Bytes::from_static(&[1]))
        .unwrap();

    net.pump_until_ready();
    for _ in 0..4 {
        net.pump();
    }
    assert_eq!(1, *seen.borrow());
}

#[test]
fn error_surface() {
    let mut net = Net::new(DispatcherConfig::default());
    net.pump_until_ready();

    assert_eq!(
        Err(SubmitError::NilArgument),
        net.client.broadcast_to_server("", &Bytes::new())
    );
    assert_eq!(
        Err(SubmitError::PeerNotConnected { peer: PeerId(99) }),
        net.server
            .broadcast_to_peer(PeerId(99), "Hi", &Bytes::new())
    );

    let oversize = Bytes::from(vec![0; 2048]);
    let err = net.server.broadcast_to_peer(PEER, "Huge", &oversize);
    assert!(matches!(err, Err(SubmitError::TooLarge { .. })));

    // a detached client reports the server as gone
    let mut lone = Client::new(DispatcherConfig::default());
    assert_eq!(
        Err(SubmitError::PeerNotConnected { peer: SERVER }),
        lone.broadcast_to_server("Hi", &Bytes::new())
    );
}

#[test]
fn detach_releases_carrier_slot() {
    let mut net = Net::new(DispatcherConfig::default());
    assert_eq!(1, net.server.slot_pool().in_use());

    let extra = Wire::default();
    net.server
        .attach_peer(
            PeerId(2),
            PeerCarriers {
                small: None,
                mid: transmit_into(&extra, Profile::Mid),
                big: Some(transmit_into(&extra, Profile::Big)),
            },
        )
        .unwrap();
    assert_eq!(2, net.server.slot_pool().in_use());

    assert!(net.server.detach_peer(PeerId(2)));
    assert_eq!(1, net.server.slot_pool().in_use());
    assert!(!net.server.detach_peer(PeerId(2)));
}

#[test]
fn duplicate_attach_rejected() {
    let mut net = Net::new(DispatcherConfig::default());
    let extra = Wire::default();
    let err = net.server.attach_peer(
        PEER,
        PeerCarriers {
            small: None,
            mid: transmit_into(&extra, Profile::Mid),
            big: Some(transmit_into(&extra, Profile::Big)),
        },
    );
    assert!(err.is_err());
}
