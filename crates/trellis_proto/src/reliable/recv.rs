use bytes::Bytes;
use web_time::Instant;

use crate::{header, header::FrameHeader, packet, seq::Seq};

use super::ReliableEndpoint;

impl ReliableEndpoint {
    /// Processes one inbound frame.
    ///
    /// Splits off and forwards any secondary header, applies the
    /// cumulative and selective acks to the send window, buffers an
    /// in-window payload packet, drains in-order runs into the receive
    /// queue, and finally invokes the receive callback if messages are
    /// waiting. The ack callback fires once per freshly acked seq.
    ///
    /// Hostile or malformed input never fails the endpoint; bad frames
    /// are counted and dropped.
    pub fn on_frame(&mut self, now: Instant, word: u32, payload: Option<Bytes>) {
        self.stats.frames_recv += 1;
        tracing::trace!(word, "frame received");

        let (primary, second) = header::split(word);
        if let Some(second) = second {
            if let Some(cb) = self.on_second.as_mut() {
                cb(second);
            }
        }

        let FrameHeader { ack, sack, seq } = FrameHeader::unpack(primary);
        self.apply_cumulative_ack(now, ack);
        self.apply_selective_ack(ack, sack);

        if let Some(seq) = seq {
            self.accept_packet(seq, payload);
            self.drain_in_order();
        }

        if !self.recv_queue.is_empty() {
            if let Some(cb) = self.on_receive.as_mut() {
                cb(&mut self.recv_queue);
            }
        }
    }

    /// Frees every send slot up to and including `ack`, sampling RTT and
    /// advancing the window's lower bound.
    fn apply_cumulative_ack(&mut self, now: Instant, ack: Seq) {
        while self.space.between(self.ack_expected, ack, self.next_to_send) {
            let freed = self.ack_expected;
            if let Some(sent) = self.out_buf.take(freed) {
                self.rtt.update(now.saturating_duration_since(sent.sent_at));
                if let Some(cb) = self.on_ack.as_mut() {
                    cb(freed);
                }
            }
            self.ack_expected = self.space.advance(self.ack_expected, 1);
            self.out_buffered -= 1;
        }
    }

    /// Applies the selective-ack bitmap: frees slots the peer holds out of
    /// order, and NAK-accelerates the oldest unacked seq once any later
    /// seq is known to have arrived.
    fn apply_selective_ack(&mut self, ack: Seq, sack: u8) {
        for i in 0..header::SACK_BITS {
            #[allow(clippy::cast_possible_wrap)] // i < 8
            let seq = self.space.advance(ack, i as i32 + 1);
            if !self.space.between(self.ack_expected, seq, self.next_to_send) {
                continue;
            }
            if sack & (1 << i) != 0 {
                if self.out_buf.take(seq).is_some() {
                    if let Some(cb) = self.on_ack.as_mut() {
                        cb(seq);
                    }
                }
            } else if seq == self.ack_expected && (u16::from(sack) >> (i + 1)) != 0 {
                // the peer holds a later packet but not this one: it was
                // lost, not delayed - resend ahead of the timer
                if let Some(sent) = self.out_buf.get_mut(seq) {
                    sent.resend = super::Resend::Now;
                }
            }
        }
    }

    /// Buffers a payload packet if it lands inside the receive window and
    /// its slot is free; otherwise counts why it was dropped.
    fn accept_packet(&mut self, seq: Seq, payload: Option<Bytes>) {
        let Some(payload) = payload else {
            // DATA was set but the carrier delivered no payload bytes
            self.stats.decode_errors += 1;
            tracing::trace!(seq = seq.0, "data frame without payload");
            return;
        };
        let msgs = match packet::decode(payload) {
            Ok(msgs) => msgs,
            Err(err) => {
                self.stats.decode_errors += 1;
                tracing::trace!(seq = seq.0, %err, "dropping undecodable packet");
                return;
            }
        };

        if self
            .space
            .between(self.packet_expected, seq, self.in_too_far)
        {
            self.ack_pending = true;
            if self.in_buf.occupied(seq) {
                self.stats.duplicates += 1;
                tracing::trace!(seq = seq.0, "duplicate of buffered packet");
            } else {
                self.in_buf.insert(seq, msgs);
            }
            return;
        }

        // Outside the window. Delivery is strictly sequential, so a seq
        // `d` steps behind `packet_expected` was really delivered only if
        // at least `d` packets have been delivered; anything else is
        // garbage from a confused peer.
        let behind = self.space.distance(seq, self.packet_expected);
        if u64::from(behind) <= self.stats.packets_recv {
            // already delivered; the peer has not seen our ack yet, so
            // re-arm it
            self.ack_pending = true;
            self.stats.duplicates += 1;
            tracing::trace!(seq = seq.0, "duplicate of delivered packet");
        } else {
            self.stats.out_of_window += 1;
            tracing::trace!(seq = seq.0, "packet outside receive window");
        }
    }

    /// Moves every in-order buffered packet's messages into the receive
    /// queue and slides the receive window forward.
    fn drain_in_order(&mut self) {
        while let Some(msgs) = self.in_buf.take(self.packet_expected) {
            tracing::trace!(
                seq = self.packet_expected.0,
                msgs = msgs.len(),
                "delivering packet in order"
            );
            for msg in msgs {
                self.stats.msgs_recv += 1;
                self.recv_queue.push(msg);
            }
            self.stats.packets_recv += 1;
            self.packet_expected = self.space.advance(self.packet_expected, 1);
            self.in_too_far = self.space.advance(self.in_too_far, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use web_time::Duration;

    use crate::reliable::Config;

    use super::*;

    fn unlocked(config: Config) -> ReliableEndpoint {
        let mut ep = ReliableEndpoint::new(config);
        ep.unlock_transmission();
        ep
    }

    fn data_frame(seq: u8, ack: u8, sack: u8, msgs: &[&[u8]]) -> (u32, Option<Bytes>) {
        let batch = msgs
            .iter()
            .map(|m| Bytes::copy_from_slice(m))
            .collect::<Vec<_>>();
        (
            FrameHeader {
                ack: Seq(ack),
                sack,
                seq: Some(Seq(seq)),
            }
            .pack(),
            Some(packet::encode(&batch)),
        )
    }

    fn ack_frame(ack: u8, sack: u8) -> (u32, Option<Bytes>) {
        (
            FrameHeader {
                ack: Seq(ack),
                sack,
                seq: None,
            }
            .pack(),
            None,
        )
    }

    fn received(ep: &mut ReliableEndpoint) -> Rc<RefCell<Vec<Bytes>>> {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&out);
        ep.set_receive_callback(Box::new(move |queue| {
            sink.borrow_mut().extend(queue.drain());
        }));
        out
    }

    #[test]
    fn in_order_delivery() {
        let mut ep = unlocked(Config::default());
        let out = received(&mut ep);
        let now = Instant::now();

        let (word, payload) = data_frame(0, 15, 0, &[b"a", b"b"]);
        ep.on_frame(now, word, payload);
        let (word, payload) = data_frame(1, 15, 0, &[b"c"]);
        ep.on_frame(now, word, payload);

        let out = out.borrow();
        assert_eq!(3, out.len());
        assert_eq!(b"a".as_slice(), out[0].as_ref());
        assert_eq!(b"c".as_slice(), out[2].as_ref());
        assert_eq!(Seq(2), ep.packet_expected());
        assert_eq!(Seq(10), ep.in_too_far());
    }

    #[test]
    fn out_of_order_buffers_until_gap_fills() {
        let mut ep = unlocked(Config::default());
        let out = received(&mut ep);
        let now = Instant::now();

        for seq in [3u8, 1, 2, 4] {
            let (word, payload) = data_frame(seq, 15, 0, &[&[seq]]);
            ep.on_frame(now, word, payload);
        }
        assert!(out.borrow().is_empty());

        let (word, payload) = data_frame(0, 15, 0, &[&[0]]);
        ep.on_frame(now, word, payload);

        let out = out.borrow();
        assert_eq!(
            vec![0u8, 1, 2, 3, 4],
            out.iter().map(|m| m[0]).collect::<Vec<_>>()
        );
        assert_eq!(Seq(5), ep.packet_expected());
    }

    #[test]
    fn duplicate_is_counted_not_delivered() {
        let mut ep = unlocked(Config::default());
        let out = received(&mut ep);
        let now = Instant::now();

        let (word, payload) = data_frame(0, 15, 0, &[b"once"]);
        ep.on_frame(now, word, payload.clone());
        ep.on_frame(now, word, payload);

        assert_eq!(1, out.borrow().len());
        assert_eq!(1, ep.stats().duplicates);
    }

    #[test]
    fn stale_seq_counts_duplicate_and_rearms_ack() {
        let mut ep = unlocked(Config::default());
        let _out = received(&mut ep);
        let now = Instant::now();

        let (word, payload) = data_frame(0, 15, 0, &[b"x"]);
        ep.on_frame(now, word, payload);
        // delivery consumed the pending ack via take
        let _ = ep.take_ack_header();

        // replay after delivery: seq 0 is now behind the window
        let (word, payload) = data_frame(0, 15, 0, &[b"x"]);
        ep.on_frame(now, word, payload);
        assert_eq!(1, ep.stats().duplicates);
        assert!(ep.take_ack_header().is_some());
    }

    #[test]
    fn far_future_seq_is_out_of_window() {
        let mut ep = unlocked(Config::default());
        let now = Instant::now();

        let (word, payload) = data_frame(9, 15, 0, &[b"early"]);
        ep.on_frame(now, word, payload);
        assert_eq!(1, ep.stats().out_of_window);
        assert!(!ep.in_buf.occupied(Seq(9)));
    }

    #[test]
    fn cumulative_ack_frees_send_window() {
        let mut ep = unlocked(Config::default());
        let acked = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&acked);
        ep.set_ack_callback(Box::new(move |seq| sink.borrow_mut().push(seq)));
        ep.set_transmit_callback(Box::new(|_, _| {}));

        let t0 = Instant::now();
        for i in 0..3u8 {
            ep.send(Bytes::from_static(b"m")).unwrap();
            ep.tick(t0 + Duration::from_millis(u64::from(i)));
        }
        assert_eq!(3, ep.out_buffered());

        let (word, payload) = ack_frame(1, 0);
        ep.on_frame(t0 + Duration::from_millis(50), word, payload);

        assert_eq!(1, ep.out_buffered());
        assert_eq!(Seq(2), ep.ack_expected());
        assert_eq!(vec![Seq(0), Seq(1)], *acked.borrow());
    }

    #[test]
    fn selective_ack_frees_slot_without_advancing() {
        let mut ep = unlocked(Config::default());
        ep.set_transmit_callback(Box::new(|_, _| {}));

        let t0 = Instant::now();
        for i in 0..3u8 {
            ep.send(Bytes::from_static(b"m")).unwrap();
            ep.tick(t0 + Duration::from_millis(u64::from(i)));
        }

        // peer holds seq 1 out of order: ack = 15 (nothing in order),
        // sack bit 1 = seq 1
        let (word, payload) = ack_frame(15, 0b010);
        ep.on_frame(t0 + Duration::from_millis(10), word, payload);

        assert_eq!(Seq(0), ep.ack_expected());
        assert_eq!(3, ep.out_buffered());
        assert!(!ep.out_buf.occupied(Seq(1)));
        // cumulative ack later skips the freed slot cleanly
        let (word, payload) = ack_frame(2, 0);
        ep.on_frame(t0 + Duration::from_millis(20), word, payload);
        assert_eq!(Seq(3), ep.ack_expected());
        assert_eq!(0, ep.out_buffered());
    }

    #[test]
    fn sack_gap_nak_accelerates_oldest() {
        let config = Config::default();
        let mut ep = unlocked(config);
        let frames = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&frames);
        ep.set_transmit_callback(Box::new(move |word, payload| {
            sink.borrow_mut().push((word, payload));
        }));

        let t0 = Instant::now();
        for i in 0..2u8 {
            ep.send(Bytes::from_static(b"m")).unwrap();
            ep.tick(t0 + Duration::from_millis(u64::from(i)));
        }
        assert_eq!(2, frames.borrow().len());

        // seq 1 arrived, seq 0 did not: bit 1 set, bit 0 clear
        let (word, payload) = ack_frame(15, 0b010);
        ep.on_frame(t0 + Duration::from_millis(5), word, payload);

        // well before the resend delay, seq 0 retransmits anyway
        ep.tick(t0 + Duration::from_millis(6));
        let frames = frames.borrow();
        assert_eq!(3, frames.len());
        assert_eq!(Some(Seq(0)), FrameHeader::unpack(frames[2].0).seq);
        assert_eq!(1, ep.stats().packets_resent);
    }

    #[test]
    fn secondary_header_is_forwarded() {
        let mut ep = unlocked(Config::default());
        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        ep.set_second_header_callback(Box::new(move |word| {
            *sink.borrow_mut() = Some(word);
        }));

        let second = FrameHeader {
            ack: Seq(7),
            sack: 0b1,
            seq: None,
        }
        .pack();
        let primary = FrameHeader {
            ack: Seq(15),
            sack: 0,
            seq: None,
        }
        .pack();
        ep.on_frame(Instant::now(), header::merge(primary, second), None);

        assert_eq!(Some(second), *seen.borrow());
    }

    #[test]
    fn malformed_payload_is_counted_and_dropped() {
        let mut ep = unlocked(Config::default());
        let out = received(&mut ep);
        let now = Instant::now();

        let word = FrameHeader {
            ack: Seq(15),
            sack: 0,
            seq: Some(Seq(0)),
        }
        .pack();
        ep.on_frame(now, word, Some(Bytes::from_static(&[9, 1])));

        assert!(out.borrow().is_empty());
        assert_eq!(1, ep.stats().decode_errors);
        assert_eq!(Seq(0), ep.packet_expected());
    }
}
