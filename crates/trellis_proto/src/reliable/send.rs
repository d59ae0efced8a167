use bytes::Bytes;
use web_time::Instant;

use crate::{
    header::{self, FrameHeader},
    packet,
    seq::Seq,
};

use super::{ReliableEndpoint, Resend, SendError, SentPacket};

impl ReliableEndpoint {
    /// Enqueues a serialized message for delivery, returning the new send
    /// queue depth.
    ///
    /// Never blocks. While the endpoint is locked, messages accumulate and
    /// flush once transmission is unlocked.
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

    /// Drives retransmission timers, ack throttling and frame emission.
    ///
    /// Emits at most one frame through the transmit callback per call:
    /// a due retransmission beats a fresh packet, and an otherwise empty
    /// frame still goes out if a secondary header is pending or the ack
    /// keepalive timer has elapsed. Calling more often than
    /// `update_interval` is harmless.
    pub fn tick(&mut self, now: Instant) {
        if self.locked {
            return;
        }

        let ack = self.space.advance(self.packet_expected, -1);
        let sack = self.sack_bits();

        let mut resent = false;
        let chosen = if let Some(seq) = self.due_resend(now) {
            let resend_at = now + self.config.resend_delay();
            let slot = self
                .out_buf
                .get_mut(seq)
                .expect("due_resend returns an occupied slot");
            slot.resend = Resend::At(resend_at);
            resent = true;
            Some((seq, slot.payload.clone()))
        } else {
            self.build_fresh_packet(now)
        };

        let second = self.second_getter.as_mut().and_then(|get| get());
        let keepalive_due = self
            .last_ack_sent_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.ack_timeout());
        if chosen.is_none() && second.is_none() && !keepalive_due {
            return;
        }

        let seq = chosen.as_ref().map(|(seq, _)| *seq);
        let mut word = FrameHeader { ack, sack, seq }.pack();
        if let Some(second) = second {
            word = header::merge(word, second);
        }

        self.stats.frames_sent += 1;
        tracing::trace!(
            ack = ack.0,
            sack,
            seq = seq.map(|seq| seq.0),
            second = second.is_some(),
            "frame emitted"
        );
        if resent {
            self.stats.packets_resent += 1;
            tracing::trace!(seq = seq.map(|seq| seq.0), "packet resent");
        }
        self.last_ack_sent_at = Some(now);
        self.ack_pending = false;

        let payload = chosen.map(|(_, payload)| payload);
        if let Some(cb) = self.on_transmit.as_mut() {
            cb(word, payload);
        }
    }

    /// Picks the in-flight packet most overdue for retransmission, if any
    /// is due: NAK-accelerated slots first, then the earliest deadline,
    /// ties to the lowest seq.
    fn due_resend(&self, now: Instant) -> Option<Seq> {
        let mut best: Option<(Seq, Resend)> = None;
        for i in 0..self.out_buffered {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // i < 8
            let seq = self.space.advance(self.ack_expected, i as i32);
            let Some(slot) = self.out_buf.get(seq) else {
                // already freed by a selective ack
                continue;
            };
            if !slot.resend.due(now) {
                continue;
            }
            let better = match (best, slot.resend) {
                (None, _) => true,
                (Some((_, Resend::At(best_at))), Resend::At(at)) => at < best_at,
                (Some((_, Resend::At(_))), Resend::Now) => true,
                (Some((_, Resend::Now)), _) => false,
            };
            if better {
                best = Some((seq, slot.resend));
            }
        }
        best.map(|(seq, _)| seq)
    }

    /// Drains queued messages into a new packet and claims the next send
    /// slot for it, if the window has room and messages are waiting.
    fn build_fresh_packet(&mut self, now: Instant) -> Option<(Seq, Bytes)> {
        if self.out_buffered >= self.window() || self.send_queue.is_empty() {
            return None;
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
            // the head message alone blows the payload cap: a
            // misconfiguration (max_message_size > max_packet_size).
            // Abort this emission and leave the queue untouched.
            self.stats.framing_overflows += 1;
            tracing::error!(
                max_packet_size = self.config.max_packet_size,
                "queued message exceeds the packet payload cap"
            );
            return None;
        }

        let payload = packet::encode(&batch);
        let seq = self.next_to_send;
        self.out_buf.insert(
            seq,
            SentPacket {
                payload: payload.clone(),
                sent_at: now,
                resend: Resend::At(now + self.config.resend_delay()),
            },
        );
        self.next_to_send = self.space.advance(self.next_to_send, 1);
        self.out_buffered += 1;
        self.stats.packets_sent += 1;
        tracing::trace!(seq = seq.0, msgs = batch.len(), "fresh packet built");
        Some((seq, payload))
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

    fn capture_frames(ep: &mut ReliableEndpoint) -> Rc<RefCell<Vec<(u32, Option<Bytes>)>>> {
        let frames = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&frames);
        ep.set_transmit_callback(Box::new(move |word, payload| {
            sink.borrow_mut().push((word, payload));
        }));
        frames
    }

    #[test]
    fn first_tick_emits_keepalive_ack() {
        let mut ep = unlocked(Config::default());
        let frames = capture_frames(&mut ep);
        ep.tick(Instant::now());

        let frames = frames.borrow();
        assert_eq!(1, frames.len());
        let header = FrameHeader::unpack(frames[0].0);
        assert_eq!(None, header.seq);
        assert!(frames[0].1.is_none());
    }

    #[test]
    fn batches_queued_messages_into_one_packet() {
        let mut ep = unlocked(Config::default());
        let frames = capture_frames(&mut ep);
        ep.send(Bytes::from_static(b"one")).unwrap();
        ep.send(Bytes::from_static(b"two")).unwrap();
        ep.tick(Instant::now());

        let frames = frames.borrow();
        assert_eq!(1, frames.len());
        let header = FrameHeader::unpack(frames[0].0);
        assert_eq!(Some(Seq(0)), header.seq);
        let msgs = packet::decode(frames[0].1.clone().unwrap()).unwrap();
        assert_eq!(2, msgs.len());
        assert_eq!(Seq(1), ep.next_to_send());
        assert_eq!(1, ep.out_buffered());
    }

    #[test]
    fn ack_throttle_between_keepalives() {
        let config = Config::default();
        let timeout = config.ack_timeout();
        let mut ep = unlocked(config);
        let frames = capture_frames(&mut ep);

        let t0 = Instant::now();
        ep.tick(t0);
        ep.tick(t0 + Duration::from_millis(1));
        assert_eq!(1, frames.borrow().len());

        ep.tick(t0 + timeout);
        assert_eq!(2, frames.borrow().len());
    }

    #[test]
    fn packet_cap_spills_into_next_tick() {
        let mut ep = unlocked(Config {
            max_message_size: 100,
            max_packet_size: 120,
            ..Config::default()
        });
        let frames = capture_frames(&mut ep);
        ep.send(Bytes::from_static(&[1; 100])).unwrap();
        ep.send(Bytes::from_static(&[2; 100])).unwrap();

        let t0 = Instant::now();
        ep.tick(t0);
        ep.tick(t0 + Duration::from_millis(1));

        let frames = frames.borrow();
        assert_eq!(2, frames.len());
        for (i, (word, payload)) in frames.iter().enumerate() {
            let msgs = packet::decode(payload.clone().unwrap()).unwrap();
            assert_eq!(1, msgs.len());
            assert_eq!(
                Some(Seq(u8::try_from(i).unwrap())),
                FrameHeader::unpack(*word).seq
            );
        }
    }

    #[test]
    fn resend_fires_after_delay() {
        let config = Config::default();
        let delay = config.resend_delay();
        let mut ep = unlocked(config);
        let frames = capture_frames(&mut ep);
        ep.send(Bytes::from_static(b"lost")).unwrap();

        let t0 = Instant::now();
        ep.tick(t0);
        // before both the resend delay and the ack keepalive
        ep.tick(t0 + Duration::from_millis(100));
        assert_eq!(1, frames.borrow().len());

        ep.tick(t0 + delay);
        let frames = frames.borrow();
        assert_eq!(2, frames.len());
        assert_eq!(
            FrameHeader::unpack(frames[0].0).seq,
            FrameHeader::unpack(frames[1].0).seq
        );
        assert_eq!(1, ep.stats().packets_resent);
    }

    #[test]
    fn window_full_stops_fresh_packets() {
        let config = Config::default();
        let window = config.window();
        let mut ep = unlocked(config);
        let frames = capture_frames(&mut ep);
        for _ in 0..window + 1 {
            ep.send(Bytes::from_static(b"m")).unwrap();
        }

        // one fresh packet per tick until the window fills
        let t0 = Instant::now();
        for i in 0..window + 1 {
            ep.tick(t0 + Duration::from_millis(u64::try_from(i).unwrap()));
        }
        assert_eq!(window, ep.out_buffered());
        assert_eq!(1, ep.send_queue_len());
        assert_eq!(window as u64, ep.stats().packets_sent);
        drop(frames);
    }

    #[test]
    fn framing_overflow_counted() {
        let mut ep = unlocked(Config {
            max_message_size: 64,
            max_packet_size: 16,
            ..Config::default()
        });
        let frames = capture_frames(&mut ep);
        ep.send(Bytes::from_static(&[0; 64])).unwrap();
        ep.tick(Instant::now());

        assert_eq!(1, ep.stats().framing_overflows);
        // keepalive may still fire, but no payload frame
        assert!(frames.borrow().iter().all(|(_, payload)| payload.is_none()));
    }

    #[test]
    fn secondary_header_forces_emission() {
        let config = Config::default();
        let mut ep = unlocked(config);
        let frames = capture_frames(&mut ep);
        ep.set_second_header_getter(Box::new(|| {
            Some(
                FrameHeader {
                    ack: Seq(5),
                    sack: 0b11,
                    seq: None,
                }
                .pack(),
            )
        }));

        let t0 = Instant::now();
        ep.tick(t0);
        // well inside the ack throttle, but the secondary forces a frame
        ep.tick(t0 + Duration::from_millis(1));

        let frames = frames.borrow();
        assert_eq!(2, frames.len());
        let (_, second) = header::split(frames[1].0);
        let second = FrameHeader::unpack(second.unwrap());
        assert_eq!(Seq(5), second.ack);
        assert_eq!(0b11, second.sack);
    }
}
