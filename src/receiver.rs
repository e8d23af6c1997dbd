// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::marker::PhantomData;
use tracing::{debug, info, trace, warn};
use crate::chunker::Chunker;
use crate::clock::POLL_INTERVAL;
use crate::config::LinkConfig;
use crate::engine::{ChunkOutcome, RadioLink};
use crate::error::{state_name, LinkError};
use crate::host::HostChannel;
use crate::protocol::*;
use crate::wake::WakeCoordinator;

// ============================================================================
// States
// ============================================================================

pub struct Idle;
pub struct FrameReceived;
pub struct WakeHandshake;
pub struct FrameAcked;
pub struct ChunkLoop;
pub struct Done;
pub struct Failed;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    link: RadioLink,
    host: Box<dyn HostChannel>,
    wake: WakeCoordinator,
    config: LinkConfig,
    frame: Option<Frame>,
    chunker: Option<Chunker>,
    /// Command frame still to be forwarded ahead of the first payload byte
    unannounced: Option<Frame>,
    last_activity_ms: u64,
    failure: Option<LinkError>,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError>;

    fn state_name(&self) -> &'static str;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            link: self.link,
            host: self.host,
            wake: self.wake,
            config: self.config,
            frame: self.frame,
            chunker: self.chunker,
            unannounced: self.unannounced,
            last_activity_ms: self.last_activity_ms,
            failure: self.failure,
        })
    }

    /// Abandons the transfer. The sender only ever sees silence.
    fn fail(mut self, e: LinkError) -> Result<Box<dyn ReceiverState>, LinkError> {
        if !e.is_transfer_local() {
            return Err(e.in_state::<S>());
        }
        self.failure = Some(e);
        Ok(self.transition::<Failed>() as Box<dyn ReceiverState>)
    }

    fn touch(&mut self) {
        self.last_activity_ms = self.link.clock().now_ms();
    }
}

/// Host writes with the pending command frame put ahead of the first one,
/// so a transfer that dies before any payload leaves nothing on the host.
struct Announced<'a> {
    host: &'a mut dyn HostChannel,
    frame: Option<Frame>,
}

impl HostChannel for Announced<'_> {
    fn available(&mut self) -> std::io::Result<usize> {
        self.host.available()
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if let Some(frame) = self.frame {
            self.host.write_all(&frame.encode())?;
            self.frame = None;
        }
        self.host.write_all(buf)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: std::time::Duration) -> std::io::Result<usize> {
        self.host.read_timeout(buf, timeout)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Idle> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError> {
        let mut fsm = *self;

        if let Some(packet) = fsm.link.poll_packet().map_err(|e| e.in_state::<Idle>())? {
            match decode_frame(&packet) {
                Ok(frame) if !frame.kind.is_control() => {
                    debug!("frame: {:?} {}", frame.kind, frame.value);
                    fsm.touch();
                    fsm.frame = Some(frame);
                    let next = fsm.transition::<FrameReceived>();
                    return Ok(next as Box<dyn ReceiverState>);
                }
                Ok(frame) => trace!("ignoring stray {:?} {}", frame.kind, frame.value),
                Err(e) => trace!("dropping packet {:02X?}: {}", packet, e),
            }
            return Ok(Box::new(fsm) as Box<dyn ReceiverState>);
        }

        let idle_ms = fsm.link.clock().now_ms().saturating_sub(fsm.last_activity_ms);
        let (radio, clock) = fsm.link.parts();
        let slept = fsm.wake.idle(idle_ms, radio, clock).map_err(|e| e.in_state::<Idle>())?;

        if slept {
            fsm.touch();
        } else {
            fsm.link.clock().sleep(POLL_INTERVAL);
        }
        Ok(Box::new(fsm) as Box<dyn ReceiverState>)
    }

    fn state_name(&self) -> &'static str {
        state_name::<Idle>()
    }
}

impl ReceiverState for ReceiverFsm<FrameReceived> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError> {
        let fsm = *self;
        let Some(frame) = fsm.frame else {
            let next = fsm.transition::<Idle>();
            return Ok(next as Box<dyn ReceiverState>);
        };

        if fsm.wake.requires_wake(frame.kind) {
            let next = fsm.transition::<WakeHandshake>();
            Ok(next as Box<dyn ReceiverState>)
        } else {
            let next = fsm.transition::<FrameAcked>();
            Ok(next as Box<dyn ReceiverState>)
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<FrameReceived>()
    }
}

impl ReceiverState for ReceiverFsm<WakeHandshake> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError> {
        let mut fsm = *self;
        debug!("waking host");

        let clock = fsm.link.clock();
        match fsm.wake.wake_host(fsm.host.as_mut(), clock) {
            Ok(()) => {
                let next = fsm.transition::<FrameAcked>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Err(e) => fsm.fail(e),
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<WakeHandshake>()
    }
}

impl ReceiverState for ReceiverFsm<FrameAcked> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError> {
        let mut fsm = *self;
        let Some(frame) = fsm.frame else {
            let next = fsm.transition::<Idle>();
            return Ok(next as Box<dyn ReceiverState>);
        };

        // A lost frame ack surfaces at the sender as a frame ack timeout
        if !fsm.link.send_ack(frame.value).map_err(|e| e.in_state::<FrameAcked>())? {
            warn!("frame ack not sent");
        }
        fsm.wake.transfer_started().map_err(|e| e.in_state::<FrameAcked>())?;

        fsm.unannounced = fsm.config.forward_frame.then_some(frame);

        let total = frame.payload_len().unwrap_or(0);
        info!("receiving {:?}: {} bytes", frame.kind, total);
        fsm.chunker = Some(Chunker::new(total, fsm.config.chunk_payload()));
        let next = fsm.transition::<ChunkLoop>();
        Ok(next as Box<dyn ReceiverState>)
    }

    fn state_name(&self) -> &'static str {
        state_name::<FrameAcked>()
    }
}

impl ReceiverState for ReceiverFsm<ChunkLoop> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError> {
        let mut fsm = *self;
        let Some(chunk) = fsm.chunker.as_mut().and_then(|c| c.next()) else {
            let next = fsm.transition::<Done>();
            return Ok(next as Box<dyn ReceiverState>);
        };
        let seq = chunk.sequence();

        let mut host = Announced { host: fsm.host.as_mut(), frame: fsm.unannounced.take() };
        let outcome = fsm.link.receive_chunk_and_ack(seq, chunk.size, &mut host)
            .map_err(|e| e.in_state::<ChunkLoop>())?;
        fsm.unannounced = host.frame;

        match outcome {
            ChunkOutcome::Delivered => {
                debug!("chunk {} ({} bytes) forwarded", seq, chunk.size);
                fsm.touch();
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            ChunkOutcome::TimedOut => {
                let timeout = fsm.config.timing.chunk_receive_timeout_ms;
                fsm.fail(LinkError::LinkTimeout(timeout))
            }
            ChunkOutcome::Aborted(e) => fsm.fail(e),
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<ChunkLoop>()
    }
}

impl ReceiverState for ReceiverFsm<Done> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError> {
        let mut fsm = *self;
        if let Some(chunker) = fsm.chunker.take() {
            info!("transfer complete: {} bytes in {} chunks", chunker.total(), chunker.chunk_count());
        }
        // empty transfers have no chunk to carry the frame
        if let Some(frame) = fsm.unannounced.take() {
            fsm.host.write_all(&frame.encode())
                .map_err(|e| LinkError::from(e).in_state::<Done>())?;
        }

        fsm.link.flush().map_err(|e| e.in_state::<Done>())?;
        fsm.wake.transfer_finished().map_err(|e| e.in_state::<Done>())?;
        fsm.frame = None;
        fsm.touch();
        let next = fsm.transition::<Idle>();
        Ok(next as Box<dyn ReceiverState>)
    }

    fn state_name(&self) -> &'static str {
        state_name::<Done>()
    }
}

impl ReceiverState for ReceiverFsm<Failed> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, LinkError> {
        let mut fsm = *self;
        let reason = fsm.failure.take()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".into());
        warn!("transfer aborted: {}", reason);

        fsm.link.flush().map_err(|e| e.in_state::<Failed>())?;
        fsm.wake.transfer_finished().map_err(|e| e.in_state::<Failed>())?;
        fsm.frame = None;
        fsm.chunker = None;
        fsm.unannounced = None;
        // fresh idle window so the sender can try again before we sleep
        fsm.touch();
        let next = fsm.transition::<Idle>();
        Ok(next as Box<dyn ReceiverState>)
    }

    fn state_name(&self) -> &'static str {
        state_name::<Failed>()
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl ReceiverFsm<Idle> {
    pub fn new(
        link: RadioLink,
        host: Box<dyn HostChannel>,
        wake: WakeCoordinator,
        config: LinkConfig,
    ) -> Box<dyn ReceiverState> {
        let last_activity_ms = link.clock().now_ms();
        Box::new(ReceiverFsm {
            state: PhantomData::<Idle>,
            link,
            host,
            wake,
            config,
            frame: None,
            chunker: None,
            unannounced: None,
            last_activity_ms,
            failure: None,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, LockstepClock, SimClock};
    use crate::config::{SleepPolicy, WakeConfirm};
    use crate::host::MockHost;
    use crate::power::{Line, MockPower, NullPower, PowerEvent};
    use crate::sender::{SenderFsm, SenderState};
    use crate::radio::{MockRadio, RadioLog};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn ack(value: u32) -> Vec<u8> {
        Frame::ack(value).encode().to_vec()
    }

    struct Harness {
        fsm: Option<Box<dyn ReceiverState>>,
        host: MockHost,
        power: MockPower,
        radio: Arc<Mutex<RadioLog>>,
        clock: SimClock,
    }

    impl Harness {
        fn new(config: LinkConfig) -> Self {
            Harness::with_radio(MockRadio::new(), config)
        }

        fn with_radio(radio: MockRadio, config: LinkConfig) -> Self {
            let clock = SimClock::new();
            let host = MockHost::new(clock.clone());
            let power = MockPower::new(clock.clone());
            let log = radio.handle();
            let link = RadioLink::new(Box::new(radio), Box::new(clock.clone()), config.timing.clone());
            let wake = WakeCoordinator::from_config(Box::new(power.clone()), &config);
            let fsm = ReceiverFsm::new(link, Box::new(host.clone()), wake, config);
            Harness { fsm: Some(fsm), host, power, radio: log, clock }
        }

        fn step(&mut self) -> &'static str {
            let fsm = self.fsm.take().unwrap().step().expect("step");
            let name = fsm.state_name();
            self.fsm = Some(fsm);
            name
        }

        /// Steps until the machine has left Idle and come back to it,
        /// returning the states passed through.
        fn run_transfer(&mut self) -> Vec<&'static str> {
            let mut trail = Vec::new();
            for _ in 0..100_000 {
                let name = self.step();
                if name == "Idle" && !trail.is_empty() {
                    return trail;
                }
                if name != "Idle" {
                    trail.push(name);
                }
            }
            panic!("transfer never finished");
        }

        fn queue(&self, packets: impl IntoIterator<Item = Vec<u8>>) {
            self.radio.lock().unwrap().inbox.extend(packets);
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.radio.lock().unwrap().written.clone()
        }
    }

    fn unframed() -> LinkConfig {
        let mut config = LinkConfig::default();
        config.forward_frame = false;
        config
    }

    fn chunks(data: &[u8]) -> Vec<Vec<u8>> {
        data.chunks(30)
            .enumerate()
            .map(|(seq, part)| build_chunk(part, seq as u16))
            .collect()
    }

    #[test]
    fn test_receives_sixty_five_bytes() {
        let mut h = Harness::new(unframed());
        let data: Vec<u8> = (0..65).collect();
        h.queue([encode_frame(Kind::TransmitBytes, 65).to_vec()]);
        h.queue(chunks(&data));

        let trail = h.run_transfer();

        assert_eq!(trail, vec!["FrameReceived", "FrameAcked", "ChunkLoop", "ChunkLoop", "ChunkLoop", "ChunkLoop", "Done"]);
        assert_eq!(h.host.output(), data);
        assert_eq!(h.written(), vec![ack(65), ack(0), ack(1), ack(2)]);
        assert!(h.radio.lock().unwrap().flush_rx >= 1);
    }

    #[test]
    fn test_forwards_frame_ahead_of_payload() {
        let mut h = Harness::new(LinkConfig::default());
        h.queue([encode_frame(Kind::TransmitBytes, 3).to_vec(), build_chunk(b"abc", 0)]);

        h.run_transfer();

        let mut expected = encode_frame(Kind::TransmitBytes, 3).to_vec();
        expected.extend_from_slice(b"abc");
        assert_eq!(h.host.output(), expected);
    }

    #[test]
    fn test_aborted_transfer_forwards_nothing() {
        let mut h = Harness::new(LinkConfig::default());
        let data: Vec<u8> = (0..65).collect();
        let parts = chunks(&data);
        h.queue([encode_frame(Kind::TransmitBytes, 65).to_vec(), parts[1].clone()]);

        let trail = h.run_transfer();

        assert_eq!(trail.last(), Some(&"Failed"));
        assert!(h.host.output().is_empty());
        assert_eq!(h.written(), vec![ack(65)]);
    }

    #[test]
    fn test_chunk_timeout_before_payload_forwards_nothing() {
        let mut h = Harness::new(LinkConfig::default());
        h.queue([encode_frame(Kind::TransmitBytes, 10).to_vec()]);

        let trail = h.run_transfer();

        assert_eq!(trail.last(), Some(&"Failed"));
        assert!(h.host.output().is_empty());
    }

    #[test]
    fn test_empty_transfer_forwards_frame_only() {
        let mut h = Harness::new(LinkConfig::default());
        h.queue([encode_frame(Kind::TransmitBytes, 0).to_vec()]);

        let trail = h.run_transfer();

        assert_eq!(trail, vec!["FrameReceived", "FrameAcked", "ChunkLoop", "Done"]);
        assert_eq!(h.host.output(), encode_frame(Kind::TransmitBytes, 0).to_vec());
        assert_eq!(h.written(), vec![ack(0)]);
    }

    #[test]
    fn test_single_byte_transfer_has_one_chunk() {
        let mut h = Harness::new(unframed());
        h.queue([encode_frame(Kind::TransmitBytes, 1).to_vec(), build_chunk(&[0x7E], 0)]);

        let trail = h.run_transfer();

        assert_eq!(trail.iter().filter(|s| **s == "ChunkLoop").count(), 2);
        assert_eq!(trail.last(), Some(&"Done"));
        assert_eq!(h.host.output(), vec![0x7E]);
        assert_eq!(h.written(), vec![ack(1), ack(0)]);
    }

    #[test]
    fn test_duplicate_chunk_is_reacked_once_forwarded_once() {
        let mut h = Harness::new(unframed());
        let data: Vec<u8> = (0..40).collect();
        let parts = chunks(&data);
        h.queue([encode_frame(Kind::TransmitBytes, 40).to_vec()]);
        // our ack of chunk 0 was lost, so the sender repeats it
        h.queue([parts[0].clone(), parts[0].clone(), parts[1].clone()]);

        h.run_transfer();

        assert_eq!(h.host.output(), data);
        assert_eq!(h.written(), vec![ack(40), ack(0), ack(0), ack(1)]);
    }

    #[test]
    fn test_chunk_from_the_future_aborts_silently() {
        let mut h = Harness::new(unframed());
        let data: Vec<u8> = (0..65).collect();
        let parts = chunks(&data);
        h.queue([encode_frame(Kind::TransmitBytes, 65).to_vec(), parts[0].clone(), parts[2].clone()]);

        let trail = h.run_transfer();

        assert_eq!(trail.last(), Some(&"Failed"));
        assert_eq!(h.host.output(), &data[..30]);
        assert_eq!(h.written(), vec![ack(65), ack(0)]);
    }

    #[test]
    fn test_chunk_timeout_aborts_and_restarts_idle_timer() {
        let mut config = unframed();
        config.sleep.policy = SleepPolicy::Timed;
        let mut h = Harness::new(config);
        h.clock.advance(Duration::from_millis(4500));
        h.queue([encode_frame(Kind::TransmitBytes, 10).to_vec()]);

        let trail = h.run_transfer();

        assert_eq!(trail.last(), Some(&"Failed"));
        assert!(h.clock.now_ms() >= 5500);
        // a just-failed transfer does not put us straight to sleep
        h.step();
        assert!(h.power.events().is_empty());
    }

    #[test]
    fn test_unknown_kind_and_stray_acks_are_dropped() {
        let mut h = Harness::new(unframed());
        h.queue([vec![0x42, 0, 0, 0, 1], ack(3), vec![1, 2, 3]]);

        for _ in 0..5 {
            assert_eq!(h.step(), "Idle");
        }

        assert!(h.written().is_empty());
        assert!(h.host.output().is_empty());
    }

    #[test]
    fn test_wake_handshake_then_transfer() {
        let mut h = Harness::new(unframed());
        h.host.push_input(b"..awake");
        h.queue([encode_frame(Kind::TransmitBytesWithWake, 4).to_vec(), build_chunk(b"ping", 0)]);

        let trail = h.run_transfer();

        assert_eq!(&trail[..3], &["FrameReceived", "WakeHandshake", "FrameAcked"]);
        assert_eq!(
            h.power.events(),
            vec![PowerEvent::Line(Line::Wake, true), PowerEvent::Line(Line::Wake, false)]
        );
        assert_eq!(h.written(), vec![ack(4), ack(0)]);
        assert_eq!(h.host.output(), b"ping");
    }

    #[test]
    fn test_wake_timeout_sends_no_ack_and_flushes() {
        let mut h = Harness::new(unframed());
        h.queue([encode_frame(Kind::TransmitString, 5).to_vec(), build_chunk(b"hello", 0)]);

        let trail = h.run_transfer();

        assert_eq!(trail, vec!["FrameReceived", "WakeHandshake", "Failed"]);
        assert!(h.clock.now_ms() >= 1000);
        let log = h.radio.lock().unwrap();
        assert!(log.written.is_empty(), "no ack for the frame");
        assert!(log.inbox.is_empty(), "radio buffers flushed");
        assert!(log.flush_rx >= 1 && log.flush_tx >= 1);
        assert!(h.host.output().is_empty());
    }

    #[test]
    fn test_blind_delay_wake_still_acks() {
        let mut config = unframed();
        config.wake.confirm = WakeConfirm::BlindDelay;
        let mut h = Harness::new(config);
        h.queue([encode_frame(Kind::TransmitBytesWithWake, 2).to_vec(), build_chunk(b"ok", 0)]);

        h.run_transfer();

        assert!(h.clock.now_ms() >= 1000);
        assert_eq!(h.written(), vec![ack(2), ack(0)]);
    }

    #[test]
    fn test_idle_timeout_sleeps_then_accepts_transfer() {
        let mut config = unframed();
        config.sleep.policy = SleepPolicy::Timed;
        let mut h = Harness::new(config);

        while h.clock.now_ms() < 5000 {
            assert_eq!(h.step(), "Idle");
            assert!(h.power.events().is_empty());
        }
        h.step();

        assert_eq!(
            h.power.events(),
            vec![
                PowerEvent::Line(Line::RadioPower, true),
                PowerEvent::Sleep(Duration::from_millis(8000)),
                PowerEvent::Line(Line::RadioPower, false),
            ]
        );
        {
            let log = h.radio.lock().unwrap();
            assert_eq!(log.reconfigured, 1);
            assert!(log.listening);
        }

        // fresh idle timer: no second sleep right away
        h.step();
        assert_eq!(h.power.events().len(), 3);

        h.queue([encode_frame(Kind::TransmitBytes, 3).to_vec(), build_chunk(b"abc", 0)]);
        h.run_transfer();
        assert_eq!(h.host.output(), b"abc");
        assert_eq!(h.written(), vec![ack(3), ack(0)]);
    }

    #[test]
    fn test_interrupt_policy_disarms_during_transfer() {
        let mut config = unframed();
        config.sleep.policy = SleepPolicy::Interrupt;
        let mut h = Harness::new(config);
        h.queue([encode_frame(Kind::TransmitBytes, 3).to_vec(), build_chunk(b"abc", 0)]);

        h.run_transfer();

        assert_eq!(
            h.power.events(),
            vec![PowerEvent::InterruptDisabled, PowerEvent::InterruptEnabled]
        );
    }

    #[test]
    fn test_image_frame_expects_packed_size() {
        let mut h = Harness::new(unframed());
        h.host.push_input(b"awake");
        let frame = Frame::image(Kind::Transmit3BitPackedImage, 4, 6);
        h.queue([frame.encode().to_vec(), build_chunk(&[0xAA; 12], 0)]);

        h.run_transfer();

        assert_eq!(h.host.output(), vec![0xAA; 12]);
        assert_eq!(h.written(), vec![ack(frame.value), ack(0)]);
    }

    #[test]
    fn test_talks_to_a_sender_over_a_lossy_ack_path() {
        // Sender side played by the responder: it resends chunk 0 when its
        // first ack is "lost", as a real sender would after a timeout.
        let mut dropped = false;
        let radio = MockRadio::with_responder(move |packet| {
            if packet == ack(0).as_slice() && !dropped {
                dropped = true;
                return vec![build_chunk(b"first", 0)];
            }
            if packet == ack(0).as_slice() {
                return vec![build_chunk(b"x", 1)];
            }
            vec![]
        });
        let mut h = Harness::with_radio(radio, {
            let mut config = unframed();
            config.radio.max_packet = 7;
            config
        });
        h.queue([encode_frame(Kind::TransmitBytes, 6).to_vec(), build_chunk(b"first", 0)]);

        h.run_transfer();

        assert_eq!(h.host.output(), b"firstx");
        assert_eq!(h.written(), vec![ack(6), ack(0), ack(0), ack(1)]);
    }

    // ------------------------------------------------------------------------
    // Sender and receiver over one shared channel
    // ------------------------------------------------------------------------

    /// Steps a machine until it has entered Done or Failed `transfers` times.
    fn finish<S: ?Sized>(
        mut state: Box<S>,
        transfers: usize,
        step: impl Fn(Box<S>) -> Result<Box<S>, LinkError>,
        name: impl Fn(&S) -> &'static str,
    ) -> Vec<&'static str> {
        let mut endings = Vec::new();
        for _ in 0..200_000 {
            state = step(state).expect("step");
            let entered = name(&*state);
            if matches!(entered, "Done" | "Failed") {
                endings.push(entered);
                if endings.len() == transfers {
                    return endings;
                }
            }
        }
        panic!("only {} of {} transfers finished", endings.len(), transfers);
    }

    struct PairRun {
        receiver_output: Vec<u8>,
        sender_output: Vec<u8>,
        receiver_endings: Vec<&'static str>,
        sender_endings: Vec<&'static str>,
        elapsed_ms: u64,
    }

    /// Runs a sender and a receiver on two threads over paired radios.
    fn run_pair(config: LinkConfig, sender_input: &[u8], receiver_input: &[u8], transfers: usize) -> PairRun {
        let clock = LockstepClock::new(2);
        let (near, far) = MockRadio::pair();

        let sender_host = MockHost::new(clock.clone());
        sender_host.push_input(sender_input);
        let receiver_host = MockHost::new(clock.clone());
        receiver_host.push_input(receiver_input);

        let sender = SenderFsm::new(
            RadioLink::new(Box::new(near), Box::new(clock.clone()), config.timing.clone()),
            Box::new(sender_host.clone()),
            config.clone(),
        );
        let receiver = ReceiverFsm::new(
            RadioLink::new(Box::new(far), Box::new(clock.clone()), config.timing.clone()),
            Box::new(receiver_host.clone()),
            WakeCoordinator::from_config(Box::new(NullPower), &config),
            config,
        );

        let sending = std::thread::spawn({
            let clock = clock.clone();
            move || {
                let _departure = clock.departure();
                finish(sender, transfers, |s: Box<dyn SenderState>| s.step(), |s| s.state_name())
            }
        });
        let receiving = std::thread::spawn({
            let clock = clock.clone();
            move || {
                let _departure = clock.departure();
                finish(receiver, transfers, |s: Box<dyn ReceiverState>| s.step(), |s| s.state_name())
            }
        });
        let sender_endings = sending.join().unwrap();
        let receiver_endings = receiving.join().unwrap();

        PairRun {
            receiver_output: receiver_host.output(),
            sender_output: sender_host.output(),
            receiver_endings,
            sender_endings,
            elapsed_ms: clock.now_ms(),
        }
    }

    fn acks(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|&v| Frame::ack(v).encode()).collect()
    }

    #[test]
    fn test_sender_and_receiver_complete_plain_and_wake_transfers() {
        let data: Vec<u8> = (0..65).collect();
        let mut input = encode_frame(Kind::TransmitBytes, 65).to_vec();
        input.extend_from_slice(&data);
        input.extend_from_slice(&encode_frame(Kind::TransmitBytesWithWake, 3));
        input.extend_from_slice(b"abc");

        let run = run_pair(LinkConfig::default(), &input, b"awake", 2);

        assert_eq!(run.sender_endings, vec!["Done", "Done"]);
        assert_eq!(run.receiver_endings, vec!["Done", "Done"]);
        assert_eq!(run.receiver_output, input);
        assert_eq!(run.sender_output, acks(&[65, 0, 1, 2, 3, 0]));
    }

    #[test]
    fn test_sender_waits_out_a_blind_delay_wake() {
        let mut config = LinkConfig::default();
        config.forward_frame = false;
        config.wake.confirm = WakeConfirm::BlindDelay;
        let mut input = status_message("hello over the air");
        input.extend_from_slice(&encode_frame(Kind::TransmitBytes, 2));
        input.extend_from_slice(b"ok");

        let run = run_pair(config, &input, b"", 2);

        assert_eq!(run.sender_endings, vec!["Done", "Done"]);
        assert_eq!(run.receiver_output, b"hello over the airok");
        assert_eq!(run.sender_output, acks(&[18, 0, 2, 0]));
        assert!(run.elapsed_ms >= 1000);
    }
}
