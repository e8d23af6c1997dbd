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

//! Drives single packets and single chunks across the radio.
//!
//! The receiver never asks for a resend. It re-acks duplicates and gives up
//! on gaps; every retry timer lives on the sending side.

use std::cmp::Ordering;
use tracing::{debug, trace, warn};
use crate::chunker::seq_order;
use crate::clock::{Clock, Deadline, POLL_INTERVAL};
use crate::config::TimingConfig;
use crate::error::LinkError;
use crate::host::HostChannel;
use crate::protocol::{decode_frame, split_chunk, Frame, Kind};
use crate::radio::RadioChannel;

/// How one attempt at one chunk ended
#[derive(Debug)]
pub enum ChunkOutcome {
    Delivered,
    /// Nothing came back in time; try the same chunk again
    TimedOut,
    /// The transfer cannot continue
    Aborted(LinkError),
}

/// Exclusive owner of the radio plus the clock its waits are measured on.
pub struct RadioLink {
    radio: Box<dyn RadioChannel>,
    clock: Box<dyn Clock>,
    timing: TimingConfig,
}

impl RadioLink {
    pub fn new(radio: Box<dyn RadioChannel>, clock: Box<dyn Clock>, timing: TimingConfig) -> Self {
        RadioLink { radio, clock, timing }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Split borrow for collaborators that need the radio and the clock at once.
    pub fn parts(&mut self) -> (&mut dyn RadioChannel, &dyn Clock) {
        (self.radio.as_mut(), self.clock.as_ref())
    }

    pub fn flush(&mut self) -> Result<(), LinkError> {
        self.radio.flush_rx()?;
        self.radio.flush_tx()?;
        Ok(())
    }

    /// Reconfigures and clears the radio, leaving it transmitting.
    pub fn reset(&mut self) -> Result<(), LinkError> {
        self.radio.reconfigure()?;
        self.flush()?;
        self.radio.set_listening(false)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Packet primitives
    // ------------------------------------------------------------------------

    /// Switches to transmit and retries the write until it goes out or
    /// `timeout_ms` has passed since the first attempt.
    pub fn send_packet(&mut self, packet: &[u8], timeout_ms: u64) -> Result<(), LinkError> {
        self.radio.set_listening(false)?;
        let deadline = Deadline::after(self.clock(), timeout_ms);
        let mut attempts = 1u32;

        while !self.radio.write(packet)? {
            if deadline.expired(self.clock()) {
                warn!("radio write failed after {} attempts", attempts);
                return Err(LinkError::SendFailed(timeout_ms));
            }
            self.clock.sleep(POLL_INTERVAL);
            attempts += 1;
        }

        if attempts > 1 {
            debug!("radio write succeeded after {} attempts", attempts);
        }
        Ok(())
    }

    /// Listens for up to `timeout_ms` and returns the first packet, staying
    /// in listen mode either way.
    pub fn listen_for(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>, LinkError> {
        self.radio.set_listening(true)?;
        let deadline = Deadline::after(self.clock(), timeout_ms);

        loop {
            if self.radio.available()? {
                if let Some(packet) = self.radio.read()? {
                    return Ok(Some(packet));
                }
            }
            if deadline.expired(self.clock()) {
                return Ok(None);
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    /// Non-blocking variant of [`listen_for`](Self::listen_for) for idle polling.
    pub fn poll_packet(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        self.radio.set_listening(true)?;
        if self.radio.available()? {
            return Ok(self.radio.read()?);
        }
        Ok(None)
    }

    /// Listens for a reply, then goes back to transmit. Clears the receive
    /// buffer if nothing arrived.
    pub fn await_reply(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>, LinkError> {
        let reply = self.listen_for(timeout_ms)?;
        self.radio.set_listening(false)?;
        if reply.is_none() {
            self.radio.flush_rx()?;
        }
        Ok(reply)
    }

    /// Sends an ack from the listening side and returns to listening.
    /// A lost ack is not an error here; the sender will retransmit.
    pub fn send_ack(&mut self, value: u32) -> Result<bool, LinkError> {
        let sent = match self.send_packet(&Frame::ack(value).encode(), self.timing.ack_send_timeout_ms) {
            Ok(()) => true,
            Err(LinkError::SendFailed(_)) => false,
            Err(e) => return Err(e),
        };
        self.radio.set_listening(true)?;
        trace!("ack {} {}", value, if sent { "sent" } else { "not sent" });
        Ok(sent)
    }

    // ------------------------------------------------------------------------
    // Chunk exchange
    // ------------------------------------------------------------------------

    /// One send-and-confirm cycle for a chunk packet carrying `seq`.
    ///
    /// A stale ack for the previous chunk is skipped; any other mismatch
    /// aborts because it is no longer known what the receiver holds.
    pub fn send_chunk_and_confirm(&mut self, packet: &[u8], seq: u16) -> Result<ChunkOutcome, LinkError> {
        match self.send_packet(packet, self.timing.radio_send_timeout_ms) {
            Ok(()) => {}
            Err(e @ LinkError::SendFailed(_)) => return Ok(ChunkOutcome::Aborted(e)),
            Err(e) => return Err(e),
        }

        let deadline = Deadline::after(self.clock(), self.timing.chunk_ack_timeout_ms);
        loop {
            let remaining = deadline.remaining(self.clock()).as_millis() as u64;
            let reply = match self.await_reply(remaining.max(1))? {
                Some(reply) => reply,
                None => return Ok(ChunkOutcome::TimedOut),
            };

            let frame = match decode_frame(&reply) {
                Ok(frame) if frame.kind == Kind::Ack => frame,
                Ok(frame) => {
                    return Ok(ChunkOutcome::Aborted(LinkError::Format(format!(
                        "expected ack, got {:?}",
                        frame.kind
                    ))));
                }
                Err(e) => return Ok(ChunkOutcome::Aborted(e)),
            };

            let got = frame.value as u16;
            match seq_order(got, seq) {
                Ordering::Equal if frame.value <= u16::MAX as u32 => return Ok(ChunkOutcome::Delivered),
                Ordering::Less if got == seq.wrapping_sub(1) => {
                    debug!("stale ack {} while waiting for {}", got, seq);
                    if deadline.expired(self.clock()) {
                        return Ok(ChunkOutcome::TimedOut);
                    }
                }
                _ => {
                    return Ok(ChunkOutcome::Aborted(LinkError::SequenceFault {
                        expected: seq,
                        got,
                    }));
                }
            }
        }
    }

    /// Waits for the chunk `expected_seq` of `size` bytes, forwards it to the
    /// host and acks it.
    ///
    /// Duplicates of earlier chunks are re-acked with their own sequence and
    /// dropped. A chunk from the future aborts without an ack.
    pub fn receive_chunk_and_ack(
        &mut self,
        expected_seq: u16,
        size: usize,
        host: &mut dyn HostChannel,
    ) -> Result<ChunkOutcome, LinkError> {
        loop {
            let packet = match self.listen_for(self.timing.chunk_receive_timeout_ms)? {
                Some(packet) => packet,
                None => return Ok(ChunkOutcome::TimedOut),
            };

            let (payload, got) = match split_chunk(&packet) {
                Ok(parts) => parts,
                Err(e) => {
                    debug!("dropping packet: {}", e);
                    continue;
                }
            };

            match seq_order(got, expected_seq) {
                Ordering::Less => {
                    debug!("duplicate chunk {} while waiting for {}", got, expected_seq);
                    self.send_ack(got as u32)?;
                }
                Ordering::Greater => {
                    return Ok(ChunkOutcome::Aborted(LinkError::SequenceFault {
                        expected: expected_seq,
                        got,
                    }));
                }
                Ordering::Equal if payload.len() != size => {
                    debug!("chunk {} is {} bytes, expected {}", got, payload.len(), size);
                }
                Ordering::Equal => {
                    host.write_all(payload)?;
                    self.send_ack(got as u32)?;
                    return Ok(ChunkOutcome::Delivered);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
