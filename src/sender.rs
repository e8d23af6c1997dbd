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
use tracing::{debug, info, warn};
use crate::chunker::Chunker;
use crate::clock::{Deadline, POLL_INTERVAL};
use crate::config::LinkConfig;
use crate::engine::{ChunkOutcome, RadioLink};
use crate::error::{state_name, LinkError};
use crate::host::{discard_within, read_exact_within, HostChannel};
use crate::protocol::*;

// ============================================================================
// States
// ============================================================================

pub struct Idle;
pub struct AwaitingHostFrame;
pub struct FrameSent;
pub struct AwaitingFrameAck;
pub struct ChunkLoop;
pub struct Done;
pub struct Failed;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    link: RadioLink,
    host: Box<dyn HostChannel>,
    config: LinkConfig,
    frame: Option<Frame>,
    chunker: Option<Chunker>,
    failure: Option<LinkError>,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError>;

    fn state_name(&self) -> &'static str;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            link: self.link,
            host: self.host,
            config: self.config,
            frame: self.frame,
            chunker: self.chunker,
            failure: self.failure,
        })
    }

    /// Abandons the transfer. Errors that are not transfer-local are fatal.
    fn fail(mut self, e: LinkError) -> Result<Box<dyn SenderState>, LinkError> {
        if !e.is_transfer_local() {
            return Err(e.in_state::<S>());
        }
        self.failure = Some(e);
        Ok(self.transition::<Failed>() as Box<dyn SenderState>)
    }

    fn report(&mut self, frame: Frame) -> Result<(), LinkError> {
        self.host.write_all(&frame.encode()).map_err(|e| LinkError::from(e).in_state::<S>())
    }

    fn report_nak(&mut self, seq: u16) -> Result<(), LinkError> {
        self.report(Frame::nak(seq as u32))?;
        self.link.reset().map_err(|e| e.in_state::<S>())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<Idle> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError> {
        let mut fsm = *self;
        let waiting = fsm.host.available().map_err(|e| LinkError::from(e).in_state::<Idle>())?;

        if waiting > 0 {
            let next = fsm.transition::<AwaitingHostFrame>();
            Ok(next as Box<dyn SenderState>)
        } else {
            fsm.link.clock().sleep(POLL_INTERVAL);
            Ok(Box::new(fsm) as Box<dyn SenderState>)
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<Idle>()
    }
}

impl SenderState for SenderFsm<AwaitingHostFrame> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError> {
        let mut fsm = *self;
        let timeout = fsm.config.timing.host_read_timeout_ms;

        let mut buf = [0u8; FRAME_LEN];
        match read_exact_within(fsm.host.as_mut(), fsm.link.clock(), &mut buf, timeout) {
            Ok(()) => {}
            Err(e) if e.is_transfer_local() => {
                warn!("incomplete frame from host: {}", e);
                let next = fsm.transition::<Idle>();
                return Ok(next as Box<dyn SenderState>);
            }
            Err(e) => return Err(e.in_state::<AwaitingHostFrame>()),
        }

        match decode_frame(&buf) {
            Ok(frame) if !frame.kind.is_control() => {
                debug!("host frame: {:?} {}", frame.kind, frame.value);
                fsm.frame = Some(frame);
                let next = fsm.transition::<FrameSent>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(frame) => {
                debug!("ignoring {:?} frame from host", frame.kind);
                let next = fsm.transition::<Idle>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) => {
                debug!("dropping host frame {:02X?}: {}", buf, e);
                let next = fsm.transition::<Idle>();
                Ok(next as Box<dyn SenderState>)
            }
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<AwaitingHostFrame>()
    }
}

impl SenderState for SenderFsm<FrameSent> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError> {
        let mut fsm = *self;
        let Some(frame) = fsm.frame else {
            let next = fsm.transition::<Idle>();
            return Ok(next as Box<dyn SenderState>);
        };

        if frame.kind.has_dimensions() {
            let (height, width) = frame.dimensions();
            info!("starting {:?} transfer, {}x{}", frame.kind, height, width);
        } else {
            info!("starting {:?} transfer, {} bytes", frame.kind, frame.value);
        }
        let timeout = fsm.config.timing.radio_send_timeout_ms;
        match fsm.link.send_packet(&frame.encode(), timeout) {
            Ok(()) => {
                let next = fsm.transition::<AwaitingFrameAck>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) => fsm.fail(e),
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<FrameSent>()
    }
}

impl SenderState for SenderFsm<AwaitingFrameAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError> {
        let mut fsm = *self;
        let Some(frame) = fsm.frame else {
            let next = fsm.transition::<Idle>();
            return Ok(next as Box<dyn SenderState>);
        };

        // Not retried here: the host decides whether to start over
        let timeout = fsm.config.frame_ack_timeout(frame.kind);
        let reply = match fsm.link.await_reply(timeout) {
            Ok(Some(reply)) => reply,
            Ok(None) => return fsm.fail(LinkError::LinkTimeout(timeout)),
            Err(e) => return fsm.fail(e),
        };

        match decode_frame(&reply) {
            Ok(ack) if ack.kind == Kind::Ack && ack.value == frame.value => {
                debug!("frame acked");
                fsm.report(Frame::ack(frame.value))?;
                let total = frame.payload_len().unwrap_or(0);
                fsm.chunker = Some(Chunker::new(total, fsm.config.chunk_payload()));
                let next = fsm.transition::<ChunkLoop>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(other) => fsm.fail(LinkError::Format(format!(
                "frame answered with {:?} {}",
                other.kind, other.value
            ))),
            Err(e) => fsm.fail(e),
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<AwaitingFrameAck>()
    }
}

impl SenderState for SenderFsm<ChunkLoop> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError> {
        let mut fsm = *self;
        let Some(chunk) = fsm.chunker.as_mut().and_then(|c| c.next()) else {
            let next = fsm.transition::<Done>();
            return Ok(next as Box<dyn SenderState>);
        };
        let seq = chunk.sequence();
        let timing = fsm.config.timing.clone();

        let mut payload = vec![0u8; chunk.size];
        if let Err(e) = read_exact_within(
            fsm.host.as_mut(),
            fsm.link.clock(),
            &mut payload,
            timing.host_read_timeout_ms,
        ) {
            return fsm.fail(e);
        }

        let packet = build_chunk(&payload, seq);
        let deadline = Deadline::after(fsm.link.clock(), timing.chunk_deadline_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let outcome = fsm.link.send_chunk_and_confirm(&packet, seq)
                .map_err(|e| e.in_state::<ChunkLoop>())?;

            match outcome {
                ChunkOutcome::Delivered => {
                    debug!("chunk {} ({} bytes) delivered after {} attempt(s)", seq, chunk.size, attempts);
                    fsm.report(Frame::ack(seq as u32))?;
                    return Ok(Box::new(fsm) as Box<dyn SenderState>);
                }
                ChunkOutcome::TimedOut => {
                    debug!("no ack for chunk {} (attempt {})", seq, attempts);
                    if deadline.expired(fsm.link.clock()) {
                        fsm.report_nak(seq)?;
                        return fsm.fail(LinkError::LinkTimeout(timing.chunk_deadline_ms));
                    }
                }
                ChunkOutcome::Aborted(e @ LinkError::SendFailed(_)) => {
                    fsm.report_nak(seq)?;
                    return fsm.fail(e);
                }
                ChunkOutcome::Aborted(e) => return fsm.fail(e),
            }
        }
    }

    fn state_name(&self) -> &'static str {
        state_name::<ChunkLoop>()
    }
}

impl SenderState for SenderFsm<Done> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError> {
        let mut fsm = *self;
        if let Some(chunker) = fsm.chunker.take() {
            info!("transfer complete: {} bytes in {} chunks", chunker.total(), chunker.chunk_count());
        }
        fsm.frame = None;
        let next = fsm.transition::<Idle>();
        Ok(next as Box<dyn SenderState>)
    }

    fn state_name(&self) -> &'static str {
        state_name::<Done>()
    }
}

impl SenderState for SenderFsm<Failed> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, LinkError> {
        let mut fsm = *self;
        let failure = fsm.failure.take();

        // Payload the host already committed to must not be read as the next frame
        let unread: u32 = match (&failure, &fsm.chunker) {
            (Some(LinkError::HostStarvation { .. }), _) => 0,
            (_, Some(chunker)) => chunker.remaining(),
            (_, None) => fsm.frame.and_then(|f| f.payload_len()).unwrap_or(0),
        };
        let unread = unread as usize;
        if unread > 0 {
            let timeout = fsm.config.timing.host_read_timeout_ms;
            let discarded = discard_within(fsm.host.as_mut(), fsm.link.clock(), unread, timeout)
                .map_err(|e| e.in_state::<Failed>())?;
            if discarded < unread {
                warn!("host stopped after {} of {} canceled payload bytes", discarded, unread);
            } else {
                debug!("discarded {} canceled payload bytes", discarded);
            }
        }

        let reason = failure
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".into());
        warn!("transfer canceled: {}", reason);

        fsm.host.write_all(&status_message(&format!("transfer canceled: {}", reason)))
            .map_err(|e| LinkError::from(e).in_state::<Failed>())?;

        fsm.frame = None;
        fsm.chunker = None;
        let next = fsm.transition::<Idle>();
        Ok(next as Box<dyn SenderState>)
    }

    fn state_name(&self) -> &'static str {
        state_name::<Failed>()
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<Idle> {
    pub fn new(link: RadioLink, host: Box<dyn HostChannel>, config: LinkConfig) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<Idle>,
            link,
            host,
            config,
            frame: None,
            chunker: None,
            failure: None,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
