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

//! Link configuration: radio parameters, protocol timing, wake and sleep.
//!
//! Every section has defaults matching the field-tested firmware, so an
//! empty TOML file is a valid configuration.

use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::error::{LinkError, Result};
use crate::protocol::{Kind, MAX_PACKET_LEN, TRAILER_LEN, WAKE_TOKEN};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Receiver writes each accepted command frame to its host ahead of the
    /// payload, so the host can tell transfers apart
    pub forward_frame: bool,
    pub radio: RadioConfig,
    pub timing: TimingConfig,
    pub wake: WakeConfig,
    pub sleep: SleepConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            forward_frame: true,
            radio: RadioConfig::default(),
            timing: TimingConfig::default(),
            wake: WakeConfig::default(),
            sleep: SleepConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LinkError::Config(format!("failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| LinkError::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(TRAILER_LEN + 1..=MAX_PACKET_LEN).contains(&self.radio.max_packet) {
            return Err(LinkError::Config(format!(
                "radio.max_packet must be between {} and {}",
                TRAILER_LEN + 1,
                MAX_PACKET_LEN
            )));
        }

        let t = &self.timing;
        let timeouts = [
            ("frame_ack_timeout_ms", t.frame_ack_timeout_ms),
            ("chunk_ack_timeout_ms", t.chunk_ack_timeout_ms),
            ("radio_send_timeout_ms", t.radio_send_timeout_ms),
            ("chunk_deadline_ms", t.chunk_deadline_ms),
            ("host_read_timeout_ms", t.host_read_timeout_ms),
            ("chunk_receive_timeout_ms", t.chunk_receive_timeout_ms),
            ("ack_send_timeout_ms", t.ack_send_timeout_ms),
            ("wake.handshake_timeout_ms", self.wake.handshake_timeout_ms),
            ("sleep.idle_timeout_ms", self.sleep.idle_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(LinkError::Config(format!("{name} must be non-zero")));
        }

        if self.wake.token.is_empty() {
            return Err(LinkError::Config("wake.token must not be empty".into()));
        }

        if let Some(ms) = t.wake_frame_ack_timeout_ms {
            let window = self.wake.window_ms();
            if ms <= window {
                return Err(LinkError::Config(format!(
                    "timing.wake_frame_ack_timeout_ms must exceed the wake window of {window} ms"
                )));
            }
        }

        let address = self.radio.address.len();
        if !(3..=5).contains(&address) {
            return Err(LinkError::Config("radio.address must be 3 to 5 bytes".into()));
        }

        Ok(())
    }

    /// Payload bytes per chunk once the sequence trailer is accounted for.
    pub fn chunk_payload(&self) -> usize {
        self.radio.max_packet - TRAILER_LEN
    }

    /// How long the sender waits for the ack of a `kind` frame. Kinds the
    /// receiver wakes its host for are acked only after the wake completes.
    pub fn frame_ack_timeout(&self, kind: Kind) -> u64 {
        if !self.wake.kinds.contains(&kind) {
            return self.timing.frame_ack_timeout_ms;
        }
        self.timing.wake_frame_ack_timeout_ms
            .unwrap_or(self.timing.frame_ack_timeout_ms + self.wake.window_ms())
    }
}

// ============================================================================
// Radio
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub channel: u8,
    pub address: String,
    /// Largest packet in bytes, trailer included
    pub max_packet: usize,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            channel: 85,
            address: "00050".into(),
            max_packet: MAX_PACKET_LEN,
        }
    }
}

// ============================================================================
// Timing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Sender wait for the ack of a command frame
    pub frame_ack_timeout_ms: u64,
    /// Sender wait for the ack of one chunk attempt
    pub chunk_ack_timeout_ms: u64,
    /// How long the sender keeps retrying a failed radio write
    pub radio_send_timeout_ms: u64,
    /// Wall-clock budget for all attempts at one chunk
    pub chunk_deadline_ms: u64,
    /// Sender wait for payload bytes from its host
    pub host_read_timeout_ms: u64,
    /// Receiver wait for the next chunk
    pub chunk_receive_timeout_ms: u64,
    /// Receiver retry window when writing an ack
    pub ack_send_timeout_ms: u64,
    /// Sender wait for the ack of a frame the receiver wakes its host for.
    /// Unset means `frame_ack_timeout_ms` plus the wake window.
    pub wake_frame_ack_timeout_ms: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            frame_ack_timeout_ms: 100,
            chunk_ack_timeout_ms: 100,
            radio_send_timeout_ms: 300,
            chunk_deadline_ms: 2000,
            host_read_timeout_ms: 1000,
            chunk_receive_timeout_ms: 1000,
            ack_send_timeout_ms: 150,
            wake_frame_ack_timeout_ms: None,
        }
    }
}

// ============================================================================
// Wake
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeConfirm {
    /// Wait for the host to write the wake token
    Token,
    /// Wait a fixed time and assume the host is up. Races a slow host.
    BlindDelay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub pulse_us: u64,
    pub confirm: WakeConfirm,
    pub token: String,
    pub handshake_timeout_ms: u64,
    pub blind_delay_ms: u64,
    /// Command kinds that require waking the host before the ack
    pub kinds: Vec<Kind>,
}

impl WakeConfig {
    /// Longest the receiver spends waking its host before it acks the frame.
    pub fn window_ms(&self) -> u64 {
        let confirm = match self.confirm {
            WakeConfirm::Token => self.handshake_timeout_ms,
            WakeConfirm::BlindDelay => self.blind_delay_ms,
        };
        self.pulse_us.div_ceil(1000) + confirm
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        WakeConfig {
            pulse_us: 500,
            confirm: WakeConfirm::Token,
            token: WAKE_TOKEN.into(),
            handshake_timeout_ms: 1000,
            blind_delay_ms: 1000,
            kinds: vec![
                Kind::TransmitBytesWithWake,
                Kind::TransmitString,
                Kind::Transmit3BitPackedImage,
                Kind::TransmitImageRows,
            ],
        }
    }
}

// ============================================================================
// Sleep
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SleepPolicy {
    /// Stay awake
    None,
    /// Power the radio down and sleep for a fixed time once idle
    Timed,
    /// Keep the radio powered and sleep until its interrupt line fires
    Interrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub policy: SleepPolicy,
    pub idle_timeout_ms: u64,
    pub sleep_cycles: u32,
    pub cycle_ms: u64,
    /// Delay between powering the radio down and sleeping
    pub power_settle_ms: u64,
}

impl Default for SleepConfig {
    fn default() -> Self {
        SleepConfig {
            policy: SleepPolicy::None,
            idle_timeout_ms: 5000,
            sleep_cycles: 1,
            cycle_ms: 8000,
            power_settle_ms: 2,
        }
    }
}
