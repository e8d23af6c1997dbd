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

//! Power and wake coordination for the receiver.
//!
//! Two jobs: rousing the downstream host before data is forwarded to it
//! (a pulse on the wake line, then a handshake), and putting this end to
//! sleep between transfers according to a [`WakePolicy`].

use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::clock::{Clock, Deadline};
use crate::config::{LinkConfig, SleepConfig, SleepPolicy, WakeConfig, WakeConfirm};
use crate::error::LinkError;
use crate::host::HostChannel;
use crate::power::{Line, PowerControl};
use crate::protocol::Kind;
use crate::radio::RadioChannel;

// ============================================================================
// Wake Policies
// ============================================================================

pub trait WakePolicy: Send {
    /// Called on every idle poll with the time since the last activity.
    /// Returns true if the device slept, so the idle timer restarts.
    fn on_idle(
        &mut self,
        idle_ms: u64,
        power: &mut dyn PowerControl,
        radio: &mut dyn RadioChannel,
        clock: &dyn Clock,
    ) -> Result<bool, LinkError>;

    fn transfer_started(&mut self, _power: &mut dyn PowerControl) -> Result<(), LinkError> {
        Ok(())
    }

    fn transfer_finished(&mut self, _power: &mut dyn PowerControl) -> Result<(), LinkError> {
        Ok(())
    }
}

pub struct NoSleep;

impl WakePolicy for NoSleep {
    fn on_idle(
        &mut self,
        _idle_ms: u64,
        _power: &mut dyn PowerControl,
        _radio: &mut dyn RadioChannel,
        _clock: &dyn Clock,
    ) -> Result<bool, LinkError> {
        Ok(false)
    }
}

/// Powers the radio down and sleeps a fixed number of cycles once idle.
/// Anything sent while asleep is lost; the sender sees a missing frame ack.
pub struct TimedSleep {
    config: SleepConfig,
}

impl TimedSleep {
    pub fn new(config: SleepConfig) -> Self {
        TimedSleep { config }
    }
}

impl WakePolicy for TimedSleep {
    fn on_idle(
        &mut self,
        idle_ms: u64,
        power: &mut dyn PowerControl,
        radio: &mut dyn RadioChannel,
        clock: &dyn Clock,
    ) -> Result<bool, LinkError> {
        if idle_ms < self.config.idle_timeout_ms {
            return Ok(false);
        }

        info!(
            "idle for {} ms, sleeping {} x {} ms",
            idle_ms, self.config.sleep_cycles, self.config.cycle_ms
        );
        power.set_line(Line::RadioPower, true)?;
        clock.sleep(Duration::from_millis(self.config.power_settle_ms));
        for _ in 0..self.config.sleep_cycles {
            power.sleep_for(Duration::from_millis(self.config.cycle_ms))?;
        }

        power.set_line(Line::RadioPower, false)?;
        radio.reconfigure()?;
        radio.set_listening(true)?;
        info!("awake, listening again");
        Ok(true)
    }
}

/// Keeps the radio powered and sleeps with the wake interrupt armed, so a
/// packet arriving ends the sleep. The interrupt is disarmed while a
/// transfer runs.
pub struct InterruptWake {
    config: SleepConfig,
    armed: bool,
}

impl InterruptWake {
    pub fn new(config: SleepConfig) -> Self {
        InterruptWake { config, armed: false }
    }
}

impl WakePolicy for InterruptWake {
    fn on_idle(
        &mut self,
        idle_ms: u64,
        power: &mut dyn PowerControl,
        _radio: &mut dyn RadioChannel,
        _clock: &dyn Clock,
    ) -> Result<bool, LinkError> {
        if idle_ms < self.config.idle_timeout_ms {
            return Ok(false);
        }

        if !self.armed {
            power.enable_wake_interrupt()?;
            self.armed = true;
        }

        info!("idle for {} ms, sleeping until interrupt", idle_ms);
        for _ in 0..self.config.sleep_cycles {
            power.sleep_for(Duration::from_millis(self.config.cycle_ms))?;
        }
        Ok(true)
    }

    fn transfer_started(&mut self, power: &mut dyn PowerControl) -> Result<(), LinkError> {
        power.disable_wake_interrupt()?;
        self.armed = false;
        Ok(())
    }

    fn transfer_finished(&mut self, power: &mut dyn PowerControl) -> Result<(), LinkError> {
        power.enable_wake_interrupt()?;
        self.armed = true;
        Ok(())
    }
}

pub fn policy_for(config: &SleepConfig) -> Box<dyn WakePolicy> {
    match config.policy {
        SleepPolicy::None => Box::new(NoSleep),
        SleepPolicy::Timed => Box::new(TimedSleep::new(config.clone())),
        SleepPolicy::Interrupt => Box::new(InterruptWake::new(config.clone())),
    }
}

// ============================================================================
// Token Scanner
// ============================================================================

/// Finds the wake token anywhere in the host's byte stream
#[derive(Debug)]
pub struct TokenScanner {
    token: Vec<u8>,
    window: VecDeque<u8>,
}

impl TokenScanner {
    pub fn new(token: &[u8]) -> Self {
        TokenScanner {
            token: token.to_vec(),
            window: VecDeque::with_capacity(token.len()),
        }
    }

    /// Feeds one byte; true once the last bytes seen spell the token.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.window.len() == self.token.len() {
            self.window.pop_front();
        }
        self.window.push_back(byte);
        self.window.len() == self.token.len() && self.window.iter().eq(self.token.iter())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct WakeCoordinator {
    power: Box<dyn PowerControl>,
    policy: Box<dyn WakePolicy>,
    wake: WakeConfig,
    in_transfer: bool,
}

impl WakeCoordinator {
    pub fn new(power: Box<dyn PowerControl>, policy: Box<dyn WakePolicy>, wake: WakeConfig) -> Self {
        if wake.confirm == WakeConfirm::BlindDelay {
            warn!("wake confirmation uses a blind delay; a slow host will miss data");
        }
        WakeCoordinator {
            power,
            policy,
            wake,
            in_transfer: false,
        }
    }

    pub fn from_config(power: Box<dyn PowerControl>, config: &LinkConfig) -> Self {
        WakeCoordinator::new(power, policy_for(&config.sleep), config.wake.clone())
    }

    pub fn requires_wake(&self, kind: Kind) -> bool {
        self.wake.kinds.contains(&kind)
    }

    pub fn pulse(&mut self, clock: &dyn Clock) -> Result<(), LinkError> {
        self.power.set_line(Line::Wake, true)?;
        clock.sleep(Duration::from_micros(self.wake.pulse_us));
        self.power.set_line(Line::Wake, false)?;
        Ok(())
    }

    /// Waits until the host shows it is awake.
    pub fn confirm(&mut self, host: &mut dyn HostChannel, clock: &dyn Clock) -> Result<(), LinkError> {
        match self.wake.confirm {
            WakeConfirm::BlindDelay => {
                clock.sleep(Duration::from_millis(self.wake.blind_delay_ms));
                Ok(())
            }
            WakeConfirm::Token => {
                let deadline = Deadline::after(clock, self.wake.handshake_timeout_ms);
                let mut scanner = TokenScanner::new(self.wake.token.as_bytes());
                let mut buf = [0u8; 16];

                while !deadline.expired(clock) {
                    match host.read_timeout(&mut buf, deadline.remaining(clock)) {
                        Ok(0) => clock.sleep(crate::clock::POLL_INTERVAL),
                        Ok(n) => {
                            if buf[..n].iter().any(|&b| scanner.push(b)) {
                                debug!("host is awake");
                                return Ok(());
                            }
                        }
                        Err(e) if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        ) => {}
                        Err(e) => return Err(e.into()),
                    }
                }

                Err(LinkError::WakeTimeout(deadline.limit_ms()))
            }
        }
    }

    pub fn wake_host(&mut self, host: &mut dyn HostChannel, clock: &dyn Clock) -> Result<(), LinkError> {
        self.pulse(clock)?;
        self.confirm(host, clock)
    }

    pub fn idle(
        &mut self,
        idle_ms: u64,
        radio: &mut dyn RadioChannel,
        clock: &dyn Clock,
    ) -> Result<bool, LinkError> {
        self.policy.on_idle(idle_ms, self.power.as_mut(), radio, clock)
    }

    pub fn transfer_started(&mut self) -> Result<(), LinkError> {
        if !self.in_transfer {
            self.in_transfer = true;
            self.policy.transfer_started(self.power.as_mut())?;
        }
        Ok(())
    }

    pub fn transfer_finished(&mut self) -> Result<(), LinkError> {
        if self.in_transfer {
            self.in_transfer = false;
            self.policy.transfer_finished(self.power.as_mut())?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
