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

use std::time::Duration;
use serialport::SerialPort as SerialPortTrait;
use tracing::{debug, trace};

/// Output lines the receiver drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    /// Pulsed to rouse the downstream host
    Wake,
    /// High cuts power to the radio
    RadioPower,
}

// ============================================================================
// PowerControl Trait
// ============================================================================

pub trait PowerControl: Send {
    fn set_line(&mut self, line: Line, high: bool) -> std::io::Result<()>;

    /// Low-power sleep. May end early if the wake interrupt is enabled and fires.
    fn sleep_for(&mut self, duration: Duration) -> std::io::Result<()>;

    fn enable_wake_interrupt(&mut self) -> std::io::Result<()>;

    fn disable_wake_interrupt(&mut self) -> std::io::Result<()>;
}

// ============================================================================
// Null Power
// ============================================================================

/// No lines to drive; sleeping just parks the thread.
pub struct NullPower;

impl PowerControl for NullPower {
    fn set_line(&mut self, line: Line, high: bool) -> std::io::Result<()> {
        trace!("{:?} line {}", line, if high { "high" } else { "low" });
        Ok(())
    }

    fn sleep_for(&mut self, duration: Duration) -> std::io::Result<()> {
        std::thread::sleep(duration);
        Ok(())
    }

    fn enable_wake_interrupt(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn disable_wake_interrupt(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Serial Line Power
// ============================================================================

/// Drives the wake line through DTR and the radio power switch through RTS
/// of a serial port, e.g. a USB-UART wired to the host's wake pin.
pub struct SerialLinePower {
    port: Box<dyn SerialPortTrait>,
    wake_interrupt: bool,
}

impl SerialLinePower {
    pub fn open(port_name: &str) -> Result<Self, serialport::Error> {
        let mut port = serialport::new(port_name, 9600).open()?;
        port.write_data_terminal_ready(false)?;
        port.write_request_to_send(false)?;
        Ok(SerialLinePower { port, wake_interrupt: false })
    }
}

impl PowerControl for SerialLinePower {
    fn set_line(&mut self, line: Line, high: bool) -> std::io::Result<()> {
        let result = match line {
            Line::Wake => self.port.write_data_terminal_ready(high),
            Line::RadioPower => self.port.write_request_to_send(high),
        };
        result.map_err(std::io::Error::other)
    }

    fn sleep_for(&mut self, duration: Duration) -> std::io::Result<()> {
        if !self.wake_interrupt {
            std::thread::sleep(duration);
            return Ok(());
        }

        // CTS stands in for the radio's interrupt line
        let step = Duration::from_millis(10);
        let mut slept = Duration::ZERO;
        while slept < duration {
            if self.port.read_clear_to_send().map_err(std::io::Error::other)? {
                debug!("woken by interrupt after {:?}", slept);
                return Ok(());
            }
            std::thread::sleep(step);
            slept += step;
        }
        Ok(())
    }

    fn enable_wake_interrupt(&mut self) -> std::io::Result<()> {
        self.wake_interrupt = true;
        Ok(())
    }

    fn disable_wake_interrupt(&mut self) -> std::io::Result<()> {
        self.wake_interrupt = false;
        Ok(())
    }
}

// ============================================================================
// Mock Power for Testing
// ============================================================================

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerEvent {
    Line(Line, bool),
    Sleep(Duration),
    InterruptEnabled,
    InterruptDisabled,
}

/// Records every call. Sleeping advances the simulated clock.
#[cfg(test)]
#[derive(Clone)]
pub struct MockPower {
    events: std::sync::Arc<std::sync::Mutex<Vec<PowerEvent>>>,
    clock: crate::clock::SimClock,
}

#[cfg(test)]
impl MockPower {
    pub fn new(clock: crate::clock::SimClock) -> Self {
        MockPower { events: Default::default(), clock }
    }

    pub fn events(&self) -> Vec<PowerEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl PowerControl for MockPower {
    fn set_line(&mut self, line: Line, high: bool) -> std::io::Result<()> {
        self.events.lock().unwrap().push(PowerEvent::Line(line, high));
        Ok(())
    }

    fn sleep_for(&mut self, duration: Duration) -> std::io::Result<()> {
        self.events.lock().unwrap().push(PowerEvent::Sleep(duration));
        self.clock.advance(duration);
        Ok(())
    }

    fn enable_wake_interrupt(&mut self) -> std::io::Result<()> {
        self.events.lock().unwrap().push(PowerEvent::InterruptEnabled);
        Ok(())
    }

    fn disable_wake_interrupt(&mut self) -> std::io::Result<()> {
        self.events.lock().unwrap().push(PowerEvent::InterruptDisabled);
        Ok(())
    }
}
