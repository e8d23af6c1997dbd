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

use thiserror::Error;

/// Errors raised by the link.
///
/// `Format`, `LinkTimeout`, `SequenceFault`, `HostStarvation`, `WakeTimeout`
/// and `SendFailed` abort the transfer in progress and the state machine goes
/// back to idle. The rest are fatal and leave the run loop.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("malformed frame: {0}")]
    Format(String),

    #[error("no response within {0} ms")]
    LinkTimeout(u64),

    #[error("sequence fault: expected {expected}, got {got}")]
    SequenceFault { expected: u16, got: u16 },

    #[error("host supplied {got} of {wanted} bytes before the deadline")]
    HostStarvation { wanted: usize, got: usize },

    #[error("wake token not received within {0} ms")]
    WakeTimeout(u64),

    #[error("radio write failed for {0} ms")]
    SendFailed(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl LinkError {
    /// True for errors that only end the current transfer.
    pub fn is_transfer_local(&self) -> bool {
        !matches!(self, LinkError::Config(_) | LinkError::Io(_) | LinkError::Serial(_))
    }

    /// Tags an I/O error with the state machine state it surfaced in.
    pub fn in_state<S>(self) -> Self {
        match self {
            LinkError::Io(e) => LinkError::Io(std::io::Error::new(
                e.kind(),
                format!("{} (in state: {})", e, state_name::<S>()),
            )),
            other => other,
        }
    }
}

/// Bare type name of a state marker, e.g. `ChunkLoop`.
pub fn state_name<S>() -> &'static str {
    let type_name = std::any::type_name::<S>();
    type_name.rsplit("::").next().unwrap_or(type_name)
}

pub type Result<T> = std::result::Result<T, LinkError>;
