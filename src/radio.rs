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

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use serialport::{ClearBuffer, SerialPort as SerialPortTrait};
use tracing::{debug, trace, warn};
use crate::config::RadioConfig;
use crate::protocol::MAX_PACKET_LEN;

// ============================================================================
// RadioChannel Trait
// ============================================================================

/// Best-effort, half-duplex packet radio. Packets may be dropped silently.
///
/// The channel is either listening or transmitting, never both.
pub trait RadioChannel: Send {
    fn set_listening(&mut self, listening: bool) -> std::io::Result<()>;

    /// True when a received packet is waiting. Always false while transmitting.
    fn available(&mut self) -> std::io::Result<bool>;

    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>>;

    /// One write attempt. `Ok(false)` means the radio could not send it.
    fn write(&mut self, packet: &[u8]) -> std::io::Result<bool>;

    fn flush_rx(&mut self) -> std::io::Result<()>;

    fn flush_tx(&mut self) -> std::io::Result<()>;

    /// Restores the radio configuration, e.g. after it was powered down.
    fn reconfigure(&mut self) -> std::io::Result<()>;
}

// ============================================================================
// UDP Radio
// ============================================================================

/// One datagram per packet. Lets two peers run on one machine, with an
/// optional loss rate applied to outgoing packets.
pub struct UdpRadio {
    socket: UdpSocket,
    peer: SocketAddr,
    listening: bool,
    rx: VecDeque<Vec<u8>>,
    drop_rate: f64,
}

impl UdpRadio {
    pub fn bind(local: SocketAddr, peer: SocketAddr, drop_rate: f64) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        Ok(UdpRadio {
            socket,
            peer,
            listening: false,
            rx: VecDeque::new(),
            drop_rate: drop_rate.clamp(0.0, 1.0),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn poll_socket(&mut self) -> std::io::Result<()> {
        let mut buf = [0u8; MAX_PACKET_LEN + 1];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) if from == self.peer && n <= MAX_PACKET_LEN => {
                    self.rx.push_back(buf[..n].to_vec());
                }
                Ok((n, from)) => trace!("ignoring {} byte datagram from {}", n, from),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                // ICMP port unreachable from an earlier send
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl RadioChannel for UdpRadio {
    fn set_listening(&mut self, listening: bool) -> std::io::Result<()> {
        self.listening = listening;
        Ok(())
    }

    fn available(&mut self) -> std::io::Result<bool> {
        if !self.listening {
            return Ok(false);
        }
        self.poll_socket()?;
        Ok(!self.rx.is_empty())
    }

    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.rx.pop_front())
    }

    fn write(&mut self, packet: &[u8]) -> std::io::Result<bool> {
        if self.drop_rate > 0.0 && rand::random::<f64>() < self.drop_rate {
            trace!("simulated loss of {} byte packet", packet.len());
            return Ok(true);
        }

        match self.socket.send_to(packet, self.peer) {
            Ok(_) => Ok(true),
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::ConnectionRefused
            ) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn flush_rx(&mut self) -> std::io::Result<()> {
        self.poll_socket()?;
        self.rx.clear();
        Ok(())
    }

    fn flush_tx(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn reconfigure(&mut self) -> std::io::Result<()> {
        debug!("UDP radio {} -> {} reset", self.socket.local_addr()?, self.peer);
        self.listening = false;
        self.flush_rx()
    }
}

// ============================================================================
// SLIP Framing
// ============================================================================

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

pub fn slip_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(SLIP_END);
    for &b in payload {
        match b {
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(SLIP_END);
    out
}

#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    esc: bool,
}

impl SlipDecoder {
    /// Feeds received bytes, returning every packet they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        for &b in data {
            if self.esc {
                self.esc = false;
                match b {
                    SLIP_ESC_END => self.buf.push(SLIP_END),
                    SLIP_ESC_ESC => self.buf.push(SLIP_ESC),
                    _ => self.buf.clear(),
                }
                continue;
            }
            match b {
                SLIP_END if !self.buf.is_empty() => packets.push(std::mem::take(&mut self.buf)),
                SLIP_END => {}
                SLIP_ESC => self.esc = true,
                _ => self.buf.push(b),
            }
        }
        packets
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.esc = false;
    }
}

// ============================================================================
// Serial Radio
// ============================================================================

/// Commands exchanged with the radio stick. Each SLIP frame on the UART
/// starts with one of these, followed by its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StickCommand {
    /// `[channel, max_packet]`, only valid in standby
    Config = 0x01,
    /// The address bytes, only valid in standby
    SetAddress = 0x02,
    Standby = 0x03,
    StartReceive = 0x04,
    /// Host to stick: transmit the body
    Send = 0x05,
    /// Stick to host: a packet came in over the air
    Receive = 0x06,
    Ack = 0x07,
    PacketLost = 0x08,
    Fault = 0x09,
}

impl TryFrom<u8> for StickCommand {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0x01 => Ok(StickCommand::Config),
            0x02 => Ok(StickCommand::SetAddress),
            0x03 => Ok(StickCommand::Standby),
            0x04 => Ok(StickCommand::StartReceive),
            0x05 => Ok(StickCommand::Send),
            0x06 => Ok(StickCommand::Receive),
            0x07 => Ok(StickCommand::Ack),
            0x08 => Ok(StickCommand::PacketLost),
            0x09 => Ok(StickCommand::Fault),
            other => Err(other),
        }
    }
}

/// SLIP-framed `command` + `body`, ready for the UART.
pub fn stick_frame(command: StickCommand, body: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(body.len() + 1);
    raw.push(command as u8);
    raw.extend_from_slice(body);
    slip_encode(&raw)
}

/// Standby followed by the channel and address setup.
pub fn config_frames(config: &RadioConfig) -> Vec<u8> {
    let mut out = stick_frame(StickCommand::Standby, &[]);
    out.extend(stick_frame(StickCommand::Config, &[config.channel, config.max_packet as u8]));
    out.extend(stick_frame(StickCommand::SetAddress, config.address.as_bytes()));
    out
}

/// Radio stick on a UART. Frames are SLIP encoded and tagged with a
/// [`StickCommand`]; only `Receive` frames carry packets.
pub struct SerialRadio {
    port: Box<dyn SerialPortTrait>,
    decoder: SlipDecoder,
    rx: VecDeque<Vec<u8>>,
    listening: bool,
    config: RadioConfig,
}

impl SerialRadio {
    pub fn open(port_name: &str, baud_rate: u32, config: RadioConfig) -> std::io::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(std::io::Error::other)?;

        let mut radio = SerialRadio {
            port,
            decoder: SlipDecoder::default(),
            rx: VecDeque::new(),
            listening: false,
            config,
        };
        radio.reconfigure()?;
        Ok(radio)
    }

    fn command(&mut self, command: StickCommand, body: &[u8]) -> std::io::Result<()> {
        self.port.write_all(&stick_frame(command, body))?;
        self.port.flush()
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        let Some((&tag, body)) = frame.split_first() else {
            return;
        };
        match StickCommand::try_from(tag) {
            Ok(StickCommand::Receive) if body.len() <= MAX_PACKET_LEN => self.rx.push_back(body.to_vec()),
            Ok(StickCommand::Receive) => debug!("dropping oversized {} byte packet", body.len()),
            Ok(StickCommand::PacketLost) => debug!("stick reports packet lost"),
            Ok(StickCommand::Fault) => warn!("stick reports an error"),
            Ok(other) => trace!("stick {:?}", other),
            Err(tag) => debug!("unknown stick frame 0x{:02X}", tag),
        }
    }
}

impl RadioChannel for SerialRadio {
    fn set_listening(&mut self, listening: bool) -> std::io::Result<()> {
        if listening != self.listening {
            let command = if listening { StickCommand::StartReceive } else { StickCommand::Standby };
            self.command(command, &[])?;
            self.listening = listening;
        }
        Ok(())
    }

    fn available(&mut self) -> std::io::Result<bool> {
        if !self.listening {
            return Ok(false);
        }

        let waiting = self.port.bytes_to_read().map_err(std::io::Error::other)? as usize;
        if waiting > 0 {
            let mut buf = vec![0u8; waiting];
            let n = self.port.read(&mut buf)?;
            for frame in self.decoder.push(&buf[..n]) {
                self.handle_frame(frame);
            }
        }
        Ok(!self.rx.is_empty())
    }

    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.rx.pop_front())
    }

    fn write(&mut self, packet: &[u8]) -> std::io::Result<bool> {
        match self.command(StickCommand::Send, packet) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn flush_rx(&mut self) -> std::io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(std::io::Error::other)?;
        self.decoder.reset();
        self.rx.clear();
        Ok(())
    }

    fn flush_tx(&mut self) -> std::io::Result<()> {
        self.port.clear(ClearBuffer::Output).map_err(std::io::Error::other)
    }

    fn reconfigure(&mut self) -> std::io::Result<()> {
        self.flush_rx()?;
        self.flush_tx()?;
        debug!(
            "configuring stick: channel {}, address {}",
            self.config.channel, self.config.address
        );
        self.port.write_all(&config_frames(&self.config))?;
        self.port.flush()?;
        self.listening = false;
        Ok(())
    }
}

// ============================================================================
// Mock Radio for Testing
// ============================================================================

#[cfg(test)]
#[derive(Default)]
pub struct RadioLog {
    /// Packets the radio will deliver once listening
    pub inbox: VecDeque<Vec<u8>>,
    /// Every packet successfully written
    pub written: Vec<Vec<u8>>,
    pub listening: bool,
    /// Upcoming write attempts that fail
    pub write_failures: usize,
    pub flush_rx: usize,
    pub flush_tx: usize,
    pub reconfigured: usize,
}

#[cfg(test)]
type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Scripted radio. A responder closure plays the peer: it sees every packet
/// written and returns the packets the peer sends back. A paired radio
/// delivers its writes to the other radio of the pair instead.
#[cfg(test)]
pub struct MockRadio {
    log: std::sync::Arc<std::sync::Mutex<RadioLog>>,
    responder: Option<Responder>,
    peer: Option<std::sync::Arc<std::sync::Mutex<RadioLog>>>,
}

#[cfg(test)]
impl MockRadio {
    pub fn new() -> Self {
        MockRadio {
            log: Default::default(),
            responder: None,
            peer: None,
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        MockRadio {
            responder: Some(Box::new(responder)),
            ..MockRadio::new()
        }
    }

    /// Two radios on the same channel.
    pub fn pair() -> (MockRadio, MockRadio) {
        let mut a = MockRadio::new();
        let mut b = MockRadio::new();
        a.peer = Some(b.handle());
        b.peer = Some(a.handle());
        (a, b)
    }

    pub fn handle(&self) -> std::sync::Arc<std::sync::Mutex<RadioLog>> {
        self.log.clone()
    }
}

#[cfg(test)]
impl RadioChannel for MockRadio {
    fn set_listening(&mut self, listening: bool) -> std::io::Result<()> {
        self.log.lock().unwrap().listening = listening;
        Ok(())
    }

    fn available(&mut self) -> std::io::Result<bool> {
        let log = self.log.lock().unwrap();
        Ok(log.listening && !log.inbox.is_empty())
    }

    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.log.lock().unwrap().inbox.pop_front())
    }

    fn write(&mut self, packet: &[u8]) -> std::io::Result<bool> {
        {
            let mut log = self.log.lock().unwrap();
            if log.write_failures > 0 {
                log.write_failures -= 1;
                return Ok(false);
            }
            log.written.push(packet.to_vec());
        }

        if let Some(peer) = &self.peer {
            peer.lock().unwrap().inbox.push_back(packet.to_vec());
        }
        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(packet);
            self.log.lock().unwrap().inbox.extend(replies);
        }
        Ok(true)
    }

    fn flush_rx(&mut self) -> std::io::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.inbox.clear();
        log.flush_rx += 1;
        Ok(())
    }

    fn flush_tx(&mut self) -> std::io::Result<()> {
        self.log.lock().unwrap().flush_tx += 1;
        Ok(())
    }

    fn reconfigure(&mut self) -> std::io::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.reconfigured += 1;
        log.listening = false;
        Ok(())
    }
}
