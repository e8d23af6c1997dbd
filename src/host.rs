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
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use serialport::SerialPort as SerialPortTrait;
use crate::clock::{Clock, Deadline, POLL_INTERVAL};
use crate::error::LinkError;

// ============================================================================
// HostChannel Trait
// ============================================================================

/// Wired byte stream to the host on this end of the link
pub trait HostChannel: Send {
    /// Bytes that can be read without blocking
    fn available(&mut self) -> std::io::Result<usize>;

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Reads what is there, blocking up to `timeout` for the first byte.
    /// Returns `ErrorKind::TimedOut` when nothing arrived.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

/// Fills `buf` from the host or fails with `HostStarvation` once `timeout_ms` lapses.
pub fn read_exact_within(
    host: &mut dyn HostChannel,
    clock: &dyn Clock,
    buf: &mut [u8],
    timeout_ms: u64,
) -> Result<(), LinkError> {
    let deadline = Deadline::after(clock, timeout_ms);
    let mut filled = 0;

    while filled < buf.len() {
        if deadline.expired(clock) {
            return Err(LinkError::HostStarvation { wanted: buf.len(), got: filled });
        }

        match host.read_timeout(&mut buf[filled..], deadline.remaining(clock)) {
            Ok(0) => clock.sleep(POLL_INTERVAL),
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Reads and throws away up to `count` bytes, giving up once the host has
/// been silent for `timeout_ms`. Returns how many bytes went.
pub fn discard_within(
    host: &mut dyn HostChannel,
    clock: &dyn Clock,
    count: usize,
    timeout_ms: u64,
) -> Result<usize, LinkError> {
    let mut scratch = [0u8; 64];
    let mut discarded = 0;
    let mut deadline = Deadline::after(clock, timeout_ms);

    while discarded < count && !deadline.expired(clock) {
        let want = (count - discarded).min(scratch.len());
        match host.read_timeout(&mut scratch[..want], deadline.remaining(clock)) {
            Ok(0) => clock.sleep(POLL_INTERVAL),
            Ok(n) => {
                discarded += n;
                deadline = Deadline::after(clock, timeout_ms);
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(discarded)
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
}

// ============================================================================
// Serial Host
// ============================================================================

/// Host attached through a serial port, as on the firmware's UART
pub struct SerialHost {
    port: Box<dyn SerialPortTrait>,
}

impl SerialHost {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(SerialHost { port })
    }
}

impl HostChannel for SerialHost {
    fn available(&mut self) -> std::io::Result<usize> {
        self.port.bytes_to_read()
            .map(|n| n as usize)
            .map_err(std::io::Error::other)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout.max(POLL_INTERVAL))
            .map_err(std::io::Error::other)?;
        self.port.read(buf)
    }
}

// ============================================================================
// Stream Host
// ============================================================================

/// Host behind a pair of plain streams, e.g. stdin/stdout.
///
/// Blocking reads happen on a helper thread so reads here can time out.
pub struct StreamHost {
    incoming: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    writer: Box<dyn Write + Send>,
    closed: bool,
}

impl StreamHost {
    pub fn spawn<R>(mut reader: R, writer: Box<dyn Write + Send>) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("host stream read failed: {}", e);
                        break;
                    }
                }
            }
        });

        StreamHost {
            incoming: rx,
            pending: VecDeque::new(),
            writer,
            closed: false,
        }
    }

    pub fn stdio() -> Self {
        StreamHost::spawn(std::io::stdin(), Box::new(std::io::stdout()))
    }

    fn drain(&mut self) {
        loop {
            match self.incoming.try_recv() {
                Ok(bytes) => self.pending.extend(bytes),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

impl HostChannel for StreamHost {
    fn available(&mut self) -> std::io::Result<usize> {
        self.drain();
        Ok(self.pending.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(buf)?;
        self.writer.flush()
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.drain();
        if self.pending.is_empty() && !self.closed {
            match self.incoming.recv_timeout(timeout) {
                Ok(bytes) => self.pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "host read timed out",
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => self.closed = true,
            }
        }

        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

// ============================================================================
// Mock Host for Testing
// ============================================================================

#[cfg(test)]
#[derive(Default)]
pub struct HostLog {
    pub input: VecDeque<u8>,
    pub output: Vec<u8>,
}

/// Scripted host. Clones share the same log so a test can keep a handle
/// after giving one to a state machine. Timed-out reads sleep on the clock.
#[cfg(test)]
#[derive(Clone)]
pub struct MockHost {
    log: std::sync::Arc<std::sync::Mutex<HostLog>>,
    clock: std::sync::Arc<dyn Clock + Sync>,
}

#[cfg(test)]
impl MockHost {
    pub fn new<C: Clock + Sync + 'static>(clock: C) -> Self {
        MockHost {
            log: Default::default(),
            clock: std::sync::Arc::new(clock),
        }
    }

    pub fn push_input(&self, bytes: &[u8]) {
        self.log.lock().unwrap().input.extend(bytes.iter().copied());
    }

    pub fn output(&self) -> Vec<u8> {
        self.log.lock().unwrap().output.clone()
    }

    pub fn unread(&self) -> usize {
        self.log.lock().unwrap().input.len()
    }
}

#[cfg(test)]
impl HostChannel for MockHost {
    fn available(&mut self) -> std::io::Result<usize> {
        Ok(self.log.lock().unwrap().input.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.log.lock().unwrap().output.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let mut log = self.log.lock().unwrap();
        if log.input.is_empty() {
            drop(log);
            self.clock.sleep(timeout);
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "Mock timeout"));
        }

        let n = buf.len().min(log.input.len());
        for (slot, byte) in buf.iter_mut().zip(log.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;

    #[test]
    fn test_read_exact_within_collects_bytes() {
        let clock = SimClock::new();
        let mut host = MockHost::new(clock.clone());
        host.push_input(b"hello world");

        let mut buf = [0u8; 5];
        read_exact_within(&mut host, &clock, &mut buf, 1000).expect("enough bytes");
        assert_eq!(&buf, b"hello");
        assert_eq!(host.unread(), 6);
    }

    #[test]
    fn test_read_exact_within_starves() {
        let clock = SimClock::new();
        let mut host = MockHost::new(clock.clone());
        host.push_input(b"abc");

        let mut buf = [0u8; 5];
        match read_exact_within(&mut host, &clock, &mut buf, 1000) {
            Err(LinkError::HostStarvation { wanted: 5, got: 3 }) => {}
            other => panic!("expected starvation, got {:?}", other),
        }
        assert!(clock.now_ms() >= 1000);
    }

    #[test]
    fn test_discard_within_stops_at_count() {
        let clock = SimClock::new();
        let mut host = MockHost::new(clock.clone());
        host.push_input(&[7u8; 150]);

        assert_eq!(discard_within(&mut host, &clock, 100, 1000).unwrap(), 100);
        assert_eq!(host.unread(), 50);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_discard_within_gives_up_on_silence() {
        let clock = SimClock::new();
        let mut host = MockHost::new(clock.clone());
        host.push_input(&[1, 2, 3]);

        assert_eq!(discard_within(&mut host, &clock, 10, 500).unwrap(), 3);
        assert_eq!(host.unread(), 0);
        assert!(clock.now_ms() >= 500);
    }

    #[test]
    fn test_stream_host_reads_and_times_out() {
        let input = std::io::Cursor::new(b"ping".to_vec());
        let mut host = StreamHost::spawn(input, Box::new(std::io::sink()));

        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            filled += host.read_timeout(&mut buf[filled..], Duration::from_millis(500)).unwrap();
        }
        assert_eq!(&buf, b"ping");

        // reader thread has hit EOF; reads now return nothing
        let n = host.read_timeout(&mut buf, Duration::from_millis(50)).unwrap_or(0);
        assert_eq!(n, 0);
    }
}
