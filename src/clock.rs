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

use std::time::{Duration, Instant};

/// Interval between polls of the radio or host while waiting
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Clock Trait
// ============================================================================

/// Monotonic millisecond clock that every wait loop is measured against
pub trait Clock: Send {
    fn now_ms(&self) -> u64;

    fn sleep(&self, duration: Duration);
}

// ============================================================================
// System Clock
// ============================================================================

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ============================================================================
// Deadline
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start_ms: u64,
    limit_ms: u64,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, limit_ms: u64) -> Self {
        Deadline {
            start_ms: clock.now_ms(),
            limit_ms,
        }
    }

    pub fn elapsed_ms(&self, clock: &dyn Clock) -> u64 {
        clock.now_ms().saturating_sub(self.start_ms)
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        self.elapsed_ms(clock) >= self.limit_ms
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        Duration::from_millis(self.limit_ms.saturating_sub(self.elapsed_ms(clock)))
    }

    pub fn limit_ms(&self) -> u64 {
        self.limit_ms
    }
}

// ============================================================================
// Simulated Clock for Testing
// ============================================================================

/// Clock that only moves when something sleeps on it or a test advances it.
/// Clones share the same time.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SimClock {
    now_us: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

#[cfg(test)]
impl SimClock {
    pub fn new() -> Self {
        SimClock::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now_us.fetch_add(
            duration.as_micros() as u64,
            std::sync::atomic::Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now_us.load(std::sync::atomic::Ordering::SeqCst) / 1000
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
#[derive(Default)]
struct Lockstep {
    now_us: u64,
    parties: usize,
    next_ticket: u64,
    /// `(wake_at, ticket)` of every party currently asleep
    waiting: Vec<(u64, u64)>,
    /// Sleeper allowed to resume and not yet running
    released: Option<u64>,
}

#[cfg(test)]
impl Lockstep {
    /// Once every party is asleep, resumes the earliest one.
    fn settle(&mut self, wakeup: &std::sync::Condvar) {
        if self.released.is_some() || self.parties == 0 || self.waiting.len() < self.parties {
            return;
        }
        if let Some(&(wake_at, ticket)) = self.waiting.iter().min() {
            self.now_us = self.now_us.max(wake_at);
            self.released = Some(ticket);
            wakeup.notify_all();
        }
    }
}

/// Simulated time shared by several threads. Time only moves when every
/// party is sleeping, and then exactly one sleeper resumes, so the parties
/// take turns in wake-time order.
#[cfg(test)]
#[derive(Clone)]
pub struct LockstepClock {
    shared: std::sync::Arc<(std::sync::Mutex<Lockstep>, std::sync::Condvar)>,
}

/// Removes one party from a [`LockstepClock`] when dropped.
#[cfg(test)]
pub struct Departure(LockstepClock);

#[cfg(test)]
impl Drop for Departure {
    fn drop(&mut self) {
        let (state, wakeup) = &*self.0.shared;
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.parties -= 1;
        state.settle(wakeup);
    }
}

#[cfg(test)]
impl LockstepClock {
    pub fn new(parties: usize) -> Self {
        let state = Lockstep { parties, ..Lockstep::default() };
        LockstepClock {
            shared: std::sync::Arc::new((std::sync::Mutex::new(state), std::sync::Condvar::new())),
        }
    }

    /// Held by each party's thread; the clock stops waiting for it once dropped.
    pub fn departure(&self) -> Departure {
        Departure(self.clone())
    }
}

#[cfg(test)]
impl Clock for LockstepClock {
    fn now_ms(&self) -> u64 {
        self.shared.0.lock().unwrap().now_us / 1000
    }

    fn sleep(&self, duration: Duration) {
        let (state, wakeup) = &*self.shared;
        let mut state = state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let wake_at = state.now_us + duration.as_micros() as u64;
        state.waiting.push((wake_at, ticket));
        state.settle(wakeup);

        while state.released != Some(ticket) {
            state = wakeup.wait(state).unwrap();
        }
        state.released = None;
        state.waiting.retain(|&(_, t)| t != ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_with_sim_clock() {
        let clock = SimClock::new();
        let deadline = Deadline::after(&clock, 100);
        assert!(!deadline.expired(&clock));
        assert_eq!(deadline.remaining(&clock), Duration::from_millis(100));

        clock.sleep(Duration::from_millis(60));
        assert_eq!(deadline.elapsed_ms(&clock), 60);
        assert_eq!(deadline.remaining(&clock), Duration::from_millis(40));

        clock.advance(Duration::from_millis(40));
        assert!(deadline.expired(&clock));
        assert_eq!(deadline.remaining(&clock), Duration::ZERO);
    }

    #[test]
    fn test_sim_clock_clones_share_time() {
        let clock = SimClock::new();
        let other = clock.clone();
        other.advance(Duration::from_micros(2500));
        assert_eq!(clock.now_ms(), 2);
    }

    #[test]
    fn test_lockstep_clock_interleaves_sleepers() {
        let clock = LockstepClock::new(2);
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let threads: Vec<_> = [("fast", 10u64), ("slow", 25)]
            .into_iter()
            .map(|(name, step)| {
                let clock = clock.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    let _departure = clock.departure();
                    for _ in 0..3 {
                        clock.sleep(Duration::from_millis(step));
                        log.lock().unwrap().push((clock.now_ms(), name));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut log = log.lock().unwrap().clone();
        log.sort();
        assert_eq!(
            log,
            vec![(10, "fast"), (20, "fast"), (25, "slow"), (30, "fast"), (50, "slow"), (75, "slow")]
        );
        assert_eq!(clock.now_ms(), 75);
    }
}
