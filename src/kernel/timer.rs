//! Hierarchical timer wheel.
//!
//! Time is a wrapping 32-bit tick counter. Timers due within the current
//! 256-tick window sit in the `near` ring; later ones sit in one of four
//! coarse levels of 64 buckets each (bit ranges 8..14, 14..20, 20..26,
//! 26..32). Every tick fires the due near bucket, advances the counter,
//! cascades at most one coarse bucket back down, then fires again. A timer
//! fires exactly once, on the tick at which the counter reaches its expiry;
//! timers with equal expiry fire in insertion order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::message::{Message, MessageType};
use super::Kernel;
use crate::types::Handle;

const TIME_NEAR_SHIFT: u32 = 8;
const TIME_NEAR: usize = 1 << TIME_NEAR_SHIFT;
const TIME_LEVEL_SHIFT: u32 = 6;
const TIME_LEVEL: usize = 1 << TIME_LEVEL_SHIFT;
const TIME_NEAR_MASK: u32 = TIME_NEAR as u32 - 1;
const TIME_LEVEL_MASK: u32 = TIME_LEVEL as u32 - 1;

/// A pending timeout: deliver a `RESPONSE` with `session` to `handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub expire: u32,
    pub handle: Handle,
    pub session: i32,
}

/// The wheel itself. Not synchronized; see [`TimerService`].
#[derive(Debug)]
pub struct Wheel {
    near: Vec<Vec<TimerEvent>>,
    levels: [Vec<Vec<TimerEvent>>; 4],
    time: u32,
}

impl Default for Wheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Wheel {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// A wheel whose counter starts at `time` (wraparound tests).
    pub fn starting_at(time: u32) -> Self {
        let level = || (0..TIME_LEVEL).map(|_| Vec::new()).collect::<Vec<_>>();
        Self {
            near: (0..TIME_NEAR).map(|_| Vec::new()).collect(),
            levels: [level(), level(), level(), level()],
            time,
        }
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    /// Schedule a timer `delay` ticks from now. `delay` must be positive;
    /// zero-delay timeouts never reach the wheel.
    pub fn add(&mut self, handle: Handle, session: i32, delay: u32) {
        let event = TimerEvent {
            expire: self.time.wrapping_add(delay),
            handle,
            session,
        };
        self.add_node(event);
    }

    pub fn pending(&self) -> usize {
        self.near.iter().map(Vec::len).sum::<usize>()
            + self
                .levels
                .iter()
                .flat_map(|level| level.iter())
                .map(Vec::len)
                .sum::<usize>()
    }

    fn add_node(&mut self, event: TimerEvent) {
        let time = event.expire;
        let current = self.time;
        if (time | TIME_NEAR_MASK) == (current | TIME_NEAR_MASK) {
            self.near[(time & TIME_NEAR_MASK) as usize].push(event);
            return;
        }
        let mut mask: u32 = (TIME_NEAR as u32) << TIME_LEVEL_SHIFT;
        let mut level = 0;
        while level < 3 {
            if (time | (mask - 1)) == (current | (mask - 1)) {
                break;
            }
            mask <<= TIME_LEVEL_SHIFT;
            level += 1;
        }
        let shift = TIME_NEAR_SHIFT + level as u32 * TIME_LEVEL_SHIFT;
        let idx = ((time >> shift) & TIME_LEVEL_MASK) as usize;
        self.levels[level][idx].push(event);
    }

    fn move_list(&mut self, level: usize, idx: usize) {
        let list = std::mem::take(&mut self.levels[level][idx]);
        for event in list {
            self.add_node(event);
        }
    }

    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;
        if ct == 0 {
            self.move_list(3, 0);
            return;
        }
        let mut time = ct >> TIME_NEAR_SHIFT;
        let mut mask: u32 = TIME_NEAR as u32;
        let mut level = 0;
        while ct & (mask - 1) == 0 {
            let idx = (time & TIME_LEVEL_MASK) as usize;
            if idx != 0 {
                self.move_list(level, idx);
                break;
            }
            mask <<= TIME_LEVEL_SHIFT;
            time >>= TIME_LEVEL_SHIFT;
            level += 1;
        }
    }

    fn execute(&mut self, fired: &mut Vec<TimerEvent>) {
        let idx = (self.time & TIME_NEAR_MASK) as usize;
        while !self.near[idx].is_empty() {
            fired.append(&mut self.near[idx]);
        }
    }

    /// Advance one tick, appending every timer that became due to `fired`.
    pub fn tick(&mut self, fired: &mut Vec<TimerEvent>) {
        // Timers that landed on the current slot after the last tick.
        self.execute(fired);
        self.shift();
        self.execute(fired);
    }
}

/// Thread-safe wheel bound to wall-clock time.
#[derive(Debug)]
pub struct TimerService {
    wheel: Mutex<Wheel>,
    tick: Duration,
    origin: Instant,
    start_time: DateTime<Utc>,
    /// Ticks already applied to the wheel, measured from `origin`.
    applied: Mutex<u64>,
}

impl TimerService {
    pub fn new(tick: Duration) -> Self {
        Self {
            wheel: Mutex::new(Wheel::new()),
            tick,
            origin: Instant::now(),
            start_time: Utc::now(),
            applied: Mutex::new(0),
        }
    }

    pub fn add(&self, handle: Handle, session: i32, ticks: u32) {
        self.wheel.lock().add(handle, session, ticks);
    }

    /// Wall-clock time the kernel started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Ticks elapsed since start.
    pub fn now(&self) -> u64 {
        (self.origin.elapsed().as_nanos() / self.tick.as_nanos().max(1)) as u64
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick
    }

    pub fn pending(&self) -> usize {
        self.wheel.lock().pending()
    }

    /// Catch the wheel up with the wall clock, one tick at a time. Events
    /// are handed to `fire` with the wheel unlocked.
    pub fn update(&self, fire: impl FnMut(TimerEvent)) -> u64 {
        let now = self.now();
        let mut applied = self.applied.lock();
        if now <= *applied {
            return 0;
        }
        let diff = now - *applied;
        *applied = now;
        self.advance_locked(diff, fire);
        diff
    }

    /// Advance by `ticks` regardless of the wall clock.
    pub fn advance(&self, ticks: u64, fire: impl FnMut(TimerEvent)) {
        let _applied = self.applied.lock();
        self.advance_locked(ticks, fire);
    }

    fn advance_locked(&self, ticks: u64, mut fire: impl FnMut(TimerEvent)) {
        let mut fired = Vec::new();
        for _ in 0..ticks {
            self.wheel.lock().tick(&mut fired);
            for event in fired.drain(..) {
                fire(event);
            }
        }
    }
}

impl Kernel {
    /// Arrange a `RESPONSE` with `session` for `handle` after `ticks`.
    ///
    /// Non-positive delays are delivered immediately, before this returns.
    /// Returns `None` if an immediate delivery fails.
    pub fn timeout(&self, handle: Handle, ticks: i32, session: i32) -> Option<i32> {
        if ticks <= 0 {
            let msg = Message::empty(Handle::NONE, session, MessageType::RESPONSE);
            if !self.push_local(handle, msg) {
                return None;
            }
        } else {
            self.timer.add(handle, session, ticks as u32);
        }
        Some(session)
    }

    fn fire_timer(&self, event: TimerEvent) {
        let msg = Message::empty(Handle::NONE, event.session, MessageType::RESPONSE);
        if !self.push_local(event.handle, msg) {
            tracing::debug!(
                handle = %event.handle,
                session = event.session,
                "timer fired for a retired service"
            );
        }
    }

    /// Apply the elapsed wall-clock ticks. Returns how many were applied.
    pub fn update_timers(&self) -> u64 {
        self.timer.update(|event| self.fire_timer(event))
    }

    /// Advance the wheel by `ticks` without waiting for the clock.
    pub fn advance_timers(&self, ticks: u64) {
        self.timer.advance(ticks, |event| self.fire_timer(event));
    }

    /// Timer thread body. Also stops the kernel once every service is gone.
    pub(crate) fn run_timer(self: Arc<Self>) {
        let step = (self.timer.tick_duration() / 4).max(Duration::from_micros(500));
        while !self.is_shutting_down() {
            self.update_timers();
            if self.all_services_exited() {
                tracing::info!("all services exited, stopping kernel");
                self.shutdown();
                break;
            }
            std::thread::sleep(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(id: u32) -> Handle {
        Handle::new(0, id)
    }

    /// Tick until `limit`, recording (tick, session) pairs.
    fn run(wheel: &mut Wheel, limit: u32) -> Vec<(u32, i32)> {
        let mut out = Vec::new();
        let mut fired = Vec::new();
        for _ in 0..limit {
            wheel.tick(&mut fired);
            for e in fired.drain(..) {
                assert_eq!(e.expire, wheel.time());
                out.push((wheel.time(), e.session));
            }
        }
        out
    }

    #[test]
    fn test_near_timers_fire_on_expiry() {
        let mut wheel = Wheel::new();
        wheel.add(h(1), 1, 3);
        wheel.add(h(1), 2, 1);
        wheel.add(h(1), 3, 255);
        assert_eq!(run(&mut wheel, 300), vec![(1, 2), (3, 1), (255, 3)]);
        assert_eq!(wheel.pending(), 0);
    }

    #[test]
    fn test_equal_expiry_fires_in_insertion_order() {
        let mut wheel = Wheel::new();
        for session in 1..=5 {
            wheel.add(h(1), session, 700);
        }
        let fired = run(&mut wheel, 800);
        assert_eq!(
            fired,
            (1..=5).map(|s| (700, s)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_cascade_through_levels() {
        let mut wheel = Wheel::new();
        wheel.add(h(1), 1, 256);
        wheel.add(h(1), 2, 16_384 + 5);
        wheel.add(h(1), 3, 20_000);
        assert_eq!(
            run(&mut wheel, 20_001),
            vec![(256, 1), (16_389, 2), (20_000, 3)]
        );
    }

    #[test]
    fn test_counter_wraparound() {
        let mut wheel = Wheel::starting_at(u32::MAX - 10);
        wheel.add(h(1), 1, 5);
        wheel.add(h(1), 2, 20);
        wheel.add(h(1), 3, 300);
        let fired = run(&mut wheel, 400);
        assert_eq!(
            fired,
            vec![
                (u32::MAX - 5, 1),
                (9, 2),
                ((u32::MAX - 10).wrapping_add(300), 3)
            ]
        );
    }

    #[test]
    fn test_service_advance_delivers_events() {
        let timers = TimerService::new(Duration::from_millis(10));
        timers.add(h(2), 7, 2);
        let mut seen = Vec::new();
        timers.advance(1, |e| seen.push(e.session));
        assert!(seen.is_empty());
        timers.advance(1, |e| seen.push(e.session));
        assert_eq!(seen, vec![7]);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_update_follows_wall_clock() {
        let timers = TimerService::new(Duration::from_millis(1));
        timers.add(h(2), 1, 1);
        std::thread::sleep(Duration::from_millis(20));
        let mut seen = Vec::new();
        let applied = timers.update(|e| seen.push(e.session));
        assert!(applied >= 1);
        assert_eq!(seen, vec![1]);
        timers.update(|_| panic!("nothing else is due"));
    }
}
