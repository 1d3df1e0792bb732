//! QBMS - Tick flags and the main-loop event queue
//!
//! Timer interrupts do nothing but raise a [`TickFlag`]. The main loop
//! takes the flags, turns them into [`TickEvent`]s on a bounded queue and
//! handles the events one by one. All component state is mutated from the
//! main loop only.
//!
//! ```ignore
//! static FLAGS: TickFlags = TickFlags::new();
//!
//! #[interrupt]
//! fn TIMER3() {
//!     FLAGS.sample.raise();
//! }
//!
//! loop {
//!     scheduler.service_flags(&FLAGS);
//!     while let Some(event) = scheduler.next_event() {
//!         pack.on_event(event, &mut can)?;
//!     }
//!     pack.poll_bus(&mut can, now_ms());
//! }
//! ```
//!
//! On a host without interrupts, [`Scheduler::poll`] derives the same
//! events from a monotonic clock.

use crate::types::*;
use core::sync::atomic::{AtomicBool, Ordering};
use heapless::Deque;
use tracing::{trace, warn};

// ============================================================================
// Tick Flags
// ============================================================================

/// "Due" flag shared between an interrupt and the main loop
#[derive(Debug)]
pub struct TickFlag(AtomicBool);

impl TickFlag {
    /// Lowered flag
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark as due (interrupt context)
    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the flag; true if it was raised since the last take
    #[inline]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Acquire)
    }

    /// Peek without consuming
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for TickFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// The three timer flags
#[derive(Debug, Default)]
pub struct TickFlags {
    /// Sampler tick (80ms)
    pub sample: TickFlag,
    /// Pack summary tick (100ms)
    pub fast: TickFlag,
    /// Slow status base tick (125ms)
    pub slow: TickFlag,
}

impl TickFlags {
    /// All flags lowered
    pub const fn new() -> Self {
        Self {
            sample: TickFlag::new(),
            fast: TickFlag::new(),
            slow: TickFlag::new(),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Work item handled by the main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TickEvent {
    /// Advance the sampler one phase
    Sample,
    /// Send the pack summary frame
    PackSummary,
    /// Send the quadrant voltage frame
    QuadrantVoltages,
    /// Send the cell average frame
    CellAverages,
    /// Send the temperature frame
    Temperatures,
}

/// Periodic deadline
#[derive(Debug, Clone, Copy)]
struct Timer {
    period: TimeUs,
    next_due: TimeUs,
}

impl Timer {
    const fn new(period: TimeUs) -> Self {
        Self {
            period,
            next_due: period,
        }
    }

    /// Fire at most once, resynchronising if we fell behind
    fn expired(&mut self, now: TimeUs) -> bool {
        if now < self.next_due {
            return false;
        }
        self.next_due = self.next_due.saturating_add(self.period);
        if self.next_due <= now {
            self.next_due = now.saturating_add(self.period);
        }
        true
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Turns timer ticks into queued events
pub struct Scheduler {
    sample: Timer,
    fast: Timer,
    slow: Timer,
    slow_count: u8,
    queue: Deque<TickEvent, EVENT_QUEUE_DEPTH>,
    dropped: u32,
}

impl Scheduler {
    /// Scheduler with the standard 80/100/125ms periods
    pub fn new() -> Self {
        Self::with_periods(SAMPLE_PERIOD_US, STATUS_FAST_PERIOD_US, STATUS_SLOW_BASE_US)
    }

    /// Scheduler with custom periods (used by `poll`)
    pub fn with_periods(sample: TimeUs, fast: TimeUs, slow_base: TimeUs) -> Self {
        Self {
            sample: Timer::new(sample.max(1)),
            fast: Timer::new(fast.max(1)),
            slow: Timer::new(slow_base.max(1)),
            slow_count: 0,
            queue: Deque::new(),
            dropped: 0,
        }
    }

    /// Consume raised interrupt flags, sample first
    ///
    /// Returns the number of flags that were raised.
    pub fn service_flags(&mut self, flags: &TickFlags) -> usize {
        let mut serviced = 0;
        if flags.sample.take() {
            self.on_sample_tick();
            serviced += 1;
        }
        if flags.fast.take() {
            self.on_fast_tick();
            serviced += 1;
        }
        if flags.slow.take() {
            self.on_slow_tick();
            serviced += 1;
        }
        serviced
    }

    /// Derive ticks from a clock instead of interrupts
    ///
    /// Each timer fires at most once per call.
    pub fn poll(&mut self, now: TimeUs) -> usize {
        let mut fired = 0;
        if self.sample.expired(now) {
            self.on_sample_tick();
            fired += 1;
        }
        if self.fast.expired(now) {
            self.on_fast_tick();
            fired += 1;
        }
        if self.slow.expired(now) {
            self.on_slow_tick();
            fired += 1;
        }
        fired
    }

    /// Sampler timer expired
    pub fn on_sample_tick(&mut self) {
        self.post(TickEvent::Sample);
    }

    /// Fast status timer expired
    pub fn on_fast_tick(&mut self) {
        self.post(TickEvent::PackSummary);
    }

    /// Slow base timer expired; every fourth one sends the slow frames
    pub fn on_slow_tick(&mut self) {
        self.slow_count += 1;
        if self.slow_count >= STATUS_SLOW_DIVIDER {
            self.slow_count = 0;
            self.post(TickEvent::QuadrantVoltages);
            self.post(TickEvent::CellAverages);
            self.post(TickEvent::Temperatures);
        }
    }

    /// Queue an event unless an identical one is already pending
    pub fn post(&mut self, event: TickEvent) -> bool {
        if self.queue.iter().any(|pending| *pending == event) {
            trace!("{:?} already pending", event);
            return false;
        }
        match self.queue.push_back(event) {
            Ok(()) => true,
            Err(_) => {
                warn!("Event queue full, dropping {:?}", event);
                self.dropped = self.dropped.wrapping_add(1);
                false
            }
        }
    }

    /// Next event in posting order
    pub fn next_event(&mut self) -> Option<TickEvent> {
        self.queue.pop_front()
    }

    /// Events waiting
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Events lost to a full queue
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
