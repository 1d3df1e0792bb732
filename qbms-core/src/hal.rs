//! QBMS - Hardware Abstraction Layer
//!
//! The core never touches pins, registers or bus peripherals directly.
//! Platforms implement these traits:
//! - [`Converter`]: one analog-to-digital converter, polled without blocking
//! - [`AnalogMux`]: routes one quadrant tap onto each converter
//! - [`CanBus`]: raw frame transmit/receive
//! - [`Clock`]: monotonic time
//!
//! # Implementing a HAL
//!
//! ```ignore
//! struct BoardCan;
//!
//! impl CanBus for BoardCan {
//!     fn transmit(&mut self, frame: &CanFrame) -> Result<()> {
//!         // Queue in the CAN peripheral mailbox
//!     }
//!
//!     fn receive(&mut self) -> Option<CanFrame> {
//!         // Pop from the RX FIFO
//!     }
//! }
//! ```

use crate::frames::CanFrame;
use crate::types::*;

// ============================================================================
// HAL Traits
// ============================================================================

/// Single-shot analog-to-digital converter
pub trait Converter {
    /// Kick off a conversion on the currently routed input
    ///
    /// Must return immediately.
    fn start_conversion(&mut self) -> Result<()>;

    /// Fetch the result of the last conversion
    ///
    /// `Ok(None)` means the conversion has not finished yet. That is
    /// expected backpressure, not an error.
    fn read(&mut self) -> Result<Option<i16>>;
}

/// Analog multiplexer in front of the two converters
pub trait AnalogMux {
    /// Route quadrant `quadrant`'s voltage tap to the voltage converter
    fn select_voltage(&mut self, quadrant: usize) -> Result<()>;

    /// Route quadrant `quadrant`'s thermistor to the temperature converter
    fn select_temperature(&mut self, quadrant: usize) -> Result<()>;
}

/// Raw CAN driver
pub trait CanBus {
    /// Queue a frame for transmission
    fn transmit(&mut self, frame: &CanFrame) -> Result<()>;

    /// Check for a received frame (non-blocking)
    ///
    /// Returns None if nothing is waiting.
    fn receive(&mut self) -> Option<CanFrame>;
}

/// Monotonic time source
pub trait Clock {
    /// Current time in microseconds
    fn time_us(&self) -> TimeUs;

    /// Current time in milliseconds (wrapping)
    fn time_ms(&self) -> TimeMs {
        (self.time_us() / 1000) as TimeMs
    }
}

// ============================================================================
// Test Doubles
// ============================================================================

/// Scripted hardware for tests and simulation
#[cfg(any(test, feature = "std"))]
pub mod mock {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use heapless::{Deque, Vec};

    /// Converter that replays a script of results
    ///
    /// Once the script runs dry every read returns `fallback`.
    pub struct ScriptedConverter {
        script: Deque<Option<i16>, 64>,
        fallback: Option<i16>,
        starts: u32,
        reads: u32,
        fail: bool,
    }

    impl ScriptedConverter {
        /// Converter that always reports `value`
        pub fn constant(value: i16) -> Self {
            Self {
                script: Deque::new(),
                fallback: Some(value),
                starts: 0,
                reads: 0,
                fail: false,
            }
        }

        /// Converter that never finishes a conversion
        pub fn never_ready() -> Self {
            Self {
                fallback: None,
                ..Self::constant(0)
            }
        }

        /// Append a result to the script
        pub fn push(&mut self, result: Option<i16>) {
            self.script.push_back(result).ok();
        }

        /// Change the value reported once the script is exhausted
        pub fn set_fallback(&mut self, fallback: Option<i16>) {
            self.fallback = fallback;
        }

        /// Make every call fail with `HalFailure`
        pub fn set_failing(&mut self, fail: bool) {
            self.fail = fail;
        }

        /// Conversions started so far
        pub fn starts(&self) -> u32 {
            self.starts
        }

        /// Reads attempted so far
        pub fn reads(&self) -> u32 {
            self.reads
        }
    }

    impl Converter for ScriptedConverter {
        fn start_conversion(&mut self) -> Result<()> {
            if self.fail {
                return Err(Error::HalFailure);
            }
            self.starts += 1;
            Ok(())
        }

        fn read(&mut self) -> Result<Option<i16>> {
            if self.fail {
                return Err(Error::HalFailure);
            }
            self.reads += 1;
            Ok(self.script.pop_front().unwrap_or(self.fallback))
        }
    }

    /// Multiplexer that remembers the selected taps
    #[derive(Debug, Default)]
    pub struct RecordingMux {
        /// Selected voltage tap
        pub voltage: Option<usize>,
        /// Selected thermistor
        pub temperature: Option<usize>,
        /// Number of switch operations
        pub switches: u32,
    }

    impl AnalogMux for RecordingMux {
        fn select_voltage(&mut self, quadrant: usize) -> Result<()> {
            if quadrant >= QUADRANT_COUNT {
                return Err(Error::InvalidArg);
            }
            self.voltage = Some(quadrant);
            self.switches += 1;
            Ok(())
        }

        fn select_temperature(&mut self, quadrant: usize) -> Result<()> {
            if quadrant >= QUADRANT_COUNT {
                return Err(Error::InvalidArg);
            }
            self.temperature = Some(quadrant);
            self.switches += 1;
            Ok(())
        }
    }

    /// CAN bus that records transmitted frames and replays an inbox
    #[derive(Default)]
    pub struct RecordingBus {
        sent: Vec<CanFrame, 128>,
        inbox: Deque<CanFrame, 32>,
        fail: bool,
    }

    impl RecordingBus {
        /// Create an empty bus
        pub fn new() -> Self {
            Self::default()
        }

        /// Frames transmitted so far (oldest first)
        pub fn sent(&self) -> &[CanFrame] {
            &self.sent
        }

        /// Forget transmitted frames
        pub fn clear(&mut self) {
            self.sent.clear();
        }

        /// Queue a frame for `receive`
        pub fn inject(&mut self, frame: CanFrame) {
            self.inbox.push_back(frame).ok();
        }

        /// Make every transmit fail
        pub fn set_failing(&mut self, fail: bool) {
            self.fail = fail;
        }
    }

    impl CanBus for RecordingBus {
        fn transmit(&mut self, frame: &CanFrame) -> Result<()> {
            if self.fail {
                return Err(Error::HalFailure);
            }
            if self.sent.is_full() {
                self.sent.remove(0);
            }
            self.sent.push(*frame).map_err(|_| Error::HalFailure)
        }

        fn receive(&mut self) -> Option<CanFrame> {
            self.inbox.pop_front()
        }
    }

    /// Manually advanced clock
    pub struct ManualClock {
        time: AtomicU64,
    }

    impl ManualClock {
        /// Create a clock at t=0
        pub fn new() -> Self {
            Self {
                time: AtomicU64::new(0),
            }
        }

        /// Advance time (for testing)
        pub fn advance_us(&self, us: u64) {
            self.time.fetch_add(us, Ordering::SeqCst);
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for ManualClock {
        fn time_us(&self) -> TimeUs {
            self.time.load(Ordering::SeqCst)
        }
    }
}
