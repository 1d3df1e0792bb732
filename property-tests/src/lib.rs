//! QBMS Property-Based Tests
//!
//! Standalone test suite using proptest for invariant verification.
//! This project is completely isolated from the main qbms crate.
//!
//! # Usage
//!
//! ```bash
//! cargo test -p qbms-property-tests            # Run all property tests
//! cargo test -p qbms-property-tests fault      # Run only fault tests
//! cargo test -p qbms-property-tests -- --nocapture
//! PROPTEST_CASES=1000 cargo test -p qbms-property-tests
//! ```
//!
//! # Test Modules
//!
//! - `sampler`: phase cycle, evaluation cadence, smoothing bounds
//! - `fault`: permission bits follow the fault bits
//! - `coulomb`: capacity bounds, clamp reporting, SOC scaling
//! - `charger`: taper bounds, gating
//! - `frames`: identifier format, payload decoding
//! - `scheduler`: queue bounds, timer cadence

// Re-export for convenience in tests
pub use qbms::*;
