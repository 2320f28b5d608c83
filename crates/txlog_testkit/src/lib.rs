//! # txlog Testkit
//!
//! Test utilities for the txlog transaction log.
//!
//! This crate provides:
//! - Test fixtures: recording appliers and logs on in-memory or temporary
//!   directories
//! - Property-based test generators using proptest
//! - Crash simulation: power loss, process kills and failing appends
//! - Concurrent commit drivers for stress tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txlog_testkit::prelude::*;
//!
//! #[test]
//! fn commits_survive_power_loss() {
//!     let log = TestLog::memory();
//!     log.commit(&node_transaction(1, 2)).unwrap();
//!     let recovered = log.reopen_after(CrashKind::PowerLoss);
//!     assert_eq!(recovered.last_committed_tx().as_u64(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_logging;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;

/// Installs a tracing subscriber for tests, once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Output goes
/// through the test writer, so it is captured unless `--nocapture` is set.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
