//! Internal implementation modules.
//!
//! Exposed for advanced use (custom transports, protocol tooling) and
//! for the test suite; the API here is not covered by semver.

pub mod control;
pub mod framing;
pub mod router;
pub mod session;
pub mod transport;
