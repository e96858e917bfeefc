// skv-common - Shared configuration, errors and wire framing for the SKV driver
//
// Both the blocking client and the test server depend on this crate so the
// framing rules live in exactly one place.

pub mod config;
pub mod error;
pub mod frame;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use frame::*;
