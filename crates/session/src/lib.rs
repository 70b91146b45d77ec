//! Session-scoped ownership of dependency registries.
//!
//! A [`Session`] is the explicit, injectable owner of every
//! [`Registry`](tether_lifecycle::Registry) in a process: one per dependency kind,
//! created on first use. It ties registry lifetimes to the handles they serve through
//! [`Session::release_handle`] and to the session itself through [`Session::teardown`].
//!
//! ```toml
//! construction_class = "background"
//! terminate_timeout_secs = 10
//! ```
#![warn(missing_docs)]

use tether_lifecycle::HandleId;

mod config;
mod session;

pub use config::{ConfigError, ConstructionClass, SessionConfig};
pub use session::Session;

/// One termination that failed while releasing a handle or tearing a session down.
#[derive(Debug, Clone)]
pub struct TeardownFailure {
	/// Dependency kind of the registry the failure came from.
	pub dependency: &'static str,
	/// Handle whose dependency failed to terminate.
	pub handle: HandleId,
	/// The termination error.
	pub error: tether_lifecycle::Error,
}

/// Terminations that failed during [`Session::release_handle`] or [`Session::teardown`].
#[derive(Debug, thiserror::Error)]
#[error("{} termination(s) failed", .failures.len())]
pub struct TeardownError {
	/// Every failure, grouped by dependency kind.
	pub failures: Vec<TeardownFailure>,
}

impl TeardownError {
	fn from_failures(failures: Vec<TeardownFailure>) -> Result<(), Self> {
		if failures.is_empty() { Ok(()) } else { Err(Self { failures }) }
	}
}
