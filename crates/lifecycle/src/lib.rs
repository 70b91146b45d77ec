//! Keyed async-singleton lifecycle management.
//!
//! A [`Registry`] associates each client [`Handle`] with at most one lazily
//! constructed [`Dependency`]. Construction is asynchronous and expensive (opening a
//! transport, negotiating a wire format), so concurrent callers must converge on a
//! single in-flight construction instead of racing to build their own.
//!
//! The building block is [`PendingValue`]: a settle-once, multi-observer container for
//! the outcome of one construction. [`Registry::acquire`] reserves the slot for a
//! handle synchronously and fulfils it asynchronously, so the check-and-insert step
//! never crosses a suspension point. [`Registry::release`] removes the slot first and
//! only then waits out construction before terminating the dependency, so teardown can
//! never observe (or interrupt) a half-built dependency.
//!
//! ## Failure policy
//!
//! Failed constructions are sticky: every later [`Registry::acquire`] for the same
//! handle observes the same [`Error`] until the handle is released. Nothing is retried
//! implicitly.
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

mod handle;
pub mod pending;
pub mod registry;
pub mod spawn;

pub use handle::{Handle, HandleId};
pub use pending::{Outcome, PendingState, PendingValue, Settler};
pub use registry::{EntryState, Registry, ShutdownFailure, TeardownRegistry};
pub use spawn::TaskClass;

/// Boxed error accepted from factories and [`Dependency::terminate`].
///
/// `anyhow::Error` and any `std::error::Error + Send + Sync` convert into this.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared error cause, handed out identically to every observer of a failure.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
///
/// Cloning an error shares its cause; two clones of one construction failure point
/// at the same [`SharedError`].
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The factory failed while building the dependency.
	#[error("construction failed: {0}")]
	Construction(#[source] SharedError),
	/// The factory panicked while building the dependency.
	#[error("construction panicked: {0}")]
	ConstructionPanicked(Arc<str>),
	/// The reservation was dropped before a construction was started for it.
	#[error("construction abandoned before it started")]
	ConstructionLost,
	/// [`Dependency::terminate`] failed during release.
	#[error("termination failed: {0}")]
	Termination(#[source] SharedError),
	/// [`Dependency::terminate`] did not finish within the teardown bound.
	#[error("termination timed out after {0:?}")]
	TerminationTimeout(Duration),
}

impl Error {
	/// Wraps a factory error.
	pub fn construction(err: impl Into<BoxError>) -> Self {
		Self::Construction(Arc::from(err.into()))
	}

	/// Wraps a [`Dependency::terminate`] error.
	pub fn termination(err: impl Into<BoxError>) -> Self {
		Self::Termination(Arc::from(err.into()))
	}

	/// Returns true for any of the construction-side variants.
	pub fn is_construction(&self) -> bool {
		matches!(
			self,
			Self::Construction(_) | Self::ConstructionPanicked(_) | Self::ConstructionLost
		)
	}
}

/// An expensive, asynchronously constructed object managed by a [`Registry`].
///
/// The factory handed to [`Registry::acquire`] is responsible for fully starting the
/// dependency (binding it to its transport). The registry only ever calls
/// [`terminate`](Self::terminate), once per successful construction, after that
/// construction has settled.
#[async_trait::async_trait]
pub trait Dependency: Send + Sync + 'static {
	/// Releases the transport and any background work owned by the dependency.
	async fn terminate(&self) -> std::result::Result<(), BoxError>;

	/// Short name used in log fields and teardown reports.
	fn kind() -> &'static str
	where
		Self: Sized,
	{
		std::any::type_name::<Self>()
	}
}
