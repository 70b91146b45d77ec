//! Keyed dependency registry.
//!
//! Maps client handles to the single construction of their dependency and owns the
//! teardown of that dependency when the handle goes away.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::pending::PendingValue;
use crate::spawn::TaskClass;
use crate::{BoxError, Dependency, Error, Handle, HandleId, PendingState, Result};

/// Lifecycle state of one handle's entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
	/// No construction requested, or released since.
	Absent,
	/// Construction in flight.
	Pending,
	/// Constructed and shared.
	Ready,
	/// Construction failed; sticky until released.
	Failed,
}

impl From<PendingState> for EntryState {
	fn from(state: PendingState) -> Self {
		match state {
			PendingState::Pending => Self::Pending,
			PendingState::Ready => Self::Ready,
			PendingState::Failed => Self::Failed,
		}
	}
}

/// A termination that failed during [`Registry::shutdown_all`].
#[derive(Debug, Clone)]
pub struct ShutdownFailure {
	/// Handle whose dependency failed to terminate.
	pub handle: HandleId,
	/// The termination error.
	pub error: Error,
}

/// Registry guaranteeing at most one construction of `D` per [`Handle`].
///
/// # Concurrency
///
/// The handle map is the only shared state. It is touched in two places, the
/// check-and-reserve step of [`acquire`](Self::acquire) and the removal step of
/// [`release`](Self::release), each inside a synchronous critical section with no
/// await point. Construction and termination both run outside the lock.
pub struct Registry<D> {
	entries: Mutex<HashMap<HandleId, PendingValue<D>>>,
	class: TaskClass,
}

impl<D: Dependency> Default for Registry<D> {
	fn default() -> Self {
		Self::new()
	}
}

impl<D: Dependency> fmt::Debug for Registry<D> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registry")
			.field("dependency", &D::kind())
			.field("class", &self.class)
			.field("entries", &self.len())
			.finish()
	}
}

impl<D: Dependency> Registry<D> {
	/// Creates an empty registry spawning constructions as [`TaskClass::Interactive`].
	pub fn new() -> Self {
		Self::with_class(TaskClass::Interactive)
	}

	/// Creates an empty registry spawning constructions under `class`.
	pub fn with_class(class: TaskClass) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			class,
		}
	}

	/// Returns the task class constructions are spawned under.
	pub fn class(&self) -> TaskClass {
		self.class
	}

	/// Returns the dependency for `handle`, constructing it with `factory` if needed.
	///
	/// If an entry exists (pending, ready or failed) it is returned unchanged and
	/// `factory` is dropped without being called. Otherwise the slot is reserved before
	/// `factory` is invoked, so concurrent callers for the same handle join this
	/// construction instead of starting their own.
	///
	/// A failed construction stays in the registry: later calls observe the same
	/// [`Error`] until [`release`](Self::release) clears it. If `factory` itself panics
	/// before producing its future, the entry settles as [`Error::ConstructionLost`].
	pub fn acquire<F, Fut, E>(&self, handle: &Handle, factory: F) -> PendingValue<D>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = std::result::Result<D, E>> + Send + 'static,
		E: Into<BoxError>,
	{
		let (settler, value) = {
			let mut entries = self.entries.lock();
			match entries.entry(handle.id()) {
				Entry::Occupied(existing) => {
					trace!(handle = %handle, dependency = D::kind(), "acquire.join");
					return existing.get().clone();
				}
				Entry::Vacant(slot) => {
					let (settler, value) = PendingValue::reserve();
					slot.insert(value.clone());
					(settler, value)
				}
			}
		};

		debug!(
			handle = %handle,
			dependency = D::kind(),
			task_class = self.class.as_str(),
			"acquire.construct"
		);
		settler.run(self.class, D::kind(), factory());
		value
	}

	/// Releases the dependency held for `handle`.
	///
	/// The entry is removed before anything is awaited, so an [`acquire`](Self::acquire)
	/// issued while this call is in progress starts a fresh construction. The removed
	/// construction is then waited out and, if it succeeded, terminated exactly once.
	///
	/// Releasing a handle without an entry is a no-op.
	///
	/// # Errors
	///
	/// Returns [`Error::Termination`] if [`Dependency::terminate`] fails. The entry stays
	/// removed either way.
	pub async fn release(&self, handle: &Handle) -> Result<()> {
		self.release_id(handle.id()).await
	}

	async fn release_id(&self, id: HandleId) -> Result<()> {
		let removed = self.entries.lock().remove(&id);
		let Some(pending) = removed else {
			trace!(handle = %id, dependency = D::kind(), "release.absent");
			return Ok(());
		};
		terminate_when_settled(id, pending, None).await
	}

	/// Returns the entry for `handle` without constructing anything.
	pub fn get(&self, handle: &Handle) -> Option<PendingValue<D>> {
		self.entries.lock().get(&handle.id()).cloned()
	}

	/// Returns the lifecycle state for `handle`.
	pub fn state(&self, handle: &Handle) -> EntryState {
		self.entries
			.lock()
			.get(&handle.id())
			.map_or(EntryState::Absent, |pending| pending.state().into())
	}

	/// Returns true if `handle` has an entry.
	pub fn contains(&self, handle: &Handle) -> bool {
		self.entries.lock().contains_key(&handle.id())
	}

	/// Returns the number of entries, in any state.
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	/// Returns true if no handle has an entry.
	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Returns the handles with an entry, ordered by creation.
	pub fn handles(&self) -> Vec<HandleId> {
		let mut ids: Vec<_> = self.entries.lock().keys().copied().collect();
		ids.sort_unstable();
		ids
	}

	/// Releases every entry.
	///
	/// All entries are taken out of the map at once; constructions still in flight are
	/// waited out and every successful one is terminated, concurrently. When
	/// `terminate_timeout` is set, each [`Dependency::terminate`] call is bounded by it.
	///
	/// Returns the terminations that failed, ordered by handle. Failed constructions
	/// are not reported since there was nothing to terminate.
	pub async fn shutdown_all(&self, terminate_timeout: Option<Duration>) -> Vec<ShutdownFailure> {
		let drained: Vec<_> = self.entries.lock().drain().collect();
		if drained.is_empty() {
			return Vec::new();
		}

		debug!(dependency = D::kind(), count = drained.len(), "registry.shutdown_all");
		let results = futures::future::join_all(drained.into_iter().map(|(id, pending)| async move {
			terminate_when_settled(id, pending, terminate_timeout)
				.await
				.err()
				.map(|error| ShutdownFailure { handle: id, error })
		}))
		.await;

		let mut failures: Vec<_> = results.into_iter().flatten().collect();
		failures.sort_unstable_by_key(|failure| failure.handle);
		failures
	}
}

/// Waits for `pending` to settle and terminates the dependency if it was built.
async fn terminate_when_settled<D: Dependency>(id: HandleId, pending: PendingValue<D>, limit: Option<Duration>) -> Result<()> {
	let dependency = match pending.wait().await {
		Ok(dependency) => dependency,
		Err(err) => {
			debug!(handle = %id, dependency = D::kind(), error = %err, "release.discard_failed");
			return Ok(());
		}
	};

	debug!(handle = %id, dependency = D::kind(), "release.terminate");
	let terminate = dependency.terminate();
	let result = match limit {
		Some(limit) => tokio::time::timeout(limit, terminate)
			.await
			.map_err(|_| Error::TerminationTimeout(limit))?,
		None => terminate.await,
	};
	result.map_err(Error::termination)
}

/// Type-erased view of a [`Registry`] used by owners that tear down many registries.
#[async_trait::async_trait]
pub trait TeardownRegistry: Send + Sync {
	/// Dependency kind served by the registry.
	fn kind(&self) -> &'static str;

	/// Number of live entries.
	fn active(&self) -> usize;

	/// Releases the entry for one handle, see [`Registry::release`].
	async fn release_handle(&self, handle: HandleId) -> Result<()>;

	/// Releases every entry, see [`Registry::shutdown_all`].
	async fn shutdown(&self, terminate_timeout: Option<Duration>) -> Vec<ShutdownFailure>;
}

#[async_trait::async_trait]
impl<D: Dependency> TeardownRegistry for Registry<D> {
	fn kind(&self) -> &'static str {
		D::kind()
	}

	fn active(&self) -> usize {
		self.len()
	}

	async fn release_handle(&self, handle: HandleId) -> Result<()> {
		self.release_id(handle).await
	}

	async fn shutdown(&self, terminate_timeout: Option<Duration>) -> Vec<ShutdownFailure> {
		self.shutdown_all(terminate_timeout).await
	}
}
