//! The session context owning every dependency registry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_lifecycle::{BoxError, Dependency, Handle, PendingValue, Registry, ShutdownFailure, TeardownRegistry};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::{TeardownError, TeardownFailure};

/// One registry, reachable both typed and erased.
///
/// Slots are keyed by `TypeId::of::<D>()` and only ever inserted by
/// [`Session::registry`], so `typed` always downcasts to `Registry<D>` for that key.
struct Slot {
	typed: Arc<dyn Any + Send + Sync>,
	erased: Arc<dyn TeardownRegistry>,
}

/// Top-level context owning one [`Registry`] per dependency kind.
///
/// Registries are created on first use and live as long as the session. A session is
/// meant to be created once per process or test and torn down explicitly with
/// [`teardown`](Self::teardown).
pub struct Session {
	config: SessionConfig,
	registries: Mutex<HashMap<TypeId, Slot>>,
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("config", &self.config)
			.field("kinds", &self.kinds())
			.finish()
	}
}

impl Default for Session {
	fn default() -> Self {
		Self::new(SessionConfig::default())
	}
}

impl Session {
	/// Creates a session with no registries yet.
	pub fn new(config: SessionConfig) -> Self {
		Self {
			config,
			registries: Mutex::new(HashMap::new()),
		}
	}

	/// Returns the session configuration.
	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	/// Returns the registry for `D`, creating it on first use.
	pub fn registry<D: Dependency>(&self) -> Arc<Registry<D>> {
		let mut registries = self.registries.lock();
		let slot = registries.entry(TypeId::of::<D>()).or_insert_with(|| {
			debug!(dependency = D::kind(), "session.registry_init");
			let registry = Arc::new(Registry::<D>::with_class(self.config.construction_class.into()));
			Slot {
				typed: registry.clone(),
				erased: registry,
			}
		});
		Arc::clone(&slot.typed)
			.downcast::<Registry<D>>()
			.expect("registry slot keyed by TypeId holds that type")
	}

	/// Returns the registry for `D` if one was created.
	fn existing<D: Dependency>(&self) -> Option<Arc<Registry<D>>> {
		let registries = self.registries.lock();
		let slot = registries.get(&TypeId::of::<D>())?;
		Arc::clone(&slot.typed).downcast::<Registry<D>>().ok()
	}

	/// Acquires the `D` dependency for `handle`, see [`Registry::acquire`].
	pub fn acquire<D, F, Fut, E>(&self, handle: &Handle, factory: F) -> PendingValue<D>
	where
		D: Dependency,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<D, E>> + Send + 'static,
		E: Into<BoxError>,
	{
		self.registry::<D>().acquire(handle, factory)
	}

	/// Releases the `D` dependency for `handle`, see [`Registry::release`].
	///
	/// Does not create a registry for `D` if none exists.
	pub async fn release<D: Dependency>(&self, handle: &Handle) -> tether_lifecycle::Result<()> {
		match self.existing::<D>() {
			Some(registry) => registry.release(handle).await,
			None => Ok(()),
		}
	}

	/// Returns the dependency kinds with a registry, sorted.
	pub fn kinds(&self) -> Vec<&'static str> {
		let mut kinds: Vec<_> = self.registries.lock().values().map(|slot| slot.erased.kind()).collect();
		kinds.sort_unstable();
		kinds
	}

	/// Returns the number of live entries across every registry.
	pub fn active(&self) -> usize {
		self.registries.lock().values().map(|slot| slot.erased.active()).sum()
	}

	fn erased(&self) -> Vec<Arc<dyn TeardownRegistry>> {
		let mut erased: Vec<_> = self.registries.lock().values().map(|slot| Arc::clone(&slot.erased)).collect();
		erased.sort_unstable_by_key(|registry| registry.kind());
		erased
	}

	/// Releases every dependency held for `handle`, in every registry.
	///
	/// Call this when the owning handle is terminated. Every registry is visited even
	/// when an earlier termination fails.
	///
	/// # Errors
	///
	/// Returns every termination failure encountered.
	pub async fn release_handle(&self, handle: &Handle) -> Result<(), TeardownError> {
		debug!(handle = %handle, "session.release_handle");
		let mut failures = Vec::new();
		for registry in self.erased() {
			if let Err(error) = registry.release_handle(handle.id()).await {
				warn!(handle = %handle, dependency = registry.kind(), error = %error, "session.release_failed");
				failures.push(TeardownFailure {
					dependency: registry.kind(),
					handle: handle.id(),
					error,
				});
			}
		}
		TeardownError::from_failures(failures)
	}

	/// Releases every dependency in every registry.
	///
	/// Each termination is bounded by [`SessionConfig::terminate_timeout`]. Registries
	/// stay in place afterwards and can be used again.
	///
	/// # Errors
	///
	/// Returns every termination failure encountered.
	pub async fn teardown(&self) -> Result<(), TeardownError> {
		let registries = self.erased();
		info!(registries = registries.len(), active = self.active(), "session.teardown");

		let limit = self.config.terminate_timeout();
		let mut failures = Vec::new();
		for registry in registries {
			for ShutdownFailure { handle, error } in registry.shutdown(limit).await {
				warn!(handle = %handle, dependency = registry.kind(), error = %error, "session.teardown_failed");
				failures.push(TeardownFailure {
					dependency: registry.kind(),
					handle,
					error,
				});
			}
		}
		TeardownError::from_failures(failures)
	}
}
