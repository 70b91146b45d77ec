//! Session-level lifecycle: registries per kind, per-handle release and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tether_lifecycle::{BoxError, Dependency, EntryState, Error, Handle};
use tether_session::{ConstructionClass, Session, SessionConfig};

/// Stand-in for a connection-backed client.
#[derive(Debug)]
struct Client {
	closed: Arc<AtomicUsize>,
	fail_close: bool,
}

#[async_trait]
impl Dependency for Client {
	async fn terminate(&self) -> Result<(), BoxError> {
		self.closed.fetch_add(1, Ordering::SeqCst);
		if self.fail_close {
			return Err("transport already gone".into());
		}
		Ok(())
	}

	fn kind() -> &'static str {
		"client"
	}
}

/// Stand-in for a background sync worker that never shuts down on its own.
#[derive(Debug)]
struct Watcher {
	closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Dependency for Watcher {
	async fn terminate(&self) -> Result<(), BoxError> {
		self.closed.fetch_add(1, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_secs(60)).await;
		Ok(())
	}

	fn kind() -> &'static str {
		"watcher"
	}
}

fn client(closed: Arc<AtomicUsize>, fail_close: bool) -> impl FnOnce() -> std::future::Ready<Result<Client, BoxError>> {
	move || std::future::ready(Ok(Client { closed, fail_close }))
}

fn watcher(closed: Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<Result<Watcher, BoxError>> {
	move || std::future::ready(Ok(Watcher { closed }))
}

fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn registries_are_created_lazily_once_per_kind() {
	let session = Session::default();
	assert!(session.kinds().is_empty());

	let a = session.registry::<Client>();
	let b = session.registry::<Client>();
	assert!(Arc::ptr_eq(&a, &b));

	session.registry::<Watcher>();
	assert_eq!(session.kinds(), vec!["client", "watcher"]);
}

#[test]
fn registries_inherit_the_configured_class() {
	let config = SessionConfig {
		construction_class: ConstructionClass::Background,
		..SessionConfig::default()
	};
	let session = Session::new(config);
	assert_eq!(session.registry::<Client>().class(), tether_lifecycle::TaskClass::Background);
}

#[tokio::test]
async fn release_handle_covers_every_kind_for_that_handle_only() {
	init_tracing();
	let session = Session::default();
	let closed = Arc::new(AtomicUsize::new(0));
	let mine = Handle::named("mine");
	let other = Handle::named("other");

	session.acquire(&mine, client(closed.clone(), false)).wait().await.unwrap();
	session.acquire(&other, client(closed.clone(), false)).wait().await.unwrap();
	assert_eq!(session.active(), 2);

	session.release_handle(&mine).await.unwrap();
	assert_eq!(closed.load(Ordering::SeqCst), 1);
	assert_eq!(session.registry::<Client>().state(&mine), EntryState::Absent);
	assert_eq!(session.registry::<Client>().state(&other), EntryState::Ready);

	// Releasing again is harmless.
	session.release_handle(&mine).await.unwrap();
	assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn release_handle_reports_failures_and_keeps_going() {
	let session = Session::new(SessionConfig {
		terminate_timeout_secs: 0,
		..SessionConfig::default()
	});
	let closed = Arc::new(AtomicUsize::new(0));
	let handle = Handle::new();

	session.acquire(&handle, client(closed.clone(), true)).wait().await.unwrap();
	session.registry::<Watcher>();

	let err = session.release_handle(&handle).await.unwrap_err();
	assert_eq!(err.failures.len(), 1);
	assert_eq!(err.failures[0].dependency, "client");
	assert_eq!(err.failures[0].handle, handle.id());
	assert!(matches!(err.failures[0].error, Error::Termination(_)));
	assert_eq!(err.to_string(), "1 termination(s) failed");
	assert_eq!(session.active(), 0);
}

#[tokio::test]
async fn typed_release_does_not_create_a_registry() {
	let session = Session::default();
	session.release::<Client>(&Handle::new()).await.unwrap();
	assert!(session.kinds().is_empty());
}

#[tokio::test]
async fn typed_release_terminates_an_existing_entry() {
	let session = Session::default();
	let closed = Arc::new(AtomicUsize::new(0));
	let handle = Handle::new();

	let first = session.acquire(&handle, client(closed.clone(), false)).wait().await.unwrap();
	session.release::<Client>(&handle).await.unwrap();
	assert_eq!(closed.load(Ordering::SeqCst), 1);
	assert_eq!(session.registry::<Client>().state(&handle), EntryState::Absent);

	// A second typed release finds nothing left to terminate.
	session.release::<Client>(&handle).await.unwrap();
	assert_eq!(closed.load(Ordering::SeqCst), 1);

	let second = session.acquire(&handle, client(closed.clone(), false)).wait().await.unwrap();
	assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn typed_release_surfaces_termination_failure() {
	let session = Session::default();
	let closed = Arc::new(AtomicUsize::new(0));
	let handle = Handle::new();

	session.acquire(&handle, client(closed.clone(), true)).wait().await.unwrap();
	let err = session.release::<Client>(&handle).await.unwrap_err();
	assert!(matches!(err, Error::Termination(_)));
	assert_eq!(session.active(), 0);
}

#[tokio::test]
async fn teardown_terminates_everything_within_the_bound() {
	init_tracing();
	let session = Session::new(SessionConfig::from_toml_str("terminate_timeout_secs = 1").unwrap());
	let client_closed = Arc::new(AtomicUsize::new(0));
	let watcher_closed = Arc::new(AtomicUsize::new(0));
	let first = Handle::new();
	let second = Handle::new();

	session.acquire(&first, client(client_closed.clone(), false));
	session.acquire(&second, client(client_closed.clone(), false));
	session.acquire(&first, watcher(watcher_closed.clone()));

	let err = session.teardown().await.unwrap_err();
	assert_eq!(client_closed.load(Ordering::SeqCst), 2);
	assert_eq!(watcher_closed.load(Ordering::SeqCst), 1);
	assert_eq!(err.failures.len(), 1);
	assert_eq!(err.failures[0].dependency, "watcher");
	assert!(matches!(
		err.failures[0].error,
		Error::TerminationTimeout(limit) if limit == Duration::from_secs(1)
	));
	assert_eq!(session.active(), 0);

	// The session remains usable after teardown.
	session.acquire(&first, client(client_closed.clone(), false)).wait().await.unwrap();
	assert_eq!(session.active(), 1);
	session.teardown().await.unwrap();
	assert_eq!(client_closed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_constructions_are_dropped_silently_at_teardown() {
	let session = Session::default();
	let handle = Handle::new();

	let err = session
		.acquire(&handle, || std::future::ready(Err::<Client, BoxError>("dns lookup failed".into())))
		.wait()
		.await
		.unwrap_err();
	assert!(err.is_construction());

	session.teardown().await.unwrap();
	assert_eq!(session.active(), 0);
}
