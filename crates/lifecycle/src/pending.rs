//! Settle-once asynchronous results shared by many observers.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;

use crate::spawn::{TaskClass, panic_message, spawn};
use crate::{BoxError, Error};

/// Settled result of a construction. The value is shared, never copied.
pub type Outcome<T> = Result<Arc<T>, Error>;

/// Coarse state of a [`PendingValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingState {
	/// The computation is still running.
	Pending,
	/// The computation produced a value.
	Ready,
	/// The computation failed.
	Failed,
}

/// The result of an asynchronous computation, observable by any number of callers.
///
/// A pending value settles exactly once. Every observer, including ones that start
/// waiting long after settlement, sees the same outcome: the same `Arc<T>` on success,
/// a clone of the same [`Error`] on failure.
///
/// There is no way to cancel the computation behind a pending value. Dropping every
/// clone leaves it running to completion.
pub struct PendingValue<T> {
	rx: watch::Receiver<Option<Outcome<T>>>,
}

/// Write side of a reserved [`PendingValue`].
///
/// Dropping a settler that never settled resolves its value to
/// [`Error::ConstructionLost`], so observers can never hang on an abandoned slot.
pub struct Settler<T> {
	tx: Option<watch::Sender<Option<Outcome<T>>>>,
}

impl<T> Clone for PendingValue<T> {
	fn clone(&self) -> Self {
		Self { rx: self.rx.clone() }
	}
}

impl<T> fmt::Debug for PendingValue<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PendingValue")
			.field("state", &self.state())
			.finish()
	}
}

impl<T> PendingValue<T> {
	/// Reserves an unsettled value and returns it together with its only writer.
	pub fn reserve() -> (Settler<T>, Self) {
		let (tx, rx) = watch::channel(None);
		(Settler { tx: Some(tx) }, Self { rx })
	}

	/// Creates an already resolved value.
	pub fn ready(value: T) -> Self {
		Self::settled(Ok(Arc::new(value)))
	}

	/// Creates an already rejected value.
	pub fn failed(error: Error) -> Self {
		Self::settled(Err(error))
	}

	fn settled(outcome: Outcome<T>) -> Self {
		let (_tx, rx) = watch::channel(Some(outcome));
		Self { rx }
	}

	/// Returns the outcome if already settled, without waiting.
	pub fn peek(&self) -> Option<Outcome<T>> {
		self.rx.borrow().clone()
	}

	/// Returns the current state.
	pub fn state(&self) -> PendingState {
		match &*self.rx.borrow() {
			None => PendingState::Pending,
			Some(Ok(_)) => PendingState::Ready,
			Some(Err(_)) => PendingState::Failed,
		}
	}

	/// Returns true once the value has resolved or failed.
	pub fn is_settled(&self) -> bool {
		self.state() != PendingState::Pending
	}

	/// Returns true if both values observe the same computation.
	pub fn same_value(&self, other: &Self) -> bool {
		self.rx.same_channel(&other.rx)
	}

	/// Waits for settlement and returns the outcome.
	///
	/// Returns immediately when already settled.
	pub async fn wait(&self) -> Outcome<T> {
		if let Some(outcome) = self.peek() {
			return outcome;
		}

		let mut rx = self.rx.clone();
		if let Ok(settled) = rx.wait_for(Option::is_some).await
			&& let Some(outcome) = &*settled
		{
			return outcome.clone();
		}
		Err(Error::ConstructionLost)
	}
}

impl<T: Send + Sync + 'static> PendingValue<T> {
	/// Starts `computation` immediately and returns a value settling with its result.
	pub fn spawn<F, E>(class: TaskClass, label: &'static str, computation: F) -> Self
	where
		F: Future<Output = Result<T, E>> + Send + 'static,
		E: Into<BoxError>,
	{
		let (settler, value) = Self::reserve();
		settler.run(class, label, computation);
		value
	}
}

impl<T> Settler<T> {
	/// Settles the reserved value. Observers are woken immediately.
	pub fn settle(mut self, outcome: Outcome<T>) {
		if let Some(tx) = self.tx.take() {
			tx.send_replace(Some(outcome));
		}
	}
}

impl<T: Send + Sync + 'static> Settler<T> {
	/// Detaches `computation` onto the runtime and settles with its result.
	///
	/// A panic inside the computation settles as [`Error::ConstructionPanicked`].
	pub fn run<F, E>(self, class: TaskClass, label: &'static str, computation: F)
	where
		F: Future<Output = Result<T, E>> + Send + 'static,
		E: Into<BoxError>,
	{
		spawn(class, label, async move {
			let outcome = match AssertUnwindSafe(computation).catch_unwind().await {
				Ok(Ok(value)) => Ok(Arc::new(value)),
				Ok(Err(err)) => Err(Error::construction(err)),
				Err(payload) => Err(Error::ConstructionPanicked(Arc::from(panic_message(&*payload)))),
			};
			match &outcome {
				Ok(_) => tracing::debug!(dependency = label, "construction.ready"),
				Err(err) => tracing::debug!(dependency = label, error = %err, "construction.failed"),
			}
			self.settle(outcome);
		});
	}
}

impl<T> Drop for Settler<T> {
	fn drop(&mut self) {
		if let Some(tx) = self.tx.take() {
			tx.send_replace(Some(Err(Error::ConstructionLost)));
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use tokio::sync::Notify;

	use super::*;

	#[derive(Debug, thiserror::Error)]
	#[error("handshake refused")]
	struct Refused;

	#[tokio::test]
	async fn observers_share_one_value() {
		let gate = Arc::new(Notify::new());
		let value = PendingValue::spawn(TaskClass::Interactive, "test", {
			let gate = gate.clone();
			async move {
				gate.notified().await;
				Ok::<_, Refused>(String::from("conn"))
			}
		});
		assert_eq!(value.state(), PendingState::Pending);

		let early = tokio::spawn({
			let value = value.clone();
			async move { value.wait().await }
		});
		tokio::task::yield_now().await;
		gate.notify_one();

		let early = early.await.unwrap().unwrap();
		let late = value.wait().await.unwrap();
		assert!(Arc::ptr_eq(&early, &late));
		assert_eq!(value.state(), PendingState::Ready);
	}

	#[tokio::test]
	async fn failure_is_shared_by_every_observer() {
		let value = PendingValue::<u32>::spawn(TaskClass::Interactive, "test", async { Err(Refused) });

		let first = value.wait().await.unwrap_err();
		let second = value.clone().wait().await.unwrap_err();
		match (first, second) {
			(Error::Construction(a), Error::Construction(b)) => {
				assert!(Arc::ptr_eq(&a, &b));
				assert_eq!(a.to_string(), "handshake refused");
			}
			other => panic!("unexpected outcome: {other:?}"),
		}
		assert_eq!(value.state(), PendingState::Failed);
	}

	#[tokio::test]
	async fn computation_runs_without_observers() {
		let ran = Arc::new(AtomicUsize::new(0));
		let done = Arc::new(Notify::new());
		let value = PendingValue::spawn(TaskClass::Background, "test", {
			let ran = ran.clone();
			let done = done.clone();
			async move {
				ran.fetch_add(1, Ordering::SeqCst);
				done.notify_one();
				Ok::<_, Refused>(())
			}
		});
		drop(value);

		tokio::time::timeout(Duration::from_secs(1), done.notified())
			.await
			.expect("computation should run to completion");
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn panicking_computation_settles_as_failure() {
		let value = PendingValue::<u32>::spawn(TaskClass::Interactive, "test", async {
			if true {
				panic!("transport exploded");
			}
			Ok::<_, Refused>(1)
		});

		match value.wait().await {
			Err(Error::ConstructionPanicked(msg)) => assert!(msg.contains("transport exploded")),
			other => panic!("unexpected outcome: {other:?}"),
		}
	}

	#[tokio::test]
	async fn dropped_settler_resolves_as_lost() {
		let (settler, value) = PendingValue::<u32>::reserve();
		let waiter = tokio::spawn({
			let value = value.clone();
			async move { value.wait().await }
		});
		drop(settler);

		assert!(matches!(waiter.await.unwrap(), Err(Error::ConstructionLost)));
		assert!(matches!(value.peek(), Some(Err(Error::ConstructionLost))));
	}

	#[tokio::test]
	async fn presettled_values_answer_immediately() {
		let ready = PendingValue::ready(5u8);
		assert_eq!(*ready.wait().await.unwrap(), 5);
		assert!(ready.is_settled());

		let failed = PendingValue::<u8>::failed(Error::ConstructionLost);
		assert_eq!(failed.state(), PendingState::Failed);
		assert!(ready.same_value(&ready.clone()));
		assert!(!ready.same_value(&PendingValue::ready(5u8)));
	}

	#[test]
	fn manual_settle_is_visible_to_peek() {
		let (settler, value) = PendingValue::reserve();
		assert!(value.peek().is_none());
		settler.settle(Ok(Arc::new("bound")));
		assert_eq!(*value.peek().unwrap().unwrap(), "bound");
	}
}
