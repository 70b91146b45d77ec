//! Task spawning for construction futures.
//!
//! Constructions must keep running even when every observer goes away, so they are
//! detached onto the runtime rather than polled by their callers.

use std::future::Future;
use std::sync::OnceLock;

use tokio::task::JoinHandle;

/// Execution class recorded on every construction spawn.
///
/// The class labels trace events only; both classes share one runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// A caller is waiting on the result right now.
	#[default]
	Interactive,
	/// Warm-up work nobody is blocked on yet.
	Background,
}

impl TaskClass {
	/// Returns the name used in log fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Interactive => "interactive",
			Self::Background => "background",
		}
	}
}

fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	let runtime = GLOBAL_RT.get_or_init(|| {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name("tether-construct")
			.build()
			.expect("failed to build tether global tokio runtime")
	});
	runtime.handle().clone()
}

/// Spawns `fut` detached on the ambient runtime, or on a shared fallback runtime when
/// called from outside one.
pub fn spawn<F>(class: TaskClass, label: &'static str, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(task_class = class.as_str(), dependency = label, "construction.spawn");
	runtime_handle().spawn(fut)
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&'static str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
