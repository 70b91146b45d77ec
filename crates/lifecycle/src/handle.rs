use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide source of handle identities.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0);

/// Identity token attached to a [`Handle`].
///
/// Two ids are equal only if they were minted by the same [`Handle::new`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
	fn mint() -> Self {
		Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
	}

	/// Returns the raw token value.
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for HandleId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "h{}", self.0)
	}
}

/// Opaque identity for one logical client instance.
///
/// Handles compare by identity: clones share the identity of their original, while two
/// separately created handles are never equal, whatever their labels.
#[derive(Debug, Clone)]
pub struct Handle {
	id: HandleId,
	label: Option<Arc<str>>,
}

impl Handle {
	/// Creates a handle with a fresh identity.
	pub fn new() -> Self {
		Self {
			id: HandleId::mint(),
			label: None,
		}
	}

	/// Creates a handle with a fresh identity and a label for log output.
	pub fn named(label: impl Into<Arc<str>>) -> Self {
		Self {
			id: HandleId::mint(),
			label: Some(label.into()),
		}
	}

	/// Returns the identity token.
	pub const fn id(&self) -> HandleId {
		self.id
	}

	/// Returns the label, if one was given.
	pub fn label(&self) -> Option<&str> {
		self.label.as_deref()
	}
}

impl Default for Handle {
	fn default() -> Self {
		Self::new()
	}
}

impl PartialEq for Handle {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for Handle {}

impl std::hash::Hash for Handle {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Display for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.label {
			Some(label) => write!(f, "{}({label})", self.id),
			None => fmt::Display::fmt(&self.id, f),
		}
	}
}
