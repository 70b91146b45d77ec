//! Session configuration.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tether_lifecycle::TaskClass;

/// Task class constructions are spawned under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstructionClass {
	/// See [`TaskClass::Interactive`].
	#[default]
	Interactive,
	/// See [`TaskClass::Background`].
	Background,
}

impl From<ConstructionClass> for TaskClass {
	fn from(class: ConstructionClass) -> Self {
		match class {
			ConstructionClass::Interactive => Self::Interactive,
			ConstructionClass::Background => Self::Background,
		}
	}
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
	/// Task class for dependency constructions.
	///
	/// Every class runs on the same runtime; the class is recorded on the
	/// `construction.spawn` and `acquire.construct` trace events and does not change
	/// scheduling.
	#[serde(default)]
	pub construction_class: ConstructionClass,
	/// Bound on each dependency termination during session teardown, in seconds.
	/// Zero disables the bound.
	#[serde(default = "default_terminate_timeout")]
	pub terminate_timeout_secs: u64,
}

/// Returns the default teardown bound in seconds.
fn default_terminate_timeout() -> u64 {
	30
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			construction_class: ConstructionClass::default(),
			terminate_timeout_secs: default_terminate_timeout(),
		}
	}
}

impl SessionConfig {
	/// Parses a configuration from TOML text.
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(text)?)
	}

	/// Reads and parses a TOML configuration file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml_str(&text)
	}

	/// Returns the teardown bound, or `None` when disabled.
	pub fn terminate_timeout(&self) -> Option<Duration> {
		(self.terminate_timeout_secs != 0).then(|| Duration::from_secs(self.terminate_timeout_secs))
	}
}

/// Errors loading a [`SessionConfig`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
	/// The file could not be read.
	#[error("failed to read {}: {source}", .path.display())]
	Io {
		/// File that was being read.
		path: PathBuf,
		/// Underlying error.
		#[source]
		source: io::Error,
	},
	/// The TOML was malformed or had unexpected fields.
	#[error("invalid session config: {0}")]
	Parse(#[from] toml::de::Error),
}
