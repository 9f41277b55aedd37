//! Build metadata surfaced on the admin/config-dump endpoint.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
	pub version: &'static str,
	pub git_commit: &'static str,
	pub rust_version: &'static str,
	pub build_profile: &'static str,
}

impl BuildInfo {
	pub const fn current() -> Self {
		Self {
			version: env!("CARGO_PKG_VERSION"),
			git_commit: option_env!("GIT_COMMIT_HASH").unwrap_or("unknown"),
			rust_version: env!("CARGO_PKG_RUST_VERSION"),
			build_profile: if cfg!(debug_assertions) { "debug" } else { "release" },
		}
	}
}

impl Default for BuildInfo {
	fn default() -> Self {
		Self::current()
	}
}
