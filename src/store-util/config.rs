//! Configuration surface (spec §6): parsed once at startup by the CLI
//! collaborator and handed around as `&Config`. Mirrors the plain,
//! flat-struct-loaded-from-TOML shape this codebase uses for its own
//! `Config` type.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One cold-storage generation: objects idle for `period_secs` are
/// eligible to rotate into this bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
	pub period_secs: u64,
	#[serde(default)]
	pub last_done_secs: u64,
}

/// Top-level configuration for a namespace's local object store and its
/// IPC-facing CLI process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	/// Directory holding small persisted records (none today beyond what
	/// lives alongside the store itself; kept for parity with deployments
	/// that split metadata and bulk data across different mounts).
	pub metadata_dir: PathBuf,

	/// Root directory of this namespace's object store.
	pub store_dir: PathBuf,

	/// Number of shard splits in the object folder tree (spec §3).
	#[serde(default = "default_num_of_splits")]
	pub num_of_splits: usize,

	/// Characters per shard split.
	#[serde(default = "default_chars_in_split")]
	pub chars_in_split: usize,

	/// Byte length of the nonce object ids are derived from, used to bound
	/// id length per spec §3.
	#[serde(default = "default_nonce_byte_length")]
	pub nonce_byte_length: usize,

	/// Optional generational cold-storage rotation periods.
	#[serde(default)]
	pub generations: Vec<GenerationConfig>,

	/// How long an idle `ObjFiles` cache entry survives before eviction.
	#[serde(default = "default_objfiles_cache_ttl_secs")]
	pub objfiles_cache_ttl_secs: u64,

	/// Idle delay before the GC's single background runner goes to sleep
	/// after draining both its scheduled and work-in-progress sets.
	#[serde(default = "default_gc_idle_secs")]
	pub gc_idle_secs: u64,
}

fn default_num_of_splits() -> usize {
	2
}
fn default_chars_in_split() -> usize {
	2
}
fn default_nonce_byte_length() -> usize {
	24
}
fn default_objfiles_cache_ttl_secs() -> u64 {
	60
}
fn default_gc_idle_secs() -> u64 {
	1
}

impl Config {
	pub fn read_from_file(path: &std::path::Path) -> Result<Self, Error> {
		let data = std::fs::read_to_string(path)
			.map_err(|e| Error::Message(format!("cannot read config file {}: {}", path.display(), e)))?;
		toml::from_str(&data).map_err(|e| Error::Message(format!("invalid config file: {}", e)))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn parses_minimal_toml() {
		let toml_str = r#"
			metadata_dir = "/tmp/meta"
			store_dir = "/tmp/store"
		"#;
		let cfg: Config = toml::from_str(toml_str).unwrap();
		assert_eq!(cfg.num_of_splits, 2);
		assert_eq!(cfg.chars_in_split, 2);
		assert!(cfg.generations.is_empty());
	}
}
