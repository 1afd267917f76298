//! Object status record (spec module D / §3): the small persisted record
//! that tracks which version of an object is current, which are archived,
//! and what the current version's base is.
//!
//! Grounded on the teacher's habit (in its table/model layer) of keeping a
//! small versioned record per entity and mutating it under a per-key lock
//! held by the caller; here persistence goes through [`store_util::persister::Persister`]
//! instead of a merkle-table, since there is no cluster to replicate to.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use store_util::error::Error;
use store_util::persister::Persister;

pub const STATUS_FILE_NAME: &str = "status.json";

/// `version -> base_of(version)` for versions whose base is already known
/// without reading their version file off disk (normally because they are
/// currently open in the [`crate::obj_files`] cache). Used to walk the
/// transitive base chain when computing the non-garbage set.
pub type VersionBaseMap = HashMap<u64, Option<u64>>;

/// Persisted per-object status record (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjStatus {
	#[serde(rename = "currentVersion")]
	pub current_version: Option<u64>,
	#[serde(rename = "baseOfCurrent")]
	pub base_of_current: Option<u64>,
	#[serde(rename = "archivedVersions")]
	pub archived_versions: BTreeSet<u64>,
	pub archived: bool,
}

/// Result of [`ObjStatus::get_non_garbage_versions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonGarbageInfo {
	/// When set, any version `>= gc_max_ver` is presumed in-progress and
	/// must not be reclaimed regardless of set membership. Status itself
	/// never sets this; callers (the object files manager, which knows
	/// about an in-flight version write) pass it down to the garbage
	/// collector alongside this record's own non-garbage set.
	pub gc_max_ver: Option<u64>,
	pub non_garbage_set: BTreeSet<u64>,
}

impl ObjStatus {
	/// A fresh status for an object whose version 1 was just written.
	pub fn make_new(base_of_current: Option<u64>) -> Self {
		ObjStatus {
			current_version: Some(1),
			base_of_current,
			archived_versions: BTreeSet::new(),
			archived: false,
		}
	}

	pub fn persister(dir: &std::path::Path) -> Persister<ObjStatus> {
		Persister::new(dir, STATUS_FILE_NAME)
	}

	pub async fn read_from(dir: &std::path::Path) -> Result<Self, Error> {
		Self::persister(dir).load_async().await
	}

	pub async fn save_to(&self, dir: &std::path::Path) -> Result<(), Error> {
		Self::persister(dir).save_async(self).await
	}

	/// Record that version `v` became current, superseding the previous
	/// current version, which is archived automatically if there was one.
	pub fn set_new_current_version(&mut self, v: u64, base_of_v: Option<u64>) {
		if let Some(prev) = self.current_version {
			self.archived_versions.insert(prev);
		}
		self.current_version = Some(v);
		self.base_of_current = base_of_v;
	}

	/// Drop the current version (the application explicitly removed it,
	/// independent of normal supersession). `open_versions` resolves the
	/// new base chain for any archived version that referenced the removed
	/// current version as its base.
	pub fn remove_current_version(&mut self, open_versions: &VersionBaseMap) {
		let removed = self.current_version.take();
		self.base_of_current = None;
		if let Some(removed) = removed {
			self.reparent_archived_bases(removed, open_versions);
		}
	}

	/// Drop one archived version. `open_versions` resolves the new base
	/// chain for any version that referenced `v` as its base.
	pub fn remove_archived_version(&mut self, v: u64, open_versions: &VersionBaseMap) {
		if self.archived_versions.remove(&v) {
			self.reparent_archived_bases(v, open_versions);
		}
	}

	/// If some other tracked version used `removed` as its base, and
	/// `removed`'s own base is known, point that version at `removed`'s
	/// base instead (keeping the non-garbage set connected after `removed`
	/// is deleted). No-op if nothing referenced it.
	fn reparent_archived_bases(&mut self, removed: u64, open_versions: &VersionBaseMap) {
		let new_base = open_versions.get(&removed).copied().flatten();
		if self.base_of_current == Some(removed) {
			self.base_of_current = new_base;
		}
	}

	/// Mark the current version archived (it remains readable but is no
	/// longer "the" current version from the application's perspective).
	pub fn archive_current(&mut self) {
		if let Some(v) = self.current_version.take() {
			self.archived_versions.insert(v);
		}
		self.archived = true;
		self.base_of_current = None;
	}

	/// Whether this status record's object should be removed entirely:
	/// not archived, no current version, no archived versions left.
	pub fn is_empty(&self) -> bool {
		!self.archived && self.current_version.is_none() && self.archived_versions.is_empty()
	}

	/// The non-garbage set: `{current_version} ∪ archived_versions ∪
	/// {base_of(current_version)}`, walked transitively through
	/// `open_versions` for as many hops as needed to reach a version with
	/// no further base (or one not present in `open_versions`, at which
	/// point the chain is assumed to bottom out there).
	pub fn get_non_garbage_versions(&self, open_versions: &VersionBaseMap) -> NonGarbageInfo {
		let mut set = self.archived_versions.clone();
		if let Some(cur) = self.current_version {
			set.insert(cur);
		}

		let mut frontier = self.base_of_current;
		let mut seen = BTreeSet::new();
		while let Some(base) = frontier {
			if !seen.insert(base) {
				break; // defend against a cyclic base chain
			}
			set.insert(base);
			frontier = open_versions.get(&base).copied().flatten();
		}

		NonGarbageInfo {
			gc_max_ver: None,
			non_garbage_set: set,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn new_object_has_version_one_current() {
		let status = ObjStatus::make_new(None);
		assert_eq!(status.current_version, Some(1));
		assert!(status.archived_versions.is_empty());
	}

	#[test]
	fn advancing_version_archives_previous() {
		let mut status = ObjStatus::make_new(None);
		status.set_new_current_version(2, Some(1));
		assert_eq!(status.current_version, Some(2));
		assert!(status.archived_versions.contains(&1));
		assert_eq!(status.base_of_current, Some(1));
	}

	#[test]
	fn non_garbage_set_walks_base_chain() {
		let mut status = ObjStatus::make_new(None);
		status.set_new_current_version(2, Some(1));
		status.set_new_current_version(3, Some(2));

		let mut open_versions = VersionBaseMap::new();
		open_versions.insert(2, Some(1));
		open_versions.insert(1, None);

		let info = status.get_non_garbage_versions(&open_versions);
		assert!(info.non_garbage_set.contains(&3));
		assert!(info.non_garbage_set.contains(&2));
		assert!(info.non_garbage_set.contains(&1));
	}

	#[test]
	fn removing_sole_version_makes_status_empty() {
		let mut status = ObjStatus::make_new(None);
		status.remove_current_version(&VersionBaseMap::new());
		assert!(status.is_empty());
	}

	#[test]
	fn archived_with_versions_is_not_empty() {
		let mut status = ObjStatus::make_new(None);
		status.archive_current();
		assert!(status.archived);
		assert!(!status.is_empty());
	}
}
