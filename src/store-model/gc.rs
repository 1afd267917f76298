//! Garbage collector (spec module F): a single-runner, coalescing scheduler
//! that reclaims superseded version files and, for archived objects with
//! nothing left to keep, whole object folders.
//!
//! Grounded on the teacher's resync-style background worker shape (a
//! `Notify`-driven loop draining a work queue, one item at a time, with
//! best-effort per-item error handling) as seen in `BlockManager`'s resync
//! loop, adapted from a priority queue over blocks to the spec's two-set
//! (`scheduled`/`wip`) swap so that objects scheduled mid-pass are not
//! picked up again until the next epoch.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};

use store_fs::folder::ObjFolders;
use store_util::obj_id::ObjId;

use crate::status::{ObjStatus, VersionBaseMap};

/// Implemented by the object cache so the collector can evict an entry once
/// its folder has been deleted entirely.
pub trait ObjCacheEvictor: Send + Sync {
	fn evict_cached<'a>(&'a self, obj_id: &'a ObjId) -> BoxFuture<'a, ()>;
}

struct GcState {
	scheduled: HashSet<ObjId>,
	wip: VecDeque<ObjId>,
	wip_set: HashSet<ObjId>,
}

struct Inner {
	folders: Arc<ObjFolders>,
	state: Mutex<GcState>,
	notify: Notify,
	evictor: Mutex<Option<Weak<dyn ObjCacheEvictor>>>,
}

/// A cheaply-cloneable handle used to schedule objects for collection.
#[derive(Clone)]
pub struct GcHandle {
	inner: Arc<Inner>,
}

pub struct GarbageCollector;

impl GarbageCollector {
	/// Spawn the collector's single background runner and return a handle
	/// to schedule work on it.
	pub fn spawn(folders: Arc<ObjFolders>) -> GcHandle {
		let inner = Arc::new(Inner {
			folders,
			state: Mutex::new(GcState {
				scheduled: HashSet::new(),
				wip: VecDeque::new(),
				wip_set: HashSet::new(),
			}),
			notify: Notify::new(),
			evictor: Mutex::new(None),
		});

		let task_inner = inner.clone();
		tokio::spawn(async move {
			loop {
				task_inner.notify.notified().await;
				drain(&task_inner).await;
			}
		});

		GcHandle { inner }
	}
}

impl GcHandle {
	/// Register the cache that should be notified when an object's folder
	/// is deleted entirely.
	pub async fn set_evictor(&self, evictor: Weak<dyn ObjCacheEvictor>) {
		*self.inner.evictor.lock().await = Some(evictor);
	}

	/// Add `obj_id` to the scheduled set and wake the runner if idle.
	/// Calls for an object already pending in this epoch (scheduled or
	/// currently in `wip`) are coalesced into a no-op.
	pub async fn schedule(&self, obj_id: ObjId) {
		let mut st = self.inner.state.lock().await;
		if st.wip_set.contains(&obj_id) || st.scheduled.contains(&obj_id) {
			return;
		}
		st.scheduled.insert(obj_id);
		drop(st);
		self.inner.notify.notify_one();
	}

	#[cfg(test)]
	pub async fn wait_idle(&self) {
		loop {
			let st = self.inner.state.lock().await;
			if st.scheduled.is_empty() && st.wip.is_empty() {
				return;
			}
			drop(st);
			tokio::task::yield_now().await;
		}
	}
}

async fn drain(inner: &Arc<Inner>) {
	loop {
		let next = {
			let mut st = inner.state.lock().await;
			if st.wip.is_empty() {
				if st.scheduled.is_empty() {
					return;
				}
				let drained: Vec<ObjId> = st.scheduled.drain().collect();
				st.wip_set = drained.iter().cloned().collect();
				st.wip = drained.into();
			}
			st.wip.pop_front().map(|o| {
				st.wip_set.remove(&o);
				o
			})
		};

		match next {
			Some(obj_id) => process_one(inner, obj_id).await,
			None => return,
		}
	}
}

async fn process_one(inner: &Arc<Inner>, obj_id: ObjId) {
	let folder = match inner.folders.folder_for(&obj_id, false).await {
		Ok(Some(f)) => f,
		Ok(None) => return,
		Err(e) => {
			warn!("gc: could not resolve folder for object: {}", e);
			return;
		}
	};

	let status = match ObjStatus::read_from(&folder).await {
		Ok(s) => s,
		Err(e) => {
			warn!("gc: could not read status for object: {}", e);
			return;
		}
	};

	let info = status.get_non_garbage_versions(&VersionBaseMap::new());

	if status.archived && info.non_garbage_set.is_empty() {
		if let Some(evictor) = inner.evictor.lock().await.as_ref().and_then(|w| w.upgrade()) {
			evictor.evict_cached(&obj_id).await;
		}
		if let Err(e) = inner.folders.remove_folder(&obj_id).await {
			warn!("gc: could not remove empty object folder: {}", e);
		}
		return;
	}

	let mut rd = match tokio::fs::read_dir(&folder).await {
		Ok(rd) => rd,
		Err(e) => {
			warn!("gc: could not list object folder: {}", e);
			return;
		}
	};

	loop {
		let entry = match rd.next_entry().await {
			Ok(Some(e)) => e,
			Ok(None) => break,
			Err(_) => break,
		};
		let name = entry.file_name().to_string_lossy().into_owned();
		let version = match name.split('.').next().and_then(|s| s.parse::<u64>().ok()) {
			Some(v) => v,
			None => continue,
		};
		let reclaimable = !info.non_garbage_set.contains(&version)
			&& info.gc_max_ver.map(|max| version < max).unwrap_or(true);
		if reclaimable {
			if let Err(e) = tokio::fs::remove_file(entry.path()).await {
				debug!("gc: best-effort unlink failed, will retry on next schedule: {}", e);
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use store_fs::folder::ObjFoldersConfig;
	use store_fs::version_file::VersionFile;

	fn folders(dir: &std::path::Path) -> Arc<ObjFolders> {
		Arc::new(ObjFolders::new(
			dir.to_path_buf(),
			ObjFoldersConfig {
				num_of_splits: 2,
				chars_in_split: 2,
				generations: Vec::new(),
			},
		))
	}

	async fn write_version(folder: &std::path::Path, v: u64, data: &[u8]) {
		let vf = VersionFile::create_new(folder.join(format!("{}.v", v))).await.unwrap();
		vf.save_header(b"h", false).await.unwrap();
		vf.set_segs_layout(None, vec![(0, Some(data.len() as u64), None)], false)
			.await
			.unwrap();
		vf.save_segs(data, 0, None, true).await.unwrap();
	}

	#[tokio::test]
	async fn removes_superseded_versions() {
		let dir = tempfile::tempdir().unwrap();
		let folders = folders(dir.path());
		let obj_id: ObjId = Some("abcdefgh".to_string());
		let folder = folders.folder_for(&obj_id, true).await.unwrap().unwrap();

		for v in 1..=3u64 {
			write_version(&folder, v, b"x").await;
		}
		let mut status = ObjStatus::make_new(None);
		status.current_version = Some(3);
		status.archived_versions.clear();
		status.save_to(&folder).await.unwrap();

		let gc = GarbageCollector::spawn(folders);
		gc.schedule(obj_id.clone()).await;
		gc.wait_idle().await;
		tokio::task::yield_now().await;

		assert!(!folder.join("1.v").exists());
		assert!(!folder.join("2.v").exists());
		assert!(folder.join("3.v").exists());
	}

	#[tokio::test]
	async fn removes_archived_empty_object_folder() {
		let dir = tempfile::tempdir().unwrap();
		let folders = folders(dir.path());
		let obj_id: ObjId = Some("ffffffff".to_string());
		let folder = folders.folder_for(&obj_id, true).await.unwrap().unwrap();

		let mut status = ObjStatus::make_new(None);
		status.current_version = None;
		status.archived = true;
		status.save_to(&folder).await.unwrap();

		let gc = GarbageCollector::spawn(folders);
		gc.schedule(obj_id).await;
		gc.wait_idle().await;
		tokio::task::yield_now().await;

		assert!(!folder.exists());
	}
}
