//! Sharded object folder allocator (spec module C): maps an object id to a
//! leaf directory under an access bucket, with optional generational
//! rotation to colder buckets. Operations are serialized per first shard
//! section so unrelated objects never contend.
//!
//! Grounded on `BlockManager`'s own notion of a primary/secondary data
//! directory pair and its per-block-path resolution, generalized here to
//! an arbitrary number of generations and an explicit per-shard lock table
//! instead of a single global mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use store_util::error::{Error, FileError, MaskedPath};
use store_util::obj_id::{split_shards, ObjId, ROOT_SECTION};

const ACCESS_BUCKET: &str = "objs";
const GENERATIONS_DIR: &str = "generations";

/// On-disk config record (`obj-folders-cfg.json`, spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjFoldersConfig {
	#[serde(rename = "numOfSplits")]
	pub num_of_splits: usize,
	#[serde(rename = "charsInSplit")]
	pub chars_in_split: usize,
	#[serde(default, rename = "generations")]
	pub generations: Vec<GenerationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
	pub period: u64,
	#[serde(default, rename = "lastDone")]
	pub last_done: u64,
}

/// Per-first-shard lock table, so operations on objects with different
/// leading shard sections never block each other.
#[derive(Default)]
struct ShardLocks {
	locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ShardLocks {
	async fn lock_for(&self, first_shard: &str) -> Arc<Mutex<()>> {
		let mut map = self.locks.lock().await;
		map.entry(first_shard.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone()
	}
}

/// Sharded object folder allocator for one namespace's store directory.
pub struct ObjFolders {
	root: PathBuf,
	num_of_splits: usize,
	chars_in_split: usize,
	generations: Vec<GenerationRecord>,
	shard_locks: ShardLocks,
}

impl ObjFolders {
	pub fn new(root: PathBuf, cfg: ObjFoldersConfig) -> Self {
		Self {
			root,
			num_of_splits: cfg.num_of_splits,
			chars_in_split: cfg.chars_in_split,
			generations: cfg.generations,
			shard_locks: ShardLocks::default(),
		}
	}

	fn access_bucket(&self) -> PathBuf {
		self.root.join(ACCESS_BUCKET)
	}

	fn generation_bucket(&self, k: usize) -> PathBuf {
		self.root.join(GENERATIONS_DIR).join(k.to_string())
	}

	fn shard_sections(&self, obj_id: &ObjId) -> Vec<String> {
		match obj_id {
			None => vec![ROOT_SECTION.to_string()],
			Some(id) => split_shards(id, self.num_of_splits, self.chars_in_split),
		}
	}

	fn leaf_path(bucket: &Path, sections: &[String]) -> PathBuf {
		let mut p = bucket.to_path_buf();
		for s in sections {
			p.push(s);
		}
		p
	}

	fn first_shard<'a>(&self, sections: &'a [String]) -> &'a str {
		&sections[0]
	}

	/// Resolve (and optionally create) the folder for `obj_id`. Searches the
	/// access bucket first, then colder buckets in order; a cold hit is
	/// promoted into the access bucket before returning.
	pub async fn folder_for(&self, obj_id: &ObjId, create_if_missing: bool) -> Result<Option<PathBuf>, Error> {
		let sections = self.shard_sections(obj_id);
		let first = self.first_shard(&sections).to_string();
		let lock = self.shard_locks.lock_for(&first).await;
		let _guard = lock.lock().await;

		let access_leaf = Self::leaf_path(&self.access_bucket(), &sections);
		if fs::metadata(&access_leaf).await.is_ok() {
			return Ok(Some(access_leaf));
		}

		for k in 0..self.generations.len() {
			let cold_leaf = Self::leaf_path(&self.generation_bucket(k), &sections);
			if fs::metadata(&cold_leaf).await.is_ok() {
				self.promote(&cold_leaf, &access_leaf, &sections, &self.generation_bucket(k))
					.await?;
				return Ok(Some(access_leaf));
			}
		}

		if !create_if_missing {
			return Ok(None);
		}

		self.create_exclusive(&access_leaf).await?;
		Ok(Some(access_leaf))
	}

	async fn create_exclusive(&self, leaf: &Path) -> Result<(), Error> {
		if let Some(parent) = leaf.parent() {
			fs::create_dir_all(parent).await?;
		}
		match fs::create_dir(leaf).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
				Err(Error::File(FileError::AlreadyExists(MaskedPath::new(leaf, &self.root))))
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Atomically move an object's leaf folder from a cold bucket into the
	/// access bucket, creating missing intermediate shards at the
	/// destination and removing newly-empty ones at the source.
	async fn promote(
		&self,
		from_leaf: &Path,
		to_leaf: &Path,
		sections: &[String],
		from_bucket: &Path,
	) -> Result<(), Error> {
		if let Some(parent) = to_leaf.parent() {
			fs::create_dir_all(parent).await?;
		}
		fs::rename(from_leaf, to_leaf).await?;
		self.prune_empty_intermediates(from_bucket, sections).await?;
		Ok(())
	}

	/// Remove an object's folder entirely (from whichever bucket currently
	/// holds it) and prune newly-empty intermediate shards.
	pub async fn remove_folder(&self, obj_id: &ObjId) -> Result<(), Error> {
		let sections = self.shard_sections(obj_id);
		let first = self.first_shard(&sections).to_string();
		let lock = self.shard_locks.lock_for(&first).await;
		let _guard = lock.lock().await;

		let access_leaf = Self::leaf_path(&self.access_bucket(), &sections);
		if fs::metadata(&access_leaf).await.is_ok() {
			fs::remove_dir_all(&access_leaf).await?;
			self.prune_empty_intermediates(&self.access_bucket(), &sections).await?;
			return Ok(());
		}

		for k in 0..self.generations.len() {
			let bucket = self.generation_bucket(k);
			let cold_leaf = Self::leaf_path(&bucket, &sections);
			if fs::metadata(&cold_leaf).await.is_ok() {
				fs::remove_dir_all(&cold_leaf).await?;
				self.prune_empty_intermediates(&bucket, &sections).await?;
				return Ok(());
			}
		}

		Err(Error::File(FileError::NotFound(MaskedPath::new(&access_leaf, &self.root))))
	}

	async fn prune_empty_intermediates(&self, bucket: &Path, sections: &[String]) -> Result<(), Error> {
		// Walk upward from the parent of the leaf, removing directories that
		// became empty, stopping at the bucket root or the first non-empty
		// one.
		let mut current = Self::leaf_path(bucket, &sections[..sections.len() - 1]);
		while current.starts_with(bucket) && current != bucket {
			let mut entries = match fs::read_dir(&current).await {
				Ok(e) => e,
				Err(_) => break,
			};
			if entries.next_entry().await?.is_some() {
				break;
			}
			fs::remove_dir(&current).await?;
			match current.parent() {
				Some(p) => current = p.to_path_buf(),
				None => break,
			}
		}
		Ok(())
	}

	/// List `(path, obj_id)` pairs for every leaf folder in the access
	/// bucket.
	pub async fn list_recent(&self) -> Result<Vec<(PathBuf, ObjId)>, Error> {
		let mut out = Vec::new();
		self.walk_leaves(&self.access_bucket(), Vec::new(), 0, &mut out)
			.await?;
		Ok(out)
	}

	fn walk_leaves<'a>(
		&'a self,
		dir: &'a Path,
		sections_so_far: Vec<String>,
		depth: usize,
		out: &'a mut Vec<(PathBuf, ObjId)>,
	) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
		Box::pin(async move {
			let mut rd = match fs::read_dir(dir).await {
				Ok(rd) => rd,
				Err(_) => return Ok(()),
			};
			while let Some(entry) = rd.next_entry().await? {
				if !entry.file_type().await?.is_dir() {
					continue;
				}
				let name = entry.file_name().to_string_lossy().into_owned();
				let mut sections = sections_so_far.clone();
				sections.push(name.clone());

				if sections == [ROOT_SECTION] || sections.len() >= self.num_of_splits + 1 {
					let obj_id = if sections == [ROOT_SECTION] {
						None
					} else {
						Some(sections.concat())
					};
					out.push((entry.path(), obj_id));
				} else {
					self.walk_leaves(&entry.path(), sections, depth + 1, out).await?;
				}
			}
			Ok(())
		})
	}

	/// Periodic rotation: for each generation `k` whose period has elapsed
	/// since `last_done`, move eligible objects from bucket `k-1` (or the
	/// access bucket for `k==0`) into bucket `k`. `can_move` decides per
	/// object.
	pub async fn rotate<F>(&mut self, now_secs: u64, mut can_move: F) -> Result<(), Error>
	where
		F: FnMut(&ObjId, &Path) -> bool,
	{
		for k in 0..self.generations.len() {
			let due = now_secs.saturating_sub(self.generations[k].last_done) >= self.generations[k].period;
			if !due {
				continue;
			}
			let source_bucket = if k == 0 {
				self.access_bucket()
			} else {
				self.generation_bucket(k - 1)
			};
			let dest_bucket = self.generation_bucket(k);

			let mut candidates = Vec::new();
			self.walk_leaves(&source_bucket, Vec::new(), 0, &mut candidates).await?;

			for (path, obj_id) in candidates {
				if !can_move(&obj_id, &path) {
					continue;
				}
				let sections = self.shard_sections(&obj_id);
				let first = self.first_shard(&sections).to_string();
				let lock = self.shard_locks.lock_for(&first).await;
				let _guard = lock.lock().await;

				let dest_leaf = Self::leaf_path(&dest_bucket, &sections);
				if let Some(parent) = dest_leaf.parent() {
					fs::create_dir_all(parent).await?;
				}
				fs::rename(&path, &dest_leaf).await?;
				self.prune_empty_intermediates(&source_bucket, &sections).await?;
			}

			self.generations[k].last_done = now_secs;
		}
		Ok(())
	}

	pub fn generations(&self) -> &[GenerationRecord] {
		&self.generations
	}

	/// List `(path, obj_id)` pairs for every leaf folder in cold bucket `k`.
	pub async fn list_cold(&self, k: usize) -> Result<Vec<(PathBuf, ObjId)>, Error> {
		let mut out = Vec::new();
		self.walk_leaves(&self.generation_bucket(k), Vec::new(), 0, &mut out)
			.await?;
		Ok(out)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn cfg() -> ObjFoldersConfig {
		ObjFoldersConfig {
			num_of_splits: 2,
			chars_in_split: 2,
			generations: Vec::new(),
		}
	}

	#[tokio::test]
	async fn creates_and_finds_leaf() {
		let dir = tempfile::tempdir().unwrap();
		let folders = ObjFolders::new(dir.path().to_path_buf(), cfg());

		let id: ObjId = Some("abcdefgh".to_string());
		let created = folders.folder_for(&id, true).await.unwrap().unwrap();
		assert!(created.ends_with("efgh"));

		let found = folders.folder_for(&id, false).await.unwrap();
		assert_eq!(found, Some(created));
	}

	#[tokio::test]
	async fn root_object_uses_sentinel() {
		let dir = tempfile::tempdir().unwrap();
		let folders = ObjFolders::new(dir.path().to_path_buf(), cfg());
		let path = folders.folder_for(&None, true).await.unwrap().unwrap();
		assert!(path.ends_with(ROOT_SECTION));
	}

	#[tokio::test]
	async fn remove_prunes_empty_intermediates() {
		let dir = tempfile::tempdir().unwrap();
		let folders = ObjFolders::new(dir.path().to_path_buf(), cfg());
		let id: ObjId = Some("abcdefgh".to_string());
		folders.folder_for(&id, true).await.unwrap();
		folders.remove_folder(&id).await.unwrap();

		let ab_shard = dir.path().join(ACCESS_BUCKET).join("ab");
		assert!(!ab_shard.exists());
	}

	#[tokio::test]
	async fn promotes_from_cold_bucket() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = cfg();
		config.generations.push(GenerationRecord { period: 60, last_done: 0 });
		let folders = ObjFolders::new(dir.path().to_path_buf(), config);

		let id: ObjId = Some("ffffffff".to_string());
		let cold_leaf = cold_leaf_path(&folders, 0, &id);
		tokio::fs::create_dir_all(&cold_leaf).await.unwrap();

		let found = folders.folder_for(&id, false).await.unwrap().unwrap();
		assert!(found.starts_with(dir.path().join(ACCESS_BUCKET)));
		assert!(!cold_leaf.exists());
	}

	fn cold_leaf_path(folders: &ObjFolders, gen: usize, id: &ObjId) -> PathBuf {
		let sections = folders.shard_sections(id);
		ObjFolders::leaf_path(&folders.generation_bucket(gen), &sections)
	}
}
