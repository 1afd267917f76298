//! JSON-file persister, grounded on this codebase's habit of keeping small
//! pieces of durable state (cluster layout, peer lists, and here: object
//! status records, the upsync queue, the object-folder config record) as a
//! single JSON file written atomically via a temp file + rename.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::Error;

/// A durable JSON blob at `dir/name`, written atomically.
pub struct Persister<T> {
	path: PathBuf,
	_marker: std::marker::PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Persister<T> {
	pub fn new(dir: &Path, name: &str) -> Self {
		Self {
			path: dir.join(name),
			_marker: std::marker::PhantomData,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Synchronous load, used at startup before the async runtime is driving
	/// I/O (mirrors the teacher's blocking `Persister::load`).
	pub fn load(&self) -> Result<T, Error> {
		let data = std::fs::read(&self.path)?;
		Ok(serde_json::from_slice(&data)?)
	}

	pub async fn load_async(&self) -> Result<T, Error> {
		let data = fs::read(&self.path).await?;
		Ok(serde_json::from_slice(&data)?)
	}

	/// Write `value` to disk, replacing the previous contents atomically:
	/// write to a sibling `.tmp` file, fsync it, then rename over the
	/// original path.
	pub async fn save_async(&self, value: &T) -> Result<(), Error> {
		let data = serde_json::to_vec_pretty(value)?;
		let mut tmp_path = self.path.clone();
		let tmp_name = format!(
			"{}.tmp",
			tmp_path
				.file_name()
				.and_then(|n| n.to_str())
				.unwrap_or("persist")
		);
		tmp_path.set_file_name(tmp_name);

		{
			use tokio::io::AsyncWriteExt;
			let mut f = fs::File::create(&tmp_path).await?;
			f.write_all(&data).await?;
			f.sync_all().await?;
		}
		fs::rename(&tmp_path, &self.path).await?;
		Ok(())
	}

	/// Remove the persisted file, if present. Used once both halves of the
	/// upsync queue are empty.
	pub async fn remove(&self) -> Result<(), Error> {
		match fs::remove_file(&self.path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	pub async fn exists(&self) -> bool {
		fs::metadata(&self.path).await.is_ok()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use serde::Deserialize;

	#[derive(Serialize, Deserialize, PartialEq, Debug)]
	struct Demo {
		a: u32,
		b: String,
	}

	#[tokio::test]
	async fn roundtrip() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let p: Persister<Demo> = Persister::new(dir.as_path(), "demo.json");
		assert!(!p.exists().await);

		let v = Demo {
			a: 42,
			b: "hi".into(),
		};
		p.save_async(&v).await.unwrap();
		assert!(p.exists().await);

		let loaded = p.load_async().await.unwrap();
		assert_eq!(loaded, v);

		p.remove().await.unwrap();
		assert!(!p.exists().await);
	}
}
