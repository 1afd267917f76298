//! On-demand consistency check, grounded on `garage/repair/online.rs`'s
//! pattern of a read-only scan that reports anomalies without fixing them
//! automatically. Here: walk every object folder in every bucket, open
//! each version file, and flag anything that fails to parse or otherwise
//! violates the version-file invariants.
//!
//! This is a diagnostic supplement with no counterpart operation in the
//! component design; nothing in the data path depends on it.

use std::path::PathBuf;

use store_util::error::Error;
use store_util::obj_id::ObjId;

use crate::folder::ObjFolders;
use crate::version_file::VersionFile;

#[derive(Debug, Clone)]
pub struct ObjFolderIssue {
	pub obj_id: ObjId,
	pub path: PathBuf,
	pub problem: String,
}

#[derive(Debug, Clone, Default)]
pub struct RepairReport {
	pub folders_scanned: usize,
	pub version_files_scanned: usize,
	pub issues: Vec<ObjFolderIssue>,
}

/// Walk the access bucket and every cold bucket, opening each `*.v`
/// version file found in each object's leaf folder and recording any that
/// fail to parse.
pub async fn check_consistency(folders: &ObjFolders) -> Result<RepairReport, Error> {
	let mut report = RepairReport::default();

	let mut all = folders.list_recent().await?;
	for k in 0..folders.generations().len() {
		all.extend(folders.list_cold(k).await?);
	}

	for (leaf, obj_id) in all {
		report.folders_scanned += 1;
		let mut rd = match tokio::fs::read_dir(&leaf).await {
			Ok(rd) => rd,
			Err(e) => {
				report.issues.push(ObjFolderIssue {
					obj_id: obj_id.clone(),
					path: leaf.clone(),
					problem: format!("cannot read folder: {}", e),
				});
				continue;
			}
		};

		while let Some(entry) = rd.next_entry().await.map_err(Error::from)? {
			let name = entry.file_name().to_string_lossy().into_owned();
			if !name.contains('.') {
				continue;
			}
			report.version_files_scanned += 1;
			let path = entry.path();
			if let Err(e) = VersionFile::open_existing(path.clone()).await {
				report.issues.push(ObjFolderIssue {
					obj_id: obj_id.clone(),
					path,
					problem: e.to_string(),
				});
			}
		}
	}

	Ok(report)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::folder::ObjFoldersConfig;

	#[tokio::test]
	async fn clean_store_has_no_issues() {
		let dir = tempfile::tempdir().unwrap();
		let folders = ObjFolders::new(
			dir.path().to_path_buf(),
			ObjFoldersConfig {
				num_of_splits: 2,
				chars_in_split: 2,
				generations: Vec::new(),
			},
		);
		let id: ObjId = Some("abcdefgh".to_string());
		let leaf = folders.folder_for(&id, true).await.unwrap().unwrap();
		let vf = VersionFile::create_new(leaf.join("1.v")).await.unwrap();
		vf.save_header(b"h", false).await.unwrap();
		vf.set_segs_layout(None, vec![(0, Some(1), None)], false)
			.await
			.unwrap();
		vf.save_segs(b"x", 0, None, true).await.unwrap();
		drop(vf);

		let report = check_consistency(&folders).await.unwrap();
		assert!(report.issues.is_empty());
		assert_eq!(report.version_files_scanned, 1);
	}

	#[tokio::test]
	async fn flags_unparseable_version_file() {
		let dir = tempfile::tempdir().unwrap();
		let folders = ObjFolders::new(
			dir.path().to_path_buf(),
			ObjFoldersConfig {
				num_of_splits: 2,
				chars_in_split: 2,
				generations: Vec::new(),
			},
		);
		let id: ObjId = Some("abcdefgh".to_string());
		let leaf = folders.folder_for(&id, true).await.unwrap().unwrap();
		tokio::fs::write(leaf.join("1.v"), b"not-a-version-file").await.unwrap();

		let report = check_consistency(&folders).await.unwrap();
		assert_eq!(report.issues.len(), 1);
	}
}
