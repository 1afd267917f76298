//! Offline consistency check (replaces the teacher's cluster repair
//! commands, which have no counterpart on a single-node local store):
//! walk every object's current version file and report any whose segment
//! layout doesn't actually cover its declared size.

use std::sync::Arc;

use store_fs::folder::ObjFolders;
use store_fs::version_file::VersionFile;
use store_util::error::Error;
use store_util::obj_id::ObjId;

pub async fn run(folders: Arc<ObjFolders>) -> Result<(), Error> {
	let entries = folders.list_recent().await?;
	let mut bad = 0usize;

	for (path, obj_id) in &entries {
		if let Err(e) = check_one(path, obj_id).await {
			warn!("object {} failed consistency check: {}", obj_id.as_deref().unwrap_or("<root>"), e);
			bad += 1;
		}
	}

	println!("checked {} object(s), {} incomplete", entries.len(), bad);
	if bad > 0 {
		return Err(Error::message(format!("{} object(s) failed the consistency check", bad)));
	}
	Ok(())
}

async fn check_one(folder: &std::path::Path, _obj_id: &ObjId) -> Result<(), Error> {
	let status = store_model::status::ObjStatus::read_from(folder).await?;
	let Some(version) = status.current_version else {
		return Ok(());
	};
	let vf = VersionFile::open_existing(folder.join(format!("{}.v", version))).await?;
	if !vf.is_complete().await {
		return Err(Error::message(format!("version {} is not complete", version)));
	}
	let layout = vf.layout_snapshot().await;
	layout.validate_coverage().map_err(Error::message)
}
