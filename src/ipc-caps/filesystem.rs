//! Filesystem capability (spec module L): list, stat, create, open, and
//! delete objects inside one object-files namespace. One [`Filesystem`]
//! wraps the `store_model`/`store_fs` pair that already does this work for
//! in-process callers; this module only adds the IPC request/reply shapes
//! and the droppable-reference bookkeeping for `openFile`.
//!
//! Grounded on `store_fs::folder::ObjFolders::list_recent` for listing and
//! `store_model::obj_files::ObjFiles::find`/`save_first_version` for the
//! rest; `openFile` reuses [`crate::file::expose_file`] the same way the
//! teacher's bucket handlers hand off to its object-key handlers.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ipc_core::client::{ClientCore, PeerRef};
use ipc_core::service::ServiceCore;
use store_fs::folder::ObjFolders;
use store_model::obj_files::ObjFiles;
use store_util::error::Error;
use store_util::obj_id::new_obj_id;

use crate::codec::{call_json, call_json_no_args, json_method, json_method_no_args};
use crate::file::expose_file;

/// Byte length of the nonce backing a freshly minted object id (spec §3).
const NEW_OBJ_ID_NONCE_LEN: usize = 24;

#[derive(Serialize, Deserialize)]
struct ListRep {
	#[serde(rename = "objIds")]
	obj_ids: Vec<String>,
}
#[derive(Serialize, Deserialize)]
struct ObjIdReq {
	#[serde(rename = "objId")]
	obj_id: String,
}
#[derive(Serialize, Deserialize)]
struct StatRep {
	#[serde(rename = "currentVersion")]
	current_version: Option<u64>,
	#[serde(rename = "archivedVersions")]
	archived_versions: Vec<u64>,
}
#[derive(Serialize, Deserialize)]
struct PathRep {
	path: Vec<String>,
}
#[derive(Serialize, Deserialize)]
struct CreateRep {
	#[serde(rename = "objId")]
	obj_id: String,
	path: Vec<String>,
}

/// Register a filesystem object under `path`, backed by `files`/`folders`.
/// `files`/`folders` are the same pair a [`super::storage::StorageEntryPoint`]
/// constructs per app namespace.
pub async fn expose_filesystem(service: &Arc<ServiceCore>, path: Vec<String>, files: Arc<ObjFiles>, folders: Arc<ObjFolders>) {
	let mut methods: StdHashMap<String, ipc_core::service::Method> = StdHashMap::new();

	let f = folders.clone();
	methods.insert(
		"listObjects".to_string(),
		json_method_no_args(move || {
			let f = f.clone();
			async move {
				let entries = f.list_recent().await?;
				let obj_ids = entries.into_iter().filter_map(|(_, id)| id).collect();
				Ok(ListRep { obj_ids })
			}
		}),
	);

	let fl = files.clone();
	methods.insert(
		"stat".to_string(),
		json_method(move |req: ObjIdReq| {
			let fl = fl.clone();
			async move {
				let obj_id = Some(req.obj_id);
				let local = fl.find(&obj_id).await?.ok_or_else(|| Error::message("no such object"))?;
				let status = local.status().await;
				Ok(StatRep {
					current_version: status.current_version,
					archived_versions: status.archived_versions.into_iter().collect(),
				})
			}
		}),
	);

	let (fl, p, svc) = (files.clone(), path.clone(), service.clone());
	methods.insert(
		"openFile".to_string(),
		json_method(move |req: ObjIdReq| {
			let (fl, p, svc) = (fl.clone(), p.clone(), svc.clone());
			async move {
				let obj_id = Some(req.obj_id.clone());
				let local = fl.find(&obj_id).await?.ok_or_else(|| Error::message("no such object"))?;
				let file_path = {
					let mut fp = p.clone();
					fp.push("file".to_string());
					fp.push(req.obj_id);
					fp
				};
				if !svc.get_original_obj(&file_path).await {
					expose_file(&svc, file_path.clone(), local).await;
				}
				Ok(PathRep { path: file_path })
			}
		}),
	);

	let (fl, p, svc) = (files.clone(), path.clone(), service.clone());
	methods.insert(
		"createObject".to_string(),
		json_method_no_args(move || {
			let (fl, p, svc) = (fl.clone(), p.clone(), svc.clone());
			async move {
				let id = new_obj_id(NEW_OBJ_ID_NONCE_LEN);
				let local = fl.save_first_version(Some(id.clone()), &[], &[]).await?;
				let file_path = {
					let mut fp = p.clone();
					fp.push("file".to_string());
					fp.push(id.clone());
					fp
				};
				expose_file(&svc, file_path.clone(), local).await;
				Ok(CreateRep { obj_id: id, path: file_path })
			}
		}),
	);

	let fd = folders.clone();
	methods.insert(
		"deleteObject".to_string(),
		json_method(move |req: ObjIdReq| {
			let fd = fd.clone();
			async move { fd.remove_folder(&Some(req.obj_id)).await }
		}),
	);

	service.expose_droppable_service(path, methods, None).await;
}

/// Caller-side proxy for the filesystem capability.
pub struct FilesystemCaller {
	client: Arc<ClientCore>,
	path: Vec<String>,
}

impl FilesystemCaller {
	pub fn new(client: Arc<ClientCore>, path: Vec<String>) -> Self {
		Self { client, path }
	}

	fn method(&self, name: &str) -> Vec<String> {
		let mut p = self.path.clone();
		p.push(name.to_string());
		p
	}

	pub async fn list_objects(&self) -> Result<Vec<String>, Error> {
		let rep: ListRep = call_json_no_args(&self.client, self.method("listObjects")).await?;
		Ok(rep.obj_ids)
	}

	pub async fn stat(&self, obj_id: &str) -> Result<(Option<u64>, Vec<u64>), Error> {
		let rep: StatRep = call_json(
			&self.client,
			self.method("stat"),
			&ObjIdReq { obj_id: obj_id.to_string() },
		)
		.await?;
		Ok((rep.current_version, rep.archived_versions))
	}

	/// Open a droppable `File` proxy for `obj_id`. See [`crate::file::FileCaller`].
	pub async fn open_file(&self, obj_id: &str) -> Result<(Vec<String>, PeerRef), Error> {
		let rep: PathRep = call_json(
			&self.client,
			self.method("openFile"),
			&ObjIdReq { obj_id: obj_id.to_string() },
		)
		.await?;
		let (_ref_id, peer_ref) = self.client.register_client_drop(rep.path.clone()).await;
		Ok((rep.path, peer_ref))
	}

	/// Create a new, empty object and open a droppable `File` proxy for it.
	pub async fn create_object(&self) -> Result<(String, Vec<String>, PeerRef), Error> {
		let rep: CreateRep = call_json_no_args(&self.client, self.method("createObject")).await?;
		let (_ref_id, peer_ref) = self.client.register_client_drop(rep.path.clone()).await;
		Ok((rep.obj_id, rep.path, peer_ref))
	}

	pub async fn delete_object(&self, obj_id: &str) -> Result<(), Error> {
		call_json(
			&self.client,
			self.method("deleteObject"),
			&ObjIdReq { obj_id: obj_id.to_string() },
		)
		.await
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use ipc_core::connector::Connector;
	use store_fs::folder::ObjFoldersConfig;
	use store_model::gc::GarbageCollector;

	async fn wire(service: Arc<ServiceCore>) -> Arc<ClientCore> {
		let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
		let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
		let client = ClientCore::new(a_tx.clone());
		let _client_conn = Connector::spawn(a_tx, b_rx, Some(client.clone()), None);
		let _service_conn = Connector::spawn(b_tx, a_rx, None, Some(service));
		client
	}

	#[tokio::test]
	async fn create_list_stat_and_open_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let folders = Arc::new(ObjFolders::new(
			dir.path().to_path_buf(),
			ObjFoldersConfig {
				num_of_splits: 2,
				chars_in_split: 2,
				generations: Vec::new(),
			},
		));
		let gc = GarbageCollector::spawn(folders.clone());
		let files = ObjFiles::new(folders.clone(), gc, 60).await;

		let service = ServiceCore::new();
		expose_filesystem(&service, vec!["fs".into()], files, folders).await;
		let client = wire(service).await;

		let caller = FilesystemCaller::new(client, vec!["fs".into()]);
		let (obj_id, path, _peer_ref) = caller.create_object().await.unwrap();
		assert_eq!(caller.list_objects().await.unwrap(), vec![obj_id.clone()]);

		let (current, archived) = caller.stat(&obj_id).await.unwrap();
		assert_eq!(current, Some(1));
		assert!(archived.is_empty());

		let (reopened_path, _ref2) = caller.open_file(&obj_id).await.unwrap();
		assert_eq!(reopened_path, path);

		caller.delete_object(&obj_id).await.unwrap();
		assert!(caller.list_objects().await.unwrap().is_empty());
	}
}
