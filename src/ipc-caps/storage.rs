//! Storage entry point capability (spec module L): the one object every
//! sandboxed application starts from, exposing a [`crate::filesystem`]
//! namespace scoped to that application.
//!
//! Each app gets its own root folder under the store's data directory, so
//! two apps never see each other's objects even though they share one
//! running service process. Grounded on the teacher's per-bucket root
//! isolation (each S3 bucket is its own key namespace under one node).

use std::collections::HashMap as StdHashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ipc_core::client::ClientCore;
use ipc_core::service::ServiceCore;
use store_fs::folder::{ObjFolders, ObjFoldersConfig};
use store_model::gc::GarbageCollector;
use store_model::obj_files::ObjFiles;
use store_util::error::Error;

use crate::codec::{call_json, json_method};
use crate::filesystem::expose_filesystem;

/// How long an object-files cache entry may sit idle before eviction.
const OBJ_CACHE_IDLE_TTL_SECS: u64 = 300;

#[derive(Serialize, Deserialize)]
struct OpenReq {
	app: String,
}
#[derive(Serialize, Deserialize)]
struct PathRep {
	path: Vec<String>,
}

/// Root of the capability surface: creates (or idempotently reattaches to)
/// a per-app object-files namespace under `data_root/<app>`.
pub struct StorageEntryPoint {
	data_root: PathBuf,
	splits: (usize, usize),
}

impl StorageEntryPoint {
	pub fn new(data_root: PathBuf, num_of_splits: usize, chars_in_split: usize) -> Self {
		Self {
			data_root,
			splits: (num_of_splits, chars_in_split),
		}
	}

	async fn namespace_for(&self, app: &str) -> (Arc<ObjFiles>, Arc<ObjFolders>) {
		let root = self.data_root.join(app);
		let folders = Arc::new(ObjFolders::new(
			root,
			ObjFoldersConfig {
				num_of_splits: self.splits.0,
				chars_in_split: self.splits.1,
				generations: Vec::new(),
			},
		));
		let gc = GarbageCollector::spawn(folders.clone());
		let files = ObjFiles::new(folders.clone(), gc, OBJ_CACHE_IDLE_TTL_SECS).await;
		(files, folders)
	}

	/// Register the `openFilesystem` method on `path`. Each distinct `app`
	/// name gets its own filesystem object exposed (idempotently, via
	/// `ServiceCore::get_original_obj`) at `path + ["fs", app]`.
	pub async fn expose(self, service: &Arc<ServiceCore>, path: Vec<String>) {
		let this = Arc::new(self);
		let mut methods: StdHashMap<String, ipc_core::service::Method> = StdHashMap::new();

		let (t, p, svc) = (this.clone(), path.clone(), service.clone());
		methods.insert(
			"openFilesystem".to_string(),
			json_method(move |req: OpenReq| {
				let (t, p, svc) = (t.clone(), p.clone(), svc.clone());
				async move {
					let fs_path = {
						let mut fp = p.clone();
						fp.push("fs".to_string());
						fp.push(req.app.clone());
						fp
					};
					if !svc.get_original_obj(&fs_path).await {
						let (files, folders) = t.namespace_for(&req.app).await;
						expose_filesystem(&svc, fs_path.clone(), files, folders).await;
					}
					Ok::<_, Error>(PathRep { path: fs_path })
				}
			}),
		);

		service.expose_droppable_service(path, methods, None).await;
	}
}

/// Caller-side proxy for the storage entry point.
pub struct StorageEntryPointCaller {
	client: Arc<ClientCore>,
	path: Vec<String>,
}

impl StorageEntryPointCaller {
	pub fn new(client: Arc<ClientCore>, path: Vec<String>) -> Self {
		Self { client, path }
	}

	pub async fn open_filesystem(&self, app: &str) -> Result<Vec<String>, Error> {
		let mut p = self.path.clone();
		p.push("openFilesystem".to_string());
		let rep: PathRep = call_json(&self.client, p, &OpenReq { app: app.to_string() }).await?;
		Ok(rep.path)
	}
}
