//! File capability (spec module L): one stored object's current version as
//! a byte source, and a place to stage the next version as a byte sink.
//! Both proxies returned by the exposer side are droppable references per
//! module L's cross-cutting rule (i): the caller is responsible for
//! dropping whatever object reference a method hands back.
//!
//! Grounded on `store_model::obj_files::LocalObj` for the exposer-side
//! backing: `get_src`/`save_new_version` are the same operations the
//! object files manager already exposes to direct (non-IPC) callers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TMutex;

use ipc_core::client::{ClientCore, PeerRef};
use ipc_core::service::ServiceCore;
use store_fs::version_file::VersionFile;
use store_model::obj_files::LocalObj;
use store_util::error::Error;

use crate::bytes_io::{expose_byte_sink, expose_byte_source, ByteSink, ByteSinkCaller, ByteSource, ByteSourceCaller, LayoutRange};
use crate::codec::{call_json_no_args, json_method_no_args};

#[derive(Serialize, Deserialize)]
struct PathRep {
	path: Vec<String>,
}
#[derive(Serialize, Deserialize)]
struct OptVersionRep {
	version: Option<u64>,
}
#[derive(Serialize, Deserialize)]
struct SizeRep {
	size: u64,
}

/// Read cursor over one already-written version's bytes.
struct VersionFileSource {
	vf: Arc<VersionFile>,
	pos: TMutex<u64>,
}

#[async_trait::async_trait]
impl ByteSource for VersionFileSource {
	async fn read(&self, len: u64) -> Result<Vec<u8>, Error> {
		let mut pos = self.pos.lock().await;
		let size = self.vf.layout_snapshot().await.total_size().unwrap_or(0);
		let remaining = size.saturating_sub(*pos);
		let take = len.min(remaining);
		let bytes = self.vf.read_segs(*pos, take).await?;
		*pos += bytes.len() as u64;
		Ok(bytes)
	}

	async fn seek(&self, offset: u64) -> Result<(), Error> {
		*self.pos.lock().await = offset;
		Ok(())
	}

	async fn get_size(&self) -> Result<u64, Error> {
		Ok(self.vf.layout_snapshot().await.total_size().unwrap_or(0))
	}

	async fn get_position(&self) -> Result<u64, Error> {
		Ok(*self.pos.lock().await)
	}
}

/// Write cursor for the next version: buffers bytes in memory and commits
/// them as a single resident segment on `done`.
struct NewVersionSink {
	local: Arc<LocalObj>,
	header: Vec<u8>,
	buf: TMutex<Vec<u8>>,
}

#[async_trait::async_trait]
impl ByteSink for NewVersionSink {
	async fn splice(&self, bytes: Vec<u8>) -> Result<(), Error> {
		self.buf.lock().await.extend_from_slice(&bytes);
		Ok(())
	}

	async fn truncate(&self, size: u64) -> Result<(), Error> {
		self.buf.lock().await.truncate(size as usize);
		Ok(())
	}

	async fn done(&self) -> Result<(), Error> {
		let status = self.local.status().await;
		let next = status.current_version.map(|v| v + 1).unwrap_or(1);
		let buf = self.buf.lock().await;
		self.local
			.save_new_version(next, status.current_version, &self.header, &buf)
			.await
	}

	async fn show_layout(&self) -> Result<Vec<LayoutRange>, Error> {
		let len = self.buf.lock().await.len() as u64;
		Ok(vec![LayoutRange { ofs: 0, len }])
	}

	async fn get_size(&self) -> Result<u64, Error> {
		Ok(self.buf.lock().await.len() as u64)
	}
}

/// Register `local` as an exposed file object under `path`, with
/// `getByteSource`, `startNewVersion`, `getSize`, and `currentVersion`
/// methods. Byte source/sink proxies are exposed under `path` extended
/// with `"src"`/`"sink"`, matching how `ServiceCore` expects distinct
/// droppable objects at distinct paths.
pub async fn expose_file(service: &Arc<ServiceCore>, path: Vec<String>, local: Arc<LocalObj>) {
	let mut methods = std::collections::HashMap::new();

	let (l, p) = (local.clone(), path.clone());
	let svc = service.clone();
	methods.insert(
		"getByteSource".to_string(),
		json_method_no_args(move || {
			let (l, p, svc) = (l.clone(), p.clone(), svc.clone());
			async move {
				let status = l.status().await;
				let version = status.current_version.ok_or_else(|| Error::message("object has no current version"))?;
				let vf = l.get_src(version).await?;
				let src_path = {
					let mut sp = p.clone();
					sp.push("src".to_string());
					sp
				};
				let source: Arc<dyn ByteSource> = Arc::new(VersionFileSource {
					vf,
					pos: TMutex::new(0),
				});
				expose_byte_source(&svc, src_path.clone(), source).await;
				Ok(PathRep { path: src_path })
			}
		}),
	);

	let (l, p) = (local.clone(), path.clone());
	let svc = service.clone();
	methods.insert(
		"startNewVersion".to_string(),
		json_method_no_args(move || {
			let (l, p, svc) = (l.clone(), p.clone(), svc.clone());
			async move {
				let sink_path = {
					let mut sp = p.clone();
					sp.push("sink".to_string());
					sp
				};
				let sink: Arc<dyn ByteSink> = Arc::new(NewVersionSink {
					local: l,
					header: Vec::new(),
					buf: TMutex::new(Vec::new()),
				});
				expose_byte_sink(&svc, sink_path.clone(), sink).await;
				Ok(PathRep { path: sink_path })
			}
		}),
	);

	let l = local.clone();
	methods.insert(
		"getSize".to_string(),
		json_method_no_args(move || {
			let l = l.clone();
			async move {
				let status = l.status().await;
				match status.current_version {
					Some(v) => {
						let vf = l.get_src(v).await?;
						Ok(SizeRep {
							size: vf.layout_snapshot().await.total_size().unwrap_or(0),
						})
					}
					None => Ok(SizeRep { size: 0 }),
				}
			}
		}),
	);

	let l = local.clone();
	methods.insert(
		"currentVersion".to_string(),
		json_method_no_args(move || {
			let l = l.clone();
			async move {
				Ok(OptVersionRep {
					version: l.status().await.current_version,
				})
			}
		}),
	);

	service.expose_droppable_service(path, methods, None).await;
}

/// Caller-side proxy for the file capability.
pub struct FileCaller {
	client: Arc<ClientCore>,
	path: Vec<String>,
}

impl FileCaller {
	pub fn new(client: Arc<ClientCore>, path: Vec<String>) -> Self {
		Self { client, path }
	}

	fn method(&self, name: &str) -> Vec<String> {
		let mut p = self.path.clone();
		p.push(name.to_string());
		p
	}

	/// Fetch a byte-source proxy for the current version. The returned
	/// [`PeerRef`] must be held for as long as the caller wants the proxy
	/// to remain registered on the exposer side; dropping it releases it.
	pub async fn get_byte_source(&self) -> Result<(ByteSourceCaller, PeerRef), Error> {
		let rep: PathRep = call_json_no_args(&self.client, self.method("getByteSource")).await?;
		let (_ref_id, peer_ref) = self.client.register_client_drop(rep.path.clone()).await;
		Ok((ByteSourceCaller::new(self.client.clone(), rep.path), peer_ref))
	}

	/// Start staging a new version, returning a byte-sink proxy that
	/// commits the version when `done()` is called on it.
	pub async fn start_new_version(&self) -> Result<(ByteSinkCaller, PeerRef), Error> {
		let rep: PathRep = call_json_no_args(&self.client, self.method("startNewVersion")).await?;
		let (_ref_id, peer_ref) = self.client.register_client_drop(rep.path.clone()).await;
		Ok((ByteSinkCaller::new(self.client.clone(), rep.path), peer_ref))
	}

	pub async fn get_size(&self) -> Result<u64, Error> {
		let rep: SizeRep = call_json_no_args(&self.client, self.method("getSize")).await?;
		Ok(rep.size)
	}

	pub async fn current_version(&self) -> Result<Option<u64>, Error> {
		let rep: OptVersionRep = call_json_no_args(&self.client, self.method("currentVersion")).await?;
		Ok(rep.version)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use ipc_core::connector::Connector;
	use store_fs::folder::{ObjFolders, ObjFoldersConfig};
	use store_model::gc::GarbageCollector;
	use store_model::obj_files::ObjFiles;
	use store_util::obj_id::ObjId;

	async fn wire(service: Arc<ServiceCore>) -> (Arc<ClientCore>, Arc<Connector>, Arc<Connector>) {
		let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
		let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
		let client = ClientCore::new(a_tx.clone());
		let client_conn = Connector::spawn(a_tx, b_rx, Some(client.clone()), None);
		let service_conn = Connector::spawn(b_tx, a_rx, None, Some(service));
		(client, client_conn, service_conn)
	}

	#[tokio::test]
	async fn write_new_version_then_read_it_back() {
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
		let files = ObjFiles::new(folders, gc, 60).await;

		let id: ObjId = Some("abcdefgh".to_string());
		let local = files.save_first_version(id.clone(), b"hdr", b"v1-bytes").await.unwrap();

		let service = ServiceCore::new();
		expose_file(&service, vec!["file".into()], local).await;
		let (client, _c, _s) = wire(service).await;

		let caller = FileCaller::new(client, vec!["file".into()]);
		assert_eq!(caller.current_version().await.unwrap(), Some(1));

		let (sink, _sink_ref) = caller.start_new_version().await.unwrap();
		sink.splice(b"v2-bytes-longer".to_vec()).await.unwrap();
		sink.done().await.unwrap();

		assert_eq!(caller.current_version().await.unwrap(), Some(2));

		let (source, _src_ref) = caller.get_byte_source().await.unwrap();
		let read = source.read(16).await.unwrap();
		assert_eq!(read, b"v2-bytes-longer");
	}
}
