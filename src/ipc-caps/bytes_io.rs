//! Byte source and byte sink capabilities (spec module L, bullet iii): the
//! two proxy shapes every capability built on top of stored object bytes
//! ultimately bottoms out in.
//!
//! - **Byte source** (read-only cursor): `read`, `seek`, `get_size`,
//!   `get_position`.
//! - **Byte sink** (write-only cursor): `splice`, `truncate`, `done`,
//!   `show_layout`, `get_size`.
//!
//! Grounded on `store_fs::version_file::VersionFile`'s header/segment
//! read and write methods for the exposer-side implementations backed by
//! the local object store, and on the teacher's S3 byte-range read path
//! (`garage_api::s3` GetObject) for the read-cursor shape.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ipc_core::client::ClientCore;
use ipc_core::service::{Method, ServiceCore};
use store_util::error::Error;

use crate::codec::{call_json, json_method};

#[async_trait::async_trait]
pub trait ByteSource: Send + Sync {
	async fn read(&self, len: u64) -> Result<Vec<u8>, Error>;
	async fn seek(&self, offset: u64) -> Result<(), Error>;
	async fn get_size(&self) -> Result<u64, Error>;
	async fn get_position(&self) -> Result<u64, Error>;
}

#[async_trait::async_trait]
pub trait ByteSink: Send + Sync {
	async fn splice(&self, bytes: Vec<u8>) -> Result<(), Error>;
	async fn truncate(&self, size: u64) -> Result<(), Error>;
	async fn done(&self) -> Result<(), Error>;
	async fn show_layout(&self) -> Result<Vec<LayoutRange>, Error>;
	async fn get_size(&self) -> Result<u64, Error>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutRange {
	pub ofs: u64,
	pub len: u64,
}

#[derive(Serialize, Deserialize)]
struct ReadReq {
	len: u64,
}
#[derive(Serialize, Deserialize)]
struct ReadRep {
	bytes: Vec<u8>,
}
#[derive(Serialize, Deserialize)]
struct SeekReq {
	offset: u64,
}
#[derive(Serialize, Deserialize)]
struct SpliceReq {
	bytes: Vec<u8>,
}
#[derive(Serialize, Deserialize)]
struct TruncateReq {
	size: u64,
}
#[derive(Serialize, Deserialize)]
struct SizeRep {
	size: u64,
}

/// Caller-side proxy wrapping a connector's client half into a local
/// `ByteSource`-shaped object.
pub struct ByteSourceCaller {
	client: Arc<ClientCore>,
	path: Vec<String>,
}

impl ByteSourceCaller {
	pub fn new(client: Arc<ClientCore>, path: Vec<String>) -> Self {
		Self { client, path }
	}

	fn method(&self, name: &str) -> Vec<String> {
		let mut p = self.path.clone();
		p.push(name.to_string());
		p
	}
}

#[async_trait::async_trait]
impl ByteSource for ByteSourceCaller {
	async fn read(&self, len: u64) -> Result<Vec<u8>, Error> {
		let rep: ReadRep = call_json(&self.client, self.method("read"), &ReadReq { len }).await?;
		Ok(rep.bytes)
	}

	async fn seek(&self, offset: u64) -> Result<(), Error> {
		let _: () = call_json(&self.client, self.method("seek"), &SeekReq { offset }).await?;
		Ok(())
	}

	async fn get_size(&self) -> Result<u64, Error> {
		let rep: SizeRep = call_json(&self.client, self.method("getSize"), &()).await?;
		Ok(rep.size)
	}

	async fn get_position(&self) -> Result<u64, Error> {
		let rep: SizeRep = call_json(&self.client, self.method("getPosition"), &()).await?;
		Ok(rep.size)
	}
}

/// Register `src` as an exposed byte-source object under `path`.
pub async fn expose_byte_source(service: &Arc<ServiceCore>, path: Vec<String>, src: Arc<dyn ByteSource>) {
	let mut methods = std::collections::HashMap::new();

	let s = src.clone();
	methods.insert(
		"read".to_string(),
		json_method(move |req: ReadReq| {
			let s = s.clone();
			async move { s.read(req.len).await.map(|bytes| ReadRep { bytes }) }
		}),
	);

	let s = src.clone();
	methods.insert(
		"seek".to_string(),
		json_method(move |req: SeekReq| {
			let s = s.clone();
			async move { s.seek(req.offset).await }
		}),
	);

	let s = src.clone();
	methods.insert(
		"getSize".to_string(),
		json_method(move |_req: ()| {
			let s = s.clone();
			async move { s.get_size().await.map(|size| SizeRep { size }) }
		}),
	);

	let s = src.clone();
	methods.insert(
		"getPosition".to_string(),
		json_method(move |_req: ()| {
			let s = s.clone();
			async move { s.get_position().await.map(|size| SizeRep { size }) }
		}),
	);

	service.expose_droppable_service(path, methods, None).await;
}

/// Caller-side proxy wrapping a connector's client half into a local
/// `ByteSink`-shaped object.
pub struct ByteSinkCaller {
	client: Arc<ClientCore>,
	path: Vec<String>,
}

impl ByteSinkCaller {
	pub fn new(client: Arc<ClientCore>, path: Vec<String>) -> Self {
		Self { client, path }
	}

	fn method(&self, name: &str) -> Vec<String> {
		let mut p = self.path.clone();
		p.push(name.to_string());
		p
	}
}

#[async_trait::async_trait]
impl ByteSink for ByteSinkCaller {
	async fn splice(&self, bytes: Vec<u8>) -> Result<(), Error> {
		let _: () = call_json(&self.client, self.method("splice"), &SpliceReq { bytes }).await?;
		Ok(())
	}

	async fn truncate(&self, size: u64) -> Result<(), Error> {
		let _: () = call_json(&self.client, self.method("truncate"), &TruncateReq { size }).await?;
		Ok(())
	}

	async fn done(&self) -> Result<(), Error> {
		let _: () = call_json(&self.client, self.method("done"), &()).await?;
		Ok(())
	}

	async fn show_layout(&self) -> Result<Vec<LayoutRange>, Error> {
		call_json(&self.client, self.method("showLayout"), &()).await
	}

	async fn get_size(&self) -> Result<u64, Error> {
		let rep: SizeRep = call_json(&self.client, self.method("getSize"), &()).await?;
		Ok(rep.size)
	}
}

/// Register `sink` as an exposed byte-sink object under `path`.
pub async fn expose_byte_sink(service: &Arc<ServiceCore>, path: Vec<String>, sink: Arc<dyn ByteSink>) {
	let mut methods: std::collections::HashMap<String, Method> = std::collections::HashMap::new();

	let s = sink.clone();
	methods.insert(
		"splice".to_string(),
		json_method(move |req: SpliceReq| {
			let s = s.clone();
			async move { s.splice(req.bytes).await }
		}),
	);

	let s = sink.clone();
	methods.insert(
		"truncate".to_string(),
		json_method(move |req: TruncateReq| {
			let s = s.clone();
			async move { s.truncate(req.size).await }
		}),
	);

	let s = sink.clone();
	methods.insert(
		"done".to_string(),
		json_method(move |_req: ()| {
			let s = s.clone();
			async move { s.done().await }
		}),
	);

	let s = sink.clone();
	methods.insert(
		"showLayout".to_string(),
		json_method(move |_req: ()| {
			let s = s.clone();
			async move { s.show_layout().await }
		}),
	);

	let s = sink.clone();
	methods.insert(
		"getSize".to_string(),
		json_method(move |_req: ()| {
			let s = s.clone();
			async move { s.get_size().await.map(|size| SizeRep { size }) }
		}),
	);

	service.expose_droppable_service(path, methods, None).await;
}

#[cfg(test)]
mod test {
	use super::*;
	use ipc_core::connector::Connector;
	use tokio::sync::Mutex as TMutex;

	struct MemSource {
		data: Vec<u8>,
		pos: TMutex<u64>,
	}

	#[async_trait::async_trait]
	impl ByteSource for MemSource {
		async fn read(&self, len: u64) -> Result<Vec<u8>, Error> {
			let mut pos = self.pos.lock().await;
			let start = *pos as usize;
			let end = (start + len as usize).min(self.data.len());
			*pos = end as u64;
			Ok(self.data[start..end].to_vec())
		}
		async fn seek(&self, offset: u64) -> Result<(), Error> {
			*self.pos.lock().await = offset;
			Ok(())
		}
		async fn get_size(&self) -> Result<u64, Error> {
			Ok(self.data.len() as u64)
		}
		async fn get_position(&self) -> Result<u64, Error> {
			Ok(*self.pos.lock().await)
		}
	}

	#[tokio::test]
	async fn byte_source_roundtrip_over_connector() {
		let service = ServiceCore::new();
		let src = Arc::new(MemSource {
			data: b"hello world".to_vec(),
			pos: TMutex::new(0),
		});
		expose_byte_source(&service, vec!["src".into()], src).await;

		// client -> service and service -> client channel pairs.
		let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
		let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();

		let client_core = ClientCore::new(a_tx.clone());
		let _client_conn = Connector::spawn(a_tx, b_rx, Some(client_core.clone()), None);
		let _service_conn = Connector::spawn(b_tx, a_rx, None, Some(service));

		let caller = ByteSourceCaller::new(client_core, vec!["src".into()]);
		assert_eq!(caller.get_size().await.unwrap(), 11);
		let bytes = caller.read(5).await.unwrap();
		assert_eq!(bytes, b"hello");
		assert_eq!(caller.get_position().await.unwrap(), 5);
		caller.seek(6).await.unwrap();
		let rest = caller.read(5).await.unwrap();
		assert_eq!(rest, b"world");
	}
}
