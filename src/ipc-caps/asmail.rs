//! ASMail inbox/delivery capability (spec module L): the IPC contract
//! shape for sending and listing encrypted mail messages. The delivery
//! façade itself — network transport, recipient key lookup, retry policy —
//! is an external collaborator, same as MailerId (see the crate root's
//! "out of scope" note); this binding only fixes the request/reply shapes.
//!
//! Grounded on [`crate::codec`]'s JSON convention; the message list shape
//! mirrors [`crate::filesystem`]'s `listObjects`/`stat` pair since an
//! inbox is, from the capability surface's point of view, just another
//! listable id-addressed namespace.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ipc_core::client::ClientCore;
use ipc_core::service::{Method, ServiceCore};
use store_util::error::Error;

use crate::codec::{call_json, call_json_no_args, json_method, json_method_no_args};

#[derive(Serialize, Deserialize)]
struct MsgIdsRep {
	#[serde(rename = "msgIds")]
	msg_ids: Vec<String>,
}
#[derive(Serialize, Deserialize)]
struct MsgIdReq {
	#[serde(rename = "msgId")]
	msg_id: String,
}
#[derive(Serialize, Deserialize)]
struct MsgBytesRep {
	bytes: Vec<u8>,
}
#[derive(Serialize, Deserialize)]
struct SendReq {
	recipient: String,
	bytes: Vec<u8>,
}
#[derive(Serialize, Deserialize)]
struct SendRep {
	#[serde(rename = "msgId")]
	msg_id: String,
}

/// What a real inbox/delivery façade implements; this crate carries only
/// the shape, so tests exercise it against an in-memory stub.
#[async_trait::async_trait]
pub trait AsmailInbox: Send + Sync {
	async fn list_messages(&self) -> Result<Vec<String>, Error>;
	async fn get_message(&self, msg_id: &str) -> Result<Vec<u8>, Error>;
	async fn send_message(&self, recipient: &str, bytes: Vec<u8>) -> Result<String, Error>;
	async fn remove_message(&self, msg_id: &str) -> Result<(), Error>;
}

pub async fn expose_asmail(service: &Arc<ServiceCore>, path: Vec<String>, inbox: Arc<dyn AsmailInbox>) {
	let mut methods: StdHashMap<String, Method> = StdHashMap::new();

	let i = inbox.clone();
	methods.insert(
		"listMessages".to_string(),
		json_method_no_args(move || {
			let i = i.clone();
			async move { i.list_messages().await.map(|msg_ids| MsgIdsRep { msg_ids }) }
		}),
	);

	let i = inbox.clone();
	methods.insert(
		"getMessage".to_string(),
		json_method(move |req: MsgIdReq| {
			let i = i.clone();
			async move { i.get_message(&req.msg_id).await.map(|bytes| MsgBytesRep { bytes }) }
		}),
	);

	let i = inbox.clone();
	methods.insert(
		"sendMessage".to_string(),
		json_method(move |req: SendReq| {
			let i = i.clone();
			async move { i.send_message(&req.recipient, req.bytes).await.map(|msg_id| SendRep { msg_id }) }
		}),
	);

	let i = inbox.clone();
	methods.insert(
		"removeMessage".to_string(),
		json_method(move |req: MsgIdReq| {
			let i = i.clone();
			async move { i.remove_message(&req.msg_id).await }
		}),
	);

	service.expose_droppable_service(path, methods, None).await;
}

pub struct AsmailCaller {
	client: Arc<ClientCore>,
	path: Vec<String>,
}

impl AsmailCaller {
	pub fn new(client: Arc<ClientCore>, path: Vec<String>) -> Self {
		Self { client, path }
	}

	fn method(&self, name: &str) -> Vec<String> {
		let mut p = self.path.clone();
		p.push(name.to_string());
		p
	}

	pub async fn list_messages(&self) -> Result<Vec<String>, Error> {
		let rep: MsgIdsRep = call_json_no_args(&self.client, self.method("listMessages")).await?;
		Ok(rep.msg_ids)
	}

	pub async fn get_message(&self, msg_id: &str) -> Result<Vec<u8>, Error> {
		let rep: MsgBytesRep = call_json(
			&self.client,
			self.method("getMessage"),
			&MsgIdReq { msg_id: msg_id.to_string() },
		)
		.await?;
		Ok(rep.bytes)
	}

	pub async fn send_message(&self, recipient: &str, bytes: Vec<u8>) -> Result<String, Error> {
		let rep: SendRep = call_json(
			&self.client,
			self.method("sendMessage"),
			&SendReq {
				recipient: recipient.to_string(),
				bytes,
			},
		)
		.await?;
		Ok(rep.msg_id)
	}

	pub async fn remove_message(&self, msg_id: &str) -> Result<(), Error> {
		call_json(
			&self.client,
			self.method("removeMessage"),
			&MsgIdReq { msg_id: msg_id.to_string() },
		)
		.await
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use ipc_core::connector::Connector;
	use tokio::sync::Mutex as TMutex;

	struct StubInbox {
		messages: TMutex<StdHashMap<String, Vec<u8>>>,
	}

	#[async_trait::async_trait]
	impl AsmailInbox for StubInbox {
		async fn list_messages(&self) -> Result<Vec<String>, Error> {
			Ok(self.messages.lock().await.keys().cloned().collect())
		}
		async fn get_message(&self, msg_id: &str) -> Result<Vec<u8>, Error> {
			self.messages
				.lock()
				.await
				.get(msg_id)
				.cloned()
				.ok_or_else(|| Error::message("no such message"))
		}
		async fn send_message(&self, _recipient: &str, bytes: Vec<u8>) -> Result<String, Error> {
			let id = format!("m{}", self.messages.lock().await.len() + 1);
			self.messages.lock().await.insert(id.clone(), bytes);
			Ok(id)
		}
		async fn remove_message(&self, msg_id: &str) -> Result<(), Error> {
			self.messages.lock().await.remove(msg_id);
			Ok(())
		}
	}

	#[tokio::test]
	async fn send_list_get_remove_roundtrip() {
		let service = ServiceCore::new();
		let inbox = Arc::new(StubInbox {
			messages: TMutex::new(StdHashMap::new()),
		});
		expose_asmail(&service, vec!["mail".into()], inbox).await;

		let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
		let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
		let client = ClientCore::new(a_tx.clone());
		let _c = Connector::spawn(a_tx, b_rx, Some(client.clone()), None);
		let _s = Connector::spawn(b_tx, a_rx, None, Some(service));

		let caller = AsmailCaller::new(client, vec!["mail".into()]);
		let msg_id = caller.send_message("bob@example.com", b"hi bob".to_vec()).await.unwrap();
		assert_eq!(caller.list_messages().await.unwrap(), vec![msg_id.clone()]);
		assert_eq!(caller.get_message(&msg_id).await.unwrap(), b"hi bob");
		caller.remove_message(&msg_id).await.unwrap();
		assert!(caller.list_messages().await.unwrap().is_empty());
	}
}
