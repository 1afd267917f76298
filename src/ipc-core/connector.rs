//! IPC connector (spec module I): owns a pair of byte-message channels (one
//! outbound, one inbound) and dispatches each inbound envelope by
//! `msg_type` to the client side or the service side. A connector may be
//! two-sided, client-only, or service-only.
//!
//! Grounded on the teacher's `Endpoint`/`EndpointHandler` dispatch loop in
//! `garage_rpc::system` (decode, match on message kind, hand off to a
//! registered handler), generalized from netapp's per-peer connection to a
//! single in-process duplex channel.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use store_util::error::{Error, IpcError};

use crate::envelope::{Envelope, MsgType};

/// Side that owns outgoing calls: dispatches `interim`/`end`/`error`
/// deliveries to whatever is awaiting `fn_call_num`.
#[async_trait::async_trait]
pub trait ClientSide: Send + Sync {
	async fn deliver_interim(&self, fn_call_num: u32, body: Option<Vec<u8>>);
	async fn deliver_end(&self, fn_call_num: u32, body: Option<Vec<u8>>);
	async fn deliver_error(&self, fn_call_num: Option<u32>, body: Vec<u8>);
	/// The connector is stopping; reject every outstanding call.
	async fn on_stop(&self, stop_from_other_side: bool);
}

/// Side that exposes droppable services: handles `start`/`cancel`/`drop`
/// and enumerates methods for `list-obj`.
#[async_trait::async_trait]
pub trait ServiceSide: Send + Sync {
	async fn process_call_start(
		self: Arc<Self>,
		conn: Arc<Connector>,
		fn_call_num: u32,
		path: Vec<String>,
		body: Option<Vec<u8>>,
	);
	async fn process_cancellation(&self, fn_call_num: u32);
	async fn list_methods(&self, path: &[String]) -> Vec<String>;
	async fn process_drop(&self, path: &[String]);
	/// The connector is stopping; terminate every in-flight call record.
	async fn on_stop(&self, connector_stop: bool);
}

/// Owns one side (or both) of an in-process IPC channel and routes inbound
/// envelopes. `E` is the wire error surfaced when the outbound channel is
/// gone.
pub struct Connector {
	outbound: mpsc::UnboundedSender<Envelope>,
	client: Option<Arc<dyn ClientSide>>,
	service: Option<Arc<dyn ServiceSide>>,
	closed: Mutex<bool>,
}

impl Connector {
	/// Spawn the dispatch loop over `inbound` and return the connector
	/// handle used to send outbound envelopes.
	pub fn spawn(
		outbound: mpsc::UnboundedSender<Envelope>,
		mut inbound: mpsc::UnboundedReceiver<Envelope>,
		client: Option<Arc<dyn ClientSide>>,
		service: Option<Arc<dyn ServiceSide>>,
	) -> Arc<Self> {
		let conn = Arc::new(Connector {
			outbound,
			client,
			service,
			closed: Mutex::new(false),
		});

		let loop_conn = conn.clone();
		tokio::spawn(async move {
			while let Some(env) = inbound.recv().await {
				if let Err(e) = loop_conn.dispatch(env).await {
					loop_conn.close(Some(e)).await;
					return;
				}
			}
			loop_conn.close(None).await;
		});

		conn
	}

	pub fn is_client_only(&self) -> bool {
		self.client.is_some() && self.service.is_none()
	}

	pub fn is_service_only(&self) -> bool {
		self.service.is_some() && self.client.is_none()
	}

	pub async fn send_envelope(&self, env: Envelope) -> Result<(), Error> {
		if *self.closed.lock().await {
			return Err(Error::Ipc(IpcError::IpcNotConnected));
		}
		self.outbound
			.send(env)
			.map_err(|_| Error::Ipc(IpcError::IpcNotConnected))
	}

	async fn dispatch(self: &Arc<Self>, env: Envelope) -> Result<(), Error> {
		match env.msg_type {
			MsgType::Start => {
				let fn_call_num = env.fn_call_num.ok_or(Error::Ipc(IpcError::InvalidCallNum))?;
				let path = env.path.ok_or(Error::Ipc(IpcError::InvalidPath))?;
				match &self.service {
					Some(service) => {
						service
							.clone()
							.process_call_start(self.clone(), fn_call_num, path, env.body)
							.await;
					}
					None => {
						self.send_envelope(Envelope::error(Some(fn_call_num), error_body("callFnNotFound")))
							.await?;
					}
				}
			}
			MsgType::Cancel => {
				let fn_call_num = env.fn_call_num.ok_or(Error::Ipc(IpcError::InvalidCallNum))?;
				if let Some(service) = &self.service {
					service.process_cancellation(fn_call_num).await;
				}
			}
			MsgType::ListObj => {
				let fn_call_num = env.fn_call_num.ok_or(Error::Ipc(IpcError::InvalidCallNum))?;
				let path = env.path.ok_or(Error::Ipc(IpcError::InvalidPath))?;
				let methods = match &self.service {
					Some(service) => service.list_methods(&path).await,
					None => Vec::new(),
				};
				let body = serde_json::to_vec(&methods).unwrap_or_default();
				self.send_envelope(Envelope::end(fn_call_num, Some(body))).await?;
			}
			MsgType::Drop => {
				let path = env.path.ok_or(Error::Ipc(IpcError::InvalidPath))?;
				if let Some(service) = &self.service {
					service.process_drop(&path).await;
				}
			}
			MsgType::Interim => {
				let fn_call_num = env.fn_call_num.ok_or(Error::Ipc(IpcError::InvalidCallNum))?;
				if let Some(client) = &self.client {
					client.deliver_interim(fn_call_num, env.body).await;
				}
			}
			MsgType::End => {
				let fn_call_num = env.fn_call_num.ok_or(Error::Ipc(IpcError::InvalidCallNum))?;
				if let Some(client) = &self.client {
					client.deliver_end(fn_call_num, env.body).await;
				}
			}
			MsgType::Error => {
				if let Some(client) = &self.client {
					client.deliver_error(env.fn_call_num, env.body.unwrap_or_default()).await;
				}
			}
		}
		Ok(())
	}

	/// Stop the connector: every pending promise awaiter rejects and every
	/// stream subject errors, with `stop_from_other_side` when the peer
	/// closed the channel or `connector_stop` when we closed it ourselves
	/// (signalled by `err` being `None`).
	async fn close(&self, err: Option<Error>) {
		let mut closed = self.closed.lock().await;
		if *closed {
			return;
		}
		*closed = true;
		drop(closed);

		let stop_from_other_side = err.is_none();
		if let Some(e) = &err {
			warn!("ipc connector closing after dispatch error: {}", e);
		}
		if let Some(client) = &self.client {
			client.on_stop(stop_from_other_side).await;
		}
		if let Some(service) = &self.service {
			service.on_stop(!stop_from_other_side).await;
		}
	}
}

fn error_body(kind: &str) -> Vec<u8> {
	let mut map = serde_json::Map::new();
	map.insert(kind.to_string(), serde_json::Value::Bool(true));
	serde_json::Value::Object(map).to_string().into_bytes()
}
