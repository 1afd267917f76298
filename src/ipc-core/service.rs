//! Service side (spec module K): a path-keyed table of exposed methods.
//! Each `start` envelope is looked up by path, invoked, and its result (or
//! stream) is turned back into `interim`/`end`/`error` envelopes; `cancel`
//! is forwarded to whatever cancellation hook the in-flight call
//! registered.
//!
//! Grounded on the teacher's handler-registration pattern in
//! `garage_api` (a path table mapping request shape to a handler
//! function), adapted to the spec's droppable-service model where
//! `process_drop` releases whatever a prior `start` created at that path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use store_util::error::{Error, IpcError};

use crate::connector::{Connector, ServiceSide};
use crate::envelope::Envelope;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of invoking one exposed method: either a single reply body or a
/// stream of item bodies terminated by `Ok(())`/`Err`.
pub enum CallOutcome {
	Reply(Result<Option<Vec<u8>>, Vec<u8>>),
	/// A streamed reply, plus an optional hook the handler wants invoked if
	/// the peer cancels before the stream ends (so it can release whatever
	/// it's reading from upstream).
	Stream(tokio::sync::mpsc::UnboundedReceiver<Result<Option<Vec<u8>>, Vec<u8>>>, Option<CancelHook>),
}

/// A single exposed method: takes the call body, returns its outcome.
/// Methods are looked up by the final path segment under whatever prefix
/// they were registered at.
pub type Method = Arc<dyn Fn(Option<Vec<u8>>) -> BoxFuture<'static, CallOutcome> + Send + Sync>;

/// A cancellation hook registered for one in-flight `fn_call_num`, invoked
/// when a matching `cancel` envelope arrives.
pub type CancelHook = Arc<dyn Fn() + Send + Sync>;

struct InFlight {
	cancel: Option<CancelHook>,
}

/// One object exposed under a path prefix: its methods, plus an optional
/// drop hook run when the peer releases its last reference.
struct ExposedObj {
	methods: HashMap<String, Method>,
	on_drop: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// The service half of an IPC connector: a registry of exposed objects
/// dispatched to by path, plus the in-flight call table used to route
/// `cancel`.
pub struct ServiceCore {
	objects: Mutex<HashMap<Vec<String>, ExposedObj>>,
	in_flight: Mutex<HashMap<u32, InFlight>>,
}

impl ServiceCore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			objects: Mutex::new(HashMap::new()),
			in_flight: Mutex::new(HashMap::new()),
		})
	}

	/// Expose an object at `path`: `methods` maps a final path segment
	/// (e.g. `"readBytes"`) to its handler. `on_drop` runs once, the first
	/// time a `drop` envelope arrives for this exact path.
	pub async fn expose_droppable_service(
		self: &Arc<Self>,
		path: Vec<String>,
		methods: HashMap<String, Method>,
		on_drop: Option<Arc<dyn Fn() + Send + Sync>>,
	) {
		self.objects.lock().await.insert(path, ExposedObj { methods, on_drop });
	}

	/// Look up the object exposed at `path`, for callers that need to
	/// inspect or extend it (e.g. a storage entry point handing back a
	/// reference to an already-exposed sub-object).
	pub async fn get_original_obj(&self, path: &[String]) -> bool {
		self.objects.lock().await.contains_key(path)
	}

	async fn find_method(&self, path: &[String]) -> Option<Method> {
		let (obj_path, method_name) = path.split_at(path.len().checked_sub(1)?);
		let objects = self.objects.lock().await;
		objects.get(obj_path)?.methods.get(&method_name[0]).cloned()
	}
}

#[async_trait::async_trait]
impl ServiceSide for ServiceCore {
	async fn process_call_start(
		self: Arc<Self>,
		conn: Arc<Connector>,
		fn_call_num: u32,
		path: Vec<String>,
		body: Option<Vec<u8>>,
	) {
		{
			let mut in_flight = self.in_flight.lock().await;
			if in_flight.contains_key(&fn_call_num) {
				drop(in_flight);
				let _ = conn
					.send_envelope(Envelope::error(Some(fn_call_num), duplicate_fn_call_num_body()))
					.await;
				return;
			}
			in_flight.insert(fn_call_num, InFlight { cancel: None });
		}

		let method = match self.find_method(&path).await {
			Some(m) => m,
			None => {
				self.in_flight.lock().await.remove(&fn_call_num);
				let _ = conn
					.send_envelope(Envelope::error(Some(fn_call_num), call_fn_not_found_body()))
					.await;
				return;
			}
		};

		// Run the call on its own task so a slow or streaming handler never
		// blocks the connector's single dispatch loop from observing a
		// `cancel` (or another `start`) that arrives while it's in flight.
		tokio::spawn(async move {
			self.run_call(conn, fn_call_num, method, body).await;
		});
	}

	async fn process_cancellation(&self, fn_call_num: u32) {
		let hook = self
			.in_flight
			.lock()
			.await
			.remove(&fn_call_num)
			.and_then(|f| f.cancel);
		if let Some(hook) = hook {
			hook();
		}
	}

	async fn list_methods(&self, path: &[String]) -> Vec<String> {
		match self.objects.lock().await.get(path) {
			Some(obj) => obj.methods.keys().cloned().collect(),
			None => Vec::new(),
		}
	}

	async fn process_drop(&self, path: &[String]) {
		let on_drop = self.objects.lock().await.remove(path).and_then(|o| o.on_drop);
		if let Some(on_drop) = on_drop {
			on_drop();
		}
	}

	async fn on_stop(&self, _connector_stop: bool) {
		let mut in_flight = self.in_flight.lock().await;
		for (_, f) in in_flight.drain() {
			if let Some(cancel) = f.cancel {
				cancel();
			}
		}
	}
}

impl ServiceCore {
	async fn run_call(self: Arc<Self>, conn: Arc<Connector>, fn_call_num: u32, method: Method, body: Option<Vec<u8>>) {
		match method(body).await {
			CallOutcome::Reply(Ok(reply_body)) => {
				self.in_flight.lock().await.remove(&fn_call_num);
				let _ = conn.send_envelope(Envelope::end(fn_call_num, reply_body)).await;
			}
			CallOutcome::Reply(Err(err_body)) => {
				self.in_flight.lock().await.remove(&fn_call_num);
				let _ = conn.send_envelope(Envelope::error(Some(fn_call_num), err_body)).await;
			}
			CallOutcome::Stream(mut items, on_cancel) => {
				let still_in_flight = {
					let mut in_flight = self.in_flight.lock().await;
					match in_flight.get_mut(&fn_call_num) {
						Some(f) => {
							f.cancel = on_cancel.clone();
							true
						}
						None => false,
					}
				};
				if !still_in_flight {
					// cancelled while the handler was producing its stream
					if let Some(hook) = on_cancel {
						hook();
					}
					return;
				}

				while let Some(item) = items.recv().await {
					if !self.in_flight.lock().await.contains_key(&fn_call_num) {
						// cancelled mid-stream
						return;
					}
					match item {
						Ok(body) => {
							if conn.send_envelope(Envelope::interim(fn_call_num, body)).await.is_err() {
								self.in_flight.lock().await.remove(&fn_call_num);
								return;
							}
						}
						Err(err_body) => {
							self.in_flight.lock().await.remove(&fn_call_num);
							let _ = conn.send_envelope(Envelope::error(Some(fn_call_num), err_body)).await;
							return;
						}
					}
				}
				self.in_flight.lock().await.remove(&fn_call_num);
				let _ = conn.send_envelope(Envelope::end(fn_call_num, None)).await;
			}
		}
	}
}

fn duplicate_fn_call_num_body() -> Vec<u8> {
	flag_body("duplicateFnCallNum")
}

fn call_fn_not_found_body() -> Vec<u8> {
	flag_body("callFnNotFound")
}

fn flag_body(flag: &str) -> Vec<u8> {
	let mut map = serde_json::Map::new();
	map.insert(flag.to_string(), serde_json::Value::Bool(true));
	serde_json::Value::Object(map).to_string().into_bytes()
}

/// Lookup helper mirroring [`store_util::error::IpcError::ObjectNotFound`]
/// for callers that need to distinguish "path never exposed" from "method
/// not found on an exposed path".
pub fn object_not_found() -> Error {
	Error::Ipc(IpcError::ObjectNotFound)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::envelope::MsgType;
	use std::sync::atomic::{AtomicBool, AtomicUsize};
	use tokio::sync::mpsc;

	fn echo_method() -> Method {
		Arc::new(|body: Option<Vec<u8>>| {
			Box::pin(async move { CallOutcome::Reply(Ok(body)) }) as BoxFuture<'static, CallOutcome>
		})
	}

	async fn spawn_connector(service: Arc<ServiceCore>) -> (Arc<Connector>, mpsc::UnboundedReceiver<Envelope>, mpsc::UnboundedSender<Envelope>) {
		let (client_outbound, client_outbound_rx) = mpsc::unbounded_channel();
		let (to_service, from_client) = mpsc::unbounded_channel();
		let conn = Connector::spawn(client_outbound, from_client, None, Some(service));
		(conn, client_outbound_rx, to_service)
	}

	#[tokio::test]
	async fn start_dispatches_to_registered_method() {
		let service = ServiceCore::new();
		let mut methods = HashMap::new();
		methods.insert("echo".to_string(), echo_method());
		service.expose_droppable_service(vec!["fs".into()], methods, None).await;

		let (_conn, mut replies, to_service) = spawn_connector(service).await;
		to_service
			.send(Envelope::start(1, vec!["fs".into(), "echo".into()], Some(b"hi".to_vec())))
			.unwrap();

		let reply = replies.recv().await.unwrap();
		assert_eq!(reply.msg_type, MsgType::End);
		assert_eq!(reply.body, Some(b"hi".to_vec()));
	}

	#[tokio::test]
	async fn start_on_unregistered_path_replies_error() {
		let service = ServiceCore::new();
		let (_conn, mut replies, to_service) = spawn_connector(service).await;
		to_service.send(Envelope::start(1, vec!["missing".into(), "m".into()], None)).unwrap();

		let reply = replies.recv().await.unwrap();
		assert_eq!(reply.msg_type, MsgType::Error);
	}

	#[tokio::test]
	async fn duplicate_fn_call_num_on_start_is_rejected_without_reinvoking() {
		let service = ServiceCore::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = calls.clone();
		let mut methods = HashMap::new();
		methods.insert(
			"slow".to_string(),
			Arc::new(move |_body: Option<Vec<u8>>| {
				let calls = calls2.clone();
				Box::pin(async move {
					calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
					tokio::time::sleep(std::time::Duration::from_millis(50)).await;
					CallOutcome::Reply(Ok(None))
				}) as BoxFuture<'static, CallOutcome>
			}) as Method,
		);
		service.expose_droppable_service(vec!["fs".into()], methods, None).await;

		let (_conn, mut replies, to_service) = spawn_connector(service).await;
		to_service.send(Envelope::start(9, vec!["fs".into(), "slow".into()], None)).unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		to_service.send(Envelope::start(9, vec!["fs".into(), "slow".into()], None)).unwrap();

		let first_reply = replies.recv().await.unwrap();
		assert_eq!(first_reply.msg_type, MsgType::Error);
		let second_reply = replies.recv().await.unwrap();
		assert_eq!(second_reply.msg_type, MsgType::End);
		assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn drop_runs_hook_once() {
		let service = ServiceCore::new();
		let dropped = Arc::new(AtomicBool::new(false));
		let dropped2 = dropped.clone();
		service
			.expose_droppable_service(vec!["fs".into()], HashMap::new(), Some(Arc::new(move || {
				dropped2.store(true, std::sync::atomic::Ordering::SeqCst);
			})))
			.await;

		let (_conn, _replies, to_service) = spawn_connector(service.clone()).await;
		to_service.send(Envelope::drop_ref(vec!["fs".into()])).unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;

		assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
		assert!(!service.get_original_obj(&["fs".to_string()]).await);
	}

	#[tokio::test]
	async fn cancel_invokes_registered_hook_and_stops_forwarding() {
		let service = ServiceCore::new();
		let cancelled = Arc::new(AtomicBool::new(false));
		let cancelled2 = cancelled.clone();
		let mut methods = HashMap::new();
		methods.insert(
			"subscribe".to_string(),
			Arc::new(move |_body: Option<Vec<u8>>| {
				let cancelled = cancelled2.clone();
				Box::pin(async move {
					let (tx, rx) = mpsc::unbounded_channel();
					// never sends an item and never closes on its own; only the
					// cancel hook releases it
					std::mem::forget(tx);
					let hook: CancelHook = Arc::new(move || {
						cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
					});
					CallOutcome::Stream(rx, Some(hook))
				}) as BoxFuture<'static, CallOutcome>
			}) as Method,
		);
		service.expose_droppable_service(vec!["fs".into()], methods, None).await;

		let (_conn, mut replies, to_service) = spawn_connector(service).await;
		to_service.send(Envelope::start(7, vec!["fs".into(), "subscribe".into()], None)).unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;
		to_service.send(Envelope::cancel(7)).unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;

		assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
		assert!(replies.try_recv().is_err());
	}

	#[tokio::test]
	async fn list_obj_returns_registered_method_names() {
		let service = ServiceCore::new();
		let mut methods = HashMap::new();
		methods.insert("echo".to_string(), echo_method());
		service.expose_droppable_service(vec!["fs".into()], methods, None).await;

		let (_conn, mut replies, to_service) = spawn_connector(service).await;
		to_service.send(Envelope::list_obj(1, vec!["fs".into()])).unwrap();

		let reply = replies.recv().await.unwrap();
		assert_eq!(reply.msg_type, MsgType::End);
		let names: Vec<String> = serde_json::from_slice(&reply.body.unwrap()).unwrap();
		assert_eq!(names, vec!["echo".to_string()]);
	}
}
