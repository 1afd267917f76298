//! Integration coverage for spec.md §8's IPC duplicate-id retry scenario
//! (S4): a service that rejects a client's call with `duplicateFnCallNum`
//! causes the client to transparently retry under a fresh call number, and
//! the retry's single result is the one the caller sees.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use ipc_core::client::ClientCore;
use ipc_core::connector::{ClientSide, Connector, ServiceSide};
use ipc_core::envelope::Envelope;
use ipc_core::service::{CallOutcome, Method, ServiceCore};

/// Rejects the first `start` it sees as a duplicate call-number collision,
/// then delegates every subsequent dispatch to a real `ServiceCore`. Models
/// "service configured to reject every fn_call_num it was first assigned"
/// without needing to predict the client's internal counter.
struct RejectOnceThenDelegate {
	inner: Arc<ServiceCore>,
	rejected: AtomicBool,
}

#[async_trait::async_trait]
impl ServiceSide for RejectOnceThenDelegate {
	async fn process_call_start(
		self: Arc<Self>,
		conn: Arc<Connector>,
		fn_call_num: u32,
		path: Vec<String>,
		body: Option<Vec<u8>>,
	) {
		if !self.rejected.swap(true, Ordering::SeqCst) {
			let _ = conn
				.send_envelope(Envelope::error(Some(fn_call_num), br#"{"duplicateFnCallNum":true}"#.to_vec()))
				.await;
			return;
		}
		self.inner.clone().process_call_start(conn, fn_call_num, path, body).await;
	}

	async fn process_cancellation(&self, fn_call_num: u32) {
		self.inner.process_cancellation(fn_call_num).await;
	}

	async fn list_methods(&self, path: &[String]) -> Vec<String> {
		self.inner.list_methods(path).await
	}

	async fn process_drop(&self, path: &[String]) {
		self.inner.process_drop(path).await;
	}

	async fn on_stop(&self, connector_stop: bool) {
		self.inner.on_stop(connector_stop).await;
	}
}

fn reply_with_body() -> Method {
	Arc::new(|body: Option<Vec<u8>>| {
		Box::pin(async move { CallOutcome::Reply(Ok(body)) }) as std::pin::Pin<Box<dyn std::future::Future<Output = CallOutcome> + Send>>
	})
}

#[tokio::test]
async fn s4_duplicate_fn_call_num_triggers_one_transparent_retry() {
	let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
	let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
	let (client_conn_outbound, _unused) = mpsc::unbounded_channel();

	let service_core = ServiceCore::new();
	let mut methods = std::collections::HashMap::new();
	methods.insert("get".to_string(), reply_with_body());
	service_core.expose_droppable_service(vec!["fs".into()], methods, None).await;
	let service = Arc::new(RejectOnceThenDelegate {
		inner: service_core,
		rejected: AtomicBool::new(false),
	});
	Connector::spawn(s2c_tx, c2s_rx, None, Some(service));

	let client = ClientCore::new(c2s_tx);
	Connector::spawn(client_conn_outbound, s2c_rx, Some(client.clone()), None);

	let result = client.call_promise(vec!["fs".into(), "get".into()], Some(b"hi".to_vec())).await.unwrap();
	assert_eq!(result, Some(b"hi".to_vec()));
}
