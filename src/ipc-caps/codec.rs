//! Shared request/reply plumbing for capability bindings: every capability
//! method is a JSON-encoded request in, JSON-encoded reply (or opaque error
//! body) out, riding inside an envelope's opaque body. Each binding module
//! only needs to define its request/reply shapes and wire them through
//! [`call_json`] (caller side) and [`json_method`] (exposer side).
//!
//! Grounded on the teacher's `garage_api::s3` handlers (a fixed request
//! struct decoded from the wire, dispatched to a plain async function,
//! re-encoded on the way out), replacing XML/HTTP framing with JSON over an
//! IPC envelope body since there is no HTTP surface here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use ipc_core::client::ClientCore;
use ipc_core::service::{CallOutcome, Method};
use store_util::error::{Error, IpcError};

/// Issue a promise call at `path` with a JSON-encoded `req`, decoding the
/// reply as `Rep`. Used by every capability's caller-side constructor.
pub async fn call_json<Req, Rep>(client: &ClientCore, path: Vec<String>, req: &Req) -> Result<Rep, Error>
where
	Req: Serialize,
	Rep: DeserializeOwned,
{
	let body = serde_json::to_vec(req)?;
	let reply = client.call_promise(path, Some(body)).await?;
	let bytes = reply.ok_or(Error::Ipc(IpcError::MissingBodyBytes))?;
	serde_json::from_slice(&bytes).map_err(Error::from)
}

/// Issue a promise call at `path` with no request body, decoding the reply
/// as `Rep`.
pub async fn call_json_no_args<Rep>(client: &ClientCore, path: Vec<String>) -> Result<Rep, Error>
where
	Rep: DeserializeOwned,
{
	let reply = client.call_promise(path, None).await?;
	let bytes = reply.ok_or(Error::Ipc(IpcError::MissingBodyBytes))?;
	serde_json::from_slice(&bytes).map_err(Error::from)
}

/// Wrap a `Fn(Req) -> Future<Output = Result<Rep, Error>>` into a
/// [`Method`] that decodes its JSON request body and encodes its reply (or
/// error) the same way `call_json` expects.
pub fn json_method<Req, Rep, F, Fut>(handler: F) -> Method
where
	Req: DeserializeOwned + Send + 'static,
	Rep: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Rep, Error>> + Send + 'static,
{
	let handler = Arc::new(handler);
	Arc::new(move |body: Option<Vec<u8>>| {
		let handler = handler.clone();
		Box::pin(async move {
			let decoded: Result<Req, Error> = body
				.ok_or(Error::Ipc(IpcError::MissingBodyBytes))
				.and_then(|b| serde_json::from_slice(&b).map_err(Error::from));
			match decoded {
				Ok(req) => reply_of(handler(req).await),
				Err(e) => CallOutcome::Reply(Err(error_body(&e))),
			}
		}) as Pin<Box<dyn Future<Output = CallOutcome> + Send>>
	})
}

/// As [`json_method`], but for a handler taking no request body (the
/// envelope body is ignored).
pub fn json_method_no_args<Rep, F, Fut>(handler: F) -> Method
where
	Rep: Serialize + Send + 'static,
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Rep, Error>> + Send + 'static,
{
	let handler = Arc::new(handler);
	Arc::new(move |_body: Option<Vec<u8>>| {
		let handler = handler.clone();
		Box::pin(async move { reply_of(handler().await) }) as Pin<Box<dyn Future<Output = CallOutcome> + Send>>
	})
}

fn reply_of<Rep: Serialize>(result: Result<Rep, Error>) -> CallOutcome {
	match result {
		Ok(rep) => match serde_json::to_vec(&rep) {
			Ok(bytes) => CallOutcome::Reply(Ok(Some(bytes))),
			Err(e) => CallOutcome::Reply(Err(error_body(&Error::from(e)))),
		},
		Err(e) => CallOutcome::Reply(Err(error_body(&e))),
	}
}

/// Encode an [`Error`] as the JSON error body convention used across the
/// capability surface: `{"message": "<display>"}`.
pub fn error_body(err: &Error) -> Vec<u8> {
	serde_json::json!({ "message": err.to_string() }).to_string().into_bytes()
}

/// Decode an error body produced by [`error_body`] back into an [`Error`].
pub fn decode_error_body(body: &[u8]) -> Error {
	serde_json::from_slice::<serde_json::Value>(body)
		.ok()
		.and_then(|v| v.get("message").and_then(|m| m.as_str()).map(|s| s.to_string()))
		.map(Error::message)
		.unwrap_or_else(|| Error::message(String::from_utf8_lossy(body).into_owned()))
}
