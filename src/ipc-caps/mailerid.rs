//! MailerId capability (spec module L): the IPC contract shape for
//! identity login, not the cryptography behind it. Actual key signing and
//! session negotiation are an external collaborator's concern (see the
//! module-level "out of scope" note in the crate root); this binding only
//! carries the request/reply shapes a sandboxed caller and a real signer
//! would agree on across the connector.
//!
//! Grounded on [`crate::codec`]'s JSON request/reply convention, same as
//! every other capability in this crate.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ipc_core::client::ClientCore;
use ipc_core::service::{Method, ServiceCore};
use store_util::error::Error;

use crate::codec::{call_json, json_method};

#[derive(Serialize, Deserialize)]
struct LoginReq {
	address: String,
}
#[derive(Serialize, Deserialize)]
struct LoginRep {
	#[serde(rename = "userId")]
	user_id: String,
}
#[derive(Serialize, Deserialize)]
struct SignReq {
	#[serde(rename = "challengeB64")]
	challenge_b64: String,
}
#[derive(Serialize, Deserialize)]
struct SignRep {
	#[serde(rename = "signatureB64")]
	signature_b64: String,
}

/// What a real MailerId provider implements; this crate carries only the
/// shape, so tests exercise it against a stub.
#[async_trait::async_trait]
pub trait MailerIdProvider: Send + Sync {
	async fn login(&self, address: &str) -> Result<String, Error>;
	async fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>, Error>;
}

pub async fn expose_mailerid(service: &Arc<ServiceCore>, path: Vec<String>, provider: Arc<dyn MailerIdProvider>) {
	let mut methods: StdHashMap<String, Method> = StdHashMap::new();

	let p = provider.clone();
	methods.insert(
		"login".to_string(),
		json_method(move |req: LoginReq| {
			let p = p.clone();
			async move { p.login(&req.address).await.map(|user_id| LoginRep { user_id }) }
		}),
	);

	let p = provider.clone();
	methods.insert(
		"signChallenge".to_string(),
		json_method(move |req: SignReq| {
			let p = p.clone();
			async move {
				use base64::Engine;
				let challenge = base64::engine::general_purpose::STANDARD
					.decode(&req.challenge_b64)
					.map_err(|e| Error::message(e.to_string()))?;
				let sig = p.sign_challenge(&challenge).await?;
				Ok(SignRep {
					signature_b64: base64::engine::general_purpose::STANDARD.encode(sig),
				})
			}
		}),
	);

	service.expose_droppable_service(path, methods, None).await;
}

pub struct MailerIdCaller {
	client: Arc<ClientCore>,
	path: Vec<String>,
}

impl MailerIdCaller {
	pub fn new(client: Arc<ClientCore>, path: Vec<String>) -> Self {
		Self { client, path }
	}

	fn method(&self, name: &str) -> Vec<String> {
		let mut p = self.path.clone();
		p.push(name.to_string());
		p
	}

	pub async fn login(&self, address: &str) -> Result<String, Error> {
		let rep: LoginRep = call_json(
			&self.client,
			self.method("login"),
			&LoginReq { address: address.to_string() },
		)
		.await?;
		Ok(rep.user_id)
	}

	pub async fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
		use base64::Engine;
		let challenge_b64 = base64::engine::general_purpose::STANDARD.encode(challenge);
		let rep: SignRep = call_json(&self.client, self.method("signChallenge"), &SignReq { challenge_b64 }).await?;
		base64::engine::general_purpose::STANDARD
			.decode(&rep.signature_b64)
			.map_err(|e| Error::message(e.to_string()))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use ipc_core::connector::Connector;

	struct StubProvider;

	#[async_trait::async_trait]
	impl MailerIdProvider for StubProvider {
		async fn login(&self, address: &str) -> Result<String, Error> {
			Ok(format!("uid:{}", address))
		}
		async fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
			Ok(challenge.iter().rev().cloned().collect())
		}
	}

	#[tokio::test]
	async fn login_and_sign_roundtrip() {
		let service = ServiceCore::new();
		expose_mailerid(&service, vec!["mid".into()], Arc::new(StubProvider)).await;

		let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
		let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
		let client = ClientCore::new(a_tx.clone());
		let _c = Connector::spawn(a_tx, b_rx, Some(client.clone()), None);
		let _s = Connector::spawn(b_tx, a_rx, None, Some(service));

		let caller = MailerIdCaller::new(client, vec!["mid".into()]);
		assert_eq!(caller.login("alice@example.com").await.unwrap(), "uid:alice@example.com");
		let sig = caller.sign_challenge(b"abc").await.unwrap();
		assert_eq!(sig, b"cba");
	}
}
