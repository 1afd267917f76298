//! IPC envelope codec (spec module H): the fixed small header plus opaque
//! body that rides over the single bidirectional message channel.
//!
//! Grounded on the teacher's `Endpoint`/message-kind framing in
//! `garage_rpc::system` (a small enumerated kind plus an opaque payload),
//! adapted from netapp's peer-to-peer wire format to an in-process,
//! length-prefixed binary encoding since there is no network transport
//! here — only a local duplex channel.

use store_util::data::{decode_u32_be, encode_u32_be};
use store_util::error::{Error, IpcError};

/// Discriminant for an envelope's purpose (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
	Start,
	Cancel,
	Drop,
	ListObj,
	Interim,
	End,
	Error,
}

impl MsgType {
	fn to_byte(self) -> u8 {
		match self {
			MsgType::Start => 0,
			MsgType::Cancel => 1,
			MsgType::Drop => 2,
			MsgType::ListObj => 3,
			MsgType::Interim => 4,
			MsgType::End => 5,
			MsgType::Error => 6,
		}
	}

	fn from_byte(b: u8) -> Option<Self> {
		Some(match b {
			0 => MsgType::Start,
			1 => MsgType::Cancel,
			2 => MsgType::Drop,
			3 => MsgType::ListObj,
			4 => MsgType::Interim,
			5 => MsgType::End,
			6 => MsgType::Error,
			_ => return None,
		})
	}
}

const FLAG_FN_CALL_NUM: u8 = 1 << 0;
const FLAG_PATH: u8 = 1 << 1;
const FLAG_BODY: u8 = 1 << 2;

/// One IPC message: headers plus an optional opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
	pub msg_type: MsgType,
	pub fn_call_num: Option<u32>,
	pub path: Option<Vec<String>>,
	pub body: Option<Vec<u8>>,
}

impl Envelope {
	pub fn start(fn_call_num: u32, path: Vec<String>, body: Option<Vec<u8>>) -> Self {
		Envelope {
			msg_type: MsgType::Start,
			fn_call_num: Some(fn_call_num),
			path: Some(path),
			body,
		}
	}

	pub fn cancel(fn_call_num: u32) -> Self {
		Envelope {
			msg_type: MsgType::Cancel,
			fn_call_num: Some(fn_call_num),
			path: None,
			body: None,
		}
	}

	pub fn drop_ref(path: Vec<String>) -> Self {
		Envelope {
			msg_type: MsgType::Drop,
			fn_call_num: None,
			path: Some(path),
			body: None,
		}
	}

	pub fn list_obj(fn_call_num: u32, path: Vec<String>) -> Self {
		Envelope {
			msg_type: MsgType::ListObj,
			fn_call_num: Some(fn_call_num),
			path: Some(path),
			body: None,
		}
	}

	pub fn interim(fn_call_num: u32, body: Option<Vec<u8>>) -> Self {
		Envelope {
			msg_type: MsgType::Interim,
			fn_call_num: Some(fn_call_num),
			path: None,
			body,
		}
	}

	pub fn end(fn_call_num: u32, body: Option<Vec<u8>>) -> Self {
		Envelope {
			msg_type: MsgType::End,
			fn_call_num: Some(fn_call_num),
			path: None,
			body,
		}
	}

	pub fn error(fn_call_num: Option<u32>, body: Vec<u8>) -> Self {
		Envelope {
			msg_type: MsgType::Error,
			fn_call_num,
			path: None,
			body: Some(body),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut flag = 0u8;
		if self.fn_call_num.is_some() {
			flag |= FLAG_FN_CALL_NUM;
		}
		if self.path.is_some() {
			flag |= FLAG_PATH;
		}
		if self.body.is_some() {
			flag |= FLAG_BODY;
		}

		let mut out = vec![self.msg_type.to_byte(), flag];
		if let Some(n) = self.fn_call_num {
			out.extend_from_slice(&encode_u32_be(n));
		}
		if let Some(path) = &self.path {
			out.extend_from_slice(&encode_u32_be(path.len() as u32));
			for seg in path {
				let bytes = seg.as_bytes();
				out.extend_from_slice(&encode_u32_be(bytes.len() as u32));
				out.extend_from_slice(bytes);
			}
		}
		if let Some(body) = &self.body {
			out.extend_from_slice(&encode_u32_be(body.len() as u32));
			out.extend_from_slice(body);
		}
		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self, Error> {
		let mut pos = 0usize;
		let msg_type = MsgType::from_byte(*buf.get(pos).ok_or_else(|| ipc_err("empty envelope"))?)
			.ok_or_else(|| Error::Ipc(IpcError::InvalidType))?;
		pos += 1;
		let flag = *buf.get(pos).ok_or_else(|| ipc_err("truncated flag byte"))?;
		pos += 1;

		let fn_call_num = if flag & FLAG_FN_CALL_NUM != 0 {
			Some(read_u32(buf, &mut pos)?)
		} else {
			None
		};

		let path = if flag & FLAG_PATH != 0 {
			let count = read_u32(buf, &mut pos)? as usize;
			let mut segs = Vec::with_capacity(count);
			for _ in 0..count {
				let len = read_u32(buf, &mut pos)? as usize;
				let bytes = buf
					.get(pos..pos + len)
					.ok_or_else(|| ipc_err("truncated path segment"))?;
				segs.push(String::from_utf8_lossy(bytes).into_owned());
				pos += len;
			}
			Some(segs)
		} else {
			None
		};

		let body = if flag & FLAG_BODY != 0 {
			let len = read_u32(buf, &mut pos)? as usize;
			let bytes = buf.get(pos..pos + len).ok_or_else(|| ipc_err("truncated body"))?;
			pos += len;
			Some(bytes.to_vec())
		} else {
			None
		};

		let _ = pos;
		Ok(Envelope {
			msg_type,
			fn_call_num,
			path,
			body,
		})
	}
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, Error> {
	let bytes = buf.get(*pos..*pos + 4).ok_or_else(|| ipc_err("truncated u32 field"))?;
	let v = decode_u32_be(bytes);
	*pos += 4;
	Ok(v)
}

fn ipc_err(msg: &str) -> Error {
	Error::message(format!("envelope decode error: {}", msg))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn roundtrip_start_with_path_and_body() {
		let env = Envelope::start(7, vec!["fs".into(), "readFile".into()], Some(b"abc".to_vec()));
		let bytes = env.encode();
		let decoded = Envelope::decode(&bytes).unwrap();
		assert_eq!(env, decoded);
	}

	#[test]
	fn roundtrip_cancel_without_path_or_body() {
		let env = Envelope::cancel(42);
		let decoded = Envelope::decode(&env.encode()).unwrap();
		assert_eq!(env, decoded);
	}

	#[test]
	fn rejects_unknown_msg_type() {
		let bytes = vec![255u8, 0u8];
		assert!(Envelope::decode(&bytes).is_err());
	}
}
