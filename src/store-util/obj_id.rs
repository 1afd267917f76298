//! Object identity (spec §3): an object id is either absent (the
//! distinguished root object) or a URL-safe base64 string long enough to
//! split into `num_of_splits` shards but short enough to have come from a
//! nonce of the configured byte length.

use base64::Engine;
use rand::RngCore;

/// Path section used for the root object inside the access bucket.
pub const ROOT_SECTION: &str = "=root=";

/// An object id, as passed across the IPC boundary and used to address the
/// on-disk object folder tree. `None` denotes the root object.
pub type ObjId = Option<String>;

/// Validate an object id string against the length bounds in spec §3:
/// `num_of_splits * chars_in_split <= len < floor(4/3 * nonce_byte_length)`.
pub fn validate(id: &str, num_of_splits: usize, chars_in_split: usize, nonce_byte_length: usize) -> bool {
	let min_len = num_of_splits * chars_in_split;
	let max_len = (4 * nonce_byte_length) / 3;
	if id.len() < min_len || id.len() >= max_len {
		return false;
	}
	base64::engine::general_purpose::URL_SAFE_NO_PAD
		.decode(id)
		.is_ok()
}

/// Generate a fresh object id from `nonce_byte_length` random bytes,
/// URL-safe base64 encoded without padding.
pub fn new_obj_id(nonce_byte_length: usize) -> String {
	let mut nonce = vec![0u8; nonce_byte_length];
	rand::thread_rng().fill_bytes(&mut nonce);
	base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce)
}

/// Split an object id into its shard path sections: `s` fixed-width
/// sections of `c` characters each, followed by the remainder as the leaf
/// section. Returns `None` for the root object (callers should use
/// [`ROOT_SECTION`] instead).
pub fn split_shards(id: &str, num_of_splits: usize, chars_in_split: usize) -> Vec<String> {
	let mut sections = Vec::with_capacity(num_of_splits + 1);
	let bytes = id.as_bytes();
	let mut pos = 0;
	for _ in 0..num_of_splits {
		let end = pos + chars_in_split;
		sections.push(String::from_utf8_lossy(&bytes[pos..end]).into_owned());
		pos = end;
	}
	sections.push(String::from_utf8_lossy(&bytes[pos..]).into_owned());
	sections
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn split_basic() {
		let sections = split_shards("abcdefgh", 2, 2);
		assert_eq!(sections, vec!["ab", "cd", "efgh"]);
	}

	#[test]
	fn new_obj_id_is_valid_and_unique() {
		let a = new_obj_id(24);
		let b = new_obj_id(24);
		assert_ne!(a, b);
		assert!(validate(&a, 2, 2, 24));
	}

	#[test]
	fn validate_bounds() {
		// num_of_splits=2, chars_in_split=2 => min_len 4; nonce_byte_length=24 => max_len 32
		assert!(!validate("abc", 2, 2, 24));
		assert!(validate("abcdefghijklmnop", 2, 2, 24));
		assert!(!validate(&"a".repeat(32), 2, 2, 24));
	}
}
