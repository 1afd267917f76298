//! Byte-range utilities (spec module A): big-endian integer packing and
//! byte-equality helpers used throughout the version file codec and the
//! IPC envelope codec.

/// Encode a `u32` as 4 big-endian bytes, as used for segment-chunk lengths.
pub fn encode_u32_be(v: u32) -> [u8; 4] {
	v.to_be_bytes()
}

/// Decode 4 big-endian bytes into a `u32`. Panics if `buf` is shorter than 4
/// bytes; callers are expected to have already validated lengths against the
/// version-file layout they parsed.
pub fn decode_u32_be(buf: &[u8]) -> u32 {
	let mut a = [0u8; 4];
	a.copy_from_slice(&buf[..4]);
	u32::from_be_bytes(a)
}

/// Encode a `u64` as 8 big-endian bytes, as used for offsets and the
/// version-file layout-offset field.
pub fn encode_u64_be(v: u64) -> [u8; 8] {
	v.to_be_bytes()
}

/// Decode 8 big-endian bytes into a `u64`.
pub fn decode_u64_be(buf: &[u8]) -> u64 {
	let mut a = [0u8; 8];
	a.copy_from_slice(&buf[..8]);
	u64::from_be_bytes(a)
}

/// Constant-shape byte equality (no short-circuit on length differences
/// beyond the obvious, no early-out on content — used for magic-prefix and
/// id comparisons where we don't need side-channel resistance but do want a
/// single obvious implementation everywhere instead of ad-hoc `==`).
pub fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
	a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn be_roundtrip() {
		assert_eq!(decode_u32_be(&encode_u32_be(0x01020304)), 0x01020304);
		assert_eq!(decode_u64_be(&encode_u64_be(0x0102030405060708)), 0x0102030405060708);
	}

	#[test]
	fn bytes_eq_basic() {
		assert!(bytes_eq(b"1xsp", b"1xsp"));
		assert!(!bytes_eq(b"1xsp", b"1xsq"));
		assert!(!bytes_eq(b"1xsp", b"1xs"));
	}
}
