//! On-disk version file format (spec module B): one file per stored version
//! of one object. Front-to-back: a 4-byte magic, an 8-byte layout-offset
//! field, an interleaved payload region (header bytes and segment chunks,
//! written in whatever order callers choose), and a trailer at
//! `layout_offset` describing how to reassemble the payload.
//!
//! Grounded on the atomic write-then-rename-then-fsync discipline
//! `BlockManagerLocked::write_block` uses to persist a block, adapted here
//! to an in-place trailer rewrite instead of a whole-file replace, and on
//! the single-writer `Mutex<...Locked>` pattern `BlockManager` uses to
//! serialize mutations on a shared handle.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use store_util::data::{decode_u32_be, decode_u64_be, encode_u32_be, encode_u64_be};
use store_util::error::{Error, StorageError};

const MAGIC: &[u8; 4] = b"1xsp";
const HEADER_LEN: u64 = 4 + 8; // magic + layout_offset field

// ---- Layout descriptor ----

const FLAG_HEADER_PRESENT: u8 = 1 << 0;
const FLAG_BASE_PRESENT: u8 = 1 << 1;
const FLAG_SEGMENTS_FROZEN: u8 = 1 << 2;
const FLAG_TOTAL_SIZE_UNKNOWN: u8 = 1 << 3;
const FLAG_FILE_COMPLETE: u8 = 1 << 4;
const FLAG_ALL_BASE_RESIDENT: u8 = 1 << 5;

const SEG_FLAG_ENDLESS: u8 = 1 << 0;
const SEG_FLAG_FILE_OFFSET_PRESENT: u8 = 1 << 1;
const SEG_FLAG_BASE_OFFSET_PRESENT: u8 = 1 << 2;

/// Descriptor for one chunk of the version's logical byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentChunk {
	/// Known-length range of new bytes, not yet resident in this file.
	New { this_ver_ofs: u64, length: u64 },
	/// Unknown-length tail of new bytes, not yet resident. At most one,
	/// and only as the final chunk.
	NewEndless { this_ver_ofs: u64 },
	/// New bytes, resident at `file_offset` in this file.
	NewOnDisk {
		this_ver_ofs: u64,
		length: u64,
		file_offset: u64,
	},
	/// A reference into the base version's logical byte stream, not yet
	/// copied into this file.
	Base {
		this_ver_ofs: u64,
		length: u64,
		base_ver_ofs: u64,
	},
	/// Bytes copied in from the base version, resident at `file_offset`.
	BaseOnDisk {
		this_ver_ofs: u64,
		length: u64,
		file_offset: u64,
		base_ver_ofs: u64,
	},
}

impl SegmentChunk {
	pub fn this_ver_ofs(&self) -> u64 {
		match *self {
			SegmentChunk::New { this_ver_ofs, .. }
			| SegmentChunk::NewEndless { this_ver_ofs }
			| SegmentChunk::NewOnDisk { this_ver_ofs, .. }
			| SegmentChunk::Base { this_ver_ofs, .. }
			| SegmentChunk::BaseOnDisk { this_ver_ofs, .. } => this_ver_ofs,
		}
	}

	/// `None` only for the endless tail chunk.
	pub fn length(&self) -> Option<u64> {
		match *self {
			SegmentChunk::New { length, .. }
			| SegmentChunk::NewOnDisk { length, .. }
			| SegmentChunk::Base { length, .. }
			| SegmentChunk::BaseOnDisk { length, .. } => Some(length),
			SegmentChunk::NewEndless { .. } => None,
		}
	}

	pub fn is_resident(&self) -> bool {
		matches!(
			self,
			SegmentChunk::NewOnDisk { .. } | SegmentChunk::BaseOnDisk { .. }
		)
	}

	pub fn is_endless(&self) -> bool {
		matches!(self, SegmentChunk::NewEndless { .. })
	}

	pub fn file_offset(&self) -> Option<u64> {
		match *self {
			SegmentChunk::NewOnDisk { file_offset, .. }
			| SegmentChunk::BaseOnDisk { file_offset, .. } => Some(file_offset),
			_ => None,
		}
	}

	pub fn base_ver_ofs(&self) -> Option<u64> {
		match *self {
			SegmentChunk::Base { base_ver_ofs, .. } | SegmentChunk::BaseOnDisk { base_ver_ofs, .. } => {
				Some(base_ver_ofs)
			}
			_ => None,
		}
	}

	fn encode(&self, out: &mut Vec<u8>) {
		let mut flag = 0u8;
		if self.is_endless() {
			flag |= SEG_FLAG_ENDLESS;
		}
		if self.file_offset().is_some() {
			flag |= SEG_FLAG_FILE_OFFSET_PRESENT;
		}
		if self.base_ver_ofs().is_some() {
			flag |= SEG_FLAG_BASE_OFFSET_PRESENT;
		}
		out.push(flag);
		out.extend_from_slice(&encode_u64_be(self.this_ver_ofs()));
		if let Some(len) = self.length() {
			out.extend_from_slice(&encode_u64_be(len));
		}
		if let Some(ofs) = self.file_offset() {
			out.extend_from_slice(&encode_u64_be(ofs));
		}
		if let Some(ofs) = self.base_ver_ofs() {
			out.extend_from_slice(&encode_u64_be(ofs));
		}
	}

	fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, String> {
		let flag = *buf.get(*pos).ok_or("truncated segment record")?;
		*pos += 1;
		let endless = flag & SEG_FLAG_ENDLESS != 0;
		let file_offset_present = flag & SEG_FLAG_FILE_OFFSET_PRESENT != 0;
		let base_offset_present = flag & SEG_FLAG_BASE_OFFSET_PRESENT != 0;

		let this_ver_ofs = read_u64(buf, pos)?;
		let length = if endless { None } else { Some(read_u64(buf, pos)?) };
		let file_offset = if file_offset_present {
			Some(read_u64(buf, pos)?)
		} else {
			None
		};
		let base_ver_ofs = if base_offset_present {
			Some(read_u64(buf, pos)?)
		} else {
			None
		};

		Ok(match (length, file_offset, base_ver_ofs) {
			(None, None, None) => SegmentChunk::NewEndless { this_ver_ofs },
			(Some(length), None, None) => SegmentChunk::New { this_ver_ofs, length },
			(Some(length), Some(file_offset), None) => SegmentChunk::NewOnDisk {
				this_ver_ofs,
				length,
				file_offset,
			},
			(Some(length), None, Some(base_ver_ofs)) => SegmentChunk::Base {
				this_ver_ofs,
				length,
				base_ver_ofs,
			},
			(Some(length), Some(file_offset), Some(base_ver_ofs)) => SegmentChunk::BaseOnDisk {
				this_ver_ofs,
				length,
				file_offset,
				base_ver_ofs,
			},
			(None, Some(_), _) | (None, _, Some(_)) => {
				return Err("endless chunk cannot be resident or base-referencing".into())
			}
		})
	}
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, String> {
	if *pos + 8 > buf.len() {
		return Err("truncated u64 field".into());
	}
	let v = decode_u64_be(&buf[*pos..*pos + 8]);
	*pos += 8;
	Ok(v)
}

/// A header chunk record: length and file offset of the resident header
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderChunk {
	pub length: u32,
	pub file_offset: u64,
}

/// The layout descriptor: the trailer's parsed form.
#[derive(Debug, Clone, Default)]
pub struct Layout {
	pub base_version: Option<u64>,
	pub header_chunk: Option<HeaderChunk>,
	pub segments: Vec<SegmentChunk>,
	pub segments_layout_frozen: bool,
	pub total_size_unknown: bool,
	pub file_complete: bool,
	pub all_base_bytes_resident: bool,
}

impl Layout {
	fn encode(&self) -> Vec<u8> {
		let mut flag = 0u8;
		if self.header_chunk.is_some() {
			flag |= FLAG_HEADER_PRESENT;
		}
		if self.base_version.is_some() {
			flag |= FLAG_BASE_PRESENT;
		}
		if self.segments_layout_frozen {
			flag |= FLAG_SEGMENTS_FROZEN;
		}
		if self.total_size_unknown {
			flag |= FLAG_TOTAL_SIZE_UNKNOWN;
		}
		if self.file_complete {
			flag |= FLAG_FILE_COMPLETE;
		}
		if self.all_base_bytes_resident {
			flag |= FLAG_ALL_BASE_RESIDENT;
		}

		let mut body = vec![flag];
		if let Some(base) = self.base_version {
			body.extend_from_slice(&encode_u64_be(base));
		}
		if let Some(h) = &self.header_chunk {
			body.extend_from_slice(&encode_u32_be(h.length));
			body.extend_from_slice(&encode_u64_be(h.file_offset));
		}
		for seg in &self.segments {
			seg.encode(&mut body);
		}

		// Trailer is framed by its own length so a reader never needs to
		// trust the file's current EOF, which may carry garbage left over
		// from an interrupted write that appended past the old trailer
		// but crashed before the layout-offset field was updated to point
		// at it (see the crash-recovery scenario for absorb_base).
		let mut out = Vec::with_capacity(4 + body.len());
		out.extend_from_slice(&encode_u32_be(body.len() as u32));
		out.extend_from_slice(&body);
		out
	}

	fn decode(buf: &[u8]) -> Result<Self, String> {
		if buf.len() < 4 {
			return Err("truncated trailer length prefix".into());
		}
		let trailer_len = decode_u32_be(&buf[0..4]) as usize;
		let body = buf
			.get(4..4 + trailer_len)
			.ok_or("trailer shorter than declared length")?;

		let mut pos = 0;
		let flag = *body.get(pos).ok_or("empty trailer body")?;
		pos += 1;

		let base_version = if flag & FLAG_BASE_PRESENT != 0 {
			Some(read_u64(body, &mut pos)?)
		} else {
			None
		};

		let header_chunk = if flag & FLAG_HEADER_PRESENT != 0 {
			if pos + 4 > body.len() {
				return Err("truncated header chunk length".into());
			}
			let length = decode_u32_be(&body[pos..pos + 4]);
			pos += 4;
			let file_offset = read_u64(body, &mut pos)?;
			Some(HeaderChunk { length, file_offset })
		} else {
			None
		};

		let mut segments = Vec::new();
		while pos < body.len() {
			segments.push(SegmentChunk::decode(body, &mut pos)?);
		}

		Ok(Layout {
			base_version,
			header_chunk,
			segments,
			segments_layout_frozen: flag & FLAG_SEGMENTS_FROZEN != 0,
			total_size_unknown: flag & FLAG_TOTAL_SIZE_UNKNOWN != 0,
			file_complete: flag & FLAG_FILE_COMPLETE != 0,
			all_base_bytes_resident: flag & FLAG_ALL_BASE_RESIDENT != 0,
		})
	}

	/// Validate that segment chunks cover `[0, total_size)` with no gaps
	/// or overlaps, and that at most one endless chunk exists, only as the
	/// tail. This is stricter than the format the spec was distilled from
	/// (open question (b)): we reject malformed layouts outright rather
	/// than tolerate them.
	pub fn validate_coverage(&self) -> Result<(), String> {
		let mut sorted: Vec<&SegmentChunk> = self.segments.iter().collect();
		sorted.sort_by_key(|s| s.this_ver_ofs());

		let mut expected = 0u64;
		for (i, seg) in sorted.iter().enumerate() {
			if seg.this_ver_ofs() != expected {
				return Err(format!(
					"gap or overlap at offset {}, expected {}",
					seg.this_ver_ofs(),
					expected
				));
			}
			match seg.length() {
				Some(len) => expected += len,
				None => {
					if i != sorted.len() - 1 {
						return Err("endless chunk must be the last segment".into());
					}
				}
			}
		}
		Ok(())
	}

	pub fn total_size(&self) -> Option<u64> {
		if self.total_size_unknown {
			return None;
		}
		Some(self.segments.iter().filter_map(|s| s.length()).sum())
	}

	/// Find the index of a frozen placeholder segment exactly matching
	/// `(this_ver_ofs, length)`, used when `save_segs` resolves a write
	/// against an already-frozen layout.
	fn find_placeholder(&self, this_ver_ofs: u64, length: u64) -> Option<usize> {
		self.segments.iter().position(|s| {
			s.this_ver_ofs() == this_ver_ofs
				&& s.length() == Some(length)
				&& !s.is_resident()
		})
	}
}

/// A byte range of new (non-base) data a peer needs to be sent in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffRange {
	pub this_ver_ofs: u64,
	pub length: u64,
}

/// A byte range this version shares with its base, described by offset into
/// the base's logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseRange {
	pub this_ver_ofs: u64,
	pub base_ver_ofs: u64,
	pub length: u64,
}

/// The information needed to explain this version to a peer that already
/// holds `base_version`: which ranges must be sent verbatim (`new_ranges`,
/// in pack order) and which can be reconstructed from the base
/// (`base_ranges`).
#[derive(Debug, Clone)]
pub struct DiffInfo {
	pub base_version: u64,
	pub new_ranges: Vec<DiffRange>,
	pub base_ranges: Vec<BaseRange>,
}

// ---- Handle ----

#[derive(Debug)]
struct WriterState {
	file: File,
	layout: Layout,
	payload_end: u64,
}

/// An open handle on one version file. All mutating operations are
/// serialized through a single internal lock; reads open their own file
/// descriptor and may proceed concurrently with a mutation in flight.
#[derive(Debug)]
pub struct VersionFile {
	path: Mutex<PathBuf>,
	state: Mutex<WriterState>,
}

impl VersionFile {
	/// Exclusively create a new, empty version file. Fails if `path`
	/// already exists.
	pub async fn create_new(path: PathBuf) -> Result<Self, Error> {
		let mut file = OpenOptions::new()
			.create_new(true)
			.read(true)
			.write(true)
			.open(&path)
			.await?;
		file.write_all(MAGIC).await?;
		file.write_all(&encode_u64_be(0)).await?;
		file.sync_all().await?;

		Ok(Self {
			path: Mutex::new(path),
			state: Mutex::new(WriterState {
				file,
				layout: Layout::default(),
				payload_end: HEADER_LEN,
			}),
		})
	}

	/// Open an existing, complete-or-parseable version file, reconstructing
	/// its layout from the trailer.
	pub async fn open_existing(path: PathBuf) -> Result<Self, Error> {
		let mut file = OpenOptions::new().read(true).write(true).open(&path).await?;
		let file_size = file.metadata().await?.len();

		let mut head = [0u8; HEADER_LEN as usize];
		file.read_exact(&mut head).await?;
		if &head[0..4] != MAGIC {
			return Err(parse_err(&path, "bad magic prefix"));
		}
		let layout_offset = decode_u64_be(&head[4..12]);
		if layout_offset == 0 {
			return Err(parse_err(&path, "file left in incomplete state (layout_offset == 0)"));
		}
		if layout_offset >= file_size {
			return Err(parse_err(&path, "layout_offset >= file size"));
		}

		file.seek(SeekFrom::Start(layout_offset)).await?;
		let mut trailer_bytes = vec![0u8; (file_size - layout_offset) as usize];
		file.read_exact(&mut trailer_bytes).await?;

		let layout = Layout::decode(&trailer_bytes).map_err(|e| parse_err(&path, &e))?;
		layout
			.validate_coverage()
			.map_err(|e| parse_err(&path, &e))?;

		Ok(Self {
			path: Mutex::new(path),
			state: Mutex::new(WriterState {
				file,
				layout,
				payload_end: layout_offset,
			}),
		})
	}

	/// Append `bytes` as the header chunk. If `save_layout`, the trailer is
	/// rewritten and the layout-offset field updated atomically.
	pub async fn save_header(&self, bytes: &[u8], save_layout: bool) -> Result<(), Error> {
		let mut st = self.state.lock().await;
		if st.layout.header_chunk.is_some() {
			return Err(Error::message("header already saved for this version"));
		}
		let file_offset = st.payload_end;
		st.file.seek(SeekFrom::Start(file_offset)).await?;
		st.file.write_all(bytes).await?;
		st.payload_end += bytes.len() as u64;
		st.layout.header_chunk = Some(HeaderChunk {
			length: bytes.len() as u32,
			file_offset,
		});
		if save_layout {
			Self::rewrite_trailer(&mut st).await?;
		}
		Ok(())
	}

	/// Append `bytes` as a segment at `this_ver_ofs`, optionally referencing
	/// `base_ver_ofs` into the base version. May be called with
	/// out-of-order `this_ver_ofs` values.
	pub async fn save_segs(
		&self,
		bytes: &[u8],
		this_ver_ofs: u64,
		base_ver_ofs: Option<u64>,
		save_layout: bool,
	) -> Result<(), Error> {
		let mut st = self.state.lock().await;
		let length = bytes.len() as u64;
		let file_offset = st.payload_end;
		st.file.seek(SeekFrom::Start(file_offset)).await?;
		st.file.write_all(bytes).await?;
		st.payload_end += length;

		let resident = match base_ver_ofs {
			Some(base_ver_ofs) => SegmentChunk::BaseOnDisk {
				this_ver_ofs,
				length,
				file_offset,
				base_ver_ofs,
			},
			None => SegmentChunk::NewOnDisk {
				this_ver_ofs,
				length,
				file_offset,
			},
		};

		if st.layout.segments_layout_frozen {
			let idx = st
				.layout
				.find_placeholder(this_ver_ofs, length)
				.ok_or_else(|| Error::message("save_segs: no matching placeholder in frozen layout"))?;
			st.layout.segments[idx] = resident;
		} else {
			st.layout.segments.push(resident);
			if base_ver_ofs.is_some() && st.layout.base_version.is_none() {
				return Err(Error::message("base_ver_ofs given but no base_version set"));
			}
		}

		Self::update_completeness(&mut st.layout);
		if save_layout {
			Self::rewrite_trailer(&mut st).await?;
		}
		Ok(())
	}

	/// Freeze the external segment structure. `base_version` must be
	/// supplied whenever any spec references the base version.
	pub async fn set_segs_layout(
		&self,
		base_version: Option<u64>,
		specs: Vec<(u64, Option<u64>, Option<u64>)>, // (this_ver_ofs, length_or_endless, base_ver_ofs)
		save_layout: bool,
	) -> Result<(), Error> {
		let mut st = self.state.lock().await;
		if st.layout.segments_layout_frozen {
			return Err(Error::message("segments layout already frozen"));
		}

		let mut new_segments = Vec::with_capacity(specs.len());
		for (this_ver_ofs, length, base_ver_ofs) in specs.iter().copied() {
			let existing_resident = length.and_then(|length| {
				st.layout
					.segments
					.iter()
					.find(|s| s.this_ver_ofs() == this_ver_ofs && s.length() == Some(length) && s.is_resident())
					.copied()
			});
			let chunk = match (existing_resident, length, base_ver_ofs) {
				(Some(resident), _, _) => resident,
				(None, None, _) => SegmentChunk::NewEndless { this_ver_ofs },
				(None, Some(length), None) => SegmentChunk::New { this_ver_ofs, length },
				(None, Some(length), Some(base_ver_ofs)) => SegmentChunk::Base {
					this_ver_ofs,
					length,
					base_ver_ofs,
				},
			};
			new_segments.push(chunk);
		}

		let candidate = Layout {
			base_version,
			segments: new_segments,
			segments_layout_frozen: true,
			total_size_unknown: specs.last().map(|s| s.1.is_none()).unwrap_or(false),
			..st.layout.clone()
		};
		candidate
			.validate_coverage()
			.map_err(Error::message)?;

		st.layout = candidate;
		Self::update_completeness(&mut st.layout);
		if save_layout {
			Self::rewrite_trailer(&mut st).await?;
		}
		Ok(())
	}

	/// Copy base-referenced byte ranges from `base_path` into this file,
	/// making it self-contained. Only the bytes the layout actually
	/// requires are copied (invariant B.v).
	pub async fn absorb_base(&self, base_version_number: u64, base_path: &Path) -> Result<(), Error> {
		let base = VersionFile::open_existing(base_path.to_path_buf()).await?;

		let mut st = self.state.lock().await;
		if st.layout.base_version != Some(base_version_number) {
			return Err(Error::message("absorb_base: base_version mismatch"));
		}

		let pending: Vec<usize> = st
			.layout
			.segments
			.iter()
			.enumerate()
			.filter(|(_, s)| matches!(s, SegmentChunk::Base { .. }))
			.map(|(i, _)| i)
			.collect();

		if !pending.is_empty() {
			// `payload_end` still points at the start of the trailer this
			// handle last committed (writes always reclaim the trailer's
			// space on their way to committing a new one). Absorbed bytes
			// must land past that trailer instead, or a crash between
			// writing the new trailer and swinging the layout-offset field
			// would leave the old trailer's bytes clobbered and
			// unrecoverable.
			st.payload_end = st.file.metadata().await?.len();
		}

		for idx in pending {
			let (this_ver_ofs, length, base_ver_ofs) = match st.layout.segments[idx] {
				SegmentChunk::Base {
					this_ver_ofs,
					length,
					base_ver_ofs,
				} => (this_ver_ofs, length, base_ver_ofs),
				_ => unreachable!(),
			};

			let data = base.read_segs_raw(base_ver_ofs, length).await?;

			let file_offset = st.payload_end;
			st.file.seek(SeekFrom::Start(file_offset)).await?;
			st.file.write_all(&data).await?;
			st.file.sync_all().await?;
			st.payload_end += length;

			st.layout.segments[idx] = SegmentChunk::BaseOnDisk {
				this_ver_ofs,
				length,
				file_offset,
				base_ver_ofs,
			};
		}

		Self::update_completeness(&mut st.layout);
		Self::rewrite_trailer(&mut st).await?;
		Ok(())
	}

	fn update_completeness(layout: &mut Layout) {
		let all_segs_resident = layout.segments.iter().all(|s| s.is_resident());
		let no_base_left = !layout
			.segments
			.iter()
			.any(|s| matches!(s, SegmentChunk::Base { .. }));
		layout.all_base_bytes_resident = no_base_left;
		layout.file_complete =
			layout.header_chunk.is_some() && all_segs_resident && !layout.total_size_unknown;
	}

	/// Write a new trailer at the current payload end and atomically swing
	/// the layout-offset field to point at it, then truncate away anything
	/// past the new trailer.
	async fn rewrite_trailer(st: &mut WriterState) -> Result<(), Error> {
		let trailer = st.layout.encode();
		let new_layout_offset = st.payload_end;

		st.file.seek(SeekFrom::Start(new_layout_offset)).await?;
		st.file.write_all(&trailer).await?;
		st.file.sync_all().await?;

		st.file.seek(SeekFrom::Start(4)).await?;
		st.file.write_all(&encode_u64_be(new_layout_offset)).await?;
		st.file.sync_all().await?;

		let new_file_len = new_layout_offset + trailer.len() as u64;
		st.file.set_len(new_file_len).await?;
		Ok(())
	}

	/// Read the header bytes, if resident.
	pub async fn read_header(&self) -> Result<Option<Vec<u8>>, Error> {
		let st = self.state.lock().await;
		let hc = match &st.layout.header_chunk {
			Some(hc) => *hc,
			None => return Ok(None),
		};
		let mut buf = vec![0u8; hc.length as usize];
		let mut f = self.reopen_for_read().await?;
		f.seek(SeekFrom::Start(hc.file_offset)).await?;
		f.read_exact(&mut buf).await?;
		Ok(Some(buf))
	}

	/// Read `len` bytes at `ofs` in this version's logical byte stream.
	/// Fails if any part of the requested span is not resident.
	pub async fn read_segs(&self, ofs: u64, len: u64) -> Result<Vec<u8>, Error> {
		self.read_segs_raw(ofs, len).await
	}

	async fn read_segs_raw(&self, ofs: u64, len: u64) -> Result<Vec<u8>, Error> {
		let segments = {
			let st = self.state.lock().await;
			st.layout.segments.clone()
		};

		let mut out = vec![0u8; len as usize];
		let mut remaining = len;
		let mut cursor = ofs;
		let end = ofs + len;

		let mut f = self.reopen_for_read().await?;

		let mut sorted: Vec<&SegmentChunk> = segments.iter().collect();
		sorted.sort_by_key(|s| s.this_ver_ofs());

		for seg in sorted {
			if remaining == 0 {
				break;
			}
			let seg_start = seg.this_ver_ofs();
			let seg_len = match seg.length() {
				Some(l) => l,
				None => u64::MAX - seg_start,
			};
			let seg_end = seg_start.saturating_add(seg_len);
			if seg_end <= cursor || seg_start >= end {
				continue;
			}
			if !seg.is_resident() {
				return Err(Error::message(format!(
					"read_segs: range [{}, {}) is not resident",
					cursor, end
				)));
			}
			let overlap_start = cursor.max(seg_start);
			let overlap_end = end.min(seg_end);
			let overlap_len = overlap_end - overlap_start;
			let file_offset = seg.file_offset().unwrap() + (overlap_start - seg_start);

			f.seek(SeekFrom::Start(file_offset)).await?;
			let out_start = (overlap_start - ofs) as usize;
			f.read_exact(&mut out[out_start..out_start + overlap_len as usize])
				.await?;

			cursor = overlap_end;
			remaining = end - cursor;
		}

		if remaining != 0 {
			return Err(Error::message("read_segs: requested span not fully covered"));
		}
		Ok(out)
	}

	/// Stream the header bytes into `sink`, if resident.
	pub async fn stream_header_into<W: AsyncWriteExt + Unpin>(&self, sink: &mut W) -> Result<(), Error> {
		match self.read_header().await? {
			Some(bytes) => {
				sink.write_all(&bytes).await?;
				Ok(())
			}
			None => Err(Error::message("stream_header_into: no header saved")),
		}
	}

	/// Stream `len` bytes at `ofs` into `sink`.
	pub async fn stream_segs_into<W: AsyncWriteExt + Unpin>(
		&self,
		sink: &mut W,
		ofs: u64,
		len: u64,
	) -> Result<(), Error> {
		let data = self.read_segs_raw(ofs, len).await?;
		sink.write_all(&data).await?;
		Ok(())
	}

	/// Byte ranges of this version's logical stream not already explained by
	/// `base`, in the order they should be packed for a peer that already
	/// holds `base`.
	pub async fn diff_from_base(&self) -> Result<DiffInfo, Error> {
		let st = self.state.lock().await;
		let base_version = st
			.layout
			.base_version
			.ok_or_else(|| Error::message("diff_from_base: no base version set"))?;

		let mut sorted: Vec<&SegmentChunk> = st.layout.segments.iter().collect();
		sorted.sort_by_key(|s| s.this_ver_ofs());

		let mut new_ranges = Vec::new();
		let mut base_ranges = Vec::new();
		for seg in sorted {
			let ofs = seg.this_ver_ofs();
			match seg {
				SegmentChunk::New { length, .. } | SegmentChunk::NewOnDisk { length, .. } => {
					new_ranges.push(DiffRange {
						this_ver_ofs: ofs,
						length: *length,
					});
				}
				SegmentChunk::NewEndless { .. } => {
					return Err(Error::message("diff_from_base: version not yet complete"));
				}
				SegmentChunk::Base {
					length, base_ver_ofs, ..
				}
				| SegmentChunk::BaseOnDisk {
					length, base_ver_ofs, ..
				} => {
					base_ranges.push(BaseRange {
						this_ver_ofs: ofs,
						base_ver_ofs: *base_ver_ofs,
						length: *length,
					});
				}
			}
		}

		Ok(DiffInfo {
			base_version,
			new_ranges,
			base_ranges,
		})
	}

	async fn reopen_for_read(&self) -> Result<File, Error> {
		let path = self.path.lock().await.clone();
		match File::open(&path).await {
			Ok(f) => Ok(f),
			Err(_) => {
				// A concurrent move_file may have renamed us; retry once
				// against the (possibly updated) path.
				let path = self.path.lock().await.clone();
				Ok(File::open(&path).await?)
			}
		}
	}

	/// Whether every placeholder in the layout has been resolved to a
	/// resident chunk (no pending `new`, `new-endless`, or `base`
	/// placeholders remain).
	pub async fn is_complete(&self) -> bool {
		let st = self.state.lock().await;
		st.layout.segments.iter().all(|s| s.is_resident()) && !st.layout.total_size_unknown
	}

	/// Move this version file to `new_path`, optionally replacing its header
	/// first (used when a version's header needs to change, e.g. on key
	/// rotation, independent of its segment data).
	pub async fn move_file(&self, new_path: PathBuf, new_header: Option<&[u8]>) -> Result<(), Error> {
		if let Some(bytes) = new_header {
			let mut st = self.state.lock().await;
			st.layout.header_chunk = None;
			let file_offset = st.payload_end;
			st.file.seek(SeekFrom::Start(file_offset)).await?;
			st.file.write_all(bytes).await?;
			st.payload_end += bytes.len() as u64;
			st.layout.header_chunk = Some(HeaderChunk {
				length: bytes.len() as u32,
				file_offset,
			});
			Self::rewrite_trailer(&mut st).await?;
		}
		let mut path = self.path.lock().await;
		fs::rename(&*path, &new_path).await?;
		*path = new_path;
		Ok(())
	}

	pub async fn remove_file(&self) -> Result<(), Error> {
		let path = self.path.lock().await;
		fs::remove_file(&*path).await?;
		Ok(())
	}

	pub async fn layout_snapshot(&self) -> Layout {
		self.state.lock().await.layout.clone()
	}
}

fn parse_err(path: &Path, msg: &str) -> Error {
	Error::Storage(StorageError::ObjFileParsing {
		path: path.to_path_buf(),
		msg: msg.to_string(),
	})
}

#[cfg(test)]
mod test {
	use super::*;

	async fn tmp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
		dir.path().join(name)
	}

	#[tokio::test]
	async fn create_write_read_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let path = tmp_path(&dir, "v1").await;

		let vf = VersionFile::create_new(path.clone()).await.unwrap();
		vf.save_header(b"hdr", false).await.unwrap();
		vf.set_segs_layout(None, vec![(0, Some(5), None)], false)
			.await
			.unwrap();
		vf.save_segs(b"HELLO", 0, None, true).await.unwrap();

		assert!(vf.is_complete().await);
		assert_eq!(vf.read_header().await.unwrap().unwrap(), b"hdr");
		assert_eq!(vf.read_segs(0, 5).await.unwrap(), b"HELLO");

		drop(vf);

		let vf2 = VersionFile::open_existing(path).await.unwrap();
		assert!(vf2.is_complete().await);
		assert_eq!(vf2.read_segs(0, 5).await.unwrap(), b"HELLO");
	}

	#[tokio::test]
	async fn rejects_bad_magic() {
		let dir = tempfile::tempdir().unwrap();
		let path = tmp_path(&dir, "bad").await;
		tokio::fs::write(&path, b"notmagic000000").await.unwrap();
		let err = VersionFile::open_existing(path).await.unwrap_err();
		assert!(matches!(err, Error::Storage(StorageError::ObjFileParsing { .. })));
	}

	#[tokio::test]
	async fn rejects_incomplete_layout_offset() {
		let dir = tempfile::tempdir().unwrap();
		let path = tmp_path(&dir, "incomplete").await;
		let mut buf = Vec::new();
		buf.extend_from_slice(MAGIC);
		buf.extend_from_slice(&encode_u64_be(0));
		tokio::fs::write(&path, &buf).await.unwrap();
		let err = VersionFile::open_existing(path).await.unwrap_err();
		assert!(matches!(err, Error::Storage(StorageError::ObjFileParsing { .. })));
	}

	#[tokio::test]
	async fn absorb_base_copies_only_referenced_bytes() {
		let dir = tempfile::tempdir().unwrap();
		let base_path = tmp_path(&dir, "base").await;
		let base = VersionFile::create_new(base_path.clone()).await.unwrap();
		base.save_header(b"base-hdr", false).await.unwrap();
		base.set_segs_layout(None, vec![(0, Some(10), None)], false)
			.await
			.unwrap();
		base.save_segs(b"0123456789", 0, None, true).await.unwrap();
		drop(base);

		let v2_path = tmp_path(&dir, "v2").await;
		let v2 = VersionFile::create_new(v2_path.clone()).await.unwrap();
		v2.save_header(b"v2-hdr", false).await.unwrap();
		v2.set_segs_layout(Some(1), vec![(0, Some(4), Some(2))], true)
			.await
			.unwrap();
		assert!(!v2.is_complete().await);

		v2.absorb_base(1, &base_path).await.unwrap();
		assert!(v2.is_complete().await);
		assert_eq!(v2.read_segs(0, 4).await.unwrap(), b"2345");
	}

	#[tokio::test]
	async fn absorb_base_crash_before_layout_offset_update_recovers_previous_layout() {
		let dir = tempfile::tempdir().unwrap();
		let base_path = tmp_path(&dir, "base").await;
		let base = VersionFile::create_new(base_path.clone()).await.unwrap();
		base.save_header(b"base-hdr", false).await.unwrap();
		base.set_segs_layout(None, vec![(0, Some(10), None)], false)
			.await
			.unwrap();
		base.save_segs(b"0123456789", 0, None, true).await.unwrap();
		drop(base);

		let v2_path = tmp_path(&dir, "v2").await;
		let v2 = VersionFile::create_new(v2_path.clone()).await.unwrap();
		v2.save_header(b"v2-hdr", false).await.unwrap();
		v2.set_segs_layout(Some(1), vec![(0, Some(4), Some(2))], true)
			.await
			.unwrap();
		let pre_absorption_layout = v2.layout_snapshot().await;
		let committed_bytes = tokio::fs::read(&v2_path).await.unwrap();

		v2.absorb_base(1, &base_path).await.unwrap();
		drop(v2);

		// Splice the old (pre-absorption) layout-offset field back into the
		// fully-absorbed file, simulating a crash that landed between the
		// new trailer write and the layout-offset swing.
		let mut crashed_bytes = tokio::fs::read(&v2_path).await.unwrap();
		crashed_bytes[4..12].copy_from_slice(&committed_bytes[4..12]);
		let crashed_path = tmp_path(&dir, "v2-crashed").await;
		tokio::fs::write(&crashed_path, &crashed_bytes).await.unwrap();

		let recovered = VersionFile::open_existing(crashed_path).await.unwrap();
		let recovered_layout = recovered.layout_snapshot().await;
		assert_eq!(recovered_layout.base_version, pre_absorption_layout.base_version);
		assert_eq!(recovered_layout.segments.len(), pre_absorption_layout.segments.len());
		assert!(!recovered.is_complete().await);

		recovered.absorb_base(1, &base_path).await.unwrap();
		assert!(recovered.is_complete().await);
		assert_eq!(recovered.read_segs(0, 4).await.unwrap(), b"2345");
	}

	#[tokio::test]
	async fn set_segs_layout_rejects_gap() {
		let dir = tempfile::tempdir().unwrap();
		let path = tmp_path(&dir, "gap").await;
		let vf = VersionFile::create_new(path).await.unwrap();
		let err = vf
			.set_segs_layout(None, vec![(0, Some(5), None), (10, Some(5), None)], false)
			.await
			.unwrap_err();
		assert!(format!("{}", err).contains("gap"));
	}
}
