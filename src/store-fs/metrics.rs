//! Plain atomic counters for the on-disk layer, mirroring the shape of
//! `garage_block`'s `BlockManagerMetrics` (a struct of independently
//! incremented instruments) without pulling in its OpenTelemetry wiring,
//! which this workspace has no exporter for.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct FsMetrics {
	pub version_files_created: AtomicU64,
	pub version_files_opened: AtomicU64,
	pub version_files_removed: AtomicU64,
	pub bytes_written: AtomicU64,
	pub bytes_absorbed_from_base: AtomicU64,
	pub folders_created: AtomicU64,
	pub folders_removed: AtomicU64,
	pub folders_promoted: AtomicU64,
	pub rotations_performed: AtomicU64,
}

impl FsMetrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn inc(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn add(counter: &AtomicU64, n: u64) {
		counter.fetch_add(n, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> FsMetricsSnapshot {
		FsMetricsSnapshot {
			version_files_created: self.version_files_created.load(Ordering::Relaxed),
			version_files_opened: self.version_files_opened.load(Ordering::Relaxed),
			version_files_removed: self.version_files_removed.load(Ordering::Relaxed),
			bytes_written: self.bytes_written.load(Ordering::Relaxed),
			bytes_absorbed_from_base: self.bytes_absorbed_from_base.load(Ordering::Relaxed),
			folders_created: self.folders_created.load(Ordering::Relaxed),
			folders_removed: self.folders_removed.load(Ordering::Relaxed),
			folders_promoted: self.folders_promoted.load(Ordering::Relaxed),
			rotations_performed: self.rotations_performed.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct FsMetricsSnapshot {
	pub version_files_created: u64,
	pub version_files_opened: u64,
	pub version_files_removed: u64,
	pub bytes_written: u64,
	pub bytes_absorbed_from_base: u64,
	pub folders_created: u64,
	pub folders_removed: u64,
	pub folders_promoted: u64,
	pub rotations_performed: u64,
}
