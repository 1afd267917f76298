//! Upsync task log (spec module G): a persisted, per-object FIFO queue of
//! pending upload/removal/archiving tasks, with a deduplicated-runner for
//! saving so bursts of queueing collapse into one follow-up write.
//!
//! Grounded on `store_util::persister::Persister` for the on-disk half, and
//! on the teacher's habit of buffering writes issued before an async
//! component has finished initializing (its `PersisterShared`'s deferred
//! flush) for the "tasks queued before init are buffered" requirement.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use store_util::error::Error;
use store_util::persister::Persister;

pub const UPSYNC_FILE_NAME: &str = "upsync";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Task {
	#[serde(rename = "upload")]
	Upload {
		version: u64,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		base_version: Option<u64>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		transaction_id: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		awaiting: Option<UploadProgress>,
		#[serde(default)]
		done: bool,
	},
	#[serde(rename = "removal")]
	Removal {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		archived_versions: Option<VersionOrList>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		current_version: Option<u64>,
	},
	#[serde(rename = "archiving")]
	Archiving {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		archival_of_current: Option<u64>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum VersionOrList {
	One(u64),
	Many(Vec<u64>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UploadProgress {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub header: Option<bool>,
	#[serde(default)]
	pub segs: Vec<SegRange>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub all_bytes_on_disk: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegRange {
	pub ofs: u64,
	pub len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
struct UpsyncRecord {
	queued: VecDeque<Task>,
	current: Option<Task>,
}

/// Decides how a newly-queued task interacts with tasks already queued.
/// Spec open question (a): the precise coalescing rules are unspecified
/// upstream; this defaults to plain FIFO append, with the trait left open
/// for a richer policy (e.g. merging disjoint `removal`s) to plug in later.
pub trait CoalescePolicy: Send + Sync {
	/// Return `true` if `incoming` was absorbed into `queued` (and so
	/// should not be appended separately).
	fn try_coalesce(&self, queued: &mut VecDeque<Task>, incoming: &Task) -> bool;
}

/// The default policy: never coalesce, always append.
pub struct AppendOnly;

impl CoalescePolicy for AppendOnly {
	fn try_coalesce(&self, _queued: &mut VecDeque<Task>, _incoming: &Task) -> bool {
		false
	}
}

struct State {
	record: UpsyncRecord,
	initialized: bool,
	pending_before_init: Vec<Task>,
}

/// Per-object upsync task log. Construction is synchronous; [`UpsyncLog::init`]
/// loads (or creates) the persisted record asynchronously, and any
/// `queue_task` calls made before it completes are buffered and flushed
/// once it does.
pub struct UpsyncLog {
	persister: Persister<UpsyncRecord>,
	dir: PathBuf,
	state: Mutex<State>,
	policy: Arc<dyn CoalescePolicy>,
	save_in_flight: Mutex<bool>,
	save_pending_again: Mutex<bool>,
}

impl UpsyncLog {
	pub fn new(dir: &Path) -> Arc<Self> {
		Self::with_policy(dir, Arc::new(AppendOnly))
	}

	pub fn with_policy(dir: &Path, policy: Arc<dyn CoalescePolicy>) -> Arc<Self> {
		Arc::new(Self {
			persister: Persister::new(dir, UPSYNC_FILE_NAME),
			dir: dir.to_path_buf(),
			state: Mutex::new(State {
				record: UpsyncRecord::default(),
				initialized: false,
				pending_before_init: Vec::new(),
			}),
			policy,
			save_in_flight: Mutex::new(false),
			save_pending_again: Mutex::new(false),
		})
	}

	/// Load the persisted record, if any, and flush any tasks that were
	/// queued while initialization was in flight.
	pub async fn init(self: &Arc<Self>) -> Result<(), Error> {
		let loaded = if self.persister.exists().await {
			self.persister.load_async().await?
		} else {
			UpsyncRecord::default()
		};

		let pending = {
			let mut st = self.state.lock().await;
			st.record = loaded;
			st.initialized = true;
			std::mem::take(&mut st.pending_before_init)
		};

		for task in pending {
			self.queue_task(task).await?;
		}
		Ok(())
	}

	/// Append a task to the queue, subject to the coalescing policy. If
	/// initialization hasn't completed yet, the task is buffered and
	/// applied once it does.
	pub async fn queue_task(self: &Arc<Self>, task: Task) -> Result<(), Error> {
		{
			let mut st = self.state.lock().await;
			if !st.initialized {
				st.pending_before_init.push(task);
				return Ok(());
			}
			if !self.policy.try_coalesce(&mut st.record.queued, &task) {
				st.record.queued.push_back(task);
			}
		}
		self.trigger_save().await
	}

	/// Promote the head of `queued` to `current`, persisting the change.
	/// No-op (returns `None`) if `current` is already occupied or the queue
	/// is empty.
	pub async fn next_task(self: &Arc<Self>) -> Result<Option<Task>, Error> {
		{
			let mut st = self.state.lock().await;
			if st.record.current.is_some() {
				return Ok(None);
			}
			match st.record.queued.pop_front() {
				Some(task) => st.record.current = Some(task),
				None => return Ok(None),
			}
		}
		self.trigger_save().await?;
		Ok(self.state.lock().await.record.current.clone())
	}

	/// Persist an intermediate upload checkpoint onto `current`.
	pub async fn record_interim(self: &Arc<Self>, progress: UploadProgress) -> Result<(), Error> {
		{
			let mut st = self.state.lock().await;
			if let Some(Task::Upload { awaiting, .. }) = st.record.current.as_mut() {
				*awaiting = Some(progress);
			}
		}
		self.trigger_save().await
	}

	/// Clear `current`; if both halves are now empty, remove the persisted
	/// file entirely.
	pub async fn record_completion(self: &Arc<Self>) -> Result<(), Error> {
		let now_empty = {
			let mut st = self.state.lock().await;
			st.record.current = None;
			st.record.queued.is_empty() && st.record.current.is_none()
		};
		if now_empty {
			self.persister.remove().await
		} else {
			self.trigger_save().await
		}
	}

	pub async fn is_done(&self) -> bool {
		let st = self.state.lock().await;
		st.record.queued.is_empty() && st.record.current.is_none()
	}

	pub async fn queued_len(&self) -> usize {
		self.state.lock().await.record.queued.len()
	}

	pub async fn current(&self) -> Option<Task> {
		self.state.lock().await.record.current.clone()
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Deduplicated-runner save: at most one save in flight; a trigger
	/// arriving while one is in flight is collapsed into exactly one
	/// follow-up save rather than queuing unboundedly.
	async fn trigger_save(self: &Arc<Self>) -> Result<(), Error> {
		{
			let mut in_flight = self.save_in_flight.lock().await;
			if *in_flight {
				*self.save_pending_again.lock().await = true;
				return Ok(());
			}
			*in_flight = true;
		}

		loop {
			let snapshot = self.state.lock().await.record.clone();
			let result = self.persister.save_async(&snapshot).await;
			if let Err(e) = &result {
				warn!("upsync save failed, will retry on next trigger: {}", e);
			}

			let mut again = self.save_pending_again.lock().await;
			if *again {
				*again = false;
				continue;
			}
			*self.save_in_flight.lock().await = false;
			return result;
		}
	}
}
