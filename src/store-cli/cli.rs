//! Subcommand definitions and dispatch. Each subcommand opens the object
//! store fresh from `Config`, does one thing, prints a table or a short
//! report, and returns.

use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use store_fs::folder::{ObjFolders, ObjFoldersConfig, GenerationRecord};
use store_model::gc::GarbageCollector;
use store_model::obj_files::ObjFiles;
use store_model::upsync::UpsyncLog;
use store_util::config::Config;
use store_util::error::Error;
use store_util::obj_id::ObjId;

use crate::check;

#[derive(StructOpt, Debug)]
pub enum Command {
	/// List known objects and their current/archived version counts
	Status,
	/// Show the status record and upsync queue for one object
	Stat {
		#[structopt(long = "obj-id")]
		obj_id: String,
	},
	/// Schedule every known object for garbage collection and wait for the
	/// pass to settle
	Gc {
		#[structopt(long = "settle-after", default_value = "500ms", parse(try_from_str = parse_duration::parse))]
		settle_after: Duration,
	},
	/// Walk every stored version file and report any with an incomplete
	/// segment layout
	Check,
}

fn obj_folders_config(config: &Config) -> ObjFoldersConfig {
	ObjFoldersConfig {
		num_of_splits: config.num_of_splits,
		chars_in_split: config.chars_in_split,
		generations: config
			.generations
			.iter()
			.map(|g| GenerationRecord {
				period: g.period_secs,
				last_done: g.last_done_secs,
			})
			.collect(),
	}
}

pub async fn dispatch(config: Config, cmd: Command) -> Result<(), Error> {
	let folders = Arc::new(ObjFolders::new(config.store_dir.clone(), obj_folders_config(&config)));

	match cmd {
		Command::Status => cmd_status(folders).await,
		Command::Stat { obj_id } => cmd_stat(config, folders, obj_id).await,
		Command::Gc { settle_after } => cmd_gc(folders, settle_after).await,
		Command::Check => check::run(folders).await,
	}
}

async fn cmd_status(folders: Arc<ObjFolders>) -> Result<(), Error> {
	let entries = folders.list_recent().await?;
	println!("ObjId\tPath");
	for (path, obj_id) in &entries {
		println!("{}\t{}", obj_id.as_deref().unwrap_or("<root>"), path.display());
	}
	println!("\n{} object(s)", entries.len());
	Ok(())
}

async fn cmd_stat(config: Config, folders: Arc<ObjFolders>, obj_id: String) -> Result<(), Error> {
	let gc = GarbageCollector::spawn(folders.clone());
	let files = ObjFiles::new(folders, gc, config.objfiles_cache_ttl_secs).await;

	let id: ObjId = Some(obj_id.clone());
	let local = files.find(&id).await?.ok_or_else(|| Error::message(format!("no such object: {}", obj_id)))?;
	let status = local.status().await;
	println!("object:           {}", obj_id);
	println!("current version:  {:?}", status.current_version);
	println!("base of current:  {:?}", status.base_of_current);
	println!("archived:         {:?}", status.archived_versions);
	println!("scheduled for gc: {}", status.archived);

	let upsync = UpsyncLog::new(local.folder());
	upsync.init().await?;
	println!("upsync queue len: {}", upsync.queued_len().await);
	if let Some(task) = upsync.current().await {
		println!("current task:     {:?}", task);
	}
	Ok(())
}

async fn cmd_gc(folders: Arc<ObjFolders>, settle_after: Duration) -> Result<(), Error> {
	let gc = GarbageCollector::spawn(folders.clone());
	let entries = folders.list_recent().await?;
	for (_, obj_id) in &entries {
		gc.schedule(obj_id.clone()).await;
	}
	info!("scheduled {} object(s) for collection", entries.len());
	tokio::time::sleep(settle_after).await;
	Ok(())
}
