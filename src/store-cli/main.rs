//! Administration CLI for a local object store. Talks directly to the
//! on-disk object tree named by a config file — there is no daemon to
//! connect to, so every subcommand opens the store, does one thing, and
//! exits.

#[macro_use]
extern crate tracing;

mod check;
mod cli;

use std::path::PathBuf;

use structopt::StructOpt;

use store_util::config::Config;

use cli::Command;

#[derive(StructOpt, Debug)]
#[structopt(name = "store-cli", about = "Administer a local encrypted object store")]
struct Opt {
	/// Path to configuration file
	#[structopt(short = "c", long = "config", env = "STORE_CONFIG_FILE", default_value = "/etc/store.toml")]
	pub config_file: PathBuf,

	#[structopt(subcommand)]
	cmd: Command,
}

#[tokio::main]
async fn main() {
	let opt = Opt::from_args();

	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "store_cli=info,store_model=info,store_fs=info");
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let config = match Config::read_from_file(&opt.config_file) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("Unable to read configuration file {}: {}", opt.config_file.display(), e);
			std::process::exit(1);
		}
	};

	if let Err(e) = cli::dispatch(config, opt.cmd).await {
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}
