use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::{
	non_blocking::WorkerGuard,
	rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "ps_core=info,ps_server=info";
const LOG_FILE_PREFIX: &str = "ps-server.log";

/// Installs the global subscriber: stdout always, plus a daily rotated file under `logs_dir`.
///
/// Log lines are only flushed to the file while the returned guard lives.
pub fn init(logs_dir: Option<PathBuf>) -> anyhow::Result<Option<WorkerGuard>> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

	let (file_layer, guard) = match logs_dir {
		Some(logs_dir) => {
			std::fs::create_dir_all(&logs_dir)
				.with_context(|| format!("failed to create {}", logs_dir.display()))?;

			let (writer, guard) = tracing_appender::non_blocking(RollingFileAppender::new(
				Rotation::DAILY,
				logs_dir,
				LOG_FILE_PREFIX,
			));

			(
				Some(
					fmt::layer()
						.with_target(true)
						.with_thread_ids(true)
						.with_ansi(false)
						.with_writer(writer),
				),
				Some(guard),
			)
		}
		None => (None, None),
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_writer(std::io::stdout),
		)
		.with(file_layer)
		.try_init()
		.context("failed to install the tracing subscriber")?;

	Ok(guard)
}
