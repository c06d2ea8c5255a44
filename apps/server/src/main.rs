use ps_core::{
	auth::{DeviceToken, JsonTokenStore, TokenStore},
	config::default_data_dir,
	p2p::RoomId,
	Node, NodeConfig,
};

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

mod library;
mod logging;

#[derive(Parser, Debug)]
#[command(name = "ps-server", version, about = "Streams a photo library to paired devices")]
struct Cli {
	/// Where tokens, renditions, logs and the config live
	#[arg(long, env = "PS_DATA_DIR", global = true)]
	data_dir: Option<PathBuf>,

	/// Config file to use instead of the one in the data directory
	#[arg(long, env = "PS_CONFIG", global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Serve the library (default)
	Serve(ServeArgs),
	/// Scan the library, drop cached renditions and print a summary
	Rescan,
	/// Print the P2P rendezvous id, creating it if needed
	Room,
	/// Manage paired device tokens
	#[command(subcommand)]
	Tokens(TokenCommand),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
	/// Overrides `streaming.bind`
	#[arg(long)]
	bind: Option<SocketAddr>,

	/// Library root, may be repeated, overrides `library.roots`
	#[arg(long = "root")]
	roots: Vec<PathBuf>,

	/// Don't rescan when files change below the library roots
	#[arg(long)]
	no_watch: bool,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
	/// List every token of the store
	List,
	/// Issue a token for a new device
	Issue {
		device_id: String,
		name: String,
		user_id: String,
		#[arg(long)]
		expires_in_days: Option<i64>,
	},
	/// Revoke a token, or every token of a device
	Revoke { token_or_device: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let data_dir = match cli.data_dir {
		Some(data_dir) => data_dir,
		None => default_data_dir()?,
	};

	let command = cli.command.unwrap_or(Command::Serve(ServeArgs::default()));

	// Only the long running server writes log files
	let _log_guard = logging::init(
		matches!(command, Command::Serve(_)).then(|| NodeConfig::logs_dir(&data_dir)),
	)?;

	let config = match &cli.config {
		Some(path) => NodeConfig::load_from(path)?,
		None => NodeConfig::load_or_create(&data_dir)?,
	};

	match command {
		Command::Serve(args) => serve(config, data_dir, args).await,
		Command::Rescan => rescan(config, data_dir).await,
		Command::Room => {
			let room = RoomId::load_or_create(config.p2p.room_id.as_deref(), &data_dir).await?;
			println!("{room}");
			Ok(())
		}
		Command::Tokens(command) => tokens(&config, &data_dir, command).await,
	}
}

async fn serve(mut config: NodeConfig, data_dir: PathBuf, args: ServeArgs) -> anyhow::Result<()> {
	if let Some(bind) = args.bind {
		config.streaming.bind = bind;
	}
	if !args.roots.is_empty() {
		config.library.roots = args.roots;
	}
	if config.library.roots.is_empty() {
		bail!("no library roots configured, pass --root or set library.roots");
	}

	let roots = config.library.roots.clone();
	let bind = config.streaming.bind;
	let token_store = Arc::new(JsonTokenStore::new(config.token_store_path(&data_dir)));

	if config.p2p.enabled {
		// The relay and data link transports are provided by the embedding application
		warn!("p2p.enabled is set but ps-server bundles no relay or data link transport, the [p2p] section is ignored;");
	}

	let node = Node::new(
		config,
		&data_dir,
		Arc::new(library::FsLibrary::new(roots.clone())),
		token_store,
	)
	.await?;

	node.start_revocation_watch().await;

	let _watcher = if args.no_watch {
		None
	} else {
		Some(library::watch(Arc::clone(&node), &roots).context("failed to watch library roots")?)
	};

	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("failed to bind {bind}"))?;

	let server = {
		let node = Arc::clone(&node);
		tokio::spawn(async move { node.serve(listener).await })
	};

	shutdown_signal().await;

	// Live sockets keep the server from draining until sessions are closed
	node.shutdown().await;

	server.await??;

	info!("Bye;");

	Ok(())
}

async fn rescan(config: NodeConfig, data_dir: PathBuf) -> anyhow::Result<()> {
	if config.library.roots.is_empty() {
		bail!("no library roots configured");
	}

	let token_store = Arc::new(JsonTokenStore::new(config.token_store_path(&data_dir)));
	let roots = config.library.roots.clone();

	let node = Node::new(
		config,
		&data_dir,
		Arc::new(library::FsLibrary::new(roots)),
		token_store,
	)
	.await?;

	node.clear_cache().await?;

	let manifest = node.service().manifest();
	println!("{} photos, manifest {}", manifest.count, manifest.hash);

	for root in node.service().folders().iter() {
		println!("{} ({} photos)", root.root_path, root.total_count);
		for folder in &root.children {
			println!("  {} ({} photos)", folder.relative_path, folder.total_count);
		}
	}

	node.shutdown().await;

	Ok(())
}

async fn tokens(
	config: &NodeConfig,
	data_dir: &std::path::Path,
	command: TokenCommand,
) -> anyhow::Result<()> {
	let store = JsonTokenStore::new(config.token_store_path(data_dir));

	match command {
		TokenCommand::List => {
			let now = Utc::now();
			for token in store.load().await? {
				let status = if token.is_revoked() {
					"revoked"
				} else if token.is_expired(now) {
					"expired"
				} else {
					"active"
				};

				println!(
					"{}  {:<8} {} ({}) user {}, {} connections, last seen {}",
					token.token.get(..8).unwrap_or(&token.token),
					status,
					token.device_id,
					token.device_name,
					token.user_id,
					token.connection_count,
					token
						.last_used
						.map_or_else(|| "never".to_string(), |at| at.to_rfc3339()),
				);
			}
		}

		TokenCommand::Issue {
			device_id,
			name,
			user_id,
			expires_in_days,
		} => {
			let expires_at = expires_in_days
				.map(|days| {
					Duration::try_days(days)
						.map(|days| Utc::now() + days)
						.context("expiry is out of range")
				})
				.transpose()?;

			let token = DeviceToken::issue(device_id, name, user_id, expires_at);
			let printed = token.token.clone();
			store.insert(token).await?;

			println!("{printed}");
		}

		TokenCommand::Revoke { token_or_device } => {
			let revoked = store.revoke(&token_or_device).await?;
			if revoked == 0 {
				bail!("no active token matches {token_or_device}");
			}
			println!("{revoked} token(s) revoked");
		}
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install signal handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}

	info!("Shutdown signal received;");
}
