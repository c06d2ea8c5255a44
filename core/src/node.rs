//! Wiring of every component of a running host.

use crate::{
	auth::{spawn_revocation_watch, Authenticator, RateLimiter, TokenStore},
	cache::RenditionCache,
	catalog::{Catalog, CatalogError, CatalogSwap, PhotoSource},
	config::{ConfigError, NodeConfig},
	p2p::{LinkFactory, P2pError, P2pManager, RoomId, SignalingRelay},
	protocol::{ManifestChanged, PhotoService, ServerEvent},
	session::SessionRegistry,
	streaming::{self, StreamingState},
	transfer::{Framing, TransferWorker},
};

use ps_utils::error::FileIOError;

use std::{
	net::SocketAddr,
	path::{Path, PathBuf},
	sync::Arc,
};

use axum::Router;
use chrono::Utc;
use thiserror::Error;
use tokio::{
	fs,
	net::TcpListener,
	sync::{broadcast, Mutex},
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending manifest changes a slow P2P mirror may lag behind on.
const MANIFEST_CHANGES_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum NodeError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("failed to scan the library: {0}")]
	Catalog(#[from] CatalogError),
	#[error(transparent)]
	P2p(#[from] P2pError),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("streaming server failed: {0}")]
	Server(#[source] std::io::Error),
	#[error("P2P is already running")]
	P2pAlreadyRunning,
}

pub struct Node {
	config: NodeConfig,
	data_dir: PathBuf,
	source: Arc<dyn PhotoSource>,
	catalog: Arc<Catalog>,
	cache: Arc<RenditionCache>,
	service: Arc<PhotoService>,
	worker: Arc<TransferWorker>,
	authenticator: Arc<Authenticator>,
	sessions: Arc<SessionRegistry>,
	manifest_changes: broadcast::Sender<ManifestChanged>,
	p2p: Mutex<Option<Arc<P2pManager>>>,
	/// Serializes rescans and cache clears
	maintenance: Mutex<()>,
	cancel: CancellationToken,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
	/// Scans the library once and builds every component on top of it.
	pub async fn new(
		config: NodeConfig,
		data_dir: impl AsRef<Path>,
		source: Arc<dyn PhotoSource>,
		token_store: Arc<dyn TokenStore>,
	) -> Result<Arc<Self>, NodeError> {
		let data_dir = data_dir.as_ref().to_path_buf();

		fs::create_dir_all(&data_dir)
			.await
			.map_err(|e| FileIOError::from((&data_dir, e)))?;

		let records = source.scan().await?;
		info!(photos = records.len(), "Initial library scan done;");

		let catalog = Arc::new(Catalog::new(records));
		let cache = Arc::new(RenditionCache::new(config.cache_dir(&data_dir)));
		let service = Arc::new(PhotoService::new(
			Arc::clone(&catalog),
			Arc::clone(&cache),
			config.streaming.max_batch_size,
		));

		let worker = Arc::new(TransferWorker::spawn(
			Arc::clone(&service),
			Framing::STREAMING,
		));

		let authenticator = Arc::new(Authenticator::new(
			token_store,
			RateLimiter::new(
				config.auth.rate_limit_max_attempts,
				config.auth.rate_limit_window(),
			),
			config.auth.cache_ttl(),
		));

		let (manifest_changes, _) = broadcast::channel(MANIFEST_CHANGES_CAPACITY);

		info!(data_dir = %data_dir.display(), cache_dir = %cache.dir().display(), "Node initialized;");

		Ok(Arc::new(Self {
			config,
			data_dir,
			source,
			catalog,
			cache,
			service,
			worker,
			authenticator,
			sessions: Arc::new(SessionRegistry::new()),
			manifest_changes,
			p2p: Mutex::new(None),
			maintenance: Mutex::new(()),
			cancel: CancellationToken::new(),
			tasks: Mutex::new(Vec::new()),
		}))
	}

	pub fn config(&self) -> &NodeConfig {
		&self.config
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}

	pub fn service(&self) -> &Arc<PhotoService> {
		&self.service
	}

	pub fn sessions(&self) -> &Arc<SessionRegistry> {
		&self.sessions
	}

	pub fn authenticator(&self) -> &Arc<Authenticator> {
		&self.authenticator
	}

	pub fn worker(&self) -> &Arc<TransferWorker> {
		&self.worker
	}

	pub fn subscribe_manifest_changes(&self) -> broadcast::Receiver<ManifestChanged> {
		self.manifest_changes.subscribe()
	}

	/// Replaces the catalog with a fresh scan.
	///
	/// Renditions of the previous catalog are dropped with it. When the number of photos changed
	/// every session and every connected peer is told to fetch a new manifest.
	pub async fn rescan(&self, reason: &str) -> Result<CatalogSwap, NodeError> {
		let _maintenance = self.maintenance.lock().await;

		let records = self.source.scan().await?;

		if let Err(e) = self.cache.clear().await {
			// Stale entries are keyed by photo id, a failed wipe only wastes disk space
			warn!(?e, "Failed to clear the rendition cache on rescan;");
		}

		let swap = self.catalog.replace(records);

		if swap.count_changed() {
			let changed = ManifestChanged {
				reason: reason.to_string(),
				previous_count: swap.previous_count,
				current_count: swap.current_count,
				timestamp: Utc::now(),
			};

			let notified = self
				.sessions
				.broadcast(ServerEvent::ManifestChanged(changed.clone()))
				.await;

			// No receiver just means P2P isn't running
			self.manifest_changes.send(changed).ok();

			info!(
				reason,
				previous_count = swap.previous_count,
				current_count = swap.current_count,
				notified,
				"Library changed;"
			);
		} else {
			debug!(reason, count = swap.current_count, "Rescan kept the photo count;");
		}

		Ok(swap)
	}

	pub async fn clear_cache(&self) -> Result<(), NodeError> {
		let _maintenance = self.maintenance.lock().await;
		self.cache.clear().await?;
		info!("Rendition cache cleared;");
		Ok(())
	}

	pub fn streaming_state(&self) -> Arc<StreamingState> {
		Arc::new(StreamingState {
			authenticator: Arc::clone(&self.authenticator),
			sessions: Arc::clone(&self.sessions),
			service: Arc::clone(&self.service),
			worker: Arc::clone(&self.worker),
			settings: self.config.streaming.clone(),
		})
	}

	pub fn streaming_router(&self) -> Router {
		streaming::router(self.streaming_state())
	}

	/// Serves the streaming channel on `listener` until [`Node::shutdown`].
	pub async fn serve(&self, listener: TcpListener) -> Result<(), NodeError> {
		let addr = listener.local_addr().map_err(NodeError::Server)?;
		info!(%addr, "Streaming server listening;");

		axum::serve(
			listener,
			self.streaming_router()
				.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.with_graceful_shutdown(self.cancel.clone().cancelled_owned())
		.await
		.map_err(NodeError::Server)?;

		info!("Streaming server stopped;");

		Ok(())
	}

	/// Starts disconnecting sessions whose token stops validating.
	pub async fn start_revocation_watch(&self) {
		let handle = spawn_revocation_watch(
			Arc::clone(&self.authenticator),
			Arc::clone(&self.sessions),
			self.config.auth.cache_ttl(),
			self.cancel.child_token(),
		);

		self.tasks.lock().await.push(handle);
	}

	/// Joins the rendezvous through `relay` and serves peers over links from `links`.
	pub async fn start_p2p(
		&self,
		relay: Arc<dyn SignalingRelay>,
		links: Arc<dyn LinkFactory>,
	) -> Result<Arc<P2pManager>, NodeError> {
		let mut p2p = self.p2p.lock().await;
		if p2p.is_some() {
			return Err(NodeError::P2pAlreadyRunning);
		}

		let room = RoomId::load_or_create(self.config.p2p.room_id.as_deref(), &self.data_dir).await?;

		let manager = P2pManager::new(
			room,
			Arc::clone(&self.service),
			self.config.p2p.clone(),
			relay,
			links,
		);

		let handle = manager.spawn(self.manifest_changes.subscribe());
		self.tasks.lock().await.push(handle);

		info!(room = %manager.room(), "P2P started;");

		*p2p = Some(Arc::clone(&manager));

		Ok(manager)
	}

	pub async fn shutdown(&self) {
		info!("Node shutting down;");

		self.cancel.cancel();
		self.sessions.disconnect_all().await;

		if let Some(p2p) = self.p2p.lock().await.take() {
			p2p.shutdown().await;
		}

		self.worker.shutdown().await;

		for task in self.tasks.lock().await.drain(..) {
			if let Err(e) = task.await {
				error!(?e, "Background task panicked;");
			}
		}

		info!("Node shut down;");
	}
}
