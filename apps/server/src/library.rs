//! Filesystem side of the photo catalog.

use ps_core::{
	catalog::{CatalogError, PhotoRecord, PhotoSource},
	Node,
};
use ps_utils::error::FileIOError;

use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::spawn_blocking, time::sleep};
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Changes closer together than this end up in a single rescan.
const RESCAN_DEBOUNCE: Duration = Duration::from_secs(2);

/// Every supported image below a set of library roots.
pub struct FsLibrary {
	roots: Vec<PathBuf>,
}

impl FsLibrary {
	pub fn new(roots: Vec<PathBuf>) -> Self {
		Self { roots }
	}

	fn scan_root(root: &Path) -> Result<Vec<PhotoRecord>, CatalogError> {
		if !root.is_dir() {
			return Err(CatalogError::RootUnavailable(root.to_path_buf()));
		}

		let mut records = Vec::new();

		for entry in WalkDir::new(root)
			.follow_links(false)
			.into_iter()
			.filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
		{
			let entry = match entry {
				Ok(entry) => entry,
				Err(e) => {
					warn!(?e, "Skipping unreadable library entry;");
					continue;
				}
			};

			if !entry.file_type().is_file() || !ps_images::is_photo(entry.path()) {
				continue;
			}

			match Self::record(root, &entry) {
				Ok(Some(record)) => records.push(record),
				Ok(None) => {}
				Err(e) => warn!(?e, "Skipping library file;"),
			}
		}

		Ok(records)
	}

	fn record(root: &Path, entry: &DirEntry) -> Result<Option<PhotoRecord>, FileIOError> {
		let path = entry.path();
		let metadata = entry
			.metadata()
			.map_err(|e| FileIOError::from((path, std::io::Error::from(e))))?;
		let modified = ps_utils::unix_millis(
			metadata
				.modified()
				.map_err(|e| FileIOError::from((path, e)))?,
		);

		// Formats we can't decode are listed without dimensions and served as originals
		let (width, height) = if ps_images::is_supported(path) {
			match image::image_dimensions(path) {
				Ok(dimensions) => dimensions,
				Err(e) => {
					debug!(?e, path = %path.display(), "Not a readable image, skipping;");
					return Ok(None);
				}
			}
		} else {
			(0, 0)
		};

		let relative_folder = path
			.parent()
			.and_then(|parent| parent.strip_prefix(root).ok())
			.map(|folder| {
				folder
					.components()
					.map(|c| c.as_os_str().to_string_lossy())
					.collect::<Vec<_>>()
					.join("/")
			})
			.unwrap_or_default();

		Ok(Some(PhotoRecord {
			id: PhotoRecord::derive_id(path, modified),
			filename: entry.file_name().to_string_lossy().into_owned(),
			path: path.to_path_buf(),
			size: metadata.len(),
			modified,
			width,
			height,
			root_path: root.to_path_buf(),
			relative_folder,
		}))
	}
}

fn is_hidden(entry: &DirEntry) -> bool {
	entry.file_name().to_string_lossy().starts_with('.')
}

#[async_trait]
impl PhotoSource for FsLibrary {
	async fn scan(&self) -> Result<Vec<PhotoRecord>, CatalogError> {
		let roots = self.roots.clone();

		spawn_blocking(move || {
			let mut records = Vec::new();
			for root in &roots {
				match FsLibrary::scan_root(root) {
					Ok(found) => {
						debug!(root = %root.display(), photos = found.len(), "Library root scanned;");
						records.extend(found);
					}
					// One unplugged drive shouldn't empty the whole library
					Err(e @ CatalogError::RootUnavailable(_)) if roots.len() > 1 => {
						warn!(%e, "Skipping library root;");
					}
					Err(e) => return Err(e),
				}
			}
			Ok(records)
		})
		.await
		.map_err(|e| CatalogError::Scan(e.to_string()))?
	}
}

/// Rescans the node whenever something changes below one of `roots`.
///
/// The returned watcher must be kept alive for as long as changes should be followed.
pub fn watch(node: Arc<Node>, roots: &[PathBuf]) -> notify::Result<RecommendedWatcher> {
	let (changes_tx, mut changes_rx) = mpsc::channel::<()>(1);

	let mut watcher = RecommendedWatcher::new(
		move |result: notify::Result<Event>| match result {
			Ok(Event {
				kind: EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_),
				..
			}) => {
				// Full means a rescan is already pending
				changes_tx.try_send(()).ok();
			}
			Ok(_) => {}
			Err(e) => error!(?e, "Library watcher error;"),
		},
		Config::default(),
	)?;

	for root in roots {
		if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
			warn!(?e, root = %root.display(), "Unable to watch library root;");
		}
	}

	tokio::spawn(async move {
		while changes_rx.recv().await.is_some() {
			sleep(RESCAN_DEBOUNCE).await;
			// Drop whatever piled up while we were waiting
			while changes_rx.try_recv().is_ok() {}

			match node.rescan("library-changed").await {
				Ok(swap) => info!(photos = swap.current_count, "Library rescanned after changes;"),
				Err(e) => error!(?e, "Failed to rescan library;"),
			}
		}
	});

	Ok(watcher)
}
