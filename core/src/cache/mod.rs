//! Two tier store of renditions: an in-process map in front of a sharded directory on disk.
//!
//! Entries are a pure function of `(photo id, quality, max dimension)` and photo ids change
//! whenever the source changes, so nothing is ever evicted one by one. The whole cache is
//! dropped with [`RenditionCache::clear`] when the library is rescanned.

use crate::catalog::PhotoRecord;

use ps_images::{RenditionSpec, RENDITION_EXTENSION};
use ps_utils::error::FileIOError;

use std::{
	collections::HashMap,
	io,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU64, Ordering},
		RwLock,
	},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{fs, task::spawn_blocking};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

pub const RENDITION_CACHE_DIR_NAME: &str = "renditions";

#[derive(Error, Debug)]
pub enum RenditionError {
	#[error("source photo is missing: {}", .0.display())]
	SourceMissing(PathBuf),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to render photo: {0}")]
	Render(#[from] ps_images::Error),
	#[error("rendering task failed: {0}")]
	TaskJoin(#[from] tokio::task::JoinError),
}

pub fn cache_key(photo_id: &str, spec: RenditionSpec) -> String {
	format!("{photo_id}_{}_{}", spec.quality, spec.max_dimension)
}

// Uses the first three characters of the key as the directory name
fn shard_hex(key: &str) -> &str {
	key.get(..3).unwrap_or(key)
}

#[derive(Debug)]
pub struct RenditionCache {
	dir: PathBuf,
	memory: RwLock<HashMap<String, Bytes>>,
	generation: AtomicU64,
}

impl RenditionCache {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			memory: RwLock::default(),
			generation: AtomicU64::new(0),
		}
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// This does not check if the rendition exists, it just returns the path that it would exist at
	pub fn path_for(&self, key: &str) -> PathBuf {
		let mut path = self.dir.join(shard_hex(key));
		path.push(key);
		path.set_extension(RENDITION_EXTENSION);
		path
	}

	pub fn memory_len(&self) -> usize {
		self.memory.read().map_or(0, |memory| memory.len())
	}

	fn memory_get(&self, key: &str) -> Option<Bytes> {
		self.memory
			.read()
			.ok()
			.and_then(|memory| memory.get(key).cloned())
	}

	fn memory_insert(&self, key: String, bytes: Bytes) {
		if let Ok(mut memory) = self.memory.write() {
			memory.insert(key, bytes);
		}
	}

	#[instrument(skip(self, photo), fields(photo_id = %photo.id), err(Debug))]
	pub async fn get_or_compute(
		&self,
		photo: &PhotoRecord,
		spec: RenditionSpec,
	) -> Result<Bytes, RenditionError> {
		let key = cache_key(&photo.id, spec);

		if let Some(bytes) = self.memory_get(&key) {
			trace!("Memory hit;");
			return Ok(bytes);
		}

		let generation = self.generation.load(Ordering::Acquire);
		let path = self.path_for(&key);

		match fs::read(&path).await {
			Ok(data) => {
				trace!("Disk hit, promoting to memory;");
				let bytes = Bytes::from(data);
				if generation == self.generation.load(Ordering::Acquire) {
					self.memory_insert(key, bytes.clone());
				}
				return Ok(bytes);
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => {
				warn!(?e, path = %path.display(), "Failed to read cached rendition, recomputing;");
			}
		}

		match fs::metadata(&photo.path).await {
			Ok(_) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(RenditionError::SourceMissing(photo.path.clone()));
			}
			Err(e) => return Err(FileIOError::from((&photo.path, e)).into()),
		}

		let source = photo.path.clone();
		let bytes = Bytes::from(
			spawn_blocking(move || ps_images::render_file(source, spec)).await??,
		);

		// A clear happened while we were rendering, the bytes are still right for this caller
		// but they belong to a generation that no longer exists
		if generation != self.generation.load(Ordering::Acquire) {
			debug!("Cache cleared during computation, not storing rendition;");
			return Ok(bytes);
		}

		self.write_to_disk(&path, &bytes).await?;
		self.memory_insert(key, bytes.clone());

		debug!(size = bytes.len(), "Rendition computed and stored;");

		Ok(bytes)
	}

	/// Writes to a temporary sibling first so a crash never leaves a truncated rendition behind.
	async fn write_to_disk(&self, path: &Path, bytes: &[u8]) -> Result<(), FileIOError> {
		if let Some(shard_dir) = path.parent() {
			fs::create_dir_all(shard_dir)
				.await
				.map_err(|e| FileIOError::from((shard_dir, e)))?;
		}

		let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

		fs::write(&tmp_path, bytes)
			.await
			.map_err(|e| FileIOError::from((&tmp_path, e)))?;

		if let Err(e) = fs::rename(&tmp_path, path).await {
			let _ = fs::remove_file(&tmp_path).await;
			return Err(FileIOError::from((path, e)));
		}

		Ok(())
	}

	/// Drops every rendition, in memory and on disk.
	pub async fn clear(&self) -> Result<(), FileIOError> {
		let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

		if let Ok(mut memory) = self.memory.write() {
			memory.clear();
		}

		match fs::remove_dir_all(&self.dir).await {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => return Err(FileIOError::from((&self.dir, e))),
		}

		fs::create_dir_all(&self.dir)
			.await
			.map_err(|e| FileIOError::from((&self.dir, e)))?;

		debug!(generation, dir = %self.dir.display(), "Rendition cache cleared;");

		Ok(())
	}
}
