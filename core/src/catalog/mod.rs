//! Read-only view over the photo library.
//!
//! Enumeration and metadata extraction live outside the core behind [`PhotoSource`]; the core
//! only keeps the last scanned set as an immutable [`CatalogSnapshot`] and swaps it wholesale.

use std::{
	collections::{hash_map::Entry, HashMap},
	path::{Path, PathBuf},
	sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

mod folders;

pub use folders::{derive_folder_tree, FolderNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRecord {
	/// Stable as long as the path and modification time don't change, see [`PhotoRecord::derive_id`]
	pub id: String,
	pub filename: String,
	/// Absolute path on the host, never sent to clients
	pub path: PathBuf,
	pub size: u64,
	/// Milliseconds since the unix epoch
	pub modified: u64,
	pub width: u32,
	pub height: u32,
	/// Library root this photo was found under
	pub root_path: PathBuf,
	/// Folder relative to `root_path`, `/` separated, empty for photos directly in the root
	pub relative_folder: String,
}

impl PhotoRecord {
	/// Photo ids are the first 16 bytes of `blake3(path \0 modified)` as lowercase hex.
	pub fn derive_id(path: impl AsRef<Path>, modified: u64) -> String {
		let mut hasher = blake3::Hasher::new();
		hasher.update(path.as_ref().to_string_lossy().as_bytes());
		hasher.update(&[0]);
		hasher.update(modified.to_string().as_bytes());
		hex::encode(&hasher.finalize().as_bytes()[..16])
	}
}

#[derive(Error, Debug)]
pub enum CatalogError {
	#[error("library root is not accessible: {0}")]
	RootUnavailable(PathBuf),
	#[error(transparent)]
	FileIO(#[from] ps_utils::error::FileIOError),
	#[error("library scan failed: {0}")]
	Scan(String),
}

/// Whatever enumerates the library on disk. Called once at startup and on every rescan.
#[async_trait]
pub trait PhotoSource: Send + Sync + 'static {
	async fn scan(&self) -> Result<Vec<PhotoRecord>, CatalogError>;
}

/// One generation of the catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
	generation: u64,
	records: Vec<PhotoRecord>,
	index: HashMap<String, usize>,
}

impl CatalogSnapshot {
	fn build(generation: u64, records: Vec<PhotoRecord>) -> Self {
		let mut unique = Vec::with_capacity(records.len());
		let mut index = HashMap::with_capacity(records.len());

		for record in records {
			match index.entry(record.id.clone()) {
				Entry::Occupied(_) => {
					warn!(photo_id = %record.id, path = %record.path.display(), "Duplicated photo id in scan, skipping;");
				}
				Entry::Vacant(entry) => {
					entry.insert(unique.len());
					unique.push(record);
				}
			}
		}

		Self {
			generation,
			records: unique,
			index,
		}
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn get(&self, id: &str) -> Option<&PhotoRecord> {
		self.index.get(id).map(|&idx| &self.records[idx])
	}

	pub fn all(&self) -> &[PhotoRecord] {
		&self.records
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSwap {
	pub generation: u64,
	pub previous_count: usize,
	pub current_count: usize,
}

impl CatalogSwap {
	pub fn count_changed(&self) -> bool {
		self.previous_count != self.current_count
	}
}

/// Holder of the current [`CatalogSnapshot`].
///
/// Readers clone the `Arc` and keep working on their generation while a rescan installs the
/// next one, so nobody ever observes a half-replaced catalog.
#[derive(Debug, Default)]
pub struct Catalog {
	current: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
	pub fn new(records: Vec<PhotoRecord>) -> Self {
		Self {
			current: RwLock::new(Arc::new(CatalogSnapshot::build(1, records))),
		}
	}

	pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
		// A poisoned lock still holds a fully built snapshot, the swap is a single assignment
		let current = self.current.read().unwrap_or_else(|e| e.into_inner());
		Arc::clone(&*current)
	}

	pub fn replace(&self, records: Vec<PhotoRecord>) -> CatalogSwap {
		let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());

		let previous_count = current.len();
		let next = CatalogSnapshot::build(current.generation + 1, records);
		let swap = CatalogSwap {
			generation: next.generation,
			previous_count,
			current_count: next.len(),
		};
		*current = Arc::new(next);

		info!(
			generation = swap.generation,
			previous_count, current_count = swap.current_count, "Catalog replaced;"
		);

		swap
	}
}

#[cfg(test)]
pub(crate) mod test_utils {
	use super::*;

	use image::{DynamicImage, Rgba, RgbaImage};

	/// Writes a half transparent PNG into `dir` and returns the matching record.
	pub fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PhotoRecord {
		let path = dir.join(name);
		let img = RgbaImage::from_fn(w, h, |x, y| {
			let alpha = if x % 2 == 0 { 255 } else { 0 };
			Rgba([(x % 256) as u8, (y % 256) as u8, 128, alpha])
		});
		DynamicImage::ImageRgba8(img).save(&path).unwrap();

		let size = std::fs::metadata(&path).unwrap().len();
		PhotoRecord {
			id: PhotoRecord::derive_id(&path, 1),
			filename: name.to_string(),
			path,
			size,
			modified: 1,
			width: w,
			height: h,
			root_path: dir.to_path_buf(),
			relative_folder: String::new(),
		}
	}

	pub fn record(id: &str, root: &str, folder: &str, filename: &str) -> PhotoRecord {
		let root_path = PathBuf::from(root);
		let path = if folder.is_empty() {
			root_path.join(filename)
		} else {
			root_path.join(folder).join(filename)
		};

		PhotoRecord {
			id: id.to_string(),
			filename: filename.to_string(),
			path,
			size: 1024,
			modified: 1_700_000_000_000,
			width: 640,
			height: 480,
			root_path,
			relative_folder: folder.to_string(),
		}
	}
}
