use super::{
	parse_photo_ids, parse_rendition_spec, BatchRequest, Manifest, ManifestPhoto,
	OriginalsRequest, PhotoRequest, ValidatedBatch, ValidationError,
};
use crate::{
	cache::{RenditionCache, RenditionError},
	catalog::{derive_folder_tree, Catalog, FolderNode, PhotoRecord},
	transfer::TransferError,
};

use ps_images::{RenditionSpec, RENDITION_MIME};
use ps_utils::error::FileIOError;

use std::{
	io,
	path::PathBuf,
	sync::{Arc, Mutex},
};

use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument};

// Rough throughput numbers, only used to give clients a progress hint
const RENDITION_MILLIS_PER_PHOTO: u64 = 300;
const ORIGINAL_MILLIS_PER_PHOTO: u64 = 50;
const ORIGINAL_BYTES_PER_SECOND: u64 = 10 * 1024 * 1024;

/// Lowercase hex SHA-256, the checksum clients verify every delivered photo against.
pub fn checksum(bytes: &[u8]) -> String {
	hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct PreparedPhoto {
	pub photo_id: String,
	pub name: String,
	pub mime: String,
	pub bytes: Bytes,
	pub checksum: String,
}

/// An opened source file, streamed as is.
#[derive(Debug)]
pub struct OriginalFile {
	pub photo_id: String,
	pub name: String,
	pub path: PathBuf,
	pub size: u64,
	pub mime: String,
	pub file: fs::File,
}

#[derive(Debug)]
pub enum Prepared {
	Rendition(PreparedPhoto),
	/// The rendition could not be produced from the source, so the source itself is sent
	Original(OriginalFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalsPlan {
	pub found: Vec<String>,
	pub not_found: Vec<String>,
	pub total_size: u64,
}

#[derive(Debug)]
pub struct PhotoService {
	catalog: Arc<Catalog>,
	cache: Arc<RenditionCache>,
	max_batch_size: usize,
	folders: Mutex<Option<(u64, Arc<[FolderNode]>)>>,
}

impl PhotoService {
	pub fn new(catalog: Arc<Catalog>, cache: Arc<RenditionCache>, max_batch_size: usize) -> Self {
		Self {
			catalog,
			cache,
			max_batch_size,
			folders: Mutex::default(),
		}
	}

	pub fn catalog(&self) -> &Arc<Catalog> {
		&self.catalog
	}

	pub fn cache(&self) -> &Arc<RenditionCache> {
		&self.cache
	}

	pub fn max_batch_size(&self) -> usize {
		self.max_batch_size
	}

	pub fn manifest(&self) -> Manifest {
		let snapshot = self.catalog.snapshot();

		let mut ids = snapshot
			.all()
			.iter()
			.map(|record| record.id.as_str())
			.collect::<Vec<_>>();
		ids.sort_unstable();

		Manifest {
			photos: snapshot.all().iter().map(ManifestPhoto::from).collect(),
			hash: blake3::hash(ids.join("\n").as_bytes()).to_hex().to_string(),
			count: snapshot.len(),
			generated_at: Utc::now(),
		}
	}

	pub fn validate_batch(&self, request: &BatchRequest) -> Result<ValidatedBatch, ValidationError> {
		let photo_ids = parse_photo_ids(request.photo_ids.as_ref(), self.max_batch_size)?;
		let spec = parse_rendition_spec(request.quality.as_ref(), request.max_dimension.as_ref())?;

		Ok(ValidatedBatch { photo_ids, spec })
	}

	pub fn validate_photo(&self, request: &PhotoRequest) -> Result<RenditionSpec, ValidationError> {
		if request.photo_id.is_empty() {
			return Err(ValidationError::InvalidRequest("photoId must not be empty"));
		}

		parse_rendition_spec(request.quality.as_ref(), request.max_dimension.as_ref())
	}

	/// Splits the requested ids into the ones the current catalog knows about and the rest.
	pub fn validate_originals(
		&self,
		request: &OriginalsRequest,
	) -> Result<OriginalsPlan, ValidationError> {
		let photo_ids = parse_photo_ids(request.photo_ids.as_ref(), self.max_batch_size)?;
		let snapshot = self.catalog.snapshot();

		let mut plan = OriginalsPlan {
			found: Vec::with_capacity(photo_ids.len()),
			not_found: Vec::new(),
			total_size: 0,
		};

		for id in photo_ids {
			match snapshot.get(&id) {
				Some(record) => {
					plan.total_size += record.size;
					plan.found.push(id);
				}
				None => plan.not_found.push(id),
			}
		}

		Ok(plan)
	}

	/// Estimated seconds to deliver `count` renditions.
	pub fn estimate_renditions(count: usize) -> u64 {
		(count as u64 * RENDITION_MILLIS_PER_PHOTO).div_ceil(1000)
	}

	/// Estimated seconds to deliver `count` originals weighing `total_size` bytes.
	pub fn estimate_originals(count: usize, total_size: u64) -> u64 {
		if count == 0 {
			return 0;
		}

		let millis = count as u64 * ORIGINAL_MILLIS_PER_PHOTO
			+ total_size.saturating_mul(1000) / ORIGINAL_BYTES_PER_SECOND;
		millis.div_ceil(1000).max(1)
	}

	/// Folder tree of the current catalog, computed once per catalog generation.
	pub fn folders(&self) -> Arc<[FolderNode]> {
		let snapshot = self.catalog.snapshot();
		let mut memo = self.folders.lock().unwrap_or_else(|e| e.into_inner());

		match &*memo {
			Some((generation, tree)) if *generation == snapshot.generation() => Arc::clone(tree),
			_ => {
				let tree = Arc::<[FolderNode]>::from(derive_folder_tree(&snapshot));
				debug!(
					generation = snapshot.generation(),
					roots = tree.len(),
					"Folder tree derived;"
				);
				*memo = Some((snapshot.generation(), Arc::clone(&tree)));
				tree
			}
		}
	}

	/// Resolves `photo_id` and renders it with `spec`, falling back to the source file when no
	/// rendition can be produced from it.
	#[instrument(skip(self), err(Debug))]
	pub async fn prepare(&self, photo_id: &str, spec: RenditionSpec) -> Result<Prepared, TransferError> {
		let snapshot = self.catalog.snapshot();
		let photo = snapshot
			.get(photo_id)
			.ok_or_else(|| TransferError::PhotoNotFound(photo_id.to_string()))?;

		match self.cache.get_or_compute(photo, spec).await {
			Ok(bytes) => Ok(Prepared::Rendition(PreparedPhoto {
				photo_id: photo.id.clone(),
				name: photo.filename.clone(),
				mime: RENDITION_MIME.to_string(),
				checksum: checksum(&bytes),
				bytes,
			})),

			Err(
				e @ (RenditionError::SourceMissing(_)
				| RenditionError::Render(
					ps_images::Error::Unsupported
					| ps_images::Error::NoExtension
					| ps_images::Error::TooLarge,
				)),
			) => {
				debug!(?e, "No rendition available, falling back to the original;");
				open_record(photo).await.map(Prepared::Original)
			}

			Err(e) => Err(e.into()),
		}
	}

	pub async fn open_original(&self, photo_id: &str) -> Result<OriginalFile, TransferError> {
		let snapshot = self.catalog.snapshot();
		let photo = snapshot
			.get(photo_id)
			.ok_or_else(|| TransferError::PhotoNotFound(photo_id.to_string()))?;

		open_record(photo).await
	}
}

async fn open_record(photo: &PhotoRecord) -> Result<OriginalFile, TransferError> {
	let file = match fs::File::open(&photo.path).await {
		Ok(file) => file,
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			return Err(TransferError::SourceMissing(photo.path.clone()));
		}
		Err(e) => return Err(FileIOError::from((&photo.path, e)).into()),
	};

	let size = file
		.metadata()
		.await
		.map_err(|e| FileIOError::from((&photo.path, e)))?
		.len();

	Ok(OriginalFile {
		photo_id: photo.id.clone(),
		name: photo.filename.clone(),
		path: photo.path.clone(),
		size,
		mime: mime_guess::from_path(&photo.path)
			.first_or_octet_stream()
			.essence_str()
			.to_string(),
		file,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog::test_utils::{record, write_png};

	use serde_json::json;
	use tempfile::tempdir;
	use tracing_test::traced_test;

	fn service(records: Vec<PhotoRecord>, cache_dir: &std::path::Path) -> PhotoService {
		PhotoService::new(
			Arc::new(Catalog::new(records)),
			Arc::new(RenditionCache::new(cache_dir)),
			3,
		)
	}

	#[test]
	fn manifest_hash_only_depends_on_ids() {
		let dir = tempdir().unwrap();
		let a = service(
			vec![record("b", "/r", "", "b.jpg"), record("a", "/r", "", "a.jpg")],
			dir.path(),
		);
		let b = service(
			vec![record("a", "/r", "", "a.jpg"), record("b", "/r", "x", "other.jpg")],
			dir.path(),
		);

		let manifest = a.manifest();
		assert_eq!(manifest.count, 2);
		assert_eq!(manifest.hash, a.manifest().hash);
		assert_eq!(manifest.hash, b.manifest().hash);

		a.catalog().replace(vec![record("a", "/r", "", "a.jpg")]);
		assert_ne!(a.manifest().hash, manifest.hash);

		let value = serde_json::to_value(&manifest.photos[0]).unwrap();
		assert!(value.get("path").is_none());
		assert!(value.get("filename").is_some());
	}

	#[test]
	fn originals_are_split_by_presence() {
		let dir = tempdir().unwrap();
		let svc = service(vec![record("a", "/r", "", "a.jpg")], dir.path());

		let plan = svc
			.validate_originals(&OriginalsRequest {
				photo_ids: Some(json!(["a", "missing"])),
			})
			.unwrap();

		assert_eq!(plan.found, ["a"]);
		assert_eq!(plan.not_found, ["missing"]);
		assert_eq!(plan.total_size, 1024);

		assert_eq!(
			svc.validate_originals(&OriginalsRequest {
				photo_ids: Some(json!(["a", "b", "c", "d"]))
			})
			.unwrap_err(),
			ValidationError::BatchTooLarge {
				requested: 4,
				cap: 3
			}
		);
	}

	#[test]
	fn folder_tree_is_recomputed_after_a_rescan() {
		let dir = tempdir().unwrap();
		let svc = service(vec![record("a", "/r", "x", "a.jpg")], dir.path());

		let first = svc.folders();
		assert!(Arc::ptr_eq(&first, &svc.folders()));

		svc.catalog().replace(vec![record("a", "/r", "y", "a.jpg")]);
		let second = svc.folders();
		assert!(!Arc::ptr_eq(&first, &second));
		assert_eq!(second[0].children[0].name, "y");
	}

	#[test]
	fn estimates_are_positive_for_non_empty_batches() {
		assert_eq!(PhotoService::estimate_renditions(0), 0);
		assert_eq!(PhotoService::estimate_renditions(1), 1);
		assert_eq!(PhotoService::estimate_renditions(10), 3);
		assert_eq!(PhotoService::estimate_originals(0, 0), 0);
		assert_eq!(PhotoService::estimate_originals(1, 1), 1);
	}

	#[tokio::test]
	#[traced_test]
	async fn checksum_matches_the_prepared_bytes() {
		let photos = tempdir().unwrap();
		let cache_dir = tempdir().unwrap();
		let photo = write_png(photos.path(), "a.png", 50, 50);
		let svc = service(vec![photo.clone()], cache_dir.path());

		let spec = RenditionSpec {
			quality: 80,
			max_dimension: 20,
		};
		let Prepared::Rendition(prepared) = svc.prepare(&photo.id, spec).await.unwrap() else {
			panic!("expected a rendition");
		};

		assert_eq!(prepared.checksum, checksum(&prepared.bytes));
		assert_eq!(prepared.mime, "image/jpeg");

		assert!(matches!(
			svc.prepare("unknown", spec).await,
			Err(TransferError::PhotoNotFound(_))
		));
	}

	#[tokio::test]
	#[traced_test]
	async fn missing_sources_fall_back_to_the_original_check() {
		let photos = tempdir().unwrap();
		let cache_dir = tempdir().unwrap();
		let photo = write_png(photos.path(), "a.png", 10, 10);
		std::fs::remove_file(&photo.path).unwrap();

		let svc = service(vec![photo.clone()], cache_dir.path());
		let spec = RenditionSpec {
			quality: 80,
			max_dimension: 20,
		};

		assert!(matches!(
			svc.prepare(&photo.id, spec).await,
			Err(TransferError::SourceMissing(_))
		));
	}

	#[tokio::test]
	#[traced_test]
	async fn undecodable_formats_are_sent_as_originals() {
		let photos = tempdir().unwrap();
		let cache_dir = tempdir().unwrap();
		let path = photos.path().join("IMG_0001.heic");
		std::fs::write(&path, b"not really a heic").unwrap();

		let mut heic = record("h", "/r", "", "IMG_0001.heic");
		heic.path = path;
		heic.size = 17;

		let svc = service(vec![heic], cache_dir.path());
		let prepared = svc
			.prepare(
				"h",
				RenditionSpec {
					quality: 80,
					max_dimension: 20,
				},
			)
			.await
			.unwrap();

		let Prepared::Original(original) = prepared else {
			panic!("expected the original");
		};
		assert_eq!(original.size, 17);
		assert_eq!(original.name, "IMG_0001.heic");
	}
}
