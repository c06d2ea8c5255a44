mod helpers;

use helpers::{next_frame, node, write_photo, FixedSource};

use ps_core::{
	cache::cache_key,
	protocol::{ManifestChanged, ServerEvent},
	session::Outbound,
	NodeConfig,
};

use tempfile::tempdir;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn manifest_follows_the_library() {
	let library = tempdir().unwrap();
	let data = tempdir().unwrap();

	let beach = write_photo(library.path(), "2023/summer", "beach.jpg", 40, 30);
	let snow = write_photo(library.path(), "2023/winter", "snow.jpg", 30, 40);

	let source = FixedSource::new(vec![beach.clone(), snow.clone()]);
	let test = node(data.path(), source.clone(), NodeConfig::default()).await;

	let token = test.pair("phone").await;
	let (_session, mut outbound) = test.connect(&token).await;
	let mut peer_changes = test.node.subscribe_manifest_changes();

	let service = test.node.service();
	let first = service.manifest();
	assert_eq!(first.count, 2);

	// Same files in another order, nothing to announce
	source.set(vec![snow.clone(), beach.clone()]);
	let swap = test.node.rescan("periodic").await.unwrap();
	assert!(!swap.count_changed());
	assert_eq!(service.manifest().hash, first.hash);
	assert!(outbound.try_recv().is_err());
	assert!(peer_changes.try_recv().is_err());

	let folders = service.folders();
	assert_eq!(folders.len(), 1);
	assert_eq!(folders[0].total_count, 2);

	let dunes = write_photo(library.path(), "2024", "dunes.jpg", 50, 50);
	source.set(vec![beach.clone(), snow.clone(), dunes.clone()]);
	test.node.rescan("file-added").await.unwrap();

	let Outbound::Event(ServerEvent::ManifestChanged(ManifestChanged {
		reason,
		previous_count,
		current_count,
		..
	})) = next_frame(&mut outbound).await
	else {
		panic!("expected manifest-changed");
	};
	assert_eq!(reason, "file-added");
	assert_eq!((previous_count, current_count), (2, 3));
	assert_eq!(peer_changes.try_recv().unwrap().current_count, 3);

	let second = service.manifest();
	assert_ne!(second.hash, first.hash);
	assert!(second.photos.iter().any(|photo| photo.id == dunes.id));

	let folders = service.folders();
	assert_eq!(folders[0].total_count, 3);
	let names = folders[0]
		.children
		.iter()
		.map(|child| child.name.as_str())
		.collect::<Vec<_>>();
	assert_eq!(names, ["2023", "2024"]);

	test.node.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn rescan_drops_cached_renditions() {
	let library = tempdir().unwrap();
	let data = tempdir().unwrap();

	let photo = write_photo(library.path(), "", "cat.jpg", 300, 200);
	let source = FixedSource::new(vec![photo.clone()]);
	let test = node(data.path(), source, NodeConfig::default()).await;

	let cache = test.node.service().cache();
	let spec = ps_images::RenditionSpec {
		quality: 80,
		max_dimension: 100,
	};

	let bytes = cache.get_or_compute(&photo, spec).await.unwrap();
	assert!(cache.path_for(&cache_key(&photo.id, spec)).exists());
	assert_eq!(cache.memory_len(), 1);

	test.node.rescan("manual").await.unwrap();
	assert!(!cache.path_for(&cache_key(&photo.id, spec)).exists());
	assert_eq!(cache.memory_len(), 0);

	// Rendering is deterministic, the next request rebuilds the same bytes
	assert_eq!(cache.get_or_compute(&photo, spec).await.unwrap(), bytes);

	test.node.shutdown().await;
}
