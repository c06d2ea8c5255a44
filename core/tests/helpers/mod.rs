//! Shared fixtures for the integration tests

#![allow(dead_code)]

use ps_core::{
	auth::{
		DeviceToken, Handshake, JsonTokenStore, SessionContext, TOKEN_STORE_FILE_NAME,
	},
	catalog::{CatalogError, PhotoRecord, PhotoSource},
	session::{Outbound, Session},
	Node, NodeConfig,
};

use std::{
	net::{IpAddr, SocketAddr},
	path::Path,
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use tokio::{sync::mpsc, time::timeout};

/// A library whose content the test decides.
#[derive(Default)]
pub struct FixedSource(Mutex<Vec<PhotoRecord>>);

impl FixedSource {
	pub fn new(records: Vec<PhotoRecord>) -> Arc<Self> {
		Arc::new(Self(Mutex::new(records)))
	}

	pub fn set(&self, records: Vec<PhotoRecord>) {
		*self.0.lock().unwrap() = records;
	}
}

#[async_trait]
impl PhotoSource for FixedSource {
	async fn scan(&self) -> Result<Vec<PhotoRecord>, CatalogError> {
		Ok(self.0.lock().unwrap().clone())
	}
}

/// Writes a gradient JPEG under `root/folder` and returns its record.
pub fn write_photo(root: &Path, folder: &str, name: &str, w: u32, h: u32) -> PhotoRecord {
	let dir = root.join(folder);
	std::fs::create_dir_all(&dir).unwrap();

	let path = dir.join(name);
	let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 64]));
	DynamicImage::ImageRgb8(img).save(&path).unwrap();

	let metadata = std::fs::metadata(&path).unwrap();
	let modified = ps_utils::unix_millis(metadata.modified().unwrap());

	PhotoRecord {
		id: PhotoRecord::derive_id(&path, modified),
		filename: name.to_string(),
		path,
		size: metadata.len(),
		modified,
		width: w,
		height: h,
		root_path: root.to_path_buf(),
		relative_folder: folder.to_string(),
	}
}

pub struct TestNode {
	pub node: Arc<Node>,
	pub store: Arc<JsonTokenStore>,
}

pub async fn node(data_dir: &Path, source: Arc<FixedSource>, config: NodeConfig) -> TestNode {
	let store = Arc::new(JsonTokenStore::new(data_dir.join(TOKEN_STORE_FILE_NAME)));
	let node = Node::new(config, data_dir, source, store.clone())
		.await
		.unwrap();

	TestNode { node, store }
}

impl TestNode {
	pub async fn pair(&self, device_id: &str) -> DeviceToken {
		let token = DeviceToken::issue(device_id, format!("{device_id} phone"), "user-1", None);
		self.store.insert(token.clone()).await.unwrap();
		token
	}

	/// Authenticates `token` the way the handshake does and registers the resulting session.
	pub async fn connect(&self, token: &DeviceToken) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
		let context: SessionContext = self
			.node
			.authenticator()
			.authenticate(
				&Handshake {
					token: Some(token.token.clone()),
					..Default::default()
				},
				IpAddr::from([192, 168, 1, 30]),
			)
			.await
			.unwrap();

		let (session, outbound) = Session::new(context, SocketAddr::from(([192, 168, 1, 30], 41_000)));
		self.node.sessions().register(Arc::clone(&session)).await;

		(session, outbound)
	}
}

pub async fn next_frame(outbound: &mut mpsc::Receiver<Outbound>) -> Outbound {
	timeout(Duration::from_secs(10), outbound.recv())
		.await
		.expect("timed out waiting for a frame")
		.expect("session channel closed")
}
