use super::CatalogSnapshot;

use std::{
	collections::{BTreeMap, BTreeSet},
	path::Path,
};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
	pub root_path: String,
	/// `/` separated, empty for the library root itself
	pub relative_path: String,
	pub name: String,
	/// Photos directly inside this folder
	pub photo_count: usize,
	/// Photos in this folder and every descendant
	pub total_count: usize,
	pub children: Vec<FolderNode>,
}

type FolderKey = (String, String);

/// Builds one tree per library root out of the folders referenced by `snapshot`.
///
/// Every ancestor of a folder holding photos gets a node even when it holds none itself, and
/// branches without any photo below them are dropped.
pub fn derive_folder_tree(snapshot: &CatalogSnapshot) -> Vec<FolderNode> {
	let mut direct = BTreeMap::<FolderKey, usize>::new();

	for photo in snapshot.all() {
		let root = photo.root_path.to_string_lossy().into_owned();
		let segments = split_segments(&photo.relative_folder);

		for depth in 0..=segments.len() {
			direct
				.entry((root.clone(), segments[..depth].join("/")))
				.or_default();
		}

		*direct
			.entry((root, segments.join("/")))
			.or_default() += 1;
	}

	let mut children = BTreeMap::<FolderKey, BTreeSet<String>>::new();
	for (root, relative) in direct.keys() {
		if let Some(parent) = parent_of(relative) {
			children
				.entry((root.clone(), parent.to_string()))
				.or_default()
				.insert(relative.clone());
		}
	}

	let roots = direct
		.keys()
		.filter(|(_, relative)| relative.is_empty())
		.map(|(root, _)| root.clone())
		.collect::<Vec<_>>();

	roots
		.into_iter()
		.filter_map(|root| build_node(&root, String::new(), &direct, &children))
		.collect()
}

fn build_node(
	root: &str,
	relative: String,
	direct: &BTreeMap<FolderKey, usize>,
	children: &BTreeMap<FolderKey, BTreeSet<String>>,
) -> Option<FolderNode> {
	let key = (root.to_string(), relative);
	let photo_count = direct.get(&key).copied().unwrap_or_default();

	let mut child_nodes = children
		.get(&key)
		.into_iter()
		.flatten()
		.filter_map(|child| build_node(root, child.clone(), direct, children))
		.collect::<Vec<_>>();
	child_nodes.sort_by(|a, b| a.name.cmp(&b.name));

	let total_count = photo_count + child_nodes.iter().map(|c| c.total_count).sum::<usize>();
	if total_count == 0 {
		return None;
	}

	let (_, relative) = key;
	let name = match relative.rsplit('/').next() {
		Some(last) if !last.is_empty() => last.to_string(),
		_ => Path::new(root)
			.file_name()
			.map_or_else(|| root.to_string(), |n| n.to_string_lossy().into_owned()),
	};

	Some(FolderNode {
		root_path: root.to_string(),
		relative_path: relative,
		name,
		photo_count,
		total_count,
		children: child_nodes,
	})
}

fn split_segments(relative_folder: &str) -> Vec<&str> {
	relative_folder
		.split(['/', '\\'])
		.filter(|s| !s.is_empty() && *s != ".")
		.collect()
}

fn parent_of(relative: &str) -> Option<&str> {
	if relative.is_empty() {
		None
	} else {
		Some(relative.rsplit_once('/').map_or("", |(parent, _)| parent))
	}
}
