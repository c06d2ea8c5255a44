use super::Session;
use crate::protocol::ServerEvent;

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Every authenticated session, plus the `user:<id>` and `device:<id>` groups they belong to.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
	groups: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn register(&self, session: Arc<Session>) {
		let id = session.id();

		{
			let mut groups = self.groups.write().await;
			for group in session.groups() {
				groups.entry(group).or_default().insert(id);
			}
		}

		let count = {
			let mut sessions = self.sessions.write().await;
			sessions.insert(id, session);
			sessions.len()
		};

		info!(session_id = %id, count, "Session registered;");
	}

	pub async fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
		let session = self.sessions.write().await.remove(&id)?;

		let mut groups = self.groups.write().await;
		for group in session.groups() {
			if let Some(members) = groups.get_mut(&group) {
				members.remove(&id);
				if members.is_empty() {
					groups.remove(&group);
				}
			}
		}

		info!(session_id = %id, "Session removed;");

		Some(session)
	}

	pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
		self.sessions.read().await.get(&id).cloned()
	}

	pub async fn all(&self) -> Vec<Arc<Session>> {
		self.sessions.read().await.values().cloned().collect()
	}

	pub async fn len(&self) -> usize {
		self.sessions.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.sessions.read().await.is_empty()
	}

	pub async fn group(&self, group: &str) -> Vec<Arc<Session>> {
		let Some(members) = self.groups.read().await.get(group).cloned() else {
			return Vec::new();
		};

		let sessions = self.sessions.read().await;
		members
			.iter()
			.filter_map(|id| sessions.get(id).cloned())
			.collect()
	}

	/// Sends `event` to every registered session at once, returns how many got it.
	pub async fn broadcast(&self, event: ServerEvent) -> usize {
		let sessions = self.all().await;
		Self::send_all(sessions, event)
	}

	pub async fn send_to_group(&self, group: &str, event: ServerEvent) -> usize {
		let sessions = self.group(group).await;
		Self::send_all(sessions, event)
	}

	fn send_all(sessions: Vec<Arc<Session>>, event: ServerEvent) -> usize {
		sessions
			.iter()
			.filter(|session| match session.notify(event.clone()) {
				Ok(()) => true,
				Err(e) => {
					debug!(session_id = %session.id(), ?e, "Skipping session on broadcast;");
					false
				}
			})
			.count()
	}

	/// Disconnects and forgets every session.
	pub async fn disconnect_all(&self) {
		let sessions = self.sessions.write().await.drain().collect::<Vec<_>>();
		self.groups.write().await.clear();

		for (_, session) in sessions {
			session.disconnect();
		}
	}
}
