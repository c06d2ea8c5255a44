//! In-memory relay and links, the test drives the remote side through the returned handles.

use super::{
	DataLink, LinkEvent, LinkFactory, LinkHandle, LinkMessage, P2pError, RelayCommand,
	RelayConnection, RelayEvent, RoomId, Signal, SignalingRelay,
};

use std::sync::{
	atomic::{AtomicBool, AtomicUsize, Ordering},
	Arc, Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// The relay's end of one room membership.
pub struct RelaySide {
	pub room: RoomId,
	pub commands: mpsc::Receiver<RelayCommand>,
	pub events: mpsc::Sender<RelayEvent>,
}

pub struct MemoryRelay {
	failures_left: AtomicUsize,
	attempts: AtomicUsize,
	sides: mpsc::UnboundedSender<RelaySide>,
}

impl MemoryRelay {
	/// A relay refusing the first `failures` connection attempts.
	pub fn new(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<RelaySide>) {
		let (sides, sides_rx) = mpsc::unbounded_channel();

		(
			Arc::new(Self {
				failures_left: AtomicUsize::new(failures),
				attempts: AtomicUsize::new(0),
				sides,
			}),
			sides_rx,
		)
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::Acquire)
	}
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
	async fn connect(&self, room: &RoomId) -> Result<RelayConnection, P2pError> {
		self.attempts.fetch_add(1, Ordering::AcqRel);

		if self
			.failures_left
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
			.is_ok()
		{
			return Err(P2pError::Relay("connection refused".to_string()));
		}

		let (commands, commands_rx) = mpsc::channel(64);
		let (events_tx, events) = mpsc::channel(64);

		self.sides
			.send(RelaySide {
				room: room.clone(),
				commands: commands_rx,
				events: events_tx,
			})
			.map_err(|_| P2pError::Relay("test dropped the relay".to_string()))?;

		Ok(RelayConnection { commands, events })
	}
}

#[derive(Default)]
pub struct MemoryLink {
	sent: Option<mpsc::UnboundedSender<LinkMessage>>,
	applied: Mutex<Vec<Signal>>,
	close_calls: AtomicUsize,
	/// Sends fail once this many messages went through
	send_limit: Mutex<Option<usize>>,
	sent_count: AtomicUsize,
	broken: AtomicBool,
}

impl MemoryLink {
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LinkMessage>) {
		let (sent, sent_rx) = mpsc::unbounded_channel();

		(
			Arc::new(Self {
				sent: Some(sent),
				..Default::default()
			}),
			sent_rx,
		)
	}

	pub fn applied(&self) -> Vec<Signal> {
		self.applied.lock().unwrap().clone()
	}

	pub fn close_calls(&self) -> usize {
		self.close_calls.load(Ordering::Acquire)
	}

	pub fn is_closed(&self) -> bool {
		self.close_calls() > 0
	}

	pub fn fail_after(&self, messages: usize) {
		*self.send_limit.lock().unwrap() = Some(messages);
	}

	fn push(&self, message: LinkMessage) -> Result<(), P2pError> {
		if self.is_closed() || self.broken.load(Ordering::Acquire) {
			return Err(P2pError::LinkClosed);
		}

		let count = self.sent_count.fetch_add(1, Ordering::AcqRel);
		if self
			.send_limit
			.lock()
			.unwrap()
			.is_some_and(|limit| count >= limit)
		{
			self.broken.store(true, Ordering::Release);
			return Err(P2pError::Link("channel reset".to_string()));
		}

		self.sent
			.as_ref()
			.ok_or(P2pError::LinkClosed)?
			.send(message)
			.map_err(|_| P2pError::LinkClosed)
	}
}

#[async_trait]
impl DataLink for MemoryLink {
	async fn apply_signal(&self, signal: Signal) -> Result<(), P2pError> {
		self.applied.lock().unwrap().push(signal);
		Ok(())
	}

	async fn send_text(&self, text: String) -> Result<(), P2pError> {
		self.push(LinkMessage::Text(text))
	}

	async fn send_binary(&self, bytes: Bytes) -> Result<(), P2pError> {
		self.push(LinkMessage::Binary(bytes))
	}

	async fn close(&self) {
		self.close_calls.fetch_add(1, Ordering::AcqRel);
	}
}

/// The remote end of a link the manager created.
pub struct RemoteEnd {
	pub peer_id: String,
	pub initiator: bool,
	pub link: Arc<MemoryLink>,
	/// Injects events as if they came from the link
	pub events: mpsc::Sender<LinkEvent>,
	/// Everything the manager sent over the link
	pub received: mpsc::UnboundedReceiver<LinkMessage>,
}

pub struct MemoryLinks {
	remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl MemoryLinks {
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
		let (remotes, remotes_rx) = mpsc::unbounded_channel();
		(Arc::new(Self { remotes }), remotes_rx)
	}
}

#[async_trait]
impl LinkFactory for MemoryLinks {
	async fn create(&self, peer_id: &str, initiator: bool) -> Result<LinkHandle, P2pError> {
		let (link, received) = MemoryLink::new();
		let (events_tx, events) = mpsc::channel(64);

		if initiator {
			events_tx
				.send(LinkEvent::Signal(Signal::Offer {
					sdp: format!("offer-for-{peer_id}"),
				}))
				.await
				.map_err(|_| P2pError::LinkClosed)?;
		}

		self.remotes
			.send(RemoteEnd {
				peer_id: peer_id.to_string(),
				initiator,
				link: Arc::clone(&link),
				events: events_tx,
				received,
			})
			.map_err(|_| P2pError::Link("test dropped the link factory".to_string()))?;

		Ok(LinkHandle { link, events })
	}
}
