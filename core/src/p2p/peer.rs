use super::{DataLink, PeerMessage};
use crate::{
	protocol::ServerEvent,
	transfer::{DeliveryError, TransferTarget},
};

use std::{
	sync::{
		atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
	/// Link being negotiated through the relay
	Signaling,
	Connected,
	/// At least one request is being served
	Streaming,
	Closed,
}

/// One remote participant of the rendezvous and the data link to it.
pub struct Peer {
	id: String,
	link: Arc<dyn DataLink>,
	connected: AtomicBool,
	closing: AtomicBool,
	in_flight: AtomicUsize,
	closed: CancellationToken,
	heartbeat: Mutex<Option<JoinHandle<()>>>,
	/// Timestamp of the last ping still waiting for its pong, 0 when none
	awaiting_pong: AtomicI64,
}

impl Peer {
	pub fn new(id: impl Into<String>, link: Arc<dyn DataLink>) -> Arc<Self> {
		Arc::new(Self {
			id: id.into(),
			link,
			connected: AtomicBool::new(false),
			closing: AtomicBool::new(false),
			in_flight: AtomicUsize::new(0),
			closed: CancellationToken::new(),
			heartbeat: Mutex::new(None),
			awaiting_pong: AtomicI64::new(0),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn link(&self) -> &Arc<dyn DataLink> {
		&self.link
	}

	pub fn state(&self) -> PeerState {
		if self.closed.is_cancelled() {
			PeerState::Closed
		} else if !self.connected.load(Ordering::Acquire) {
			PeerState::Signaling
		} else if self.in_flight.load(Ordering::Acquire) > 0 {
			PeerState::Streaming
		} else {
			PeerState::Connected
		}
	}

	/// Resolves once the peer is closed.
	pub async fn closed(&self) {
		self.closed.cancelled().await
	}

	/// Marks the link usable and starts the data channel heartbeat.
	pub fn mark_connected(self: &Arc<Self>, every: Duration) {
		if self.closed.is_cancelled() || self.connected.swap(true, Ordering::AcqRel) {
			return;
		}

		let handle = spawn(Arc::clone(self).heartbeat(every));

		let mut heartbeat = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(previous) = heartbeat.replace(handle) {
			previous.abort();
		}
	}

	pub fn begin_transfer(self: &Arc<Self>) -> StreamingGuard {
		self.in_flight.fetch_add(1, Ordering::AcqRel);
		StreamingGuard {
			peer: Arc::clone(self),
		}
	}

	pub async fn send(&self, message: &PeerMessage) -> Result<(), DeliveryError> {
		if !self.is_connected() {
			return Err(DeliveryError::Disconnected);
		}

		let text = serde_json::to_string(message).map_err(|e| DeliveryError::Write(e.to_string()))?;

		self.link
			.send_text(text)
			.await
			.map_err(|e| DeliveryError::Write(e.to_string()))
	}

	/// Accounts for the answer to one of our pings, `timestamp` being the one we sent.
	pub fn record_pong(&self, timestamp: i64, latency_warning: Duration) {
		// Only the latest ping is tracked, answers to older ones just measure latency
		self.awaiting_pong
			.compare_exchange(timestamp, 0, Ordering::AcqRel, Ordering::Acquire)
			.ok();

		let rtt = Duration::from_millis(
			u64::try_from(Utc::now().timestamp_millis() - timestamp).unwrap_or_default(),
		);

		if rtt > latency_warning {
			warn!(peer_id = %self.id, rtt_ms = rtt.as_millis() as u64, "High latency on peer link;");
		} else {
			trace!(peer_id = %self.id, rtt_ms = rtt.as_millis() as u64, "Peer pong;");
		}
	}

	/// Stops the heartbeat and then closes the link. Calling it again does nothing.
	pub async fn close(&self) {
		if self.closing.swap(true, Ordering::AcqRel) {
			return;
		}
		self.closed.cancel();

		if let Some(heartbeat) = self
			.heartbeat
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.take()
		{
			heartbeat.abort();
		}

		self.link.close().await;

		info!(peer_id = %self.id, "Peer closed;");
	}

	async fn heartbeat(self: Arc<Self>, every: Duration) {
		let mut ticker = interval(every);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				() = self.closed.cancelled() => break,
				_ = ticker.tick() => {}
			}

			let timestamp = Utc::now().timestamp_millis();
			let previous = self.awaiting_pong.swap(timestamp, Ordering::AcqRel);
			if previous != 0 {
				// Reported only, a link that really died surfaces as a close event
				debug!(
					peer_id = %self.id,
					missed_for_ms = timestamp - previous,
					"Peer missed a heartbeat;"
				);
			}

			if let Err(e) = self.send(&PeerMessage::Ping { timestamp }).await {
				debug!(peer_id = %self.id, ?e, "Heartbeat failed to send;");
			}
		}
	}
}

pub struct StreamingGuard {
	peer: Arc<Peer>,
}

impl Drop for StreamingGuard {
	fn drop(&mut self) {
		self.peer.in_flight.fetch_sub(1, Ordering::AcqRel);
	}
}

#[async_trait]
impl TransferTarget for Peer {
	fn label(&self) -> String {
		format!("peer:{}", self.id)
	}

	fn is_connected(&self) -> bool {
		!self.closed.is_cancelled() && self.connected.load(Ordering::Acquire)
	}

	async fn send_event(&self, event: ServerEvent) -> Result<(), DeliveryError> {
		match PeerMessage::from_event(event) {
			Some(message) => self.send(&message).await,
			None => Ok(()),
		}
	}

	async fn send_binary(&self, bytes: Bytes) -> Result<(), DeliveryError> {
		if !self.is_connected() {
			return Err(DeliveryError::Disconnected);
		}

		self.link
			.send_binary(bytes)
			.await
			.map_err(|e| DeliveryError::Write(e.to_string()))
	}
}
