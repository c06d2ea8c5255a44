use super::{P2pError, Signal};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
	Text(String),
	Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
	/// Local negotiation data to forward to the remote end through the relay
	Signal(Signal),
	Connected,
	Message(LinkMessage),
	Closed,
}

/// Ordered, reliable data link to one remote participant.
#[async_trait]
pub trait DataLink: Send + Sync + 'static {
	async fn apply_signal(&self, signal: Signal) -> Result<(), P2pError>;

	async fn send_text(&self, text: String) -> Result<(), P2pError>;

	async fn send_binary(&self, bytes: Bytes) -> Result<(), P2pError>;

	async fn close(&self);
}

pub struct LinkHandle {
	pub link: Arc<dyn DataLink>,
	pub events: mpsc::Receiver<LinkEvent>,
}

#[async_trait]
pub trait LinkFactory: Send + Sync + 'static {
	/// The initiator produces the offer, the other end waits for it.
	async fn create(&self, peer_id: &str, initiator: bool) -> Result<LinkHandle, P2pError>;
}
