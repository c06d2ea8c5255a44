use super::{
	LinkEvent, LinkFactory, LinkHandle, LinkMessage, Peer, PeerMessage, PeerRequest, RelayCommand,
	RelayConnection, RelayEvent, RoomId, Signal, SignalingRelay,
};
use crate::{
	config::P2pConfig,
	protocol::{ErrorCode, ManifestChanged, PhotoService, ValidationError},
	transfer::{self, Framing, JobKind, TransferError, TransferTarget},
};

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_channel as chan;
use tokio::{
	spawn,
	sync::{broadcast, mpsc, RwLock},
	task::JoinHandle,
	time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Keeps this host reachable in its rendezvous room and serves every peer that links up.
pub struct P2pManager {
	room: RoomId,
	service: Arc<PhotoService>,
	config: P2pConfig,
	relay: Arc<dyn SignalingRelay>,
	links: Arc<dyn LinkFactory>,
	peers: RwLock<HashMap<String, Arc<Peer>>>,
	/// Present while a relay connection is live
	commands: RwLock<Option<mpsc::Sender<RelayCommand>>>,
	cancel: CancellationToken,
}

impl P2pManager {
	pub fn new(
		room: RoomId,
		service: Arc<PhotoService>,
		config: P2pConfig,
		relay: Arc<dyn SignalingRelay>,
		links: Arc<dyn LinkFactory>,
	) -> Arc<Self> {
		Arc::new(Self {
			room,
			service,
			config,
			relay,
			links,
			peers: RwLock::default(),
			commands: RwLock::default(),
			cancel: CancellationToken::new(),
		})
	}

	pub fn room(&self) -> &RoomId {
		&self.room
	}

	pub async fn peers(&self) -> Vec<Arc<Peer>> {
		self.peers.read().await.values().cloned().collect()
	}

	pub async fn peer(&self, id: &str) -> Option<Arc<Peer>> {
		self.peers.read().await.get(id).cloned()
	}

	/// Chunking used on data links, every frame of a payload is paced.
	pub fn framing(&self) -> Framing {
		Framing {
			rendition_chunk: Some(self.config.chunk_size.max(1)),
			original_chunk: self.config.chunk_size.max(1),
			pacing: Some(self.config.pacing()),
		}
	}

	/// Joins the rendezvous and mirrors catalog changes to peers until [`Self::shutdown`].
	pub fn spawn(self: &Arc<Self>, manifest_changes: broadcast::Receiver<ManifestChanged>) -> JoinHandle<()> {
		let this = Arc::clone(self);

		spawn(async move {
			tokio::join!(this.run_relay(), this.mirror_manifest_changes(manifest_changes));
			debug!("P2P manager stopped;");
		})
	}

	pub async fn shutdown(&self) {
		self.cancel.cancel();

		let peers = self.peers.write().await.drain().map(|(_, peer)| peer).collect::<Vec<_>>();
		for peer in peers {
			peer.close().await;
		}

		info!(room = %self.room, "P2P manager shut down;");
	}

	/// Sends `message` to every connected peer, returns how many got it.
	pub async fn broadcast(&self, message: &PeerMessage) -> usize {
		let mut delivered = 0;

		for peer in self.peers().await {
			if !peer.is_connected() {
				continue;
			}

			match peer.send(message).await {
				Ok(()) => delivered += 1,
				Err(e) => debug!(peer_id = %peer.id(), ?e, "Failed to broadcast to peer;"),
			}
		}

		delivered
	}

	async fn run_relay(self: &Arc<Self>) {
		let mut backoff = INITIAL_BACKOFF;

		while !self.cancel.is_cancelled() {
			match self.relay.connect(&self.room).await {
				Ok(connection) => {
					info!(room = %self.room, "Joined rendezvous;");
					backoff = INITIAL_BACKOFF;

					self.serve_relay(connection).await;

					if self.cancel.is_cancelled() {
						break;
					}

					// Peers with an established link keep working without the relay
					let peers = self.peers.read().await.len();
					warn!(room = %self.room, peers, "Lost signaling relay connection;");
				}
				Err(e) => {
					warn!(room = %self.room, ?e, retry_in = ?backoff, "Unable to reach signaling relay;");
				}
			}

			tokio::select! {
				() = self.cancel.cancelled() => break,
				() = sleep(backoff) => {}
			}

			backoff = (backoff * 2).min(self.config.reconnect_max());
		}
	}

	async fn serve_relay(self: &Arc<Self>, RelayConnection { commands, mut events }: RelayConnection) {
		*self.commands.write().await = Some(commands.clone());

		let every = self.config.keepalive();
		let mut keepalive = interval_at(Instant::now() + every, every);
		keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;

				() = self.cancel.cancelled() => {
					commands.send(RelayCommand::Leave).await.ok();
					break;
				}

				event = events.recv() => match event {
					Some(event) => self.handle_relay_event(event).await,
					None => break,
				},

				_ = keepalive.tick() => {
					if commands.send(RelayCommand::KeepAlive).await.is_err() {
						break;
					}
					trace!(room = %self.room, "Relay keepalive;");
				}
			}
		}

		self.commands.write().await.take();
	}

	async fn handle_relay_event(self: &Arc<Self>, event: RelayEvent) {
		match event {
			RelayEvent::ParticipantJoined(peer_id) => {
				info!(%peer_id, "Participant joined the rendezvous;");
				self.open_peer(peer_id, true).await;
			}

			RelayEvent::ParticipantLeft(peer_id) => {
				info!(%peer_id, "Participant left the rendezvous;");
				if let Some(peer) = self.peers.write().await.remove(&peer_id) {
					peer.close().await;
				}
			}

			RelayEvent::Signal { from, signal } => {
				let existing = self.peer(&from).await;

				let peer = match existing {
					Some(peer) => Some(peer),
					None => self.open_peer(from.clone(), false).await,
				};

				if let Some(peer) = peer {
					if let Err(e) = peer.link().apply_signal(signal).await {
						warn!(peer_id = %from, ?e, "Failed to apply remote signal;");
					}
				}
			}
		}
	}

	async fn open_peer(self: &Arc<Self>, peer_id: String, initiator: bool) -> Option<Arc<Peer>> {
		let LinkHandle { link, events } = match self.links.create(&peer_id, initiator).await {
			Ok(handle) => handle,
			Err(e) => {
				error!(%peer_id, ?e, "Failed to create data link;");
				return None;
			}
		};

		let peer = Peer::new(peer_id.clone(), link);

		if let Some(previous) = self.peers.write().await.insert(peer_id, Arc::clone(&peer)) {
			debug!(peer_id = %previous.id(), "Replacing stale peer;");
			previous.close().await;
		}

		spawn(Arc::clone(self).drive_peer(Arc::clone(&peer), events));

		Some(peer)
	}

	#[instrument(skip_all, fields(peer_id = %peer.id()))]
	async fn drive_peer(self: Arc<Self>, peer: Arc<Peer>, mut events: mpsc::Receiver<LinkEvent>) {
		// Requests are served one at a time, pings are answered as they come
		let (requests_tx, requests_rx) = chan::unbounded();
		let requests = spawn(Arc::clone(&self).serve_requests(Arc::clone(&peer), requests_rx));

		loop {
			let event = tokio::select! {
				() = peer.closed() => break,
				event = events.recv() => event,
			};

			match event {
				Some(LinkEvent::Signal(signal)) => self.send_signal(peer.id(), signal).await,

				Some(LinkEvent::Connected) => {
					peer.mark_connected(self.config.heartbeat());
					info!("Peer link connected;");

					if let Err(e) = peer.send(&PeerMessage::Manifest(self.service.manifest())).await {
						debug!(?e, "Unable to push manifest;");
					}
				}

				Some(LinkEvent::Message(LinkMessage::Text(text))) => {
					match serde_json::from_str::<PeerRequest>(&text) {
						Ok(PeerRequest::Ping { timestamp }) => {
							peer.send(&PeerMessage::Pong { timestamp }).await.ok();
						}
						Ok(PeerRequest::Pong { timestamp }) => {
							peer.record_pong(timestamp, self.config.latency_warning());
						}
						Ok(request) => {
							requests_tx.send(request).await.ok();
						}
						Err(e) => {
							debug!(?e, "Malformed peer request;");
							peer.send(&PeerMessage::Error {
								code: ErrorCode::InvalidRequest,
								message: "Malformed request".to_string(),
							})
							.await
							.ok();
						}
					}
				}

				Some(LinkEvent::Message(LinkMessage::Binary(bytes))) => {
					trace!(len = bytes.len(), "Ignoring binary message from peer;");
				}

				Some(LinkEvent::Closed) | None => {
					info!("Peer link closed;");
					break;
				}
			}
		}

		requests_tx.close();

		{
			let mut peers = self.peers.write().await;
			if peers
				.get(peer.id())
				.is_some_and(|current| Arc::ptr_eq(current, &peer))
			{
				peers.remove(peer.id());
			}
		}

		peer.close().await;

		if let Err(e) = requests.await {
			error!(?e, "Peer request task panicked;");
		}
	}

	async fn serve_requests(self: Arc<Self>, peer: Arc<Peer>, requests: chan::Receiver<PeerRequest>) {
		let framing = self.framing();

		while let Ok(request) = requests.recv().await {
			if !peer.is_connected() {
				break;
			}

			let _streaming = peer.begin_transfer();

			match request {
				PeerRequest::RequestManifest => {
					peer.send(&PeerMessage::Manifest(self.service.manifest())).await.ok();
				}

				PeerRequest::RequestPhoto(request) => match self.service.validate_photo(&request) {
					Ok(spec) => {
						self.deliver(&peer, JobKind::Compressed(spec), &request.photo_id, framing)
							.await
							.ok();
					}
					Err(e) => reject(&peer, e).await,
				},

				PeerRequest::RequestBatch(request) => match self.service.validate_batch(&request) {
					Ok(batch) => {
						info!(photos = batch.photo_ids.len(), "Peer batch requested;");

						for photo_id in &batch.photo_ids {
							if !peer.is_connected() {
								break;
							}

							let res = self
								.deliver(&peer, JobKind::Compressed(batch.spec), photo_id, framing)
								.await;

							if let Err(TransferError::Delivery(e)) = res {
								info!(?e, "Peer link dropped mid batch, stopping;");
								break;
							}
						}
					}
					Err(e) => reject(&peer, e).await,
				},

				PeerRequest::RequestOriginal(request) => {
					if request.photo_id.is_empty() {
						reject(&peer, ValidationError::InvalidRequest("photoId must not be empty")).await;
					} else {
						self.deliver(&peer, JobKind::Original, &request.photo_id, framing)
							.await
							.ok();
					}
				}

				// Answered as they arrive
				PeerRequest::Ping { .. } | PeerRequest::Pong { .. } => {}
			}
		}
	}

	async fn deliver(
		&self,
		peer: &Peer,
		kind: JobKind,
		photo_id: &str,
		framing: Framing,
	) -> Result<(), TransferError> {
		transfer::deliver(&self.service, peer, kind, photo_id, framing)
			.await
			.map(|outcome| {
				debug!(
					photo_id = %outcome.photo_id,
					total_bytes = outcome.total_bytes,
					"Photo delivered to peer;"
				);
			})
	}

	async fn send_signal(&self, peer_id: &str, signal: Signal) {
		let Some(commands) = self.commands.read().await.clone() else {
			warn!(%peer_id, "No relay connection, dropping local signal;");
			return;
		};

		if commands
			.send(RelayCommand::Signal {
				to: peer_id.to_string(),
				signal,
			})
			.await
			.is_err()
		{
			warn!(%peer_id, "Relay connection closed while signaling;");
		}
	}

	async fn mirror_manifest_changes(&self, mut changes: broadcast::Receiver<ManifestChanged>) {
		loop {
			let changed = tokio::select! {
				() = self.cancel.cancelled() => break,
				changed = changes.recv() => changed,
			};

			match changed {
				Ok(changed) => {
					let delivered = self.broadcast(&PeerMessage::ManifestChanged(changed)).await;
					debug!(delivered, "Manifest change mirrored to peers;");
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					warn!(skipped, "Missed manifest changes;");
				}
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	}
}

async fn reject(peer: &Peer, e: ValidationError) {
	warn!(peer_id = %peer.id(), %e, "Rejected peer request;");

	peer.send(&PeerMessage::Error {
		code: e.code(),
		message: e.to_string(),
	})
	.await
	.ok();
}
