//! Live authenticated streaming sessions.

use crate::{
	auth::SessionContext,
	protocol::ServerEvent,
	transfer::{DeliveryError, TransferTarget},
};

use std::{
	net::SocketAddr,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

mod registry;

pub use registry::SessionRegistry;

/// Frames waiting to be written to a session's socket.
const OUTBOUND_CAPACITY: usize = 32;

/// How long a frame may wait for room in a full queue before the session counts as stalled.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code sent along the connection teardown when a session's token stops validating.
pub const CLOSE_AUTH_REVOKED: u16 = 4001;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
	Event(ServerEvent),
	Binary(Bytes),
	Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// At least one batch or single photo request is being served
	Active,
	Idle,
	Disconnected,
}

#[derive(Debug)]
pub struct Session {
	id: Uuid,
	context: SessionContext,
	remote_addr: SocketAddr,
	connected_at: DateTime<Utc>,
	outbound: mpsc::Sender<Outbound>,
	cancel: CancellationToken,
	in_flight: AtomicUsize,
}

impl Session {
	/// Creates the session and the receiving end its connection writer drains.
	pub fn new(context: SessionContext, remote_addr: SocketAddr) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
		let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

		(
			Arc::new(Self {
				id: Uuid::new_v4(),
				context,
				remote_addr,
				connected_at: Utc::now(),
				outbound,
				cancel: CancellationToken::new(),
				in_flight: AtomicUsize::new(0),
			}),
			outbound_rx,
		)
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn context(&self) -> &SessionContext {
		&self.context
	}

	pub fn remote_addr(&self) -> SocketAddr {
		self.remote_addr
	}

	pub fn connected_at(&self) -> DateTime<Utc> {
		self.connected_at
	}

	/// Groups this session is joined into for targeted broadcasts.
	pub fn groups(&self) -> [String; 2] {
		[
			format!("user:{}", self.context.user_id),
			format!("device:{}", self.context.device_id),
		]
	}

	pub fn cancelled(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn state(&self) -> SessionState {
		if !self.is_connected() {
			SessionState::Disconnected
		} else if self.in_flight.load(Ordering::Acquire) > 0 {
			SessionState::Active
		} else {
			SessionState::Idle
		}
	}

	/// Marks the session active until the returned guard is dropped.
	pub fn begin_transfer(self: &Arc<Self>) -> InFlightGuard {
		self.in_flight.fetch_add(1, Ordering::AcqRel);
		InFlightGuard {
			session: Arc::clone(self),
		}
	}

	/// Aborts pending sends, the connection tears itself down once it notices.
	pub fn disconnect(&self) {
		self.cancel.cancel();
	}

	/// Queues `event` only if there is room right now.
	///
	/// Notices fanned out to many sessions go through here, a client that stopped reading
	/// misses them instead of holding up everyone else.
	pub fn notify(&self, event: ServerEvent) -> Result<(), DeliveryError> {
		if self.cancel.is_cancelled() {
			return Err(DeliveryError::Disconnected);
		}

		self.outbound
			.try_send(Outbound::Event(event))
			.map_err(|e| match e {
				mpsc::error::TrySendError::Full(_) => DeliveryError::Stalled(Duration::ZERO),
				mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
			})
	}

	/// Asks the connection writer to send a close frame, then disconnects.
	///
	/// Never waits: with a full queue the frame is dropped and the socket is torn down anyway.
	pub fn close(&self, code: u16, reason: impl Into<String>) {
		if !self.cancel.is_cancelled() {
			let reason = reason.into();
			if self
				.outbound
				.try_send(Outbound::Close { code, reason })
				.is_err()
			{
				debug!(session_id = %self.id, code, "No room for the close frame, dropping the socket;");
			}
		}

		self.disconnect();
	}

	async fn push(&self, frame: Outbound) -> Result<(), DeliveryError> {
		let sent = tokio::select! {
			biased;
			() = self.cancel.cancelled() => return Err(DeliveryError::Disconnected),
			res = timeout(SEND_TIMEOUT, self.outbound.send(frame)) => res,
		};

		match sent {
			Ok(res) => res.map_err(|_| DeliveryError::Disconnected),
			Err(_) => {
				warn!(
					session_id = %self.id,
					device_id = %self.context.device_id,
					"Session stopped reading, disconnecting;"
				);
				self.disconnect();
				Err(DeliveryError::Stalled(SEND_TIMEOUT))
			}
		}
	}
}

#[derive(Debug)]
pub struct InFlightGuard {
	session: Arc<Session>,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.session.in_flight.fetch_sub(1, Ordering::AcqRel);
	}
}

#[async_trait]
impl TransferTarget for Session {
	fn label(&self) -> String {
		format!("session:{}", self.id)
	}

	fn is_connected(&self) -> bool {
		!self.cancel.is_cancelled() && !self.outbound.is_closed()
	}

	async fn send_event(&self, event: ServerEvent) -> Result<(), DeliveryError> {
		self.push(Outbound::Event(event)).await
	}

	async fn send_binary(&self, bytes: Bytes) -> Result<(), DeliveryError> {
		self.push(Outbound::Binary(bytes)).await
	}
}
