//! Peer to peer channel.
//!
//! Both ends join a persistent rendezvous on an external signaling relay, negotiate a data link
//! through it and then speak a flat `type` tagged JSON protocol over the link. The relay and the
//! link implementation are collaborators behind [`SignalingRelay`] and [`LinkFactory`].

use ps_utils::error::FileIOError;

use thiserror::Error;

mod link;
mod manager;
mod peer;
mod rendezvous;
mod signaling;
mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use link::{DataLink, LinkEvent, LinkFactory, LinkHandle, LinkMessage};
pub use manager::P2pManager;
pub use peer::{Peer, PeerState};
pub use rendezvous::{RoomId, ROOM_FILE_NAME};
pub use signaling::{RelayCommand, RelayConnection, RelayEvent, Signal, SignalingRelay};
pub use wire::{PeerMessage, PeerRequest};

#[derive(Error, Debug)]
pub enum P2pError {
	#[error("invalid room id '{0}', expected 16 lowercase hex characters")]
	InvalidRoomId(String),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("signaling relay unavailable: {0}")]
	Relay(String),
	#[error("data link failure: {0}")]
	Link(String),
	#[error("data link is closed")]
	LinkClosed,
}
