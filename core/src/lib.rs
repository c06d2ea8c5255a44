//! Transfer and session engine of the photo stream host.
//!
//! Two transports serve the same library: the authenticated [`streaming`] channel, which
//! funnels all compression through the single [`transfer::TransferWorker`], and the
//! [`p2p`] manager, which negotiates links through a signaling relay and streams inline.
//! Both go through [`protocol::PhotoService`] for manifests, validation and renditions.

#![warn(
	clippy::all,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::unwrap_used,
	clippy::expect_used,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::dbg_macro
)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod node;
pub mod p2p;
pub mod protocol;
pub mod session;
pub mod streaming;
pub mod transfer;

pub use config::NodeConfig;
pub use node::{Node, NodeError};
