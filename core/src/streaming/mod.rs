//! Authenticated WebSocket channel serving the photo protocol to paired devices.

use crate::{
	auth::{Authenticator, SessionContext},
	config::StreamingConfig,
	protocol::PhotoService,
	session::SessionRegistry,
	transfer::TransferWorker,
};

use std::{net::SocketAddr, sync::Arc};

use axum::{
	extract::{ConnectInfo, State, WebSocketUpgrade},
	middleware,
	response::Response,
	routing::get,
	Extension, Json, Router,
};
use serde_json::{json, Value};

mod connection;
mod handshake;

pub use handshake::authenticate;

/// Everything a streaming connection needs, shared by all of them.
pub struct StreamingState {
	pub authenticator: Arc<Authenticator>,
	pub sessions: Arc<SessionRegistry>,
	pub service: Arc<PhotoService>,
	pub worker: Arc<TransferWorker>,
	pub settings: StreamingConfig,
}

/// `/ws` only upgrades requests the authentication layer let through, `/health` is open.
pub fn router(state: Arc<StreamingState>) -> Router {
	Router::new()
		.route("/ws", get(upgrade))
		.route_layer(middleware::from_fn_with_state(
			Arc::clone(&state),
			authenticate,
		))
		.route("/health", get(health))
		.with_state(state)
}

async fn upgrade(
	State(state): State<Arc<StreamingState>>,
	Extension(context): Extension<SessionContext>,
	ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
	ws: WebSocketUpgrade,
) -> Response {
	ws.on_upgrade(move |socket| connection::serve(state, socket, context, remote_addr))
}

async fn health(State(state): State<Arc<StreamingState>>) -> Json<Value> {
	Json(json!({
		"status": "ok",
		"photos": state.service.catalog().snapshot().len(),
		"sessions": state.sessions.len().await,
	}))
}

#[cfg(test)]
pub(crate) mod test_utils {
	use super::*;
	use crate::{
		auth::{DeviceToken, JsonTokenStore, RateLimiter, DEFAULT_CACHE_TTL, TOKEN_STORE_FILE_NAME},
		cache::RenditionCache,
		catalog::{Catalog, PhotoRecord},
		transfer::Framing,
	};

	use tempfile::{tempdir, TempDir};

	pub struct Fixture {
		pub dir: TempDir,
		pub store: Arc<JsonTokenStore>,
		pub token: DeviceToken,
		pub state: Arc<StreamingState>,
	}

	pub async fn fixture(photos: Vec<PhotoRecord>) -> Fixture {
		let dir = tempdir().unwrap();

		let store = Arc::new(JsonTokenStore::new(dir.path().join(TOKEN_STORE_FILE_NAME)));
		let token = DeviceToken::issue("device-1", "Test Phone", "user-1", None);
		store.insert(token.clone()).await.unwrap();

		let service = Arc::new(PhotoService::new(
			Arc::new(Catalog::new(photos)),
			Arc::new(RenditionCache::new(dir.path().join("renditions"))),
			100,
		));

		let state = Arc::new(StreamingState {
			authenticator: Arc::new(Authenticator::new(
				store.clone(),
				RateLimiter::default(),
				DEFAULT_CACHE_TTL,
			)),
			sessions: Arc::new(SessionRegistry::new()),
			worker: Arc::new(TransferWorker::spawn(
				Arc::clone(&service),
				Framing::STREAMING,
			)),
			service,
			settings: StreamingConfig::default(),
		});

		Fixture {
			dir,
			store,
			token,
			state,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{test_utils::fixture, *};

	use axum::{
		body::{to_bytes, Body},
		extract::connect_info::MockConnectInfo,
		http::{Request, StatusCode},
	};
	use tower::ServiceExt;
	use tracing_test::traced_test;

	#[tokio::test]
	#[traced_test]
	async fn health_needs_no_credentials() {
		let fixture = fixture(Vec::new()).await;
		let app = router(fixture.state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1))));

		let response = app
			.oneshot(Request::get("/health").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let body: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(body, json!({ "status": "ok", "photos": 0, "sessions": 0 }));
	}

	#[tokio::test]
	#[traced_test]
	async fn websocket_route_is_behind_authentication() {
		let fixture = fixture(Vec::new()).await;
		let app = router(fixture.state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1))));

		let response = app
			.oneshot(Request::get("/ws").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
	}
}
