use super::StreamingState;
use crate::auth::{AuthRejection, Handshake};

use std::{net::SocketAddr, sync::Arc};

use axum::{
	extract::{ConnectInfo, Query, Request, State},
	http::{header, HeaderMap, StatusCode},
	middleware::Next,
	response::{IntoResponse, Response},
	Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeParams {
	token: Option<String>,
	device_name: Option<String>,
	device_version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
	code: &'static str,
	message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	retry_after: Option<u64>,
}

/// Authenticates the upgrade request, a rejected client never reaches the WebSocket handler.
///
/// On success the [`SessionContext`](crate::auth::SessionContext) is stored in the request
/// extensions.
pub async fn authenticate(
	State(state): State<Arc<StreamingState>>,
	ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
	mut request: Request,
	next: Next,
) -> Response {
	let handshake = read_handshake(&request);

	match state
		.authenticator
		.authenticate(&handshake, remote_addr.ip())
		.await
	{
		Ok(context) => {
			request.extensions_mut().insert(context);
			next.run(request).await
		}
		Err(rejection) => rejection.into_response(),
	}
}

fn read_handshake(request: &Request) -> Handshake {
	let params = Query::<HandshakeParams>::try_from_uri(request.uri())
		.map(|Query(params)| params)
		.unwrap_or_default();

	let headers = request.headers();

	Handshake {
		// The header wins over the query string when both are present
		token: bearer_token(headers).or(params.token),
		device_name: params.device_name,
		device_version: params.device_version,
		user_agent: headers
			.get(header::USER_AGENT)
			.and_then(|value| value.to_str().ok())
			.map(str::to_string),
	}
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
	headers
		.get(header::AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
		.map(|token| token.trim().to_string())
}

impl IntoResponse for AuthRejection {
	fn into_response(self) -> Response {
		let status = match self {
			Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
			Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::UNAUTHORIZED,
		};

		let body = Json(RejectionBody {
			code: self.code(),
			message: match &self {
				Self::Unavailable(_) => "Authentication is temporarily unavailable".to_string(),
				rejection => rejection.to_string(),
			},
			retry_after: self.retry_after(),
		});

		match self.retry_after() {
			Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
			None => (status, body).into_response(),
		}
	}
}
