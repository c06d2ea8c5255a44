use super::StreamingState;
use crate::{
	auth::SessionContext,
	protocol::{ClientRequest, ErrorCode, PhotoError, PhotoService, ServerEvent, ValidationError},
	session::{Outbound, Session},
	transfer::{JobKind, TransferError, TransferJob, TransferTarget},
};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{
	stream::{SplitSink, SplitStream},
	SinkExt, StreamExt,
};
use tokio::{
	spawn,
	sync::mpsc,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, trace, warn};

/// Drives one authenticated socket until either side goes away.
#[instrument(skip_all, fields(device_id = %context.device_id, %remote_addr))]
pub(super) async fn serve(
	state: Arc<StreamingState>,
	socket: WebSocket,
	context: SessionContext,
	remote_addr: SocketAddr,
) {
	let (session, outbound_rx) = Session::new(context, remote_addr);
	state.sessions.register(Arc::clone(&session)).await;

	info!(
		session_id = %session.id(),
		user_id = %session.context().user_id,
		device_name = %session.context().device_name,
		device_class = ?session.context().device_class,
		"Session connected;"
	);

	let (sink, stream) = socket.split();

	let writer = spawn(write_loop(
		sink,
		outbound_rx,
		Arc::clone(&session),
		state.settings.transport_ping(),
	));

	read_loop(&state, &session, stream).await;

	session.disconnect();
	state.sessions.remove(session.id()).await;

	if let Err(e) = writer.await {
		error!(?e, "Session writer panicked;");
	}

	info!(
		session_id = %session.id(),
		connected_secs = (chrono::Utc::now() - session.connected_at()).num_seconds(),
		"Session disconnected;"
	);
}

async fn read_loop(state: &Arc<StreamingState>, session: &Arc<Session>, mut stream: SplitStream<WebSocket>) {
	loop {
		let message = tokio::select! {
			() = session.cancelled().cancelled() => break,
			message = stream.next() => message,
		};

		match message {
			Some(Ok(Message::Text(text))) => handle_text(state, session, &text).await,
			Some(Ok(Message::Binary(_))) => {
				reply(
					session,
					request_error(ErrorCode::InvalidRequest, "Binary frames are not accepted"),
				)
				.await;
			}
			// Transport pings are answered by axum itself
			Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
			Some(Ok(Message::Close(frame))) => {
				debug!(?frame, "Client closed the connection;");
				break;
			}
			Some(Err(e)) => {
				debug!(?e, "Socket read failed;");
				break;
			}
			None => break,
		}
	}
}

async fn write_loop(
	mut sink: SplitSink<WebSocket, Message>,
	mut outbound_rx: mpsc::Receiver<Outbound>,
	session: Arc<Session>,
	ping_every: Duration,
) {
	let mut ping = interval_at(Instant::now() + ping_every, ping_every);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		let message = tokio::select! {
			// Queued frames first, a close requested right before cancelling still goes out
			biased;

			frame = outbound_rx.recv() => match frame {
				Some(Outbound::Event(event)) => match serde_json::to_string(&event) {
					Ok(text) => Message::Text(text),
					Err(e) => {
						error!(?e, "Failed to serialize event;");
						continue;
					}
				},
				Some(Outbound::Binary(bytes)) => Message::Binary(Vec::from(bytes)),
				Some(Outbound::Close { code, reason }) => {
					let close = Message::Close(Some(CloseFrame {
						code,
						reason: reason.into(),
					}));
					if let Err(e) = sink.send(close).await {
						debug!(?e, "Failed to send close frame;");
					}
					break;
				}
				None => break,
			},

			() = session.cancelled().cancelled() => break,

			_ = ping.tick() => Message::Ping(Vec::new()),
		};

		if let Err(e) = sink.send(message).await {
			debug!(?e, "Socket write failed;");
			session.disconnect();
			break;
		}
	}

	sink.close().await.ok();
	trace!(session_id = %session.id(), "Session writer stopped;");
}

/// Parses one text frame and serves it, long running requests continue in their own task.
pub(super) async fn handle_text(state: &Arc<StreamingState>, session: &Arc<Session>, text: &str) {
	match serde_json::from_str::<ClientRequest>(text) {
		Ok(request) => handle_request(state, session, request).await,
		Err(e) => {
			debug!(?e, "Malformed client request;");
			reply(
				session,
				request_error(ErrorCode::InvalidRequest, "Malformed request"),
			)
			.await;
		}
	}
}

async fn handle_request(state: &Arc<StreamingState>, session: &Arc<Session>, request: ClientRequest) {
	let service = &state.service;

	match request {
		ClientRequest::Manifest => {
			let manifest = service.manifest();
			debug!(count = manifest.count, hash = %manifest.hash, "Sending manifest;");
			reply(session, ServerEvent::Manifest(manifest)).await;
		}

		ClientRequest::Folders => {
			let roots = service.folders().to_vec();
			reply(session, ServerEvent::Folders { roots }).await;
		}

		ClientRequest::Ping { timestamp } => reply(session, ServerEvent::Pong { timestamp }).await,

		ClientRequest::Batch(request) => match service.validate_batch(&request) {
			Ok(batch) => {
				info!(
					session_id = %session.id(),
					photos = batch.photo_ids.len(),
					quality = batch.spec.quality,
					max_dimension = batch.spec.max_dimension,
					"Batch requested;"
				);

				reply(
					session,
					ServerEvent::BatchStarted {
						total_photos: batch.photo_ids.len(),
						estimated_time: PhotoService::estimate_renditions(
							batch.photo_ids.len(),
						),
					},
				)
				.await;

				spawn(run_batch(
					Arc::clone(state),
					Arc::clone(session),
					JobKind::Compressed(batch.spec),
					batch.photo_ids,
				));
			}
			Err(e) => reply_invalid(session, e).await,
		},

		ClientRequest::Originals(request) => match service.validate_originals(&request) {
			Ok(plan) => {
				info!(
					session_id = %session.id(),
					found = plan.found.len(),
					not_found = plan.not_found.len(),
					total_size = plan.total_size,
					"Originals requested;"
				);

				reply(
					session,
					ServerEvent::OriginalsStarted {
						found: plan.found.len(),
						not_found: plan.not_found.len(),
						total_size: plan.total_size,
						estimated_time: PhotoService::estimate_originals(
							plan.found.len(),
							plan.total_size,
						),
					},
				)
				.await;

				for photo_id in plan.not_found {
					let error = TransferError::PhotoNotFound(photo_id.clone());
					reply(
						session,
						ServerEvent::PhotoError(PhotoError {
							photo_id,
							code: ErrorCode::PhotoNotFound,
							message: error.client_message().to_string(),
						}),
					)
					.await;
				}

				spawn(run_originals(
					Arc::clone(state),
					Arc::clone(session),
					plan.found,
				));
			}
			Err(e) => reply_invalid(session, e).await,
		},

		ClientRequest::Photo(request) => match service.validate_photo(&request) {
			Ok(spec) => {
				spawn(run_single(
					Arc::clone(state),
					Arc::clone(session),
					JobKind::Compressed(spec),
					request.photo_id,
				));
			}
			Err(e) => reply_invalid(session, e).await,
		},

		ClientRequest::Original(request) => {
			if request.photo_id.is_empty() {
				reply_invalid(
					session,
					ValidationError::InvalidRequest("photoId must not be empty"),
				)
				.await;
			} else {
				spawn(run_single(
					Arc::clone(state),
					Arc::clone(session),
					JobKind::Original,
					request.photo_id,
				));
			}
		}
	}
}

async fn run_single(state: Arc<StreamingState>, session: Arc<Session>, kind: JobKind, photo_id: String) {
	let _active = session.begin_transfer();

	let handle = state
		.worker
		.enqueue(TransferJob {
			kind,
			photo_id,
			target: Arc::clone(&session) as Arc<dyn TransferTarget>,
		})
		.await;

	// Failures already reached the client as `photo-error`
	if let Err(e) = handle.wait().await {
		trace!(?e, "Single photo request ended without delivery;");
	}
}

async fn run_batch(state: Arc<StreamingState>, session: Arc<Session>, kind: JobKind, photo_ids: Vec<String>) {
	let _active = session.begin_transfer();
	let total = photo_ids.len();

	let mut handles = Vec::with_capacity(total);
	for photo_id in photo_ids {
		handles.push(
			state
				.worker
				.enqueue(TransferJob {
					kind,
					photo_id,
					target: Arc::clone(&session) as Arc<dyn TransferTarget>,
				})
				.await,
		);
	}

	let (mut succeeded, mut failed) = (0, 0);

	for handle in handles {
		match handle.wait().await {
			Ok(_) => succeeded += 1,
			Err(TransferError::Delivery(e)) => {
				// The rest of the queue is skipped by the worker once it sees the session gone
				debug!(?e, session_id = %session.id(), "Session went away mid batch;");
				return;
			}
			Err(_) => failed += 1,
		}
	}

	info!(
		session_id = %session.id(),
		total,
		succeeded,
		failed,
		"Batch complete;"
	);

	reply(
		&session,
		ServerEvent::BatchComplete {
			total,
			succeeded,
			failed,
		},
	)
	.await;
}

async fn run_originals(state: Arc<StreamingState>, session: Arc<Session>, photo_ids: Vec<String>) {
	let _active = session.begin_transfer();
	let total = photo_ids.len();
	let every = state.settings.progress_interval.max(1);

	let mut handles = Vec::with_capacity(total);
	for photo_id in photo_ids {
		handles.push(
			state
				.worker
				.enqueue(TransferJob {
					kind: JobKind::Original,
					photo_id,
					target: Arc::clone(&session) as Arc<dyn TransferTarget>,
				})
				.await,
		);
	}

	let mut completed = 0;

	for handle in handles {
		if let Err(TransferError::Delivery(e)) = handle.wait().await {
			debug!(?e, session_id = %session.id(), "Session went away mid originals batch;");
			return;
		}

		completed += 1;

		if completed % every == 0 || completed == total {
			reply(&session, ServerEvent::BatchProgress { completed, total }).await;
		}
	}

	info!(session_id = %session.id(), total, "Originals batch complete;");
}

fn request_error(code: ErrorCode, message: impl Into<String>) -> ServerEvent {
	ServerEvent::RequestError {
		code,
		message: message.into(),
	}
}

async fn reply_invalid(session: &Session, e: ValidationError) {
	warn!(session_id = %session.id(), %e, "Rejected client request;");
	reply(session, request_error(e.code(), e.to_string())).await;
}

async fn reply(session: &Session, event: ServerEvent) {
	if let Err(e) = session.send_event(event).await {
		trace!(?e, session_id = %session.id(), "Dropping reply, session is gone;");
	}
}

#[cfg(test)]
mod tests {
	use super::{super::test_utils::fixture, *};
	use crate::{
		catalog::test_utils::write_png,
		protocol::{checksum, PhotoComplete},
		session::test_utils::context,
	};

	use bytes::Bytes;
	use serde_json::json;
	use tempfile::tempdir;
	use tokio::time::timeout;
	use tracing_test::traced_test;

	fn open() -> (Arc<Session>, mpsc::Receiver<Outbound>) {
		Session::new(
			context("user-1", "device-1", &"a".repeat(64)),
			SocketAddr::from(([192, 168, 1, 2], 50_000)),
		)
	}

	/// Collects frames until `done` matches one of them.
	async fn collect_until(
		rx: &mut mpsc::Receiver<Outbound>,
		done: impl Fn(&Outbound) -> bool,
	) -> Vec<Outbound> {
		let mut frames = Vec::new();

		timeout(Duration::from_secs(20), async {
			while let Some(frame) = rx.recv().await {
				let stop = done(&frame);
				frames.push(frame);
				if stop {
					break;
				}
			}
		})
		.await
		.unwrap();

		frames
	}

	fn events(frames: &[Outbound]) -> Vec<&ServerEvent> {
		frames
			.iter()
			.filter_map(|frame| match frame {
				Outbound::Event(event) => Some(event),
				_ => None,
			})
			.collect()
	}

	#[tokio::test]
	#[traced_test]
	async fn malformed_and_invalid_requests_are_reported() {
		let fixture = fixture(Vec::new()).await;
		let (session, mut rx) = open();

		handle_text(&fixture.state, &session, "definitely not json").await;
		handle_text(&fixture.state, &session, r#"{"type":"batch","photoIds":[]}"#).await;

		let ids = (0..101).map(|i| i.to_string()).collect::<Vec<_>>();
		handle_text(
			&fixture.state,
			&session,
			&json!({ "type": "batch", "photoIds": ids }).to_string(),
		)
		.await;
		handle_text(
			&fixture.state,
			&session,
			r#"{"type":"photo","photoId":"x","quality":0}"#,
		)
		.await;

		let codes = (0..4)
			.map(|_| match rx.try_recv().unwrap() {
				Outbound::Event(ServerEvent::RequestError { code, .. }) => code,
				other => panic!("unexpected frame {other:?}"),
			})
			.collect::<Vec<_>>();

		assert_eq!(
			codes,
			[
				ErrorCode::InvalidRequest,
				ErrorCode::InvalidRequest,
				ErrorCode::BatchTooLarge,
				ErrorCode::InvalidQuality,
			]
		);
		// Nothing was started for any of them
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	#[traced_test]
	async fn ping_manifest_and_folders_are_answered_inline() {
		let photos = tempdir().unwrap();
		let photo = write_png(photos.path(), "a.png", 8, 8);
		let fixture = fixture(vec![photo.clone()]).await;
		let (session, mut rx) = open();

		handle_text(&fixture.state, &session, r#"{"type":"ping","timestamp":42}"#).await;
		handle_text(&fixture.state, &session, r#"{"type":"manifest"}"#).await;
		handle_text(&fixture.state, &session, r#"{"type":"folders"}"#).await;

		assert_eq!(
			rx.try_recv().unwrap(),
			Outbound::Event(ServerEvent::Pong { timestamp: 42 })
		);

		let Outbound::Event(ServerEvent::Manifest(manifest)) = rx.try_recv().unwrap() else {
			panic!("expected a manifest");
		};
		assert_eq!(manifest.count, 1);
		assert_eq!(manifest.photos[0].id, photo.id);

		let Outbound::Event(ServerEvent::Folders { roots }) = rx.try_recv().unwrap() else {
			panic!("expected the folder tree");
		};
		assert_eq!(roots.len(), 1);
	}

	#[tokio::test]
	#[traced_test]
	async fn batch_with_a_missing_photo_completes_the_others() {
		let photos = tempdir().unwrap();
		let a = write_png(photos.path(), "a.png", 64, 40);
		let b = write_png(photos.path(), "b.png", 40, 64);
		let fixture = fixture(vec![a.clone(), b.clone()]).await;
		let (session, mut rx) = open();

		handle_text(
			&fixture.state,
			&session,
			&json!({
				"type": "batch",
				"photoIds": [a.id, "missing", b.id],
				"quality": 70,
				"maxDimension": 32
			})
			.to_string(),
		)
		.await;

		let frames = collect_until(&mut rx, |frame| {
			matches!(frame, Outbound::Event(ServerEvent::BatchComplete { .. }))
		})
		.await;
		let events = events(&frames);

		assert_eq!(
			events[0],
			&ServerEvent::BatchStarted {
				total_photos: 3,
				estimated_time: 1,
			}
		);
		assert!(events.iter().any(|event| matches!(
			event,
			ServerEvent::PhotoError(PhotoError { photo_id, code: ErrorCode::PhotoNotFound, .. })
				if photo_id == "missing"
		)));

		// Every completion carries the checksum of the bytes sent right before it
		let mut payload = Vec::<u8>::new();
		let mut completed = Vec::new();
		for frame in &frames {
			match frame {
				Outbound::Event(ServerEvent::PhotoStart(_)) => payload.clear(),
				Outbound::Binary(bytes) => payload.extend_from_slice(bytes),
				Outbound::Event(ServerEvent::PhotoComplete(PhotoComplete {
					photo_id,
					total_bytes,
					checksum: sum,
				})) => {
					assert_eq!(*total_bytes, payload.len() as u64);
					assert_eq!(sum, &checksum(&payload));
					completed.push(photo_id.clone());
				}
				_ => {}
			}
		}
		assert_eq!(completed, [a.id.clone(), b.id.clone()]);

		assert_eq!(
			events.last(),
			Some(&&ServerEvent::BatchComplete {
				total: 3,
				succeeded: 2,
				failed: 1,
			})
		);
	}

	#[tokio::test]
	#[traced_test]
	async fn originals_report_unknown_ids_and_progress() {
		let photos = tempdir().unwrap();
		let a = write_png(photos.path(), "a.png", 16, 16);
		let raw = std::fs::read(&a.path).unwrap();
		let fixture = fixture(vec![a.clone()]).await;
		let (session, mut rx) = open();

		handle_text(
			&fixture.state,
			&session,
			&json!({ "type": "originals", "photoIds": [a.id, "gone"] }).to_string(),
		)
		.await;

		let frames = collect_until(&mut rx, |frame| {
			matches!(frame, Outbound::Event(ServerEvent::BatchProgress { .. }))
		})
		.await;

		assert!(matches!(
			frames[0],
			Outbound::Event(ServerEvent::OriginalsStarted {
				found: 1,
				not_found: 1,
				..
			})
		));
		assert!(matches!(
			&frames[1],
			Outbound::Event(ServerEvent::PhotoError(PhotoError { photo_id, .. })) if photo_id == "gone"
		));
		assert!(frames.contains(&Outbound::Binary(Bytes::from(raw))));
		assert_eq!(
			frames.last(),
			Some(&Outbound::Event(ServerEvent::BatchProgress {
				completed: 1,
				total: 1,
			}))
		);
	}

	#[tokio::test]
	#[traced_test]
	async fn single_photo_requests_go_through_the_worker() {
		let photos = tempdir().unwrap();
		let a = write_png(photos.path(), "a.png", 30, 20);
		let fixture = fixture(vec![a.clone()]).await;
		let (session, mut rx) = open();

		handle_text(
			&fixture.state,
			&session,
			&json!({ "type": "photo", "photoId": a.id }).to_string(),
		)
		.await;

		let frames = collect_until(&mut rx, |frame| {
			matches!(frame, Outbound::Event(ServerEvent::PhotoComplete(_)))
		})
		.await;

		let Outbound::Event(ServerEvent::PhotoStart(start)) = &frames[0] else {
			panic!("expected photo start");
		};
		assert_eq!(start.mime, "image/jpeg");
		assert_eq!(frames.len(), 3);
	}
}
