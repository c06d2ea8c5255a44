use super::{AuthRejection, Authenticator};
use crate::{
	protocol::{AuthRevoked, ServerEvent},
	session::{SessionRegistry, CLOSE_AUTH_REVOKED},
};

use std::{sync::Arc, time::Duration};

use async_channel as chan;
use chrono::Utc;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Re-validates every live session, disconnecting the ones whose token stopped validating.
///
/// Returns how many sessions were revoked.
pub async fn sweep(authenticator: &Authenticator, sessions: &SessionRegistry) -> usize {
	let mut revoked = 0;

	for session in sessions.all().await {
		let reason = match authenticator.validate_token(&session.context().token).await {
			Ok(_) => continue,
			Err(AuthRejection::Unavailable(e)) => {
				// Can't tell either way, keep the session and try again next cycle
				warn!(%e, "Unable to re-validate sessions;");
				return revoked;
			}
			Err(reason) => reason,
		};

		info!(
			session_id = %session.id(),
			device_id = %session.context().device_id,
			code = reason.code(),
			"Session credential no longer valid, disconnecting;"
		);

		let notice = ServerEvent::AuthRevoked(AuthRevoked {
			reason: reason.code().to_string(),
			message: format!("Device access ended: {reason}"),
			timestamp: Utc::now(),
		});

		// The session is dropped whether or not its client still reads
		if let Err(e) = session.notify(notice) {
			debug!(?e, "Revocation notice not queued;");
		}

		session.close(CLOSE_AUTH_REVOKED, reason.code());
		sessions.remove(session.id()).await;

		revoked += 1;
	}

	revoked
}

/// Keeps live sessions in line with the token store.
///
/// Every `tick`, and whenever the store's file changes, the token cache is dropped and all
/// sessions are swept. A revoked token is noticed within one tick even when nothing changes on
/// disk.
pub fn spawn_revocation_watch(
	authenticator: Arc<Authenticator>,
	sessions: Arc<SessionRegistry>,
	tick: Duration,
	cancel: CancellationToken,
) -> JoinHandle<()> {
	let (changes_tx, changes_rx) = chan::bounded::<()>(1);

	let watcher = authenticator.store().watch_path().and_then(|path| {
		// The store replaces its file on write, so we watch the directory holding it
		let dir = path.parent()?.to_path_buf();
		let file_name = path.file_name()?.to_os_string();

		let mut watcher = RecommendedWatcher::new(
			move |result: notify::Result<notify::Event>| match result {
				Ok(event) if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) => {
					// Full means a sweep is already pending
					changes_tx.try_send(()).ok();
				}
				Ok(_) => {}
				Err(e) => error!(?e, "Token store watcher error;"),
			},
			Config::default(),
		)
		.map_err(|e| warn!(?e, "Unable to create token store watcher, polling only;"))
		.ok()?;

		watcher
			.watch(&dir, RecursiveMode::NonRecursive)
			.map_err(|e| warn!(?e, dir = %dir.display(), "Unable to watch token store, polling only;"))
			.ok()?;

		Some(watcher)
	});

	spawn(async move {
		// Dropping the watcher stops the notifications
		let _watcher = watcher;

		let mut ticker = interval(tick);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				() = cancel.cancelled() => break,
				_ = ticker.tick() => {}
				Ok(()) = changes_rx.recv() => {
					debug!("Token store changed;");
				}
			}

			authenticator.invalidate_cache().await;

			let revoked = sweep(&authenticator, &sessions).await;
			if revoked > 0 {
				info!(revoked, "Revoked sessions disconnected;");
			}
		}

		debug!("Revocation watch stopped;");
	})
}
