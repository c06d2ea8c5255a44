use super::{deliver, DeliveryError, Framing, JobKind, TransferError, TransferOutcome, TransferTarget};
use crate::protocol::PhotoService;

use std::sync::Arc;

use async_channel as chan;
use tokio::{
	spawn,
	sync::{oneshot, Mutex},
	task::JoinHandle,
};
use tracing::{debug, error, info, trace};

pub struct TransferJob {
	pub kind: JobKind,
	pub photo_id: String,
	pub target: Arc<dyn TransferTarget>,
}

struct QueuedJob {
	job: TransferJob,
	done_tx: oneshot::Sender<Result<TransferOutcome, TransferError>>,
}

/// Resolves once the job reached a terminal state.
#[derive(Debug)]
pub struct JobHandle {
	done_rx: oneshot::Receiver<Result<TransferOutcome, TransferError>>,
}

impl JobHandle {
	pub async fn wait(self) -> Result<TransferOutcome, TransferError> {
		self.done_rx
			.await
			.unwrap_or(Err(TransferError::WorkerStopped))
	}
}

/// Single flight queue in front of every streaming transfer.
///
/// Jobs run one at a time in the order they were enqueued, whichever session they belong to.
pub struct TransferWorker {
	jobs_tx: chan::Sender<QueuedJob>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransferWorker {
	pub fn spawn(service: Arc<PhotoService>, framing: Framing) -> Self {
		let (jobs_tx, jobs_rx) = chan::unbounded();

		let handle = spawn(Self::run(service, framing, jobs_rx));

		Self {
			jobs_tx,
			handle: Mutex::new(Some(handle)),
		}
	}

	pub async fn enqueue(&self, job: TransferJob) -> JobHandle {
		let (done_tx, done_rx) = oneshot::channel();

		if let Err(chan::SendError(QueuedJob { job, done_tx })) =
			self.jobs_tx.send(QueuedJob { job, done_tx }).await
		{
			debug!(photo_id = %job.photo_id, "Transfer worker is stopped, rejecting job;");
			done_tx.send(Err(TransferError::WorkerStopped)).ok();
		}

		JobHandle { done_rx }
	}

	/// Number of jobs waiting, the running one excluded.
	pub fn queued(&self) -> usize {
		self.jobs_tx.len()
	}

	/// Stops accepting jobs and waits for the queued ones to drain.
	pub async fn shutdown(&self) {
		self.jobs_tx.close();

		if let Some(handle) = self.handle.lock().await.take() {
			if let Err(e) = handle.await {
				error!(?e, "Transfer worker panicked;");
			}
		}

		info!("Transfer worker stopped;");
	}

	async fn run(service: Arc<PhotoService>, framing: Framing, jobs_rx: chan::Receiver<QueuedJob>) {
		while let Ok(QueuedJob { job, done_tx }) = jobs_rx.recv().await {
			let TransferJob {
				kind,
				photo_id,
				target,
			} = job;

			if !target.is_connected() {
				trace!(%photo_id, to = %target.label(), "Skipping job, target already disconnected;");
				done_tx.send(Err(DeliveryError::Disconnected.into())).ok();
				continue;
			}

			// Each job gets its own task so a panic while rendering only fails that job
			let res = spawn({
				let service = Arc::clone(&service);
				let photo_id = photo_id.clone();
				async move { deliver(&service, &*target, kind, &photo_id, framing).await }
			})
			.await
			.unwrap_or_else(|e| {
				error!(%photo_id, ?e, "Transfer job panicked;");
				Err(TransferError::Processing(e.to_string()))
			});

			// Nobody waiting on the result is fine, the session may have moved on
			done_tx.send(res).ok();
		}

		debug!("Transfer worker queue closed;");
	}
}
