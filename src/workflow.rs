use std::{future::Future, path::PathBuf, time::Duration};

use bytes::Bytes;
use eyre::eyre;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;

use crate::{AssetStatus, Content, GenerationConfig, MediaKind, RemoteAsset, RemoteStore, Response, ScratchFile, WorkflowError};

/// Whether the remote copy is deleted when a run does not end in a generated response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CleanupPolicy {
	/// Leave failed assets on the remote store, so they can be inspected.
	#[default]
	SuccessOnly,
	Always,
}

/// Bounded retry for calls that are safe to repeat (status queries and deletes). Generation is never retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Total attempts, including the first one. 1 means no retry.
	pub max_attempts: u32,
	pub base_delay: Duration,
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 1,
			base_delay: Duration::from_secs(1),
		}
	}
}
impl RetryPolicy {
	async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> eyre::Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = eyre::Result<T>>, {
		let mut attempt = 1;
		loop {
			match op().await {
				Ok(v) => return Ok(v),
				Err(e) if attempt < self.max_attempts => {
					let delay = self.delay(attempt);
					tracing::warn!(what, attempt, ?delay, error = %e, "retrying");
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}

	/// Exponential backoff plus up to one `base_delay` of jitter.
	fn delay(&self, attempt: u32) -> Duration {
		let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
		let jitter_ms = rand::thread_rng().gen_range(0..=self.base_delay.as_millis() as u64);
		backoff + Duration::from_millis(jitter_ms)
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowConfig {
	/// Each run gets its own directory under here.
	pub scratch_root: PathBuf,
	pub poll_interval: Duration,
	/// `None` polls for as long as the store keeps saying "processing".
	pub max_poll_wait: Option<Duration>,
	pub generate_timeout: Duration,
	pub cleanup: CleanupPolicy,
	pub retry: RetryPolicy,
}
impl Default for WorkflowConfig {
	fn default() -> Self {
		Self {
			scratch_root: std::env::temp_dir(),
			poll_interval: Duration::from_secs(10),
			max_poll_wait: None,
			generate_timeout: Duration::from_secs(600),
			cleanup: CleanupPolicy::default(),
			retry: RetryPolicy::default(),
		}
	}
}

/// Where an asset is in its life.
///
/// `Created -> Uploading -> Processing -> {Ready -> Generated -> Deleted} | {Failed -> Aborted}`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
	Created,
	Uploading,
	Processing,
	Ready,
	Generated,
	Deleted,
	Failed,
	Aborted,
}
impl Phase {
	pub fn can_advance_to(self, next: Phase) -> bool {
		use Phase::*;
		matches!(
			(self, next),
			(Created, Uploading)
				| (Created, Ready) // inline documents never touch the file store
				| (Uploading, Processing | Ready | Failed | Aborted)
				| (Processing, Ready | Failed | Aborted)
				| (Ready, Generated | Aborted)
				| (Generated, Deleted)
				| (Failed, Aborted)
		)
	}
}
impl From<AssetStatus> for Phase {
	fn from(status: AssetStatus) -> Self {
		match status {
			AssetStatus::Processing => Self::Processing,
			AssetStatus::Ready => Self::Ready,
			AssetStatus::Failed => Self::Failed,
		}
	}
}

#[derive(Debug)]
struct Trail(Vec<Phase>);
impl Trail {
	fn new() -> Self {
		Self(vec![Phase::Created])
	}

	fn advance(&mut self, next: Phase) {
		let current = *self.0.last().unwrap_or(&Phase::Created);
		debug_assert!(current.can_advance_to(next), "illegal transition {current:?} -> {next:?}");
		tracing::info!(from = ?current, to = ?next, "asset phase");
		self.0.push(next);
	}
}

/// One user action: a file, what kind of file they said it is, and what they want to know about it.
#[derive(Clone, Debug, derive_new::new)]
pub struct Submission {
	pub file_name: String,
	pub bytes: Bytes,
	pub kind: MediaKind,
	pub prompt: String,
	pub config: GenerationConfig,
}

/// Drives one asset through upload, readiness polling, generation and remote cleanup.
#[derive(Debug, derive_new::new)]
pub struct Workflow<S> {
	store: S,
	config: WorkflowConfig,
}
impl<S: RemoteStore> Workflow<S> {
	pub fn store(&self) -> &S {
		&self.store
	}

	pub async fn run(&self, submission: &Submission, cancel: &CancellationToken) -> Result<Response, WorkflowError> {
		let caps = submission.kind.capabilities();
		tracing::info!(file = %submission.file_name, kind = %submission.kind, model = %submission.config.model, "starting workflow");
		let mut trail = Trail::new();

		if !caps.needs_upload {
			let (text, tokens) = self.generate_inline(submission, &mut trail, cancel).await?;
			return Ok(Response::new(text, Some(tokens), trail.0));
		}

		// dropped on every return below, taking the local copy with it
		let scratch = self.persist_locally(&submission.bytes, &submission.file_name).await?;

		trail.advance(Phase::Uploading);
		let asset = match until_cancelled(cancel, self.upload(&scratch, submission.kind)).await {
			Ok(asset) => asset,
			Err(e) => {
				trail.advance(Phase::Aborted);
				return Err(e);
			}
		};
		trail.advance(asset.status.into());

		let asset = match caps.pollable && asset.status == AssetStatus::Processing {
			true => match self.await_ready(asset.clone(), cancel).await {
				Ok(ready) => {
					trail.advance(ready.status.into());
					ready
				}
				Err(e) => {
					trail.advance(Phase::Aborted);
					if matches!(e, WorkflowError::Cancelled) || self.config.cleanup == CleanupPolicy::Always {
						self.cleanup(&asset).await;
					}
					return Err(e);
				}
			},
			false => asset,
		};

		if asset.status == AssetStatus::Failed {
			trail.advance(Phase::Aborted);
			if self.config.cleanup == CleanupPolicy::Always {
				self.cleanup(&asset).await;
			}
			return Err(WorkflowError::RemoteStatusFailed { handle: asset.handle.name });
		}

		let text = match until_cancelled(cancel, self.generate(&asset, &submission.prompt, &submission.config)).await {
			Ok(text) => text,
			Err(e) => {
				trail.advance(Phase::Aborted);
				if matches!(e, WorkflowError::Cancelled) || self.config.cleanup == CleanupPolicy::Always {
					self.cleanup(&asset).await;
				}
				return Err(e);
			}
		};
		trail.advance(Phase::Generated);

		if self.cleanup(&asset).await {
			trail.advance(Phase::Deleted);
		}
		Ok(Response::new(text, None, trail.0))
	}

	pub async fn persist_locally(&self, bytes: &[u8], file_name: &str) -> Result<ScratchFile, WorkflowError> {
		ScratchFile::persist(&self.config.scratch_root, file_name, bytes).await
	}

	pub async fn upload(&self, scratch: &ScratchFile, kind: MediaKind) -> Result<RemoteAsset, WorkflowError> {
		let mime_type = guess_mime(scratch.file_name());
		let (handle, status) = self.store.upload_file(scratch.path(), &mime_type, scratch.file_name()).await?;
		tracing::info!(%handle, ?status, %mime_type, "uploaded");

		Ok(RemoteAsset {
			local_path: scratch.path().to_path_buf(),
			handle,
			status,
			kind,
		})
	}

	/// Re-queries the store every `poll_interval` until the asset stops processing.
	///
	/// Returns the asset with its final status, which may be [AssetStatus::Failed]; deciding what to do about that is up to the caller.
	pub async fn await_ready(&self, asset: RemoteAsset, cancel: &CancellationToken) -> Result<RemoteAsset, WorkflowError> {
		let handle = asset.handle.name.clone();
		let interval = self.config.poll_interval;

		let poll = async move {
			let mut asset = asset;
			while asset.status == AssetStatus::Processing {
				tokio::time::sleep(interval).await;
				let status = self.config.retry.run("file status", || self.store.file_status(&asset.handle)).await?;
				tracing::debug!(handle = %asset.handle, ?status, "polled");
				asset.status = status;
			}
			Ok::<_, WorkflowError>(asset)
		};
		let ceiling = async {
			match self.config.max_poll_wait {
				Some(max) => tokio::time::sleep(max).await,
				None => std::future::pending().await,
			}
		};

		tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(WorkflowError::Cancelled),
			_ = ceiling => Err(WorkflowError::PollTimeout {
				handle,
				waited: self.config.max_poll_wait.unwrap_or_default(),
			}),
			r = poll => r,
		}
	}

	pub async fn generate(&self, asset: &RemoteAsset, prompt: &str, config: &GenerationConfig) -> Result<String, WorkflowError> {
		match asset.status {
			AssetStatus::Ready => {}
			AssetStatus::Failed => return Err(WorkflowError::RemoteStatusFailed { handle: asset.handle.name.clone() }),
			AssetStatus::Processing => return Err(WorkflowError::Generation(eyre!("file {} is still processing", asset.handle))),
		}
		self.bounded_generate(config, Content::File(&asset.handle), prompt).await
	}

	/// Best-effort delete of the remote copy. Failure is logged and reported as `false`, never as an error.
	pub async fn cleanup(&self, asset: &RemoteAsset) -> bool {
		match self.config.retry.run("delete file", || self.store.delete_file(&asset.handle)).await {
			Ok(()) => {
				tracing::info!(handle = %asset.handle, "deleted remote file");
				true
			}
			Err(e) => {
				tracing::warn!(handle = %asset.handle, error = %e, "failed to delete remote file");
				false
			}
		}
	}

	async fn generate_inline(&self, submission: &Submission, trail: &mut Trail, cancel: &CancellationToken) -> Result<(String, u32), WorkflowError> {
		let mime_type = guess_mime(&submission.file_name);
		let content = Content::Inline {
			mime_type: &mime_type,
			data: &submission.bytes,
		};

		let count = async { Ok(self.store.count_tokens(submission.config.model, content).await?) };
		let tokens = until_cancelled(cancel, count).await?;
		tracing::info!(tokens, "counted document tokens");
		trail.advance(Phase::Ready);

		let text = until_cancelled(cancel, self.bounded_generate(&submission.config, content, &submission.prompt))
			.await
			.inspect_err(|_| trail.advance(Phase::Aborted))?;
		trail.advance(Phase::Generated);
		Ok((text, tokens))
	}

	async fn bounded_generate(&self, config: &GenerationConfig, content: Content<'_>, prompt: &str) -> Result<String, WorkflowError> {
		let timeout = self.config.generate_timeout;
		match tokio::time::timeout(timeout, self.store.generate_content(config, content, prompt, timeout)).await {
			Ok(Ok(text)) => Ok(text),
			// the adapter's own request timeout can fire first
			Ok(Err(e)) if e.downcast_ref::<reqwest::Error>().is_some_and(|e| e.is_timeout()) => Err(WorkflowError::GenerationTimeout(timeout)),
			Ok(Err(e)) => Err(WorkflowError::Generation(e)),
			Err(_elapsed) => Err(WorkflowError::GenerationTimeout(timeout)),
		}
	}
}

async fn until_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T, WorkflowError>>) -> Result<T, WorkflowError> {
	tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(WorkflowError::Cancelled),
		r = fut => r,
	}
}

fn guess_mime(file_name: &str) -> String {
	mime_guess::from_path(file_name).first_or_octet_stream().essence_str().to_owned()
}
