use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Everything that can end a workflow run early.
///
/// Failed remote deletes are not in here, see [Workflow::cleanup](crate::Workflow::cleanup).
#[derive(Debug, Error)]
pub enum WorkflowError {
	#[error("failed to write scratch copy at {}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("remote store reported file {handle} as FAILED")]
	RemoteStatusFailed { handle: String },

	#[error("generation request failed")]
	Generation(#[source] eyre::Report),

	#[error("generation did not complete within {0:?}")]
	GenerationTimeout(Duration),

	#[error("file {handle} still processing after {waited:?}")]
	PollTimeout { handle: String, waited: Duration },

	#[error("request cancelled")]
	Cancelled,

	#[error(transparent)]
	Transport(#[from] eyre::Report),
}

impl WorkflowError {
	/// Message suitable for showing to the person who submitted the prompt.
	pub fn user_message(&self) -> String {
		match self {
			Self::Io { .. } => "Could not save the uploaded file locally. Check that the scratch directory is writable.".to_owned(),
			Self::RemoteStatusFailed { .. } => "The service could not process this file. Try a different file.".to_owned(),
			Self::Generation(_) | Self::GenerationTimeout(_) => "The model did not return a response. Submit the prompt again to retry.".to_owned(),
			Self::PollTimeout { .. } => "The file took too long to become ready. Submit again to retry.".to_owned(),
			Self::Cancelled => "Request cancelled.".to_owned(),
			Self::Transport(_) => "Could not reach the generation service. Submit again to retry.".to_owned(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generation_timeout_reads_as_generation_failure() {
		let e = WorkflowError::GenerationTimeout(Duration::from_secs(600));
		assert_eq!(e.user_message(), WorkflowError::Generation(eyre::eyre!("x")).user_message());
		assert_eq!(e.to_string(), "generation did not complete within 600s");
	}
}
