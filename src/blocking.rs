use eyre::Result;
use tokio_util::sync::CancellationToken;

use crate::{RemoteStore, Response, Submission, Workflow};

/// Runs one submission to completion on a fresh runtime. Must not be called from inside an async context.
pub fn run<S: RemoteStore>(workflow: &Workflow<S>, submission: &Submission) -> Result<Response> {
	let runtime = tokio::runtime::Runtime::new()?;
	Ok(runtime.block_on(workflow.run(submission, &CancellationToken::new()))?)
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;

	use super::*;
	use crate::{Gemini, GenerationConfig, MediaKind, WorkflowConfig, WorkflowError};

	#[test]
	fn surfaces_workflow_errors() {
		let workflow = Workflow::new(Gemini::new("k").base_url("http://127.0.0.1:1"), WorkflowConfig::default());
		let submission = Submission::new("paper.pdf".to_owned(), Bytes::from_static(b"%PDF-1.4"), MediaKind::Document, "summarize".to_owned(), GenerationConfig::default());

		let err = run(&workflow, &submission).unwrap_err();
		assert!(matches!(err.downcast_ref::<WorkflowError>(), Some(WorkflowError::Transport(_))));
	}
}
