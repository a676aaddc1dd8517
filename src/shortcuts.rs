use std::path::Path;

use bytes::Bytes;
use eyre::{Result, WrapErr as _};
use tokio_util::sync::CancellationToken;

use crate::{GenerationConfig, MediaKind, Response, Submission, Workflow, config};

/// Ask about a file on disk with default settings and whatever config is found in the environment.
pub async fn ask_about_file(path: impl AsRef<Path>, kind: MediaKind, prompt: impl Into<String>) -> Result<Response> {
	let path = path.as_ref();
	let app_config = config::load(config::SettingsFlags::default())?;
	let workflow = Workflow::new(app_config.gemini()?, app_config.workflow_config());

	let bytes = tokio::fs::read(path).await.wrap_err_with(|| format!("reading {}", path.display()))?;
	let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "upload".to_owned());
	let submission = Submission::new(file_name, Bytes::from(bytes), kind, prompt.into(), GenerationConfig::default());

	Ok(workflow.run(&submission, &CancellationToken::new()).await?)
}

pub fn ask_about_file_blocking(path: impl AsRef<Path>, kind: MediaKind, prompt: impl Into<String>) -> Result<Response> {
	let runtime = tokio::runtime::Runtime::new()?;
	runtime.block_on(ask_about_file(path, kind, prompt))
}
