use std::{path::Path, time::Duration};

use async_trait::async_trait;
use eyre::Result;

use crate::{AssetStatus, GenerationConfig, Model, RemoteHandle};

/// What the model is asked about.
#[derive(Clone, Copy, Debug)]
pub enum Content<'a> {
	File(&'a RemoteHandle),
	/// Raw document bytes sent along with the request, no upload involved.
	Inline { mime_type: &'a str, data: &'a [u8] },
}

/// The hosted service the workflow talks to.
#[async_trait]
pub trait RemoteStore: Send + Sync {
	/// Status is whatever the store reports right after the upload.
	async fn upload_file(&self, local_path: &Path, mime_type: &str, display_name: &str) -> Result<(RemoteHandle, AssetStatus)>;

	async fn file_status(&self, handle: &RemoteHandle) -> Result<AssetStatus>;

	async fn generate_content(&self, config: &GenerationConfig, content: Content<'_>, prompt: &str, timeout: Duration) -> Result<String>;

	async fn delete_file(&self, handle: &RemoteHandle) -> Result<()>;

	async fn count_tokens(&self, model: Model, content: Content<'_>) -> Result<u32>;
}
