use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::WorkflowError;

/// Local copy of an upload, living in its own directory under the scratch root.
///
/// Two workflows persisting files with the same name never see each other's bytes. The directory goes away when this drops.
#[derive(Debug)]
pub struct ScratchFile {
	path: PathBuf,
	_dir: TempDir,
}
impl ScratchFile {
	pub async fn persist(root: &Path, file_name: &str, bytes: &[u8]) -> Result<Self, WorkflowError> {
		let dir = tempfile::Builder::new().prefix("media_chat-").tempdir_in(root).map_err(|source| WorkflowError::Io {
			path: root.to_path_buf(),
			source,
		})?;
		let path = dir.path().join(sanitize(file_name));
		tokio::fs::write(&path, bytes).await.map_err(|source| WorkflowError::Io { path: path.clone(), source })?;
		tracing::debug!(path = %path.display(), len = bytes.len(), "persisted scratch copy");

		Ok(Self { path, _dir: dir })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Name the file had on the user's machine.
	pub fn file_name(&self) -> &str {
		self.path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
	}
}

// keep only the last component, so "../x" or "a/b.png" can't escape the scratch dir
fn sanitize(file_name: &str) -> String {
	let name = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
	match name {
		"" | "." | ".." => "upload".to_owned(),
		_ => name.to_owned(),
	}
}
