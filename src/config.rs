use std::{path::PathBuf, time::Duration};

use eyre::{Result, eyre};
use v_utils::macros::{MyConfigPrimitives, Settings};

use crate::{CleanupPolicy, Gemini, RetryPolicy, WorkflowConfig};

#[derive(Clone, Debug, Default, MyConfigPrimitives, Settings)]
pub struct AppConfig {
	pub gemini_api_key: Option<String>,
	/// Together with `region`, routes inline documents through Vertex AI.
	pub project_id: Option<String>,
	pub region: Option<String>,
	/// OAuth access token for Vertex AI (`gcloud auth print-access-token`). The Gemini API key is not accepted there.
	pub vertex_access_token: Option<String>,
	pub api_base: Option<String>,
	pub scratch_dir: Option<PathBuf>,
	pub poll_interval_secs: Option<u64>,
	/// Unset means wait for as long as the file is processing.
	pub max_poll_wait_secs: Option<u64>,
	pub generate_timeout_secs: Option<u64>,
	/// Also delete the remote file when the run fails.
	pub cleanup_on_failure: Option<bool>,
	pub retry_attempts: Option<u32>,
}

/// Build the config once at startup. `GOOGLE_API_KEY` is picked up if no key is configured otherwise.
pub fn load(flags: SettingsFlags) -> Result<AppConfig> {
	let mut config = AppConfig::try_build(flags)?;
	if config.gemini_api_key.is_none() {
		config.gemini_api_key = std::env::var("GOOGLE_API_KEY").ok().filter(|k| !k.is_empty());
	}
	Ok(config)
}

impl AppConfig {
	pub fn workflow_config(&self) -> WorkflowConfig {
		let defaults = WorkflowConfig::default();
		WorkflowConfig {
			scratch_root: self.scratch_dir.clone().unwrap_or(defaults.scratch_root),
			poll_interval: self.poll_interval_secs.map(Duration::from_secs).unwrap_or(defaults.poll_interval),
			max_poll_wait: self.max_poll_wait_secs.map(Duration::from_secs),
			generate_timeout: self.generate_timeout_secs.map(Duration::from_secs).unwrap_or(defaults.generate_timeout),
			cleanup: match self.cleanup_on_failure {
				Some(true) => CleanupPolicy::Always,
				_ => CleanupPolicy::SuccessOnly,
			},
			retry: RetryPolicy {
				max_attempts: self.retry_attempts.unwrap_or(1).max(1),
				..defaults.retry
			},
		}
	}

	pub fn gemini(&self) -> Result<Gemini> {
		let key = self.gemini_api_key.as_deref().ok_or_else(|| eyre!("no Gemini API key: set gemini_api_key in the config or GOOGLE_API_KEY"))?;
		let mut client = Gemini::new(key);
		if let Some(base) = &self.api_base {
			client = client.base_url(base);
		}
		if let (Some(project), Some(region)) = (&self.project_id, &self.region) {
			let token = self
				.vertex_access_token
				.as_deref()
				.ok_or_else(|| eyre!("project_id and region route documents through Vertex AI, which needs vertex_access_token"))?;
			client = client.vertex(project, region, token);
		}
		Ok(client)
	}
}
