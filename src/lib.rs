use std::{ops::RangeInclusive, path::PathBuf, str::FromStr};

use eyre::bail;

pub mod blocking;
pub mod config;
mod error;
mod gemini;
mod scratch;
pub mod shortcuts;
mod store;
mod workflow;

pub use error::WorkflowError;
pub use gemini::{Endpoint, Gemini};
pub use scratch::ScratchFile;
pub use store::{Content, RemoteStore};
pub use workflow::{CleanupPolicy, Phase, RetryPolicy, Submission, Workflow, WorkflowConfig};

pub const TEMPERATURE_RANGE: RangeInclusive<f32> = 0.0..=2.0;
pub const TOP_P_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const MAX_OUTPUT_TOKENS_RANGE: RangeInclusive<u32> = 100..=5000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
pub enum Model {
	#[default]
	#[display("gemini-1.5-flash")]
	Flash,
	#[display("gemini-1.5-pro")]
	Pro,
}
impl FromStr for Model {
	type Err = eyre::Report;

	fn from_str(s: &str) -> eyre::Result<Self> {
		Ok(match s {
			_ if s.to_lowercase().contains("flash") => Self::Flash,
			_ if s.to_lowercase().contains("pro") => Self::Pro,
			_ => bail!("Unknown model: {s}"),
		})
	}
}

/// What the user says they uploaded. Never checked against the actual bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::FromStr, derive_more::Display)]
pub enum MediaKind {
	#[display("image")]
	Image,
	#[display("video")]
	Video,
	#[display("audio")]
	Audio,
	#[display("document")]
	Document,
}
impl MediaKind {
	pub fn capabilities(&self) -> Capabilities {
		match self {
			Self::Image | Self::Video | Self::Audio => Capabilities { needs_upload: true, pollable: true },
			Self::Document => Capabilities {
				needs_upload: false,
				pollable: false,
			},
		}
	}

	/// Guess from the extension. `None` for anything that isn't image, video, audio or pdf.
	pub fn from_file_name(file_name: &str) -> Option<Self> {
		let mime = mime_guess::from_path(file_name).first()?;
		match (mime.type_().as_str(), mime.subtype().as_str()) {
			("image", _) => Some(Self::Image),
			("video", _) => Some(Self::Video),
			("audio", _) => Some(Self::Audio),
			("application", "pdf") => Some(Self::Document),
			_ => None,
		}
	}

	pub fn prompt_label(&self) -> String {
		format!("Enter your prompt for the {self}:")
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
	/// Goes through the remote file store instead of being sent inline.
	pub needs_upload: bool,
	/// The store may report it as still processing after upload.
	pub pollable: bool,
}

/// Sampling settings sent with every generation request.
///
/// Bounds ([TEMPERATURE_RANGE], [TOP_P_RANGE], [MAX_OUTPUT_TOKENS_RANGE]) are the front end's job; values are passed through as-is.
#[derive(Clone, Debug, PartialEq, derive_new::new)]
pub struct GenerationConfig {
	pub model: Model,
	pub temperature: f32,
	pub top_p: f32,
	pub max_output_tokens: u32,
}
impl Default for GenerationConfig {
	fn default() -> Self {
		Self {
			model: Model::default(),
			temperature: 1.0,
			top_p: 0.94,
			max_output_tokens: 2000,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetStatus {
	Processing,
	Ready,
	Failed,
}

/// Reference to a file held by the remote store.
#[derive(Clone, Debug, PartialEq, Eq, derive_new::new)]
pub struct RemoteHandle {
	/// Resource name, used for status queries and deletion.
	pub name: String,
	/// Address the model reads the file from.
	pub uri: String,
	pub mime_type: String,
}
impl std::fmt::Display for RemoteHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.name)
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteAsset {
	pub local_path: PathBuf,
	pub handle: RemoteHandle,
	pub status: AssetStatus,
	pub kind: MediaKind,
}

#[derive(Debug, derive_new::new)]
pub struct Response {
	pub text: String,
	/// Only known for inline documents, where tokens are counted before generating.
	pub prompt_tokens: Option<u32>,
	/// Phases the asset went through, in order.
	pub trail: Vec<Phase>,
}
impl std::fmt::Display for Response {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if let Some(tokens) = self.prompt_tokens {
			writeln!(f, "Prompt tokens: {tokens}\n")?;
		}
		write!(f, "{}", self.text)
	}
}
