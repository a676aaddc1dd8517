use std::{fmt::Display, ops::RangeInclusive, path::PathBuf, str::FromStr};

use bytes::Bytes;
use clap::Parser;
use eyre::{WrapErr as _, bail, eyre};
use media_chat::{GenerationConfig, MAX_OUTPUT_TOKENS_RANGE, MediaKind, Model, Submission, TEMPERATURE_RANGE, TOP_P_RANGE, Workflow, config};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
	/// Image, video, audio file or pdf
	file: PathBuf,
	/// What to ask about the file. Read from stdin if omitted.
	prompt: Option<String>,
	/// image, video, audio or document. Guessed from the extension if omitted.
	#[clap(short, long)]
	kind: Option<MediaKind>,
	#[clap(short, long, default_value = "flash")]
	model: Model,
	/// Lower is more deterministic, higher more creative. 0 always picks the most likely token.
	#[clap(long, default_value_t = 1.0, value_parser = parse_temperature)]
	temperature: f32,
	/// Nucleus sampling cutoff. Lower gives less random responses.
	#[clap(long, default_value_t = 0.94, value_parser = parse_top_p)]
	top_p: f32,
	#[clap(long, default_value_t = 2000, value_parser = parse_max_tokens)]
	max_tokens: u32,
	#[command(flatten)]
	settings: config::SettingsFlags,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	v_utils::clientside!();
	let cli = Cli::parse();

	let app_config = config::load(cli.settings)?;

	let file_name = cli.file.file_name().map(|n| n.to_string_lossy().into_owned()).ok_or_else(|| eyre!("{} is not a file", cli.file.display()))?;
	let kind = match cli.kind {
		Some(kind) => kind,
		None => MediaKind::from_file_name(&file_name).ok_or_else(|| eyre!("can't tell what kind of file {file_name} is, pass --kind"))?,
	};
	let prompt = match cli.prompt {
		Some(prompt) => prompt,
		None => read_prompt(kind).await?,
	};
	let bytes = tokio::fs::read(&cli.file).await.wrap_err_with(|| format!("reading {}", cli.file.display()))?;

	let config = GenerationConfig::new(cli.model, cli.temperature, cli.top_p, cli.max_tokens);
	let submission = Submission::new(file_name, Bytes::from(bytes), kind, prompt, config);
	let workflow = Workflow::new(app_config.gemini()?, app_config.workflow_config());

	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				cancel.cancel();
			}
		}
	});

	match workflow.run(&submission, &cancel).await {
		Ok(response) => {
			println!("{response:#}");
			Ok(())
		}
		Err(e) => Err(failure_report(e)),
	}
}

/// The user-facing message on top, the underlying cause chain below it. Reported once, by `main`'s return.
fn failure_report(e: media_chat::WorkflowError) -> eyre::Report {
	let message = e.user_message();
	eyre::Report::new(e).wrap_err(message)
}

async fn read_prompt(kind: MediaKind) -> eyre::Result<String> {
	eprintln!("{}", kind.prompt_label());
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	let prompt = lines.next_line().await?.unwrap_or_default();
	let prompt = prompt.trim();
	if prompt.is_empty() {
		bail!("no prompt given");
	}
	Ok(prompt.to_owned())
}

// value parsers {{{
fn parse_temperature(s: &str) -> Result<f32, String> {
	parse_in_range(s, TEMPERATURE_RANGE)
}

fn parse_top_p(s: &str) -> Result<f32, String> {
	parse_in_range(s, TOP_P_RANGE)
}

fn parse_max_tokens(s: &str) -> Result<u32, String> {
	parse_in_range(s, MAX_OUTPUT_TOKENS_RANGE)
}

fn parse_in_range<T>(s: &str, range: RangeInclusive<T>) -> Result<T, String>
where
	T: FromStr + PartialOrd + Display,
	T::Err: Display, {
	let v = s.parse::<T>().map_err(|e| e.to_string())?;
	match range.contains(&v) {
		true => Ok(v),
		false => Err(format!("{v} is outside {}..={}", range.start(), range.end())),
	}
}
//,}}}
