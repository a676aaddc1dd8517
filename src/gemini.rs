use std::{path::Path, time::Duration};

use async_trait::async_trait;
use base64::Engine as _;
use eyre::{Result, WrapErr as _, bail, eyre};
use reqwest::{
	Client, RequestBuilder,
	header::{CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AssetStatus, Content, GenerationConfig, Model, RemoteHandle, RemoteStore};

const API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Where model calls (generate, count tokens) are sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
	/// Generative Language API, key in `x-goog-api-key`.
	GenerativeLanguage,
	/// Vertex AI in a given project and region. Only used for inline documents.
	///
	/// Vertex does not take Generative Language API keys, so it carries its own OAuth access token, sent as a bearer token.
	Vertex {
		project: String,
		region: String,
		access_token: String,
		/// Defaults to the regional `aiplatform.googleapis.com` host.
		base_url: Option<String>,
	},
}
impl Endpoint {
	fn model_url(&self, base_url: &str, model: Model, method: &str) -> String {
		match self {
			Self::GenerativeLanguage => format!("{base_url}/v1beta/models/{model}:{method}"),
			Self::Vertex {
				project, region, base_url, ..
			} => {
				let base = base_url.clone().unwrap_or_else(|| format!("https://{region}-aiplatform.googleapis.com"));
				format!("{base}/v1/projects/{project}/locations/{region}/publishers/google/models/{model}:{method}")
			}
		}
	}
}

///docs: https://ai.google.dev/api/files
#[derive(Clone, Debug)]
pub struct Gemini {
	http: Client,
	api_key: String,
	base_url: String,
	document_endpoint: Endpoint,
}
impl Gemini {
	pub fn new(api_key: impl Into<String>) -> Self {
		Self {
			http: Client::new(),
			api_key: api_key.into(),
			base_url: API_BASE.to_owned(),
			document_endpoint: Endpoint::GenerativeLanguage,
		}
	}

	pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = base_url.into().trim_end_matches('/').to_owned();
		self
	}

	/// Send inline documents to Vertex AI instead of the Generative Language API.
	pub fn vertex(mut self, project: impl Into<String>, region: impl Into<String>, access_token: impl Into<String>) -> Self {
		self.document_endpoint = Endpoint::Vertex {
			project: project.into(),
			region: region.into(),
			access_token: access_token.into(),
			base_url: None,
		};
		self
	}

	/// Point Vertex calls somewhere other than the regional host. No effect unless [vertex](Self::vertex) was set.
	pub fn vertex_base_url(mut self, url: impl Into<String>) -> Self {
		if let Endpoint::Vertex { base_url, .. } = &mut self.document_endpoint {
			*base_url = Some(url.into().trim_end_matches('/').to_owned());
		}
		self
	}

	fn auth(&self, endpoint: &Endpoint) -> Result<HeaderMap> {
		// Header {{{
		let mut headers = HeaderMap::new();
		match endpoint {
			Endpoint::GenerativeLanguage => {
				headers.insert("x-goog-api-key", HeaderValue::from_str(&self.api_key).wrap_err("api key is not a valid header value")?);
			}
			Endpoint::Vertex { access_token, .. } => {
				headers.insert(
					"authorization",
					HeaderValue::from_str(&format!("Bearer {access_token}")).wrap_err("vertex access token is not a valid header value")?,
				);
			}
		}
		//,}}}
		Ok(headers)
	}

	fn model_call(&self, model: Model, method: &str, content: Content<'_>) -> Result<RequestBuilder> {
		let endpoint = match content {
			Content::Inline { .. } => &self.document_endpoint,
			Content::File(_) => &Endpoint::GenerativeLanguage,
		};
		let url = endpoint.model_url(&self.base_url, model, method);
		Ok(self.http.post(url).headers(self.auth(endpoint)?).header(CONTENT_TYPE, "application/json"))
	}

	fn file_url(&self, handle: &RemoteHandle) -> String {
		format!("{}/v1beta/{}", self.base_url, handle.name)
	}
}

#[async_trait]
impl RemoteStore for Gemini {
	/// Resumable upload: one request to open the session, one to send the bytes and finalize.
	async fn upload_file(&self, local_path: &Path, mime_type: &str, display_name: &str) -> Result<(RemoteHandle, AssetStatus)> {
		let bytes = tokio::fs::read(local_path).await.wrap_err_with(|| format!("reading {}", local_path.display()))?;
		let auth = self.auth(&Endpoint::GenerativeLanguage)?;

		let start = self
			.http
			.post(format!("{}/upload/v1beta/files", self.base_url))
			.headers(auth)
			.header("X-Goog-Upload-Protocol", "resumable")
			.header("X-Goog-Upload-Command", "start")
			.header("X-Goog-Upload-Header-Content-Length", bytes.len())
			.header("X-Goog-Upload-Header-Content-Type", mime_type)
			.json(&serde_json::json!({ "file": { "display_name": display_name } }))
			.send()
			.await?;
		let start = ensure_success(start).await.wrap_err("starting upload session")?;
		let session_url = start
			.headers()
			.get("x-goog-upload-url")
			.ok_or_else(|| eyre!("upload session response has no x-goog-upload-url header"))?
			.to_str()?
			.to_owned();

		let finished = self
			.http
			.post(session_url)
			.header("X-Goog-Upload-Offset", 0)
			.header("X-Goog-Upload-Command", "upload, finalize")
			.body(bytes)
			.send()
			.await?;
		let value = ensure_success(finished).await.wrap_err("uploading file bytes")?.json::<Value>().await?;
		tracing::debug!(?value);

		#[derive(Debug, Deserialize)]
		struct UploadResponse {
			file: GeminiFile,
		}
		let file = serde_json::from_value::<UploadResponse>(value)?.file;
		let status = file.status();
		Ok((file.into(), status))
	}

	async fn file_status(&self, handle: &RemoteHandle) -> Result<AssetStatus> {
		let response = self.http.get(self.file_url(handle)).headers(self.auth(&Endpoint::GenerativeLanguage)?).send().await?;
		let file = ensure_success(response).await?.json::<GeminiFile>().await?;
		tracing::debug!(?file);
		Ok(file.status())
	}

	async fn generate_content(&self, config: &GenerationConfig, content: Content<'_>, prompt: &str, timeout: Duration) -> Result<String> {
		let payload = GenerateRequest {
			contents: [RequestContent::user(content, Some(prompt))],
			generation_config: Some(WireGenerationConfig {
				temperature: config.temperature,
				top_p: config.top_p,
				max_output_tokens: config.max_output_tokens,
			}),
		};
		tracing::info!(model = %config.model, "requesting generation");

		let response = self.model_call(config.model, "generateContent", content)?.json(&payload).timeout(timeout).send().await?;
		let value = ensure_success(response).await?.json::<Value>().await?;
		tracing::debug!(?value);

		let response = serde_json::from_value::<GenerateResponse>(value.clone()).map_err(|e| {
			tracing::error!(
				"Failed to parse Gemini response. Response JSON: {}",
				serde_json::to_string_pretty(&value).unwrap_or_else(|_| format!("{:?}", value))
			);
			e
		})?;
		response.text()
	}

	async fn delete_file(&self, handle: &RemoteHandle) -> Result<()> {
		let response = self.http.delete(self.file_url(handle)).headers(self.auth(&Endpoint::GenerativeLanguage)?).send().await?;
		ensure_success(response).await?;
		Ok(())
	}

	async fn count_tokens(&self, model: Model, content: Content<'_>) -> Result<u32> {
		let payload = GenerateRequest {
			contents: [RequestContent::user(content, None)],
			generation_config: None,
		};
		let response = self.model_call(model, "countTokens", content)?.json(&payload).send().await?;

		#[derive(Debug, Deserialize)]
		#[serde(rename_all = "camelCase")]
		struct CountTokensResponse {
			total_tokens: u32,
		}
		Ok(ensure_success(response).await?.json::<CountTokensResponse>().await?.total_tokens)
	}
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}
	let body = response.text().await.unwrap_or_default();
	bail!("Gemini API returned {status}: {body}")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFile {
	name: String,
	#[serde(default)]
	uri: String,
	#[serde(default)]
	mime_type: String,
	state: Option<String>,
}
impl GeminiFile {
	/// Only PROCESSING keeps the caller waiting; anything that isn't FAILED is usable.
	fn status(&self) -> AssetStatus {
		match self.state.as_deref() {
			Some("PROCESSING") => AssetStatus::Processing,
			Some("FAILED") => AssetStatus::Failed,
			_ => AssetStatus::Ready,
		}
	}
}
impl From<GeminiFile> for RemoteHandle {
	fn from(file: GeminiFile) -> Self {
		Self {
			name: file.name,
			uri: file.uri,
			mime_type: file.mime_type,
		}
	}
}

// request {{{
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
	contents: [RequestContent<'a>; 1],
	#[serde(skip_serializing_if = "Option::is_none")]
	generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
	role: &'static str,
	parts: Vec<Part<'a>>,
}
impl<'a> RequestContent<'a> {
	/// Media first, then the prompt.
	fn user(content: Content<'a>, prompt: Option<&'a str>) -> Self {
		let media = match content {
			Content::File(handle) => Part::FileData {
				mime_type: &handle.mime_type,
				file_uri: &handle.uri,
			},
			Content::Inline { mime_type, data } => Part::InlineData {
				mime_type,
				data: base64::engine::general_purpose::STANDARD.encode(data),
			},
		};
		let mut parts = vec![media];
		if let Some(prompt) = prompt {
			parts.push(Part::Text(prompt));
		}
		Self { role: "user", parts }
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
enum Part<'a> {
	Text(&'a str),
	FileData { mime_type: &'a str, file_uri: &'a str },
	InlineData { mime_type: &'a str, data: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
	temperature: f32,
	top_p: f32,
	max_output_tokens: u32,
}
//,}}}

// response {{{
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
	#[serde(default)]
	candidates: Vec<Candidate>,
	prompt_feedback: Option<PromptFeedback>,
}
impl GenerateResponse {
	fn text(self) -> Result<String> {
		if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
			bail!("Gemini blocked the prompt: {reason}");
		}
		let Some(candidate) = self.candidates.into_iter().next() else {
			bail!("Gemini returned no candidates");
		};
		let text = candidate
			.content
			.map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<Vec<String>>().join(""))
			.unwrap_or_default();
		if text.is_empty() {
			bail!("Gemini returned no text (finish reason: {})", candidate.finish_reason.as_deref().unwrap_or("unknown"));
		}
		Ok(text)
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
	content: Option<CandidateContent>,
	finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
	#[serde(default)]
	parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
	text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
	block_reason: Option<String>,
}
//,}}}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use wiremock::{
		Mock, MockServer, ResponseTemplate,
		matchers::{body_partial_json, header, method, path},
	};

	use super::*;

	fn client(server: &MockServer) -> Gemini {
		Gemini::new("test-key").base_url(server.uri())
	}

	fn handle() -> RemoteHandle {
		RemoteHandle::new("files/abc123".to_owned(), "https://generativelanguage.googleapis.com/v1beta/files/abc123".to_owned(), "image/jpeg".to_owned())
	}

	#[tokio::test]
	async fn upload_opens_session_then_sends_bytes() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/upload/v1beta/files"))
			.and(header("x-goog-api-key", "test-key"))
			.and(header("x-goog-upload-command", "start"))
			.and(header("x-goog-upload-header-content-type", "image/jpeg"))
			.and(body_partial_json(json!({ "file": { "display_name": "cat.jpg" } })))
			.respond_with(ResponseTemplate::new(200).insert_header("x-goog-upload-url", format!("{}/session/1", server.uri()).as_str()))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/session/1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"file": { "name": "files/abc123", "uri": "https://x/files/abc123", "mimeType": "image/jpeg", "state": "PROCESSING" }
			})))
			.expect(1)
			.mount(&server)
			.await;

		let dir = tempfile::tempdir().unwrap();
		let local = dir.path().join("cat.jpg");
		std::fs::write(&local, b"jpeg bytes").unwrap();

		let (handle, status) = client(&server).upload_file(&local, "image/jpeg", "cat.jpg").await.unwrap();
		assert_eq!(handle.name, "files/abc123");
		assert_eq!(handle.mime_type, "image/jpeg");
		assert_eq!(status, AssetStatus::Processing);
	}

	#[tokio::test]
	async fn file_states_map_to_status() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1beta/files/abc123"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "files/abc123", "state": "ACTIVE" })))
			.mount(&server)
			.await;
		assert_eq!(client(&server).file_status(&handle()).await.unwrap(), AssetStatus::Ready);

		let failed = GeminiFile {
			name: "files/x".to_owned(),
			uri: String::new(),
			mime_type: String::new(),
			state: Some("FAILED".to_owned()),
		};
		assert_eq!(failed.status(), AssetStatus::Failed);
	}

	#[tokio::test]
	async fn generate_sends_file_prompt_and_sampling() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1beta/models/gemini-1.5-pro:generateContent"))
			.and(body_partial_json(json!({
				"contents": [{
					"role": "user",
					"parts": [
						{ "fileData": { "mimeType": "image/jpeg", "fileUri": "https://generativelanguage.googleapis.com/v1beta/files/abc123" } },
						{ "text": "describe this image" }
					]
				}],
				"generationConfig": { "topP": 0.5, "maxOutputTokens": 300 }
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"candidates": [{ "content": { "role": "model", "parts": [{ "text": "A cat " }, { "text": "sitting on a windowsill." }] }, "finishReason": "STOP" }]
			})))
			.expect(1)
			.mount(&server)
			.await;

		let config = GenerationConfig::new(Model::Pro, 0.0, 0.5, 300);
		let text = client(&server)
			.generate_content(&config, Content::File(&handle()), "describe this image", Duration::from_secs(5))
			.await
			.unwrap();
		assert_eq!(text, "A cat sitting on a windowsill.");
	}

	#[tokio::test]
	async fn blocked_prompt_is_an_error() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "promptFeedback": { "blockReason": "SAFETY" } })))
			.mount(&server)
			.await;

		let err = client(&server)
			.generate_content(&GenerationConfig::default(), Content::File(&handle()), "hi", Duration::from_secs(5))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("SAFETY"));
	}

	#[tokio::test]
	async fn http_errors_carry_status_and_body() {
		let server = MockServer::start().await;
		Mock::given(method("DELETE"))
			.and(path("/v1beta/files/abc123"))
			.respond_with(ResponseTemplate::new(404).set_body_string("not found"))
			.mount(&server)
			.await;

		let err = client(&server).delete_file(&handle()).await.unwrap_err();
		let msg = err.to_string();
		assert!(msg.contains("404") && msg.contains("not found"), "{msg}");
	}

	#[tokio::test]
	async fn count_tokens_sends_inline_document() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1beta/models/gemini-1.5-flash:countTokens"))
			.and(body_partial_json(json!({
				"contents": [{ "parts": [{ "inlineData": { "mimeType": "application/pdf", "data": "JVBERi0=" } }] }]
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "totalTokens": 1290 })))
			.mount(&server)
			.await;

		let content = Content::Inline {
			mime_type: "application/pdf",
			data: b"%PDF-",
		};
		assert_eq!(client(&server).count_tokens(Model::Flash, content).await.unwrap(), 1290);
	}

	#[tokio::test]
	async fn vertex_documents_use_the_access_token() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/projects/my-proj/locations/us-central1/publishers/google/models/gemini-1.5-flash:countTokens"))
			.and(header("authorization", "Bearer ya29.token"))
			.and(|req: &wiremock::Request| !req.headers.contains_key("x-goog-api-key"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "totalTokens": 7 })))
			.mount(&server)
			.await;

		let client = Gemini::new("api-key").vertex("my-proj", "us-central1", "ya29.token").vertex_base_url(server.uri());
		let content = Content::Inline {
			mime_type: "application/pdf",
			data: b"%PDF-",
		};
		assert_eq!(client.count_tokens(Model::Flash, content).await.unwrap(), 7);
	}

	#[tokio::test]
	async fn request_timeout_is_recognisable() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
			.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)).set_body_json(json!({})))
			.mount(&server)
			.await;

		let err = client(&server)
			.generate_content(&GenerationConfig::default(), Content::File(&handle()), "hi", Duration::from_millis(100))
			.await
			.unwrap_err();
		assert!(err.downcast_ref::<reqwest::Error>().is_some_and(|e| e.is_timeout()), "{err:?}");
	}

	#[test]
	fn vertex_url() {
		let endpoint = Endpoint::Vertex {
			project: "my-proj".to_owned(),
			region: "us-central1".to_owned(),
			access_token: "t".to_owned(),
			base_url: None,
		};
		assert_eq!(
			endpoint.model_url(API_BASE, Model::Flash, "generateContent"),
			"https://us-central1-aiplatform.googleapis.com/v1/projects/my-proj/locations/us-central1/publishers/google/models/gemini-1.5-flash:generateContent"
		);
	}
}
