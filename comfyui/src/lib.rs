//! Minimal client for a local ComfyUI server.
//!
//! ComfyUI runs a workflow graph queued over HTTP and reports progress over a
//! WebSocket keyed by a client id. This crate provides:
//! - A text-to-image workflow builder
//! - Prompt queueing, history lookup and image view URLs
//! - `generate_image`, which queues a workflow and waits for its first image

mod workflow;

pub use workflow::{TextToImage, DEFAULT_CHECKPOINT, DEFAULT_NEGATIVE_PROMPT};

use futures::{Stream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, instrument, warn};

/// Default ComfyUI endpoint.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8188";

const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that can occur when talking to ComfyUI.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Workflow execution failed: {0}")]
    Execution(String),

    #[error("Prompt {0} finished without producing an image")]
    NoImages(String),

    #[error("Image generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// An image produced by a workflow output node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

/// ComfyUI API client.
#[derive(Clone)]
pub struct ComfyUi {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    checkpoint: String,
    completion_timeout: Duration,
}

impl ComfyUi {
    /// Create a client for the server at `base_url` (e.g. `http://127.0.0.1:8188`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let parsed = Url::parse(&base_url)
            .map_err(|e| Error::Config(format!("Invalid ComfyUI URL '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "ComfyUI URL must be http or https, got '{}'",
                parsed.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            client_id: format!("client_{}", uuid::Uuid::new_v4().simple()),
            checkpoint: DEFAULT_CHECKPOINT.to_string(),
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        })
    }

    /// Create a client from `COMFYUI_BASE_URL` and `COMFYUI_CHECKPOINT`.
    ///
    /// Both variables are optional; unset values fall back to the defaults.
    pub fn from_env() -> Result<Self, Error> {
        let base_url =
            std::env::var("COMFYUI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let mut client = Self::new(base_url)?;
        if let Ok(checkpoint) = std::env::var("COMFYUI_CHECKPOINT") {
            if !checkpoint.trim().is_empty() {
                client = client.with_checkpoint(checkpoint);
            }
        }
        Ok(client)
    }

    /// Set the checkpoint used by [`ComfyUi::text_to_image`].
    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = checkpoint.into();
        self
    }

    /// Set how long `generate_image` waits for a queued prompt to finish.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket endpoint that reports progress for this client's prompts.
    pub fn websocket_url(&self) -> String {
        let (scheme, rest) = match self.base_url.strip_prefix("https://") {
            Some(rest) => ("wss", rest),
            None => ("ws", self.base_url.trim_start_matches("http://")),
        };
        format!("{scheme}://{rest}/ws?clientId={}", self.client_id)
    }

    /// A text-to-image workflow for `prompt` using this client's checkpoint.
    pub fn text_to_image(&self, prompt: impl Into<String>) -> TextToImage {
        TextToImage::new(prompt).with_checkpoint(self.checkpoint.clone())
    }

    /// Queue a workflow graph and return its prompt id.
    #[instrument(skip(self, workflow))]
    pub async fn queue_prompt(&self, workflow: &Value) -> Result<String, Error> {
        let body = json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        let queued: QueueResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        debug!(prompt_id = %queued.prompt_id, "prompt queued");
        Ok(queued.prompt_id)
    }

    /// Fetch the execution history of a prompt.
    pub async fn history(&self, prompt_id: &str) -> Result<Value, Error> {
        let response = self
            .client
            .get(format!("{}/history/{prompt_id}", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }

    /// A fetchable URL for a generated image.
    pub fn view_url(&self, image: &ImageFile) -> Result<String, Error> {
        let mut url = Url::parse(&format!("{}/view", self.base_url))
            .map_err(|e| Error::Config(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("filename", &image.filename)
            .append_pair("subfolder", &image.subfolder)
            .append_pair("type", &image.kind);
        Ok(url.to_string())
    }

    /// Generate an image for `prompt` and return its view URL.
    pub async fn generate_image(&self, prompt: &str) -> Result<String, Error> {
        self.execute(&self.text_to_image(prompt).build()).await
    }

    /// Queue `workflow` and wait until it produces an image.
    ///
    /// The WebSocket is opened before queueing so no progress event is missed.
    #[instrument(skip(self, workflow), fields(client_id = %self.client_id))]
    pub async fn execute(&self, workflow: &Value) -> Result<String, Error> {
        let (mut socket, _) = connect_async(self.websocket_url())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let prompt_id = match self.queue_prompt(workflow).await {
            Ok(id) => id,
            Err(e) => {
                let _ = socket.close(None).await;
                return Err(e);
            }
        };

        let outcome = tokio::time::timeout(
            self.completion_timeout,
            self.wait_for_image(&mut socket, &prompt_id),
        )
        .await;

        if let Err(e) = socket.close(None).await {
            debug!("closing ComfyUI socket: {e}");
        }

        match outcome {
            Ok(Ok(url)) => {
                info!(%prompt_id, %url, "image generated");
                Ok(url)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(self.completion_timeout)),
        }
    }

    async fn wait_for_image<S>(&self, socket: &mut S, prompt_id: &str) -> Result<String, Error>
    where
        S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        while let Some(message) = socket.next().await {
            let message = message.map_err(|e| Error::WebSocket(e.to_string()))?;
            let text = match message {
                tungstenite::Message::Text(text) => text,
                tungstenite::Message::Close(_) => break,
                // Binary frames carry preview images
                _ => continue,
            };

            match interpret_event(text.as_str(), prompt_id) {
                Some(Progress::Images(images)) => {
                    if let Some(image) = images.first() {
                        return self.view_url(image);
                    }
                }
                Some(Progress::Finished) => {
                    let history = self.history(prompt_id).await?;
                    return match images_in_history(&history, prompt_id).first() {
                        Some(image) => self.view_url(image),
                        None => Err(Error::NoImages(prompt_id.to_string())),
                    };
                }
                Some(Progress::Failed(reason)) => return Err(Error::Execution(reason)),
                None => {}
            }
        }

        warn!(%prompt_id, "ComfyUI socket closed before the prompt finished");
        Err(Error::WebSocket(
            "connection closed before the prompt finished".to_string(),
        ))
    }
}

// ============================================================================
// Progress events
// ============================================================================

/// What a WebSocket event means for the prompt being waited on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    /// An output node produced images.
    Images(Vec<ImageFile>),
    /// The prompt finished executing.
    Finished,
    /// The prompt failed or was interrupted.
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ExecutedData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    output: Option<NodeOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeOutput {
    #[serde(default)]
    images: Vec<ImageFile>,
}

#[derive(Debug, Deserialize)]
struct ExecutingData {
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutionErrorData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    node_type: Option<String>,
    #[serde(default)]
    exception_message: Option<String>,
}

/// Events without a prompt id are attributed to the prompt being waited on.
fn is_for(event_prompt: &Option<String>, prompt_id: &str) -> bool {
    event_prompt.as_deref().is_none_or(|id| id == prompt_id)
}

fn interpret_event(text: &str, prompt_id: &str) -> Option<Progress> {
    let event: RawEvent = serde_json::from_str(text).ok()?;

    match event.kind.as_str() {
        "executed" => {
            let data: ExecutedData = serde_json::from_value(event.data).ok()?;
            let images = data.output.unwrap_or_default().images;
            (is_for(&data.prompt_id, prompt_id) && !images.is_empty())
                .then_some(Progress::Images(images))
        }
        "executing" => {
            let data: ExecutingData = serde_json::from_value(event.data).ok()?;
            (data.node.is_none() && is_for(&data.prompt_id, prompt_id))
                .then_some(Progress::Finished)
        }
        "execution_error" => {
            let data: ExecutionErrorData = serde_json::from_value(event.data).ok()?;
            if !is_for(&data.prompt_id, prompt_id) {
                return None;
            }
            let message = data
                .exception_message
                .unwrap_or_else(|| "unknown error".to_string());
            Some(Progress::Failed(match data.node_type {
                Some(node) => format!("{node}: {}", message.trim()),
                None => message.trim().to_string(),
            }))
        }
        "execution_interrupted" => {
            let data: ExecutingData = serde_json::from_value(event.data).ok()?;
            is_for(&data.prompt_id, prompt_id)
                .then(|| Progress::Failed("execution interrupted".to_string()))
        }
        _ => None,
    }
}

/// Collect the images recorded for `prompt_id` in a `/history` response.
fn images_in_history(history: &Value, prompt_id: &str) -> Vec<ImageFile> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };

    outputs
        .values()
        .filter_map(|output| serde_json::from_value::<NodeOutput>(output.clone()).ok())
        .flat_map(|output| output.images)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ComfyUi {
        ComfyUi::new(DEFAULT_BASE_URL).unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert!(client.client_id().starts_with("client_"));
        assert_eq!(client.base_url(), "http://127.0.0.1:8188");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            ComfyUi::new("ftp://127.0.0.1:8188"),
            Err(Error::Config(_))
        ));
        assert!(matches!(ComfyUi::new("not a url"), Err(Error::Config(_))));
    }

    #[test]
    fn test_websocket_url() {
        let client = client();
        assert_eq!(
            client.websocket_url(),
            format!("ws://127.0.0.1:8188/ws?clientId={}", client.client_id())
        );

        let secure = ComfyUi::new("https://comfy.local/").unwrap();
        assert!(secure.websocket_url().starts_with("wss://comfy.local/ws?clientId="));
    }

    #[test]
    fn test_view_url_encodes_query() {
        let url = client()
            .view_url(&ImageFile {
                filename: "ComfyUI_00001_.png".to_string(),
                subfolder: "story scenes".to_string(),
                kind: "output".to_string(),
            })
            .unwrap();

        assert_eq!(
            url,
            "http://127.0.0.1:8188/view?filename=ComfyUI_00001_.png&subfolder=story+scenes&type=output"
        );
    }

    #[test]
    fn test_text_to_image_uses_client_checkpoint() {
        let client = client().with_checkpoint("dreamshaper.safetensors");
        let graph = client.text_to_image("a lighthouse").build();
        assert_eq!(graph["4"]["inputs"]["ckpt_name"], "dreamshaper.safetensors");
        assert_eq!(graph["6"]["inputs"]["text"], "a lighthouse");
    }

    #[test]
    fn test_executed_event_with_images() {
        let text = r#"{"type": "executed", "data": {"node": "9", "prompt_id": "p1",
            "output": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]}}}"#;

        let progress = interpret_event(text, "p1").unwrap();
        let Progress::Images(images) = progress else {
            panic!("expected images, got {progress:?}");
        };
        assert_eq!(images[0].filename, "a.png");

        assert_eq!(interpret_event(text, "other"), None);
    }

    #[test]
    fn test_executed_event_without_images_is_ignored() {
        let text = r#"{"type": "executed", "data": {"node": "8", "prompt_id": "p1", "output": {}}}"#;
        assert_eq!(interpret_event(text, "p1"), None);
    }

    #[test]
    fn test_executing_null_node_means_finished() {
        let done = r#"{"type": "executing", "data": {"node": null, "prompt_id": "p1"}}"#;
        let running = r#"{"type": "executing", "data": {"node": "3", "prompt_id": "p1"}}"#;

        assert_eq!(interpret_event(done, "p1"), Some(Progress::Finished));
        assert_eq!(interpret_event(running, "p1"), None);
    }

    #[test]
    fn test_execution_error() {
        let text = r#"{"type": "execution_error", "data": {"prompt_id": "p1",
            "node_type": "CheckpointLoaderSimple", "exception_message": "file not found\n"}}"#;

        assert_eq!(
            interpret_event(text, "p1"),
            Some(Progress::Failed(
                "CheckpointLoaderSimple: file not found".to_string()
            ))
        );
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let status = r#"{"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 1}}}}"#;
        assert_eq!(interpret_event(status, "p1"), None);
        assert_eq!(interpret_event("not json", "p1"), None);
    }

    #[test]
    fn test_images_in_history() {
        let history = json!({
            "p1": {
                "outputs": {
                    "9": {"images": [{"filename": "b.png", "subfolder": "", "type": "output"}]}
                },
                "status": {"completed": true}
            }
        });

        let images = images_in_history(&history, "p1");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].filename, "b.png");
        assert!(images_in_history(&history, "p2").is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_image_skips_progress_until_output() {
        let client = client();
        let frames = vec![
            Ok(tungstenite::Message::binary(vec![1u8, 2, 3])),
            Ok(tungstenite::Message::text(
                r#"{"type": "progress", "data": {"value": 5, "max": 20}}"#.to_string(),
            )),
            Ok(tungstenite::Message::text(
                r#"{"type": "executed", "data": {"node": "9", "prompt_id": "p1",
                    "output": {"images": [{"filename": "c.png", "subfolder": "", "type": "output"}]}}}"#
                    .to_string(),
            )),
        ];
        let mut socket = futures::stream::iter(frames);

        let url = client.wait_for_image(&mut socket, "p1").await.unwrap();
        assert!(url.ends_with("/view?filename=c.png&subfolder=&type=output"));
    }

    #[tokio::test]
    async fn test_wait_for_image_reports_execution_error() {
        let client = client();
        let frames = vec![Ok(tungstenite::Message::text(
            r#"{"type": "execution_error", "data": {"prompt_id": "p1", "exception_message": "out of memory"}}"#
                .to_string(),
        ))];
        let mut socket = futures::stream::iter(frames);

        let err = client.wait_for_image(&mut socket, "p1").await.unwrap_err();
        assert!(matches!(err, Error::Execution(msg) if msg == "out of memory"));
    }

    #[tokio::test]
    async fn test_wait_for_image_fails_when_socket_closes() {
        let client = client();
        let mut socket = futures::stream::iter(Vec::<
            Result<tungstenite::Message, tungstenite::Error>,
        >::new());

        let err = client.wait_for_image(&mut socket, "p1").await.unwrap_err();
        assert!(matches!(err, Error::WebSocket(_)));
    }
}
