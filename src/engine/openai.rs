use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{EngineHandle, InferenceEngine};
use super::types::{ChatMessage, ProgressCallback, SamplingParams, TokenDelta, TokenStream};
use crate::constants::{HTTP_CONNECT_TIMEOUT_SECS, HTTP_REQUEST_TIMEOUT_SECS};
use crate::runtime::ModelDescriptor;
use crate::utils::EngineError;

/// Engine backed by a local server speaking the OpenAI-compatible protocol
///
/// MLC-LLM `serve`, the llama.cpp server and Ollama all expose this API, so
/// the runtime stays independent of which native library does the work.
pub struct OpenAiCompatEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatEngine {
    /// Create a new engine client for a server at `base_url`
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, EngineError> {
        Self::with_timeout(
            base_url,
            api_key,
            Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List the model ids the server currently serves
    pub async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = authorize(self.client.get(&url), self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| {
                EngineError::Connection(format!("{} (is the engine running at {}?)", e, self.base_url))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api(format!("{}: {}", status, body)));
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Api(format!("invalid model list: {}", e)))?;

        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl InferenceEngine for OpenAiCompatEngine {
    async fn reload(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressCallback,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        progress(0.1);
        let served = self.list_models().await?;
        progress(0.5);

        let model_id = served
            .into_iter()
            .find(|id| serves_weights(id, &descriptor.weights_path))
            .ok_or_else(|| EngineError::ModelUnavailable(descriptor.weights_path.clone()))?;

        debug!(model = %model_id, library = %descriptor.library_path, "engine serves model");
        progress(0.8);

        info!(model = %model_id, engine = %self.base_url, "model bound");
        Ok(Box::new(OpenAiCompatHandle {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model_id,
        }))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

/// Server-side model ids are either the bare weights name or a path ending in it
fn serves_weights(id: &str, weights: &str) -> bool {
    id == weights || id.rsplit('/').next() == Some(weights)
}

fn authorize(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.header("Authorization", format!("Bearer {}", key)),
        None => request,
    }
}

/// Handle for one model served by an OpenAI-compatible server
struct OpenAiCompatHandle {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model_id: String,
}

#[async_trait]
impl EngineHandle for OpenAiCompatHandle {
    async fn generate_stream(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<TokenStream, EngineError> {
        let request_body = json!({
            "model": self.model_id,
            "messages": messages,
            "stream": true,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "n": 1,
        });

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = authorize(self.client.post(&url).json(&request_body), self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api(format!("{}: {}", status, body)));
        }

        Ok(sse_token_stream(response.bytes_stream().boxed()))
    }

    async fn release(&self) {
        // The server owns the weights; dropping the binding is all we can do
        debug!(model = %self.model_id, "released model binding");
    }
}

/// State threaded through the SSE unfold
struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<TokenDelta, EngineError>>,
    done: bool,
}

/// Turn a server-sent-events body into token deltas
fn sse_token_stream(body: BoxStream<'static, reqwest::Result<Bytes>>) -> TokenStream {
    let state = SseState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.done {
                return None;
            }

            let payloads = match st.body.next().await {
                Some(Ok(chunk)) => st.decoder.push(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(EngineError::Stream(e.to_string())), st));
                }
                None => {
                    st.done = true;
                    st.decoder.finish()
                }
            };

            for payload in payloads {
                if payload == "[DONE]" {
                    st.done = true;
                    break;
                }
                st.pending.push_back(parse_chunk(&payload));
            }
        }
    })
    .boxed()
}

/// Parse one `data:` payload
fn parse_chunk(payload: &str) -> Result<TokenDelta, EngineError> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| EngineError::Stream(format!("malformed chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(EngineError::Api(error.message));
    }

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content);
    Ok(TokenDelta { text })
}

/// Incremental server-sent-events line decoder
///
/// Network chunks split lines (and UTF-8 sequences) arbitrarily, so bytes are
/// buffered until a full line is available.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes, returning the `data:` payloads of completed lines
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing line that had no newline
    fn finish(&mut self) -> Vec<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line).into_iter().collect()
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() {
        None
    } else {
        Some(data.to_string())
    }
}

// Response structures (OpenAI format)

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}
