use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use log::{debug, trace, error, warn};
use crate::config::ProviderConfig;
use crate::error::Error;

// ===== Message Types =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part
{   #[serde(default)]
    pub text: String
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content
{   #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>
  , #[serde(default)]
    pub parts: Vec<Part>
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig
{   #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest
{   pub contents: Vec<Content>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiResponse
{   #[serde(default)]
    pub candidates: Vec<Candidate>
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate
{   #[serde(default)]
    pub content: Option<Content>
  , #[serde(default)]
    pub finish_reason: Option<String>
}

impl GeminiResponse
{   /// Concatenated part texts of the first candidate
    pub fn text(&self) -> Option<String>
    {   let content = self.candidates.first()?.content.as_ref()?;
        Some(
          content.parts
            .iter()
            .map(|p| p.text.as_str())
            .collect()
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiErrorEnvelope
{   error: GeminiErrorBody
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiErrorBody
{   #[serde(default)]
    message: String
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiModelsResponse
{   #[serde(default)]
    pub models: Vec<ModelData>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelData
{   pub name: String
}

// ===== Backend seam =====

/// Ordered text fragments of one streamed reply. The channel closing
/// marks the end of the stream.
pub type FragmentReceiver
  = mpsc::UnboundedReceiver<Result<String, Error>>;

/// A text-generation endpoint bound to one credential
#[async_trait]
pub trait GenerationBackend: Send + Sync
{   /// Send an instruction and wait for the whole reply
    async fn generate(&self, instruction: String)
      -> Result<String, Error>;

    /// Send an instruction and receive the reply incrementally.
    /// Request-level failures are returned directly; failures while
    /// reading arrive as an `Err` item, after which the channel
    /// closes.
    async fn generate_stream(&self, instruction: String)
      -> Result<FragmentReceiver, Error>;
}

/// Builds a backend for a credential
pub trait Connector: Send + Sync
{   fn connect(&self, api_key: &str)
      -> Result<Arc<dyn GenerationBackend>, Error>;
}

/// Connector for the Google Generative Language API
#[derive(Debug, Clone, Default)]
pub struct GeminiConnector
{   config: ProviderConfig
}

impl GeminiConnector
{   pub fn new(config: ProviderConfig) -> Self
    {   GeminiConnector { config }
    }
}

impl Connector for GeminiConnector
{   fn connect(&self, api_key: &str)
      -> Result<Arc<dyn GenerationBackend>, Error>
    {   let client = GeminiClient::new(
          api_key.to_string()
        , self.config.clone()
        )?;
        Ok(Arc::new(client))
    }
}

// ===== Gemini client =====

pub struct GeminiClient
{   api_key: String
  , config: ProviderConfig
  , http_client: reqwest::Client
}

impl GeminiClient
{   pub fn new(api_key: String, config: ProviderConfig)
      -> Result<Self, Error>
    {   debug!("Creating GeminiClient for model: {}", config.model);
        if api_key.trim().is_empty()
        {   return Err(Error::MissingApiKey("Gemini".to_string()));
        }

        let http_client = reqwest::Client::builder()
          .connect_timeout(Duration::from_secs(config.timeout_secs))
          .build()
          .map_err(|e| {
            error!("Failed to build HTTP client: {}", e);
            Error::InvalidConfiguration(e.to_string())
          })?;

        Ok(GeminiClient
        {   api_key
          , config
          , http_client
        })
    }

    /// Whole-call budget for unary requests; for streams it bounds
    /// the wait for headers and every gap between reads.
    fn timeout(&self) -> Duration
    {   Duration::from_secs(self.config.timeout_secs)
    }

    fn endpoint(&self, method: &str) -> String
    {   format!(
          "{}/models/{}:{}"
        , self.config.api_base.trim_end_matches('/')
        , self.config.model
        , method
        )
    }

    fn build_request(&self, instruction: String) -> GeminiRequest
    {   let generation_config = if self.config.temperature.is_some()
          || self.config.max_output_tokens.is_some()
        {   Some(GenerationConfig
            {   temperature: self.config.temperature
              , max_output_tokens: self.config.max_output_tokens
            })
        } else
        {   None
        };

        GeminiRequest
        {   contents: vec![
              Content
              {   role: Some("user".to_string())
                , parts: vec![Part { text: instruction }]
              }
            ]
          , generation_config
        }
    }

    /// POST and check the status. A streaming call must not carry a
    /// request timeout, since reqwest applies it to the whole body.
    async fn post(&self, url: String, body: &GeminiRequest, streaming: bool)
      -> Result<reqwest::Response, Error>
    {   trace!("Gemini request to {}: {:?}", url, body);

        let mut request = self.http_client
          .post(url)
          .header("x-goog-api-key", &self.api_key)
          .json(body);
        if !streaming
        {   request = request.timeout(self.timeout());
        }

        let response = tokio::time::timeout(self.timeout(), request.send())
          .await
          .map_err(|_| {
            error!("Timed out waiting for Gemini response headers");
            Error::Timeout
          })?
          .map_err(|e| {
            error!("HTTP error: {}", e);
            Error::from(e)
          })?;

        let status = response.status();
        trace!("Gemini response status: {}", status);

        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Gemini API error ({}): {}", status, error_text);
            return Err(status_error(status.as_u16(), &error_text));
        }

        Ok(response)
    }

    /// Names of the models this credential can use
    pub async fn list_models(&self) -> Result<Vec<String>, Error>
    {   debug!("Listing Gemini models");
        let response = self.http_client
          .get(format!(
            "{}/models"
          , self.config.api_base.trim_end_matches('/')
          ))
          .timeout(self.timeout())
          .header("x-goog-api-key", &self.api_key)
          .send()
          .await
          .map_err(Error::from)?;

        let status = response.status();
        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Failed to list models: {}", error_text);
            return Err(status_error(status.as_u16(), &error_text));
        }

        let models: GeminiModelsResponse = response.json().await
          .map_err(|e| Error::ParseError(e.to_string()))?;
        let names: Vec<String> = models.models
          .into_iter()
          .map(|m| m.name)
          .collect();
        debug!("Retrieved {} models", names.len());
        Ok(names)
    }
}

/// Map a non-success status to an error, preferring the provider's
/// own message over the raw body
pub fn status_error(status: u16, body: &str) -> Error
{   if status == 429
    {   return Error::RateLimitExceeded;
    }
    let message = serde_json::from_str::<GeminiErrorEnvelope>(body)
      .map(|envelope| envelope.error.message)
      .ok()
      .filter(|m| !m.is_empty())
      .unwrap_or_else(|| body.to_string());
    Error::ApiError(format!("Gemini error ({}): {}", status, message))
}

#[async_trait]
impl GenerationBackend for GeminiClient
{   async fn generate(&self, instruction: String)
      -> Result<String, Error>
    {   debug!("Gemini generate ({} chars)", instruction.len());
        let body = self.build_request(instruction);
        let response = self
          .post(self.endpoint("generateContent"), &body, false)
          .await?;

        let reply: GeminiResponse = response.json().await
          .map_err(|e| {
            error!("Parse error: {}", e);
            Error::ParseError(e.to_string())
          })?;

        reply.text().ok_or_else(|| {
          error!("No candidates in response");
          Error::NoCandidatesInResponse
        })
    }

    async fn generate_stream(&self, instruction: String)
      -> Result<FragmentReceiver, Error>
    {   debug!("Gemini generate_stream ({} chars)", instruction.len());
        let body = self.build_request(instruction);
        let url = format!(
          "{}?alt=sse"
        , self.endpoint("streamGenerateContent")
        );
        let response = self.post(url, &body, true).await?;
        let idle_timeout = self.timeout();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
          let mut bytes = response.bytes_stream();
          let mut decoder = SseDecoder::new();
          loop
          {   let item = match tokio::time::timeout(idle_timeout, bytes.next()).await
              {   Ok(Some(item)) => item
                , Ok(None) => break
                , Err(_) => {
                    error!("Stream stalled for {:?}", idle_timeout);
                    let _ = tx.send(Err(Error::Timeout));
                    return;
                  }
              };
              match item
              {   Ok(chunk) => {
                    for fragment in decoder.push(&chunk)
                    {   if tx.send(Ok(fragment)).is_err()
                        {   debug!("Stream receiver dropped");
                            return;
                        }
                    }
                  }
                , Err(e) => {
                    error!("Error in stream: {}", e);
                    let _ = tx.send(Err(Error::from(e)));
                    return;
                  }
              }
          }
          for fragment in decoder.finish()
          {   let _ = tx.send(Ok(fragment));
          }
          trace!("Gemini stream finished");
        });

        Ok(rx)
    }
}

// ===== Server-sent events =====

/// Incremental decoder for `alt=sse` replies. Bytes may arrive split
/// anywhere, including inside a UTF-8 sequence; only complete lines
/// are decoded.
#[derive(Debug, Default)]
pub struct SseDecoder
{   buffer: Vec<u8>
}

impl SseDecoder
{   pub fn new() -> Self
    {   SseDecoder::default()
    }

    /// Feed raw bytes, get the text of every completed event
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String>
    {   self.buffer.extend_from_slice(bytes);
        let mut fragments = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n')
        {   let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(text) = decode_line(&line)
            {   fragments.push(text);
            }
        }
        fragments
    }

    /// Decode a trailing line that never got its newline
    pub fn finish(&mut self) -> Vec<String>
    {   let line = std::mem::take(&mut self.buffer);
        decode_line(&line).into_iter().collect()
    }
}

fn decode_line(line: &[u8]) -> Option<String>
{   let line = std::str::from_utf8(line).ok()?;
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]"
    {   return None;
    }

    match serde_json::from_str::<GeminiResponse>(payload)
    {   Ok(event) => event.text().filter(|t| !t.is_empty())
      , Err(e) => {
          warn!("Skipping undecodable stream event: {}", e);
          None
        }
    }
}
