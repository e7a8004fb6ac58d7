//! Interactive session: keeps the store in step with prompt edits
//! and drives enhancements through the service.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use log::{debug, info, warn};
use crate::analyzer::{analyze, PromptAnalysis};
use crate::client::EnhancementService;
use crate::config::SessionConfig;
use crate::error::{Error, PromptError};
use crate::request::{EnhancementRequest, EnhancementResponse, StreamChunk};
use crate::sanitizer::{sanitize_prompt, sanitize_text, validate_api_key};
use crate::store::{AppStore, StorageFile};
use crate::StreamChunkSender;

pub const NO_PROMPT_MESSAGE: &str = "No prompt or analysis available";
pub const NO_API_KEY_MESSAGE: &str
  = "API key is required. Please set your Gemini API key.";
pub const ENHANCEMENT_FAILED_MESSAGE: &str
  = "Enhancement failed. Please try again.";

pub struct Session
{   store: Arc<Mutex<AppStore>>
  , service: Arc<EnhancementService>
  , storage: Option<StorageFile>
  , config: SessionConfig
  , pending_analysis: Option<JoinHandle<()>>
  , pending_api_key: Option<JoinHandle<()>>
}

impl Session
{   /// Store is seeded from `storage` when one is given
    pub fn new(
      service: Arc<EnhancementService>
    , config: SessionConfig
    , storage: Option<StorageFile>
    ) -> Self
    {   let store = match &storage
        {   Some(storage) => AppStore::from_persisted(storage.load())
          , None => AppStore::new()
        };
        Session
        {   store: Arc::new(Mutex::new(store))
          , service
          , storage
          , config
          , pending_analysis: None
          , pending_api_key: None
        }
    }

    pub fn store(&self) -> Arc<Mutex<AppStore>>
    {   self.store.clone()
    }

    pub async fn snapshot(&self) -> AppStore
    {   self.store.lock().await.snapshot()
    }

    /// Store the sanitized prompt and re-analyse it after the
    /// debounce delay. A newer edit cancels the pending analysis.
    pub async fn set_original_prompt(&mut self, raw: &str)
    {   let prompt = sanitize_prompt(raw);
        if let Some(pending) = self.pending_analysis.take()
        {   pending.abort();
        }

        let mut store = self.store.lock().await;
        store.set_original_prompt(prompt.clone());
        if prompt.trim().is_empty()
        {   store.set_analysis(None);
            store.set_is_analyzing(false);
            return;
        }
        store.set_is_analyzing(true);
        drop(store);

        let shared = self.store.clone();
        let delay = Duration::from_millis(self.config.analysis_debounce_ms);
        self.pending_analysis = Some(tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          let analysis = analyze(&prompt);
          let mut store = shared.lock().await;
          if store.original_prompt() == prompt
          {   debug!("Analysis ready: overall {}", analysis.overall_score);
              store.set_analysis(Some(analysis));
              store.set_is_analyzing(false);
          }
        }));
    }

    /// Analyse the stored prompt right away
    pub async fn analyze_now(&mut self) -> Option<PromptAnalysis>
    {   if let Some(pending) = self.pending_analysis.take()
        {   pending.abort();
        }
        let mut store = self.store.lock().await;
        let prompt = sanitize_prompt(store.original_prompt());
        let analysis = (!prompt.trim().is_empty()).then(|| analyze(&prompt));
        store.set_analysis(analysis.clone());
        store.set_is_analyzing(false);
        analysis
    }

    /// Commit `candidate` after the debounce delay if it looks like a
    /// key and differs from the stored one
    pub fn stage_api_key(&mut self, candidate: &str)
    {   if let Some(pending) = self.pending_api_key.take()
        {   pending.abort();
        }

        let candidate = candidate.trim().to_string();
        let shared = self.store.clone();
        let storage = self.storage.clone();
        let delay = Duration::from_millis(self.config.api_key_debounce_ms);
        self.pending_api_key = Some(tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          if !validate_api_key(&candidate)
          {   return;
          }
          let mut store = shared.lock().await;
          if store.api_key() == candidate
          {   return;
          }
          info!("API key updated");
          store.set_api_key(candidate);
          if let Some(storage) = storage
          {   if let Err(e) = storage.save(&store.persisted())
              {   warn!("Failed to persist state: {}", e);
              }
          }
        }));
    }

    /// Bind `key` in the service and check the provider responds
    pub async fn test_api_key(&self, key: &str) -> bool
    {   match self.service.test_connection(key.to_string()).await
        {   Ok(mut reply) => reply.recv().await.unwrap_or(false)
          , Err(_) => false
        }
    }

    pub async fn enhance_prompt(&self, user_context: Option<&str>)
      -> Result<EnhancementResponse, PromptError>
    {   let (request, api_key) = self.begin(user_context, false).await?;
        let result = self.run(api_key, request, None).await;
        self.finish(result).await
    }

    /// Like `enhance_prompt`, appending fragments to the store's
    /// streamed content as they arrive. `observer` receives a copy
    /// of every chunk.
    pub async fn enhance_prompt_streaming(
      &self
    , user_context: Option<&str>
    , observer: Option<StreamChunkSender>
    ) -> Result<EnhancementResponse, PromptError>
    {   let (request, api_key) = self.begin(user_context, true).await?;

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<StreamChunk>();
        let work = self.run(api_key, request, Some(chunk_tx));
        let drain = async {
          while let Some(chunk) = chunk_rx.recv().await
          {   if !chunk.text.is_empty()
              {   self.store.lock().await.append_streamed_content(&chunk.text);
              }
              if let Some(observer) = &observer
              {   let _ = observer.send(chunk);
              }
          }
        };
        let (result, ()) = tokio::join!(work, drain);
        self.finish(result).await
    }

    /// Save the persisted slice, if this session has storage
    pub async fn persist(&self) -> Result<(), Error>
    {   match &self.storage
        {   Some(storage) => {
              let persisted = self.store.lock().await.persisted();
              storage.save(&persisted)
            }
          , None => Ok(())
        }
    }

    async fn begin(&self, user_context: Option<&str>, streaming: bool)
      -> Result<(EnhancementRequest, String), PromptError>
    {   let mut store = self.store.lock().await;
        let Some(analysis) = store.analysis().cloned() else
        {   return Err(PromptError::validation(NO_PROMPT_MESSAGE));
        };
        if store.original_prompt().trim().is_empty()
        {   return Err(PromptError::validation(NO_PROMPT_MESSAGE));
        }
        if store.api_key().trim().is_empty()
        {   return Err(PromptError::validation(NO_API_KEY_MESSAGE));
        }

        let mut request = EnhancementRequest::new(
            sanitize_prompt(store.original_prompt())
          )
          .with_analysis(analysis);
        if let Some(context) = user_context
        {   request = request.with_context(sanitize_text(context));
        }

        store.set_is_enhancing(true);
        store.set_last_error(None);
        if streaming
        {   store.set_is_streaming(true);
            store.set_streamed_content("");
        }
        Ok((request, store.api_key().to_string()))
    }

    async fn run(
      &self
    , api_key: String
    , request: EnhancementRequest
    , chunks: Option<StreamChunkSender>
    ) -> Result<EnhancementResponse, Error>
    {   let mut ack = self.service.set_api_key(api_key).await?;
        ack.recv().await.ok_or(Error::BackendDisconnected)??;

        let mut reply = match chunks
        {   Some(chunks) => {
              self.service.enhance_streaming(request, chunks).await?
            }
          , None => self.service.enhance(request).await?
        };
        reply.recv().await.ok_or(Error::BackendDisconnected)?
    }

    async fn finish(&self, result: Result<EnhancementResponse, Error>)
      -> Result<EnhancementResponse, PromptError>
    {   let mut store = self.store.lock().await;
        store.set_is_enhancing(false);
        store.set_is_streaming(false);

        match result
        {   Ok(response) => {
              store.set_enhanced_prompt(response.enhanced_prompt.clone());
              store.add_enhancement_to_history(response.clone());
              store.set_has_enhanced(true);
              store.set_modal_open(true);
              if let Some(storage) = &self.storage
              {   if let Err(e) = storage.save(&store.persisted())
                  {   warn!("Failed to persist state: {}", e);
                  }
              }
              Ok(response)
            }
          , Err(e) => {
              store.set_last_error(Some(ENHANCEMENT_FAILED_MESSAGE.to_string()));
              Err(PromptError::classify(&e))
            }
        }
    }
}

impl Drop for Session
{   fn drop(&mut self)
    {   for pending in [self.pending_analysis.take(), self.pending_api_key.take()]
          .into_iter()
          .flatten()
        {   pending.abort();
        }
    }
}
