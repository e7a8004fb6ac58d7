use std::sync::Arc;
use tokio::sync::mpsc;
use log::{debug, error, info, warn};
use crate::config::{PromanceConfig, RateLimitConfig};
use crate::enhancer::{
  check_connection
, run_enhancement
, run_streaming_enhancement
, PromptEnhancer
};
use crate::error::{Error, ErrorCode, PromptError};
use crate::providers::{Connector, GeminiConnector};
use crate::rate_limiter::{
  create_browser_identifier
, EnvironmentSignals
, RateLimiter
};
use crate::ServiceFoot;

/// State owned by the service task. Only the loop touches it, so the
/// credential slot and the rate-limit table need no locking.
pub struct ServiceState
{   pub enhancer: PromptEnhancer
  , pub limiter: RateLimiter
  , pub rate_limit: RateLimitConfig
  , pub identifier: String
}

impl ServiceState
{   pub fn new(
      connector: Arc<dyn Connector>
    , rate_limit: RateLimitConfig
    , identifier: String
    ) -> Self
    {   debug!("Initializing ServiceState for {}", identifier);
        ServiceState
        {   enhancer: PromptEnhancer::new(connector)
          , limiter: RateLimiter::new()
          , rate_limit
          , identifier
        }
    }

    /// Credential check, then one rate-limit slot. A refusal never
    /// reaches the provider.
    fn admit(&mut self)
      -> Result<Arc<dyn crate::providers::GenerationBackend>, Error>
    {   let backend = self.enhancer.backend()?;

        let now = crate::now_ms();
        if !self.limiter.is_allowed_at(&self.identifier, &self.rate_limit, now)
        {   let status = self.limiter
              .get_status_at(&self.identifier, &self.rate_limit, now);
            warn!(
              "Rejecting enhancement for {}: rate limited until {}"
            , self.identifier
            , status.reset_time
            );
            return Err(PromptError::new(
                ErrorCode::RateLimit
              , "Too many requests. Please wait before trying again."
              )
              .with_detail("requestsRemaining", status.requests_remaining)
              .with_detail("resetTime", status.reset_time)
              .with_detail("retryIn", status.format_time_until_reset(now))
              .into());
        }
        Ok(backend)
    }
}

/// Public API for the enhancement service - owns the task
pub struct EnhancementService
{   hand: crate::ServiceHand
  , identifier: String
  , _task_handle: tokio::task::JoinHandle<()>
}

impl EnhancementService
{   /// Gemini-backed service keyed by this process's fingerprint.
    /// Must be called inside a tokio runtime.
    pub fn new(config: &PromanceConfig) -> Self
    {   let identifier = create_browser_identifier(
          &EnvironmentSignals::from_env()
        );
        EnhancementService::with_connector(
          Arc::new(GeminiConnector::new(config.provider.clone()))
        , config.rate_limit
        , identifier
        )
    }

    /// Create and spawn the service task around any connector.
    /// Returns immediately.
    pub fn with_connector(
      connector: Arc<dyn Connector>
    , rate_limit: RateLimitConfig
    , identifier: impl Into<String>
    ) -> Self
    {   let identifier = identifier.into();
        debug!("Creating EnhancementService for {}", identifier);

        let (set_api_key_tx, set_api_key_rx)
          = mpsc::unbounded_channel();
        let (enhance_tx, enhance_rx)
          = mpsc::unbounded_channel();
        let (enhance_streaming_tx, enhance_streaming_rx)
          = mpsc::unbounded_channel();
        let (test_connection_tx, test_connection_rx)
          = mpsc::unbounded_channel();
        let (rate_limit_status_tx, rate_limit_status_rx)
          = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx)
          = mpsc::unbounded_channel();

        let hand = crate::ServiceHand
        {   set_api_key_tx
          , enhance_tx
          , enhance_streaming_tx
          , test_connection_tx
          , rate_limit_status_tx
          , shutdown_tx
        };

        let foot = crate::ServiceFoot
        {   set_api_key_rx
          , enhance_rx
          , enhance_streaming_rx
          , test_connection_rx
          , rate_limit_status_rx
          , shutdown_rx
        };

        let state = ServiceState::new(connector, rate_limit, identifier.clone());
        let _task_handle = tokio::spawn(async move {
          run_service_loop(foot, state).await
        });

        EnhancementService
        {   hand
          , identifier
          , _task_handle
        }
    }

    /// Rate-limit identifier of this service
    pub fn identifier(&self) -> &str
    {   &self.identifier
    }

    /// Bind a credential, replacing the previous one
    pub async fn set_api_key(
      &self
    , key: String
    ) -> Result<
        mpsc::UnboundedReceiver<crate::SetApiKeyReply>,
        Error
      >
    {   debug!("set_api_key queuing command");
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.hand.set_api_key_tx
          .send(crate::SetApiKeyArgs { key, reply: reply_tx })
          .map_err(|_| disconnected())?;
        Ok(reply_rx)
    }

    /// Queue a whole-reply enhancement
    pub async fn enhance(
      &self
    , request: crate::request::EnhancementRequest
    ) -> Result<
        mpsc::UnboundedReceiver<crate::EnhanceReply>,
        Error
      >
    {   debug!("enhance queuing command");
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.hand.enhance_tx
          .send(crate::EnhanceArgs { request, reply: reply_tx })
          .map_err(|_| disconnected())?;
        Ok(reply_rx)
    }

    /// Queue a streaming enhancement. Fragments arrive on `chunks`
    /// in order, followed by one completion chunk on success.
    pub async fn enhance_streaming(
      &self
    , request: crate::request::EnhancementRequest
    , chunks: crate::StreamChunkSender
    ) -> Result<
        mpsc::UnboundedReceiver<crate::EnhanceReply>,
        Error
      >
    {   debug!("enhance_streaming queuing command");
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.hand.enhance_streaming_tx
          .send(crate::EnhanceStreamingArgs
          {   request
            , chunks
            , reply: reply_tx
          })
          .map_err(|_| disconnected())?;
        Ok(reply_rx)
    }

    /// Bind `key` and check the provider responds
    pub async fn test_connection(
      &self
    , key: String
    ) -> Result<mpsc::UnboundedReceiver<bool>, Error>
    {   debug!("test_connection queuing command");
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.hand.test_connection_tx
          .send(crate::TestConnectionArgs { key, reply: reply_tx })
          .map_err(|_| disconnected())?;
        Ok(reply_rx)
    }

    /// Remaining budget for this service's identifier
    pub async fn rate_limit_status(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::rate_limiter::RateLimitStatus>,
        Error
      >
    {   let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.hand.rate_limit_status_tx
          .send(crate::RateLimitStatusArgs { reply: reply_tx })
          .map_err(|_| disconnected())?;
        Ok(reply_rx)
    }

    /// Gracefully shutdown the service
    pub async fn shutdown(self) -> Result<(), Error>
    {   debug!("Shutting down EnhancementService");
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        self.hand.shutdown_tx
          .send(crate::ShutdownArgs { reply: reply_tx })
          .map_err(|_| {
            error!("Service channel already closed");
            Error::BackendDisconnected
          })?;

        match reply_rx.recv().await
        {   Some(result) => {
              debug!("Service shutdown confirmed");
              result
            }
          , None => {
              error!("Service shutdown timeout");
              Err(Error::Timeout)
            }
        }
    }
}

fn disconnected() -> Error
{   error!("Service channel closed");
    Error::BackendDisconnected
}

/// Main service loop
///
/// The select arms only touch the owned state and hand provider work
/// to spawned tasks, so a slow call never blocks the next command.
async fn run_service_loop(
  foot: ServiceFoot
, mut state: ServiceState
)
{   debug!("Starting EnhancementService loop");
    let ServiceFoot
    {   mut set_api_key_rx
      , mut enhance_rx
      , mut enhance_streaming_rx
      , mut test_connection_rx
      , mut rate_limit_status_rx
      , mut shutdown_rx
    } = foot;

    loop
    { tokio::select!
      { Some(cmd) = set_api_key_rx.recv() => {
          debug!("Received SetApiKey");
          let result = state.enhancer
            .initialize(&cmd.key)
            .map_err(Error::from);
          let _ = cmd.reply.send(result);
        }
      , Some(cmd) = enhance_rx.recv() => {
          debug!("Received Enhance");
          match state.admit()
          {   Ok(backend) => {
                tokio::spawn(async move {
                  let result = run_enhancement(backend, cmd.request)
                    .await
                    .map_err(Error::from);
                  let _ = cmd.reply.send(result);
                });
              }
            , Err(e) => {
                let _ = cmd.reply.send(Err(e));
              }
          }
        }
      , Some(cmd) = enhance_streaming_rx.recv() => {
          debug!("Received EnhanceStreaming");
          match state.admit()
          {   Ok(backend) => {
                tokio::spawn(async move {
                  let result = run_streaming_enhancement(
                      backend
                    , cmd.request
                    , cmd.chunks
                    )
                    .await
                    .map_err(Error::from);
                  let _ = cmd.reply.send(result);
                });
              }
            , Err(e) => {
                let _ = cmd.reply.send(Err(e));
              }
          }
        }
      , Some(cmd) = test_connection_rx.recv() => {
          debug!("Received TestConnection");
          let backend = state.enhancer
            .initialize(&cmd.key)
            .and_then(|()| state.enhancer.backend());
          match backend
          {   Ok(backend) => {
                tokio::spawn(async move {
                  let _ = cmd.reply.send(check_connection(backend).await);
                });
              }
            , Err(e) => {
                error!("API connection test failed: {}", e);
                let _ = cmd.reply.send(false);
              }
          }
        }
      , Some(cmd) = rate_limit_status_rx.recv() => {
          let status = state.limiter
            .get_status(&state.identifier, &state.rate_limit);
          let _ = cmd.reply.send(status);
        }
      , Some(cmd) = shutdown_rx.recv() => {
          debug!("Received Shutdown");
          let _ = cmd.reply.send(Ok(()));
          info!("EnhancementService shutting down");
          break;
        }
      , else => break
      }
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use crate::providers::{FragmentReceiver, GenerationBackend};
    use crate::request::EnhancementRequest;
    use async_trait::async_trait;

    struct EchoBackend;

    #[async_trait]
    impl GenerationBackend for EchoBackend
    {   async fn generate(&self, _instruction: String)
          -> Result<String, Error>
        {   Ok(r#"{"enhancedPrompt":"E","improvements":["i"],"reasoning":"r"}"#.to_string())
        }

        async fn generate_stream(&self, _instruction: String)
          -> Result<FragmentReceiver, Error>
        {   let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    struct EchoConnector;

    impl Connector for EchoConnector
    {   fn connect(&self, _api_key: &str)
          -> Result<Arc<dyn GenerationBackend>, Error>
        {   Ok(Arc::new(EchoBackend))
        }
    }

    fn state(max_requests: usize) -> ServiceState
    {   ServiceState::new(
          Arc::new(EchoConnector)
        , RateLimitConfig { max_requests, window_ms: 60_000 }
        , "browser-1".to_string()
        )
    }

    #[test]
    fn test_admit_requires_credential_before_consuming_slot()
    {   let mut state = state(1);
        let err = state.admit().err().expect("no credential");
        assert_eq!(err.code(), ErrorCode::ApiError);
        assert_eq!(
          state.limiter
            .get_status(&state.identifier, &state.rate_limit)
            .requests_remaining
        , 1
        );
    }

    #[test]
    fn test_admit_rejects_with_rate_limit_details()
    {   let mut state = state(1);
        state.enhancer.initialize("key").expect("initialize");
        assert!(state.admit().is_ok());

        let Err(Error::Prompt(err)) = state.admit() else
        {   panic!("expected rate limit rejection");
        };
        assert_eq!(err.code, ErrorCode::RateLimit);
        let details = err.details.expect("details");
        assert_eq!(details["requestsRemaining"], 0);
        assert!(details["resetTime"].as_i64().is_some());
    }

    #[tokio::test]
    async fn test_service_round_trip_and_shutdown()
    {   let service = EnhancementService::with_connector(
          Arc::new(EchoConnector)
        , RateLimitConfig::default()
        , "browser-2"
        );
        assert_eq!(service.identifier(), "browser-2");

        let mut ack = service.set_api_key("key".to_string()).await
          .expect("queued");
        assert_eq!(ack.recv().await, Some(Ok(())));

        let mut reply = service
          .enhance(EnhancementRequest::new("write a poem"))
          .await
          .expect("queued");
        let response = reply.recv().await
          .expect("reply")
          .expect("response");
        assert_eq!(response.enhanced_prompt, "E");

        service.shutdown().await.expect("shutdown");
    }
}
