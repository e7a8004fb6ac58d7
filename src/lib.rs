pub mod error;
pub mod config;
pub mod sanitizer;
pub mod analyzer;
pub mod rate_limiter;
pub mod providers;
pub mod request;
pub mod enhancer;
pub mod client;
pub mod store;
pub mod session;

pub use analyzer::{analyze, PromptAnalysis};
pub use client::EnhancementService;
pub use config::{PromanceConfig, ProviderConfig, RateLimitConfig};
pub use error::{Error, ErrorCode, PromptError};
pub use rate_limiter::{RateLimitStatus, RateLimiter};
pub use request::{EnhancementRequest, EnhancementResponse, StreamChunk};
pub use session::Session;
pub use store::{AppStore, StorageFile};

/*

promance: scores a raw prompt locally and asks a hosted model to
rewrite it, optionally streaming the rewrite as it is generated.

promance/
├── src/
│   ├── lib.rs          # Service API types and re-exports
│   ├── error.rs        # Error type and UI error taxonomy
│   ├── config.rs       # Provider, rate limit and session config
│   ├── sanitizer.rs    # Prompt/text/HTML cleaning
│   ├── analyzer.rs     # Heuristic prompt scoring
│   ├── rate_limiter.rs # Sliding-window limiter
│   ├── providers/      # Generation endpoint clients
│   ├── request.rs      # Enhancement request/response types
│   ├── enhancer.rs     # Instruction building, reply parsing
│   ├── client.rs       # Service task owning credential + limiter
│   ├── store.rs        # Application state and persistence
│   └── session.rs      # Debounced analysis, enhancement flow
└── tests/

*/

/// Current wall-clock time in epoch-millis
pub fn now_ms() -> i64
{   chrono::Utc::now().timestamp_millis()
}

/// Install env_logger with `promance=info` unless RUST_LOG says
/// otherwise. Safe to call more than once.
pub fn init_logger()
{   let _ = env_logger::Builder::from_env(
      env_logger::Env::default().default_filter_or("promance=info")
    ).try_init();
}

/// SERVICE API INTERFACE:

// ===== SetApiKey =====

pub type SetApiKeyReply = Result<(), crate::error::Error>;
pub type SetApiKeyReplySender
  = tokio::sync::mpsc::UnboundedSender<SetApiKeyReply>;

pub struct SetApiKeyArgs
{   pub key: String
  , pub reply: SetApiKeyReplySender
}

// ===== Enhance =====

pub type EnhanceReply
  = Result<crate::request::EnhancementResponse, crate::error::Error>;
pub type EnhanceReplySender
  = tokio::sync::mpsc::UnboundedSender<EnhanceReply>;

pub struct EnhanceArgs
{   pub request: crate::request::EnhancementRequest
  , pub reply: EnhanceReplySender
}

// ===== EnhanceStreaming =====

pub type StreamChunkSender
  = tokio::sync::mpsc::UnboundedSender<crate::request::StreamChunk>;

pub struct EnhanceStreamingArgs
{   pub request: crate::request::EnhancementRequest
  , pub chunks: StreamChunkSender
  , pub reply: EnhanceReplySender
}

// ===== TestConnection =====

pub type TestConnectionReplySender
  = tokio::sync::mpsc::UnboundedSender<bool>;

pub struct TestConnectionArgs
{   pub key: String
  , pub reply: TestConnectionReplySender
}

// ===== RateLimitStatus =====

pub type RateLimitStatusReplySender
  = tokio::sync::mpsc::UnboundedSender<crate::rate_limiter::RateLimitStatus>;

pub struct RateLimitStatusArgs
{   pub reply: RateLimitStatusReplySender
}

// ===== Shutdown =====

pub type ShutdownReply = Result<(), crate::error::Error>;
pub type ShutdownReplySender
  = tokio::sync::mpsc::UnboundedSender<ShutdownReply>;

pub struct ShutdownArgs
{   pub reply: ShutdownReplySender
}

// ===== ServiceHand (sender side) =====

pub struct ServiceHand
{   pub set_api_key_tx
      : tokio::sync::mpsc::UnboundedSender<SetApiKeyArgs>
  , pub enhance_tx
      : tokio::sync::mpsc::UnboundedSender<EnhanceArgs>
  , pub enhance_streaming_tx
      : tokio::sync::mpsc::UnboundedSender<EnhanceStreamingArgs>
  , pub test_connection_tx
      : tokio::sync::mpsc::UnboundedSender<TestConnectionArgs>
  , pub rate_limit_status_tx
      : tokio::sync::mpsc::UnboundedSender<RateLimitStatusArgs>
  , pub shutdown_tx
      : tokio::sync::mpsc::UnboundedSender<ShutdownArgs>
}

// ===== ServiceFoot (receiver side) =====

pub struct ServiceFoot
{   pub set_api_key_rx
      : tokio::sync::mpsc::UnboundedReceiver<SetApiKeyArgs>
  , pub enhance_rx
      : tokio::sync::mpsc::UnboundedReceiver<EnhanceArgs>
  , pub enhance_streaming_rx
      : tokio::sync::mpsc::UnboundedReceiver<EnhanceStreamingArgs>
  , pub test_connection_rx
      : tokio::sync::mpsc::UnboundedReceiver<TestConnectionArgs>
  , pub rate_limit_status_rx
      : tokio::sync::mpsc::UnboundedReceiver<RateLimitStatusArgs>
  , pub shutdown_rx
      : tokio::sync::mpsc::UnboundedReceiver<ShutdownArgs>
}
