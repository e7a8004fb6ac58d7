//! Generation provider implementations

pub mod gemini;

// Re-export for convenience
pub use gemini::{
  Connector
, FragmentReceiver
, GeminiClient
, GeminiConnector
, GenerationBackend
};
