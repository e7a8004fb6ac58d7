use std::fmt;
use serde::{Deserialize, Serialize};

/// Error codes surfaced to callers of the enhancement API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode
{   /// Provider-side quota signal, or the local limiter refused
    RateLimit
  , /// Provider rejected the request or replied with something
    /// we could not classify
    ApiError
  , /// A local precondition failed (missing credential, empty prompt)
    ValidationError
  , /// Transport failure
    NetworkError
}

impl ErrorCode
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   ErrorCode::RateLimit => "RATE_LIMIT"
          , ErrorCode::ApiError => "API_ERROR"
          , ErrorCode::ValidationError => "VALIDATION_ERROR"
          , ErrorCode::NetworkError => "NETWORK_ERROR"
        }
    }
}

impl fmt::Display for ErrorCode
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

/// Error handed to the UI layer: a code, a human-readable message
/// and an optional detail payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptError
{   pub code: ErrorCode
  , pub message: String
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Map<String, serde_json::Value>>
}

impl PromptError
{   pub fn new(code: ErrorCode, message: impl Into<String>) -> Self
    {   PromptError
        {   code
          , message: message.into()
          , details: None
        }
    }

    pub fn validation(message: impl Into<String>) -> Self
    {   PromptError::new(ErrorCode::ValidationError, message)
    }

    /// Attach one detail entry, creating the map on first use
    pub fn with_detail(
      mut self
    , key: &str
    , value: impl Into<serde_json::Value>
    ) -> Self
    {   self.details
          .get_or_insert_with(serde_json::Map::new)
          .insert(key.to_string(), value.into());
        self
    }

    /// Re-classify an underlying provider or transport error.
    ///
    /// Structural variants are mapped first; anything left is
    /// matched on its message, in the order "API key", then
    /// quota/limit phrases, then network/fetch phrases.
    pub fn classify(error: &Error) -> Self
    {   if let Error::Prompt(inner) = error
        {   return inner.clone();
        }

        let cause = error.to_string();
        let classified = match error
        {   Error::RateLimitExceeded => {
              PromptError::new(
                ErrorCode::RateLimit
              , "Rate limit exceeded"
              )
            }
          , Error::HttpError(_) | Error::Timeout => {
              PromptError::new(
                ErrorCode::NetworkError
              , "Network connection failed"
              )
            }
          , Error::MissingApiKey(_) => {
              PromptError::new(
                ErrorCode::ApiError
              , "AI service not initialized"
              )
            }
          , _ => classify_message(&cause)
        };

        classified.with_detail("cause", cause)
    }
}

fn classify_message(message: &str) -> PromptError
{   let lowered = message.to_lowercase();
    if message.contains("API key")
    {   PromptError::new(ErrorCode::ApiError, "Invalid API key")
    } else if lowered.contains("quota") || lowered.contains("limit")
    {   PromptError::new(ErrorCode::RateLimit, "Rate limit exceeded")
    } else if lowered.contains("network") || lowered.contains("fetch")
    {   PromptError::new(
          ErrorCode::NetworkError
        , "Network connection failed"
        )
    } else
    {   PromptError::new(
          ErrorCode::ApiError
        , "Failed to enhance prompt"
        )
    }
}

impl fmt::Display for PromptError
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for PromptError {}

/// Custom error type for promance operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq)]
pub enum Error
{   /// No credential configured for the generation provider
    MissingApiKey(String)
  , /// HTTP request error
    HttpError(String)
  , /// API returned an error response
    ApiError(String)
  , /// Failed to parse API response
    ParseError(String)
  , /// No candidates in API response
    NoCandidatesInResponse
  , /// Provider-side rate limit exceeded
    RateLimitExceeded
  , /// Invalid configuration
    InvalidConfiguration(String)
  , /// Timeout error
    Timeout
  , /// Reading or writing the persisted state failed
    Storage(String)
  , /// The service task is gone
    BackendDisconnected
  , /// Classified error for the UI layer
    Prompt(PromptError)
  , /// Generic error
    Other(String)
}

impl Error
{   /// Code this error surfaces as once classified
    pub fn code(&self) -> ErrorCode
    {   PromptError::classify(self).code
    }
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::MissingApiKey(provider) => {
              write!(f, "Missing API key for: {}", provider)
            }
          , Error::HttpError(msg) => {
              write!(f, "HTTP error: {}", msg)
            }
          , Error::ApiError(msg) => {
              write!(f, "API error: {}", msg)
            }
          , Error::ParseError(msg) => {
              write!(f, "Parse error: {}", msg)
            }
          , Error::NoCandidatesInResponse => {
              write!(f, "API response contained no candidates")
            }
          , Error::RateLimitExceeded => {
              write!(f, "API rate limit exceeded")
            }
          , Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::Timeout => {
              write!(f, "Request timed out")
            }
          , Error::Storage(msg) => {
              write!(f, "Storage error: {}", msg)
            }
          , Error::BackendDisconnected => {
              write!(f, "Enhancement service disconnected")
            }
          , Error::Prompt(err) => {
              write!(f, "{}", err)
            }
          , Error::Other(msg) => {
              write!(f, "Error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<PromptError> for Error
{   fn from(err: PromptError) -> Self
    {   Error::Prompt(err)
    }
}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   if e.is_timeout()
        {   Error::Timeout
        } else if e.is_decode()
        {   Error::ParseError(e.to_string())
        } else
        {   Error::HttpError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error
{   fn from(e: std::io::Error) -> Self
    {   Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::Storage(e.to_string())
    }
}
