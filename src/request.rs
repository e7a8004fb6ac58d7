//! Enhancement request and response types

use serde::{Deserialize, Serialize};
use crate::analyzer::PromptAnalysis;

/// Input for one enhancement call. Built right before the call and
/// dropped afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementRequest
{   /// Sanitized prompt
    pub original_prompt: String
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<PromptAnalysis>
  , /// Sanitized free-text context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_context: Option<String>
}

impl EnhancementRequest
{   pub fn new(original_prompt: impl Into<String>) -> Self
    {   EnhancementRequest
        {   original_prompt: original_prompt.into()
          , analysis: None
          , user_context: None
        }
    }

    pub fn with_analysis(mut self, analysis: PromptAnalysis) -> Self
    {   self.analysis = Some(analysis);
        self
    }

    /// Empty context is treated as absent
    pub fn with_context(mut self, context: impl Into<String>) -> Self
    {   let context = context.into();
        self.user_context = (!context.is_empty()).then_some(context);
        self
    }
}

/// Improved prompt as returned to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementResponse
{   pub enhanced_prompt: String
  , pub improvements: Vec<String>
  , pub reasoning: String
  , /// Epoch-millis
    pub timestamp: i64
}

/// One streamed fragment. The final chunk of a call has empty text
/// and `is_complete` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk
{   pub text: String
  , pub is_complete: bool
}

impl StreamChunk
{   pub fn fragment(text: impl Into<String>) -> Self
    {   StreamChunk
        {   text: text.into()
          , is_complete: false
        }
    }

    pub fn complete() -> Self
    {   StreamChunk
        {   text: String::new()
          , is_complete: true
        }
    }
}
