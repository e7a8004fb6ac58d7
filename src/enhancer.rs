//! Enhancement orchestration: builds the instruction sent to the
//! generation endpoint, reads the reply (whole or streamed) and turns
//! it into an `EnhancementResponse`.
//!
//! A malformed reply is never an error. It is replaced by a fixed
//! template built around the original prompt, so callers only see
//! errors for credential and transport problems.

use std::sync::Arc;
use serde_json::Value;
use tokio::sync::mpsc;
use log::{debug, trace, warn, error};
use crate::analyzer::PromptAnalysis;
use crate::config::ProviderConfig;
use crate::error::{Error, ErrorCode, PromptError};
use crate::providers::{Connector, GeminiConnector, GenerationBackend};
use crate::request::{EnhancementRequest, EnhancementResponse, StreamChunk};

pub const SYSTEM_PROMPT: &str = r#"You are a prompt optimization expert. Rewrite the user's prompt into a complete, detailed prompt that another AI model can act on without asking the user any follow-up questions.

Rules:
1. When the prompt names a known application, website or tool, use what you know about it to fill in features, behaviour and technical details.
2. Never leave placeholders such as "[Please specify...]". Every detail must be concrete.
3. Keep the user's intent; add context, requirements, constraints and the expected output format.

Structure of the enhanced prompt:
- One context paragraph describing purpose and scope.
- Bullet points grouped under: Core Features, User Interface and Design, Technical Requirements, User Experience, Performance.

Respond with a JSON object in exactly this format:
{
  "enhancedPrompt": "the complete enhanced prompt",
  "improvements": ["each specific improvement made"],
  "reasoning": "short explanation of the changes"
}"#;

const TEST_INSTRUCTION: &str = r#"Test connection. Respond with "OK"."#;

pub const FALLBACK_IMPROVEMENTS: [&str; 1]
  = ["Added basic structure and formatting"];
pub const FALLBACK_REASONING: &str
  = "The AI response could not be parsed, so the original prompt was \
     placed into a standard prompt structure.";

/// Full instruction text for one request
pub fn build_instruction(request: &EnhancementRequest) -> String
{   let mut instruction = format!("{}\n\n", SYSTEM_PROMPT);
    instruction.push_str(&format!(
      "ORIGINAL PROMPT:\n\"{}\"\n\n"
    , request.original_prompt
    ));

    if let Some(analysis) = &request.analysis
    {   instruction.push_str(&analysis_block(analysis));
    }

    if let Some(context) = request.user_context
      .as_deref()
      .filter(|c| !c.is_empty())
    {   instruction.push_str(&format!(
          "ADDITIONAL CONTEXT:\n{}\n\n"
        , context
        ));
    }

    instruction.push_str(
      "Please enhance this prompt and respond with the JSON format \
       specified above."
    );
    instruction
}

fn analysis_block(analysis: &PromptAnalysis) -> String
{   let mut block = String::from("PROMPT ANALYSIS:\n");
    block.push_str(&format!(
      "- Overall score: {}/10\n"
    , analysis.overall_score
    ));
    block.push_str(&format!(
      "- Clarity: {}/10, Specificity: {}/10, Structure: {}/10, \
       Completeness: {}/10\n"
    , analysis.clarity
    , analysis.specificity
    , analysis.structure
    , analysis.completeness
    ));
    block.push_str(&format!(
      "- Vague: {}\n"
    , if analysis.is_vague { "yes" } else { "no" }
    ));
    if !analysis.missing_elements.is_empty()
    {   block.push_str(&format!(
          "- Missing elements: {}\n"
        , analysis.missing_elements.join(", ")
        ));
    }
    if !analysis.suggestions.is_empty()
    {   block.push_str(&format!(
          "- Suggestions: {}\n"
        , analysis.suggestions.join("; ")
        ));
    }
    block.push('\n');
    block
}

/// Span from the first `{` to the last `}`, if there is one.
///
/// Kept as the single extraction point so a stricter strategy can
/// replace it without touching callers.
pub fn extract_json_block(text: &str) -> Option<&str>
{   let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Outcome of reading a provider reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedReply
{   Ok
    {   enhanced_prompt: String
      , improvements: Vec<String>
      , reasoning: String
    }
  , Fallback
}

fn non_empty_str(value: Option<&Value>) -> Option<String>
{   value
      .and_then(Value::as_str)
      .filter(|s| !s.is_empty())
      .map(str::to_string)
}

fn improvements_of(value: Option<&Value>) -> Option<Vec<String>>
{   match value?
    {   Value::Array(items) => Some(
          items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect()
        )
      , Value::String(s) if !s.is_empty() => Some(vec![s.clone()])
      , Value::Number(n) => Some(vec![n.to_string()])
      , Value::Bool(true) => Some(vec!["true".to_string()])
      , _ => None
    }
}

/// Read a provider reply. Any missing piece yields `Fallback`.
pub fn parse_reply(text: &str) -> ParsedReply
{   trace!("Raw AI response: {}", text);

    let Some(block) = extract_json_block(text) else
    {   warn!("No JSON found in AI response, using fallback");
        return ParsedReply::Fallback;
    };

    let parsed: Value = match serde_json::from_str(block)
    {   Ok(value) => value
      , Err(e) => {
          warn!("Failed to decode AI response, using fallback: {}", e);
          return ParsedReply::Fallback;
        }
    };

    let enhanced_prompt = non_empty_str(parsed.get("enhancedPrompt"));
    let improvements = improvements_of(parsed.get("improvements"));
    let reasoning = non_empty_str(parsed.get("reasoning"));

    match (enhanced_prompt, improvements, reasoning)
    {   (Some(enhanced_prompt), Some(improvements), Some(reasoning)) => {
          ParsedReply::Ok
          {   enhanced_prompt
            , improvements
            , reasoning
          }
        }
      , _ => {
          warn!("Invalid response structure, using fallback");
          ParsedReply::Fallback
        }
    }
}

impl ParsedReply
{   pub fn into_response(
      self
    , original_prompt: &str
    , timestamp: i64
    ) -> EnhancementResponse
    {   match self
        {   ParsedReply::Ok { enhanced_prompt, improvements, reasoning } => {
              EnhancementResponse
              {   enhanced_prompt
                , improvements
                , reasoning
                , timestamp
              }
            }
          , ParsedReply::Fallback => fallback_response(original_prompt, timestamp)
        }
    }
}

/// Templated document embedding the original prompt
pub fn fallback_enhancement(original_prompt: &str) -> String
{   format!(
      "# Enhanced Prompt\n\n\
       ## Context\n\
       {}\n\n\
       ## Objective\n\
       State clearly what this request should achieve and what a \
       successful result looks like.\n\n\
       ## Requirements\n\
       - Describe the expected outcome in concrete terms\n\
       - List any constraints or limitations\n\
       - Specify the level of detail needed\n\n\
       ## Output Format\n\
       Describe the format of the response (list, paragraphs, code, \
       table).\n\n\
       ## Additional Notes\n\
       Add background information, examples or preferences that help \
       produce a better result.\n"
    , original_prompt
    )
}

pub fn fallback_response(
  original_prompt: &str
, timestamp: i64
) -> EnhancementResponse
{   EnhancementResponse
    {   enhanced_prompt: fallback_enhancement(original_prompt)
      , improvements: FALLBACK_IMPROVEMENTS
          .iter()
          .map(|s| s.to_string())
          .collect()
      , reasoning: FALLBACK_REASONING.to_string()
      , timestamp
    }
}

fn classify_logged(error: &Error) -> PromptError
{   let classified = PromptError::classify(error);
    error!("AI enhancement error: {} ({})", error, classified.code);
    classified
}

/// Non-streaming enhancement against an already bound backend
pub async fn run_enhancement(
  backend: Arc<dyn GenerationBackend>
, request: EnhancementRequest
) -> Result<EnhancementResponse, PromptError>
{   let instruction = build_instruction(&request);
    debug!("Enhancing prompt ({} chars)", request.original_prompt.len());

    let reply = backend
      .generate(instruction)
      .await
      .map_err(|e| classify_logged(&e))?;

    Ok(parse_reply(&reply)
      .into_response(&request.original_prompt, crate::now_ms()))
}

/// Streaming enhancement. Every non-empty fragment is forwarded in
/// arrival order, then one completion chunk, then the accumulated
/// text is parsed. A dropped receiver does not stop the call.
pub async fn run_streaming_enhancement(
  backend: Arc<dyn GenerationBackend>
, request: EnhancementRequest
, chunk_tx: mpsc::UnboundedSender<StreamChunk>
) -> Result<EnhancementResponse, PromptError>
{   let instruction = build_instruction(&request);
    debug!(
      "Enhancing prompt with streaming ({} chars)"
    , request.original_prompt.len()
    );

    let mut fragments = backend
      .generate_stream(instruction)
      .await
      .map_err(|e| classify_logged(&e))?;

    let mut full_response = String::new();
    while let Some(item) = fragments.recv().await
    {   let fragment = item.map_err(|e| classify_logged(&e))?;
        if fragment.is_empty()
        {   continue;
        }
        full_response.push_str(&fragment);
        if chunk_tx.send(StreamChunk::fragment(fragment)).is_err()
        {   trace!("Chunk receiver dropped, still accumulating");
        }
    }

    let _ = chunk_tx.send(StreamChunk::complete());

    Ok(parse_reply(&full_response)
      .into_response(&request.original_prompt, crate::now_ms()))
}

/// Holder of the single live credential
pub struct PromptEnhancer
{   connector: Arc<dyn Connector>
  , backend: Option<Arc<dyn GenerationBackend>>
}

impl PromptEnhancer
{   pub fn new(connector: Arc<dyn Connector>) -> Self
    {   PromptEnhancer
        {   connector
          , backend: None
        }
    }

    pub fn gemini(config: ProviderConfig) -> Self
    {   PromptEnhancer::new(Arc::new(GeminiConnector::new(config)))
    }

    /// Bind a credential, replacing any previous one
    pub fn initialize(&mut self, api_key: &str) -> Result<(), PromptError>
    {   if api_key.trim().is_empty()
        {   return Err(PromptError::validation("API key is required"));
        }
        debug!("Initializing AI service");
        let backend = self.connector
          .connect(api_key)
          .map_err(|e| classify_logged(&e))?;
        self.backend = Some(backend);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool
    {   self.backend.is_some()
    }

    /// Current backend, or API_ERROR when no credential was bound
    pub fn backend(&self)
      -> Result<Arc<dyn GenerationBackend>, PromptError>
    {   self.backend.clone().ok_or_else(|| {
          PromptError::new(
            ErrorCode::ApiError
          , "AI service not initialized"
          )
        })
    }

    pub async fn enhance(&self, request: EnhancementRequest)
      -> Result<EnhancementResponse, PromptError>
    {   run_enhancement(self.backend()?, request).await
    }

    pub async fn enhance_with_streaming(
      &self
    , request: EnhancementRequest
    , chunk_tx: mpsc::UnboundedSender<StreamChunk>
    ) -> Result<EnhancementResponse, PromptError>
    {   run_streaming_enhancement(self.backend()?, request, chunk_tx).await
    }

    /// Streaming with a plain callback: `on_chunk(text, false)` per
    /// fragment, then `on_chunk("", true)` once
    pub async fn enhance_with_callback<F>(
      &self
    , request: EnhancementRequest
    , mut on_chunk: F
    ) -> Result<EnhancementResponse, PromptError>
    where
      F: FnMut(&str, bool)
    {   let backend = self.backend()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let work = run_streaming_enhancement(backend, request, tx);
        let drain = async {
          while let Some(chunk) = rx.recv().await
          {   on_chunk(&chunk.text, chunk.is_complete);
          }
        };
        let (result, ()) = tokio::join!(work, drain);
        result
    }

    /// Bind `api_key` and ask for a trivial reply. Any failure is
    /// reported as `false`.
    pub async fn test_connection(&mut self, api_key: &str) -> bool
    {   if let Err(e) = self.initialize(api_key)
        {   error!("API connection test failed: {}", e);
            return false;
        }
        match self.backend()
        {   Ok(backend) => check_connection(backend).await
          , Err(_) => false
        }
    }
}

/// Ask the backend for a trivial reply; true iff it contains "ok"
pub async fn check_connection(backend: Arc<dyn GenerationBackend>) -> bool
{   match backend.generate(TEST_INSTRUCTION.to_string()).await
    {   Ok(reply) => reply.to_lowercase().contains("ok")
      , Err(e) => {
          error!("API connection test failed: {}", e);
          false
        }
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::providers::FragmentReceiver;

    struct ScriptedBackend
    {   reply: Result<String, Error>
      , fragments: Vec<Result<String, Error>>
      , seen: Mutex<Vec<String>>
    }

    impl ScriptedBackend
    {   fn replying(reply: &str) -> Arc<Self>
        {   Arc::new(ScriptedBackend
            {   reply: Ok(reply.to_string())
              , fragments: vec![]
              , seen: Mutex::new(vec![])
            })
        }

        fn streaming(fragments: Vec<Result<String, Error>>) -> Arc<Self>
        {   Arc::new(ScriptedBackend
            {   reply: Ok(String::new())
              , fragments
              , seen: Mutex::new(vec![])
            })
        }

        fn failing(error: Error) -> Arc<Self>
        {   Arc::new(ScriptedBackend
            {   reply: Err(error)
              , fragments: vec![]
              , seen: Mutex::new(vec![])
            })
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend
    {   async fn generate(&self, instruction: String)
          -> Result<String, Error>
        {   self.seen.lock().expect("lock").push(instruction);
            self.reply.clone()
        }

        async fn generate_stream(&self, instruction: String)
          -> Result<FragmentReceiver, Error>
        {   self.seen.lock().expect("lock").push(instruction);
            let (tx, rx) = mpsc::unbounded_channel();
            for fragment in self.fragments.clone()
            {   let _ = tx.send(fragment);
            }
            Ok(rx)
        }
    }

    const GOOD_REPLY: &str = r#"prefix {"enhancedPrompt":"X","improvements":["a"],"reasoning":"r"} suffix"#;

    #[test]
    fn test_extract_json_block()
    {   assert_eq!(extract_json_block("a {b} c {d} e"), Some("{b} c {d}"));
        assert_eq!(extract_json_block("no braces"), None);
        assert_eq!(extract_json_block("} backwards {"), None);
    }

    #[test]
    fn test_parse_reply_ok()
    {   assert_eq!(
          parse_reply(GOOD_REPLY)
        , ParsedReply::Ok
          {   enhanced_prompt: "X".to_string()
            , improvements: vec!["a".to_string()]
            , reasoning: "r".to_string()
          }
        );
    }

    #[test]
    fn test_parse_reply_wraps_scalar_improvements()
    {   let parsed = parse_reply(
          r#"{"enhancedPrompt":"X","improvements":"one","reasoning":"r"}"#
        );
        assert!(matches!(
          parsed
        , ParsedReply::Ok { ref improvements, .. }
            if improvements == &vec!["one".to_string()]
        ));
    }

    #[test]
    fn test_parse_reply_fallbacks()
    {   for text in [
          "no json here"
        , r#"{"enhancedPrompt":"X","improvements":["a"]}"#
        , r#"{"enhancedPrompt":"","improvements":["a"],"reasoning":"r"}"#
        , r#"{"enhancedPrompt":"X","improvements":null,"reasoning":"r"}"#
        , "{ not json }"
        ]
        {   assert_eq!(parse_reply(text), ParsedReply::Fallback, "{}", text);
        }
    }

    #[test]
    fn test_fallback_embeds_prompt_verbatim()
    {   let response = ParsedReply::Fallback
          .into_response("make a todo app", 42);
        assert_eq!(response, fallback_response("make a todo app", 42));
        assert!(response.enhanced_prompt
          .contains("## Context\nmake a todo app\n"));
        for header in ["## Objective", "## Requirements", "## Output Format", "## Additional Notes"]
        {   assert!(response.enhanced_prompt.contains(header));
        }
        assert_eq!(
          response.improvements
        , vec!["Added basic structure and formatting"]
        );
    }

    #[test]
    fn test_build_instruction_blocks()
    {   let bare = build_instruction(&EnhancementRequest::new("do it"));
        assert!(bare.starts_with(SYSTEM_PROMPT));
        assert!(bare.contains("ORIGINAL PROMPT:\n\"do it\"\n"));
        assert!(!bare.contains("PROMPT ANALYSIS:"));
        assert!(!bare.contains("ADDITIONAL CONTEXT:"));

        let full = build_instruction(
          &EnhancementRequest::new("do it")
            .with_analysis(PromptAnalysis::empty())
            .with_context("for kids")
        );
        assert!(full.contains("PROMPT ANALYSIS:\n- Overall score: 1/10\n"));
        assert!(full.contains("- Missing elements: Content, Context, Requirements\n"));
        assert!(full.contains("ADDITIONAL CONTEXT:\nfor kids\n"));
        assert!(full.ends_with("specified above."));
    }

    #[tokio::test]
    async fn test_enhance_requires_initialization()
    {   let enhancer = PromptEnhancer::gemini(ProviderConfig::default());
        let err = enhancer
          .enhance(EnhancementRequest::new("hello world prompt"))
          .await
          .expect_err("not initialized");
        assert_eq!(err.code, ErrorCode::ApiError);
        assert_eq!(err.message, "AI service not initialized");
    }

    #[tokio::test]
    async fn test_run_enhancement_parses_reply()
    {   let backend = ScriptedBackend::replying(GOOD_REPLY);
        let response = run_enhancement(
          backend.clone()
        , EnhancementRequest::new("original")
        ).await.expect("response");
        assert_eq!(response.enhanced_prompt, "X");
        assert!(response.timestamp > 0);
        assert!(backend.seen.lock().expect("lock")[0]
          .contains("\"original\""));
    }

    #[tokio::test]
    async fn test_run_enhancement_classifies_errors()
    {   let err = run_enhancement(
          ScriptedBackend::failing(Error::RateLimitExceeded)
        , EnhancementRequest::new("original")
        ).await.expect_err("rate limited");
        assert_eq!(err.code, ErrorCode::RateLimit);
    }

    #[tokio::test]
    async fn test_streaming_chunk_order()
    {   let backend = ScriptedBackend::streaming(vec![
          Ok("Hel".to_string())
        , Ok(String::new())
        , Ok("lo".to_string())
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let response = run_streaming_enhancement(
          backend
        , EnhancementRequest::new("greet")
        , tx
        ).await.expect("response");

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await
        {   chunks.push((chunk.text, chunk.is_complete));
        }
        assert_eq!(
          chunks
        , vec![
            ("Hel".to_string(), false)
          , ("lo".to_string(), false)
          , (String::new(), true)
          ]
        );
        // "Hello" has no JSON, so it falls back around the prompt
        assert_eq!(response.enhanced_prompt, fallback_enhancement("greet"));
    }

    struct FixedConnector(Arc<ScriptedBackend>);

    impl Connector for FixedConnector
    {   fn connect(&self, _api_key: &str)
          -> Result<Arc<dyn GenerationBackend>, Error>
        {   Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_enhance_with_callback()
    {   let backend = ScriptedBackend::streaming(vec![
          Ok("a".to_string())
        , Ok("b".to_string())
        ]);
        let mut enhancer = PromptEnhancer::new(Arc::new(FixedConnector(backend)));
        enhancer.initialize("key").expect("initialize");
        assert!(enhancer.is_initialized());

        let mut seen = Vec::new();
        enhancer.enhance_with_callback(
          EnhancementRequest::new("letters")
        , |text, done| seen.push((text.to_string(), done))
        ).await.expect("response");
        assert_eq!(
          seen
        , vec![
            ("a".to_string(), false)
          , ("b".to_string(), false)
          , (String::new(), true)
          ]
        );
    }

    #[tokio::test]
    async fn test_connection_check()
    {   let mut enhancer = PromptEnhancer::new(Arc::new(FixedConnector(
          ScriptedBackend::replying("Ok.")
        )));
        assert!(!enhancer.test_connection("").await);
        assert!(enhancer.test_connection("key").await);
        assert!(!check_connection(ScriptedBackend::replying("no")).await);
        assert!(!check_connection(
          ScriptedBackend::failing(Error::Timeout)
        ).await);
    }

    #[tokio::test]
    async fn test_streaming_mid_stream_error()
    {   let backend = ScriptedBackend::streaming(vec![
          Ok("partial".to_string())
        , Err(Error::HttpError("connection reset".to_string()))
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = run_streaming_enhancement(
          backend
        , EnhancementRequest::new("greet")
        , tx
        ).await.expect_err("network");
        assert_eq!(err.code, ErrorCode::NetworkError);

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await
        {   chunks.push(chunk);
        }
        assert_eq!(chunks, vec![StreamChunk::fragment("partial")]);
    }
}
