//! Heuristic prompt-quality scoring.
//!
//! `analyze` is pure: no I/O, no clock, no randomness. The same
//! prompt always yields the same `PromptAnalysis`.

use serde::{Deserialize, Serialize};

const MIN_LENGTH: usize = 10;
const VAGUE_LENGTH: usize = 30;
const SHORT_LENGTH: usize = 50;
const SUGGESTION_THRESHOLD: f64 = 6.0;

const CLARITY_INDICATORS: [&str; 5]
  = ["specific", "exactly", "precisely", "clearly", "detailed"];
const AMBIGUOUS_TERMS: [&str; 5]
  = ["thing", "stuff", "something", "somehow", "maybe"];
const TECHNICAL_TERMS: [&str; 6]
  = ["api", "database", "frontend", "backend", "react", "typescript"];
const ESSENTIAL_KEYWORDS: [&str; 5]
  = ["context", "goal", "constraint", "format", "audience"];

/// Generic low-information prompt templates
pub const VAGUE_INDICATORS: [&str; 15] = [
  "create a landing page"
, "make something"
, "build an app"
, "build a website"
, "make a website"
, "create a website"
, "make an app"
, "create an app"
, "write some code"
, "do something"
, "make it better"
, "make it look good"
, "improve this"
, "fix this"
, "help me with"
];

/// (keywords, label) pairs; the label is reported when no keyword
/// of the pair occurs
const ELEMENT_CHECKS: [(&[&str], &str); 4] = [
  (&["context", "background"], "Context information")
, (&["constraint", "requirement"], "Specific requirements")
, (&["format", "output"], "Output format")
, (&["audience", "user"], "Target audience")
];

/// Scores and findings for one prompt. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAnalysis
{   pub clarity: f64
  , pub specificity: f64
  , pub structure: f64
  , pub completeness: f64
  , pub is_vague: bool
  , pub missing_elements: Vec<String>
  , pub suggestions: Vec<String>
  , /// Mean of the four sub-scores, one decimal
    pub overall_score: f64
}

impl PromptAnalysis
{   /// Result for absent or too-short input
    pub fn empty() -> Self
    {   PromptAnalysis
        {   clarity: 1.0
          , specificity: 1.0
          , structure: 1.0
          , completeness: 1.0
          , is_vague: true
          , missing_elements: vec![
              "Content".to_string()
            , "Context".to_string()
            , "Requirements".to_string()
            ]
          , suggestions: vec![
              "Please enter a prompt to analyze".to_string()
            ]
          , overall_score: 1.0
        }
    }

    /// High overall score and not flagged as vague
    pub fn is_well_formed(&self) -> bool
    {   self.overall_score >= 8.0 && !self.is_vague
    }

    pub fn band(&self) -> ScoreBand
    {   score_band(self.overall_score)
    }
}

/// Coarse rating used for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBand
{   Good
  , Fair
  , Poor
}

pub fn score_band(score: f64) -> ScoreBand
{   if score >= 8.0
    {   ScoreBand::Good
    } else if score >= 6.0
    {   ScoreBand::Fair
    } else
    {   ScoreBand::Poor
    }
}

/// Score a (sanitized) prompt
pub fn analyze(prompt: &str) -> PromptAnalysis
{   let raw_length = prompt.chars().count();
    if raw_length < MIN_LENGTH
    {   return PromptAnalysis::empty();
    }

    let normalized = prompt.to_lowercase();
    let normalized = normalized.trim();

    let clarity = clarity_score(normalized);
    let specificity = specificity_score(normalized);
    let structure = structure_score(normalized);
    let completeness = completeness_score(normalized);

    let is_vague = VAGUE_INDICATORS
      .iter()
      .any(|phrase| normalized.contains(phrase))
      || raw_length < VAGUE_LENGTH;

    let missing_elements = ELEMENT_CHECKS
      .iter()
      .filter(|(keywords, _)| {
        !keywords.iter().any(|k| normalized.contains(k))
      })
      .map(|(_, label)| label.to_string())
      .collect();

    let mut suggestions = Vec::new();
    let tips = [
      (clarity, "Use more specific and precise language")
    , (specificity, "Add technical details and specific requirements")
    , (structure, "Organize your prompt with clear sections")
    , (completeness, "Add context and define requirements clearly")
    ];
    for (score, tip) in tips
    {   if score < SUGGESTION_THRESHOLD
        {   suggestions.push(tip.to_string());
        }
    }
    if raw_length < SHORT_LENGTH
    {   suggestions.push("Expand your prompt with more details".to_string());
    }

    let mean = (clarity + specificity + structure + completeness) / 4.0;

    PromptAnalysis
    {   clarity
      , specificity
      , structure
      , completeness
      , is_vague
      , missing_elements
      , suggestions
      , overall_score: (mean * 10.0).round() / 10.0
    }
}

fn clamp_score(score: f64) -> f64
{   score.clamp(1.0, 10.0)
}

fn clarity_score(prompt: &str) -> f64
{   let mut score = 5.0;
    for indicator in CLARITY_INDICATORS
    {   if prompt.contains(indicator)
        {   score += 0.5;
        }
    }
    for term in AMBIGUOUS_TERMS
    {   if prompt.contains(term)
        {   score -= 1.0;
        }
    }
    if prompt.chars().count() < SHORT_LENGTH
    {   score -= 1.0;
    }
    clamp_score(score)
}

fn specificity_score(prompt: &str) -> f64
{   let mut score = 5.0;
    for term in TECHNICAL_TERMS
    {   if prompt.contains(term)
        {   score += 0.5;
        }
    }
    if prompt.chars().any(|c| c.is_ascii_digit())
    {   score += 1.0;
    }
    clamp_score(score)
}

fn structure_score(prompt: &str) -> f64
{   let mut score = 5.0;
    if prompt.contains('\n')
    {   score += 1.0;
    }
    if prompt.contains("1.") || prompt.contains('-')
    {   score += 1.0;
    }
    let sentences = prompt
      .split(['.', '!', '?'])
      .filter(|s| !s.trim().is_empty())
      .count();
    if sentences > 1
    {   score += 0.5;
    }
    clamp_score(score)
}

fn completeness_score(prompt: &str) -> f64
{   let mut score = 3.0;
    // Added one keyword at a time so rounding matches the
    // accumulated sum the overall score expects.
    for keyword in ESSENTIAL_KEYWORDS
    {   if prompt.contains(keyword)
        {   score += 1.4;
        }
    }
    clamp_score(score)
}
