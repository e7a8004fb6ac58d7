//! Configuration for the generation provider, rate limiting and
//! the interactive session

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use log::debug;

pub const DEFAULT_API_BASE: &str
  = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Generation provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig
{   /// API base URL
    pub api_base: String
  , /// Model name
    pub model: String
  , /// Seconds allowed per unary call. Streams get this long to
    /// connect and between reads.
    pub timeout_secs: u64
  , /// Sampling temperature, provider default when unset
    pub temperature: Option<f32>
  , /// Cap on generated tokens, provider default when unset
    pub max_output_tokens: Option<u32>
}

impl Default for ProviderConfig
{   fn default() -> Self
    {   ProviderConfig
        {   api_base: DEFAULT_API_BASE.to_string()
          , model: DEFAULT_MODEL.to_string()
          , timeout_secs: 60
          , temperature: None
          , max_output_tokens: None
        }
    }
}

/// Sliding-window limits applied per client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig
{   /// Requests allowed inside one window
    pub max_requests: usize
  , /// Window length in milliseconds
    pub window_ms: i64
}

impl Default for RateLimitConfig
{   fn default() -> Self
    {   RateLimitConfig
        {   max_requests: 10
          , window_ms: 60_000
        }
    }
}

/// Debounce delays for keystroke-driven work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig
{   /// Delay before analysing an edited prompt
    pub analysis_debounce_ms: u64
  , /// Delay before committing a typed API key
    pub api_key_debounce_ms: u64
}

impl Default for SessionConfig
{   fn default() -> Self
    {   SessionConfig
        {   analysis_debounce_ms: 300
          , api_key_debounce_ms: 500
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromanceConfig
{   pub provider: ProviderConfig
  , pub rate_limit: RateLimitConfig
  , pub session: SessionConfig
  , /// Directory holding the persisted state blob
    pub storage_dir: Option<PathBuf>
}

impl Default for PromanceConfig
{   fn default() -> Self
    {   PromanceConfig
        {   provider: ProviderConfig::default()
          , rate_limit: RateLimitConfig::default()
          , session: SessionConfig::default()
          , storage_dir: None
        }
    }
}

impl PromanceConfig
{   /// Load a JSON config file; absent fields keep their defaults
    pub fn load(path: &Path)
      -> Result<Self, crate::error::Error>
    {   debug!("Loading config from {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|e| {
          crate::error::Error::InvalidConfiguration(
            format!("{}: {}", path.display(), e)
          )
        })?;
        let config: PromanceConfig = serde_json::from_str(&raw)
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(e.to_string())
          })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with PROMANCE_* environment variables
    pub fn from_env() -> Result<Self, crate::error::Error>
    {   let mut config = PromanceConfig::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F)
      -> Result<(), crate::error::Error>
    where
      F: Fn(&str) -> Option<String>
    {   if let Some(base) = lookup("PROMANCE_API_BASE")
        {   self.provider.api_base = base;
        }
        if let Some(model) = lookup("PROMANCE_MODEL")
        {   self.provider.model = model;
        }
        if let Some(secs) = lookup("PROMANCE_TIMEOUT_SECS")
        {   self.provider.timeout_secs = secs.trim().parse()
              .map_err(|_| {
                crate::error::Error::InvalidConfiguration(
                  format!("PROMANCE_TIMEOUT_SECS: {}", secs)
                )
              })?;
        }
        if let Some(dir) = lookup("PROMANCE_STORAGE_DIR")
        {   self.storage_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), crate::error::Error>
    {   if self.provider.api_base.trim().is_empty()
        {   return Err(crate::error::Error::InvalidConfiguration(
              "api_base must not be empty".to_string()
            ));
        }
        if self.provider.model.trim().is_empty()
        {   return Err(crate::error::Error::InvalidConfiguration(
              "model must not be empty".to_string()
            ));
        }
        self.rate_limit.validate()
    }
}

impl RateLimitConfig
{   pub fn validate(&self) -> Result<(), crate::error::Error>
    {   if self.max_requests == 0 || self.window_ms <= 0
        {   return Err(crate::error::Error::InvalidConfiguration(
              format!(
                "rate limit needs max_requests > 0 and window_ms > 0, \
                 got {} / {}"
              , self.max_requests
              , self.window_ms
              )
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults()
    {   let config = PromanceConfig::default();
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.session.analysis_debounce_ms, 300);
        assert_eq!(config.provider.model, DEFAULT_MODEL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay()
    {   let vars: HashMap<&str, &str> = [
          ("PROMANCE_MODEL", "gemini-1.5-pro")
        , ("PROMANCE_TIMEOUT_SECS", "5")
        , ("PROMANCE_STORAGE_DIR", "/tmp/promance")
        ].into_iter().collect();

        let mut config = PromanceConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()))
          .expect("overlay");
        assert_eq!(config.provider.model, "gemini-1.5-pro");
        assert_eq!(config.provider.timeout_secs, 5);
        assert_eq!(
          config.storage_dir
        , Some(PathBuf::from("/tmp/promance"))
        );
        assert_eq!(config.provider.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn test_env_overlay_rejects_bad_timeout()
    {   let mut config = PromanceConfig::default();
        let result = config.apply_env(|k| {
          (k == "PROMANCE_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(
          result
        , Err(crate::error::Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_partial_json_keeps_defaults()
    {   let config: PromanceConfig = serde_json::from_str(
          r#"{ "rate_limit": { "maxRequests": 3 } }"#
        ).expect("parse");
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_invalid_rate_limit()
    {   let config = RateLimitConfig
        {   max_requests: 0
          , window_ms: 1000
        };
        assert!(config.validate().is_err());
    }
}
