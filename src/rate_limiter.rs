//! Sliding-window rate limiting keyed by client identifier

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use log::{debug, trace};
use crate::config::RateLimitConfig;
use crate::now_ms;

/// Recorded request times for one identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState
{   /// Epoch-millis, oldest first
    pub requests: Vec<i64>
  , pub is_limited: bool
}

/// Snapshot returned by [`RateLimiter::get_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus
{   pub is_limited: bool
  , pub requests_remaining: usize
  , /// Epoch-millis at which a slot frees up
    pub reset_time: i64
}

impl RateLimitStatus
{   pub fn time_until_reset(&self, now_ms: i64) -> i64
    {   (self.reset_time - now_ms).max(0)
    }

    /// "Available now", "N second(s)" or "N minute(s)", rounded up
    pub fn format_time_until_reset(&self, now_ms: i64) -> String
    {   let remaining = self.time_until_reset(now_ms);
        if remaining == 0
        {   return "Available now".to_string();
        }

        let seconds = (remaining + 999) / 1000;
        if seconds < 60
        {   return format!(
              "{} second{}"
            , seconds
            , if seconds != 1 { "s" } else { "" }
            );
        }

        let minutes = (seconds + 59) / 60;
        format!(
          "{} minute{}"
        , minutes
        , if minutes != 1 { "s" } else { "" }
        )
    }
}

/// Identifier table. Entries are created on first use and never
/// evicted; only their timestamps age out. Not synchronised: the
/// owner (the enhancement service task) serialises access.
#[derive(Debug, Default)]
pub struct RateLimiter
{   instances: HashMap<String, RateLimitState>
}

impl RateLimiter
{   pub fn new() -> Self
    {   RateLimiter::default()
    }

    /// Consume a slot for `identifier` if one is free
    pub fn is_allowed(
      &mut self
    , identifier: &str
    , config: &RateLimitConfig
    ) -> bool
    {   self.is_allowed_at(identifier, config, now_ms())
    }

    pub fn is_allowed_at(
      &mut self
    , identifier: &str
    , config: &RateLimitConfig
    , now: i64
    ) -> bool
    {   let window_start = now - config.window_ms;
        let state = self.instances
          .entry(identifier.to_string())
          .or_default();
        state.requests.retain(|&t| t > window_start);

        let allowed = state.requests.len() < config.max_requests;
        if allowed
        {   state.requests.push(now);
            state.is_limited = false;
        } else
        {   state.is_limited = true;
        }

        trace!(
          "rate limit {}: {} of {} used, allowed={}"
        , identifier
        , state.requests.len()
        , config.max_requests
        , allowed
        );
        if !allowed
        {   debug!("Rate limited: {}", identifier);
        }
        allowed
    }

    /// Remaining budget; prunes expired timestamps but never
    /// consumes a slot
    pub fn get_status(
      &mut self
    , identifier: &str
    , config: &RateLimitConfig
    ) -> RateLimitStatus
    {   self.get_status_at(identifier, config, now_ms())
    }

    pub fn get_status_at(
      &mut self
    , identifier: &str
    , config: &RateLimitConfig
    , now: i64
    ) -> RateLimitStatus
    {   let Some(state) = self.instances.get_mut(identifier) else
        {   return RateLimitStatus
            {   is_limited: false
              , requests_remaining: config.max_requests
              , reset_time: now + config.window_ms
            };
        };

        let window_start = now - config.window_ms;
        state.requests.retain(|&t| t > window_start);

        let reset_time = state.requests
          .first()
          .map(|oldest| oldest + config.window_ms)
          .unwrap_or(now + config.window_ms);

        RateLimitStatus
        {   is_limited: state.is_limited
          , requests_remaining: config.max_requests
              .saturating_sub(state.requests.len())
          , reset_time
        }
    }

    #[cfg(test)]
    fn tracked_identifiers(&self) -> usize
    {   self.instances.len()
    }
}

/// Environment signals fed into the client fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSignals
{   /// Agent string, e.g. "promance/0.1.0 (linux; x86_64)"
    pub agent: String
  , /// Display geometry, e.g. "120x40"
    pub display: String
}

impl EnvironmentSignals
{   pub fn from_env() -> Self
    {   let agent = format!(
          "{}/{} ({}; {})"
        , env!("CARGO_PKG_NAME")
        , env!("CARGO_PKG_VERSION")
        , std::env::consts::OS
        , std::env::consts::ARCH
        );
        let display = match (
          std::env::var("COLUMNS")
        , std::env::var("LINES")
        )
        {   (Ok(cols), Ok(lines)) => format!("{}x{}", cols, lines)
          , _ => "unknown".to_string()
        };
        EnvironmentSignals { agent, display }
    }
}

/// Stable fingerprint: 32-bit `hash * 31 + unit` over the UTF-16
/// units of `"{agent}-{display}"`
pub fn create_browser_identifier(signals: &EnvironmentSignals) -> String
{   let fingerprint = format!("{}-{}", signals.agent, signals.display);
    let mut hash: i32 = 0;
    for unit in fingerprint.encode_utf16()
    {   hash = hash
          .wrapping_shl(5)
          .wrapping_sub(hash)
          .wrapping_add(unit as i32);
    }
    format!("browser-{}", (hash as i64).abs())
}
