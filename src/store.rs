//! Application state and its on-disk slice

use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use log::{debug, warn};
use crate::analyzer::PromptAnalysis;
use crate::error::Error;
use crate::request::EnhancementResponse;

pub const STORAGE_FILE_NAME: &str = "prompt-optimizer-storage.json";
pub const MAX_HISTORY: usize = 10;

/// Everything the interactive front end reads. Mutated only through
/// the named setters below.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppStore
{   original_prompt: String
  , analysis: Option<PromptAnalysis>
  , is_analyzing: bool
  , enhanced_prompt: String
  , is_enhancing: bool
  , is_streaming: bool
  , streamed_content: String
  , has_enhanced: bool
  , enhancement_history: Vec<EnhancementResponse>
  , current_enhancement: Option<EnhancementResponse>
  , is_modal_open: bool
  , api_key: String
  , last_error: Option<String>
}

impl AppStore
{   pub fn new() -> Self
    {   AppStore::default()
    }

    /// Fresh store seeded from a persisted slice
    pub fn from_persisted(persisted: PersistedState) -> Self
    {   let mut store = AppStore::new();
        store.restore(persisted);
        store
    }

    pub fn original_prompt(&self) -> &str { &self.original_prompt }
    pub fn analysis(&self) -> Option<&PromptAnalysis> { self.analysis.as_ref() }
    pub fn is_analyzing(&self) -> bool { self.is_analyzing }
    pub fn enhanced_prompt(&self) -> &str { &self.enhanced_prompt }
    pub fn is_enhancing(&self) -> bool { self.is_enhancing }
    pub fn is_streaming(&self) -> bool { self.is_streaming }
    pub fn streamed_content(&self) -> &str { &self.streamed_content }
    pub fn has_enhanced(&self) -> bool { self.has_enhanced }
    pub fn enhancement_history(&self) -> &[EnhancementResponse]
    {   &self.enhancement_history
    }
    pub fn current_enhancement(&self) -> Option<&EnhancementResponse>
    {   self.current_enhancement.as_ref()
    }
    pub fn is_modal_open(&self) -> bool { self.is_modal_open }
    pub fn api_key(&self) -> &str { &self.api_key }
    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }

    pub fn set_original_prompt(&mut self, prompt: impl Into<String>)
    {   self.original_prompt = prompt.into();
    }

    pub fn set_analysis(&mut self, analysis: Option<PromptAnalysis>)
    {   self.analysis = analysis;
    }

    pub fn set_is_analyzing(&mut self, value: bool)
    {   self.is_analyzing = value;
    }

    pub fn set_enhanced_prompt(&mut self, prompt: impl Into<String>)
    {   self.enhanced_prompt = prompt.into();
    }

    pub fn set_is_enhancing(&mut self, value: bool)
    {   self.is_enhancing = value;
    }

    pub fn set_is_streaming(&mut self, value: bool)
    {   self.is_streaming = value;
    }

    pub fn set_streamed_content(&mut self, content: impl Into<String>)
    {   self.streamed_content = content.into();
    }

    pub fn append_streamed_content(&mut self, fragment: &str)
    {   self.streamed_content.push_str(fragment);
    }

    pub fn set_has_enhanced(&mut self, value: bool)
    {   self.has_enhanced = value;
    }

    /// Newest first, capped at `MAX_HISTORY`. Also becomes the
    /// current enhancement.
    pub fn add_enhancement_to_history(&mut self, enhancement: EnhancementResponse)
    {   self.enhancement_history.insert(0, enhancement.clone());
        self.enhancement_history.truncate(MAX_HISTORY);
        self.current_enhancement = Some(enhancement);
    }

    pub fn set_current_enhancement(
      &mut self
    , enhancement: Option<EnhancementResponse>
    )
    {   self.current_enhancement = enhancement;
    }

    pub fn set_modal_open(&mut self, open: bool)
    {   self.is_modal_open = open;
    }

    pub fn toggle_modal(&mut self)
    {   self.is_modal_open = !self.is_modal_open;
    }

    pub fn set_api_key(&mut self, key: impl Into<String>)
    {   self.api_key = key.into();
    }

    pub fn set_last_error(&mut self, error: Option<String>)
    {   self.last_error = error;
    }

    /// Prompt, analysis and key present, and nothing in flight
    pub fn can_enhance(&self) -> bool
    {   !self.original_prompt.trim().is_empty()
          && self.analysis.is_some()
          && !self.api_key.trim().is_empty()
          && !self.is_enhancing
    }

    /// Owned copy for readers outside the lock
    pub fn snapshot(&self) -> AppStore
    {   self.clone()
    }

    /// The slice that survives restarts
    pub fn persisted(&self) -> PersistedState
    {   PersistedState
        {   enhancement_history: self.enhancement_history.clone()
          , api_key: self.api_key.clone()
          , enhanced_prompt: self.enhanced_prompt.clone()
          , current_enhancement: self.current_enhancement.clone()
        }
    }

    pub fn restore(&mut self, persisted: PersistedState)
    {   self.enhancement_history = persisted.enhancement_history;
        self.enhancement_history.truncate(MAX_HISTORY);
        self.api_key = persisted.api_key;
        self.enhanced_prompt = persisted.enhanced_prompt;
        self.current_enhancement = persisted.current_enhancement;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState
{   pub enhancement_history: Vec<EnhancementResponse>
  , pub api_key: String
  , pub enhanced_prompt: String
  , pub current_enhancement: Option<EnhancementResponse>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StorageBlob
{   state: PersistedState
  , version: u32
}

/// JSON blob holding the persisted slice
#[derive(Debug, Clone)]
pub struct StorageFile
{   path: PathBuf
}

impl StorageFile
{   /// Blob named `prompt-optimizer-storage.json` inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self
    {   StorageFile
        {   path: dir.as_ref().join(STORAGE_FILE_NAME)
        }
    }

    pub fn path(&self) -> &Path
    {   &self.path
    }

    /// Missing or unreadable blob yields defaults
    pub fn load(&self) -> PersistedState
    {   if !self.path.exists()
        {   debug!("No stored state at {}", self.path.display());
            return PersistedState::default();
        }

        match fs::read_to_string(&self.path)
          .map_err(Error::from)
          .and_then(|content| {
            serde_json::from_str::<StorageBlob>(&content).map_err(Error::from)
          })
        {   Ok(blob) => blob.state
          , Err(e) => {
              warn!("Ignoring stored state at {}: {}", self.path.display(), e);
              PersistedState::default()
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), Error>
    {   let blob = StorageBlob
        {   state: state.clone()
          , version: 0
        };
        let content = serde_json::to_string_pretty(&blob)?;
        if let Some(parent) = self.path.parent()
        {   fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, content)?;
        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    fn response(n: i64) -> EnhancementResponse
    {   EnhancementResponse
        {   enhanced_prompt: format!("prompt {}", n)
          , improvements: vec![]
          , reasoning: String::new()
          , timestamp: n
        }
    }

    #[test]
    fn test_history_newest_first_and_capped()
    {   let mut store = AppStore::new();
        for n in 0..12
        {   store.add_enhancement_to_history(response(n));
        }
        assert_eq!(store.enhancement_history().len(), MAX_HISTORY);
        assert_eq!(store.enhancement_history()[0].timestamp, 11);
        assert_eq!(store.enhancement_history()[9].timestamp, 2);
        assert_eq!(store.current_enhancement(), Some(&response(11)));
    }

    #[test]
    fn test_can_enhance()
    {   let mut store = AppStore::new();
        assert!(!store.can_enhance());
        store.set_original_prompt("write a haiku about rust");
        store.set_analysis(Some(PromptAnalysis::empty()));
        assert!(!store.can_enhance());
        store.set_api_key("k");
        assert!(store.can_enhance());
        store.set_is_enhancing(true);
        assert!(!store.can_enhance());
    }

    #[test]
    fn test_toggle_and_streamed_content()
    {   let mut store = AppStore::new();
        store.toggle_modal();
        assert!(store.is_modal_open());
        store.toggle_modal();
        assert!(!store.is_modal_open());

        store.append_streamed_content("ab");
        store.append_streamed_content("c");
        assert_eq!(store.streamed_content(), "abc");
    }

    #[test]
    fn test_storage_round_trip_and_shape()
    {   let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageFile::in_dir(dir.path().join("nested"));
        assert_eq!(storage.load(), PersistedState::default());

        let mut store = AppStore::new();
        store.set_api_key("secret");
        store.set_enhanced_prompt("better");
        store.add_enhancement_to_history(response(7));
        storage.save(&store.persisted()).expect("save");

        let raw: serde_json::Value = serde_json::from_str(
          &fs::read_to_string(storage.path()).expect("read")
        ).expect("json");
        assert_eq!(raw["version"], 0);
        assert_eq!(raw["state"]["apiKey"], "secret");
        assert_eq!(raw["state"]["enhancementHistory"][0]["timestamp"], 7);

        let restored = AppStore::from_persisted(storage.load());
        assert_eq!(restored.api_key(), "secret");
        assert_eq!(restored.enhanced_prompt(), "better");
        assert_eq!(restored.current_enhancement(), Some(&response(7)));
        assert!(!restored.has_enhanced());
    }

    #[test]
    fn test_corrupt_blob_yields_defaults()
    {   let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageFile::in_dir(dir.path());
        fs::write(storage.path(), "{ not json").expect("write");
        assert_eq!(storage.load(), PersistedState::default());
    }
}
