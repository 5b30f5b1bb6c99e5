//! Persistent client settings (`settings.toml`)

use crate::{PathManager, crypto};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Settings shared by every docchat process on this machine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    /// Backend origin, e.g. `http://localhost:8000`
    pub base_url: Option<String>,
    /// Sealed bearer token (see [`crate::crypto`])
    pub access_token: Option<String>,
    /// Conversation to reopen on startup
    pub last_conversation_id: Option<String>,
    /// Chat mode wire name (`auto`, `documents_only`, `general_knowledge`)
    pub mode: Option<String>,
}

impl Settings {
    /// Load from the default settings file, or defaults if absent.
    pub fn load() -> Self {
        match PathManager::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`; unreadable or invalid files yield defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        toml::from_str(&content).unwrap_or_default()
    }

    pub fn save(&self) -> Result<(), String> {
        let path = PathManager::settings_path().ok_or("Could not determine settings path")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
    }

    /// Decrypted access token. None if unset or sealed on another machine.
    pub fn get_access_token(&self) -> Option<String> {
        self.access_token
            .as_deref()
            .and_then(|sealed| crypto::open_token(sealed).ok())
    }

    pub fn set_access_token(&mut self, token: &str) -> Result<(), String> {
        self.access_token = Some(crypto::seal_token(token)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let mut settings = Settings {
            base_url: Some("http://backend:9000".to_string()),
            last_conversation_id: Some("c-42".to_string()),
            mode: Some("documents_only".to_string()),
            ..Default::default()
        };
        settings.set_access_token("secret-token").unwrap();
        settings.save_to(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret-token"));

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.get_access_token().as_deref(), Some("secret-token"));
    }

    #[test]
    fn test_corrupt_token_is_ignored() {
        let settings = Settings {
            access_token: Some("garbage".to_string()),
            ..Default::default()
        };
        assert!(settings.get_access_token().is_none());
    }
}
