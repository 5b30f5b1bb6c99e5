//! Preference storage with change notification
//!
//! One [`PreferenceStore`] is created at startup and shared by every
//! component that reads or writes preferences. Each change is written to
//! `settings.toml` and published on a watch channel.

use config::{PathManager, Settings};
use docchat_api::{ChatMode, ConversationId};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

pub struct PreferenceStore {
    /// None for in-memory stores
    path: Option<PathBuf>,
    tx: watch::Sender<Settings>,
}

impl PreferenceStore {
    /// Load from the default settings file.
    pub fn load() -> Self {
        match PathManager::settings_path() {
            Some(path) => Self::load_from(path),
            None => {
                tracing::warn!("Could not determine settings path; preferences will not persist");
                Self::in_memory(Settings::default())
            }
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Settings::load_from(&path);
        let (tx, _) = watch::channel(settings);
        Self { path: Some(path), tx }
    }

    pub fn in_memory(settings: Settings) -> Self {
        let (tx, _) = watch::channel(settings);
        Self { path: None, tx }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every published change.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Re-read the settings file, picking up changes made by another
    /// process. Returns true if anything changed.
    pub fn reload(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let fresh = Settings::load_from(path);
        self.tx.send_if_modified(|current| {
            if *current == fresh {
                false
            } else {
                *current = fresh;
                true
            }
        })
    }

    /// Apply `change` on top of the file's current contents, write it back
    /// and publish. Write failures are logged; the in-memory value still
    /// changes.
    fn update(&self, change: impl FnOnce(&mut Settings)) {
        let mut settings = match &self.path {
            Some(path) => Settings::load_from(path),
            None => self.current(),
        };
        change(&mut settings);

        if let Some(path) = &self.path
            && let Err(e) = settings.save_to(path)
        {
            tracing::warn!("Failed to save preferences: {}", e);
        }
        self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    pub fn mode(&self) -> ChatMode {
        self.tx
            .borrow()
            .mode
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_mode(&self, mode: ChatMode) {
        self.update(|s| s.mode = Some(mode.as_str().to_string()));
    }

    pub fn last_conversation(&self) -> Option<ConversationId> {
        self.tx
            .borrow()
            .last_conversation_id
            .clone()
            .map(ConversationId::from_string)
    }

    pub fn set_last_conversation(&self, id: Option<&ConversationId>) {
        let id = id.map(|id| id.as_str().to_string());
        self.update(|s| s.last_conversation_id = id);
    }

    pub fn base_url(&self) -> Option<String> {
        self.tx.borrow().base_url.clone()
    }

    pub fn set_base_url(&self, url: Option<&str>) {
        let url = url.map(str::to_string);
        self.update(|s| s.base_url = url);
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().get_access_token()
    }

    /// Store (sealed) or clear the access token.
    pub fn set_access_token(&self, token: Option<&str>) -> Result<(), String> {
        let mut sealed = Settings::default();
        if let Some(token) = token {
            sealed.set_access_token(token)?;
        }
        self.update(|s| s.access_token = sealed.access_token);
        Ok(())
    }
}
