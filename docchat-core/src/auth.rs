//! Authorization context
//!
//! The backend reports a role and a list of permission strings for the
//! signed-in user. They are parsed once into an [`AuthContext`], which is
//! passed to whatever needs to check a [`Capability`].

use docchat_api::{ApiClient, ApiError, UserInfo};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::preferences::PreferenceStore;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Chat,
    ManageConversations,
    UploadDocuments,
    DeleteDocuments,
    ViewLogs,
    ViewStatus,
    ManageSettings,
    ManageModels,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Chat,
        Capability::ManageConversations,
        Capability::UploadDocuments,
        Capability::DeleteDocuments,
        Capability::ViewLogs,
        Capability::ViewStatus,
        Capability::ManageSettings,
        Capability::ManageModels,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::ManageConversations => "manage_conversations",
            Capability::UploadDocuments => "upload_documents",
            Capability::DeleteDocuments => "delete_documents",
            Capability::ViewLogs => "view_logs",
            Capability::ViewStatus => "view_status",
            Capability::ManageSettings => "manage_settings",
            Capability::ManageModels => "manage_models",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([':', '-', '.'], "_");
        match normalized.as_str() {
            "chat" => Ok(Capability::Chat),
            "manage_conversations" | "conversations" => Ok(Capability::ManageConversations),
            "upload_documents" | "upload" | "documents_upload" => Ok(Capability::UploadDocuments),
            "delete_documents" | "documents_delete" => Ok(Capability::DeleteDocuments),
            "view_logs" | "logs" => Ok(Capability::ViewLogs),
            "view_status" | "status" => Ok(Capability::ViewStatus),
            "manage_settings" | "settings" => Ok(Capability::ManageSettings),
            "manage_models" | "models" => Ok(Capability::ManageModels),
            _ => Err(format!("Unknown capability: {}", s)),
        }
    }
}

pub type CapabilitySet = BTreeSet<Capability>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{username} may not {capability}")]
    Forbidden {
        username: String,
        capability: Capability,
    },

    #[error("not signed in")]
    NotSignedIn,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// What the signed-in user may do. Built once per sign-in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub username: String,
    pub role: String,
    capabilities: CapabilitySet,
}

impl AuthContext {
    pub fn from_user(user: UserInfo) -> Self {
        let capabilities: CapabilitySet = if user.role.eq_ignore_ascii_case(ADMIN_ROLE) {
            Capability::ALL.into_iter().collect()
        } else {
            user.permissions
                .iter()
                .filter_map(|p| match p.parse::<Capability>() {
                    Ok(cap) => Some(cap),
                    Err(_) => {
                        tracing::debug!(permission = %p, "Ignoring unknown permission");
                        None
                    }
                })
                .collect()
        };
        Self {
            username: user.username,
            role: user.role,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<(), AuthError> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                username: self.username.clone(),
                capability,
            })
        }
    }
}

/// Signs in against the backend and keeps the token in preferences.
pub struct Authenticator {
    client: ApiClient,
    preferences: Arc<PreferenceStore>,
}

impl Authenticator {
    pub fn new(client: ApiClient, preferences: Arc<PreferenceStore>) -> Self {
        Self {
            client,
            preferences,
        }
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> Result<AuthContext, AuthError> {
        let token = self.client.login(username, password).await?;
        self.client.set_token(Some(token.clone()));
        if let Err(e) = self.preferences.set_access_token(Some(&token)) {
            tracing::warn!("Failed to store access token: {}", e);
        }
        let user = self.client.me().await?;
        tracing::info!(username = %user.username, role = %user.role, "Signed in");
        Ok(AuthContext::from_user(user))
    }

    /// Resume with the stored token. A rejected token is cleared and
    /// reported as `Ok(None)`.
    pub async fn restore(&self) -> Result<Option<AuthContext>, AuthError> {
        let Some(token) = self.preferences.access_token() else {
            return Ok(None);
        };
        self.client.set_token(Some(token));
        match self.client.me().await {
            Ok(user) => Ok(Some(AuthContext::from_user(user))),
            Err(ApiError::Unauthorized) => {
                tracing::info!("Stored access token rejected; signing out");
                self.sign_out();
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn sign_out(&self) {
        self.client.set_token(None);
        if let Err(e) = self.preferences.set_access_token(None) {
            tracing::warn!("Failed to clear access token: {}", e);
        }
    }
}
