//! Account, credential and export declarations.

use serde::Deserialize;

use super::limits::AccountLimits;

/// A user that authenticates into an account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserConfig {
    pub user: String,
    pub password: String,
}

/// A stream the account exposes through its external API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExportConfig {
    /// Exported stream name. The stream may be created after startup.
    pub stream: String,
    /// Subjects importers may consume; defaults to everything.
    #[serde(default)]
    pub filter: Option<String>,
    /// Accounts allowed to import. Empty means any account.
    #[serde(default)]
    pub to: Vec<String>,
}

/// Account declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub limits: AccountLimits,
    #[serde(default)]
    pub exports: Vec<ExportConfig>,
}

impl AccountConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: Vec::new(),
            limits: AccountLimits::default(),
            exports: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push(UserConfig {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_limits(mut self, limits: AccountLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_export(mut self, export: ExportConfig) -> Self {
        self.exports.push(export);
        self
    }
}

impl ExportConfig {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            filter: None,
            to: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn to(mut self, account: impl Into<String>) -> Self {
        self.to.push(account.into());
        self
    }
}
