//! Accounts: isolation boundaries, their credentials and limits.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::config::{AccountConfig, AccountLimits, ExportConfig};
use crate::error::ErrorKind;

/// Account name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Authentication and account lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authorization violation for user '{0}'")]
    InvalidCredentials(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::InvalidCredentials(_) => ErrorKind::PermissionDenied,
            AuthError::UnknownAccount(_) => ErrorKind::NotFound,
        }
    }
}

/// A configured account.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub limits: AccountLimits,
    /// Exports declared in configuration; resolved when first used.
    pub exports: Vec<ExportConfig>,
}

struct Credential {
    password: String,
    account: AccountId,
}

/// Accounts and the credential table that maps users onto them.
#[derive(Default)]
pub struct AccountTable {
    accounts: HashMap<AccountId, Account>,
    credentials: HashMap<String, Credential>,
}

impl AccountTable {
    /// Build from validated configuration.
    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        let mut table = Self::default();
        for config in accounts {
            let id = AccountId::new(&config.name);
            for user in &config.users {
                table.credentials.insert(
                    user.user.clone(),
                    Credential {
                        password: user.password.clone(),
                        account: id.clone(),
                    },
                );
            }
            table.accounts.insert(
                id.clone(),
                Account {
                    id,
                    limits: config.limits.clone(),
                    exports: config.exports.clone(),
                },
            );
        }
        table
    }

    /// Map a user/password pair onto its account.
    pub fn authenticate(&self, user: &str, password: &str) -> Result<AccountId, AuthError> {
        match self.credentials.get(user) {
            Some(credential) if credential.password == password => {
                debug!(user = %user, account = %credential.account, "Authenticated");
                Ok(credential.account.clone())
            }
            _ => Err(AuthError::InvalidCredentials(user.to_string())),
        }
    }

    pub fn get(&self, id: &AccountId) -> Result<&Account, AuthError> {
        self.accounts
            .get(id)
            .ok_or_else(|| AuthError::UnknownAccount(id.to_string()))
    }

    pub fn contains(&self, id: &AccountId) -> bool {
        self.accounts.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &AccountId> {
        self.accounts.keys()
    }
}
