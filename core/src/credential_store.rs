/// Credential storage: the auth token is the only state that survives a restart
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

const TOKEN_KEY: &[u8] = b"session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub username: String,
    pub token: String,
    pub saved_at: DateTime<Utc>,
}

pub struct CredentialStore {
    db: sled::Db,
}

impl CredentialStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("credentials.db"))
            .map_err(|e| SyncError::Storage(format!("credentials DB: {}", e)))?;
        Ok(Self { db })
    }

    pub fn save(&self, username: &str, token: &str) -> Result<StoredCredentials> {
        let creds = StoredCredentials {
            username: username.to_string(),
            token: token.to_string(),
            saved_at: Utc::now(),
        };
        let val = serde_json::to_vec(&creds)?;
        self.db
            .insert(TOKEN_KEY, val)
            .map_err(|e| SyncError::Storage(format!("save: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("flush: {}", e)))?;
        Ok(creds)
    }

    /// Stored credentials, only if they belong to `username`
    pub fn load(&self, username: &str) -> Result<Option<StoredCredentials>> {
        let raw = self
            .db
            .get(TOKEN_KEY)
            .map_err(|e| SyncError::Storage(format!("load: {}", e)))?;
        match raw {
            Some(val) => {
                let creds = serde_json::from_slice::<StoredCredentials>(&val)?;
                Ok((creds.username == username).then_some(creds))
            }
            None => Ok(None),
        }
    }

    pub fn clear(&self) -> Result<bool> {
        let removed = self
            .db
            .remove(TOKEN_KEY)
            .map_err(|e| SyncError::Storage(format!("clear: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("flush: {}", e)))?;
        Ok(removed.is_some())
    }
}

impl Clone for CredentialStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}
