use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::backend::SecretBackend;
use super::environment::EnvironmentProvider;
use super::resolver::{self, CredentialSource};
use super::types::{AuthCredentials, LoginMethod, SessionRecord, AUTH_SESSION_STORE_KEY};
use crate::error::{AuthError, Result};

/// Session store
/// Persists per-method credentials and the active login method as one record
/// in the secret backend.
///
/// Every mutation is a full read-modify-write of the record. Mutations through
/// one `SessionStore` are serialized; two stores (or two processes) sharing a
/// backend still race, and the last writer wins for the whole record.
pub struct SessionStore {
    /// Secret backend holding the serialized record
    backend: Arc<dyn SecretBackend>,

    /// Live source for environment-derived credentials
    environment: Arc<dyn EnvironmentProvider>,

    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SecretBackend>, environment: Arc<dyn EnvironmentProvider>) -> Self {
        Self {
            backend,
            environment,
            write_lock: Mutex::new(()),
        }
    }

    /// Load the record for mutation; absent or unparsable becomes the default
    async fn load_or_default(&self) -> Result<SessionRecord> {
        let raw = self.backend.get(AUTH_SESSION_STORE_KEY).await?;
        Ok(SessionRecord::decode_or_default(raw.as_deref()))
    }

    /// Load the record for reading; absent or unparsable becomes `None`
    async fn load(&self) -> Result<Option<SessionRecord>> {
        let Some(raw) = self.backend.get(AUTH_SESSION_STORE_KEY).await? else {
            return Ok(None);
        };

        match SessionRecord::decode(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!("Error reading auth session record: {}", e);
                Ok(None)
            }
        }
    }

    async fn persist(&self, record: &SessionRecord) -> Result<()> {
        let raw = record.encode()?;
        self.backend.store(AUTH_SESSION_STORE_KEY, &raw).await?;
        Ok(())
    }

    /// Mark `method` as the active login method
    pub async fn set_active_method(&self, method: LoginMethod) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut record = self.load_or_default().await?;
        record.current_active_flow = Some(method);
        record.touch();
        self.persist(&record).await?;

        tracing::info!(method = %method, "Active login method updated");
        Ok(())
    }

    /// Credentials for the active login method, if any
    pub async fn active_credentials(&self) -> Result<Option<AuthCredentials>> {
        match self.load().await? {
            Some(record) => resolver::resolve(&record, self.environment.as_ref()).await,
            None => Ok(None),
        }
    }

    /// Store credentials in their method's slot.
    /// Other slots and the active method are left untouched.
    pub async fn store_credentials(&self, credentials: AuthCredentials) -> Result<()> {
        let method = credentials.login_method();
        if !method.is_persistable() {
            return Err(AuthError::NotPersistable(method));
        }

        let _guard = self.write_lock.lock().await;

        let mut record = self.load_or_default().await?;
        record.sessions.insert(method, credentials);
        record.touch();
        self.persist(&record).await?;

        tracing::info!(method = %method, "Stored credentials");
        Ok(())
    }

    /// Replace the SSO access token after a refresh.
    /// Keeps the previous refresh token unless a new one is given.
    pub async fn update_access_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut record = self.load_or_default().await?;
        let Some(AuthCredentials::Sso(secrets)) = record.sessions.get_mut(&LoginMethod::Sso) else {
            return Err(AuthError::NoCredentials);
        };

        secrets.access_token = access_token.to_string();
        if let Some(refresh_token) = refresh_token {
            secrets.refresh_token = Some(refresh_token.to_string());
        }
        record.touch();
        self.persist(&record).await?;

        tracing::debug!("Stored refreshed SSO access token");
        Ok(())
    }

    /// Delete the whole record. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.backend.delete(AUTH_SESSION_STORE_KEY).await?;
        tracing::info!("Cleared auth session record");
        Ok(())
    }

    /// Snapshot of the persisted record
    pub async fn record(&self) -> Result<Option<SessionRecord>> {
        self.load().await
    }
}

#[async_trait]
impl CredentialSource for SessionStore {
    async fn active_credentials(&self) -> Result<Option<AuthCredentials>> {
        SessionStore::active_credentials(self).await
    }
}
