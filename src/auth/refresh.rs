// Token refresh logic

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::store::SessionStore;
use super::types::{AuthCredentials, LoginMethod, RefreshRequest, RefreshResponse};
use crate::error::{AuthError, Result};

const USER_AGENT: &str = concat!("auth-relay/", env!("CARGO_PKG_VERSION"));

/// Exchanges an expired bearer token for a fresh one
#[async_trait]
pub trait RefreshProvider: Send + Sync {
    /// `Ok(None)` when no refreshed token can be obtained.
    /// Once `cancel` fires, returns [`AuthError::Aborted`] and persists nothing.
    async fn refreshed_token(&self, cancel: &CancellationToken) -> Result<Option<String>>;
}

/// Refreshes the stored SSO session against an HTTP endpoint and persists the
/// new token back into the session store
pub struct HttpRefresher {
    client: Client,
    refresh_url: Option<String>,
    store: Arc<SessionStore>,
}

impl HttpRefresher {
    pub fn new(
        store: Arc<SessionStore>,
        refresh_url: Option<String>,
        timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            refresh_url,
            store,
        })
    }

    /// POST the refresh token and parse the new token pair
    async fn exchange(&self, url: &str, refresh_token: String) -> Result<RefreshResponse> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %error_text, "Token refresh rejected");
            return Err(AuthError::Refresh(format!("{} - {}", status, error_text)));
        }

        let data: RefreshResponse = response.json().await?;
        if data.access_token.is_empty() {
            return Err(AuthError::Refresh("response does not contain accessToken".to_string()));
        }
        Ok(data)
    }

    /// Stored SSO refresh token, if the session has one
    async fn stored_refresh_token(&self) -> Result<Option<String>> {
        let record = self.store.record().await?;
        Ok(record
            .and_then(|r| r.sessions.get(&LoginMethod::Sso).cloned())
            .and_then(|c| match c {
                AuthCredentials::Sso(secrets) => secrets.refresh_token,
                _ => None,
            }))
    }
}

#[async_trait]
impl RefreshProvider for HttpRefresher {
    async fn refreshed_token(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        let Some(url) = self.refresh_url.as_deref() else {
            tracing::debug!("No refresh URL configured, skipping token refresh");
            return Ok(None);
        };

        let Some(refresh_token) = self.stored_refresh_token().await? else {
            tracing::debug!("Stored SSO session has no refresh token");
            return Ok(None);
        };

        tracing::info!("Refreshing SSO access token...");

        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Aborted),
            data = self.exchange(url, refresh_token) => data?,
        };

        // Aborted requests must not leave a stored side effect
        if cancel.is_cancelled() {
            return Err(AuthError::Aborted);
        }

        self.store
            .update_access_token(&data.access_token, data.refresh_token.as_deref())
            .await?;

        tracing::info!("SSO access token refreshed");
        Ok(Some(data.access_token))
    }
}
