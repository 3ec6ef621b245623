// Environment-derived credentials
// Read live on every resolution, never persisted

use async_trait::async_trait;

use super::types::AuthCredentials;
use crate::error::{AuthError, Result};

pub const DEFAULT_API_KEY_VAR: &str = "AUTH_RELAY_API_KEY";
pub const DEFAULT_STS_TOKEN_VAR: &str = "AUTH_RELAY_STS_TOKEN";

/// Source of credentials derived from the execution environment
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// `Ok(None)` when the environment carries no credentials at all,
    /// `Err` when it is configured but unusable
    async fn environment_credentials(&self) -> Result<Option<AuthCredentials>>;
}

/// Reads the API key and STS token from process environment variables
#[derive(Debug, Clone)]
pub struct EnvVarProvider {
    api_key_var: String,
    sts_token_var: String,
}

impl Default for EnvVarProvider {
    fn default() -> Self {
        Self::new(DEFAULT_API_KEY_VAR, DEFAULT_STS_TOKEN_VAR)
    }
}

impl EnvVarProvider {
    pub fn new(api_key_var: impl Into<String>, sts_token_var: impl Into<String>) -> Self {
        Self {
            api_key_var: api_key_var.into(),
            sts_token_var: sts_token_var.into(),
        }
    }

    /// Build credentials from raw variable values
    fn from_values(
        &self,
        api_key: Option<String>,
        sts_token: Option<String>,
    ) -> Result<Option<AuthCredentials>> {
        match (api_key, sts_token) {
            (None, None) => Ok(None),
            (Some(api_key), Some(sts_token)) => {
                if api_key.trim().is_empty() {
                    return Err(AuthError::Environment(format!("{} is empty", self.api_key_var)));
                }
                if sts_token.trim().is_empty() {
                    return Err(AuthError::Environment(format!(
                        "{} is empty",
                        self.sts_token_var
                    )));
                }
                Ok(Some(AuthCredentials::environment(api_key, sts_token)))
            }
            (Some(_), None) => Err(AuthError::Environment(format!(
                "{} is not set",
                self.sts_token_var
            ))),
            (None, Some(_)) => Err(AuthError::Environment(format!(
                "{} is not set",
                self.api_key_var
            ))),
        }
    }
}

#[async_trait]
impl EnvironmentProvider for EnvVarProvider {
    async fn environment_credentials(&self) -> Result<Option<AuthCredentials>> {
        let api_key = std::env::var(&self.api_key_var).ok();
        let sts_token = std::env::var(&self.sts_token_var).ok();
        self.from_values(api_key, sts_token)
    }
}
