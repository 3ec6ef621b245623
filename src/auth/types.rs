// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Fixed secret-backend key holding the whole session record
pub const AUTH_SESSION_STORE_KEY: &str = "AuthSessionStore";

/// Supported login methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginMethod {
    /// Hosted SSO session, sends `Authorization: Bearer`
    /// Refreshable on 401
    Sso,

    /// Direct API key entered by the user
    ApiKey,

    /// Derived live from the process environment, never persisted
    Environment,
}

impl LoginMethod {
    /// Wire tag used in the persisted record
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::Sso => "SSO",
            LoginMethod::ApiKey => "API_KEY",
            LoginMethod::Environment => "ENVIRONMENT",
        }
    }

    /// Whether a 401 for this method may be recovered by a token refresh
    pub fn is_refreshable(&self) -> bool {
        matches!(self, LoginMethod::Sso)
    }

    /// Whether credentials for this method may be written to the secret backend
    pub fn is_persistable(&self) -> bool {
        !matches!(self, LoginMethod::Environment)
    }
}

impl fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoginMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "SSO" => Ok(LoginMethod::Sso),
            "API_KEY" => Ok(LoginMethod::ApiKey),
            "ENVIRONMENT" | "ENV" => Ok(LoginMethod::Environment),
            other => Err(format!("unknown login method: {}", other)),
        }
    }
}

/// Secrets for the SSO bearer-token session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoSecrets {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Secrets derived from the environment
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSecrets {
    pub api_key: String,
    pub sts_token: String,
}

/// Secrets for a directly entered API key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySecrets {
    pub api_key: String,
}

/// Shorten a secret for debug output
fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{}***", prefix)
}

impl fmt::Debug for SsoSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoSecrets")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .finish()
    }
}

impl fmt::Debug for EnvironmentSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentSecrets")
            .field("api_key", &redact(&self.api_key))
            .field("sts_token", &redact(&self.sts_token))
            .finish()
    }
}

impl fmt::Debug for ApiKeySecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeySecrets")
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

/// Credentials for one login method.
///
/// Serialized as `{"loginMethod": "<TAG>", "secrets": {...}}` so the tag and the
/// shape of `secrets` can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "loginMethod", content = "secrets", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthCredentials {
    Sso(SsoSecrets),
    ApiKey(ApiKeySecrets),
    Environment(EnvironmentSecrets),
}

impl AuthCredentials {
    pub fn sso(access_token: impl Into<String>) -> Self {
        AuthCredentials::Sso(SsoSecrets {
            access_token: access_token.into(),
            refresh_token: None,
        })
    }

    pub fn environment(api_key: impl Into<String>, sts_token: impl Into<String>) -> Self {
        AuthCredentials::Environment(EnvironmentSecrets {
            api_key: api_key.into(),
            sts_token: sts_token.into(),
        })
    }

    pub fn api_key(api_key: impl Into<String>) -> Self {
        AuthCredentials::ApiKey(ApiKeySecrets {
            api_key: api_key.into(),
        })
    }

    pub fn login_method(&self) -> LoginMethod {
        match self {
            AuthCredentials::Sso(_) => LoginMethod::Sso,
            AuthCredentials::ApiKey(_) => LoginMethod::ApiKey,
            AuthCredentials::Environment(_) => LoginMethod::Environment,
        }
    }

    /// Copy of these credentials carrying a refreshed access token.
    /// Non-SSO credentials are returned unchanged.
    pub fn with_access_token(&self, access_token: &str) -> Self {
        match self {
            AuthCredentials::Sso(secrets) => AuthCredentials::Sso(SsoSecrets {
                access_token: access_token.to_string(),
                refresh_token: secrets.refresh_token.clone(),
            }),
            other => other.clone(),
        }
    }
}

/// Observability metadata for the session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub last_updated: DateTime<Utc>,
}

/// The single persisted session record
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub sessions: BTreeMap<LoginMethod, AuthCredentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_active_flow: Option<LoginMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

/// Persisted record as read, before individual slots are validated
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSessionRecord {
    #[serde(default)]
    sessions: BTreeMap<String, Value>,
    #[serde(default)]
    current_active_flow: Option<Value>,
    #[serde(default)]
    metadata: Option<SessionMetadata>,
}

impl SessionRecord {
    /// Parse a persisted record.
    ///
    /// Only the record's outer shape is required to be valid. Slots that are
    /// unreadable (for example a method this build does not know) or that must
    /// never be on disk (environment credentials, a key disagreeing with its
    /// tag) are dropped one by one, and an unknown active flow reads as none.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        let raw: RawSessionRecord = serde_json::from_str(raw)?;

        let sessions = raw
            .sessions
            .into_iter()
            .filter_map(|(key, value)| decode_slot(key, value))
            .collect();

        let current_active_flow = match raw.current_active_flow {
            None => None,
            Some(value) => match serde_json::from_value::<LoginMethod>(value) {
                Ok(method) => Some(method),
                Err(e) => {
                    tracing::warn!("Ignoring unknown active login method: {}", e);
                    None
                }
            },
        };

        Ok(SessionRecord {
            sessions,
            current_active_flow,
            metadata: raw.metadata,
        })
    }

    /// Parse a persisted record, falling back to the empty default when the
    /// value is absent or unparsable
    pub fn decode_or_default(raw: Option<&str>) -> Self {
        match raw {
            None => SessionRecord::default(),
            Some(raw) => SessionRecord::decode(raw).unwrap_or_else(|e| {
                tracing::warn!("Persisted session record is unparsable, resetting: {}", e);
                SessionRecord::default()
            }),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Bump `metadata.lastUpdated`
    pub fn touch(&mut self) {
        self.metadata = Some(SessionMetadata {
            last_updated: Utc::now(),
        });
    }
}

fn decode_slot(key: String, value: Value) -> Option<(LoginMethod, AuthCredentials)> {
    let decoded = serde_json::from_value::<LoginMethod>(Value::String(key.clone()))
        .and_then(|method| Ok((method, serde_json::from_value::<AuthCredentials>(value)?)));

    match decoded {
        Ok((method, credentials))
            if method.is_persistable() && credentials.login_method() == method =>
        {
            Some((method, credentials))
        }
        Ok(_) => {
            tracing::warn!(slot = %key, "Dropping invalid session slot from persisted record");
            None
        }
        Err(e) => {
            tracing::warn!(slot = %key, "Dropping unreadable session slot: {}", e);
            None
        }
    }
}

/// Notifications the dispatcher emits to its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Stored session expired during credential resolution; the caller should
    /// log the user out without surfacing an error
    SilentLogout,
}

/// Token refresh request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Token refresh response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_wire_shape() {
        let creds = AuthCredentials::sso("A1");
        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"loginMethod": "SSO", "secrets": {"accessToken": "A1"}})
        );

        let creds = AuthCredentials::environment("K", "S");
        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "loginMethod": "ENVIRONMENT",
                "secrets": {"apiKey": "K", "stsToken": "S"}
            })
        );
    }

    #[test]
    fn test_tag_shape_mismatch_rejected() {
        let raw = r#"{"loginMethod": "SSO", "secrets": {"apiKey": "K"}}"#;
        assert!(serde_json::from_str::<AuthCredentials>(raw).is_err());
    }

    #[test]
    fn test_login_method_parse() {
        assert_eq!("sso".parse::<LoginMethod>().unwrap(), LoginMethod::Sso);
        assert_eq!("api-key".parse::<LoginMethod>().unwrap(), LoginMethod::ApiKey);
        assert_eq!("ENV".parse::<LoginMethod>().unwrap(), LoginMethod::Environment);
        assert!("password".parse::<LoginMethod>().is_err());
    }

    #[test]
    fn test_decode_or_default_on_garbage() {
        assert_eq!(SessionRecord::decode_or_default(None), SessionRecord::default());
        assert_eq!(
            SessionRecord::decode_or_default(Some("{not json")),
            SessionRecord::default()
        );
    }

    #[test]
    fn test_decode_drops_environment_and_mismatched_slots() {
        let raw = r#"{
            "sessions": {
                "SSO": {"loginMethod": "SSO", "secrets": {"accessToken": "A1"}},
                "ENVIRONMENT": {
                    "loginMethod": "ENVIRONMENT",
                    "secrets": {"apiKey": "K", "stsToken": "S"}
                },
                "API_KEY": {"loginMethod": "SSO", "secrets": {"accessToken": "X"}}
            },
            "currentActiveFlow": "SSO"
        }"#;

        let record = SessionRecord::decode(raw).unwrap();
        assert_eq!(record.sessions.len(), 1);
        assert_eq!(record.sessions.get(&LoginMethod::Sso), Some(&AuthCredentials::sso("A1")));
        assert_eq!(record.current_active_flow, Some(LoginMethod::Sso));
        assert!(record.metadata.is_none());
    }

    #[test]
    fn test_decode_keeps_valid_slots_next_to_unknown_ones() {
        let raw = r#"{
            "sessions": {
                "SSO": {"loginMethod": "SSO", "secrets": {"accessToken": "A1"}},
                "PASSKEY": {"loginMethod": "PASSKEY", "secrets": {"credentialId": "c1"}},
                "API_KEY": {"loginMethod": "API_KEY", "secrets": {}}
            },
            "currentActiveFlow": "PASSKEY",
            "metadata": {"lastUpdated": "2024-05-01T12:00:00Z"}
        }"#;

        let record = SessionRecord::decode(raw).unwrap();
        assert_eq!(record.sessions.len(), 1);
        assert_eq!(record.sessions.get(&LoginMethod::Sso), Some(&AuthCredentials::sso("A1")));
        assert_eq!(record.current_active_flow, None);
        assert!(record.metadata.is_some());

        // Still rejected when the outer shape is wrong
        assert!(SessionRecord::decode("42").is_err());
        assert!(SessionRecord::decode(r#"{"sessions": []}"#).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = AuthCredentials::environment("secret-api-key", "secret-sts");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-api-key"));
        assert!(debug.contains("secr***"));
    }

    #[test]
    fn test_with_access_token_keeps_refresh_token() {
        let creds = AuthCredentials::Sso(SsoSecrets {
            access_token: "old".to_string(),
            refresh_token: Some("r".to_string()),
        });
        let updated = creds.with_access_token("new");
        assert_eq!(
            updated,
            AuthCredentials::Sso(SsoSecrets {
                access_token: "new".to_string(),
                refresh_token: Some("r".to_string()),
            })
        );
    }
}
