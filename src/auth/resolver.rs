// Credential resolution
// Routes the active login method to stored sessions or the live environment

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

use super::environment::EnvironmentProvider;
use super::types::{AuthCredentials, LoginMethod, SessionRecord};
use crate::error::Result;

/// Anything that can produce the currently usable credentials
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn active_credentials(&self) -> Result<Option<AuthCredentials>>;
}

/// Resolve the credentials selected by `record.current_active_flow`.
///
/// Stored sessions are returned exactly as stored, expired or not. Environment
/// credentials are fetched live and provider failures propagate unchanged.
pub async fn resolve(
    record: &SessionRecord,
    environment: &dyn EnvironmentProvider,
) -> Result<Option<AuthCredentials>> {
    let Some(active) = record.current_active_flow else {
        return Ok(None);
    };

    match active {
        LoginMethod::Environment => {
            tracing::debug!("Resolving credentials from environment");
            environment.environment_credentials().await
        }
        method => Ok(record.sessions.get(&method).cloned()),
    }
}

/// Expiry of a JWT access token, `None` for opaque tokens or tokens without `exp`
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// Check if token is expired at `now`. Opaque tokens never are.
pub fn is_token_expired(token: &str, now: DateTime<Utc>) -> bool {
    match token_expiry(token) {
        Some(exp) => exp <= now,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use chrono::Duration;

    struct FixedEnvironment(Option<AuthCredentials>);

    #[async_trait]
    impl EnvironmentProvider for FixedEnvironment {
        async fn environment_credentials(&self) -> Result<Option<AuthCredentials>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenEnvironment;

    #[async_trait]
    impl EnvironmentProvider for BrokenEnvironment {
        async fn environment_credentials(&self) -> Result<Option<AuthCredentials>> {
            Err(AuthError::Environment("not configured".to_string()))
        }
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user","exp":{}}}"#, exp));
        format!("{}.{}.sig", header, payload)
    }

    fn record_with(active: Option<LoginMethod>, creds: Vec<AuthCredentials>) -> SessionRecord {
        let mut record = SessionRecord::default();
        for c in creds {
            record.sessions.insert(c.login_method(), c);
        }
        record.current_active_flow = active;
        record
    }

    #[test]
    fn test_token_expiry_parsing() {
        let token = jwt_with_exp(1_700_000_000);
        assert_eq!(token_expiry(&token).unwrap().timestamp(), 1_700_000_000);

        assert!(token_expiry("opaque-token").is_none());
        assert!(token_expiry("a.b.c.d").is_none());
        assert!(token_expiry("a.!!!.c").is_none());
    }

    #[test]
    fn test_is_token_expired() {
        let now = Utc::now();
        let past = jwt_with_exp((now - Duration::seconds(60)).timestamp());
        let future = jwt_with_exp((now + Duration::hours(1)).timestamp());

        assert!(is_token_expired(&past, now));
        assert!(!is_token_expired(&future, now));
        assert!(!is_token_expired("opaque-token", now));
    }

    #[tokio::test]
    async fn test_no_active_flow_is_none() {
        let record = record_with(None, vec![AuthCredentials::sso("A1")]);
        let env = FixedEnvironment(Some(AuthCredentials::environment("K", "S")));
        assert_eq!(resolve(&record, &env).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stored_session() {
        let record = record_with(Some(LoginMethod::Sso), vec![AuthCredentials::sso("A1")]);
        let env = FixedEnvironment(None);
        assert_eq!(
            resolve(&record, &env).await.unwrap(),
            Some(AuthCredentials::sso("A1"))
        );
    }

    #[tokio::test]
    async fn test_active_slot_never_populated() {
        let record = record_with(Some(LoginMethod::ApiKey), vec![AuthCredentials::sso("A1")]);
        let env = FixedEnvironment(None);
        assert_eq!(resolve(&record, &env).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_environment_delegation() {
        let record = record_with(Some(LoginMethod::Environment), vec![]);
        let env = FixedEnvironment(Some(AuthCredentials::environment("K", "S")));
        assert_eq!(
            resolve(&record, &env).await.unwrap(),
            Some(AuthCredentials::environment("K", "S"))
        );

        let env = FixedEnvironment(None);
        assert_eq!(resolve(&record, &env).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_environment_failure_propagates() {
        let record = record_with(Some(LoginMethod::Environment), vec![]);
        let err = resolve(&record, &BrokenEnvironment).await.unwrap_err();
        assert!(matches!(err, AuthError::Environment(_)));
    }

    #[tokio::test]
    async fn test_expired_sso_token_is_returned_as_stored() {
        let expired = jwt_with_exp((Utc::now() - Duration::minutes(5)).timestamp());
        let record = record_with(
            Some(LoginMethod::Sso),
            vec![AuthCredentials::sso(expired.clone())],
        );
        assert_eq!(
            resolve(&record, &FixedEnvironment(None)).await.unwrap(),
            Some(AuthCredentials::sso(expired))
        );
    }
}
