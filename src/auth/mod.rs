// Authentication module
// Session persistence, credential resolution and token refresh

mod backend;
mod environment;
mod refresh;
mod resolver;
mod store;
mod types;

pub use backend::{BackendError, MemoryBackend, SecretBackend, SqliteBackend};
pub use environment::{
    EnvVarProvider, EnvironmentProvider, DEFAULT_API_KEY_VAR, DEFAULT_STS_TOKEN_VAR,
};
pub use refresh::{HttpRefresher, RefreshProvider};
pub use resolver::{is_token_expired, token_expiry, CredentialSource};
pub use store::SessionStore;
pub use types::{
    ApiKeySecrets, AuthCredentials, EnvironmentSecrets, LoginMethod, SessionEvent,
    SessionMetadata, SessionRecord, SsoSecrets, AUTH_SESSION_STORE_KEY,
};
