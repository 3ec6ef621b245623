use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

use auth_relay::auth::{
    token_expiry, AuthCredentials, EnvVarProvider, HttpRefresher, SessionEvent, SessionStore,
    SqliteBackend, SsoSecrets,
};
use auth_relay::config::{self, Command, Config, LoginCommand};
use auth_relay::error::AuthError;
use auth_relay::http_client::{AuthDispatcher, DispatchRequest, FetchOutcome, ReqwestTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Secret database: {}", config.db_file.display());

    let backend = SqliteBackend::open(&config.db_file).with_context(|| {
        format!("Failed to open secret database: {}", config.db_file.display())
    })?;
    let environment = EnvVarProvider::new(&config.api_key_var, &config.sts_token_var);
    let store = Arc::new(SessionStore::new(Arc::new(backend), Arc::new(environment)));

    match command {
        Command::Status => print_status(&store).await?,
        Command::Use { method } => {
            store.set_active_method(method).await?;
            println!("Active login method: {}", method);
        }
        Command::Login { method } => login(&store, method).await?,
        Command::Logout { yes } => {
            if yes || config::confirm_logout()? {
                store.clear().await?;
                println!("Logged out, all stored sessions removed");
            }
        }
        Command::Fetch { url, method, body } => {
            let method = config::parse_http_method(&method)?;
            let mut request = DispatchRequest::new(method, url);
            if let Some(body) = body {
                let body = serde_json::from_str(&body).context("Request body is not valid JSON")?;
                request = request.with_body(body);
            }
            fetch(&config, store, request).await?;
        }
    }

    Ok(())
}

/// Store credentials for a login method and make it active
async fn login(store: &SessionStore, command: LoginCommand) -> Result<()> {
    let credentials = match command {
        LoginCommand::Sso {
            access_token,
            refresh_token,
        } => AuthCredentials::Sso(SsoSecrets {
            access_token: config::secret_or_prompt(access_token, "Access token")?,
            refresh_token,
        }),
        LoginCommand::ApiKey { key } => {
            AuthCredentials::api_key(config::secret_or_prompt(key, "API key")?)
        }
    };

    let method = credentials.login_method();
    store.store_credentials(credentials).await?;
    store.set_active_method(method).await?;

    println!("✅ Logged in with {}", method);
    Ok(())
}

async fn print_status(store: &SessionStore) -> Result<()> {
    let Some(record) = store.record().await? else {
        println!("Not logged in");
        return Ok(());
    };

    match record.current_active_flow {
        Some(method) => println!("Active login method: {}", method),
        None => println!("Active login method: (none)"),
    }

    if record.sessions.is_empty() {
        println!("Stored sessions: (none)");
    } else {
        println!("Stored sessions:");
        for (method, credentials) in &record.sessions {
            match credentials {
                AuthCredentials::Sso(secrets) => {
                    let expiry = token_expiry(&secrets.access_token)
                        .map(|exp| format!("expires {}", exp.to_rfc3339()))
                        .unwrap_or_else(|| "no expiry".to_string());
                    let refresh = if secrets.refresh_token.is_some() {
                        ", refreshable"
                    } else {
                        ""
                    };
                    println!("  - {} ({}{})", method, expiry, refresh);
                }
                _ => println!("  - {}", method),
            }
        }
    }

    if let Some(metadata) = record.metadata {
        println!("Last updated: {}", metadata.last_updated.to_rfc3339());
    }

    Ok(())
}

/// Dispatch one authenticated request, aborting it on Ctrl+C
async fn fetch(config: &Config, store: Arc<SessionStore>, request: DispatchRequest) -> Result<()> {
    let transport =
        ReqwestTransport::new(config.http_connect_timeout, config.http_request_timeout)?;
    let refresher = HttpRefresher::new(
        store.clone(),
        config.refresh_url.clone(),
        config.http_request_timeout,
    )?;
    let dispatcher = Arc::new(AuthDispatcher::new(
        Arc::new(transport),
        store.clone(),
        Arc::new(refresher),
    ));
    let mut events = dispatcher.subscribe();

    let abort_on_ctrl_c = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C signal, aborting request...");
                dispatcher.abort();
            }
        })
    };

    let outcome = dispatcher.fetch_with_auth(request).await;
    abort_on_ctrl_c.abort();
    handle_session_events(&mut events, &store).await?;

    match outcome {
        Ok(FetchOutcome::Completed(response)) => {
            eprintln!("HTTP {}", response.status);
            println!("{}", response.text());
            Ok(())
        }
        Ok(FetchOutcome::SessionInvalidated) => {
            eprintln!("Session expired, you have been logged out. Run `auth-relay login` again.");
            Ok(())
        }
        Err(AuthError::Aborted) => anyhow::bail!("Request aborted"),
        Err(AuthError::NoCredentials) => {
            anyhow::bail!(
                "Not logged in. Run `auth-relay login` or `auth-relay use environment` first."
            )
        }
        Err(e) => Err(e).context("Request failed"),
    }
}

/// React to notifications emitted by the dispatcher
async fn handle_session_events(
    events: &mut broadcast::Receiver<SessionEvent>,
    store: &SessionStore,
) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::SilentLogout => {
                tracing::info!("Silent logout requested, clearing stored sessions");
                store.clear().await?;
            }
        }
    }
    Ok(())
}
