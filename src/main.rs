use anyhow::{Context, Result};
use std::sync::Arc;

use session_transport::auth::{
    token_preview, CredentialPair, CredentialStore, SessionState, SessionStatus,
    SqliteCredentialStore,
};
use session_transport::config::{Command, Config};
use session_transport::http_client::{ApiClient, ApiRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        base_url = %config.api_base_url,
        db = %config.credentials_db_file.display(),
        retry = ?config.network_retry,
        "Configuration loaded"
    );

    let store: Arc<dyn CredentialStore> =
        Arc::new(SqliteCredentialStore::open(&config.credentials_db_file)?);
    let session = Arc::new(SessionState::new(store.clone()));
    let client = ApiClient::from_config(&config, store.clone(), session.clone())?;

    match command {
        Command::Login {
            access_token,
            refresh_token,
        } => {
            let pair = CredentialPair::new(access_token, refresh_token)
                .context("Both access and refresh tokens must be non-empty")?;
            session.establish(pair);
            println!("Signed in");
        }

        Command::Logout => {
            client.logout(&session).await;
            println!("Signed out");
        }

        Command::Status => match store.get() {
            Some(pair) => println!(
                "Authenticated (access token: {})",
                token_preview(pair.access_token())
            ),
            None => println!("Signed out"),
        },

        Command::Request { method, path, data } => {
            let method = method
                .to_uppercase()
                .parse()
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut request = ApiRequest::new(method, path);
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                request = request.json(&body)?;
            }

            match client.send(request).await {
                Ok(response) => {
                    tracing::info!(status = %response.status(), "Request complete");
                    println!("{}", response.text());
                }
                Err(e) => {
                    if session.status() == SessionStatus::Expired {
                        eprintln!("Your session has expired, please sign in again.");
                    }
                    return Err(e).context("Request failed");
                }
            }
        }
    }

    Ok(())
}
