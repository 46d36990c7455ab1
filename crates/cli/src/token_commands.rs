use std::{collections::HashMap, sync::Arc};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    secrecy::ExposeSecret,
    tokenward_config::TokenwardConfig,
    tokenward_oauth::{
        FileCredentialStore, HttpRefreshClient, Identity, ManagerConfig, ProviderId,
        RefreshClient, RetryPolicy, RetryingClient, StoredCredential, TokenManager, now_secs,
        resolve_all,
    },
    tracing::debug,
};

#[derive(Subcommand)]
pub enum TokenAction {
    /// Import an existing grant for the identity.
    Login {
        /// Provider name (e.g. "google").
        #[arg(long)]
        provider: String,
        #[arg(long, env = "TOKENWARD_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
        #[arg(long, env = "TOKENWARD_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,
        #[arg(long, env = "TOKENWARD_ID_TOKEN", hide_env_values = true)]
        id_token: Option<String>,
        /// Access token lifetime in seconds.
        #[arg(long)]
        expires_in: Option<u64>,
    },
    /// Show the identity's stored credential.
    Status {
        /// Print the summary as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print a valid access token, refreshing it if needed.
    Token {
        /// Print the token itself instead of its metadata.
        #[arg(long, default_value_t = false)]
        show: bool,
    },
    /// Refresh now, even if the token is still valid.
    Refresh,
    /// Drop stored credentials and revoke them upstream.
    Logout {
        /// Only this provider. Defaults to all of the identity's providers.
        #[arg(long)]
        provider: Option<String>,
    },
    /// Check whether a configured connection may receive the token.
    Passthrough {
        /// Connection uid from the `[connections]` config table.
        #[arg(long)]
        connection: String,
    },
}

pub async fn handle(action: TokenAction, config: &TokenwardConfig, identity: &Identity) -> Result<()> {
    let manager = build_manager(config)?;
    match action {
        TokenAction::Login {
            provider,
            access_token,
            refresh_token,
            id_token,
            expires_in,
        } => {
            let mut credential = StoredCredential::new(ProviderId::new(provider), access_token);
            if let Some(token) = refresh_token {
                credential = credential.with_refresh_token(token);
            }
            if let Some(token) = id_token {
                credential = credential.with_id_token(token);
            }
            if let Some(secs) = expires_in {
                credential = credential.with_expires_at(now_secs().saturating_add(secs));
            }
            let stored = manager.store_credential(identity, credential).await?;
            println!(
                "Stored {} credential for {identity} (revision {})",
                stored.provider, stored.revision
            );
            Ok(())
        },
        TokenAction::Status { json } => status(&manager, identity, json).await,
        TokenAction::Token { show } => {
            let credential = manager.current_token(identity).await?;
            if show {
                println!("{}", credential.access_token.expose_secret());
            } else {
                println!(
                    "{} [{}] revision {}",
                    credential.provider,
                    format_expiry(credential.expires_at, now_secs()),
                    credential.revision
                );
            }
            Ok(())
        },
        TokenAction::Refresh => {
            let credential = manager.force_refresh(identity).await?;
            println!(
                "Refreshed {} credential for {identity} [{}]",
                credential.provider,
                format_expiry(credential.expires_at, now_secs())
            );
            Ok(())
        },
        TokenAction::Logout { provider } => {
            match provider {
                Some(p) => {
                    manager
                        .invalidate_provider(identity, &ProviderId::new(p.as_str()))
                        .await?;
                    println!("Logged out {identity} from {p}");
                },
                None => {
                    manager.invalidate(identity).await?;
                    println!("Logged out {identity}");
                },
            }
            manager.flush_revocations().await;
            Ok(())
        },
        TokenAction::Passthrough { connection } => {
            let conn = config
                .connections
                .get(&connection)
                .with_context(|| format!("unknown connection: {connection}"))?;
            if !manager.pass_through_allowed(conn) {
                println!("{connection}: pass-through disabled");
                return Ok(());
            }
            match manager.pass_through_headers(identity, conn).await? {
                Some(headers) => {
                    let names: Vec<&str> = headers.keys().map(|k| k.as_str()).collect();
                    println!("{connection}: forwarding {}", names.join(", "));
                },
                None => println!("{connection}: provider not accepted by this connection"),
            }
            Ok(())
        },
    }
}

fn build_manager(config: &TokenwardConfig) -> Result<TokenManager> {
    let policy = RetryPolicy::from(&config.retry);
    let mut clients: HashMap<ProviderId, Arc<dyn RefreshClient>> = HashMap::new();
    for endpoint in resolve_all(&config.providers) {
        let provider = endpoint.provider.clone();
        let client = HttpRefreshClient::new(endpoint)?;
        debug!(%provider, "refresh client ready");
        clients.insert(provider, Arc::new(RetryingClient::new(client, policy)));
    }
    let store = Arc::new(FileCredentialStore::from_config(config));
    debug!(path = %store.path().display(), "using credential file");
    Ok(TokenManager::new(
        store,
        clients,
        ManagerConfig::from(&config.manager),
    ))
}

async fn status(manager: &TokenManager, identity: &Identity, json: bool) -> Result<()> {
    let Some(summary) = manager.has_stored_credential(identity).await? else {
        println!("No credential stored for {identity}.");
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    let refresh = if summary.has_refresh_token {
        "refreshable"
    } else {
        "no refresh token"
    };
    println!(
        "{identity}: {} [{}] revision {}, {refresh}",
        summary.provider,
        format_expiry(summary.expires_at, now_secs()),
        summary.revision
    );
    Ok(())
}

fn format_expiry(expires_at: Option<u64>, now: u64) -> String {
    let Some(ts) = expires_at else {
        return "no expiry".to_string();
    };
    if ts > now {
        let remaining = ts - now;
        let hours = remaining / 3600;
        let mins = (remaining % 3600) / 60;
        format!("valid ({hours}h {mins}m remaining)")
    } else {
        "expired".to_string()
    }
}
