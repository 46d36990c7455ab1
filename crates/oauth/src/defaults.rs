use std::{collections::BTreeSet, time::Duration};

use {
    secrecy::Secret,
    tokenward_config::{ProviderEntry, ProvidersConfig},
};

use crate::{endpoint::ProviderEndpoint, types::ProviderId};

struct Builtin {
    name: &'static str,
    token_url: &'static str,
    revoke_url: Option<&'static str>,
}

/// Token endpoints for well-known providers. Client credentials always come
/// from config or the environment.
const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "google",
        token_url: "https://oauth2.googleapis.com/token",
        revoke_url: Some("https://oauth2.googleapis.com/revoke"),
    },
    Builtin {
        name: "github",
        token_url: "https://github.com/login/oauth/access_token",
        revoke_url: None,
    },
    Builtin {
        name: "azuread",
        token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        revoke_url: None,
    },
];

/// Resolve the endpoint for a provider.
///
/// Priority, lowest first:
/// 1. Built-in defaults
/// 2. `[providers.<name>]` in the config file
/// 3. Environment variables (`TOKENWARD_OAUTH_{PROVIDER}_CLIENT_ID`, etc.)
///
/// Returns `None` for disabled providers and when no client id or token URL
/// can be found.
pub fn resolve_endpoint(provider: &str, config: &ProvidersConfig) -> Option<ProviderEndpoint> {
    resolve_with(provider, config, |name| std::env::var(name).ok())
}

/// Every provider that resolves to a usable endpoint: built-ins plus configured ones.
pub fn resolve_all(config: &ProvidersConfig) -> Vec<ProviderEndpoint> {
    let names: BTreeSet<&str> = BUILTINS
        .iter()
        .map(|b| b.name)
        .chain(config.names())
        .collect();
    names
        .into_iter()
        .filter_map(|name| resolve_endpoint(name, config))
        .collect()
}

fn resolve_with(
    provider: &str,
    config: &ProvidersConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Option<ProviderEndpoint> {
    if !config.is_enabled(provider) {
        return None;
    }

    let builtin = BUILTINS.iter().find(|b| b.name == provider);
    let entry = config.get(provider).cloned().unwrap_or_default();
    let ProviderEntry {
        mut token_url,
        mut revoke_url,
        mut client_id,
        mut client_secret,
        timeout_secs,
        ..
    } = entry;

    if let Some(b) = builtin {
        token_url = token_url.or_else(|| Some(b.token_url.to_string()));
        revoke_url = revoke_url.or_else(|| b.revoke_url.map(String::from));
    }

    // Override individual fields from env vars
    let env_prefix = format!(
        "TOKENWARD_OAUTH_{}_",
        provider.to_uppercase().replace('-', "_")
    );
    if let Some(v) = env(&format!("{env_prefix}CLIENT_ID")) {
        client_id = Some(v);
    }
    if let Some(v) = env(&format!("{env_prefix}CLIENT_SECRET")) {
        client_secret = Some(v);
    }
    if let Some(v) = env(&format!("{env_prefix}TOKEN_URL")) {
        token_url = Some(v);
    }
    if let Some(v) = env(&format!("{env_prefix}REVOKE_URL")) {
        revoke_url = Some(v);
    }

    Some(ProviderEndpoint {
        provider: ProviderId::new(provider),
        token_url: token_url?,
        revoke_url,
        client_id: client_id.filter(|id| !id.is_empty())?,
        client_secret: client_secret.filter(|s| !s.is_empty()).map(Secret::new),
        timeout: Duration::from_secs(timeout_secs.max(1)),
    })
}

#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret, std::collections::HashMap};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn providers(entries: &[(&str, ProviderEntry)]) -> ProvidersConfig {
        ProvidersConfig {
            providers: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn builtin_needs_client_id() {
        assert!(resolve_with("google", &ProvidersConfig::default(), no_env).is_none());
    }

    #[test]
    fn config_fills_in_builtin() {
        let cfg = providers(&[("google", ProviderEntry {
            client_id: Some("gid".into()),
            client_secret: Some("gsecret".into()),
            ..Default::default()
        })]);
        let ep = resolve_with("google", &cfg, no_env).unwrap();
        assert_eq!(ep.token_url, "https://oauth2.googleapis.com/token");
        assert_eq!(ep.revoke_url.as_deref(), Some("https://oauth2.googleapis.com/revoke"));
        assert_eq!(ep.client_id, "gid");
        assert_eq!(ep.client_secret.unwrap().expose_secret(), "gsecret");
        assert_eq!(ep.timeout, Duration::from_secs(10));
    }

    #[test]
    fn env_overrides_config() {
        let cfg = providers(&[("my-idp", ProviderEntry {
            client_id: Some("from-config".into()),
            token_url: Some("https://idp.example/token".into()),
            ..Default::default()
        })]);
        let env: HashMap<&str, &str> = HashMap::from([
            ("TOKENWARD_OAUTH_MY_IDP_CLIENT_ID", "from-env"),
            ("TOKENWARD_OAUTH_MY_IDP_REVOKE_URL", "https://idp.example/revoke"),
        ]);
        let ep = resolve_with("my-idp", &cfg, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(ep.client_id, "from-env");
        assert_eq!(ep.token_url, "https://idp.example/token");
        assert_eq!(ep.revoke_url.as_deref(), Some("https://idp.example/revoke"));
    }

    #[test]
    fn unknown_provider_needs_token_url() {
        let cfg = providers(&[("custom", ProviderEntry {
            client_id: Some("c".into()),
            ..Default::default()
        })]);
        assert!(resolve_with("custom", &cfg, no_env).is_none());
    }

    #[test]
    fn disabled_provider_is_skipped() {
        let cfg = providers(&[("github", ProviderEntry {
            enabled: false,
            client_id: Some("c".into()),
            ..Default::default()
        })]);
        assert!(resolve_with("github", &cfg, no_env).is_none());
    }
}
