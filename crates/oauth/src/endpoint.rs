//! HTTP client for RFC 6749 refresh grants and RFC 7009 revocation.

use std::time::Duration;

use {
    async_trait::async_trait,
    reqwest::{
        StatusCode,
        header::{ACCEPT, HeaderMap, RETRY_AFTER},
    },
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::debug,
};

use crate::{
    error::{EndpointError, ProviderError},
    provider::RefreshClient,
    types::{ProviderId, TokenGrant},
};

/// Where and how to reach one provider's token endpoint.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub provider: ProviderId,
    pub token_url: String,
    pub revoke_url: Option<String>,
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_grant(self) -> TokenGrant {
        TokenGrant {
            access_token: Secret::new(self.access_token),
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
            id_token: self.id_token.filter(|t| !t.is_empty()).map(Secret::new),
            token_type: self.token_type,
            expires_in: self.expires_in,
        }
    }
}

/// RFC 6749 section 5.2 error body.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Refresh client backed by a real token endpoint.
#[derive(Debug, Clone)]
pub struct HttpRefreshClient {
    endpoint: ProviderEndpoint,
    http: reqwest::Client,
}

impl HttpRefreshClient {
    pub fn new(endpoint: ProviderEndpoint) -> Result<Self, EndpointError> {
        validate_url(&endpoint.provider, "token_url", &endpoint.token_url)?;
        if let Some(url) = &endpoint.revoke_url {
            validate_url(&endpoint.provider, "revoke_url", url)?;
        }
        let http = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()?;
        Ok(Self { endpoint, http })
    }

    pub fn endpoint(&self) -> &ProviderEndpoint {
        &self.endpoint
    }

    fn client_params<'a>(&'a self, form: &mut Vec<(&'static str, &'a str)>) {
        form.push(("client_id", self.endpoint.client_id.as_str()));
        if let Some(secret) = &self.endpoint.client_secret {
            form.push(("client_secret", secret.expose_secret().as_str()));
        }
    }
}

fn validate_url(provider: &ProviderId, field: &'static str, raw: &str) -> Result<(), EndpointError> {
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|source| EndpointError::InvalidUrl {
            provider: provider.clone(),
            field,
            source,
        })
}

fn network_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::transient("token endpoint timed out")
    } else {
        ProviderError::transient(format!("token endpoint request failed: {err}"))
    }
}

/// Seconds form only; HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_error_code(code: &str, description: Option<&str>, retry_after: Option<Duration>) -> ProviderError {
    let reason = match description {
        Some(d) if !d.is_empty() => format!("{code}: {d}"),
        _ => code.to_string(),
    };
    match code {
        "temporarily_unavailable" | "server_error" | "slow_down" => ProviderError::Transient {
            reason,
            retry_after,
        },
        _ => ProviderError::Permanent { reason },
    }
}

/// Map a non-success token endpoint response to a provider error.
fn classify(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return ProviderError::Transient {
            reason: format!("token endpoint returned {status}"),
            retry_after,
        };
    }
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => classify_error_code(&err.error, err.error_description.as_deref(), retry_after),
        Err(_) => ProviderError::permanent(format!("token endpoint returned {status}")),
    }
}

/// Parse a 2xx body. Some providers (GitHub) report errors with status 200.
fn parse_success(body: &str) -> Result<TokenGrant, ProviderError> {
    if let Ok(err) = serde_json::from_str::<ErrorResponse>(body) {
        return Err(classify_error_code(&err.error, err.error_description.as_deref(), None));
    }
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::transient(format!("malformed token response: {e}")))?;
    if parsed.access_token.is_empty() {
        return Err(ProviderError::transient("token response has an empty access_token"));
    }
    Ok(parsed.into_grant())
}

#[async_trait]
impl RefreshClient for HttpRefreshClient {
    #[tracing::instrument(skip_all, fields(provider = %self.endpoint.provider))]
    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenGrant, ProviderError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret().as_str()),
        ];
        self.client_params(&mut form);

        let resp = self
            .http
            .post(&self.endpoint.token_url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(network_error)?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.map_err(network_error)?;
        debug!(%status, "token endpoint responded");

        if status.is_success() {
            parse_success(&body)
        } else {
            Err(classify(status, &body, retry_after))
        }
    }

    #[tracing::instrument(skip_all, fields(provider = %self.endpoint.provider))]
    async fn revoke(&self, token: &Secret<String>) -> Result<(), ProviderError> {
        let Some(url) = &self.endpoint.revoke_url else {
            debug!("provider has no revocation endpoint, skipping");
            return Ok(());
        };

        let mut form = vec![("token", token.expose_secret().as_str())];
        self.client_params(&mut form);

        let resp = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(network_error)?;

        let status = resp.status();
        if status.is_success() {
            debug!("token revoked");
            return Ok(());
        }
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.map_err(network_error)?;
        Err(classify(status, &body, retry_after))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        mockito::{Matcher, Server},
        rstest::rstest,
    };

    fn endpoint_for(server: &Server, revoke: bool) -> ProviderEndpoint {
        ProviderEndpoint {
            provider: ProviderId::new("test"),
            token_url: format!("{}/token", server.url()),
            revoke_url: revoke.then(|| format!("{}/revoke", server.url())),
            client_id: "client-1".into(),
            client_secret: Some(Secret::new("shh".into())),
            timeout: Duration::from_secs(5),
        }
    }

    fn rt(token: &str) -> Secret<String> {
        Secret::new(token.into())
    }

    #[rstest]
    #[case(429, "", true)]
    #[case(408, "", true)]
    #[case(500, "", true)]
    #[case(503, r#"{"error":"invalid_grant"}"#, true)]
    #[case(400, r#"{"error":"invalid_grant","error_description":"Token has been revoked."}"#, false)]
    #[case(401, r#"{"error":"invalid_client"}"#, false)]
    #[case(400, r#"{"error":"unauthorized_client"}"#, false)]
    #[case(400, r#"{"error":"unsupported_grant_type"}"#, false)]
    #[case(400, r#"{"error":"temporarily_unavailable"}"#, true)]
    #[case(403, "forbidden", false)]
    #[case(404, "", false)]
    fn status_classification(#[case] status: u16, #[case] body: &str, #[case] transient: bool) {
        let err = classify(StatusCode::from_u16(status).unwrap(), body, None);
        assert_eq!(err.is_transient(), transient, "{status} {body}: {err}");
    }

    #[test]
    fn success_body_with_error_field_is_an_error() {
        let err = parse_success(r#"{"error":"bad_refresh_token","error_description":"expired"}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { ref reason } if reason == "bad_refresh_token: expired"));
    }

    #[test]
    fn malformed_success_body_is_transient() {
        assert!(parse_success("<html>").unwrap_err().is_transient());
        assert!(parse_success(r#"{"access_token":""}"#).unwrap_err().is_transient());
    }

    #[test]
    fn rejects_invalid_urls() {
        let endpoint = ProviderEndpoint {
            provider: ProviderId::new("bad"),
            token_url: "not a url".into(),
            revoke_url: None,
            client_id: "c".into(),
            client_secret: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            HttpRefreshClient::new(endpoint),
            Err(EndpointError::InvalidUrl { field: "token_url", .. })
        ));
    }

    #[tokio::test]
    async fn refresh_posts_grant_and_parses_tokens() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
                Matcher::UrlEncoded("client_id".into(), "client-1".into()),
                Matcher::UrlEncoded("client_secret".into(), "shh".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at-2","refresh_token":"rt-2","id_token":"idt","token_type":"Bearer","expires_in":3600}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let client = HttpRefreshClient::new(endpoint_for(&server, false)).unwrap();
        let grant = client.refresh(&rt("rt-1")).await.unwrap();

        assert_eq!(grant.access_token.expose_secret(), "at-2");
        assert_eq!(grant.refresh_token.unwrap().expose_secret(), "rt-2");
        assert_eq!(grant.id_token.unwrap().expose_secret(), "idt");
        assert_eq!(grant.expires_in, Some(3600));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn throttling_carries_retry_after() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(429)
            .with_header("retry-after", "17")
            .create_async()
            .await;

        let client = HttpRefreshClient::new(endpoint_for(&server, false)).unwrap();
        let err = client.refresh(&rt("rt")).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Transient { retry_after: Some(d), .. } if d == Duration::from_secs(17)
        ));
    }

    #[tokio::test]
    async fn invalid_grant_is_permanent() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let client = HttpRefreshClient::new(endpoint_for(&server, false)).unwrap();
        let err = client.refresh(&rt("rt")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { .. }));
    }

    #[tokio::test]
    async fn revoke_posts_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "rt-9".into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = HttpRefreshClient::new(endpoint_for(&server, true)).unwrap();
        client.revoke(&rt("rt-9")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn revoke_without_endpoint_is_a_no_op() {
        let mut server = Server::new_async().await;
        let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

        let client = HttpRefreshClient::new(endpoint_for(&server, false)).unwrap();
        client.revoke(&rt("rt")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let endpoint = ProviderEndpoint {
            provider: ProviderId::new("down"),
            token_url: "http://127.0.0.1:1/token".into(),
            revoke_url: None,
            client_id: "c".into(),
            client_secret: None,
            timeout: Duration::from_secs(2),
        };
        let client = HttpRefreshClient::new(endpoint).unwrap();
        assert!(client.refresh(&rt("rt")).await.unwrap_err().is_transient());
    }
}
