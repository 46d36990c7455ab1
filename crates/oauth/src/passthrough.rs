//! Whether a data connection may receive the user's OAuth token.
//!
//! Pure functions of the connection record; nothing here reads credentials.

use {serde_json::Value, tokenward_config::ConnectionConfig};

use crate::types::ProviderId;

pub const PASS_THRU_KEY: &str = "oauthPassThru";
pub const PASS_THRU_PROVIDERS_KEY: &str = "oauthPassThruProviders";

/// True only when `jsonData.oauthPassThru` is the boolean `true`.
pub fn pass_through_allowed(connection: &ConnectionConfig) -> bool {
    connection
        .json_data
        .get(PASS_THRU_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Providers whose credentials the connection accepts. `None` means any.
pub fn allowed_providers(connection: &ConnectionConfig) -> Option<Vec<ProviderId>> {
    let list = connection.json_data.get(PASS_THRU_PROVIDERS_KEY)?.as_array()?;
    Some(
        list.iter()
            .filter_map(Value::as_str)
            .map(ProviderId::new)
            .collect(),
    )
}

pub fn pass_through_allowed_for(connection: &ConnectionConfig, provider: &ProviderId) -> bool {
    pass_through_allowed(connection)
        && allowed_providers(connection).is_none_or(|allowed| allowed.contains(provider))
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn conn(json_data: Value) -> ConnectionConfig {
        ConnectionConfig {
            uid: "ds".into(),
            name: "ds".into(),
            kind: "loki".into(),
            json_data,
        }
    }

    #[rstest]
    #[case(Value::Null, false)]
    #[case(json!({}), false)]
    #[case(json!([]), false)]
    #[case(json!({ "oauthPassThru": false }), false)]
    #[case(json!({ "oauthPassThru": "true" }), false)]
    #[case(json!({ "oauthPassThru": 1 }), false)]
    #[case(json!({ "oauthPassThru": true }), true)]
    #[case(json!({ "oauthPassThru": true, "httpMethod": "POST" }), true)]
    fn pass_through_flag(#[case] json_data: Value, #[case] expected: bool) {
        assert_eq!(pass_through_allowed(&conn(json_data)), expected);
    }

    #[test]
    fn provider_restriction() {
        let google = ProviderId::new("google");
        let github = ProviderId::new("github");

        let open = conn(json!({ "oauthPassThru": true }));
        assert!(pass_through_allowed_for(&open, &google));
        assert!(allowed_providers(&open).is_none());

        let restricted = conn(json!({ "oauthPassThru": true, "oauthPassThruProviders": ["google"] }));
        assert!(pass_through_allowed_for(&restricted, &google));
        assert!(!pass_through_allowed_for(&restricted, &github));

        let disabled = conn(json!({ "oauthPassThru": false, "oauthPassThruProviders": ["google"] }));
        assert!(!pass_through_allowed_for(&disabled, &google));
    }

    #[test]
    fn parses_from_stored_connection_json() {
        let stored = r#"{"uid":"p1","name":"Prom","type":"prometheus","jsonData":{"oauthPassThru":true}}"#;
        let connection: ConnectionConfig = serde_json::from_str(stored).unwrap();
        assert!(pass_through_allowed(&connection));
    }
}
