/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config text.
///
/// Unresolvable variables without a fallback are left as-is so the parse
/// error (or the literal value) points at the missing variable.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder literally.
            result.push_str(&rest[start..]);
            return result;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => result.push_str(&value),
            (false, None, Some(fallback)) => result.push_str(fallback),
            _ => {
                result.push_str("${");
                result.push_str(body);
                result.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_env(name: &str) -> Option<String> {
        match name {
            "CLIENT_SECRET" => Some("s3cret".into()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("secret = \"${CLIENT_SECRET}\"", fake_env),
            "secret = \"s3cret\""
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_with("${NOPE}", fake_env), "${NOPE}");
    }

    #[test]
    fn uses_fallback_when_unset() {
        assert_eq!(substitute_with("${NOPE:-30}s", fake_env), "30s");
        assert_eq!(substitute_with("[${EMPTY:-x}]", fake_env), "[]");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_with("a ${CLIENT_SECRET", fake_env), "a ${CLIENT_SECRET");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_with("plain text", fake_env), "plain text");
    }

    #[test]
    fn reads_process_env() {
        assert_eq!(substitute_env("${TOKENWARD_SURELY_UNSET_VAR}"), "${TOKENWARD_SURELY_UNSET_VAR}");
    }
}
