//! `env@@KEY` placeholder substitution
//!
//! Stored server records may carry values of the form `env@@KEY`; the actual
//! value is supplied per agent at connection time. Substitution works on a
//! copy so the stored record is never touched.

use std::collections::HashMap;

use crate::config::ServerConfig;

/// Prefix marking a value as a placeholder
pub const PLACEHOLDER_PREFIX: &str = "env@@";

/// Return the placeholder key if `value` is a placeholder
pub fn placeholder_key(value: &str) -> Option<&str> {
    value.strip_prefix(PLACEHOLDER_PREFIX)
}

/// Resolve every placeholder in `config` from `overrides`
///
/// Env values of local servers and header values of remote servers are
/// resolved. On success the resolved copy is returned; otherwise the list of
/// keys that had no override.
pub fn resolve_placeholders(
    config: &ServerConfig,
    overrides: &HashMap<String, String>,
) -> Result<ServerConfig, Vec<String>> {
    let mut missing = Vec::new();
    let mut resolved = config.clone();

    let values = match &mut resolved {
        ServerConfig::Local { env, .. } => env,
        ServerConfig::Remote { headers, .. } => headers,
    };

    for value in values.values_mut() {
        if let Some(key) = placeholder_key(value) {
            match overrides.get(key) {
                Some(actual) => *value = actual.clone(),
                None => missing.push(key.to_string()),
            }
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        missing.sort();
        missing.dedup();
        Err(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_with_env(pairs: &[(&str, &str)]) -> ServerConfig {
        ServerConfig::Local {
            command: "srv".to_string(),
            args: vec![],
            env: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_placeholder_key() {
        assert_eq!(placeholder_key("env@@API_KEY"), Some("API_KEY"));
        assert_eq!(placeholder_key("plain"), None);
        assert_eq!(placeholder_key("xenv@@K"), None);
    }

    #[test]
    fn test_resolves_env_values() {
        let config = local_with_env(&[("TOKEN", "env@@GH_TOKEN"), ("MODE", "fast")]);
        let overrides = HashMap::from([("GH_TOKEN".to_string(), "secret".to_string())]);

        let resolved = resolve_placeholders(&config, &overrides).unwrap();
        match resolved {
            ServerConfig::Local { env, .. } => {
                assert_eq!(env["TOKEN"], "secret");
                assert_eq!(env["MODE"], "fast");
            }
            other => panic!("Expected local config, got {:?}", other),
        }
    }

    #[test]
    fn test_reports_missing_keys() {
        let config = local_with_env(&[("A", "env@@ONE"), ("B", "env@@TWO"), ("C", "env@@ONE")]);
        let missing = resolve_placeholders(&config, &HashMap::new()).unwrap_err();
        assert_eq!(missing, vec!["ONE", "TWO"]);
    }

    #[test]
    fn test_original_config_untouched() {
        let config = local_with_env(&[("TOKEN", "env@@K")]);
        let overrides = HashMap::from([("K".to_string(), "v".to_string())]);
        let _ = resolve_placeholders(&config, &overrides).unwrap();
        assert_eq!(config, local_with_env(&[("TOKEN", "env@@K")]));
    }

    #[test]
    fn test_resolves_remote_headers() {
        let config = ServerConfig::Remote {
            url: "https://r.test/sse".to_string(),
            headers: HashMap::from([("Authorization".to_string(), "env@@AUTH".to_string())]),
        };
        let overrides = HashMap::from([("AUTH".to_string(), "Bearer t".to_string())]);
        let resolved = resolve_placeholders(&config, &overrides).unwrap();
        match resolved {
            ServerConfig::Remote { headers, .. } => {
                assert_eq!(headers["Authorization"], "Bearer t")
            }
            other => panic!("Expected remote config, got {:?}", other),
        }
    }
}
