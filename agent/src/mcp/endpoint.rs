//! Remote endpoint normalization
//!
//! Some servers authenticate through a `token` query parameter, others
//! through an `Authorization: Bearer` header. Both forms are kept in sync so
//! either kind of server accepts the connection.

use std::collections::HashMap;

use url::Url;

const TOKEN_PARAM: &str = "token";
const BEARER_PREFIX: &str = "Bearer ";

/// Apply known URL fixups and sync the bearer credential
///
/// Idempotent: normalizing an already-normalized endpoint changes nothing.
/// Unparseable URLs are returned unchanged.
pub fn normalize_endpoint(
    url: &str,
    headers: &HashMap<String, String>,
) -> (String, HashMap<String, String>) {
    let mut headers = headers.clone();
    let mut parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Leaving unparseable URL as is: {}", e);
            return (url.to_string(), headers);
        }
    };
    let mut changed = false;

    // Tunnel URLs are often pasted with the local port still attached
    let is_tunnel = parsed
        .host_str()
        .is_some_and(|host| host.ends_with("trycloudflare.com"));
    if is_tunnel && parsed.port() == Some(8000) && parsed.set_port(None).is_ok() {
        tracing::info!("Auto-fixed Cloudflare tunnel URL: {}", redact_url(parsed.as_str()));
        changed = true;
    }

    let url_token = parsed
        .query_pairs()
        .find(|(key, _)| key == TOKEN_PARAM)
        .map(|(_, value)| value.into_owned());
    let auth_key = headers
        .keys()
        .find(|key| key.eq_ignore_ascii_case("authorization"))
        .cloned();

    match (url_token, auth_key) {
        (Some(token), None) => {
            headers.insert("Authorization".to_string(), format!("{}{}", BEARER_PREFIX, token));
            tracing::debug!("Copied URL token into Authorization header");
        }
        (None, Some(key)) => {
            if let Some(token) = headers.get(&key).and_then(|v| v.strip_prefix(BEARER_PREFIX)) {
                parsed.query_pairs_mut().append_pair(TOKEN_PARAM, token);
                changed = true;
                tracing::debug!("Copied Authorization bearer token into URL");
            }
        }
        _ => {}
    }

    let url = if changed {
        parsed.to_string()
    } else {
        url.to_string()
    };
    (url, headers)
}

/// URL with the `token` query value replaced by `***`, for logging
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        // Not a URL; fall back to dropping the query entirely
        return match url.split_once('?') {
            Some((base, _)) => format!("{}?***", base),
            None => url.to_string(),
        };
    };

    if !parsed.query_pairs().any(|(key, _)| key == TOKEN_PARAM) {
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == TOKEN_PARAM {
                "***".to_string()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();

    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}
