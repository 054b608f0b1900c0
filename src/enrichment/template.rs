//! URL templating shared by the HTTP providers.
//!
//! `{name}` placeholders are replaced by the percent-encoded parameter value; every
//! parameter that was not consumed by a placeholder (and is not null) is left for the
//! caller to send as query string or body.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;
use url::form_urlencoded;

use super::types::Params;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{([^}]+)\}").expect("placeholder pattern is valid");
}

/// String form of a parameter value: strings verbatim, null empty, the rest as JSON.
pub fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Percent-encodes one URL component (spaces become `%20`).
pub fn encode_component(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

pub struct Expanded {
    pub url: String,
    pub remaining: Params,
}

pub fn expand_url(template: &str, params: &Params) -> Expanded {
    let mut used = HashSet::new();
    let url = PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            used.insert(key.to_string());
            params
                .get(key)
                .map(|value| encode_component(&param_string(value)))
                .unwrap_or_default()
        })
        .into_owned();
    let remaining = params
        .iter()
        .filter(|(key, value)| !used.contains(key.as_str()) && !value.is_null())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Expanded { url, remaining }
}

/// Plain substitution without encoding, for cache key templates.
pub fn apply_template(template: &str, params: &Params) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            params.get(&caps[1]).map(param_string).unwrap_or_default()
        })
        .into_owned()
}

pub fn append_query(url: &str, params: &Params) -> String {
    let pairs: Vec<String> = params
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            format!(
                "{}={}",
                encode_component(key),
                encode_component(&param_string(value))
            )
        })
        .collect();
    if pairs.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, pairs.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[test]
    fn test_expand_url_encodes_and_tracks_usage() {
        let expanded = expand_url(
            "https://api.test/users/{id}",
            &params(json!({"id": "a b/c", "lang": "ja", "skip": null})),
        );
        assert_eq!(expanded.url, "https://api.test/users/a%20b%2Fc");
        assert_eq!(expanded.remaining, params(json!({"lang": "ja"})));
    }

    #[test]
    fn test_missing_placeholder_is_empty() {
        let expanded = expand_url("https://api.test/{id}/x", &Params::new());
        assert_eq!(expanded.url, "https://api.test//x");
    }

    #[test]
    fn test_append_query_separator() {
        let extra = params(json!({"page": 2, "q": "x y"}));
        assert_eq!(append_query("http://h/p", &extra), "http://h/p?page=2&q=x%20y");
        assert_eq!(append_query("http://h/p?a=1", &extra), "http://h/p?a=1&page=2&q=x%20y");
        assert_eq!(append_query("http://h/p", &Params::new()), "http://h/p");
    }

    #[test]
    fn test_apply_template_uses_raw_values() {
        let key = apply_template("user:{id}:{missing}", &params(json!({"id": 5})));
        assert_eq!(key, "user:5:");
    }
}
