use std::collections::HashMap;

use serde::Serialize;

use super::{definition::WebhookInputConfig, manager::InputError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRoute {
    pub key: String,
    pub path: String,
    pub method: String,
    pub input_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl WebhookRoute {
    pub fn for_input(input_id: &str, config: &WebhookInputConfig) -> Self {
        let method = config
            .method
            .as_deref()
            .unwrap_or("POST")
            .to_ascii_uppercase();
        let path = normalize_path(
            config
                .path
                .clone()
                .unwrap_or_else(|| format!("/inputs/{}/ingest", input_id))
                .as_str(),
        );
        Self {
            key: route_key(&path, &method),
            path,
            method,
            input_id: input_id.to_string(),
            auth_token: config.auth_token.clone().filter(|token| !token.is_empty()),
        }
    }

    /// Accepts the raw token or `Bearer <token>`. Routes without a token accept all.
    pub fn authorizes(&self, presented: Option<&str>) -> bool {
        let Some(expected) = &self.auth_token else {
            return true;
        };
        let Some(presented) = presented.map(str::trim) else {
            return false;
        };
        let token = presented
            .strip_prefix("Bearer ")
            .or_else(|| presented.strip_prefix("bearer "))
            .unwrap_or(presented)
            .trim();
        token == expected
    }
}

pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

pub fn route_key(path: &str, method: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), path)
}

/// Route key → input id, plus the reverse index used to release an input's routes.
#[derive(Debug, Default)]
pub struct WebhookRoutes {
    by_key: HashMap<String, WebhookRoute>,
    by_input: HashMap<String, Vec<String>>,
}

impl WebhookRoutes {
    /// Fails without touching the table when another input owns the route.
    pub fn check(&self, route: &WebhookRoute) -> Result<(), InputError> {
        match self.by_key.get(&route.key) {
            Some(current) if current.input_id != route.input_id => {
                Err(InputError::WebhookPathConflict {
                    key: route.key.clone(),
                    owner: current.input_id.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Replaces every route previously owned by `route.input_id`.
    pub fn register(&mut self, route: WebhookRoute) -> Result<(), InputError> {
        self.check(&route)?;
        self.clear(&route.input_id);
        self.by_input
            .entry(route.input_id.clone())
            .or_default()
            .push(route.key.clone());
        self.by_key.insert(route.key.clone(), route);
        Ok(())
    }

    pub fn clear(&mut self, input_id: &str) {
        if let Some(keys) = self.by_input.remove(input_id) {
            for key in keys {
                self.by_key.remove(&key);
            }
        }
    }

    pub fn matching(&self, path: &str, method: &str) -> Option<&WebhookRoute> {
        self.by_key.get(&route_key(&normalize_path(path), method))
    }

    pub fn list(&self) -> Vec<WebhookRoute> {
        let mut routes: Vec<WebhookRoute> = self.by_key.values().cloned().collect();
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: Option<&str>, method: Option<&str>) -> WebhookInputConfig {
        WebhookInputConfig {
            path: path.map(str::to_string),
            method: method.map(str::to_string),
            auth_token: None,
        }
    }

    #[test]
    fn test_route_defaults() {
        let route = WebhookRoute::for_input("orders", &config(None, None));
        assert_eq!(route.key, "POST /inputs/orders/ingest");

        let route = WebhookRoute::for_input("orders", &config(Some("hooks/x"), Some("put")));
        assert_eq!(route.path, "/hooks/x");
        assert_eq!(route.method, "PUT");
    }

    #[test]
    fn test_conflict_keeps_original() {
        let mut routes = WebhookRoutes::default();
        routes
            .register(WebhookRoute::for_input("a", &config(Some("/hook"), None)))
            .unwrap();
        let err = routes
            .register(WebhookRoute::for_input("b", &config(Some("/hook"), None)))
            .unwrap_err();

        assert_eq!(err.code(), "webhook_path_conflict");
        assert_eq!(routes.matching("/hook", "post").map(|r| r.input_id.as_str()), Some("a"));
    }

    #[test]
    fn test_reregister_replaces_own_route() {
        let mut routes = WebhookRoutes::default();
        routes
            .register(WebhookRoute::for_input("a", &config(Some("/one"), None)))
            .unwrap();
        routes
            .register(WebhookRoute::for_input("a", &config(Some("/two"), None)))
            .unwrap();

        assert!(routes.matching("/one", "POST").is_none());
        assert!(routes.matching("two", "POST").is_some());
        assert_eq!(routes.list().len(), 1);
    }

    #[test]
    fn test_authorization() {
        let mut route = WebhookRoute::for_input("a", &config(None, None));
        assert!(route.authorizes(None));

        route.auth_token = Some("s3cret".to_string());
        assert!(route.authorizes(Some("s3cret")));
        assert!(route.authorizes(Some("Bearer s3cret")));
        assert!(!route.authorizes(Some("Bearer nope")));
        assert!(!route.authorizes(None));
    }
}
