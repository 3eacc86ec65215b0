//! Server configuration: the shared config file overlaid with environment.

use std::path::PathBuf;

use book_pipeline_core::config::{
    limits_from_config, load_config, storage_root, AppConfig, EntitlementConfig,
};
use book_pipeline_core::limits::IngestLimits;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Storage root for book layouts and `catalog.json`.
    pub root: PathBuf,
    /// Host:port to bind (e.g. "127.0.0.1:8080" or "0.0.0.0:8080").
    pub bind: String,
    pub limits: IngestLimits,
    pub entitlement: EntitlementConfig,
    pub resource_url_prefix: String,
    pub descriptor_cache_size: usize,
    /// Bearer token guarding uploads and status. Open when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl ServerConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            root: storage_root(&cfg.storage),
            bind: cfg.serving.bind.clone(),
            limits: limits_from_config(cfg),
            entitlement: cfg.entitlement.clone(),
            resource_url_prefix: cfg.serving.resource_url_prefix.clone(),
            descriptor_cache_size: cfg.serving.descriptor_cache_size,
            admin_token: cfg.serving.admin_token.clone(),
        }
    }

    /// Build config from the config file and environment.
    /// - `BOOK_PIPELINE_ROOT`: storage root
    /// - `BOOK_PIPELINE_BIND`: host:port
    /// - `BOOK_PIPELINE_ENTITLEMENT_URL`: remote entitlement endpoint
    /// - `BOOK_PIPELINE_ENTITLEMENT_TIMEOUT_MS`: entitlement timeout
    /// - `BOOK_PIPELINE_GRANTS`: `user:book` pairs, comma separated
    /// - `BOOK_PIPELINE_ADMIN_TOKEN`: upload/status bearer token
    pub fn from_env() -> Self {
        let mut c = Self::from_app_config(&load_config());
        c.apply_env(|key| std::env::var(key).ok());
        c
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("BOOK_PIPELINE_ROOT") {
            self.root = PathBuf::from(p);
        }
        if let Some(b) = var("BOOK_PIPELINE_BIND") {
            self.bind = b;
        }
        if let Some(url) = var("BOOK_PIPELINE_ENTITLEMENT_URL") {
            self.entitlement.url = Some(url);
        }
        if let Some(ms) = var("BOOK_PIPELINE_ENTITLEMENT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.entitlement.timeout_ms = ms;
        }
        if let Some(grants) = var("BOOK_PIPELINE_GRANTS") {
            self.entitlement.grants = grants
                .split(',')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
        }
        if let Some(token) = var("BOOK_PIPELINE_ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            self.admin_token = Some(token);
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overlays_file_values() {
        let env: HashMap<&str, &str> = [
            ("BOOK_PIPELINE_ROOT", "/data/books"),
            ("BOOK_PIPELINE_GRANTS", "alice:moby, bob:*"),
            ("BOOK_PIPELINE_ENTITLEMENT_TIMEOUT_MS", "750"),
            ("BOOK_PIPELINE_ADMIN_TOKEN", ""),
        ]
        .into_iter()
        .collect();

        let mut c = ServerConfig::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.root, PathBuf::from("/data/books"));
        assert_eq!(c.entitlement.grants, vec!["alice:moby", "bob:*"]);
        assert_eq!(c.entitlement.timeout_ms, 750);
        assert_eq!(c.admin_token, None);
        assert_eq!(c.bind, "127.0.0.1:8080");
    }
}
