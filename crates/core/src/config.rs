//! Config file parsing for `~/.config/book-pipeline/config.toml`.
//!
//! Every field is optional. Use `limits_from_config`, `storage_root` and
//! `entitlement_from_config` to turn the loaded file into runtime values.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entitlement::{EntitlementCheck, HttpEntitlements, StaticEntitlements};
use crate::error::EntitlementError;
use crate::ingest::DEFAULT_RESOURCE_URL_PREFIX;
use crate::limits::IngestLimits;

const APP_DIR: &str = "book-pipeline";
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sanitize: SanitizeConfig,
    #[serde(default)]
    pub entitlement: EntitlementConfig,
    #[serde(default)]
    pub serving: ServingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the book layouts and the catalog file.
    pub root: Option<String>,
}

/// Upload and archive ceilings. Sizes in MiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_upload_mb: Option<u64>,
    pub max_file_count: Option<u64>,
    pub max_entry_mb: Option<u64>,
    pub max_total_mb: Option<u64>,
    pub max_compression_ratio: Option<u64>,
    pub max_extract_seconds: Option<u64>,
}

/// Markup ceilings. Sizes in KiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SanitizeConfig {
    pub max_nesting_depth: Option<u32>,
    pub max_input_kb: Option<u64>,
    pub max_unit_kb: Option<u64>,
    pub max_document_kb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitlementConfig {
    /// Remote check endpoint. When unset, `grants` is used.
    pub url: Option<String>,
    #[serde(default = "default_entitlement_timeout_ms")]
    pub timeout_ms: u64,
    /// `user:book` pairs; `*` matches anything.
    #[serde(default)]
    pub grants: Vec<String>,
}

fn default_entitlement_timeout_ms() -> u64 {
    2_000
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_entitlement_timeout_ms(),
            grants: Vec::new(),
        }
    }
}

impl EntitlementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServingConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_resource_url_prefix")]
    pub resource_url_prefix: String,
    #[serde(default = "default_descriptor_cache_size")]
    pub descriptor_cache_size: usize,
    /// Bearer token required for uploads and status. Open when unset.
    pub admin_token: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_resource_url_prefix() -> String {
    DEFAULT_RESOURCE_URL_PREFIX.to_string()
}
fn default_descriptor_cache_size() -> usize {
    256
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            resource_url_prefix: default_resource_url_prefix(),
            descriptor_cache_size: default_descriptor_cache_size(),
            admin_token: None,
        }
    }
}

/// Load config from the default path. Missing or unreadable files give defaults.
pub fn load_config() -> AppConfig {
    let Some(path) = config_path() else {
        return AppConfig::default();
    };
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return AppConfig::default(),
    };
    match toml::from_str::<AppConfig>(&content) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config file");
            AppConfig::default()
        }
    }
}

/// Return the default config file path (for init and show).
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(APP_DIR);
        p.push("config.toml");
        p
    })
}

/// Storage root from config, else the platform data directory.
pub fn storage_root(c: &StorageConfig) -> PathBuf {
    if let Some(root) = &c.root {
        return PathBuf::from(root);
    }
    match dirs::data_dir() {
        Some(mut p) => {
            p.push(APP_DIR);
            p
        }
        None => PathBuf::from(APP_DIR),
    }
}

/// Build ingestion limits from config. Uses defaults for any unset values.
pub fn limits_from_config(cfg: &AppConfig) -> IngestLimits {
    let mut limits = IngestLimits::default();
    let l = &cfg.limits;
    if let Some(mb) = l.max_upload_mb {
        limits.max_upload_bytes = mb.saturating_mul(MIB);
    }
    if let Some(n) = l.max_file_count {
        limits.max_file_count = n;
    }
    if let Some(mb) = l.max_entry_mb {
        limits.max_entry_bytes = mb.saturating_mul(MIB);
    }
    if let Some(mb) = l.max_total_mb {
        limits.max_total_bytes = mb.saturating_mul(MIB);
    }
    if let Some(r) = l.max_compression_ratio {
        limits.max_compression_ratio = r;
    }
    if let Some(s) = l.max_extract_seconds {
        limits.max_extract_seconds = s;
    }

    let s = &cfg.sanitize;
    if let Some(depth) = s.max_nesting_depth {
        limits.max_nesting_depth = depth;
    }
    if let Some(kb) = s.max_input_kb {
        limits.max_input_bytes = kb.saturating_mul(1024);
    }
    if let Some(kb) = s.max_unit_kb {
        limits.max_unit_bytes = kb.saturating_mul(1024);
    }
    if let Some(kb) = s.max_document_kb {
        limits.max_document_bytes = kb.saturating_mul(1024);
    }
    limits
}

/// Remote check when a URL is configured, else the static grant list.
pub fn entitlement_from_config(
    c: &EntitlementConfig,
) -> Result<Arc<dyn EntitlementCheck>, EntitlementError> {
    match &c.url {
        Some(url) => Ok(Arc::new(HttpEntitlements::new(url.clone(), c.timeout())?)),
        None => Ok(Arc::new(StaticEntitlements::parse_list(&c.grants.join(",")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(limits_from_config(&cfg), IngestLimits::default());
        assert_eq!(cfg.serving.resource_url_prefix, "/api/books");
        assert_eq!(cfg.entitlement.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_sections() {
        let cfg: AppConfig = toml::from_str(
            r#"
[storage]
root = "/srv/books"

[limits]
max_upload_mb = 10
max_extract_seconds = 5

[sanitize]
max_unit_kb = 512

[entitlement]
grants = ["alice:moby", "bob:*"]

[serving]
bind = "0.0.0.0:9000"
"#,
        )
        .unwrap();

        assert_eq!(storage_root(&cfg.storage), PathBuf::from("/srv/books"));
        let limits = limits_from_config(&cfg);
        assert_eq!(limits.max_upload_bytes, 10 * MIB);
        assert_eq!(limits.max_extract_seconds, 5);
        assert_eq!(limits.max_unit_bytes, 512 * 1024);
        assert_eq!(limits.max_file_count, IngestLimits::default().max_file_count);
        assert_eq!(cfg.serving.bind, "0.0.0.0:9000");
        assert_eq!(cfg.serving.descriptor_cache_size, 256);
        assert_eq!(cfg.entitlement.timeout_ms, 2_000);
    }

    #[test]
    fn test_round_trips_through_toml() {
        let mut cfg = AppConfig::default();
        cfg.serving.admin_token = Some("secret".into());
        cfg.entitlement.url = Some("http://auth.local/entitled".into());
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }

    #[tokio::test]
    async fn test_static_grants_from_config() {
        use crate::id::{BookId, UserId};

        let cfg = EntitlementConfig {
            grants: vec!["alice:moby".into()],
            ..EntitlementConfig::default()
        };
        let check = entitlement_from_config(&cfg).unwrap();
        let alice = UserId::parse("alice").unwrap();
        let moby = BookId::parse("moby").unwrap();
        let other = BookId::parse("other").unwrap();
        assert!(check.is_entitled(&alice, &moby).await.unwrap());
        assert!(!check.is_entitled(&alice, &other).await.unwrap());
    }
}
