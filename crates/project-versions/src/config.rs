use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "PV_CONFIG";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database_url: Option<String>,
    pub storage: StorageConfig,
    pub leases: LeaseConfig,
    pub uploads: UploadConfig,
    pub queue: QueueConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode { #[default] Memory, S3 }

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub bucket: String,
    /// Base of the URLs handed out by the in-memory store.
    pub base_url: String,
    /// Custom S3 endpoint (MinIO etc). Forces path-style addressing.
    pub endpoint_url: Option<String>,
    pub region: String,
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Memory,
            bucket: "project-versions".into(),
            base_url: "http://localhost:9000".into(),
            endpoint_url: None,
            region: "us-east-1".into(),
            signing_secret: "dev-signing-secret".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LeaseConfig {
    /// humantime duration, e.g. `15min`, `3h`.
    pub default_expires_in: String,
    pub src_content_type: String,
    pub dist_content_type: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { default_expires_in: "3h".into(), src_content_type: "application/zip".into(), dist_content_type: "application/zip".into() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    pub max_source_size: Option<u64>,
    pub fetch_timeout_secs: u64,
    /// How long an unnumbered draft may live. Older drafts no longer hold a number and get swept.
    pub draft_ttl: String,
}

impl Default for UploadConfig {
    fn default() -> Self { Self { max_source_size: None, fetch_timeout_secs: 60, draft_ttl: "10min".into() } }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub nats_url: Option<String>,
    pub build_subject: String,
    pub deploy_subject: String,
    pub queue_group: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            build_subject: "builder-html5".into(),
            deploy_subject: "website-deployer".into(),
            queue_group: "project-versions".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat { #[default] Compact, Json }

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LogConfig { pub level: String, pub format: LogFormat }

impl Default for LogConfig {
    fn default() -> Self { Self { level: "info".into(), format: LogFormat::Compact } }
}

impl Config {
    /// Defaults, then `$PV_CONFIG` (TOML) if set, then `PV_*` environment overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_path(path)?,
            _ => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("read config {path:?}"))?;
        debug!(path=?path, len=content.len(), "config.read");
        toml::from_str(&content).with_context(|| format!("parse config {path:?}"))
    }

    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) -> Result<()> {
        let get = |k: &str| lookup(k).filter(|v| !v.is_empty());
        if let Some(v) = get("PV_DATABASE_URL") { self.database_url = Some(v); }
        if let Some(v) = get("PV_STORAGE_MODE") {
            self.storage.mode = match v.to_ascii_lowercase().as_str() {
                "memory" | "mock" => StorageMode::Memory,
                "s3" => StorageMode::S3,
                other => anyhow::bail!("PV_STORAGE_MODE: unsupported value {other:?}"),
            };
        }
        if let Some(v) = get("PV_ARTIFACT_BUCKET") { self.storage.bucket = v; }
        if let Some(v) = get("PV_STORAGE_BASE_URL") { self.storage.base_url = v; }
        if let Some(v) = get("PV_S3_ENDPOINT_URL") { self.storage.endpoint_url = Some(v); }
        if let Some(v) = get("PV_S3_REGION") { self.storage.region = v; }
        if let Some(v) = get("PV_SIGNING_SECRET") { self.storage.signing_secret = v; }
        if let Some(v) = get("PV_DEFAULT_LEASE_TTL") { self.leases.default_expires_in = v; }
        if let Some(v) = get("PV_MAX_SOURCE_SIZE") {
            self.uploads.max_source_size = Some(v.parse().with_context(|| format!("PV_MAX_SOURCE_SIZE: {v:?} is not a byte count"))?);
        }
        if let Some(v) = get("PV_DRAFT_TTL") { self.uploads.draft_ttl = v; }
        if let Some(v) = get("PV_NATS_URL") { self.queue.nats_url = Some(v); }
        if let Some(v) = get("PV_BUILD_SUBJECT") { self.queue.build_subject = v; }
        if let Some(v) = get("PV_DEPLOY_SUBJECT") { self.queue.deploy_subject = v; }
        if let Some(v) = get("PV_LOG_LEVEL") { self.log.level = v; }
        if let Some(v) = get("PV_LOG_FORMAT") {
            self.log.format = if v.eq_ignore_ascii_case("json") { LogFormat::Json } else { LogFormat::Compact };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        humantime::parse_duration(&self.leases.default_expires_in)
            .with_context(|| format!("leases.default_expires_in: invalid duration {:?}", self.leases.default_expires_in))?;
        humantime::parse_duration(&self.uploads.draft_ttl)
            .with_context(|| format!("uploads.draft_ttl: invalid duration {:?}", self.uploads.draft_ttl))?;
        if self.storage.bucket.trim().is_empty() { anyhow::bail!("storage.bucket must not be empty"); }
        Ok(())
    }

    pub fn default_lease_ttl(&self) -> Duration {
        humantime::parse_duration(&self.leases.default_expires_in).unwrap_or(Duration::from_secs(3 * 3600))
    }

    pub fn draft_ttl(&self) -> Duration {
        humantime::parse_duration(&self.uploads.draft_ttl).unwrap_or(Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.default_lease_ttl(), Duration::from_secs(3 * 3600));
        assert_eq!(cfg.storage.mode, StorageMode::Memory);
        assert_eq!(cfg.draft_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PV_STORAGE_MODE", "s3"),
            ("PV_DEFAULT_LEASE_TTL", "15min"),
            ("PV_MAX_SOURCE_SIZE", "52428800"),
            ("PV_LOG_FORMAT", "JSON"),
            ("PV_NATS_URL", ""),
            ("PV_DRAFT_TTL", "90s"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.storage.mode, StorageMode::S3);
        assert_eq!(cfg.default_lease_ttl(), Duration::from_secs(15 * 60));
        assert_eq!(cfg.uploads.max_source_size, Some(52_428_800));
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.queue.nats_url, None);
        assert_eq!(cfg.draft_ttl(), Duration::from_secs(90));
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = Config::default();
        assert!(cfg.apply_env(|k| (k == "PV_STORAGE_MODE").then(|| "gcs".to_string())).is_err());
        let mut cfg = Config::default();
        cfg.leases.default_expires_in = "soon".into();
        assert!(cfg.validate().is_err());
        let mut cfg = Config::default();
        cfg.uploads.draft_ttl = "later".into();
        assert!(cfg.validate().is_err());
    }
}
