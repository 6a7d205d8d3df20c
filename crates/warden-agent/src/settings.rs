use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_VERSION_PAGE_URL: &str = "https://www.minecraft.net/en-us/download/server/bedrock";
pub const DEFAULT_DOWNLOAD_URL_TEMPLATE: &str =
    "https://www.minecraft.net/bedrockdedicatedserver/bin-{platform}/bedrock-server-{version}.zip";

const CONFIG_ENV: &str = "WARDEN_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "./warden.toml";

/// Agent configuration: defaults, then `warden.toml`, then `WARDEN_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub data_root: PathBuf,
    pub load_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub backup_interval_secs: u64,
    pub retention_interval_secs: u64,
    pub retention_keep: usize,
    pub stop_timeout_secs: u64,
    pub version_page_url: String,
    pub download_url_template: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            load_interval_secs: 60,
            cache_ttl_secs: 300,
            backup_interval_secs: 3600,
            retention_interval_secs: 86_400,
            retention_keep: 24,
            stop_timeout_secs: 10,
            version_page_url: DEFAULT_VERSION_PAGE_URL.to_string(),
            download_url_template: DEFAULT_DOWNLOAD_URL_TEMPLATE.to_string(),
            log_dir: None,
        }
    }
}

impl AgentSettings {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut settings = if path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        settings.apply_env(|name| std::env::var(name).ok());
        Ok(settings.clamped())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read settings {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse settings {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let num = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = lookup("WARDEN_DATA_ROOT").filter(|v| !v.trim().is_empty()) {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = num("WARDEN_LOAD_INTERVAL_SECS") {
            self.load_interval_secs = v;
        }
        if let Some(v) = num("WARDEN_CACHE_TTL_SECS") {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = num("WARDEN_BACKUP_INTERVAL_SECS") {
            self.backup_interval_secs = v;
        }
        if let Some(v) = num("WARDEN_RETENTION_INTERVAL_SECS") {
            self.retention_interval_secs = v;
        }
        if let Some(v) = num("WARDEN_RETENTION_KEEP") {
            self.retention_keep = v as usize;
        }
        if let Some(v) = num("WARDEN_STOP_TIMEOUT_SECS") {
            self.stop_timeout_secs = v;
        }
        if let Some(v) = lookup("WARDEN_VERSION_PAGE_URL") {
            self.version_page_url = v;
        }
        if let Some(v) = lookup("WARDEN_DOWNLOAD_URL_TEMPLATE") {
            self.download_url_template = v;
        }
        if let Some(v) = lookup("WARDEN_LOG_DIR").filter(|v| !v.trim().is_empty()) {
            self.log_dir = Some(PathBuf::from(v));
        }
    }

    pub fn clamped(mut self) -> Self {
        self.load_interval_secs = self.load_interval_secs.clamp(1, 86_400);
        self.cache_ttl_secs = self.cache_ttl_secs.min(86_400);
        self.backup_interval_secs = self.backup_interval_secs.clamp(60, 7 * 86_400);
        self.retention_interval_secs = self.retention_interval_secs.clamp(60, 30 * 86_400);
        self.retention_keep = self.retention_keep.clamp(1, 1000);
        self.stop_timeout_secs = self.stop_timeout_secs.clamp(1, 300);
        self
    }

    pub fn load_interval(&self) -> Duration {
        Duration::from_secs(self.load_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_root.join("servers")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.data_root.join("versions")
    }

    pub fn saves_dir(&self) -> PathBuf {
        self.data_root.join("saves")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_root.join("backups")
    }

    pub fn download_url(&self, version: &str) -> String {
        self.download_url_template
            .replace("{platform}", platform_tag())
            .replace("{version}", version)
    }
}

pub fn platform_tag() -> &'static str {
    if cfg!(windows) { "win" } else { "linux" }
}
