use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::persistence::BlobStore;

/// Blob key under which the host persists settings.
pub const SETTINGS_KEY: &str = "settings";

/// Immutable configuration snapshot for one run.
///
/// Owned by the host; the engine only reads it. Missing fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub remote: RemoteSettings,
    pub filters: FilterSettings,
    pub auto_sync: AutoSyncSettings,
    pub lock: LockSettings,
    /// Whether document attachments upload with their document or in the asset phase
    pub attachments: AttachmentMode,
    /// Number of concurrent remote writes per window
    pub concurrency: usize,
    /// Display name written into lock records (host name if unset)
    pub device_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote: RemoteSettings::default(),
            filters: FilterSettings::default(),
            auto_sync: AutoSyncSettings::default(),
            lock: LockSettings::default(),
            attachments: AttachmentMode::default(),
            concurrency: 5,
            device_name: None,
        }
    }
}

impl Settings {
    /// Load settings from host persistence. Absent settings yield defaults.
    pub async fn load(store: &dyn BlobStore) -> Result<Self, SyncError> {
        match store.load_blob(SETTINGS_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::Config(format!("Unreadable settings: {}", e))),
            None => Ok(Self::default()),
        }
    }

    /// Check that a run can start with this snapshot.
    pub fn validate(&self) -> Result<(), SyncError> {
        self.remote.validate()?;

        if self.concurrency == 0 {
            return Err(SyncError::Config("concurrency must be at least 1".to_string()));
        }
        if self.auto_sync.interval_minutes == 0 {
            return Err(SyncError::Config(
                "auto-sync interval must be at least one minute".to_string(),
            ));
        }

        self.lock.validate()
    }
}

/// Location and credentials of the remote repository.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// API endpoint (overridable for GitHub Enterprise)
    pub api_base: String,
    pub owner: String,
    pub repository: String,
    pub branch: String,
    pub token: String,
    /// Directory inside the repository that mirrors the vault
    pub root_dir: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            owner: String::new(),
            repository: String::new(),
            branch: "main".to_string(),
            token: String::new(),
            root_dir: String::new(),
        }
    }
}

impl fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repository", &self.repository)
            .field("branch", &self.branch)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("root_dir", &self.root_dir)
            .finish()
    }
}

impl RemoteSettings {
    fn validate(&self) -> Result<(), SyncError> {
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(SyncError::Config(format!(
                "Malformed remote API base: {}",
                self.api_base
            )));
        }

        for (name, value) in [
            ("owner", &self.owner),
            ("repository", &self.repository),
            ("branch", &self.branch),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::Config(format!("Remote {} is not set", name)));
            }
            if value.contains(char::is_whitespace) {
                return Err(SyncError::Config(format!(
                    "Remote {} contains whitespace: {:?}",
                    name, value
                )));
            }
        }

        if self.token.trim().is_empty() {
            return Err(SyncError::Config("Missing remote credentials".to_string()));
        }

        Ok(())
    }

    /// Join a vault-relative path onto the configured root directory.
    pub fn remote_path(&self, relative: &str) -> String {
        let root = self.root_dir.trim_matches('/');
        let relative = relative.trim_start_matches('/');
        if root.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", root, relative)
        }
    }
}

/// Glob patterns excluding items from sync (case-insensitive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Matched against collection names
    pub collections: Vec<String>,
    /// Matched against hierarchical item paths
    pub paths: Vec<String>,
    /// Matched against item tags
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSyncSettings {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl Default for AutoSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
        }
    }
}

impl AutoSyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// Cross-device lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub enabled: bool,
    /// Lifetime of a lock record; must exceed the duration of a run
    pub ttl_secs: u64,
    /// Remote activity newer than this skips the run before jitter
    pub first_check_threshold_secs: u64,
    /// Remote activity newer than this skips the run after jitter
    pub second_check_threshold_secs: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 600,
            first_check_threshold_secs: 60,
            second_check_threshold_secs: 10,
            jitter_min_ms: 1_000,
            jitter_max_ms: 5_000,
        }
    }
}

impl LockSettings {
    fn validate(&self) -> Result<(), SyncError> {
        if !self.enabled {
            return Ok(());
        }
        if self.ttl_secs == 0 {
            return Err(SyncError::Config("lock TTL must be positive".to_string()));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(SyncError::Config(format!(
                "lock jitter window is inverted: {}ms > {}ms",
                self.jitter_min_ms, self.jitter_max_ms
            )));
        }
        if self.second_check_threshold_secs > self.first_check_threshold_secs {
            return Err(SyncError::Config(
                "second lock check threshold must not exceed the first".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn first_check_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.first_check_threshold_secs as i64)
    }

    pub fn second_check_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.second_check_threshold_secs as i64)
    }
}

/// When document attachments are uploaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentMode {
    /// Right after their document, in the same pass
    #[default]
    Inline,
    /// In a separate asset phase
    Deferred,
}
