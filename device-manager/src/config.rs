use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Listener and admin listener share {0}")]
    ListenerClash(String),

    #[error("Device store page size cannot be 0")]
    InvalidPageSize,

    #[error("At least one user group must be configured")]
    NoGroups,

    #[error("Empty group name")]
    EmptyGroupName,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum DeviceStoreType {
    Memory {
        seed_file: Option<PathBuf>,
        #[serde(default = "default_page_size")]
        page_size: usize,
    },
    Http {
        base_url: Url,
    },
}

fn default_page_size() -> usize {
    100
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DeviceStoreConfig {
    #[serde(flatten)]
    pub r#type: DeviceStoreType,
}

impl Default for DeviceStoreConfig {
    fn default() -> Self {
        DeviceStoreConfig {
            r#type: DeviceStoreType::Memory {
                seed_file: None,
                page_size: default_page_size(),
            },
        }
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct IdentityDirectoryConfig {
    pub seed_file: Option<PathBuf>,
}

/// What to do with a reassignment that was interrupted after it started
/// mutating devices.
#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Finish the interrupted reassignment.
    #[default]
    Complete,
    /// Put the user back on the device they had before.
    Restore,
    /// Leave the user without a device.
    Leave,
}

impl RecoveryPolicy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RecoveryPolicy::Complete => "complete",
            RecoveryPolicy::Restore => "restore",
            RecoveryPolicy::Leave => "leave",
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub max_conflict_retries: u32,
    pub conflict_backoff_ms: u64,
    pub pending_timeout_secs: u64,
    pub recovery: RecoveryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            max_conflict_retries: 3,
            conflict_backoff_ms: 50,
            pending_timeout_secs: 30,
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 3001,
    }
}

fn default_groups() -> BTreeSet<String> {
    ["Admin", "Sales", "FieldEngineering", "Viewer"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub device_store: DeviceStoreConfig,
    #[serde(default)]
    pub identity_directory: IdentityDirectoryConfig,
    #[serde(default = "default_groups")]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            admin_listener: default_admin_listener(),
            device_store: DeviceStoreConfig::default(),
            identity_directory: IdentityDirectoryConfig::default(),
            groups: default_groups(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.listener == self.admin_listener {
            return Err(ValidationError::ListenerClash(format!(
                "{}:{}",
                self.listener.host, self.listener.port
            )));
        }

        if let DeviceStoreType::Memory { page_size: 0, .. } = self.device_store.r#type {
            return Err(ValidationError::InvalidPageSize);
        }

        if self.groups.is_empty() {
            return Err(ValidationError::NoGroups);
        }
        if self.groups.iter().any(|g| g.trim().is_empty()) {
            return Err(ValidationError::EmptyGroupName);
        }

        Ok(())
    }
}
