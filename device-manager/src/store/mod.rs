//! The device table and the per-user assignment ledger.
//!
//! The store offers single-item primitives only: a paginated filtered scan
//! and a conditional update. There is no multi-item transaction, so the
//! reconciler builds its guarantees on top of conditional writes.
mod http_store;
mod memory;

pub use self::http_store::HttpDeviceStore;
pub use self::memory::MemoryDeviceStore;

use crate::config::{DeviceStoreConfig, DeviceStoreType};
use crate::metrics_defs::STORE_SCAN_PAGES;
use crate::types::{DeviceRecord, DeviceUid, DeviceUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::histogram;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("conditional check failed for {0}")]
    ConditionFailed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    #[error("unexpected store response: {0}")]
    InvalidResponse(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanFilter {
    All,
    AssignedTo { email: String },
    /// `assigned_to` absent or empty.
    Unassigned,
}

impl ScanFilter {
    pub fn assigned_to(email: &str) -> Self {
        ScanFilter::AssignedTo {
            email: email.to_string(),
        }
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        match self {
            ScanFilter::All => true,
            ScanFilter::AssignedTo { email } => record.assignee() == Some(email.as_str()),
            ScanFilter::Unassigned => !record.is_assigned(),
        }
    }
}

/// One page of a scan. A present `last_evaluated_key` means more pages
/// follow, even when `items` is empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanPage {
    pub items: Vec<DeviceRecord>,
    #[serde(default)]
    pub last_evaluated_key: Option<DeviceUid>,
}

/// Guard evaluated atomically with a single-item update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Version { version: u64 },
    AssignedTo { email: String },
    Unassigned,
}

impl Condition {
    pub fn holds(&self, record: &DeviceRecord) -> bool {
        match self {
            Condition::Always => true,
            Condition::Version { version } => record.version == *version,
            Condition::AssignedTo { email } => record.assignee() == Some(email.as_str()),
            Condition::Unassigned => !record.is_assigned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LedgerState {
    Committed {
        device_uid: Option<DeviceUid>,
    },
    /// A reassignment in flight. `previous` lists the devices that were
    /// assigned to the user when it started.
    Pending {
        previous: Vec<DeviceUid>,
        next: Option<DeviceUid>,
        #[serde(default)]
        user_name: Option<String>,
        started_at: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_email: String,
    pub state: LedgerState,
    pub version: u64,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, device_uid: &str) -> Result<Option<DeviceRecord>, StoreError>;

    async fn scan(
        &self,
        filter: &ScanFilter,
        start_key: Option<&str>,
    ) -> Result<ScanPage, StoreError>;

    /// Fails with `NotFound` for a missing record and `ConditionFailed` if
    /// the condition does not hold. Returns the record as written.
    async fn update(
        &self,
        device_uid: &str,
        update: &DeviceUpdate,
        condition: &Condition,
    ) -> Result<DeviceRecord, StoreError>;

    async fn get_ledger(&self, user_email: &str) -> Result<Option<LedgerEntry>, StoreError>;

    /// `expected_version` of `None` requires that no entry exists yet.
    async fn put_ledger(
        &self,
        user_email: &str,
        state: &LedgerState,
        expected_version: Option<u64>,
    ) -> Result<LedgerEntry, StoreError>;
}

/// Follows `last_evaluated_key` until the scan is exhausted.
pub async fn scan_all(
    store: &dyn DeviceStore,
    filter: &ScanFilter,
) -> Result<Vec<DeviceRecord>, StoreError> {
    let mut items = Vec::new();
    let mut start_key: Option<DeviceUid> = None;
    let mut pages = 0;

    loop {
        let page = store.scan(filter, start_key.as_deref()).await?;
        items.extend(page.items);
        pages += 1;

        match page.last_evaluated_key {
            Some(key) => start_key = Some(key),
            None => break,
        }
    }

    histogram!(STORE_SCAN_PAGES).record(pages as f64);
    Ok(items)
}

pub fn build_store(config: &DeviceStoreConfig) -> Result<Arc<dyn DeviceStore>, StoreError> {
    let store: Arc<dyn DeviceStore> = match &config.r#type {
        DeviceStoreType::Memory {
            seed_file,
            page_size,
        } => {
            let store = match seed_file {
                Some(path) => MemoryDeviceStore::from_seed_file(path, *page_size)?,
                None => MemoryDeviceStore::new(*page_size),
            };
            tracing::info!(
                devices = store.len(),
                page_size,
                "using in-memory device store"
            );
            Arc::new(store)
        }
        DeviceStoreType::Http { base_url } => {
            tracing::info!(%base_url, "using HTTP device store");
            Arc::new(HttpDeviceStore::new(base_url.clone()))
        }
    };
    Ok(store)
}
