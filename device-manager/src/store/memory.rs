use super::{Condition, DeviceStore, LedgerEntry, LedgerState, ScanFilter, ScanPage, StoreError};
use crate::types::{DeviceRecord, DeviceUid, DeviceUpdate};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::ops::Bound;
use std::path::Path;

#[derive(Default)]
struct Tables {
    devices: BTreeMap<DeviceUid, DeviceRecord>,
    ledger: HashMap<String, LedgerEntry>,
}

/// Process-local device table. Scans evaluate `page_size` records per page
/// in key order and filter afterwards, so a page can be empty while more
/// pages follow.
pub struct MemoryDeviceStore {
    tables: RwLock<Tables>,
    page_size: usize,
}

impl MemoryDeviceStore {
    pub fn new(page_size: usize) -> Self {
        MemoryDeviceStore {
            tables: RwLock::new(Tables::default()),
            page_size: page_size.max(1),
        }
    }

    pub fn with_devices<I>(page_size: usize, devices: I) -> Self
    where
        I: IntoIterator<Item = DeviceRecord>,
    {
        let store = MemoryDeviceStore::new(page_size);
        for device in devices {
            store.insert(device);
        }
        store
    }

    /// Loads a JSON array of device records.
    pub fn from_seed_file(path: &Path, page_size: usize) -> Result<Self, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        let devices: Vec<DeviceRecord> = serde_json::from_reader(reader)?;
        Ok(MemoryDeviceStore::with_devices(page_size, devices))
    }

    /// Registers or replaces a device record.
    pub fn insert(&self, device: DeviceRecord) {
        let mut tables = self.tables.write();
        tables.devices.insert(device.device_uid.clone(), device);
    }

    pub fn len(&self) -> usize {
        self.tables.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self, device_uid: &str) -> Option<DeviceRecord> {
        self.tables.read().devices.get(device_uid).cloned()
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.tables.read().devices.values().cloned().collect()
    }

    pub fn ledger_entry(&self, user_email: &str) -> Option<LedgerEntry> {
        self.tables.read().ledger.get(user_email).cloned()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get(&self, device_uid: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.device(device_uid))
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
        start_key: Option<&str>,
    ) -> Result<ScanPage, StoreError> {
        let tables = self.tables.read();
        let lower = match start_key {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };

        let mut evaluated = tables
            .devices
            .range::<str, _>((lower, Bound::Unbounded))
            .peekable();

        let mut items = Vec::new();
        let mut last_key = None;
        for _ in 0..self.page_size {
            let Some((key, record)) = evaluated.next() else {
                break;
            };
            if filter.matches(record) {
                items.push(record.clone());
            }
            last_key = Some(key.clone());
        }

        let last_evaluated_key = match evaluated.peek() {
            Some(_) => last_key,
            None => None,
        };

        Ok(ScanPage {
            items,
            last_evaluated_key,
        })
    }

    async fn update(
        &self,
        device_uid: &str,
        update: &DeviceUpdate,
        condition: &Condition,
    ) -> Result<DeviceRecord, StoreError> {
        let mut tables = self.tables.write();
        let record = tables
            .devices
            .get_mut(device_uid)
            .ok_or_else(|| StoreError::NotFound(device_uid.to_string()))?;

        if !condition.holds(record) {
            return Err(StoreError::ConditionFailed(device_uid.to_string()));
        }

        update.apply(record);
        record.version += 1;
        Ok(record.clone())
    }

    async fn get_ledger(&self, user_email: &str) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.ledger_entry(user_email))
    }

    async fn put_ledger(
        &self,
        user_email: &str,
        state: &LedgerState,
        expected_version: Option<u64>,
    ) -> Result<LedgerEntry, StoreError> {
        let mut tables = self.tables.write();
        let current_version = tables.ledger.get(user_email).map(|entry| entry.version);

        if current_version != expected_version {
            return Err(StoreError::ConditionFailed(user_email.to_string()));
        }

        let entry = LedgerEntry {
            user_email: user_email.to_string(),
            state: state.clone(),
            version: current_version.unwrap_or(0) + 1,
        };
        tables.ledger.insert(user_email.to_string(), entry.clone());
        Ok(entry)
    }
}
