use crate::store::{
    Condition, DeviceStore, LedgerEntry, LedgerState, MemoryDeviceStore, ScanFilter, ScanPage,
    StoreError,
};
use crate::types::{DeviceRecord, DeviceUid, DeviceUpdate};
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

/// Serves a `MemoryDeviceStore` over the document store HTTP facade.
pub struct TestDocumentStoreServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

#[derive(Deserialize)]
struct ScanBody {
    filter: ScanFilter,
    start_key: Option<String>,
}

#[derive(Deserialize)]
struct UpdateBody {
    update: DeviceUpdate,
    condition: Condition,
}

#[derive(Deserialize)]
struct PutLedgerBody {
    state: LedgerState,
    expected_version: Option<u64>,
}

struct FacadeError(StoreError);

impl IntoResponse for FacadeError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::ConditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

type Facade = State<Arc<MemoryDeviceStore>>;

async fn get_device(
    State(store): Facade,
    Path(uid): Path<String>,
) -> Result<Json<DeviceRecord>, FacadeError> {
    store
        .device(&uid)
        .map(Json)
        .ok_or(FacadeError(StoreError::NotFound(uid)))
}

async fn update_device(
    State(store): Facade,
    Path(uid): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<DeviceRecord>, FacadeError> {
    store
        .update(&uid, &body.update, &body.condition)
        .await
        .map(Json)
        .map_err(FacadeError)
}

async fn scan_devices(
    State(store): Facade,
    Json(body): Json<ScanBody>,
) -> Result<Json<ScanPage>, FacadeError> {
    store
        .scan(&body.filter, body.start_key.as_deref())
        .await
        .map(Json)
        .map_err(FacadeError)
}

async fn get_ledger(
    State(store): Facade,
    Path(email): Path<String>,
) -> Result<Json<LedgerEntry>, FacadeError> {
    store
        .ledger_entry(&email)
        .map(Json)
        .ok_or(FacadeError(StoreError::NotFound(email)))
}

async fn put_ledger(
    State(store): Facade,
    Path(email): Path<String>,
    Json(body): Json<PutLedgerBody>,
) -> Result<Json<LedgerEntry>, FacadeError> {
    store
        .put_ledger(&email, &body.state, body.expected_version)
        .await
        .map(Json)
        .map_err(FacadeError)
}

impl TestDocumentStoreServer {
    pub async fn spawn(store: Arc<MemoryDeviceStore>) -> Result<Self, std::io::Error> {
        let app = Router::new()
            .route("/devices/scan", post(scan_devices))
            .route("/devices/{uid}", get(get_device).patch(update_device))
            .route("/ledger/{email}", get(get_ledger).put(put_ledger))
            .with_state(store);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { addr, handle })
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.addr)).unwrap()
    }
}

impl Drop for TestDocumentStoreServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Parks a write until the test lets it through.
#[derive(Default)]
pub struct Gate {
    reached: Notify,
    release: Notify,
}

impl Gate {
    /// Resolves once a write is parked at the gate.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Wraps a memory store and fails or holds selected writes.
pub struct FlakyStore {
    inner: Arc<MemoryDeviceStore>,
    fail_assign: Mutex<HashSet<DeviceUid>>,
    fail_unassign: Mutex<HashSet<DeviceUid>>,
    fail_scans: Mutex<bool>,
    held_assign: Mutex<HashMap<DeviceUid, Arc<Gate>>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryDeviceStore>) -> Self {
        FlakyStore {
            inner,
            fail_assign: Mutex::new(HashSet::new()),
            fail_unassign: Mutex::new(HashSet::new()),
            fail_scans: Mutex::new(false),
            held_assign: Mutex::new(HashMap::new()),
        }
    }

    /// Holds the next assignment of `device_uid` at the returned gate.
    pub fn hold_assign_of(&self, device_uid: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.held_assign
            .lock()
            .insert(device_uid.to_string(), gate.clone());
        gate
    }

    pub fn fail_assign_of(&self, device_uid: &str) {
        self.fail_assign.lock().insert(device_uid.to_string());
    }

    pub fn fail_unassign_of(&self, device_uid: &str) {
        self.fail_unassign.lock().insert(device_uid.to_string());
    }

    pub fn fail_scans(&self) {
        *self.fail_scans.lock() = true;
    }

    pub fn heal(&self) {
        self.fail_assign.lock().clear();
        self.fail_unassign.lock().clear();
        *self.fail_scans.lock() = false;
    }
}

#[async_trait]
impl DeviceStore for FlakyStore {
    async fn get(&self, device_uid: &str) -> Result<Option<DeviceRecord>, StoreError> {
        self.inner.get(device_uid).await
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
        start_key: Option<&str>,
    ) -> Result<ScanPage, StoreError> {
        if *self.fail_scans.lock() {
            return Err(StoreError::Unavailable("scan throttled".into()));
        }
        self.inner.scan(filter, start_key).await
    }

    async fn update(
        &self,
        device_uid: &str,
        update: &DeviceUpdate,
        condition: &Condition,
    ) -> Result<DeviceRecord, StoreError> {
        let failing = match update {
            DeviceUpdate::Assign { .. } => &self.fail_assign,
            DeviceUpdate::Unassign { .. } => &self.fail_unassign,
        };
        if failing.lock().contains(device_uid) {
            return Err(StoreError::Unavailable(format!("update of {device_uid} timed out")));
        }

        if let DeviceUpdate::Assign { .. } = update {
            let gate = self.held_assign.lock().remove(device_uid);
            if let Some(gate) = gate {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
        }
        self.inner.update(device_uid, update, condition).await
    }

    async fn get_ledger(&self, user_email: &str) -> Result<Option<LedgerEntry>, StoreError> {
        self.inner.get_ledger(user_email).await
    }

    async fn put_ledger(
        &self,
        user_email: &str,
        state: &LedgerState,
        expected_version: Option<u64>,
    ) -> Result<LedgerEntry, StoreError> {
        self.inner
            .put_ledger(user_email, state, expected_version)
            .await
    }
}

/// Seeds a memory store from `(device_uid, assigned_to)` pairs.
pub fn memory_store(page_size: usize, devices: &[(&str, Option<&str>)]) -> Arc<MemoryDeviceStore> {
    Arc::new(MemoryDeviceStore::with_devices(
        page_size,
        devices.iter().map(|(uid, assigned_to)| match assigned_to {
            Some(email) => DeviceRecord::assigned(*uid, *email),
            None => DeviceRecord::new(*uid),
        }),
    ))
}

/// Device uids currently assigned to `user_email`.
pub fn assigned_to(store: &MemoryDeviceStore, user_email: &str) -> Vec<DeviceUid> {
    store
        .devices()
        .into_iter()
        .filter(|d| d.assignee() == Some(user_email))
        .map(|d| d.device_uid)
        .collect()
}
