pub mod api;
pub mod config;
pub mod directory;
pub mod metrics_defs;
pub mod reconciler;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::api::AppState;
use crate::config::Config;
use crate::directory::{DirectoryError, build_directory};
use crate::reconciler::DeviceAssignmentReconciler;
use crate::store::{DeviceStore, ScanFilter, StoreError, build_store};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const READINESS_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum DeviceManagerError {
    #[error("invalid config: {0}")]
    Validation(#[from] config::ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Marks the service ready once the device store answers a scan.
async fn wait_for_store(store: Arc<dyn DeviceStore>, ready: Arc<AtomicBool>) {
    loop {
        match store.scan(&ScanFilter::All, None).await {
            Ok(_) => {
                ready.store(true, Ordering::Relaxed);
                tracing::info!("device store reachable, service is ready");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "device store not reachable yet");
                tokio::time::sleep(READINESS_RETRY_INTERVAL).await;
            }
        }
    }
}

pub async fn run(config: Config) -> Result<(), DeviceManagerError> {
    config.validate()?;

    let store = build_store(&config.device_store)?;
    let directory = build_directory(&config.identity_directory, &config.groups)?;
    let reconciler = Arc::new(DeviceAssignmentReconciler::new(
        store.clone(),
        config.reconciler.clone(),
    ));

    let ready = Arc::new(AtomicBool::new(false));
    tokio::spawn(wait_for_store(store, ready.clone()));

    let admin = AdminService::new("device-manager", move || ready.load(Ordering::Relaxed));
    let admin_listener = config.admin_listener.clone();
    let admin_task = tokio::spawn(async move {
        run_http_service::<_, std::io::Error>(&admin_listener.host, admin_listener.port, admin)
            .await
    });

    let state = AppState {
        reconciler,
        directory,
        groups: Arc::new(config.groups.clone()),
    };
    let api_task = tokio::spawn(api::serve(config.listener.clone(), state));

    // Either listener exiting takes the service down.
    tokio::select! {
        result = api_task => result.map_err(std::io::Error::other)??,
        result = admin_task => result.map_err(std::io::Error::other)??,
    }
    Ok(())
}
