//! Keeps "a user owns at most one device" true in the device table.
//!
//! The table only offers single-item conditional writes, so every
//! reassignment goes through the user's ledger entry:
//!
//! 1. the entry is moved to `Pending { previous, next }` with a conditional
//!    write, which fails for any concurrent reassignment of the same user;
//! 2. the devices in `previous` are unassigned and `next` is assigned;
//! 3. the entry is moved to `Committed { next }`.
//!
//! A `Pending` entry that outlives `pending_timeout` belongs to a request
//! that died mid-sequence. It is repaired according to the configured
//! `RecoveryPolicy` the next time the user is accessed. The repairer first
//! re-stamps the entry with a conditional write, so only one request repairs
//! it and everyone else sees a fresh `Pending` entry until it commits.
use crate::config::{ReconcilerConfig, RecoveryPolicy};
use crate::metrics_defs::{
    ASSIGNMENT_CONFLICT, ASSIGNMENT_RECOVERED, DEVICE_ASSIGNED, DEVICE_UNASSIGNED,
    RECONCILE_DURATION,
};
use crate::store::{
    Condition, DeviceStore, LedgerEntry, LedgerState, ScanFilter, StoreError, scan_all,
};
use crate::types::{DeviceRecord, DeviceUid, DeviceUpdate, now_millis};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("another device assignment for {0} is in progress")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No interrupted reassignment.
    Clean,
    /// A reassignment is running and has not timed out yet.
    InFlight,
    /// A timed out reassignment was settled on `device_uid`.
    Repaired { device_uid: Option<DeviceUid> },
}

#[derive(Clone, Copy, Debug)]
enum Operation {
    Assign,
    Reassign,
}

impl Operation {
    const fn as_str(&self) -> &'static str {
        match self {
            Operation::Assign => "assign",
            Operation::Reassign => "reassign",
        }
    }
}

/// A ledger entry this request moved to `Pending`.
struct PendingTxn {
    version: u64,
    previous: Vec<DeviceUid>,
}

fn device_error(err: StoreError) -> ReconcileError {
    match err {
        StoreError::NotFound(uid) => ReconcileError::DeviceNotFound(uid),
        err => ReconcileError::Store(err),
    }
}

fn ledger_error(err: StoreError, user_email: &str) -> ReconcileError {
    match err {
        StoreError::ConditionFailed(_) => ReconcileError::Conflict(user_email.to_string()),
        err => ReconcileError::Store(err),
    }
}

fn require_email(user_email: &str) -> Result<(), ReconcileError> {
    if user_email.trim().is_empty() {
        return Err(ReconcileError::InvalidInput("user email is required".into()));
    }
    Ok(())
}

fn require_device(device_uid: &str) -> Result<(), ReconcileError> {
    if device_uid.trim().is_empty() {
        return Err(ReconcileError::InvalidInput("device_uid cannot be empty".into()));
    }
    Ok(())
}

pub struct DeviceAssignmentReconciler {
    store: Arc<dyn DeviceStore>,
    config: ReconcilerConfig,
}

impl DeviceAssignmentReconciler {
    pub fn new(store: Arc<dyn DeviceStore>, config: ReconcilerConfig) -> Self {
        DeviceAssignmentReconciler { store, config }
    }

    /// Devices whose `assigned_to` is `user_email`, in store order.
    pub async fn find_devices_assigned_to(
        &self,
        user_email: &str,
    ) -> Result<Vec<DeviceUid>, ReconcileError> {
        require_email(user_email)?;
        let devices = scan_all(self.store.as_ref(), &ScanFilter::assigned_to(user_email)).await?;
        Ok(devices.into_iter().map(|d| d.device_uid).collect())
    }

    /// Removes the assignment from each device, one at a time. If a write
    /// fails the devices before it stay unassigned.
    pub async fn unassign(&self, device_uids: &[DeviceUid]) -> Result<(), ReconcileError> {
        for device_uid in device_uids {
            self.store
                .update(device_uid, &DeviceUpdate::unassign(), &Condition::Always)
                .await
                .map_err(device_error)?;
            counter!(DEVICE_UNASSIGNED).increment(1);
            tracing::info!(device_uid = %device_uid, "unassigned device");
        }
        Ok(())
    }

    /// Assigns `device_uid` to the user after releasing any other device
    /// they own.
    pub async fn assign(
        &self,
        device_uid: &str,
        user_email: &str,
        user_name: Option<&str>,
    ) -> Result<(), ReconcileError> {
        require_device(device_uid)?;
        self.guarded(Operation::Assign, user_email, user_name, Some(device_uid))
            .await
    }

    /// Releases every device the user owns, then assigns `new_device_uid`
    /// if given.
    pub async fn reassign_user_device(
        &self,
        user_email: &str,
        user_name: Option<&str>,
        new_device_uid: Option<&str>,
    ) -> Result<(), ReconcileError> {
        if let Some(device_uid) = new_device_uid {
            require_device(device_uid)?;
        }
        self.guarded(Operation::Reassign, user_email, user_name, new_device_uid)
            .await
    }

    pub async fn list_unassigned_devices(&self) -> Result<Vec<DeviceRecord>, ReconcileError> {
        Ok(scan_all(self.store.as_ref(), &ScanFilter::Unassigned).await?)
    }

    /// The user's device, after repairing a timed out reassignment.
    pub async fn current_device(
        &self,
        user_email: &str,
    ) -> Result<Option<DeviceUid>, ReconcileError> {
        match self.recover(user_email).await {
            Ok(_) => {}
            // Someone else is repairing or reassigning; report what is there now.
            Err(ReconcileError::Conflict(_)) => {}
            Err(err) => return Err(err),
        }
        let devices = self.find_devices_assigned_to(user_email).await?;
        if devices.len() > 1 {
            tracing::warn!(user = user_email, ?devices, "user owns more than one device");
        }
        Ok(devices.into_iter().next())
    }

    /// Repairs the user's interrupted reassignment, if one has timed out.
    pub async fn recover(&self, user_email: &str) -> Result<RecoveryOutcome, ReconcileError> {
        require_email(user_email)?;
        let Some(entry) = self.store.get_ledger(user_email).await? else {
            return Ok(RecoveryOutcome::Clean);
        };

        let stale = match &entry.state {
            LedgerState::Committed { .. } => return Ok(RecoveryOutcome::Clean),
            LedgerState::Pending { started_at, .. } => self.is_stale(*started_at),
        };
        if !stale {
            return Ok(RecoveryOutcome::InFlight);
        }

        let repaired = self.repair(entry).await?;
        let device_uid = match repaired.state {
            LedgerState::Committed { device_uid } => device_uid,
            LedgerState::Pending { .. } => None,
        };
        Ok(RecoveryOutcome::Repaired { device_uid })
    }

    async fn guarded(
        &self,
        op: Operation,
        user_email: &str,
        user_name: Option<&str>,
        next: Option<&str>,
    ) -> Result<(), ReconcileError> {
        require_email(user_email)?;
        let started = Instant::now();
        let mut attempt = 0;

        let result = loop {
            match self.run_once(op, user_email, user_name, next).await {
                Err(ReconcileError::Conflict(_)) if attempt < self.config.max_conflict_retries => {
                    counter!(ASSIGNMENT_CONFLICT).increment(1);
                    let delay = self
                        .config
                        .conflict_backoff()
                        .saturating_mul(2_u32.saturating_pow(attempt));
                    tracing::debug!(
                        user = user_email,
                        attempt,
                        ?delay,
                        "ledger conflict, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                result => break result,
            }
        };

        histogram!(RECONCILE_DURATION, "operation" => op.as_str())
            .record(started.elapsed().as_secs_f64());
        if let Err(err) = &result {
            tracing::error!(
                user = user_email,
                operation = op.as_str(),
                error = %err,
                "device reconciliation failed"
            );
        }
        result
    }

    async fn run_once(
        &self,
        op: Operation,
        user_email: &str,
        user_name: Option<&str>,
        next: Option<&str>,
    ) -> Result<(), ReconcileError> {
        // Reject a missing target before anything is released.
        if let Some(device_uid) = next
            && self.store.get(device_uid).await?.is_none()
        {
            return Err(ReconcileError::DeviceNotFound(device_uid.to_string()));
        }

        let txn = self.begin(user_email, user_name, next).await?;

        match op {
            Operation::Assign => {
                let release: Vec<DeviceUid> = txn
                    .previous
                    .iter()
                    .filter(|uid| Some(uid.as_str()) != next)
                    .cloned()
                    .collect();
                self.unassign_from(user_email, &release).await?;
                if let Some(device_uid) = next {
                    self.write_assignment(device_uid, user_email, user_name, &Condition::Always)
                        .await?;
                }
            }
            Operation::Reassign => {
                self.unassign_from(user_email, &txn.previous).await?;
                if let Some(device_uid) = next {
                    self.assign_unguarded(device_uid, user_email, user_name)
                        .await?;
                }
            }
        }

        self.commit(user_email, txn.version, next).await
    }

    async fn begin(
        &self,
        user_email: &str,
        user_name: Option<&str>,
        next: Option<&str>,
    ) -> Result<PendingTxn, ReconcileError> {
        let expected_version = match self.store.get_ledger(user_email).await? {
            None => None,
            Some(entry) => {
                let stale = match &entry.state {
                    LedgerState::Committed { .. } => None,
                    LedgerState::Pending { started_at, .. } => Some(self.is_stale(*started_at)),
                };
                match stale {
                    None => Some(entry.version),
                    Some(false) => return Err(ReconcileError::Conflict(user_email.to_string())),
                    Some(true) => Some(self.repair(entry).await?.version),
                }
            }
        };

        let previous = self.find_devices_assigned_to(user_email).await?;
        let state = LedgerState::Pending {
            previous: previous.clone(),
            next: next.map(String::from),
            user_name: user_name.filter(|n| !n.is_empty()).map(String::from),
            started_at: now_millis(),
        };
        let entry = self
            .store
            .put_ledger(user_email, &state, expected_version)
            .await
            .map_err(|err| ledger_error(err, user_email))?;

        Ok(PendingTxn {
            version: entry.version,
            previous,
        })
    }

    async fn commit(
        &self,
        user_email: &str,
        version: u64,
        device_uid: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let state = LedgerState::Committed {
            device_uid: device_uid.map(String::from),
        };
        self.store
            .put_ledger(user_email, &state, Some(version))
            .await
            .map_err(|err| ledger_error(err, user_email))?;
        Ok(())
    }

    /// Find, release, write. Inside a reassignment the release step finds
    /// nothing, since the caller has already cleared the user's devices.
    async fn assign_unguarded(
        &self,
        device_uid: &str,
        user_email: &str,
        user_name: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let release: Vec<DeviceUid> = self
            .find_devices_assigned_to(user_email)
            .await?
            .into_iter()
            .filter(|uid| uid != device_uid)
            .collect();
        self.unassign_from(user_email, &release).await?;
        self.write_assignment(device_uid, user_email, user_name, &Condition::Always)
            .await
    }

    /// Like `unassign`, but leaves alone devices that have since moved to
    /// another user.
    async fn unassign_from(
        &self,
        user_email: &str,
        device_uids: &[DeviceUid],
    ) -> Result<(), ReconcileError> {
        let condition = Condition::AssignedTo {
            email: user_email.to_string(),
        };
        for device_uid in device_uids {
            match self
                .store
                .update(device_uid, &DeviceUpdate::unassign(), &condition)
                .await
            {
                Ok(_) => {
                    counter!(DEVICE_UNASSIGNED).increment(1);
                    tracing::info!(
                        user = user_email,
                        device_uid = %device_uid,
                        "unassigned device"
                    );
                }
                Err(StoreError::ConditionFailed(_) | StoreError::NotFound(_)) => {
                    tracing::warn!(
                        user = user_email,
                        device_uid = %device_uid,
                        "device is no longer assigned to user, skipping"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn write_assignment(
        &self,
        device_uid: &str,
        user_email: &str,
        user_name: Option<&str>,
        condition: &Condition,
    ) -> Result<(), ReconcileError> {
        self.store
            .update(
                device_uid,
                &DeviceUpdate::assign(user_email, user_name),
                condition,
            )
            .await
            .map_err(device_error)?;
        counter!(DEVICE_ASSIGNED).increment(1);
        tracing::info!(user = user_email, device_uid, "assigned device");
        Ok(())
    }

    fn is_stale(&self, started_at: u64) -> bool {
        let age = now_millis().saturating_sub(started_at);
        u128::from(age) >= self.config.pending_timeout().as_millis()
    }

    /// Claims a stale `Pending` entry, settles it according to the recovery
    /// policy and commits the result. Losing the claim is a `Conflict`.
    async fn repair(&self, entry: LedgerEntry) -> Result<LedgerEntry, ReconcileError> {
        let LedgerState::Pending {
            previous,
            next,
            user_name,
            ..
        } = &entry.state
        else {
            return Ok(entry);
        };
        let user_email = entry.user_email.as_str();
        let policy = self.config.recovery;
        tracing::warn!(
            user = user_email,
            ?previous,
            ?next,
            policy = policy.as_str(),
            "repairing interrupted device assignment"
        );

        let claim = LedgerState::Pending {
            previous: previous.clone(),
            next: next.clone(),
            user_name: user_name.clone(),
            started_at: now_millis(),
        };
        let claimed = self
            .store
            .put_ledger(user_email, &claim, Some(entry.version))
            .await
            .map_err(|err| ledger_error(err, user_email))?;

        let keep = match policy {
            RecoveryPolicy::Complete => next.clone(),
            RecoveryPolicy::Restore => previous.first().cloned(),
            RecoveryPolicy::Leave => None,
        };

        let current = self.find_devices_assigned_to(user_email).await?;
        let release: Vec<DeviceUid> = current
            .iter()
            .filter(|uid| Some(*uid) != keep.as_ref())
            .cloned()
            .collect();
        self.unassign_from(user_email, &release).await?;

        let mut settled = keep.clone();
        if let Some(device_uid) = keep.as_deref()
            && !current.iter().any(|uid| uid == device_uid)
        {
            // A restored device may have gone to someone else in the meantime.
            let condition = match policy {
                RecoveryPolicy::Restore => Condition::Unassigned,
                _ => Condition::Always,
            };
            match self
                .write_assignment(device_uid, user_email, user_name.as_deref(), &condition)
                .await
            {
                Ok(()) => {}
                Err(
                    ReconcileError::DeviceNotFound(_)
                    | ReconcileError::Store(StoreError::ConditionFailed(_)),
                ) => {
                    tracing::warn!(
                        user = user_email,
                        device_uid,
                        "device could not be reassigned during recovery"
                    );
                    settled = None;
                }
                Err(err) => return Err(err),
            }
        }

        let state = LedgerState::Committed {
            device_uid: settled,
        };
        let committed = self
            .store
            .put_ledger(user_email, &state, Some(claimed.version))
            .await
            .map_err(|err| ledger_error(err, user_email))?;
        counter!(ASSIGNMENT_RECOVERED, "policy" => policy.as_str()).increment(1);
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDeviceStore;
    use crate::testutils::{FlakyStore, assigned_to, memory_store};

    const USER: &str = "a@x.com";

    fn reconciler(store: Arc<MemoryDeviceStore>) -> DeviceAssignmentReconciler {
        DeviceAssignmentReconciler::new(store, ReconcilerConfig::default())
    }

    fn flaky_reconciler(
        store: Arc<MemoryDeviceStore>,
        config: ReconcilerConfig,
    ) -> (Arc<FlakyStore>, DeviceAssignmentReconciler) {
        let flaky = Arc::new(FlakyStore::new(store));
        let reconciler = DeviceAssignmentReconciler::new(flaky.clone(), config);
        (flaky, reconciler)
    }

    /// No two devices share a non-empty `assigned_to`.
    fn assert_single_device_per_user(store: &MemoryDeviceStore) {
        let mut owners: Vec<String> = store
            .devices()
            .iter()
            .filter_map(|d| d.assignee().map(String::from))
            .collect();
        let total = owners.len();
        owners.sort();
        owners.dedup();
        assert_eq!(owners.len(), total, "a user owns more than one device");
    }

    #[tokio::test]
    async fn test_assign_unassigned_device() {
        let store = memory_store(100, &[("dev-1", None)]);
        let reconciler = reconciler(store.clone());

        reconciler.assign("dev-1", USER, Some("A")).await.unwrap();

        let device = store.device("dev-1").unwrap();
        assert_eq!(device.assigned_to.as_deref(), Some(USER));
        assert_eq!(device.assigned_to_name.as_deref(), Some("A"));
        assert!(device.updated_at > 0);
        assert_eq!(
            store.ledger_entry(USER).unwrap().state,
            LedgerState::Committed {
                device_uid: Some("dev-1".into())
            }
        );
    }

    #[tokio::test]
    async fn test_assign_releases_previous_device() {
        let store = memory_store(100, &[("dev-1", Some(USER)), ("dev-2", None)]);
        let reconciler = reconciler(store.clone());

        reconciler.assign("dev-2", USER, Some("A")).await.unwrap();

        let released = store.device("dev-1").unwrap();
        assert_eq!(released.assigned_to, None);
        assert_eq!(released.assigned_to_name, None);
        assert_eq!(assigned_to(&store, USER), ["dev-2"]);
        assert_single_device_per_user(&store);
    }

    #[tokio::test]
    async fn test_assign_without_name_omits_name() {
        let store = memory_store(100, &[("dev-1", None)]);
        reconciler(store.clone())
            .assign("dev-1", USER, None)
            .await
            .unwrap();
        assert_eq!(store.device("dev-1").unwrap().assigned_to_name, None);
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let store = memory_store(100, &[("dev-1", None), ("dev-2", Some("b@x.com"))]);
        let reconciler = reconciler(store.clone());

        reconciler.assign("dev-1", USER, Some("A")).await.unwrap();
        let once = store.device("dev-1").unwrap();

        reconciler.assign("dev-1", USER, Some("A")).await.unwrap();
        let twice = store.device("dev-1").unwrap();

        assert_eq!(twice.assigned_to, once.assigned_to);
        assert_eq!(twice.assigned_to_name, once.assigned_to_name);
        // Only the second call's own write touched the record.
        assert_eq!(twice.version, once.version + 1);
        assert_eq!(store.device("dev-2").unwrap().version, 0);
        assert_eq!(assigned_to(&store, USER), ["dev-1"]);
    }

    #[tokio::test]
    async fn test_reassign_moves_user_to_new_device() {
        let store = memory_store(100, &[("dev-1", Some(USER)), ("dev-2", None)]);
        let reconciler = reconciler(store.clone());

        reconciler
            .reassign_user_device(USER, Some("A"), Some("dev-2"))
            .await
            .unwrap();

        assert_eq!(store.device("dev-1").unwrap().assigned_to, None);
        assert_eq!(assigned_to(&store, USER), ["dev-2"]);
    }

    #[tokio::test]
    async fn test_reassign_to_none_clears_every_assignment() {
        // Two devices for one user should not happen, but must be cleaned up.
        let store = memory_store(
            100,
            &[("dev-1", Some(USER)), ("dev-2", Some(USER)), ("dev-3", Some("b@x.com"))],
        );
        let reconciler = reconciler(store.clone());

        reconciler
            .reassign_user_device(USER, Some("A"), None)
            .await
            .unwrap();

        assert!(assigned_to(&store, USER).is_empty());
        assert_eq!(assigned_to(&store, "b@x.com"), ["dev-3"]);
        assert_eq!(
            store.ledger_entry(USER).unwrap().state,
            LedgerState::Committed { device_uid: None }
        );
    }

    #[tokio::test]
    async fn test_assignments_found_beyond_first_page() {
        let store = memory_store(
            1,
            &[
                ("dev-1", None),
                ("dev-2", None),
                ("dev-3", None),
                ("dev-4", Some(USER)),
            ],
        );
        let reconciler = reconciler(store.clone());

        assert_eq!(
            reconciler.find_devices_assigned_to(USER).await.unwrap(),
            ["dev-4"]
        );
        reconciler.assign("dev-1", USER, None).await.unwrap();
        assert_eq!(assigned_to(&store, USER), ["dev-1"]);
    }

    #[tokio::test]
    async fn test_unassign_stops_at_first_failure() {
        let store = memory_store(
            100,
            &[("dev-1", Some(USER)), ("dev-2", Some(USER)), ("dev-3", Some(USER))],
        );
        let (flaky, reconciler) = flaky_reconciler(store.clone(), ReconcilerConfig::default());
        flaky.fail_unassign_of("dev-2");

        let result = reconciler
            .unassign(&["dev-1".into(), "dev-2".into(), "dev-3".into()])
            .await;

        assert!(matches!(
            result,
            Err(ReconcileError::Store(StoreError::Unavailable(_)))
        ));
        assert_eq!(assigned_to(&store, USER), ["dev-2", "dev-3"]);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let store = memory_store(100, &[("dev-1", Some(USER))]);
        let (flaky, reconciler) = flaky_reconciler(store, ReconcilerConfig::default());
        flaky.fail_scans();

        assert!(matches!(
            reconciler.find_devices_assigned_to(USER).await,
            Err(ReconcileError::Store(StoreError::Unavailable(_)))
        ));
        assert!(matches!(
            reconciler.list_unassigned_devices().await,
            Err(ReconcileError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let store = memory_store(100, &[("dev-1", None)]);
        let reconciler = reconciler(store.clone());

        assert!(matches!(
            reconciler.find_devices_assigned_to("").await,
            Err(ReconcileError::InvalidInput(_))
        ));
        assert!(matches!(
            reconciler.assign("", USER, None).await,
            Err(ReconcileError::InvalidInput(_))
        ));
        assert!(matches!(
            reconciler.reassign_user_device(USER, None, Some(" ")).await,
            Err(ReconcileError::InvalidInput(_))
        ));
        assert_eq!(store.device("dev-1").unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_missing_device_rejected_before_release() {
        let store = memory_store(100, &[("dev-1", Some(USER))]);
        let reconciler = reconciler(store.clone());

        let result = reconciler.assign("dev-9", USER, None).await;
        assert!(matches!(result, Err(ReconcileError::DeviceNotFound(uid)) if uid == "dev-9"));
        assert_eq!(assigned_to(&store, USER), ["dev-1"]);
        assert_eq!(store.ledger_entry(USER), None);
    }

    #[tokio::test]
    async fn test_failed_assign_write_leaves_pending_entry() {
        let store = memory_store(100, &[("dev-1", Some(USER)), ("dev-2", None)]);
        let (flaky, reconciler) = flaky_reconciler(store.clone(), ReconcilerConfig::default());
        flaky.fail_assign_of("dev-2");

        let result = reconciler.assign("dev-2", USER, Some("A")).await;
        assert!(matches!(result, Err(ReconcileError::Store(_))));

        // The old device is released and the new one never written.
        assert!(assigned_to(&store, USER).is_empty());
        match store.ledger_entry(USER).unwrap().state {
            LedgerState::Pending { previous, next, .. } => {
                assert_eq!(previous, ["dev-1"]);
                assert_eq!(next.as_deref(), Some("dev-2"));
            }
            state => panic!("unexpected ledger state {state:?}"),
        }

        // Not timed out yet, so nothing is repaired and new requests conflict.
        flaky.heal();
        assert_eq!(
            reconciler.recover(USER).await.unwrap(),
            RecoveryOutcome::InFlight
        );
        let no_retries = DeviceAssignmentReconciler::new(
            flaky.clone(),
            ReconcilerConfig {
                max_conflict_retries: 0,
                ..ReconcilerConfig::default()
            },
        );
        assert!(matches!(
            no_retries.assign("dev-2", USER, None).await,
            Err(ReconcileError::Conflict(_))
        ));
    }

    async fn interrupted(policy: RecoveryPolicy) -> (Arc<MemoryDeviceStore>, RecoveryOutcome) {
        let store = memory_store(100, &[("dev-1", Some(USER)), ("dev-2", None)]);
        let config = ReconcilerConfig {
            pending_timeout_secs: 0,
            recovery: policy,
            ..ReconcilerConfig::default()
        };
        let (flaky, reconciler) = flaky_reconciler(store.clone(), config);

        flaky.fail_assign_of("dev-2");
        assert!(reconciler.assign("dev-2", USER, Some("A")).await.is_err());
        flaky.heal();

        let outcome = reconciler.recover(USER).await.unwrap();
        (store, outcome)
    }

    #[tokio::test]
    async fn test_recovery_complete_finishes_reassignment() {
        let (store, outcome) = interrupted(RecoveryPolicy::Complete).await;
        assert_eq!(
            outcome,
            RecoveryOutcome::Repaired {
                device_uid: Some("dev-2".into())
            }
        );
        assert_eq!(assigned_to(&store, USER), ["dev-2"]);
        assert_eq!(
            store.device("dev-2").unwrap().assigned_to_name.as_deref(),
            Some("A")
        );
    }

    #[tokio::test]
    async fn test_recovery_restore_returns_previous_device() {
        let (store, outcome) = interrupted(RecoveryPolicy::Restore).await;
        assert_eq!(
            outcome,
            RecoveryOutcome::Repaired {
                device_uid: Some("dev-1".into())
            }
        );
        assert_eq!(assigned_to(&store, USER), ["dev-1"]);
    }

    #[tokio::test]
    async fn test_recovery_leave_keeps_user_unassigned() {
        let (store, outcome) = interrupted(RecoveryPolicy::Leave).await;
        assert_eq!(outcome, RecoveryOutcome::Repaired { device_uid: None });
        assert!(assigned_to(&store, USER).is_empty());
        assert_eq!(
            store.ledger_entry(USER).unwrap().state,
            LedgerState::Committed { device_uid: None }
        );
    }

    #[tokio::test]
    async fn test_restore_skips_device_taken_by_another_user() {
        let store = memory_store(100, &[("dev-1", Some(USER)), ("dev-2", None)]);
        let config = ReconcilerConfig {
            pending_timeout_secs: 0,
            recovery: RecoveryPolicy::Restore,
            ..ReconcilerConfig::default()
        };
        let (flaky, reconciler) = flaky_reconciler(store.clone(), config);

        flaky.fail_assign_of("dev-2");
        assert!(reconciler.assign("dev-2", USER, None).await.is_err());
        flaky.heal();

        reconciler.assign("dev-1", "b@x.com", None).await.unwrap();

        assert_eq!(
            reconciler.recover(USER).await.unwrap(),
            RecoveryOutcome::Repaired { device_uid: None }
        );
        assert_eq!(assigned_to(&store, "b@x.com"), ["dev-1"]);
    }

    #[tokio::test]
    async fn test_next_assign_repairs_timed_out_entry() {
        let store = memory_store(
            100,
            &[("dev-1", Some(USER)), ("dev-2", None), ("dev-3", None)],
        );
        let config = ReconcilerConfig {
            pending_timeout_secs: 0,
            recovery: RecoveryPolicy::Complete,
            ..ReconcilerConfig::default()
        };
        let (flaky, reconciler) = flaky_reconciler(store.clone(), config);

        flaky.fail_assign_of("dev-2");
        assert!(reconciler.assign("dev-2", USER, None).await.is_err());
        flaky.heal();

        reconciler.assign("dev-3", USER, None).await.unwrap();
        assert_eq!(assigned_to(&store, USER), ["dev-3"]);
        assert_single_device_per_user(&store);
    }

    #[tokio::test]
    async fn test_repair_in_progress_blocks_other_requests() {
        let store = memory_store(100, &[("dev-1", None), ("dev-2", None), ("dev-3", None)]);
        // Left behind by a request that died after releasing dev-1.
        let abandoned = LedgerState::Pending {
            previous: vec!["dev-1".into()],
            next: Some("dev-2".into()),
            user_name: None,
            started_at: 0,
        };
        store.put_ledger(USER, &abandoned, None).await.unwrap();

        let config = ReconcilerConfig {
            max_conflict_retries: 0,
            recovery: RecoveryPolicy::Complete,
            ..ReconcilerConfig::default()
        };
        let (flaky, repairer) = flaky_reconciler(store.clone(), config.clone());
        let other = DeviceAssignmentReconciler::new(flaky.clone(), config);
        let repairer = Arc::new(repairer);

        let gate = flaky.hold_assign_of("dev-2");
        let repair = {
            let repairer = repairer.clone();
            tokio::spawn(async move { repairer.current_device(USER).await })
        };
        gate.reached().await;

        // The repairer holds the entry, so nobody else touches the devices.
        assert!(matches!(
            other.assign("dev-3", USER, None).await,
            Err(ReconcileError::Conflict(_))
        ));
        assert_eq!(
            other.recover(USER).await.unwrap(),
            RecoveryOutcome::InFlight
        );
        assert!(assigned_to(&store, USER).is_empty());

        gate.release();
        assert_eq!(repair.await.unwrap().unwrap().as_deref(), Some("dev-2"));
        assert_eq!(
            store.ledger_entry(USER).unwrap().state,
            LedgerState::Committed {
                device_uid: Some("dev-2".into())
            }
        );

        other.assign("dev-3", USER, None).await.unwrap();
        assert_eq!(assigned_to(&store, USER), ["dev-3"]);
        assert_single_device_per_user(&store);
    }

    #[tokio::test]
    async fn test_repair_of_claimed_entry_is_a_conflict() {
        let store = memory_store(100, &[("dev-1", None), ("dev-2", None)]);
        let abandoned = LedgerState::Pending {
            previous: vec!["dev-1".into()],
            next: Some("dev-2".into()),
            user_name: None,
            started_at: 0,
        };
        let stale = store.put_ledger(USER, &abandoned, None).await.unwrap();
        let reconciler = reconciler(store.clone());

        reconciler.recover(USER).await.unwrap();

        // A second repairer still holding the old entry loses the claim.
        assert!(matches!(
            reconciler.repair(stale).await,
            Err(ReconcileError::Conflict(_))
        ));
        assert_eq!(assigned_to(&store, USER), ["dev-2"]);
    }

    #[tokio::test]
    async fn test_current_device() {
        let store = memory_store(100, &[("dev-1", None), ("dev-2", Some(USER))]);
        let reconciler = reconciler(store);

        assert_eq!(
            reconciler.current_device(USER).await.unwrap().as_deref(),
            Some("dev-2")
        );
        assert_eq!(reconciler.current_device("b@x.com").await.unwrap(), None);

        let unassigned = reconciler.list_unassigned_devices().await.unwrap();
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].device_uid, "dev-1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assigns_leave_exactly_one_device() {
        for _ in 0..20 {
            let store = memory_store(
                100,
                &[("dev-1", Some(USER)), ("dev-2", None), ("dev-3", None)],
            );
            let config = ReconcilerConfig {
                max_conflict_retries: 10,
                conflict_backoff_ms: 1,
                ..ReconcilerConfig::default()
            };
            let reconciler = Arc::new(DeviceAssignmentReconciler::new(store.clone(), config));

            let first = {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.assign("dev-2", USER, None).await })
            };
            let second = {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.assign("dev-3", USER, None).await })
            };

            let first = first.await.unwrap();
            let second = second.await.unwrap();
            assert!(first.is_ok() || second.is_ok());

            // Which device wins is undefined, but it is exactly one.
            let owned = assigned_to(&store, USER);
            assert_eq!(owned.len(), 1, "owned: {owned:?}");
            assert!(owned[0] == "dev-2" || owned[0] == "dev-3");
            assert_single_device_per_user(&store);
        }
    }
}
