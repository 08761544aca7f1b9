use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

pub type DeviceUid = String;

/// Milliseconds since 1970-01-01 00:00:00 UTC.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A device row in the device table. The registration subsystem owns the
/// record; only the assignment attributes are written from here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_uid: DeviceUid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_name: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub version: u64,
}

impl DeviceRecord {
    pub fn new<U: Into<DeviceUid>>(device_uid: U) -> Self {
        DeviceRecord {
            device_uid: device_uid.into(),
            serial_number: None,
            name: None,
            fleet_uid: None,
            assigned_to: None,
            assigned_to_name: None,
            updated_at: 0,
            version: 0,
        }
    }

    pub fn assigned<U, E>(device_uid: U, user_email: E) -> Self
    where
        U: Into<DeviceUid>,
        E: Into<String>,
    {
        DeviceRecord {
            assigned_to: Some(user_email.into()),
            ..DeviceRecord::new(device_uid)
        }
    }

    /// The assigned user. An empty `assigned_to` counts as unassigned.
    pub fn assignee(&self) -> Option<&str> {
        self.assigned_to.as_deref().filter(|email| !email.is_empty())
    }

    pub fn is_assigned(&self) -> bool {
        self.assignee().is_some()
    }
}

/// Mutation of the assignment attributes of a single device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceUpdate {
    Assign {
        user_email: String,
        user_name: Option<String>,
        updated_at: u64,
    },
    Unassign {
        updated_at: u64,
    },
}

impl DeviceUpdate {
    pub fn assign(user_email: &str, user_name: Option<&str>) -> Self {
        DeviceUpdate::Assign {
            user_email: user_email.to_string(),
            user_name: user_name.filter(|n| !n.is_empty()).map(String::from),
            updated_at: now_millis(),
        }
    }

    pub fn unassign() -> Self {
        DeviceUpdate::Unassign {
            updated_at: now_millis(),
        }
    }

    pub fn apply(&self, record: &mut DeviceRecord) {
        match self {
            DeviceUpdate::Assign {
                user_email,
                user_name,
                updated_at,
            } => {
                record.assigned_to = Some(user_email.clone());
                // A missing name removes any stale one rather than writing an empty value.
                record.assigned_to_name = user_name.clone();
                record.updated_at = *updated_at;
            }
            DeviceUpdate::Unassign { updated_at } => {
                record.assigned_to = None;
                record.assigned_to_name = None;
                record.updated_at = *updated_at;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    #[default]
    ForceChangePassword,
    Confirmed,
    Disabled,
}

/// A user as seen through the identity directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub created_at: u64,
}
