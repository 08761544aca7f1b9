//! Identity directory: users and their group memberships.
use crate::config::IdentityDirectoryConfig;
use crate::types::{User, UserStatus, now_millis};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>, DirectoryError>;

    /// Looks a user up by directory id or by email.
    async fn get_user(&self, id: &str) -> Result<User, DirectoryError>;

    async fn list_groups_for_user(&self, id: &str) -> Result<Vec<String>, DirectoryError>;

    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User, DirectoryError>;

    async fn add_user_to_group(&self, id: &str, group: &str) -> Result<(), DirectoryError>;

    async fn remove_user_from_group(&self, id: &str, group: &str) -> Result<(), DirectoryError>;
}

/// In-process directory. Users are keyed by id; new users get their email
/// as id.
pub struct MemoryIdentityDirectory {
    users: RwLock<BTreeMap<String, User>>,
    groups: BTreeSet<String>,
}

impl MemoryIdentityDirectory {
    pub fn new(groups: BTreeSet<String>) -> Self {
        MemoryIdentityDirectory {
            users: RwLock::new(BTreeMap::new()),
            groups,
        }
    }

    pub fn with_users<I>(groups: BTreeSet<String>, users: I) -> Self
    where
        I: IntoIterator<Item = User>,
    {
        let directory = MemoryIdentityDirectory::new(groups);
        {
            let mut guard = directory.users.write();
            for user in users {
                guard.insert(user.id.clone(), user);
            }
        }
        directory
    }

    /// Loads a JSON array of users.
    pub fn from_seed_file(path: &Path, groups: BTreeSet<String>) -> Result<Self, DirectoryError> {
        let reader = BufReader::new(File::open(path)?);
        let users: Vec<User> = serde_json::from_reader(reader)?;
        Ok(MemoryIdentityDirectory::with_users(groups, users))
    }

    fn resolve_id(users: &BTreeMap<String, User>, id: &str) -> Option<String> {
        if users.contains_key(id) {
            return Some(id.to_string());
        }
        users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(id))
            .map(|u| u.id.clone())
    }

    fn check_group(&self, group: &str) -> Result<(), DirectoryError> {
        if self.groups.contains(group) {
            Ok(())
        } else {
            Err(DirectoryError::UnknownGroup(group.to_string()))
        }
    }

    fn with_user_mut<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut User) -> T,
    ) -> Result<T, DirectoryError> {
        let mut users = self.users.write();
        let key = Self::resolve_id(&users, id)
            .ok_or_else(|| DirectoryError::UserNotFound(id.to_string()))?;
        let user = users
            .get_mut(&key)
            .ok_or_else(|| DirectoryError::UserNotFound(id.to_string()))?;
        Ok(f(user))
    }
}

#[async_trait]
impl IdentityDirectory for MemoryIdentityDirectory {
    async fn list_users(&self) -> Result<Vec<User>, DirectoryError> {
        Ok(self.users.read().values().cloned().collect())
    }

    async fn get_user(&self, id: &str) -> Result<User, DirectoryError> {
        let users = self.users.read();
        Self::resolve_id(&users, id)
            .and_then(|key| users.get(&key).cloned())
            .ok_or_else(|| DirectoryError::UserNotFound(id.to_string()))
    }

    async fn list_groups_for_user(&self, id: &str) -> Result<Vec<String>, DirectoryError> {
        let user = self.get_user(id).await?;
        Ok(user.groups.into_iter().collect())
    }

    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User, DirectoryError> {
        let mut users = self.users.write();
        if Self::resolve_id(&users, email).is_some() {
            return Err(DirectoryError::UserExists(email.to_string()));
        }

        let user = User {
            id: email.to_string(),
            email: email.to_string(),
            name: name.filter(|n| !n.is_empty()).map(String::from),
            groups: BTreeSet::new(),
            status: UserStatus::ForceChangePassword,
            created_at: now_millis(),
        };
        users.insert(user.id.clone(), user.clone());
        tracing::info!(user = email, "created user");
        Ok(user)
    }

    async fn add_user_to_group(&self, id: &str, group: &str) -> Result<(), DirectoryError> {
        self.check_group(group)?;
        self.with_user_mut(id, |user| {
            user.groups.insert(group.to_string());
        })
    }

    async fn remove_user_from_group(&self, id: &str, group: &str) -> Result<(), DirectoryError> {
        self.check_group(group)?;
        self.with_user_mut(id, |user| {
            user.groups.remove(group);
        })
    }
}

pub fn build_directory(
    config: &IdentityDirectoryConfig,
    groups: &BTreeSet<String>,
) -> Result<Arc<dyn IdentityDirectory>, DirectoryError> {
    let directory = match &config.seed_file {
        Some(path) => MemoryIdentityDirectory::from_seed_file(path, groups.clone())?,
        None => MemoryIdentityDirectory::new(groups.clone()),
    };
    Ok(Arc::new(directory))
}
