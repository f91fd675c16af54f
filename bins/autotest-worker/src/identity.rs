//! Pool of low-privilege OS accounts that tester processes run as.
//!
//! Accounts are provisioned ahead of time and listed in the worker config.
//! A job holds exactly one identity for its whole lifetime and no two jobs
//! ever hold the same identity at once.

use crate::config::{IdentityConfig, IdentityResources};
use anyhow::{Context, Result, bail};
use nix::unistd::{Gid, Uid, User};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    /// Workspace directory owned by this identity.
    pub root: PathBuf,
    pub resources: IdentityResources,
}

impl WorkerIdentity {
    pub fn new(name: impl Into<String>, uid: Uid, gid: Gid, root: PathBuf) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
            root,
            resources: IdentityResources::default(),
        }
    }

    /// Resolve a configured account through the system user database.
    pub fn lookup(config: &IdentityConfig, workspace: &Path) -> Result<Self> {
        let user = User::from_name(&config.user)
            .with_context(|| format!("Failed to look up user {}", config.user))?;
        let Some(user) = user else {
            bail!("user with username {} does not exist", config.user);
        };

        Ok(Self {
            name: config.user.clone(),
            uid: user.uid,
            gid: user.gid,
            root: workspace.join("workers").join(&config.user),
            resources: config.resources.clone(),
        })
    }

    /// True when this identity is the account the worker itself runs as.
    pub fn is_current_user(&self) -> bool {
        self.uid == Uid::current()
    }

    /// Prefix that makes a command run as this identity.
    pub fn command_prefix(&self) -> Vec<String> {
        if self.is_current_user() {
            Vec::new()
        } else {
            vec![
                "sudo".to_string(),
                "-Eu".to_string(),
                self.name.clone(),
                "--".to_string(),
            ]
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No worker users available to run this job")]
    Exhausted,
    #[error("identity pool is empty")]
    Empty,
}

pub struct WorkerIdentityPool {
    idle: Mutex<Vec<WorkerIdentity>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerIdentityPool {
    pub fn new(identities: Vec<WorkerIdentity>) -> Arc<Self> {
        let size = identities.len();
        Arc::new(Self {
            idle: Mutex::new(identities),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait until an identity is free.
    pub async fn acquire(self: &Arc<Self>) -> Result<IdentityLease, PoolError> {
        if self.size == 0 {
            return Err(PoolError::Empty);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Exhausted)?;
        Ok(self.lease(permit))
    }

    /// Take an identity only if one is free right now.
    pub fn try_acquire(self: &Arc<Self>) -> Result<IdentityLease, PoolError> {
        if self.size == 0 {
            return Err(PoolError::Empty);
        }
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits | TryAcquireError::Closed => PoolError::Exhausted,
            })?;
        Ok(self.lease(permit))
    }

    fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> IdentityLease {
        // A permit guarantees at least one idle identity.
        let identity = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        debug!(identity = ?identity.as_ref().map(|i| &i.name), "Identity acquired");
        IdentityLease {
            pool: Arc::clone(self),
            identity,
            _permit: permit,
        }
    }

    fn give_back(&self, identity: WorkerIdentity) {
        debug!(identity = %identity.name, "Identity released");
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(identity);
    }
}

/// Exclusive hold on one identity; returned to the pool on drop.
pub struct IdentityLease {
    pool: Arc<WorkerIdentityPool>,
    identity: Option<WorkerIdentity>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for IdentityLease {
    type Target = WorkerIdentity;

    fn deref(&self) -> &WorkerIdentity {
        self.identity
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease always holds an identity until dropped"))
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        // Runs before `_permit` is released, so the identity is idle again
        // by the time another task can acquire.
        if let Some(identity) = self.identity.take() {
            self.pool.give_back(identity);
        }
    }
}
