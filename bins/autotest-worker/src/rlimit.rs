//! Resource limits for tester processes.
//!
//! Limits are configured as `name -> (soft, hard)` pairs where `-1` means
//! "unbounded". Before a tester runs, each configured pair is reconciled with
//! the worker's own limits so a configuration can only tighten what the host
//! already enforces, never relax it.
//!
//! | Name | Kernel limit |
//! |------|--------------|
//! | `cpu` | `RLIMIT_CPU` (seconds) |
//! | `as` | `RLIMIT_AS` (bytes) |
//! | `data` | `RLIMIT_DATA` (bytes) |
//! | `nofile` | `RLIMIT_NOFILE` |
//! | `nproc` | `RLIMIT_NPROC` |
//! | `fsize` | `RLIMIT_FSIZE` (bytes) |
//!
//! plus the remaining Linux limits under their lowercase names.

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Configuration-side spelling of `RLIM_INFINITY`.
pub const UNBOUNDED: i64 = -1;

/// `(soft, hard)` with [`UNBOUNDED`] for "no limit".
pub type LimitPair = (i64, i64);

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown resource limit '{0}'")]
    UnknownLimit(String),
    #[error("failed to read current '{name}' limit: {source}")]
    Query {
        name: String,
        #[source]
        source: nix::Error,
    },
}

/// Reconcile a configured limit with the limit currently in force.
///
/// Each side takes the smaller value. When that minimum is the unbounded
/// sentinel the larger value is used instead, so a bounded side always wins
/// over an unbounded one. Finally the soft limit is clamped to a bounded hard
/// limit.
pub fn resolve(configured: LimitPair, current: LimitPair) -> LimitPair {
    let (config_soft, config_hard) = configured;
    let (curr_soft, curr_hard) = current;

    let mut soft = curr_soft.min(config_soft);
    let mut hard = curr_hard.min(config_hard);
    if soft < 0 {
        soft = curr_soft.max(config_soft);
    }
    if hard < 0 {
        hard = curr_hard.max(config_hard);
    }
    if hard != UNBOUNDED {
        soft = soft.min(hard);
    }

    (soft, hard)
}

pub fn resource_by_name(name: &str) -> Result<Resource, PolicyError> {
    let resource = match name.to_ascii_lowercase().as_str() {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "nofile" => Resource::RLIMIT_NOFILE,
        "stack" => Resource::RLIMIT_STACK,
        "locks" => Resource::RLIMIT_LOCKS,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "msgqueue" => Resource::RLIMIT_MSGQUEUE,
        "nice" => Resource::RLIMIT_NICE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rss" => Resource::RLIMIT_RSS,
        "rtprio" => Resource::RLIMIT_RTPRIO,
        "rttime" => Resource::RLIMIT_RTTIME,
        "sigpending" => Resource::RLIMIT_SIGPENDING,
        _ => return Err(PolicyError::UnknownLimit(name.to_string())),
    };
    Ok(resource)
}

fn to_config_value(raw: libc::rlim_t) -> i64 {
    if raw == libc::RLIM_INFINITY || raw > i64::MAX as libc::rlim_t {
        UNBOUNDED
    } else {
        raw as i64
    }
}

fn to_raw_value(value: i64) -> libc::rlim_t {
    if value < 0 {
        libc::RLIM_INFINITY
    } else {
        value as libc::rlim_t
    }
}

/// A limit ready to be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimit {
    pub resource: Resource,
    pub soft: i64,
    pub hard: i64,
}

/// The worker-wide limit configuration. Read-only after startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLimitPolicy {
    limits: BTreeMap<String, LimitPair>,
}

impl ResourceLimitPolicy {
    pub fn new(limits: BTreeMap<String, LimitPair>) -> Self {
        Self { limits }
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Resolve every configured limit against the limits of this process.
    pub fn resolve_current(&self) -> Result<Vec<ResolvedLimit>, PolicyError> {
        self.resolve_with(getrlimit)
    }

    /// Resolve every configured limit against `current`, which reports the
    /// `(soft, hard)` limit in force for a resource.
    pub fn resolve_with<F>(&self, mut current: F) -> Result<Vec<ResolvedLimit>, PolicyError>
    where
        F: FnMut(Resource) -> nix::Result<(libc::rlim_t, libc::rlim_t)>,
    {
        let mut resolved = Vec::with_capacity(self.limits.len());
        for (name, configured) in &self.limits {
            let resource = resource_by_name(name)?;
            let (curr_soft, curr_hard) = current(resource).map_err(|source| PolicyError::Query {
                name: name.clone(),
                source,
            })?;
            let (soft, hard) = resolve(
                *configured,
                (to_config_value(curr_soft), to_config_value(curr_hard)),
            );
            resolved.push(ResolvedLimit { resource, soft, hard });
        }
        Ok(resolved)
    }
}

/// Install limits on the calling process; children inherit them.
///
/// Only performs `setrlimit` calls, so it is safe to run between fork and
/// exec.
pub fn install(limits: &[ResolvedLimit]) -> nix::Result<()> {
    for limit in limits {
        setrlimit(limit.resource, to_raw_value(limit.soft), to_raw_value(limit.hard))?;
    }
    Ok(())
}
