//! Error taxonomy for resource bring-up, lookup and shutdown.
//!
//! Errors scoped to a single resource are wrapped in a [`ResourceFailure`]
//! that carries the resource family and configured name.  Whole-config
//! problems surface as [`ConfigError`] and stop bring-up before any
//! connection is attempted.

use std::fmt;

use thiserror::Error;

use crate::hub::ResourceHub;

/// The three resource families managed by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Database,
    Cache,
    ObjectStorage,
}

impl ResourceKind {
    /// Stable label used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::Cache => "cache",
            ResourceKind::ObjectStorage => "object_storage",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration could not be defaulted or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A structural rule on the configuration failed.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A database entry has no driver identifier.
    #[error("database `{name}` has no driver configured")]
    EmptyDriver { name: String },

    /// A database entry has no leader DSN.
    #[error("database `{name}` has no leader dsn configured")]
    EmptyLeaderDsn { name: String },

    /// Two entries of the same family share a name.
    #[error("{kind} `{name}` is configured more than once")]
    DuplicateName { kind: ResourceKind, name: String },

    /// Pool sizing resolved to zero open connections.
    #[error("database `{name}` {role}: max_open_conns must be greater than zero")]
    ZeroOpenConns { name: String, role: &'static str },

    /// Idle pool size exceeds the open pool size.
    #[error("database `{name}` {role}: max_idle_conns ({idle}) exceeds max_open_conns ({open})")]
    IdleExceedsOpen {
        name: String,
        role: &'static str,
        idle: u32,
        open: u32,
    },

    /// Cache pool sizing is unusable.
    #[error("redis: max_active must be greater than zero")]
    ZeroCacheActive,

    /// Cache idle size exceeds the active pool size.
    #[error("redis: max_idle ({idle}) exceeds max_active ({active})")]
    CacheIdleExceedsActive { idle: u32, active: u32 },
}

impl From<garde::Report> for ConfigError {
    fn from(report: garde::Report) -> Self {
        ConfigError::Invalid(report.to_string())
    }
}

/// Which step of a resource's bring-up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Credentials,
    Settings,
    Connect,
    Leader,
    Follower,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Credentials => "loading credentials",
            Stage::Settings => "building provider settings",
            Stage::Connect => "connecting",
            Stage::Leader => "connecting leader",
            Stage::Follower => "connecting follower",
        };
        f.write_str(label)
    }
}

/// Error scoped to one resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Unknown object storage provider identifier.
    #[error("object storage provider `{0}` not found")]
    ProviderNotFound(String),

    /// Unknown database driver identifier.
    #[error("database driver `{0}` not found")]
    DriverNotFound(String),

    /// Credential load, settings build or connect failure.
    #[error("{stage} failed: {source:#}")]
    Connect {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    /// The resource did not release cleanly.
    #[error("close failed: {0:#}")]
    Close(#[source] anyhow::Error),

    /// The bring-up or close task panicked or was cancelled.
    #[error("task aborted: {0}")]
    Aborted(String),
}

impl ResourceError {
    pub fn connect(stage: Stage, source: anyhow::Error) -> Self {
        ResourceError::Connect { stage, source }
    }
}

/// A [`ResourceError`] tagged with the resource it belongs to.
#[derive(Debug, Error)]
#[error("{kind} `{name}`: {error}")]
pub struct ResourceFailure {
    pub kind: ResourceKind,
    pub name: String,
    #[source]
    pub error: ResourceError,
}

/// Requested name is not registered in the given family.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} with name `{name}` does not exist")]
pub struct LookupError {
    pub kind: ResourceKind,
    pub name: String,
}

/// Every resource that failed to close during [`ResourceHub::close_all`].
#[derive(Debug, Error)]
#[error("{} resource(s) failed to close: {}", .failures.len(), join_failures(.failures))]
pub struct CloseAllError {
    pub failures: Vec<ResourceFailure>,
}

/// Resources that came up, plus every resource that did not.
#[derive(Debug)]
pub struct PartialBringUp {
    /// Registry holding every resource that connected successfully.
    pub hub: ResourceHub,
    /// One entry per resource that failed, in configuration order.
    pub failures: Vec<ResourceFailure>,
}

/// Outcome of a bring-up that did not fully succeed.
#[derive(Debug, Error)]
pub enum BringUpError {
    /// Defaulting failed; nothing was connected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Some resources failed.  The partial hub is still usable.
    #[error("{} resource(s) failed to come up: {}", .0.failures.len(), join_failures(&.0.failures))]
    Partial(Box<PartialBringUp>),
}

impl BringUpError {
    /// Failures reported by a partial bring-up (empty for config errors).
    pub fn failures(&self) -> &[ResourceFailure] {
        match self {
            BringUpError::Config(_) => &[],
            BringUpError::Partial(partial) => &partial.failures,
        }
    }

    /// Take the partially populated hub, if any resource was attempted.
    pub fn into_partial(self) -> Option<PartialBringUp> {
        match self {
            BringUpError::Config(_) => None,
            BringUpError::Partial(partial) => Some(*partial),
        }
    }
}

fn join_failures(failures: &[ResourceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
