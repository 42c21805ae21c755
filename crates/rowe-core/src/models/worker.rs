//! A registered remote executor daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Active,
    Stale,
    Deregistered,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Active => "ACTIVE",
            WorkerState::Stale => "STALE",
            WorkerState::Deregistered => "DEREGISTERED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(WorkerState::Active),
            "STALE" => Some(WorkerState::Stale),
            "DEREGISTERED" => Some(WorkerState::Deregistered),
            _ => None,
        }
    }
}

/// How the worker runs tools on its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRuntime {
    Direct,
    Container,
    ContainerAlt,
}

impl WorkerRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRuntime::Direct => "direct",
            WorkerRuntime::Container => "container",
            WorkerRuntime::ContainerAlt => "container-alt",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(WorkerRuntime::Direct),
            "container" => Some(WorkerRuntime::Container),
            "container-alt" => Some(WorkerRuntime::ContainerAlt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub runtime: WorkerRuntime,
    pub cores: i64,
    /// Memory in bytes. Zero means unreported.
    pub memory: i64,
    /// Free-form steering label; checkout matches against task hints.
    #[serde(default)]
    pub group: String,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: String, hostname: String, runtime: WorkerRuntime, cores: i64, memory: i64, group: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            hostname,
            runtime,
            cores,
            memory,
            group,
            state: WorkerState::Active,
            last_heartbeat: now,
            registered_at: now,
        }
    }
}
