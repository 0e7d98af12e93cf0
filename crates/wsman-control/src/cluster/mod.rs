//! Boundary to the container orchestrator.
//!
//! Everything the manager needs from the cluster goes through [`ClusterApi`]:
//! workloads and services for instances, pod status and logs for the progress
//! page, and namespace events for diagnostics.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::template::{DeploymentSpec, ServiceSpec};

pub mod kube;
pub mod memory;

pub use kube::KubeCluster;
pub use memory::MemoryCluster;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cluster API returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("cluster transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid cluster response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub replicas: u32,
    pub ready_replicas: u32,
}

impl DeploymentInfo {
    pub fn is_ready(&self) -> bool {
        self.ready_replicas > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodInfo {
    pub name: String,
    pub phase: PodPhase,
    pub ip: Option<String>,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterEvent {
    pub involved_object: String,
    pub kind: String,
    pub reason: String,
    pub message: String,
    pub timestamp: Option<String>,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Workloads whose name starts with `prefix`.
    async fn list_deployments(&self, prefix: &str) -> Result<Vec<DeploymentInfo>>;

    async fn create_deployment(&self, spec: &DeploymentSpec) -> Result<()>;

    async fn delete_deployment(&self, name: &str) -> Result<()>;

    /// Names of the services whose name starts with `prefix`.
    async fn list_services(&self, prefix: &str) -> Result<Vec<String>>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()>;

    async fn delete_service(&self, name: &str) -> Result<()>;

    /// The pod currently backing `instance`, if any.
    async fn find_pod(&self, instance: &str) -> Result<Option<PodInfo>>;

    async fn pod_logs(&self, pod: &str, tail_lines: u32) -> Result<String>;

    /// Namespace events whose involved object name contains `name_fragment`.
    async fn list_events(&self, name_fragment: &str) -> Result<Vec<ClusterEvent>>;

    /// In-cluster DNS name of the service exposing `instance`.
    fn service_host(&self, instance: &str) -> String;
}

/// Treats "already exists" as success so creates can be retried blindly.
pub fn ignore_conflict(result: Result<()>) -> Result<()> {
    match result {
        Err(ClusterError::AlreadyExists(_)) => Ok(()),
        other => other,
    }
}

/// Treats "not found" as success so deletes can be retried blindly.
pub fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(ClusterError::NotFound(_)) => Ok(()),
        other => other,
    }
}
