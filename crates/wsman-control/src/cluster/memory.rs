//! In-process cluster used for local runs and as the test double.
//!
//! With `auto_ready` (the default) every created deployment immediately gets a
//! running, ready pod whose address is the configured upstream host, so a
//! locally started backend on `127.0.0.1` can be proxied to.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ClusterApi, ClusterError, ClusterEvent, DeploymentInfo, PodInfo, PodPhase, Result};
use crate::template::{DeploymentSpec, ServiceSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateDeployment(String),
    DeleteDeployment(String),
    CreateService(String),
    DeleteService(String),
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<String, DeploymentSpec>,
    ready: BTreeSet<String>,
    services: BTreeMap<String, ServiceSpec>,
    pods: BTreeMap<String, PodInfo>,
    logs: BTreeMap<String, String>,
    events: Vec<ClusterEvent>,
    operations: Vec<Operation>,
    fail_list: bool,
    fail_create: BTreeSet<String>,
    fail_delete: BTreeSet<String>,
    fail_service: BTreeSet<String>,
}

pub struct MemoryCluster {
    state: Mutex<State>,
    auto_ready: bool,
    upstream_host: String,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            auto_ready: true,
            upstream_host: "127.0.0.1".to_string(),
        }
    }

    /// Created deployments stay at zero ready replicas until [`Self::mark_ready`].
    pub fn manual_readiness(mut self) -> Self {
        self.auto_ready = false;
        self
    }

    pub fn with_upstream_host(mut self, host: impl Into<String>) -> Self {
        self.upstream_host = host.into();
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn running_pod(&self, instance: &str) -> PodInfo {
        PodInfo {
            name: format!("{instance}-0"),
            phase: PodPhase::Running,
            ip: Some(self.upstream_host.clone()),
            ready: true,
        }
    }

    pub fn mark_ready(&self, instance: &str) {
        let pod = self.running_pod(instance);
        let mut state = self.lock();
        if state.deployments.contains_key(instance) {
            state.ready.insert(instance.to_string());
            state.pods.insert(instance.to_string(), pod);
        }
    }

    pub fn set_pod(&self, instance: &str, pod: PodInfo) {
        self.lock().pods.insert(instance.to_string(), pod);
    }

    pub fn set_logs(&self, pod: &str, text: impl Into<String>) {
        self.lock().logs.insert(pod.to_string(), text.into());
    }

    pub fn push_event(&self, event: ClusterEvent) {
        self.lock().events.push(event);
    }

    /// Makes every following `list_deployments` fail until reset.
    pub fn fail_list(&self, fail: bool) {
        self.lock().fail_list = fail;
    }

    pub fn fail_create(&self, name: &str) {
        self.lock().fail_create.insert(name.to_string());
    }

    pub fn fail_delete(&self, name: &str) {
        self.lock().fail_delete.insert(name.to_string());
    }

    /// Makes creating and deleting the service `name` fail until reset.
    pub fn fail_service(&self, name: &str) {
        self.lock().fail_service.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_list = false;
        state.fail_create.clear();
        state.fail_delete.clear();
        state.fail_service.clear();
    }

    /// Inserts a deployment as if something else had created it.
    pub fn insert_deployment(&self, spec: DeploymentSpec) {
        self.lock().deployments.insert(spec.name.clone(), spec);
    }

    pub fn deployment(&self, name: &str) -> Option<DeploymentSpec> {
        self.lock().deployments.get(name).cloned()
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.lock().deployments.keys().cloned().collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.lock().services.keys().cloned().collect()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    pub fn take_operations(&self) -> Vec<Operation> {
        std::mem::take(&mut self.lock().operations)
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn list_deployments(&self, prefix: &str) -> Result<Vec<DeploymentInfo>> {
        let state = self.lock();
        if state.fail_list {
            return Err(ClusterError::Other("injected list failure".to_string()));
        }
        Ok(state
            .deployments
            .values()
            .filter(|d| d.name.starts_with(prefix))
            .map(|d| DeploymentInfo {
                name: d.name.clone(),
                labels: d.labels.clone(),
                replicas: d.replicas,
                ready_replicas: u32::from(state.ready.contains(&d.name)),
            })
            .collect())
    }

    async fn create_deployment(&self, spec: &DeploymentSpec) -> Result<()> {
        let pod = self.running_pod(&spec.name);
        let mut state = self.lock();
        if state.fail_create.contains(&spec.name) {
            return Err(ClusterError::Other(format!("injected create failure for {}", spec.name)));
        }
        if state.deployments.contains_key(&spec.name) {
            return Err(ClusterError::AlreadyExists(spec.name.clone()));
        }
        state.operations.push(Operation::CreateDeployment(spec.name.clone()));
        state.deployments.insert(spec.name.clone(), spec.clone());
        if self.auto_ready {
            state.ready.insert(spec.name.clone());
            state.pods.insert(spec.name.clone(), pod);
        }
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_delete.contains(name) {
            return Err(ClusterError::Other(format!("injected delete failure for {name}")));
        }
        if state.deployments.remove(name).is_none() {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        state.operations.push(Operation::DeleteDeployment(name.to_string()));
        state.ready.remove(name);
        state.pods.remove(name);
        Ok(())
    }

    async fn list_services(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.lock();
        if state.fail_list {
            return Err(ClusterError::Other("injected list failure".to_string()));
        }
        Ok(state
            .services
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()> {
        let mut state = self.lock();
        if state.fail_service.contains(&spec.name) {
            return Err(ClusterError::Other(format!("injected service failure for {}", spec.name)));
        }
        if state.services.contains_key(&spec.name) {
            return Err(ClusterError::AlreadyExists(spec.name.clone()));
        }
        state.operations.push(Operation::CreateService(spec.name.clone()));
        state.services.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_service.contains(name) {
            return Err(ClusterError::Other(format!("injected service failure for {name}")));
        }
        if state.services.remove(name).is_none() {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        state.operations.push(Operation::DeleteService(name.to_string()));
        Ok(())
    }

    async fn find_pod(&self, instance: &str) -> Result<Option<PodInfo>> {
        Ok(self.lock().pods.get(instance).cloned())
    }

    async fn pod_logs(&self, pod: &str, tail_lines: u32) -> Result<String> {
        let state = self.lock();
        let Some(text) = state.logs.get(pod) else {
            return Ok(String::new());
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(tail_lines as usize);
        Ok(lines[start..].join("\n"))
    }

    async fn list_events(&self, name_fragment: &str) -> Result<Vec<ClusterEvent>> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.involved_object.contains(name_fragment))
            .cloned()
            .collect())
    }

    fn service_host(&self, _instance: &str) -> String {
        self.upstream_host.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::DeploymentTemplate;

    #[tokio::test]
    async fn create_is_not_idempotent_and_reports_conflicts() {
        let cluster = MemoryCluster::new();
        let spec = DeploymentTemplate::default().instantiate("wsinst-a-1", "id");
        cluster.create_deployment(&spec).await.unwrap();
        assert!(matches!(
            cluster.create_deployment(&spec).await,
            Err(ClusterError::AlreadyExists(_))
        ));
        let listed = cluster.list_deployments("wsinst-").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_ready());
        assert!(cluster.list_deployments("other-").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_readiness_and_failures() {
        let cluster = MemoryCluster::new().manual_readiness();
        let spec = DeploymentTemplate::default().instantiate("wsinst-a-1", "id");
        cluster.create_deployment(&spec).await.unwrap();
        assert!(!cluster.list_deployments("").await.unwrap()[0].is_ready());
        assert!(cluster.find_pod("wsinst-a-1").await.unwrap().is_none());

        cluster.mark_ready("wsinst-a-1");
        assert!(cluster.find_pod("wsinst-a-1").await.unwrap().is_some());

        cluster.fail_list(true);
        assert!(cluster.list_deployments("").await.is_err());
        cluster.clear_failures();
        assert!(matches!(
            cluster.delete_deployment("missing").await,
            Err(ClusterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn logs_are_tailed() {
        let cluster = MemoryCluster::new();
        cluster.set_logs("p", "one\ntwo\nthree");
        assert_eq!(cluster.pod_logs("p", 2).await.unwrap(), "two\nthree");
        assert_eq!(cluster.pod_logs("q", 2).await.unwrap(), "");
    }
}
