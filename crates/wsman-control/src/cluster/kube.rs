//! Kubernetes REST client covering the handful of calls the manager makes.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ClusterApi, ClusterError, ClusterEvent, DeploymentInfo, PodInfo, PodPhase, Result};
use crate::template::{DeploymentSpec, INSTANCE_LABEL, ServiceSpec};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

pub struct KubeCluster {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: DeploymentSpecView,
    #[serde(default)]
    status: DeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentSpecView {
    #[serde(default)]
    replicas: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    #[serde(default)]
    ready_replicas: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Service {
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Event {
    #[serde(default)]
    involved_object: InvolvedObject,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    last_timestamp: Option<String>,
    #[serde(default)]
    event_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InvolvedObject {
    #[serde(default)]
    name: String,
}

impl From<Deployment> for DeploymentInfo {
    fn from(d: Deployment) -> Self {
        Self {
            name: d.metadata.name,
            labels: d.metadata.labels,
            replicas: d.spec.replicas.unwrap_or(1),
            ready_replicas: d.status.ready_replicas.unwrap_or(0),
        }
    }
}

impl From<Pod> for PodInfo {
    fn from(p: Pod) -> Self {
        let ready = p
            .status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True");
        Self {
            name: p.metadata.name,
            phase: PodPhase::parse(p.status.phase.as_deref().unwrap_or_default()),
            ip: p.status.pod_ip,
            ready,
        }
    }
}

impl From<Event> for ClusterEvent {
    fn from(e: Event) -> Self {
        Self {
            involved_object: e.involved_object.name,
            kind: e.kind.unwrap_or_default(),
            reason: e.reason.unwrap_or_default(),
            message: e.message.unwrap_or_default(),
            timestamp: e.last_timestamp.or(e.event_time),
        }
    }
}

impl KubeCluster {
    /// Client for the API server this pod runs under, authenticated with the
    /// mounted service-account token.
    pub async fn in_cluster(namespace: impl Into<String>, timeout: Duration) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ClusterError::Other("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = tokio::fs::read_to_string(dir.join("token")).await?;
        let ca = tokio::fs::read(dir.join("ca.crt")).await?;

        let certificate = reqwest::Certificate::from_pem(&ca)?;
        let client = reqwest::Client::builder()
            .user_agent("wsman-control")
            .add_root_certificate(certificate)
            .build()?;

        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
            namespace: namespace.into(),
            timeout,
        })
    }

    /// Client for an explicit API endpoint, e.g. `kubectl proxy` on localhost.
    pub fn with_base_url(
        base_url: impl Into<String>,
        token: Option<String>,
        namespace: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("wsman-control")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            namespace: namespace.into(),
            timeout,
        })
    }

    fn url(&self, api: &str, resource: &str, name: Option<&str>) -> String {
        let mut url = format!("{}/{api}/namespaces/{}/{resource}", self.base_url, self.namespace);
        if let Some(name) = name {
            url.push('/');
            url.push_str(name);
        }
        url
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout))?
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ClusterError::NotFound(what.to_string()),
            StatusCode::CONFLICT => ClusterError::AlreadyExists(what.to_string()),
            _ => ClusterError::Http {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<T> {
        self.bounded(async {
            let bytes = self.send(builder, what).await?.bytes().await?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .await
    }

    async fn execute(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<()> {
        self.bounded(async {
            self.send(builder, what).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_deployments(&self, prefix: &str) -> Result<Vec<DeploymentInfo>> {
        let req = self.request(Method::GET, self.url("apis/apps/v1", "deployments", None));
        let list: List<Deployment> = self.get_json(req, "deployments").await?;
        Ok(list
            .items
            .into_iter()
            .filter(|d| d.metadata.name.starts_with(prefix))
            .map(DeploymentInfo::from)
            .collect())
    }

    async fn create_deployment(&self, spec: &DeploymentSpec) -> Result<()> {
        let req = self
            .request(Method::POST, self.url("apis/apps/v1", "deployments", None))
            .json(&spec.to_manifest(&self.namespace));
        self.execute(req, &spec.name).await
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let req = self
            .request(Method::DELETE, self.url("apis/apps/v1", "deployments", Some(name)))
            .json(&serde_json::json!({ "propagationPolicy": "Background" }));
        self.execute(req, name).await
    }

    async fn list_services(&self, prefix: &str) -> Result<Vec<String>> {
        let req = self.request(Method::GET, self.url("api/v1", "services", None));
        let list: List<Service> = self.get_json(req, "services").await?;
        Ok(list
            .items
            .into_iter()
            .map(|s| s.metadata.name)
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()> {
        let req = self
            .request(Method::POST, self.url("api/v1", "services", None))
            .json(&spec.to_manifest(&self.namespace));
        self.execute(req, &spec.name).await
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let req = self.request(Method::DELETE, self.url("api/v1", "services", Some(name)));
        self.execute(req, name).await
    }

    async fn find_pod(&self, instance: &str) -> Result<Option<PodInfo>> {
        let req = self
            .request(Method::GET, self.url("api/v1", "pods", None))
            .query(&[("labelSelector", format!("{INSTANCE_LABEL}={instance}"))]);
        let list: List<Pod> = self.get_json(req, "pods").await?;
        let mut pods: Vec<PodInfo> = list.items.into_iter().map(PodInfo::from).collect();
        // During a rollout the old pod may still be listed; prefer a running one.
        pods.sort_by_key(|p| (p.phase != PodPhase::Running, !p.ready));
        Ok(pods.into_iter().next())
    }

    async fn pod_logs(&self, pod: &str, tail_lines: u32) -> Result<String> {
        let req = self
            .request(Method::GET, format!("{}/log", self.url("api/v1", "pods", Some(pod))))
            .query(&[("tailLines", tail_lines.to_string())]);
        self.bounded(async { Ok(self.send(req, pod).await?.text().await?) })
            .await
    }

    async fn list_events(&self, name_fragment: &str) -> Result<Vec<ClusterEvent>> {
        let req = self.request(Method::GET, self.url("api/v1", "events", None));
        let list: List<Event> = self.get_json(req, "events").await?;
        Ok(list
            .items
            .into_iter()
            .map(ClusterEvent::from)
            .filter(|e| e.involved_object.contains(name_fragment))
            .collect())
    }

    fn service_host(&self, instance: &str) -> String {
        format!("{instance}.{}.svc.cluster.local", self.namespace)
    }
}
