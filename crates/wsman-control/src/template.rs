//! Typed deployment template.
//!
//! Instances are stamped out of a single YAML template. Only the fields the
//! manager actually changes per instance are modelled: name, labels, selector,
//! replica count, image, container env and resource limits.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const INSTANCE_LABEL: &str = "wsman.io/instance";
pub const INSTANCE_ID_LABEL: &str = "wsman.io/instance-id";
pub const WORKSPACE_LABEL: &str = "wsman.io/workspace";
pub const OWNER_KIND_LABEL: &str = "wsman.io/owner-kind";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "wsman";

const CONTAINER_NAME: &str = "workspace";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid template: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTemplate {
    /// Used when the build backend does not report an image.
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub container_ports: Vec<u16>,
}

impl Default for DeploymentTemplate {
    fn default() -> Self {
        Self {
            image: "modelix/workspace-instance:latest".to_string(),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: BTreeMap::new(),
            resources: ResourceSpec {
                cpu_request: Some("100m".to_string()),
                cpu_limit: None,
                memory_request: Some("1Gi".to_string()),
                memory_limit: Some("2Gi".to_string()),
            },
            labels: BTreeMap::new(),
            container_ports: Vec::new(),
        }
    }
}

impl DeploymentTemplate {
    pub fn from_yaml(raw: &str) -> Result<Self, TemplateError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub async fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml(&raw)
    }

    /// A fresh deployment spec for `name`, with name, selector and base labels
    /// stamped in.
    pub fn instantiate(&self, name: &str, instance_id: &str) -> DeploymentSpec {
        let mut labels = self.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        labels.insert(INSTANCE_LABEL.to_string(), name.to_string());
        labels.insert(INSTANCE_ID_LABEL.to_string(), instance_id.to_string());

        let mut selector = BTreeMap::new();
        selector.insert(INSTANCE_LABEL.to_string(), name.to_string());

        DeploymentSpec {
            name: name.to_string(),
            labels,
            selector,
            replicas: 1,
            image: self.image.clone(),
            image_pull_policy: self.image_pull_policy.clone(),
            env: self.env.clone(),
            resources: self.resources.clone(),
            container_ports: self.container_ports.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub replicas: u32,
    pub image: String,
    pub image_pull_policy: Option<String>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub container_ports: Vec<u16>,
}

impl DeploymentSpec {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        let limit = limit.into();
        // A request above the limit is rejected by the API server.
        if self.resources.memory_request.is_some() {
            self.resources.memory_request = Some(limit.clone());
        }
        self.resources.memory_limit = Some(limit);
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        for port in ports {
            if !self.container_ports.contains(&port) {
                self.container_ports.push(port);
            }
        }
        self
    }

    fn resources_manifest(&self) -> Value {
        let mut requests = serde_json::Map::new();
        let mut limits = serde_json::Map::new();
        if let Some(v) = &self.resources.cpu_request {
            requests.insert("cpu".to_string(), json!(v));
        }
        if let Some(v) = &self.resources.memory_request {
            requests.insert("memory".to_string(), json!(v));
        }
        if let Some(v) = &self.resources.cpu_limit {
            limits.insert("cpu".to_string(), json!(v));
        }
        if let Some(v) = &self.resources.memory_limit {
            limits.insert("memory".to_string(), json!(v));
        }
        json!({ "requests": requests, "limits": limits })
    }

    /// `apps/v1` Deployment manifest.
    pub fn to_manifest(&self, namespace: &str) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let ports: Vec<Value> = self
            .container_ports
            .iter()
            .map(|p| json!({ "containerPort": p }))
            .collect();

        let mut container = json!({
            "name": CONTAINER_NAME,
            "image": self.image,
            "env": env,
            "ports": ports,
            "resources": self.resources_manifest(),
        });
        if let Some(policy) = &self.image_pull_policy {
            container["imagePullPolicy"] = json!(policy);
        }

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels,
            },
            "spec": {
                "replicas": self.replicas,
                "selector": { "matchLabels": self.selector },
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": { "containers": [container] },
                },
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

impl ServiceSpec {
    pub fn for_deployment(deployment: &DeploymentSpec, ports: &[(&str, u16)]) -> Self {
        Self {
            name: deployment.name.clone(),
            labels: deployment.labels.clone(),
            selector: deployment.selector.clone(),
            ports: ports
                .iter()
                .map(|(name, port)| ServicePort {
                    name: (*name).to_string(),
                    port: *port,
                })
                .collect(),
        }
    }

    pub fn to_manifest(&self, namespace: &str) -> Value {
        let ports: Vec<Value> = self
            .ports
            .iter()
            .map(|p| json!({ "name": p.name, "port": p.port, "targetPort": p.port }))
            .collect();
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels,
            },
            "spec": {
                "type": "ClusterIP",
                "selector": self.selector,
                "ports": ports,
            },
        })
    }
}
