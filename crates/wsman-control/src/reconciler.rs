//! Converges cluster workloads to the union of all assignment tables.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::Instrument;

use wsman_model::{InstanceName, InstanceOwner, WorkspaceHash, WorkspaceVersion};

use crate::cluster::{ignore_conflict, ignore_missing};
use crate::manager::Manager;
use crate::router::{DEFAULT_PORT, DIFF_PORT, GENERATOR_PORT, IDE_PORT};
use crate::template::{DeploymentSpec, OWNER_KIND_LABEL, ServiceSpec, WORKSPACE_LABEL};
use crate::tokens::TokenError;

const SERVICE_PORTS: &[(&str, u16)] = &[
    ("ide", IDE_PORT),
    ("generator", GENERATOR_PORT),
    ("diff", DIFF_PORT),
    ("http", DEFAULT_PORT),
];

/// What one instance should look like.
#[derive(Debug, Clone)]
struct Desired {
    version: WorkspaceVersion,
    owner: InstanceOwner,
    image: String,
}

/// Which of an expected instance's cluster objects are absent.
#[derive(Debug, Clone, Copy)]
struct Missing {
    deployment: bool,
    service: bool,
}

impl Missing {
    fn any(self) -> bool {
        self.deployment || self.service
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub expected: usize,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    pub evicted: Vec<String>,
    pub retired: Vec<WorkspaceHash>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !(self.created.is_empty()
            && self.deleted.is_empty()
            && self.failed.is_empty()
            && self.evicted.is_empty()
            && self.retired.is_empty())
    }
}

fn owner_kind(owner: &InstanceOwner) -> &'static str {
    match owner {
        InstanceOwner::User(_) => "user",
        InstanceOwner::Shared(_) => "shared",
        InstanceOwner::Unassigned(_) => "unassigned",
    }
}

pub struct Reconciler {
    manager: Arc<Manager>,
    interval: Duration,
    pass_lock: tokio::sync::Mutex<()>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    pub fn new(manager: Arc<Manager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            pass_lock: tokio::sync::Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!("reconciler");
        tokio::spawn(self.run().instrument(span))
    }

    /// Runs passes until shut down: on every interval tick and whenever an
    /// assignment change wakes the loop. A failing or panicking pass is logged
    /// and the loop carries on.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "reconciler started");
        loop {
            match AssertUnwindSafe(self.reconcile()).catch_unwind().await {
                Ok(Ok(report)) if report.changed() => tracing::info!(
                    expected = report.expected,
                    created = report.created.len(),
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    evicted = report.evicted.len(),
                    retired = report.retired.len(),
                    "reconcile pass finished"
                ),
                Ok(Ok(report)) => tracing::debug!(expected = report.expected, "reconcile pass: nothing to do"),
                Ok(Err(e)) => {
                    let error = format!("{e:#}");
                    tracing::warn!(%error, "reconcile pass aborted");
                }
                Err(_) => tracing::error!("reconcile pass panicked"),
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("reconciler shutting down");
                    break;
                }
                _ = self.manager.wake.wait() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One full pass. Passes never overlap.
    pub async fn reconcile(&self) -> anyhow::Result<ReconcileReport> {
        let _pass = self.pass_lock.lock().await;
        let m = &self.manager;
        let mut report = ReconcileReport::default();

        m.registry.take_dirty();
        let latest = m.catalog.latest_versions();
        m.registry.apply_default_pool(&latest);
        report.retired = m
            .registry
            .retire_superseded(&latest, |v| m.builds.status(v).is_ready());
        report.evicted = m
            .registry
            .remove_timed_out()
            .into_iter()
            .map(|n| n.0)
            .collect();
        m.registry.reconcile_owners();

        let (expected, assigned) = self.expected();
        report.expected = expected.len();

        let prefix = m.registry.instance_prefix().to_string();
        let deployments: BTreeSet<String> = m
            .bounded(m.cluster.list_deployments(&prefix))
            .await
            .map_err(|e| anyhow::anyhow!("listing deployments failed, skipping pass: {e}"))?
            .into_iter()
            .map(|d| d.name)
            .collect();
        let services: BTreeSet<String> = m
            .bounded(m.cluster.list_services(&prefix))
            .await
            .map_err(|e| anyhow::anyhow!("listing services failed, skipping pass: {e}"))?
            .into_iter()
            .collect();

        // Either object kind left behind (a half-finished delete) counts.
        let to_remove: BTreeSet<&String> = deployments
            .iter()
            .chain(services.iter())
            .filter(|name| !expected.contains_key(name.as_str()))
            .collect();
        // A deployment without its service (a half-finished create) is repaired.
        let to_create: Vec<(&String, &Desired, Missing)> = expected
            .iter()
            .filter_map(|(name, desired)| {
                let missing = Missing {
                    deployment: !deployments.contains(name),
                    service: !services.contains(name),
                };
                missing.any().then_some((name, desired, missing))
            })
            .collect();

        for name in to_remove {
            match self.delete_instance(name).await {
                Ok(()) => report.deleted.push(name.clone()),
                Err(e) => {
                    tracing::warn!(instance = %name, error = %e, "failed to delete instance");
                    report.failed.push(name.clone());
                }
            }
        }

        for (name, desired, missing) in to_create {
            match self.create_instance(name, desired, missing).await {
                Ok(()) => {
                    tracing::info!(
                        instance = %name,
                        owner = %desired.owner,
                        workspace = %desired.version.reference,
                        deployment = missing.deployment,
                        service = missing.service,
                        "instance created"
                    );
                    report.created.push(name.clone());
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    tracing::warn!(instance = %name, %error, "failed to create instance");
                    report.failed.push(name.clone());
                }
            }
        }

        m.readiness
            .retain(|n| expected.contains_key(n.as_str()));
        m.registry.idle().retain(|n| assigned.contains(n));
        // Evicted or retired instances cannot be re-enabled by anyone.
        m.disabled.retain(|n| assigned.contains(n));

        Ok(report)
    }

    /// Expected instances from one snapshot of all tables, plus every name
    /// still assigned (disabled or not yet buildable ones included).
    fn expected(&self) -> (BTreeMap<String, Desired>, BTreeSet<InstanceName>) {
        let m = &self.manager;
        let disabled = m.disabled.snapshot();
        let mut expected = BTreeMap::new();
        let mut assigned = BTreeSet::new();
        for table in m.registry.tables() {
            let snapshot = table.snapshot();
            assigned.extend(snapshot.iter().map(|(_, n)| n.clone()));

            let status = m.builds.status(table.version());
            let Some(image) = status.image() else {
                continue;
            };
            for (owner, name) in snapshot {
                if disabled.contains(&name) {
                    continue;
                }
                expected.insert(
                    name.0,
                    Desired {
                        version: table.version().clone(),
                        owner,
                        image: image.to_string(),
                    },
                );
            }
        }
        (expected, assigned)
    }

    async fn delete_instance(&self, name: &str) -> crate::cluster::Result<()> {
        let m = &self.manager;
        let deployment = ignore_missing(m.bounded(m.cluster.delete_deployment(name)).await);
        let service = ignore_missing(m.bounded(m.cluster.delete_service(name)).await);
        deployment.and(service)
    }

    fn build_specs(&self, name: &str, desired: &Desired) -> Result<(DeploymentSpec, ServiceSpec), TokenError> {
        let m = &self.manager;
        let version = &desired.version;
        let instance = InstanceName(name.to_string());
        let write = m.repository_write(version, &desired.owner);
        let token = m.tokens.mint_instance_token(name, &version.config, write)?;
        let repositories: Vec<&str> = version.config.repositories.iter().map(|r| r.id.as_str()).collect();

        let mut spec = m
            .template
            .instantiate(name, &instance.uuid().to_string())
            .with_label(WORKSPACE_LABEL, version.id().as_str())
            .with_label(OWNER_KIND_LABEL, owner_kind(&desired.owner))
            .with_image(desired.image.clone())
            .with_env("WORKSPACE_ID", version.id().as_str())
            .with_env("WORKSPACE_HASH", version.hash().as_str())
            .with_env("REPOSITORY_ID", repositories.first().copied().unwrap_or_default())
            .with_env("REPOSITORY_IDS", repositories.join(","))
            .with_env("INSTANCE_NAME", name)
            .with_env("INSTANCE_ID", instance.uuid().to_string())
            .with_env("INSTANCE_TOKEN", token)
            .with_ports(SERVICE_PORTS.iter().map(|(_, port)| *port));
        if let Some(limit) = &version.config.memory_limit {
            spec = spec.with_memory_limit(limit.clone());
        }
        let service = ServiceSpec::for_deployment(&spec, SERVICE_PORTS);
        Ok((spec, service))
    }

    async fn create_instance(&self, name: &str, desired: &Desired, missing: Missing) -> anyhow::Result<()> {
        let m = &self.manager;
        let (deployment, service) = self.build_specs(name, desired)?;
        if missing.deployment {
            ignore_conflict(m.bounded(m.cluster.create_deployment(&deployment)).await)?;
        }
        if missing.service {
            ignore_conflict(m.bounded(m.cluster.create_service(&service)).await)?;
        }
        Ok(())
    }
}
