//! The pieces of the workspace manager shared by the reconciler and the HTTP
//! handlers.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use wsman_core::{ObservableCell, Trigger};
use wsman_model::{
    Caller, InstanceName, InstanceNameGenerator, InstanceOwner, PermissionEvaluator,
    PermissionLevel, WorkspaceVersion,
};

use crate::assignments::AssignmentRegistry;
use crate::builds::{BuildStatus, ImageBuilder, ImageBuilds};
use crate::catalog::WorkspaceCatalog;
use crate::cluster::{ClusterApi, ClusterError, PodPhase};
use crate::config::Config;
use crate::progress::{self, Progress, ProgressInput, ReadinessCache};
use crate::template::DeploymentTemplate;
use crate::tokens::TokenIssuer;

const READINESS_TTL: Duration = Duration::from_secs(2);
const PROGRESS_LOG_LINES: u32 = 200;

/// Administratively disabled instances. Any change wakes the reconciler so the
/// instance is torn down (or recreated) promptly.
pub struct DisabledInstances {
    cell: ObservableCell<BTreeSet<InstanceName>>,
}

impl DisabledInstances {
    pub fn new(wake: Arc<Trigger<()>>) -> Self {
        let cell = ObservableCell::builder(BTreeSet::new())
            .on_change(move |_, _| {
                wake.fire(());
            })
            .build();
        Self { cell }
    }

    pub fn disable(&self, name: &InstanceName) -> bool {
        self.cell.update(|set| {
            let mut next = set.clone();
            next.insert(name.clone());
            next
        })
    }

    pub fn enable(&self, name: &InstanceName) -> bool {
        self.cell.update(|set| {
            let mut next = set.clone();
            next.remove(name);
            next
        })
    }

    /// Drops every name `keep` rejects; true if any was dropped.
    pub fn retain(&self, keep: impl Fn(&InstanceName) -> bool) -> bool {
        self.cell
            .update(|set| set.iter().filter(|n| keep(n)).cloned().collect())
    }

    pub fn contains(&self, name: &InstanceName) -> bool {
        self.cell.get().contains(name)
    }

    pub fn snapshot(&self) -> Arc<BTreeSet<InstanceName>> {
        self.cell.get()
    }
}

pub struct Manager {
    pub namespace: String,
    pub cluster: Arc<dyn ClusterApi>,
    pub catalog: Arc<dyn WorkspaceCatalog>,
    pub registry: AssignmentRegistry,
    pub builds: ImageBuilds,
    pub tokens: TokenIssuer,
    pub disabled: DisabledInstances,
    pub readiness: ReadinessCache,
    pub template: DeploymentTemplate,
    pub wake: Arc<Trigger<()>>,
    pub cluster_timeout: Duration,
}

impl Manager {
    pub fn new(
        config: &Config,
        cluster: Arc<dyn ClusterApi>,
        catalog: Arc<dyn WorkspaceCatalog>,
        builder: Arc<dyn ImageBuilder>,
        template: DeploymentTemplate,
    ) -> Self {
        let wake = Arc::new(Trigger::new());
        Self {
            namespace: config.namespace.clone(),
            cluster,
            catalog,
            registry: AssignmentRegistry::new(
                InstanceNameGenerator::new(config.instance_prefix.clone()),
                config.idle_ttl,
                config.default_pool_size,
                wake.clone(),
            ),
            builds: ImageBuilds::new(builder),
            tokens: TokenIssuer::new(&config.jwt_secret, config.instance_token_ttl),
            disabled: DisabledInstances::new(wake.clone()),
            readiness: ReadinessCache::new(READINESS_TTL),
            template,
            wake,
            cluster_timeout: config.cluster_timeout,
        }
    }

    /// Runs one cluster call under the configured timeout.
    pub async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = crate::cluster::Result<T>>,
    ) -> crate::cluster::Result<T> {
        tokio::time::timeout(self.cluster_timeout, fut)
            .await
            .map_err(|_| ClusterError::Timeout(self.cluster_timeout))?
    }

    /// Whether an instance of `owner` may push to the workspace repositories.
    pub fn repository_write(&self, version: &WorkspaceVersion, owner: &InstanceOwner) -> bool {
        match owner {
            InstanceOwner::User(user_id) => {
                let caller = Caller::new(user_id.clone());
                self.catalog
                    .access(version.id())
                    .is_some_and(|access| {
                        PermissionEvaluator::new(Some(&caller)).has(&access, PermissionLevel::Write)
                    })
            }
            InstanceOwner::Shared(name) => version
                .config
                .shared_instance(name)
                .is_some_and(|s| s.allow_write),
            InstanceOwner::Unassigned(_) => false,
        }
    }

    pub async fn is_ready(&self, instance: &InstanceName) -> bool {
        if let Some(ready) = self.readiness.get(instance) {
            return ready;
        }
        let ready = match self.bounded(self.cluster.find_pod(instance.as_str())).await {
            Ok(pod) => pod.is_some_and(|p| p.ready && p.phase == PodPhase::Running),
            Err(e) => {
                tracing::debug!(instance = %instance, error = %e, "readiness probe failed");
                false
            }
        };
        self.readiness.put(instance, ready);
        ready
    }

    /// Startup progress of `instance`, gathered from the build and the cluster.
    pub async fn progress(&self, version: &WorkspaceVersion, instance: &InstanceName) -> Progress {
        let build = self.builds.status(version);
        if !matches!(build, BuildStatus::Ready(_)) {
            return progress::estimate(ProgressInput {
                build: &build,
                deployment_exists: false,
                pod_phase: None,
                logs: "",
                ready: false,
            });
        }

        let deployment_exists = self
            .bounded(self.cluster.list_deployments(instance.as_str()))
            .await
            .is_ok_and(|list| list.iter().any(|d| d.name == instance.as_str()));
        let pod = self
            .bounded(self.cluster.find_pod(instance.as_str()))
            .await
            .ok()
            .flatten();
        let logs = match &pod {
            Some(p) if p.phase == PodPhase::Running => self
                .bounded(self.cluster.pod_logs(&p.name, PROGRESS_LOG_LINES))
                .await
                .unwrap_or_default(),
            _ => String::new(),
        };
        let ready = pod
            .as_ref()
            .is_some_and(|p| p.ready && p.phase == PodPhase::Running);

        progress::estimate(ProgressInput {
            build: &build,
            deployment_exists,
            pod_phase: pod.map(|p| p.phase),
            logs: &logs,
            ready,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::builds::PrebuiltImages;
    use crate::catalog::StaticCatalog;
    use crate::cluster::MemoryCluster;

    pub const CATALOG: &str = r#"
[[workspace]]
id = "abc"
name = "Demo"
memory_limit = "4Gi"
base_image = "registry.local/abc:1"
shared_instances = [{ name = "review" }, { name = "pair", allow_write = true }]

[[workspace.repositories]]
id = "main"
url = "https://git.example/main.git"

[workspace.access.users]
alice = "write"
bob = "run_instance"
carol = "access_shared"
"#;

    pub fn config() -> Config {
        Config::from_lookup(|var| match var {
            "WSMAN_JWT_SECRET" => Some("test-secret".to_string()),
            "WSMAN_CLUSTER" => Some("memory".to_string()),
            _ => None,
        })
        .unwrap_or_else(|e| panic!("test config: {e}"))
    }

    pub fn manager_with(cluster: Arc<MemoryCluster>) -> (Arc<Manager>, Arc<StaticCatalog>) {
        let catalog = Arc::new(StaticCatalog::from_toml(CATALOG).unwrap_or_else(|e| panic!("{e}")));
        let manager = Manager::new(
            &config(),
            cluster,
            catalog.clone(),
            Arc::new(PrebuiltImages::new("registry.local/base:1")),
            DeploymentTemplate::default(),
        );
        (Arc::new(manager), catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::cluster::MemoryCluster;

    #[test]
    fn disabling_wakes_the_reconciler_once_per_change() {
        let wake = Arc::new(Trigger::new());
        let disabled = DisabledInstances::new(wake.clone());
        let name = InstanceName("wsinst-a-1".to_string());
        assert!(disabled.disable(&name));
        assert!(wake.try_take().is_some());
        assert!(!disabled.disable(&name));
        assert!(wake.try_take().is_none());
        assert!(disabled.contains(&name));
        assert!(disabled.enable(&name));
        assert!(!disabled.contains(&name));

        let other = InstanceName("wsinst-b-2".to_string());
        disabled.disable(&name);
        disabled.disable(&other);
        wake.try_take();
        assert!(disabled.retain(|n| n == &other));
        assert!(!disabled.contains(&name));
        assert!(disabled.contains(&other));
        assert!(!disabled.retain(|n| n == &other));
    }

    #[test]
    fn repository_write_follows_permissions_and_shared_config() {
        let (manager, catalog) = manager_with(Arc::new(MemoryCluster::new()));
        let version = catalog.latest_versions().remove(0);
        assert!(manager.repository_write(&version, &InstanceOwner::user("alice")));
        assert!(!manager.repository_write(&version, &InstanceOwner::user("bob")));
        assert!(manager.repository_write(&version, &InstanceOwner::shared("pair")));
        assert!(!manager.repository_write(&version, &InstanceOwner::shared("review")));
        assert!(!manager.repository_write(&version, &InstanceOwner::Unassigned(0)));
    }
}
