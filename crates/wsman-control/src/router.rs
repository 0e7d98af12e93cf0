//! Maps inbound paths to instances.
//!
//! Two path shapes are understood:
//!
//! * `/workspace-<id>-<hash>/<owner>/<rest>` where `<owner>` is `own` (the
//!   caller's personal instance) or the name of a shared instance, and
//! * `/<instance-uuid>/port/<n>/<rest>` addressing an instance directly.
//!
//! `<rest>` may start with `ide`, `generator`, `diff` or `port/<n>` to pick the
//! backend port; anything else goes to the default port. Every failure to
//! parse, authorize or resolve is reported as "no route".

use serde::Serialize;

use wsman_model::{
    Caller, InstanceName, InstanceOwner, PermissionEvaluator, PermissionLevel, WorkspaceRef,
    WorkspaceVersion,
};

use crate::manager::Manager;

pub const IDE_PORT: u16 = 5800;
pub const GENERATOR_PORT: u16 = 33335;
pub const DIFF_PORT: u16 = 33334;
pub const DEFAULT_PORT: u16 = 33333;

const OWN: &str = "own";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OwnerSelector {
    Own,
    Shared(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InstanceSelector {
    Workspace {
        workspace: WorkspaceRef,
        owner: OwnerSelector,
    },
    InstanceId(uuid::Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortSelector {
    Ide,
    Generator,
    Diff,
    Explicit(u16),
    Default,
}

impl PortSelector {
    pub fn number(self) -> u16 {
        match self {
            Self::Ide => IDE_PORT,
            Self::Generator => GENERATOR_PORT,
            Self::Diff => DIFF_PORT,
            Self::Explicit(port) => port,
            Self::Default => DEFAULT_PORT,
        }
    }

    /// Well-known ports are exposed by the instance service.
    pub fn via_service(self) -> bool {
        !matches!(self, Self::Explicit(_))
    }
}

/// Parsed view of an inbound path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectedRequest {
    pub selector: InstanceSelector,
    pub port: PortSelector,
    /// Path to request on the instance, query string included.
    pub path: String,
}

fn split_segment(path: &str) -> (&str, Option<&str>) {
    match path.split_once('/') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn sub_path(rest: Option<&str>) -> String {
    match rest {
        Some(rest) => format!("/{rest}"),
        None => "/".to_string(),
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    if raw.is_empty() || raw.len() > 5 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u32>().ok().and_then(|n| u16::try_from(n).ok())
}

/// `port/<n>/<rest>`
fn parse_explicit_port(rest: Option<&str>) -> Option<(u16, String)> {
    let (port, rest) = split_segment(rest?);
    Some((parse_port(port)?, sub_path(rest)))
}

fn parse_target(rest: Option<&str>) -> Option<(PortSelector, String)> {
    let Some(rest) = rest else {
        return Some((PortSelector::Default, "/".to_string()));
    };
    let (head, tail) = split_segment(rest);
    Some(match head {
        "ide" => (PortSelector::Ide, sub_path(tail)),
        "generator" => (PortSelector::Generator, sub_path(tail)),
        "diff" => (PortSelector::Diff, sub_path(tail)),
        "port" => {
            let (port, path) = parse_explicit_port(tail)?;
            (PortSelector::Explicit(port), path)
        }
        _ => (PortSelector::Default, format!("/{rest}")),
    })
}

pub fn parse(path: &str, query: Option<&str>) -> Option<RedirectedRequest> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let (first, rest) = split_segment(path);

    let (selector, port, mut sub) = if let Some(workspace) = WorkspaceRef::parse(first) {
        let (owner, rest) = split_segment(rest?);
        let owner = match owner {
            "" => return None,
            OWN => OwnerSelector::Own,
            name => OwnerSelector::Shared(name.to_string()),
        };
        let (port, sub) = parse_target(rest)?;
        (InstanceSelector::Workspace { workspace, owner }, port, sub)
    } else {
        let id = uuid::Uuid::parse_str(first).ok()?;
        let (keyword, rest) = split_segment(rest?);
        if keyword != "port" {
            return None;
        }
        let (port, sub) = parse_explicit_port(rest)?;
        (InstanceSelector::InstanceId(id), PortSelector::Explicit(port), sub)
    };

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        sub.push('?');
        sub.push_str(query);
    }
    Some(RedirectedRequest {
        selector,
        port,
        path: sub,
    })
}

/// A request that passed authorization and has an instance behind it.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub instance: InstanceName,
    pub owner: InstanceOwner,
    pub version: WorkspaceVersion,
    pub port: PortSelector,
    pub path: String,
}

/// Authorizes `request` for `caller` and finds (or creates) its instance.
pub fn resolve(manager: &Manager, request: &RedirectedRequest, caller: Option<&Caller>) -> Option<ResolvedRoute> {
    let evaluator = PermissionEvaluator::new(caller);
    let (instance, owner, version) = match &request.selector {
        InstanceSelector::Workspace { workspace, owner } => {
            let mut version = manager.catalog.version(&workspace.hash)?;
            if version.id() != &workspace.id {
                return None;
            }
            // Links to a superseded version land on its successor.
            if manager.registry.is_retired(version.hash()) {
                version = manager.catalog.latest_version(version.id())?;
            }
            let access = manager.catalog.access(version.id()).unwrap_or_default();
            match owner {
                OwnerSelector::Own => {
                    let caller = caller?;
                    if !evaluator.has(&access, PermissionLevel::RunInstance) {
                        return None;
                    }
                    let table = manager.registry.get_or_create(&version);
                    let instance = table.get_or_create_for_user(&caller.user_id);
                    (instance, InstanceOwner::user(caller.user_id.clone()), version)
                }
                OwnerSelector::Shared(name) => {
                    if !evaluator.has(&access, PermissionLevel::AccessShared) {
                        return None;
                    }
                    version.config.shared_instance(name)?;
                    let instance = manager.registry.get_or_create(&version).shared_instance(name)?;
                    (instance, InstanceOwner::shared(name.clone()), version)
                }
            }
        }
        InstanceSelector::InstanceId(id) => {
            let (table, owner, instance) = manager.registry.find_by_uuid(*id)?;
            let version = table.version().clone();
            let access = manager.catalog.access(version.id()).unwrap_or_default();
            let allowed = match &owner {
                InstanceOwner::User(user_id) => caller
                    .is_some_and(|c| c.is_admin() || (&c.user_id == user_id && evaluator.has(&access, PermissionLevel::RunInstance))),
                InstanceOwner::Shared(_) => evaluator.has(&access, PermissionLevel::AccessShared),
                InstanceOwner::Unassigned(_) => caller.is_some_and(Caller::is_admin),
            };
            if !allowed {
                return None;
            }
            if owner.is_idle_evictable() {
                manager.registry.idle().touch(&instance);
            }
            (instance, owner, version)
        }
    };

    if manager.disabled.contains(&instance) {
        return None;
    }
    Some(ResolvedRoute {
        instance,
        owner,
        version,
        port: request.port,
        path: request.path.clone(),
    })
}

/// Host and port the instance answers on for `route`: the service for
/// well-known ports, the pod itself for explicit ones.
pub async fn upstream_authority(manager: &Manager, route: &ResolvedRoute) -> Option<String> {
    let port = route.port.number();
    if route.port.via_service() {
        return Some(format!("{}:{port}", manager.cluster.service_host(route.instance.as_str())));
    }
    let pod = manager
        .bounded(manager.cluster.find_pod(route.instance.as_str()))
        .await
        .ok()??;
    let ip = pod.ip?;
    Some(format!("{ip}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::WorkspaceCatalog;
    use crate::cluster::{MemoryCluster, PodInfo, PodPhase};
    use crate::manager::test_support::manager_with;
    use std::sync::Arc;

    #[test]
    fn parses_workspace_owner_and_ide_port() {
        let r = parse("/workspace-abc-1234*5678/own/ide/foo", None).unwrap();
        let InstanceSelector::Workspace { workspace, owner } = &r.selector else {
            panic!("unexpected selector {r:?}");
        };
        assert_eq!(workspace.id.as_str(), "abc");
        assert_eq!(workspace.hash.as_str(), "1234*5678");
        assert_eq!(owner, &OwnerSelector::Own);
        assert_eq!(r.port, PortSelector::Ide);
        assert_eq!(r.port.number(), IDE_PORT);
        assert_eq!(r.path, "/foo");
    }

    #[test]
    fn explicit_ports_are_range_checked() {
        assert!(parse("/workspace-abc-h/own/port/65536/", None).is_none());
        assert!(parse("/workspace-abc-h/own/port/abc/", None).is_none());
        assert!(parse("/workspace-abc-h/own/port/", None).is_none());

        let r = parse("/workspace-abc-h/own/port/65535/x", None).unwrap();
        assert_eq!(r.port, PortSelector::Explicit(65535));
        assert_eq!(r.path, "/x");

        let r = parse("/workspace-abc-h/review/port/8080", None).unwrap();
        assert_eq!(r.path, "/");
    }

    #[test]
    fn other_paths_go_to_the_default_port_with_query() {
        let r = parse("/workspace-abc-h/review/api/v1/items", Some("a=1&b=2")).unwrap();
        assert_eq!(r.port, PortSelector::Default);
        assert_eq!(r.path, "/api/v1/items?a=1&b=2");
        assert!(matches!(&r.selector, InstanceSelector::Workspace { owner: OwnerSelector::Shared(n), .. } if n == "review"));

        let r = parse("/workspace-abc-h/own", None).unwrap();
        assert_eq!(r.path, "/");
        let r = parse("/workspace-abc-h/own/generator", Some("")).unwrap();
        assert_eq!((r.port, r.path.as_str()), (PortSelector::Generator, "/"));
    }

    #[test]
    fn instance_id_mode_requires_a_port() {
        let id = uuid::Uuid::new_v4();
        let r = parse(&format!("/{id}/port/5800/index.html"), None).unwrap();
        assert_eq!(r.selector, InstanceSelector::InstanceId(id));
        assert_eq!(r.port, PortSelector::Explicit(5800));
        assert_eq!(r.path, "/index.html");
        assert!(parse(&format!("/{id}/ide/"), None).is_none());
    }

    #[test]
    fn malformed_paths_have_no_route() {
        for path in ["/", "/favicon.ico", "/workspace-abc", "/workspace-abc-h", "/workspace-abc-h//ide", "/workspace-a_b-h/own"] {
            assert!(parse(path, None).is_none(), "{path}");
        }
    }

    fn route(version: &WorkspaceVersion, owner: &str, rest: &str) -> RedirectedRequest {
        parse(&format!("/{}/{owner}/{rest}", version.reference), None).unwrap()
    }

    #[test]
    fn own_requires_run_permission() {
        let (manager, catalog) = manager_with(Arc::new(MemoryCluster::new()));
        let version = catalog.latest_versions().remove(0);
        let request = route(&version, "own", "ide/");

        let bob = Caller::new("bob");
        let first = resolve(&manager, &request, Some(&bob)).unwrap();
        let second = resolve(&manager, &request, Some(&bob)).unwrap();
        assert_eq!(first.instance, second.instance);
        assert_eq!(first.owner, InstanceOwner::user("bob"));

        assert!(resolve(&manager, &request, Some(&Caller::new("carol"))).is_none());
        assert!(resolve(&manager, &request, None).is_none());
    }

    #[test]
    fn shared_requires_access_and_existence() {
        let (manager, catalog) = manager_with(Arc::new(MemoryCluster::new()));
        let version = catalog.latest_versions().remove(0);
        let carol = Caller::new("carol");

        let shared = resolve(&manager, &route(&version, "review", ""), Some(&carol)).unwrap();
        assert_eq!(shared.owner, InstanceOwner::shared("review"));
        assert!(resolve(&manager, &route(&version, "nope", ""), Some(&carol)).is_none());
        assert!(resolve(&manager, &route(&version, "review", ""), Some(&Caller::new("dave"))).is_none());

        manager.disabled.disable(&shared.instance);
        assert!(resolve(&manager, &route(&version, "review", ""), Some(&carol)).is_none());
    }

    #[test]
    fn unknown_versions_and_mismatched_ids_are_rejected() {
        let (manager, catalog) = manager_with(Arc::new(MemoryCluster::new()));
        let version = catalog.latest_versions().remove(0);
        let alice = Caller::new("alice");
        let wrong_id = parse(&format!("/workspace-xyz-{}/own/", version.hash()), None).unwrap();
        assert!(resolve(&manager, &wrong_id, Some(&alice)).is_none());
        let unknown = parse("/workspace-abc-unknownhash/own/", None).unwrap();
        assert!(resolve(&manager, &unknown, Some(&alice)).is_none());
    }

    #[test]
    fn retired_versions_route_to_their_successor() {
        let (manager, catalog) = manager_with(Arc::new(MemoryCluster::new()));
        let old = catalog.latest_versions().remove(0);
        manager.registry.get_or_create(&old);

        let mut config = old.config.clone();
        config.memory_limit = Some("8Gi".to_string());
        let access = catalog.access(old.id()).unwrap_or_default();
        let new = catalog.publish(config, access);
        let retired = manager.registry.retire_superseded(std::slice::from_ref(&new), |_| true);
        assert_eq!(retired, vec![old.hash().clone()]);

        let alice = Caller::new("alice");
        let routed = resolve(&manager, &route(&old, "own", "ide/"), Some(&alice)).unwrap();
        assert_eq!(routed.version.hash(), new.hash());
        assert!(manager.registry.get(old.hash()).is_none());
        let table = manager.registry.get(new.hash()).unwrap();
        assert_eq!(table.instance_of(&InstanceOwner::user("alice")), Some(routed.instance));

        let shared = resolve(&manager, &route(&old, "review", ""), Some(&alice)).unwrap();
        assert_eq!(shared.version.hash(), new.hash());
        assert!(manager.registry.get(old.hash()).is_none());
    }

    #[tokio::test]
    async fn instance_ids_resolve_for_their_owner_only() {
        let cluster = Arc::new(MemoryCluster::new());
        let (manager, catalog) = manager_with(cluster.clone());
        let version = catalog.latest_versions().remove(0);
        let alice = Caller::new("alice");
        let own = resolve(&manager, &route(&version, "own", ""), Some(&alice)).unwrap();

        let direct = parse(&format!("/{}/port/8080/x", own.instance.uuid()), None).unwrap();
        let resolved = resolve(&manager, &direct, Some(&alice)).unwrap();
        assert_eq!(resolved.instance, own.instance);
        assert!(resolve(&manager, &direct, Some(&Caller::new("bob"))).is_none());
        assert!(resolve(&manager, &direct, Some(&Caller::new("root").with_role("admin"))).is_some());

        assert!(upstream_authority(&manager, &resolved).await.is_none());
        cluster.set_pod(
            own.instance.as_str(),
            PodInfo {
                name: "p".to_string(),
                phase: PodPhase::Running,
                ip: Some("10.0.0.7".to_string()),
                ready: true,
            },
        );
        assert_eq!(upstream_authority(&manager, &resolved).await.as_deref(), Some("10.0.0.7:8080"));
        assert_eq!(
            upstream_authority(&manager, &own).await.as_deref(),
            Some("127.0.0.1:33333")
        );
    }
}
